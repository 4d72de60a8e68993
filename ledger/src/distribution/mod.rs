//! Revenue Distribution Engine.

pub mod consumer;
pub mod engine;
pub mod service;

pub use consumer::RevenueEventHandler;
pub use engine::{
    Distribution, DistributionMode, DistributionRequest, DistributionStatus, FeeSchedule,
    ShareholderPayout, calculate,
};
pub use service::{DistributionOutcome, DistributionStore, PreparedDistribution, RevenueDistributor};
