//! Payment batches, the gateway collaborator and the orchestrator that pays them.

pub mod batch;
pub mod gateway;
pub mod orchestrator;

pub use batch::{
    BatchItem, BatchStatus, BatchType, ItemOutcome, ItemStatus, PaymentBatch, Recipient, Recorded,
};
pub use gateway::{ChargeRequest, GatewayError, MockPaymentGateway, PaymentGateway, PaymentReceipt};
pub use orchestrator::{BatchOrchestrator, BatchReport, OrchestratorConfig, PaymentBatchStore};
