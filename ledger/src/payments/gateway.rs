//! Payment gateway collaborator.
//!
//! The ledger never talks to a processor directly; it calls
//! [`PaymentGateway::charge`] with an idempotency key so a repeated call for the
//! same batch item cannot pay twice.

use crate::payments::batch::Recipient;
use crate::types::{Currency, Money, PaymentId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Gateway failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The processor refused the payment.
    #[error("Payment declined: {0}")]
    Declined(String),

    /// The recipient cannot receive payments (no payout account, closed account).
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// No answer in time; the payment may or may not have gone through.
    #[error("Gateway timeout")]
    Timeout,

    /// The processor is unreachable.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether the same charge may succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// One charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeRequest {
    /// `batch_id:payment_id`; the processor deduplicates on it.
    pub idempotency_key: String,
    /// Payment.
    pub payment_id: PaymentId,
    /// Payee.
    pub recipient: Recipient,
    /// Amount.
    pub amount: Money,
    /// Currency.
    pub currency: Currency,
}

/// Successful charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Processor reference.
    pub transaction_id: String,
    /// Amount moved.
    pub amount: Money,
    /// When the processor accepted it.
    pub processed_at: DateTime<Utc>,
}

/// Payment processor abstraction.
pub trait PaymentGateway: Send + Sync {
    /// Pay `request.amount` to `request.recipient`.
    ///
    /// # Errors
    ///
    /// [`GatewayError`] when the payment did not go through.
    fn charge<'a>(
        &'a self,
        request: &'a ChargeRequest,
    ) -> BoxFuture<'a, Result<PaymentReceipt, GatewayError>>;
}

#[derive(Default)]
struct MockState {
    receipts: HashMap<String, PaymentReceipt>,
    declined: HashSet<Recipient>,
    unavailable: bool,
    calls: Vec<ChargeRequest>,
}

/// In-process gateway for development and tests.
///
/// Pays everyone except recipients marked as declined. Repeating an
/// idempotency key returns the original receipt.
#[derive(Clone, Default)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockPaymentGateway {
    /// Gateway that pays everyone.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared trait object.
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Decline every charge to `recipient`.
    pub fn decline(&self, recipient: Recipient) {
        if let Ok(mut state) = self.state.lock() {
            state.declined.insert(recipient);
        }
    }

    /// Accept charges to `recipient` again.
    pub fn accept(&self, recipient: &Recipient) {
        if let Ok(mut state) = self.state.lock() {
            state.declined.remove(recipient);
        }
    }

    /// Fail every charge with [`GatewayError::Unavailable`] until called with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Every charge request received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ChargeRequest> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    /// Distinct payments actually made.
    #[must_use]
    pub fn payments_made(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.receipts.len())
            .unwrap_or_default()
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn charge<'a>(
        &'a self,
        request: &'a ChargeRequest,
    ) -> BoxFuture<'a, Result<PaymentReceipt, GatewayError>> {
        Box::pin(async move {
            let mut state = self
                .state
                .lock()
                .map_err(|_| GatewayError::Unavailable("mock gateway state poisoned".into()))?;
            state.calls.push(request.clone());

            if state.unavailable {
                return Err(GatewayError::Unavailable("mock gateway offline".into()));
            }
            if let Some(receipt) = state.receipts.get(&request.idempotency_key) {
                return Ok(receipt.clone());
            }
            if state.declined.contains(&request.recipient) {
                tracing::info!(
                    payment_id = %request.payment_id,
                    recipient = %request.recipient,
                    "Mock payment declined"
                );
                return Err(GatewayError::Declined(format!(
                    "recipient {} has no payout account",
                    request.recipient
                )));
            }

            let receipt = PaymentReceipt {
                transaction_id: format!("mock_txn_{}", uuid::Uuid::new_v4()),
                amount: request.amount,
                processed_at: Utc::now(),
            };
            state
                .receipts
                .insert(request.idempotency_key.clone(), receipt.clone());
            tracing::info!(
                payment_id = %request.payment_id,
                amount = request.amount.cents(),
                currency = %request.currency,
                transaction_id = %receipt.transaction_id,
                "Mock payment processed"
            );
            Ok(receipt)
        })
    }
}
