use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedPayment {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub validated_by: Uuid,
}

/// Secondary bookkeeping sync run after a payment is validated and audited.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn record_validated_payment(&self, payment: ValidatedPayment) -> ServiceResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopPaymentLedger;

#[async_trait]
impl PaymentLedger for NoopPaymentLedger {
    async fn record_validated_payment(&self, payment: ValidatedPayment) -> ServiceResult<()> {
        tracing::debug!(order_id = %payment.order_id, "payment ledger sync skipped");
        Ok(())
    }
}
