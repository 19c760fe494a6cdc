use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::remittance_type::DeliveryMethod;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "remittances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub remittance_number: String,
    #[sea_orm(indexed)]
    pub user_id: Uuid,
    pub remittance_type_id: Uuid,
    pub status: RemittanceStatus,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount_sent: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 6)))")]
    pub exchange_rate: Decimal,
    pub rate_source: RateSource,
    #[sea_orm(column_type = "Decimal(Some((9, 4)))")]
    pub commission_percentage: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub commission_fixed: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub commission_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub offer_discount: Decimal,
    #[sea_orm(nullable)]
    pub offer_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount_to_deliver: Decimal,
    pub currency_sent: String,
    pub currency_delivered: String,
    pub delivery_method: DeliveryMethod,
    pub recipient_name: String,
    pub recipient_phone: String,
    #[sea_orm(nullable)]
    pub recipient_email: Option<String>,
    #[sea_orm(nullable)]
    pub recipient_address: Option<String>,
    #[sea_orm(nullable)]
    pub recipient_city: Option<String>,
    #[sea_orm(nullable)]
    pub recipient_id_number: Option<String>,
    #[sea_orm(nullable)]
    pub recipient_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub bank_account_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub collection_account_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub payment_reference: Option<String>,
    #[sea_orm(nullable)]
    pub payment_proof_url: Option<String>,
    #[sea_orm(nullable)]
    pub payment_proof_uploaded_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub rejection_reason: Option<String>,
    #[sea_orm(nullable)]
    pub delivery_proof_url: Option<String>,
    #[sea_orm(nullable)]
    pub delivery_notes: Option<String>,
    #[sea_orm(nullable)]
    pub cancellation_reason: Option<String>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    #[sea_orm(nullable)]
    pub validated_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub validated_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::remittance_type::Entity",
        from = "Column::RemittanceTypeId",
        to = "super::remittance_type::Column::Id"
    )]
    RemittanceType,
    #[sea_orm(has_many = "super::bank_transfer::Entity")]
    BankTransfer,
    #[sea_orm(has_many = "super::remittance_status_history::Entity")]
    StatusHistory,
}

impl Related<super::remittance_type::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RemittanceType.def()
    }
}

impl Related<super::bank_transfer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BankTransfer.def()
    }
}

impl Related<super::remittance_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum RemittanceStatus {
    #[sea_orm(string_value = "payment_pending")]
    PaymentPending,
    #[sea_orm(string_value = "payment_proof_uploaded")]
    PaymentProofUploaded,
    #[sea_orm(string_value = "payment_validated")]
    PaymentValidated,
    #[sea_orm(string_value = "payment_rejected")]
    PaymentRejected,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl RemittanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentPending => "payment_pending",
            Self::PaymentProofUploaded => "payment_proof_uploaded",
            Self::PaymentValidated => "payment_validated",
            Self::PaymentRejected => "payment_rejected",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RemittanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the exchange rate applied to a remittance came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateSource {
    /// Rate set on the remittance type itself.
    #[sea_orm(string_value = "type")]
    Type,
    /// Rate found in the exchange-rate table.
    #[sea_orm(string_value = "configured")]
    Configured,
    /// Neither was available; a rate of 1 was used.
    #[sea_orm(string_value = "fallback")]
    Fallback,
}
