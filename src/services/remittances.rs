use crate::{
    adapters::{
        ActivityEntry, Collaborators, CurrentUser, LogStatus, NotificationEvent, Offer, OfferValidation, Recipient,
    },
    db::{self, DbPool},
    entities::{
        bank_transfer::{self, BankTransferStatus},
        collection_account,
        remittance::{self, RateSource, RemittanceStatus},
        remittance_status_history,
        remittance_type::{self, DeliveryMethod},
    },
    errors::{ServiceError, ServiceResult},
    events::{Event, EventSender},
    services::{
        numbering::{self, REMITTANCE_PREFIX},
        remittance_calculator::{self, Calculation, Pricing},
        side_effects::best_effort,
        transitions::StateMachine,
        ServiceSettings,
    },
    validation::{proof_path, require_non_empty, validate_proof_file, ProofFile},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRemittanceRequest {
    pub user_id: Uuid,
    pub remittance_type_id: Uuid,
    pub amount_sent: Decimal,
    #[validate(length(min = 1, max = 200, message = "Recipient name is required"))]
    pub recipient_name: String,
    #[validate(length(min = 6, max = 32, message = "Recipient phone must be 6 to 32 characters"))]
    pub recipient_phone: String,
    #[validate(email)]
    pub recipient_email: Option<String>,
    pub recipient_address: Option<String>,
    pub recipient_city: Option<String>,
    pub recipient_id_number: Option<String>,
    pub recipient_id: Option<Uuid>,
    pub bank_account_id: Option<Uuid>,
    pub payment_reference: Option<String>,
    pub offer_code: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceDetails {
    pub remittance: remittance::Model,
    pub bank_transfers: Vec<bank_transfer::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittancePage {
    pub remittances: Vec<remittance::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Price of a prospective remittance; nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemittanceQuote {
    pub remittance_type_id: Uuid,
    pub currency_sent: String,
    pub currency_delivered: String,
    pub rate_source: RateSource,
    pub calculation: Calculation,
}

/// Optional details recorded with a bank-transfer status change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankTransferUpdate {
    pub transfer_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
}

struct RemittanceTransition {
    status: RemittanceStatus,
    changes: remittance::ActiveModel,
    notes: Option<String>,
}

impl RemittanceTransition {
    fn to(status: RemittanceStatus) -> Self {
        Self {
            status,
            changes: Default::default(),
            notes: None,
        }
    }

    fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Remittance lifecycle plus the bank-transfer records that track payout.
#[derive(Clone)]
pub struct RemittanceService {
    db_pool: Arc<DbPool>,
    collaborators: Collaborators,
    settings: ServiceSettings,
    event_sender: Option<Arc<EventSender>>,
}

impl RemittanceService {
    pub fn new(
        db_pool: Arc<DbPool>,
        collaborators: Collaborators,
        settings: ServiceSettings,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            collaborators,
            settings,
            event_sender,
        }
    }

    /// Prices and persists a remittance in `payment_pending`, assigning a
    /// collection account and, for non-cash delivery, a bank-transfer record.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, remittance_type_id = %request.remittance_type_id))]
    pub async fn create_remittance(&self, request: CreateRemittanceRequest) -> ServiceResult<RemittanceDetails> {
        request.validate()?;
        let recipient_name = require_non_empty("recipient_name", &request.recipient_name)?.to_string();
        let recipient_phone = require_non_empty("recipient_phone", &request.recipient_phone)?.to_string();

        let rtype = self.active_type(request.remittance_type_id).await?;
        if rtype.delivery_method == DeliveryMethod::BankTransfer && request.bank_account_id.is_none() {
            return Err(ServiceError::validation(
                "bank_account_id is required for bank transfer delivery",
            ));
        }
        let offer = self
            .resolve_offer(request.offer_code.as_deref(), request.amount_sent, request.user_id)
            .await?;
        let offer_discount = offer.as_ref().map(|o| o.discount).unwrap_or(Decimal::ZERO);
        let (calc, rate_source) = self.price(&rtype, request.amount_sent, offer_discount).await?;

        let remittance_id = Uuid::new_v4();
        let now = Utc::now();
        let txn = db::begin(&self.db_pool, "remittances.create").await?;

        let conn = &txn;
        let remittance_number = numbering::unique_number(
            REMITTANCE_PREFIX,
            self.settings.number_max_attempts,
            move |candidate| async move {
                let taken = remittance::Entity::find()
                    .filter(remittance::Column::RemittanceNumber.eq(candidate))
                    .count(conn)
                    .await
                    .map_err(ServiceError::db_context("remittances.number_check", None::<Uuid>))?;
                Ok(taken > 0)
            },
        )
        .await?;

        let collection_account_id = assign_collection_account(&txn, &rtype.currency_sent).await?;

        let remittance = remittance::ActiveModel {
            id: Set(remittance_id),
            remittance_number: Set(remittance_number),
            user_id: Set(request.user_id),
            remittance_type_id: Set(rtype.id),
            status: Set(RemittanceStatus::PaymentPending),
            amount_sent: Set(calc.amount_sent),
            exchange_rate: Set(calc.exchange_rate),
            rate_source: Set(rate_source),
            commission_percentage: Set(calc.commission_percentage),
            commission_fixed: Set(calc.commission_fixed),
            commission_total: Set(calc.commission_total),
            offer_discount: Set(offer_discount),
            offer_id: Set(offer.as_ref().map(|o| o.id)),
            amount_to_deliver: Set(calc.amount_to_deliver),
            currency_sent: Set(rtype.currency_sent.clone()),
            currency_delivered: Set(rtype.currency_delivered.clone()),
            delivery_method: Set(rtype.delivery_method),
            recipient_name: Set(recipient_name),
            recipient_phone: Set(recipient_phone),
            recipient_email: Set(request.recipient_email.clone()),
            recipient_address: Set(request.recipient_address.clone()),
            recipient_city: Set(request.recipient_city.clone()),
            recipient_id_number: Set(request.recipient_id_number.clone()),
            recipient_id: Set(request.recipient_id),
            bank_account_id: Set(request.bank_account_id),
            collection_account_id: Set(collection_account_id),
            payment_reference: Set(request.payment_reference.clone()),
            payment_proof_url: Set(None),
            payment_proof_uploaded_at: Set(None),
            rejection_reason: Set(None),
            delivery_proof_url: Set(None),
            delivery_notes: Set(None),
            cancellation_reason: Set(None),
            notes: Set(request.notes.clone()),
            validated_by: Set(None),
            validated_at: Set(None),
            processing_started_at: Set(None),
            delivered_at: Set(None),
            completed_at: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_context("remittances.insert", remittance_id))?;

        let mut bank_transfers = Vec::new();
        if remittance.delivery_method.requires_bank_transfer() {
            let transfer = bank_transfer::ActiveModel {
                id: Set(Uuid::new_v4()),
                remittance_id: Set(remittance_id),
                bank_account_id: Set(remittance.bank_account_id),
                amount: Set(remittance.amount_to_deliver),
                currency: Set(remittance.currency_delivered.clone()),
                status: Set(BankTransferStatus::Pending),
                transfer_reference: Set(None),
                failure_reason: Set(None),
                notes: Set(None),
                processed_by: Set(None),
                confirmed_at: Set(None),
                transferred_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_context("bank_transfers.insert", remittance_id))?;
            bank_transfers.push(transfer);
        }

        record_history(&txn, &remittance, None, Some(request.user_id), Some("remittance created".into())).await;
        db::commit(txn, "remittances.create").await?;

        info!(
            remittance_id = %remittance.id,
            remittance_number = %remittance.remittance_number,
            amount_sent = %remittance.amount_sent,
            amount_to_deliver = %remittance.amount_to_deliver,
            rate_source = %remittance.rate_source,
            "Remittance created"
        );
        counter!("remitflow.remittances.created", 1, "rate_source" => remittance.rate_source.to_string());
        self.emit(Event::RemittanceCreated {
            remittance_id,
            remittance_number: remittance.remittance_number.clone(),
            user_id: remittance.user_id,
        });

        if let Some(offer) = &offer {
            let offers = self.collaborators.offers.clone();
            let (offer_id, user_id) = (offer.id, remittance.user_id);
            best_effort(
                "offer_usage",
                self.settings.side_effect_timeout,
                self.events(),
                async move { offers.record_usage(offer_id, user_id, remittance_id).await },
            )
            .await;
        }
        self.log_activity(
            ActivityEntry::new(
                "remittance_created",
                "remittance",
                remittance.id,
                Some(remittance.user_id),
                format!("Remittance {} created", remittance.remittance_number),
            )
            .with_metadata(json!({
                "amount_sent": remittance.amount_sent,
                "amount_to_deliver": remittance.amount_to_deliver,
                "rate_source": remittance.rate_source,
            })),
        )
        .await;
        self.notify(NotificationEvent::RemittanceCreated, &remittance, json!({})).await;

        Ok(RemittanceDetails {
            remittance,
            bank_transfers,
        })
    }

    /// Stores the sender's payment proof. From `payment_rejected` the
    /// remittance passes back through `payment_pending`.
    #[instrument(skip(self, file), fields(remittance_id = %remittance_id, user_id = %user_id))]
    pub async fn upload_payment_proof(
        &self,
        remittance_id: Uuid,
        user_id: Uuid,
        file: ProofFile,
    ) -> ServiceResult<remittance::Model> {
        let ext = validate_proof_file(&file, self.settings.max_proof_size_bytes)?;
        let current = self.find_remittance(remittance_id).await?;
        check_proof_upload(&current, user_id)?;

        let now = Utc::now();
        let path = proof_path(&self.settings.payment_proof_bucket, user_id, remittance_id, now, ext);
        self.store_file(&path, file).await?;

        let (before, remittance) = self
            .apply(remittance_id, "remittances.upload_payment_proof", Some(user_id), |r| {
                check_proof_upload(r, user_id)?;
                let notes = if r.status == RemittanceStatus::PaymentRejected {
                    "payment proof resubmitted after rejection"
                } else {
                    "payment proof uploaded"
                };
                let mut t = RemittanceTransition::to(RemittanceStatus::PaymentProofUploaded).notes(notes);
                t.changes.payment_proof_url = Set(Some(path.clone()));
                t.changes.payment_proof_uploaded_at = Set(Some(now));
                t.changes.rejection_reason = Set(None);
                Ok(t)
            })
            .await?;

        self.log_activity(ActivityEntry::new(
            "payment_proof_uploaded",
            "remittance",
            remittance.id,
            Some(user_id),
            format!(
                "Payment proof uploaded for remittance {} (was {})",
                remittance.remittance_number, before.status
            ),
        ))
        .await;
        Ok(remittance)
    }

    #[instrument(skip(self, admin), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn validate_payment(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let (_, remittance) = self
            .apply(remittance_id, "remittances.validate_payment", Some(admin_id), |r| {
                r.status.ensure_transition(RemittanceStatus::PaymentValidated)?;
                let mut t = RemittanceTransition::to(RemittanceStatus::PaymentValidated).notes("payment validated");
                t.changes.validated_by = Set(Some(admin_id));
                t.changes.validated_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;

        counter!("remitflow.remittances.payments_validated", 1);
        self.after_transition(&remittance, admin_id, json!({})).await;
        Ok(remittance)
    }

    #[instrument(skip(self, admin, reason), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn reject_payment(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
        reason: &str,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let (_, remittance) = self
            .apply(remittance_id, "remittances.reject_payment", Some(admin_id), |r| {
                r.status.ensure_transition(RemittanceStatus::PaymentRejected)?;
                let reason = require_non_empty("reason", reason)?.to_string();
                let mut t = RemittanceTransition::to(RemittanceStatus::PaymentRejected).notes(reason.clone());
                t.changes.rejection_reason = Set(Some(reason));
                Ok(t)
            })
            .await?;

        counter!("remitflow.remittances.payments_rejected", 1);
        self.after_transition(
            &remittance,
            admin_id,
            json!({ "reason": remittance.rejection_reason }),
        )
        .await;
        Ok(remittance)
    }

    #[instrument(skip(self, admin), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn start_processing(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let (_, remittance) = self
            .apply(remittance_id, "remittances.start_processing", Some(admin_id), |r| {
                r.status.ensure_transition(RemittanceStatus::Processing)?;
                let mut t = RemittanceTransition::to(RemittanceStatus::Processing).notes("processing started");
                t.changes.processing_started_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;
        self.after_transition(&remittance, admin_id, json!({})).await;
        Ok(remittance)
    }

    /// `processing` → `delivered`. A delivery proof must already be on file or
    /// be supplied here; without one the call fails and the status is untouched.
    #[instrument(skip(self, admin, proof, notes), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn confirm_delivery(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
        proof: Option<ProofFile>,
        notes: Option<String>,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let current = self.find_remittance(remittance_id).await?;
        current.status.ensure_transition(RemittanceStatus::Delivered)?;

        let uploaded = match proof {
            Some(file) => {
                let ext = validate_proof_file(&file, self.settings.max_proof_size_bytes)?;
                let path = proof_path(
                    &self.settings.delivery_proof_bucket,
                    current.user_id,
                    remittance_id,
                    Utc::now(),
                    ext,
                );
                self.store_file(&path, file).await?;
                Some(path)
            }
            None => None,
        };

        let (_, remittance) = self
            .apply(remittance_id, "remittances.confirm_delivery", Some(admin_id), |r| {
                r.status.ensure_transition(RemittanceStatus::Delivered)?;
                let proof_url = uploaded
                    .clone()
                    .or_else(|| r.delivery_proof_url.clone())
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| {
                        ServiceError::validation("a delivery proof is required to confirm delivery")
                    })?;
                let mut t = RemittanceTransition::to(RemittanceStatus::Delivered).notes("delivery confirmed");
                t.changes.delivery_proof_url = Set(Some(proof_url));
                t.changes.delivery_notes = Set(notes.clone());
                t.changes.delivered_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;

        counter!("remitflow.remittances.delivered", 1);
        self.after_transition(&remittance, admin_id, json!({})).await;
        Ok(remittance)
    }

    #[instrument(skip(self, admin), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn complete_remittance(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let (_, remittance) = self
            .apply(remittance_id, "remittances.complete", Some(admin_id), |r| {
                r.status.ensure_transition(RemittanceStatus::Completed)?;
                let mut t = RemittanceTransition::to(RemittanceStatus::Completed).notes("remittance completed");
                t.changes.completed_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;
        self.after_transition(&remittance, admin_id, json!({})).await;
        Ok(remittance)
    }

    /// Admin cancellation from any cancellable state.
    #[instrument(skip(self, admin, reason), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn cancel_remittance(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
        reason: &str,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        self.cancel_inner(remittance_id, admin.id, reason, false).await
    }

    /// Sender cancellation; same cancellable states, ownership checked.
    #[instrument(skip(self, reason), fields(remittance_id = %remittance_id, user_id = %user_id))]
    pub async fn cancel_remittance_by_user(
        &self,
        remittance_id: Uuid,
        user_id: Uuid,
        reason: Option<&str>,
    ) -> ServiceResult<remittance::Model> {
        self.cancel_inner(
            remittance_id,
            user_id,
            reason.unwrap_or("cancelled by sender"),
            true,
        )
        .await
    }

    async fn cancel_inner(
        &self,
        remittance_id: Uuid,
        actor: Uuid,
        reason: &str,
        owner_only: bool,
    ) -> ServiceResult<remittance::Model> {
        let (_, remittance) = self
            .apply(remittance_id, "remittances.cancel", Some(actor), |r| {
                if owner_only {
                    ensure_owner(r, actor)?;
                }
                r.status.ensure_cancellable()?;
                let reason = require_non_empty("reason", reason)?.to_string();
                let mut t = RemittanceTransition::to(RemittanceStatus::Cancelled).notes(reason.clone());
                t.changes.cancellation_reason = Set(Some(reason));
                t.changes.cancelled_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;

        counter!("remitflow.remittances.cancelled", 1);
        self.after_transition(
            &remittance,
            actor,
            json!({ "reason": remittance.cancellation_reason }),
        )
        .await;
        Ok(remittance)
    }

    /// Re-prices a remittance still awaiting payment with the type's current
    /// rate and commission. The stored offer discount is applied again.
    #[instrument(skip(self, admin), fields(remittance_id = %remittance_id, admin_id = %admin.id))]
    pub async fn recalculate_remittance_at_current_rate(
        &self,
        remittance_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<remittance::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let current = self.find_remittance(remittance_id).await?;
        ensure_recalculable(&current)?;
        let rtype = self.active_type(current.remittance_type_id).await?;
        let (calc, rate_source) = self
            .price(&rtype, current.amount_sent, current.offer_discount)
            .await?;

        let txn = db::begin(&self.db_pool, "remittances.recalculate").await?;
        let changes = remittance::ActiveModel {
            exchange_rate: Set(calc.exchange_rate),
            rate_source: Set(rate_source),
            commission_percentage: Set(calc.commission_percentage),
            commission_fixed: Set(calc.commission_fixed),
            commission_total: Set(calc.commission_total),
            amount_to_deliver: Set(calc.amount_to_deliver),
            currency_delivered: Set(rtype.currency_delivered.clone()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        let result = remittance::Entity::update_many()
            .set(changes)
            .col_expr(remittance::Column::Version, Expr::col(remittance::Column::Version).add(1))
            .filter(remittance::Column::Id.eq(remittance_id))
            .filter(remittance::Column::Status.is_in(RemittanceStatus::RECALCULABLE.iter().copied()))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("remittances.recalculate", remittance_id))?;
        if result.rows_affected == 0 {
            warn!(%remittance_id, "remittance left a recalculable state before the write");
            return Err(ServiceError::ConcurrentModification(remittance_id));
        }

        bank_transfer::Entity::update_many()
            .col_expr(bank_transfer::Column::Amount, Expr::value(calc.amount_to_deliver))
            .col_expr(bank_transfer::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(bank_transfer::Column::RemittanceId.eq(remittance_id))
            .filter(bank_transfer::Column::Status.eq(BankTransferStatus::Pending))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("bank_transfers.reprice", remittance_id))?;

        let remittance = lock_remittance(&txn, remittance_id).await?;
        db::commit(txn, "remittances.recalculate").await?;

        info!(
            %remittance_id,
            old_rate = %current.exchange_rate,
            new_rate = %remittance.exchange_rate,
            amount_to_deliver = %remittance.amount_to_deliver,
            "Remittance recalculated"
        );
        counter!("remitflow.remittances.recalculated", 1);
        self.emit(Event::RemittanceRecalculated {
            remittance_id,
            exchange_rate: remittance.exchange_rate.to_string(),
            amount_to_deliver: remittance.amount_to_deliver.to_string(),
        });
        self.log_activity(
            ActivityEntry::new(
                "remittance_recalculated",
                "remittance",
                remittance_id,
                Some(admin_id),
                format!("Remittance {} recalculated", remittance.remittance_number),
            )
            .with_metadata(json!({
                "previous_rate": current.exchange_rate,
                "rate": remittance.exchange_rate,
                "previous_amount_to_deliver": current.amount_to_deliver,
                "amount_to_deliver": remittance.amount_to_deliver,
            })),
        )
        .await;
        Ok(remittance)
    }

    /// Moves a bank-transfer record along its own table. Does not affect the remittance.
    #[instrument(skip(self, admin, update), fields(bank_transfer_id = %transfer_id, to = %new_status))]
    pub async fn update_bank_transfer_status(
        &self,
        transfer_id: Uuid,
        new_status: BankTransferStatus,
        admin: &CurrentUser,
        update: BankTransferUpdate,
    ) -> ServiceResult<bank_transfer::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let txn = db::begin(&self.db_pool, "bank_transfers.update_status").await?;
        let before = bank_transfer::Entity::find_by_id(transfer_id)
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(ServiceError::db_context("bank_transfers.lock", transfer_id))?
            .ok_or_else(|| ServiceError::not_found("bank transfer", transfer_id))?;
        before.status.ensure_transition(new_status)?;

        let now = Utc::now();
        let mut changes = bank_transfer::ActiveModel {
            status: Set(new_status),
            processed_by: Set(Some(admin_id)),
            updated_at: Set(now),
            ..Default::default()
        };
        match new_status {
            BankTransferStatus::Confirmed => changes.confirmed_at = Set(Some(now)),
            BankTransferStatus::Transferred => {
                changes.transferred_at = Set(Some(now));
            }
            BankTransferStatus::Failed | BankTransferStatus::Reversed => {
                let reason = require_non_empty(
                    "failure_reason",
                    update.failure_reason.as_deref().unwrap_or_default(),
                )?;
                changes.failure_reason = Set(Some(reason.to_string()));
            }
            BankTransferStatus::Pending => {}
        }
        if let Some(reference) = update.transfer_reference.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            changes.transfer_reference = Set(Some(reference.to_string()));
        }
        if update.notes.is_some() {
            changes.notes = Set(update.notes.clone());
        }

        let result = bank_transfer::Entity::update_many()
            .set(changes)
            .filter(bank_transfer::Column::Id.eq(transfer_id))
            .filter(bank_transfer::Column::Status.eq(before.status))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("bank_transfers.update_status", transfer_id))?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(transfer_id));
        }
        let after = bank_transfer::Entity::find_by_id(transfer_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_context("bank_transfers.get", transfer_id))?
            .ok_or_else(|| ServiceError::not_found("bank transfer", transfer_id))?;
        db::commit(txn, "bank_transfers.update_status").await?;

        info!(bank_transfer_id = %transfer_id, from = %before.status, to = %after.status, "Bank transfer updated");
        counter!("remitflow.bank_transfers.transitions", 1, "to" => after.status.to_string());
        self.emit(Event::BankTransferStatusChanged {
            bank_transfer_id: transfer_id,
            remittance_id: after.remittance_id,
            old_status: before.status.to_string(),
            new_status: after.status.to_string(),
        });
        self.log_activity(ActivityEntry::new(
            format!("bank_transfer_{}", after.status),
            "bank_transfer",
            transfer_id,
            Some(admin_id),
            format!("Bank transfer moved from {} to {}", before.status, after.status),
        ))
        .await;
        Ok(after)
    }

    pub async fn get_bank_transfer(&self, transfer_id: Uuid) -> ServiceResult<bank_transfer::Model> {
        bank_transfer::Entity::find_by_id(transfer_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("bank_transfers.get", transfer_id))?
            .ok_or_else(|| ServiceError::not_found("bank transfer", transfer_id))
    }

    /// What `amount` would deliver today, without persisting anything.
    #[instrument(skip(self, offer_code))]
    pub async fn quote_remittance(
        &self,
        remittance_type_id: Uuid,
        amount: Decimal,
        offer_code: Option<&str>,
        user_id: Uuid,
    ) -> ServiceResult<RemittanceQuote> {
        let rtype = self.active_type(remittance_type_id).await?;
        let offer = self.resolve_offer(offer_code, amount, user_id).await?;
        let discount = offer.map(|o| o.discount).unwrap_or(Decimal::ZERO);
        let (calculation, rate_source) = self.price(&rtype, amount, discount).await?;
        Ok(RemittanceQuote {
            remittance_type_id,
            currency_sent: rtype.currency_sent,
            currency_delivered: rtype.currency_delivered,
            rate_source,
            calculation,
        })
    }

    /// The amount to send, rounded up to the cent, so the recipient gets at
    /// least `amount_to_deliver`.
    #[instrument(skip(self))]
    pub async fn quote_amount_to_send(
        &self,
        remittance_type_id: Uuid,
        amount_to_deliver: Decimal,
    ) -> ServiceResult<RemittanceQuote> {
        let rtype = self.active_type(remittance_type_id).await?;
        let (exchange_rate, rate_source) = self.resolve_rate(&rtype).await;
        let pricing = Pricing {
            exchange_rate,
            commission_percentage: rtype.commission_percentage,
            commission_fixed: rtype.commission_fixed,
            offer_discount: Decimal::ZERO,
        };
        let amount = remittance_calculator::amount_to_send(amount_to_deliver, &pricing)?
            .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);
        ensure_within_limits(&rtype, amount)?;
        let calculation = remittance_calculator::calculate(amount, &pricing)?;
        Ok(RemittanceQuote {
            remittance_type_id,
            currency_sent: rtype.currency_sent,
            currency_delivered: rtype.currency_delivered,
            rate_source,
            calculation,
        })
    }

    pub async fn get_remittance(&self, remittance_id: Uuid) -> ServiceResult<RemittanceDetails> {
        let remittance = self.find_remittance(remittance_id).await?;
        let bank_transfers = bank_transfer::Entity::find()
            .filter(bank_transfer::Column::RemittanceId.eq(remittance_id))
            .order_by_asc(bank_transfer::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("bank_transfers.list", remittance_id))?;
        Ok(RemittanceDetails {
            remittance,
            bank_transfers,
        })
    }

    /// Remittances of a user, newest first. `page` starts at 1.
    pub async fn list_user_remittances(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> ServiceResult<RemittancePage> {
        let per_page = per_page.clamp(1, 100);
        let page = page.max(1);
        let paginator = remittance::Entity::find()
            .filter(remittance::Column::UserId.eq(user_id))
            .order_by_desc(remittance::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_context("remittances.count", user_id))?;
        let remittances = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_context("remittances.list", user_id))?;
        Ok(RemittancePage {
            remittances,
            total,
            page,
            per_page,
        })
    }

    pub async fn my_remittances(&self, page: u64, per_page: u64) -> ServiceResult<RemittancePage> {
        let user = self.collaborators.auth.current_user().await?;
        self.list_user_remittances(user.id, page, per_page).await
    }

    pub async fn remittance_status_history(
        &self,
        remittance_id: Uuid,
    ) -> ServiceResult<Vec<remittance_status_history::Model>> {
        remittance_status_history::Entity::find()
            .filter(remittance_status_history::Column::RemittanceId.eq(remittance_id))
            .order_by_asc(remittance_status_history::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("remittance_status_history.list", remittance_id))
    }

    /// Locked compare-and-swap transition; see `OrderService` for the order equivalent.
    async fn apply<F>(
        &self,
        remittance_id: Uuid,
        operation: &'static str,
        actor: Option<Uuid>,
        plan: F,
    ) -> ServiceResult<(remittance::Model, remittance::Model)>
    where
        F: FnOnce(&remittance::Model) -> ServiceResult<RemittanceTransition>,
    {
        let txn = db::begin(&self.db_pool, operation).await?;
        let before = lock_remittance(&txn, remittance_id).await?;
        let transition = plan(&before)?;

        let mut changes = transition.changes;
        changes.status = Set(transition.status);
        changes.updated_at = Set(Utc::now());
        let result = remittance::Entity::update_many()
            .set(changes)
            .col_expr(remittance::Column::Version, Expr::col(remittance::Column::Version).add(1))
            .filter(remittance::Column::Id.eq(remittance_id))
            .filter(remittance::Column::Status.eq(before.status))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("remittances.transition", remittance_id))?;
        if result.rows_affected == 0 {
            warn!(%remittance_id, operation, "remittance changed concurrently");
            return Err(ServiceError::ConcurrentModification(remittance_id));
        }

        let after = lock_remittance(&txn, remittance_id).await?;
        record_history(&txn, &after, Some(&before), actor, transition.notes).await;
        db::commit(txn, operation).await?;

        info!(%remittance_id, from = %before.status, to = %after.status, "Remittance transitioned");
        counter!("remitflow.remittances.transitions", 1, "to" => after.status.as_str());
        self.emit(Event::RemittanceStatusChanged {
            remittance_id,
            old_status: before.status.to_string(),
            new_status: after.status.to_string(),
            changed_by: actor,
        });
        Ok((before, after))
    }

    async fn after_transition(&self, remittance: &remittance::Model, actor: Uuid, extra: serde_json::Value) {
        self.log_activity(ActivityEntry::new(
            format!("remittance_{}", remittance.status),
            "remittance",
            remittance.id,
            Some(actor),
            format!(
                "Remittance {} is now {}",
                remittance.remittance_number, remittance.status
            ),
        ))
        .await;
        let event = match remittance.status {
            RemittanceStatus::PaymentValidated => Some(NotificationEvent::RemittancePaymentValidated),
            RemittanceStatus::PaymentRejected => Some(NotificationEvent::RemittancePaymentRejected),
            RemittanceStatus::Processing => Some(NotificationEvent::RemittanceProcessing),
            RemittanceStatus::Delivered => Some(NotificationEvent::RemittanceDelivered),
            RemittanceStatus::Completed => Some(NotificationEvent::RemittanceCompleted),
            RemittanceStatus::Cancelled => Some(NotificationEvent::RemittanceCancelled),
            RemittanceStatus::PaymentPending | RemittanceStatus::PaymentProofUploaded => None,
        };
        if let Some(event) = event {
            self.notify(event, remittance, extra).await;
        }
    }

    async fn active_type(&self, remittance_type_id: Uuid) -> ServiceResult<remittance_type::Model> {
        let rtype = remittance_type::Entity::find_by_id(remittance_type_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("remittance_types.get", remittance_type_id))?
            .ok_or_else(|| ServiceError::not_found("remittance type", remittance_type_id))?;
        if !rtype.is_active {
            return Err(ServiceError::validation(format!(
                "remittance type '{}' is not active",
                rtype.name
            )));
        }
        Ok(rtype)
    }

    /// Type rate first, then the rate provider, then 1. A provider failure
    /// counts as "no configured rate".
    async fn resolve_rate(&self, rtype: &remittance_type::Model) -> (Decimal, RateSource) {
        let configured = if rtype.exchange_rate.filter(|r| *r > Decimal::ZERO).is_some() {
            None
        } else {
            let rates = self.collaborators.exchange_rates.clone();
            let (from, to) = (rtype.currency_sent.clone(), rtype.currency_delivered.clone());
            best_effort(
                "exchange_rate",
                self.settings.side_effect_timeout,
                self.events(),
                async move { rates.get_rate(&from, &to).await },
            )
            .await
            .flatten()
        };
        let (rate, source) = remittance_calculator::resolve_rate(rtype.exchange_rate, configured);
        if source == RateSource::Fallback {
            counter!("remitflow.remittances.fallback_rate", 1);
        }
        (rate, source)
    }

    async fn price(
        &self,
        rtype: &remittance_type::Model,
        amount: Decimal,
        offer_discount: Decimal,
    ) -> ServiceResult<(Calculation, RateSource)> {
        ensure_within_limits(rtype, amount)?;
        let (exchange_rate, rate_source) = self.resolve_rate(rtype).await;
        let pricing = Pricing {
            exchange_rate,
            commission_percentage: rtype.commission_percentage,
            commission_fixed: rtype.commission_fixed,
            offer_discount,
        };
        Ok((remittance_calculator::calculate(amount, &pricing)?, rate_source))
    }

    async fn resolve_offer(
        &self,
        code: Option<&str>,
        amount: Decimal,
        user_id: Uuid,
    ) -> ServiceResult<Option<Offer>> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        match self.collaborators.offers.validate_offer(code, amount, user_id).await? {
            OfferValidation::Valid(offer) => Ok(Some(offer)),
            OfferValidation::Invalid { reason } => Err(ServiceError::validation(format!(
                "offer '{code}' rejected: {reason}"
            ))),
        }
    }

    async fn find_remittance(&self, remittance_id: Uuid) -> ServiceResult<remittance::Model> {
        remittance::Entity::find_by_id(remittance_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("remittances.get", remittance_id))?
            .ok_or_else(|| ServiceError::not_found("remittance", remittance_id))
    }

    async fn store_file(&self, path: &str, file: ProofFile) -> ServiceResult<()> {
        let upload = self
            .collaborators
            .storage
            .upload(path, file.bytes, &file.content_type);
        match tokio::time::timeout(self.settings.side_effect_timeout, upload).await {
            Ok(result) => result,
            Err(_) => {
                error!(path, "proof upload timed out");
                Err(ServiceError::ExternalServiceError(format!(
                    "upload of {path} timed out"
                )))
            }
        }
    }

    fn events(&self) -> Option<&EventSender> {
        self.event_sender.as_deref()
    }

    fn emit(&self, event: Event) {
        if let Some(events) = self.events() {
            events.emit(event);
        }
    }

    async fn log_activity(&self, entry: ActivityEntry) -> Option<LogStatus> {
        let activity = self.collaborators.activity.clone();
        best_effort(
            "activity_log",
            self.settings.side_effect_timeout,
            self.events(),
            async move { Ok::<_, ServiceError>(activity.log(entry).await) },
        )
        .await
    }

    async fn notify(&self, event: NotificationEvent, remittance: &remittance::Model, extra: serde_json::Value) {
        let notifier = self.collaborators.notifier.clone();
        let payload = json!({
            "remittance_id": remittance.id,
            "remittance_number": remittance.remittance_number,
            "status": remittance.status,
            "amount_sent": remittance.amount_sent,
            "currency_sent": remittance.currency_sent,
            "amount_to_deliver": remittance.amount_to_deliver,
            "currency_delivered": remittance.currency_delivered,
            "recipient_name": remittance.recipient_name,
            "details": extra,
        });
        let recipient = Recipient::user(remittance.user_id);
        let locale = self.settings.default_locale;
        best_effort(
            "notification",
            self.settings.side_effect_timeout,
            self.events(),
            async move { notifier.notify(event, payload, &recipient, locale).await },
        )
        .await;
    }
}

fn ensure_owner(remittance: &remittance::Model, user_id: Uuid) -> ServiceResult<()> {
    if remittance.user_id != user_id {
        return Err(ServiceError::Forbidden(format!(
            "remittance {} does not belong to user {}",
            remittance.id, user_id
        )));
    }
    Ok(())
}

fn ensure_within_limits(rtype: &remittance_type::Model, amount: Decimal) -> ServiceResult<()> {
    if amount < rtype.min_amount || amount > rtype.max_amount {
        return Err(ServiceError::validation(format!(
            "amount {} {} is outside the allowed range {} to {}",
            amount, rtype.currency_sent, rtype.min_amount, rtype.max_amount
        )));
    }
    Ok(())
}

fn ensure_recalculable(remittance: &remittance::Model) -> ServiceResult<()> {
    if RemittanceStatus::RECALCULABLE.contains(&remittance.status) {
        return Ok(());
    }
    Err(ServiceError::validation(format!(
        "remittance {} is {}; only remittances awaiting payment can be recalculated",
        remittance.remittance_number, remittance.status
    )))
}

/// Owner only, from `payment_pending` or (via `payment_pending`) `payment_rejected`.
fn check_proof_upload(remittance: &remittance::Model, user_id: Uuid) -> ServiceResult<()> {
    ensure_owner(remittance, user_id)?;
    match remittance.status {
        RemittanceStatus::PaymentRejected => {
            remittance.status.ensure_transition(RemittanceStatus::PaymentPending)?;
            RemittanceStatus::PaymentPending.ensure_transition(RemittanceStatus::PaymentProofUploaded)
        }
        status => status.ensure_transition(RemittanceStatus::PaymentProofUploaded),
    }
}

/// Picks the active account for `currency` with the fewest assignments and
/// bumps its counter. Returns `None`, with a warning, if there is none.
async fn assign_collection_account(txn: &DatabaseTransaction, currency: &str) -> ServiceResult<Option<Uuid>> {
    let account = collection_account::Entity::find()
        .filter(collection_account::Column::IsActive.eq(true))
        .filter(collection_account::Column::Currency.eq(currency))
        .order_by_asc(collection_account::Column::AssignedCount)
        .order_by_asc(collection_account::Column::CreatedAt)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(ServiceError::db_context("collection_accounts.pick", None::<Uuid>))?;

    let Some(account) = account else {
        warn!(currency, "no active collection account; remittance left unassigned");
        return Ok(None);
    };

    collection_account::Entity::update_many()
        .col_expr(
            collection_account::Column::AssignedCount,
            Expr::col(collection_account::Column::AssignedCount).add(1),
        )
        .col_expr(collection_account::Column::LastAssignedAt, Expr::value(Utc::now()))
        .filter(collection_account::Column::Id.eq(account.id))
        .exec(txn)
        .await
        .map_err(ServiceError::db_context("collection_accounts.assign", account.id))?;
    Ok(Some(account.id))
}

async fn lock_remittance(txn: &DatabaseTransaction, remittance_id: Uuid) -> ServiceResult<remittance::Model> {
    remittance::Entity::find_by_id(remittance_id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(ServiceError::db_context("remittances.lock", remittance_id))?
        .ok_or_else(|| ServiceError::not_found("remittance", remittance_id))
}

async fn record_history(
    txn: &DatabaseTransaction,
    after: &remittance::Model,
    before: Option<&remittance::Model>,
    changed_by: Option<Uuid>,
    notes: Option<String>,
) {
    let row = remittance_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        remittance_id: Set(after.id),
        previous_status: Set(before.map(|r| r.status.to_string())),
        new_status: Set(after.status.to_string()),
        changed_by: Set(changed_by),
        notes: Set(notes),
        created_at: Set(Utc::now()),
    };
    db::savepoint(txn, "remittance_status_history", |sp| async move {
        row.insert(&sp).await?;
        Ok(sp)
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn rtype() -> remittance_type::Model {
        let now = Utc::now();
        remittance_type::Model {
            id: Uuid::new_v4(),
            name: "USD to CUP cash".into(),
            currency_sent: "USD".into(),
            currency_delivered: "CUP".into(),
            exchange_rate: Some(dec!(24)),
            commission_percentage: dec!(2),
            commission_fixed: dec!(1),
            min_amount: dec!(10),
            max_amount: dec!(1000),
            delivery_method: DeliveryMethod::Cash,
            max_delivery_days: Some(3),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn limits_are_inclusive() {
        let t = rtype();
        assert!(ensure_within_limits(&t, dec!(10)).is_ok());
        assert!(ensure_within_limits(&t, dec!(1000)).is_ok());
        assert_matches!(ensure_within_limits(&t, dec!(9.99)), Err(ServiceError::ValidationError(_)));
        assert_matches!(ensure_within_limits(&t, dec!(1000.01)), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn request_validation() {
        let mut request = CreateRemittanceRequest {
            user_id: Uuid::new_v4(),
            remittance_type_id: Uuid::new_v4(),
            amount_sent: dec!(100),
            recipient_name: "Ana Pérez".into(),
            recipient_phone: "+5355512345".into(),
            recipient_email: Some("ana@example.com".into()),
            recipient_address: None,
            recipient_city: Some("Habana".into()),
            recipient_id_number: None,
            recipient_id: None,
            bank_account_id: None,
            payment_reference: None,
            offer_code: None,
            notes: None,
        };
        assert!(request.validate().is_ok());
        request.recipient_email = Some("not-an-email".into());
        assert!(request.validate().is_err());
    }
}
