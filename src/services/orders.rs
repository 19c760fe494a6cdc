use crate::{
    adapters::{
        ActivityEntry, Collaborators, CurrentUser, LogStatus, NotificationEvent, OfferValidation,
        Recipient, ValidatedPayment,
    },
    db::{self, DbPool},
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        order_item::{self, ItemType},
        order_status_history,
    },
    errors::{ServiceError, ServiceResult},
    events::{Event, EventSender},
    services::{
        inventory::{AppliedMovement, InventoryLedger, MovementContext, StockItem},
        numbering::{self, ORDER_PREFIX},
        side_effects::best_effort,
        transitions::StateMachine,
        ServiceSettings,
    },
    validation::{
        proof_path, require_non_empty, require_non_negative, require_positive,
        require_positive_quantity, validate_proof_file, ProofFile,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
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

/// Request/Response types for the order service
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    #[validate(length(min = 3, max = 3, message = "Currency must be 3 characters"))]
    pub currency: String,
    #[serde(default)]
    pub shipping_cost: Decimal,
    #[serde(default)]
    pub tax_amount: Decimal,
    pub offer_code: Option<String>,
    pub shipping_address: Option<serde_json::Value>,
    pub recipient_info: Option<serde_json::Value>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemInput {
    pub item_type: ItemType,
    pub product_id: Option<Uuid>,
    pub combo_id: Option<Uuid>,
    pub remittance_type_id: Option<Uuid>,
    pub item_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl OrderItemInput {
    pub fn product(product_id: Uuid, name: impl Into<String>, quantity: i32, unit_price: Decimal) -> Self {
        Self {
            item_type: ItemType::Product,
            product_id: Some(product_id),
            combo_id: None,
            remittance_type_id: None,
            item_name: name.into(),
            quantity,
            unit_price,
        }
    }

    pub fn combo(combo_id: Uuid, name: impl Into<String>, quantity: i32, unit_price: Decimal) -> Self {
        Self {
            item_type: ItemType::Combo,
            combo_id: Some(combo_id),
            product_id: None,
            remittance_type_id: None,
            item_name: name.into(),
            quantity,
            unit_price,
        }
    }

    fn check(&self) -> ServiceResult<()> {
        require_non_empty("item_name", &self.item_name)?;
        require_positive_quantity("quantity", self.quantity)?;
        require_non_negative("unit_price", self.unit_price)?;
        let reference_present = match self.item_type {
            ItemType::Product => self.product_id.is_some(),
            ItemType::Combo => self.combo_id.is_some(),
            ItemType::Remittance => self.remittance_type_id.is_some(),
        };
        if !reference_present {
            return Err(ServiceError::validation(format!(
                "{:?} item '{}' is missing its reference id",
                self.item_type, self.item_name
            )));
        }
        Ok(())
    }

    fn total_price(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// What a transition does to the order's stock reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StockAction {
    Keep,
    /// Reserve unless the order already holds its reservation.
    Reserve,
    /// Release the reservation if held.
    Release,
    /// Convert the reservation (or unreserved stock) into a sale.
    Sell,
}

struct OrderTransition {
    status: OrderStatus,
    payment_status: PaymentStatus,
    stock: StockAction,
    changes: order::ActiveModel,
    notes: Option<String>,
}

impl OrderTransition {
    fn to(status: OrderStatus, payment_status: PaymentStatus) -> Self {
        Self {
            status,
            payment_status,
            stock: StockAction::Keep,
            changes: Default::default(),
            notes: None,
        }
    }

    fn stock(mut self, stock: StockAction) -> Self {
        self.stock = stock;
        self
    }

    fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// Order lifecycle: checkout, payment proof review, fulfilment, cancellation.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    collaborators: Collaborators,
    settings: ServiceSettings,
    event_sender: Option<Arc<EventSender>>,
    ledger: InventoryLedger,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        collaborators: Collaborators,
        settings: ServiceSettings,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let ledger = InventoryLedger::new(event_sender.as_deref().cloned());
        Self {
            db_pool,
            collaborators,
            settings,
            event_sender,
            ledger,
        }
    }

    /// Creates an order in `pending`/`pending` and reserves stock for its items.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, items = request.items.len()))]
    pub async fn create_order(&self, request: CreateOrderRequest) -> ServiceResult<OrderDetails> {
        request.validate()?;
        for item in &request.items {
            item.check()?;
        }
        require_non_negative("shipping_cost", request.shipping_cost)?;
        require_non_negative("tax_amount", request.tax_amount)?;

        let subtotal: Decimal = request.items.iter().map(OrderItemInput::total_price).sum();

        let offer = match request.offer_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => match self
                .collaborators
                .offers
                .validate_offer(code, subtotal, request.user_id)
                .await?
            {
                OfferValidation::Valid(offer) => Some(offer),
                OfferValidation::Invalid { reason } => {
                    return Err(ServiceError::validation(format!("offer '{code}' rejected: {reason}")))
                }
            },
            None => None,
        };
        let discount = offer
            .as_ref()
            .map(|o| o.discount.min(subtotal))
            .unwrap_or(Decimal::ZERO);
        let total = subtotal - discount + request.shipping_cost + request.tax_amount;
        require_positive("total_amount", total)?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let txn = db::begin(&self.db_pool, "orders.create").await?;

        let conn = &txn;
        let order_number = numbering::unique_number(
            ORDER_PREFIX,
            self.settings.number_max_attempts,
            move |candidate| async move {
                let taken = order::Entity::find()
                    .filter(order::Column::OrderNumber.eq(candidate))
                    .count(conn)
                    .await
                    .map_err(ServiceError::db_context("orders.number_check", None::<Uuid>))?;
                Ok(taken > 0)
            },
        )
        .await?;

        let stock_items: Vec<StockItem> = request.items.iter().filter_map(stock_item).collect();
        let ctx = MovementContext::order(order_id, Some(request.user_id));
        let lines = self.ledger.expand_items(&txn, &stock_items).await?;
        let applied = self.ledger.reserve_lines(&txn, &lines, &ctx).await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            user_id: Set(request.user_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            subtotal: Set(subtotal),
            discount_amount: Set(discount),
            shipping_cost: Set(request.shipping_cost),
            tax_amount: Set(request.tax_amount),
            total_amount: Set(total),
            currency: Set(request.currency.to_uppercase()),
            offer_id: Set(offer.as_ref().map(|o| o.id)),
            shipping_address: Set(request.shipping_address.clone()),
            recipient_info: Set(request.recipient_info.clone()),
            payment_proof_url: Set(None),
            payment_proof_uploaded_at: Set(None),
            rejection_reason: Set(None),
            cancellation_reason: Set(None),
            delivery_proof_url: Set(None),
            notes: Set(request.notes.clone()),
            inventory_reserved: Set(!applied.is_empty()),
            validated_by: Set(None),
            validated_at: Set(None),
            dispatched_at: Set(None),
            delivered_at: Set(None),
            completed_at: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_context("orders.insert", order_id))?;

        let item_rows: Vec<order_item::ActiveModel> = request
            .items
            .iter()
            .map(|item| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                item_type: Set(item.item_type),
                product_id: Set(item.product_id),
                combo_id: Set(item.combo_id),
                remittance_type_id: Set(item.remittance_type_id),
                inventory_id: Set(item.product_id.and_then(|product_id| {
                    applied
                        .iter()
                        .find(|m| m.product_id == product_id)
                        .map(|m| m.inventory_id)
                })),
                item_name: Set(item.item_name.trim().to_string()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.total_price()),
                created_at: Set(now),
            })
            .collect();
        order_item::Entity::insert_many(item_rows)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("order_items.insert", order_id))?;

        let items = load_items(&txn, order_id).await?;
        record_history(&txn, &order, None, Some(request.user_id), Some("order created".into())).await;
        db::commit(txn, "orders.create").await?;

        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total_amount, "Order created");
        counter!("remitflow.orders.created", 1);
        self.ledger.publish(&applied);
        self.emit(Event::OrderCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
        });

        if let Some(offer) = &offer {
            let offers = self.collaborators.offers.clone();
            let (offer_id, user_id) = (offer.id, order.user_id);
            best_effort(
                "offer_usage",
                self.settings.side_effect_timeout,
                self.events(),
                async move { offers.record_usage(offer_id, user_id, order_id).await },
            )
            .await;
        }
        self.log_activity(
            ActivityEntry::new(
                "order_created",
                "order",
                order.id,
                Some(order.user_id),
                format!("Order {} created", order.order_number),
            )
            .with_metadata(json!({ "items": items.len(), "total": order.total_amount })),
        )
        .await;
        self.notify(NotificationEvent::OrderCreated, &order, json!({})).await;

        Ok(OrderDetails { order, items })
    }

    /// Accepts an uploaded payment proof. Only the owner may upload, and only
    /// while the order is pending. A proof after a rejection starts a new
    /// review cycle and re-reserves stock.
    #[instrument(skip(self, file), fields(order_id = %order_id, user_id = %user_id))]
    pub async fn upload_payment_proof(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        file: ProofFile,
    ) -> ServiceResult<order::Model> {
        let ext = validate_proof_file(&file, self.settings.max_proof_size_bytes)?;
        let current = self.find_order(order_id).await?;
        check_proof_upload(&current, user_id)?;

        let now = Utc::now();
        let path = proof_path(&self.settings.payment_proof_bucket, user_id, order_id, now, ext);
        self.store_file(&path, file).await?;

        let (_, order) = self
            .apply(order_id, "orders.upload_payment_proof", Some(user_id), |order| {
                check_proof_upload(order, user_id)?;
                let mut t = OrderTransition::to(OrderStatus::Pending, PaymentStatus::ProofUploaded)
                    .stock(StockAction::Reserve)
                    .notes(Some("payment proof uploaded".into()));
                t.changes.payment_proof_url = Set(Some(path.clone()));
                t.changes.payment_proof_uploaded_at = Set(Some(now));
                t.changes.rejection_reason = Set(None);
                Ok(t)
            })
            .await?;

        self.log_activity(ActivityEntry::new(
            "payment_proof_uploaded",
            "order",
            order.id,
            Some(user_id),
            format!("Payment proof uploaded for order {}", order.order_number),
        ))
        .await;
        Ok(order)
    }

    /// Approves the uploaded payment: `pending`/`proof_uploaded` → `processing`/`validated`,
    /// selling the reserved stock.
    #[instrument(skip(self, admin), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn validate_payment(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.validate_payment_inner(order_id, admin.id, false).await
    }

    /// Admin override that also accepts a payment with no uploaded proof.
    #[instrument(skip(self, admin), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn force_validate_payment(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.validate_payment_inner(order_id, admin.id, true).await
    }

    async fn validate_payment_inner(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
        allow_without_proof: bool,
    ) -> ServiceResult<order::Model> {
        let (_, order) = self
            .apply(order_id, "orders.validate_payment", Some(admin_id), |order| {
                order.status.ensure_transition(OrderStatus::Processing)?;
                let proof_required = !allow_without_proof || order.payment_status != PaymentStatus::Pending;
                if proof_required && order.payment_status != PaymentStatus::ProofUploaded {
                    order.payment_status.ensure_transition(PaymentStatus::Validated)?;
                    return Err(ServiceError::validation(format!(
                        "no payment proof to validate (payment is {})",
                        order.payment_status
                    )));
                }
                order.payment_status.ensure_transition(PaymentStatus::Validated)?;

                let now = Utc::now();
                let mut t = OrderTransition::to(OrderStatus::Processing, PaymentStatus::Validated)
                    .stock(StockAction::Sell)
                    .notes(Some(if allow_without_proof {
                        "payment validated by administrator override".into()
                    } else {
                        "payment validated".into()
                    }));
                t.changes.validated_by = Set(Some(admin_id));
                t.changes.validated_at = Set(Some(now));
                t.changes.rejection_reason = Set(None);
                Ok(t)
            })
            .await?;

        counter!("remitflow.orders.payments_validated", 1);
        self.emit(Event::PaymentValidated {
            order_id,
            validated_by: admin_id,
        });

        let status = self
            .log_activity(
                ActivityEntry::new(
                    "payment_validated",
                    "order",
                    order.id,
                    Some(admin_id),
                    format!("Payment validated for order {}", order.order_number),
                )
                .with_metadata(json!({ "total": order.total_amount, "currency": order.currency })),
            )
            .await;
        if status == Some(LogStatus::Inserted) {
            let ledger = self.collaborators.payment_ledger.clone();
            let payment = ValidatedPayment {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id: order.user_id,
                amount: order.total_amount,
                currency: order.currency.clone(),
                validated_by: admin_id,
            };
            best_effort(
                "payment_ledger",
                self.settings.side_effect_timeout,
                self.events(),
                async move { ledger.record_validated_payment(payment).await },
            )
            .await;
        }
        self.notify(NotificationEvent::OrderPaymentValidated, &order, json!({})).await;
        Ok(order)
    }

    /// Rejects the payment, keeping the order pending so the user can upload a new proof.
    #[instrument(skip(self, admin, reason), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn reject_payment(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
        reason: &str,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let reason = require_non_empty("reason", reason)?.to_string();
        let (_, order) = self
            .apply(order_id, "orders.reject_payment", Some(admin_id), |order| {
                if order.status != OrderStatus::Pending {
                    return Err(ServiceError::validation(format!(
                        "payment can only be rejected while the order is pending (order is {})",
                        order.status
                    )));
                }
                order.payment_status.ensure_transition(PaymentStatus::Rejected)?;
                let mut t = OrderTransition::to(OrderStatus::Pending, PaymentStatus::Rejected)
                    .stock(StockAction::Release)
                    .notes(Some(reason.clone()));
                t.changes.rejection_reason = Set(Some(reason.clone()));
                Ok(t)
            })
            .await?;

        counter!("remitflow.orders.payments_rejected", 1);
        self.emit(Event::PaymentRejected {
            order_id,
            rejected_by: admin_id,
            reason: reason.clone(),
        });
        self.log_activity(ActivityEntry::new(
            "payment_rejected",
            "order",
            order.id,
            Some(admin_id),
            format!("Payment rejected for order {}: {}", order.order_number, reason),
        ))
        .await;
        self.notify(
            NotificationEvent::OrderPaymentRejected,
            &order,
            json!({ "reason": reason }),
        )
        .await;
        Ok(order)
    }

    /// Manual admin move along the status table. Cancelling and reopening go
    /// through their dedicated operations so stock stays consistent.
    #[instrument(skip(self, admin, notes), fields(order_id = %order_id, to = %new_status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        admin: &CurrentUser,
        notes: Option<String>,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        match new_status {
            OrderStatus::Cancelled => {
                self.cancel_inner(order_id, admin.id, notes.as_deref(), CancelledBy::Admin)
                    .await
            }
            OrderStatus::Pending => {
                self.reopen_inner(order_id, admin.id, notes.as_deref(), true).await
            }
            OrderStatus::Processing => self.start_processing_inner(order_id, admin.id).await,
            other => self.move_status(order_id, other, admin.id, notes).await,
        }
    }

    /// `pending` → `processing`. An order only leaves `pending` with a validated
    /// payment, so an uploaded proof is approved in the same step and the
    /// reserved stock is sold; any other payment state is refused.
    #[instrument(skip(self, admin), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn start_processing_order(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.start_processing_inner(order_id, admin.id).await
    }

    async fn start_processing_inner(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
    ) -> ServiceResult<order::Model> {
        let current = self.find_order(order_id).await?;
        current.status.ensure_transition(OrderStatus::Processing)?;
        if current.payment_status != PaymentStatus::ProofUploaded {
            return Err(ServiceError::validation(format!(
                "order cannot start processing before its payment proof is uploaded (payment is {})",
                current.payment_status
            )));
        }
        self.validate_payment_inner(order_id, admin_id, false).await
    }

    #[instrument(skip(self, admin, notes), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn mark_order_as_dispatched(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
        notes: Option<String>,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.move_status(order_id, OrderStatus::Dispatched, admin.id, notes)
            .await
    }

    /// `dispatched` → `delivered`. The delivery proof is stored before the transition.
    #[instrument(skip(self, admin, proof), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn mark_order_as_delivered(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
        proof: ProofFile,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        let admin_id = admin.id;
        let ext = validate_proof_file(&proof, self.settings.max_proof_size_bytes)?;
        let current = self.find_order(order_id).await?;
        current.status.ensure_transition(OrderStatus::Delivered)?;

        let now = Utc::now();
        let path = proof_path(
            &self.settings.delivery_proof_bucket,
            current.user_id,
            order_id,
            now,
            ext,
        );
        self.store_file(&path, proof).await?;

        let (_, order) = self
            .apply(order_id, "orders.mark_delivered", Some(admin_id), |order| {
                order.status.ensure_transition(OrderStatus::Delivered)?;
                let mut t = OrderTransition::to(OrderStatus::Delivered, order.payment_status)
                    .notes(Some("delivered with proof".into()));
                t.changes.delivery_proof_url = Set(Some(path.clone()));
                t.changes.delivered_at = Set(Some(now));
                Ok(t)
            })
            .await?;
        self.after_status_move(&order, admin_id).await;
        Ok(order)
    }

    pub async fn complete_order(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.move_status(order_id, OrderStatus::Completed, admin.id, None)
            .await
    }

    /// Admin cancellation from `pending` or `processing`; releases any held reservation.
    #[instrument(skip(self, admin, reason), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
        reason: &str,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.cancel_inner(order_id, admin.id, Some(reason), CancelledBy::Admin)
            .await
    }

    /// Owner cancellation, allowed only while the order is pending.
    #[instrument(skip(self), fields(order_id = %order_id, user_id = %user_id))]
    pub async fn cancel_order_by_user(&self, order_id: Uuid, user_id: Uuid) -> ServiceResult<order::Model> {
        self.cancel_inner(order_id, user_id, Some("cancelled by customer"), CancelledBy::Owner)
            .await
    }

    async fn cancel_inner(
        &self,
        order_id: Uuid,
        actor: Uuid,
        reason: Option<&str>,
        by: CancelledBy,
    ) -> ServiceResult<order::Model> {
        let (_, order) = self
            .apply(order_id, "orders.cancel", Some(actor), |order| {
                if by == CancelledBy::Owner {
                    ensure_owner(order, actor)?;
                }
                order.status.ensure_transition(OrderStatus::Cancelled)?;
                if by == CancelledBy::Owner && order.status != OrderStatus::Pending {
                    return Err(ServiceError::validation(format!(
                        "only pending orders can be cancelled by the customer (order is {})",
                        order.status
                    )));
                }
                let reason = require_non_empty("reason", reason.unwrap_or_default())?.to_string();
                let mut t = OrderTransition::to(OrderStatus::Cancelled, order.payment_status)
                    .stock(StockAction::Release)
                    .notes(Some(reason.clone()));
                t.changes.cancellation_reason = Set(Some(reason));
                t.changes.cancelled_at = Set(Some(Utc::now()));
                Ok(t)
            })
            .await?;

        counter!("remitflow.orders.cancelled", 1);
        self.log_activity(ActivityEntry::new(
            "order_cancelled",
            "order",
            order.id,
            Some(actor),
            format!(
                "Order {} cancelled: {}",
                order.order_number,
                order.cancellation_reason.as_deref().unwrap_or_default()
            ),
        ))
        .await;
        self.notify(
            NotificationEvent::OrderCancelled,
            &order,
            json!({ "reason": order.cancellation_reason }),
        )
        .await;
        Ok(order)
    }

    /// Owner reopening of a cancelled order.
    #[instrument(skip(self), fields(order_id = %order_id, user_id = %user_id))]
    pub async fn reopen_order(&self, order_id: Uuid, user_id: Uuid) -> ServiceResult<order::Model> {
        self.reopen_inner(order_id, user_id, None, false).await
    }

    #[instrument(skip(self, admin, reason), fields(order_id = %order_id, admin_id = %admin.id))]
    pub async fn reopen_order_by_admin(
        &self,
        order_id: Uuid,
        admin: &CurrentUser,
        reason: &str,
    ) -> ServiceResult<order::Model> {
        admin.require_admin()?;
        self.reopen_inner(order_id, admin.id, Some(reason), true).await
    }

    /// `cancelled` → `pending`/`pending`. The payment cycle restarts from
    /// scratch and stock is reserved again.
    async fn reopen_inner(
        &self,
        order_id: Uuid,
        actor: Uuid,
        reason: Option<&str>,
        by_admin: bool,
    ) -> ServiceResult<order::Model> {
        let (_, order) = self
            .apply(order_id, "orders.reopen", Some(actor), |order| {
                if !by_admin {
                    ensure_owner(order, actor)?;
                }
                order.status.ensure_transition(OrderStatus::Pending)?;
                let notes = if by_admin {
                    require_non_empty("reason", reason.unwrap_or_default())?.to_string()
                } else {
                    "reopened by customer".to_string()
                };
                let mut t = OrderTransition::to(OrderStatus::Pending, PaymentStatus::Pending)
                    .stock(StockAction::Reserve)
                    .notes(Some(notes));
                t.changes.rejection_reason = Set(None);
                t.changes.cancellation_reason = Set(None);
                t.changes.cancelled_at = Set(None);
                t.changes.validated_by = Set(None);
                t.changes.validated_at = Set(None);
                Ok(t)
            })
            .await?;

        counter!("remitflow.orders.reopened", 1);
        self.log_activity(ActivityEntry::new(
            "order_reopened",
            "order",
            order.id,
            Some(actor),
            format!("Order {} reopened", order.order_number),
        ))
        .await;
        self.notify(NotificationEvent::OrderReopened, &order, json!({})).await;
        Ok(order)
    }

    async fn move_status(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        admin_id: Uuid,
        notes: Option<String>,
    ) -> ServiceResult<order::Model> {
        let (_, order) = self
            .apply(order_id, "orders.update_status", Some(admin_id), |order| {
                order.status.ensure_transition(to)?;
                let mut t = OrderTransition::to(to, order.payment_status).notes(notes.clone());
                stamp_milestone(&mut t.changes, to, Utc::now());
                Ok(t)
            })
            .await?;
        self.after_status_move(&order, admin_id).await;
        Ok(order)
    }

    async fn after_status_move(&self, order: &order::Model, actor: Uuid) {
        self.log_activity(ActivityEntry::new(
            format!("order_{}", order.status),
            "order",
            order.id,
            Some(actor),
            format!("Order {} is now {}", order.order_number, order.status),
        ))
        .await;
        let event = match order.status {
            OrderStatus::Processing => Some(NotificationEvent::OrderProcessing),
            OrderStatus::Dispatched => Some(NotificationEvent::OrderDispatched),
            OrderStatus::Delivered => Some(NotificationEvent::OrderDelivered),
            OrderStatus::Completed => Some(NotificationEvent::OrderCompleted),
            OrderStatus::Pending | OrderStatus::Cancelled => None,
        };
        if let Some(event) = event {
            self.notify(event, order, json!({})).await;
        }
    }

    /// Runs one locked, compare-and-swap transition of an order.
    ///
    /// `plan` sees the locked row and decides the target state. Stock is
    /// adjusted in the same transaction, so either everything commits or
    /// nothing does. Returns the order before and after.
    async fn apply<F>(
        &self,
        order_id: Uuid,
        operation: &'static str,
        actor: Option<Uuid>,
        plan: F,
    ) -> ServiceResult<(order::Model, order::Model)>
    where
        F: FnOnce(&order::Model) -> ServiceResult<OrderTransition>,
    {
        let txn = db::begin(&self.db_pool, operation).await?;
        let before = lock_order(&txn, order_id).await?;
        let transition = plan(&before)?;

        let ctx = MovementContext::order(order_id, actor);
        let (reserved_after, applied) = self
            .adjust_stock(&txn, &before, transition.stock, &ctx)
            .await?;

        let mut changes = transition.changes;
        changes.status = Set(transition.status);
        changes.payment_status = Set(transition.payment_status);
        changes.inventory_reserved = Set(reserved_after);
        changes.updated_at = Set(Utc::now());

        let result = order::Entity::update_many()
            .set(changes)
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(before.status))
            .filter(order::Column::PaymentStatus.eq(before.payment_status))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_context("orders.transition", order_id))?;
        if result.rows_affected == 0 {
            warn!(%order_id, operation, "order changed concurrently");
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let after = lock_order(&txn, order_id).await?;
        record_history(&txn, &after, Some(&before), actor, transition.notes).await;
        db::commit(txn, operation).await?;

        info!(
            %order_id,
            from = %before.status,
            to = %after.status,
            payment_from = %before.payment_status,
            payment_to = %after.payment_status,
            "Order transitioned"
        );
        counter!("remitflow.orders.transitions", 1, "to" => after.status.as_str());
        self.ledger.publish(&applied);
        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status: before.status.to_string(),
            new_status: after.status.to_string(),
            old_payment_status: before.payment_status.to_string(),
            new_payment_status: after.payment_status.to_string(),
            changed_by: actor,
        });
        Ok((before, after))
    }

    async fn adjust_stock(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        action: StockAction,
        ctx: &MovementContext,
    ) -> ServiceResult<(bool, Vec<AppliedMovement>)> {
        let held = order.inventory_reserved;
        let needed = match action {
            StockAction::Keep => false,
            StockAction::Reserve => !held,
            StockAction::Release => held,
            StockAction::Sell => true,
        };
        if !needed {
            return Ok((held, Vec::new()));
        }

        let items = load_items(txn, order.id).await?;
        let stock_items: Vec<StockItem> = items.iter().filter_map(stock_item_of_row).collect();
        let lines = self.ledger.expand_items(txn, &stock_items).await?;
        match action {
            StockAction::Reserve => {
                let applied = self.ledger.reserve_lines(txn, &lines, ctx).await?;
                Ok((!applied.is_empty(), applied))
            }
            StockAction::Release => Ok((false, self.ledger.release_lines(txn, &lines, ctx).await?)),
            StockAction::Sell => Ok((false, self.ledger.reduce_lines(txn, &lines, held, ctx).await?)),
            StockAction::Keep => Ok((held, Vec::new())),
        }
    }

    /// Fetches an order with its items.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> ServiceResult<OrderDetails> {
        let db = &*self.db_pool;
        let order = self.find_order(order_id).await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_context("order_items.list", order_id))?;
        Ok(OrderDetails { order, items })
    }

    /// Orders of a user, newest first. `page` starts at 1.
    #[instrument(skip(self))]
    pub async fn list_user_orders(&self, user_id: Uuid, page: u64, per_page: u64) -> ServiceResult<OrderPage> {
        let db = &*self.db_pool;
        let per_page = per_page.clamp(1, 100);
        let page = page.max(1);
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, per_page);

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_context("orders.count", user_id))?;
        let orders = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_context("orders.list", user_id))?;

        Ok(OrderPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Orders of the signed-in user.
    pub async fn my_orders(&self, page: u64, per_page: u64) -> ServiceResult<OrderPage> {
        let user = self.collaborators.auth.current_user().await?;
        self.list_user_orders(user.id, page, per_page).await
    }

    pub async fn order_status_history(&self, order_id: Uuid) -> ServiceResult<Vec<order_status_history::Model>> {
        order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("order_status_history.list", order_id))
    }

    /// Time-limited link to the payment proof, for the owner or an administrator.
    pub async fn payment_proof_link(
        &self,
        order_id: Uuid,
        requester: &CurrentUser,
    ) -> ServiceResult<Option<String>> {
        let order = self.find_order(order_id).await?;
        if !requester.is_admin() {
            ensure_owner(&order, requester.id)?;
        }
        match order.payment_proof_url {
            Some(path) => Ok(Some(
                self.collaborators
                    .storage
                    .signed_url(&path, self.settings.signed_url_ttl)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    async fn find_order(&self, order_id: Uuid) -> ServiceResult<order::Model> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_context("orders.get", order_id))?
            .ok_or_else(|| ServiceError::not_found("order", order_id))
    }

    /// Uploads a proof file. Unlike other side effects the upload is the
    /// point of the call, so a failure or timeout is returned to the caller.
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

    async fn notify(&self, event: NotificationEvent, order: &order::Model, extra: serde_json::Value) {
        let notifier = self.collaborators.notifier.clone();
        let payload = json!({
            "order_id": order.id,
            "order_number": order.order_number,
            "status": order.status,
            "payment_status": order.payment_status,
            "total_amount": order.total_amount,
            "currency": order.currency,
            "details": extra,
        });
        let recipient = Recipient::user(order.user_id);
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelledBy {
    Admin,
    Owner,
}

fn ensure_owner(order: &order::Model, user_id: Uuid) -> ServiceResult<()> {
    if order.user_id != user_id {
        return Err(ServiceError::Forbidden(format!(
            "order {} does not belong to user {}",
            order.id, user_id
        )));
    }
    Ok(())
}

/// Proof uploads: owner only, order pending, payment not yet validated.
/// A rejected or already-uploaded payment goes back through `pending`.
fn check_proof_upload(order: &order::Model, user_id: Uuid) -> ServiceResult<()> {
    ensure_owner(order, user_id)?;
    if order.status != OrderStatus::Pending {
        return Err(ServiceError::validation(format!(
            "payment proof can only be uploaded while the order is pending (order is {})",
            order.status
        )));
    }
    match order.payment_status {
        PaymentStatus::Pending => order
            .payment_status
            .ensure_transition(PaymentStatus::ProofUploaded),
        other => {
            other.ensure_transition(PaymentStatus::Pending)?;
            PaymentStatus::Pending.ensure_transition(PaymentStatus::ProofUploaded)
        }
    }
}

fn stamp_milestone(changes: &mut order::ActiveModel, status: OrderStatus, at: DateTime<Utc>) {
    match status {
        OrderStatus::Dispatched => changes.dispatched_at = Set(Some(at)),
        OrderStatus::Delivered => changes.delivered_at = Set(Some(at)),
        OrderStatus::Completed => changes.completed_at = Set(Some(at)),
        OrderStatus::Cancelled => changes.cancelled_at = Set(Some(at)),
        OrderStatus::Pending | OrderStatus::Processing => {}
    }
}

fn stock_item(item: &OrderItemInput) -> Option<StockItem> {
    to_stock_item(item.item_type, item.product_id, item.combo_id, item.quantity)
}

fn stock_item_of_row(item: &order_item::Model) -> Option<StockItem> {
    to_stock_item(item.item_type, item.product_id, item.combo_id, item.quantity)
}

fn to_stock_item(
    item_type: ItemType,
    product_id: Option<Uuid>,
    combo_id: Option<Uuid>,
    quantity: i32,
) -> Option<StockItem> {
    match item_type {
        ItemType::Product => product_id.map(|product_id| StockItem::Product { product_id, quantity }),
        ItemType::Combo => combo_id.map(|combo_id| StockItem::Combo { combo_id, quantity }),
        ItemType::Remittance => None,
    }
}

async fn lock_order(txn: &DatabaseTransaction, order_id: Uuid) -> ServiceResult<order::Model> {
    order::Entity::find_by_id(order_id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(ServiceError::db_context("orders.lock", order_id))?
        .ok_or_else(|| ServiceError::not_found("order", order_id))
}

async fn load_items(txn: &DatabaseTransaction, order_id: Uuid) -> ServiceResult<Vec<order_item::Model>> {
    order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(txn)
        .await
        .map_err(ServiceError::db_context("order_items.list", order_id))
}

async fn record_history(
    txn: &DatabaseTransaction,
    after: &order::Model,
    before: Option<&order::Model>,
    changed_by: Option<Uuid>,
    notes: Option<String>,
) {
    let row = order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(after.id),
        previous_status: Set(before.map(|o| o.status.to_string())),
        new_status: Set(after.status.to_string()),
        previous_payment_status: Set(before.map(|o| o.payment_status.to_string())),
        new_payment_status: Set(Some(after.payment_status.to_string())),
        changed_by: Set(changed_by),
        notes: Set(notes),
        created_at: Set(Utc::now()),
    };
    db::savepoint(txn, "order_status_history", |sp| async move {
        row.insert(&sp).await?;
        Ok(sp)
    })
    .await;
}
