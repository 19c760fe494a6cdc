//! Inventory reservation ledger.
//!
//! Every mutation runs on the caller's transaction with the touched rows
//! locked (`SELECT ... FOR UPDATE`). Movement rows are appended in a savepoint
//! so a failed audit write never undoes the stock change.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use futures::future::try_join_all;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, Set,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db;
use crate::entities::{combo_product, inventory, inventory_movement, inventory_movement::MovementType};
use crate::errors::{ServiceError, ServiceResult};
use crate::events::{Event, EventSender};

/// A quantity of a single product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// A line as ordered: either a product or a combo of products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockItem {
    Product { product_id: Uuid, quantity: i32 },
    Combo { combo_id: Uuid, quantity: i32 },
}

/// What a movement is recorded against.
#[derive(Debug, Clone)]
pub struct MovementContext {
    pub reference_type: &'static str,
    pub reference_id: Uuid,
    pub actor: Option<Uuid>,
    pub notes: Option<String>,
}

impl MovementContext {
    pub fn order(order_id: Uuid, actor: Option<Uuid>) -> Self {
        Self {
            reference_type: "order",
            reference_id: order_id,
            actor,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// A stock change applied inside a transaction, published once it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMovement {
    pub inventory_id: Uuid,
    pub product_id: Uuid,
    pub movement: MovementType,
    pub quantity: i32,
    pub before: (i32, i32),
    pub after: (i32, i32),
    pub reference_id: Uuid,
}

/// New `(quantity, reserved)` for a reservation, or `None` if stock is short.
pub fn plan_reserve(quantity: i32, reserved: i32, qty: i32) -> Option<(i32, i32)> {
    let available = (quantity - reserved).max(0);
    (available >= qty).then_some((quantity, reserved + qty))
}

/// New `(quantity, reserved)` for a release; reserved is clamped at zero.
pub fn plan_release(quantity: i32, reserved: i32, qty: i32) -> (i32, i32) {
    (quantity, (reserved - qty).max(0))
}

/// New `(quantity, reserved)` for a sale of `qty` units of which `held` were
/// reserved for this sale, or `None` if stock is short.
pub fn plan_reduce(quantity: i32, reserved: i32, qty: i32, held: i32) -> Option<(i32, i32)> {
    let others_reserved = (reserved - held).max(0);
    let available = quantity - others_reserved;
    (available >= qty).then_some((quantity - qty, others_reserved))
}

#[derive(Clone, Default)]
pub struct InventoryLedger {
    events: Option<EventSender>,
}

impl InventoryLedger {
    pub fn new(events: Option<EventSender>) -> Self {
        Self { events }
    }

    /// Holds `qty` units of one inventory record.
    #[instrument(skip(self, txn, ctx), fields(reference_id = %ctx.reference_id))]
    pub async fn reserve(
        &self,
        txn: &DatabaseTransaction,
        inventory_id: Uuid,
        qty: i32,
        ctx: &MovementContext,
    ) -> ServiceResult<AppliedMovement> {
        self.apply_one(txn, inventory_id, qty, MovementType::Reserved, ctx).await
    }

    /// Returns `qty` held units of one inventory record to availability.
    #[instrument(skip(self, txn, ctx), fields(reference_id = %ctx.reference_id))]
    pub async fn release(
        &self,
        txn: &DatabaseTransaction,
        inventory_id: Uuid,
        qty: i32,
        ctx: &MovementContext,
    ) -> ServiceResult<AppliedMovement> {
        self.apply_one(txn, inventory_id, qty, MovementType::Released, ctx).await
    }

    /// Converts a `qty` reservation on one record into a physical reduction.
    #[instrument(skip(self, txn, ctx), fields(reference_id = %ctx.reference_id))]
    pub async fn reduce(
        &self,
        txn: &DatabaseTransaction,
        inventory_id: Uuid,
        qty: i32,
        ctx: &MovementContext,
    ) -> ServiceResult<AppliedMovement> {
        self.apply_one(txn, inventory_id, qty, MovementType::Sold, ctx).await
    }

    async fn apply_one(
        &self,
        txn: &DatabaseTransaction,
        inventory_id: Uuid,
        qty: i32,
        movement: MovementType,
        ctx: &MovementContext,
    ) -> ServiceResult<AppliedMovement> {
        if qty <= 0 {
            return Err(ServiceError::validation("quantity must be greater than zero"));
        }
        let record = inventory::Entity::find_by_id(inventory_id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(ServiceError::db_context("inventory.lock", inventory_id))?
            .ok_or_else(|| ServiceError::not_found("inventory", inventory_id))?;

        let applied = plan_movement(&record, qty, movement, qty, ctx)?;
        write_stock(txn, record, applied.after).await?;
        append_movements(txn, std::slice::from_ref(&applied), ctx).await;
        Ok(applied)
    }

    /// Reserves every line, all or nothing.
    pub async fn reserve_lines(
        &self,
        txn: &DatabaseTransaction,
        lines: &[StockLine],
        ctx: &MovementContext,
    ) -> ServiceResult<Vec<AppliedMovement>> {
        self.apply_lines(txn, lines, MovementType::Reserved, true, ctx).await
    }

    pub async fn release_lines(
        &self,
        txn: &DatabaseTransaction,
        lines: &[StockLine],
        ctx: &MovementContext,
    ) -> ServiceResult<Vec<AppliedMovement>> {
        self.apply_lines(txn, lines, MovementType::Released, true, ctx).await
    }

    /// Sells every line. `held` says whether the lines are currently reserved
    /// for this sale; if not, only unreserved stock may be sold.
    pub async fn reduce_lines(
        &self,
        txn: &DatabaseTransaction,
        lines: &[StockLine],
        held: bool,
        ctx: &MovementContext,
    ) -> ServiceResult<Vec<AppliedMovement>> {
        self.apply_lines(txn, lines, MovementType::Sold, held, ctx).await
    }

    #[instrument(skip(self, txn, lines, ctx), fields(movement = %movement, reference_id = %ctx.reference_id, lines = lines.len()))]
    async fn apply_lines(
        &self,
        txn: &DatabaseTransaction,
        lines: &[StockLine],
        movement: MovementType,
        held: bool,
        ctx: &MovementContext,
    ) -> ServiceResult<Vec<AppliedMovement>> {
        let wanted = merge_lines(lines)?;
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let product_ids: Vec<Uuid> = wanted.keys().copied().collect();
        let records: HashMap<Uuid, inventory::Model> = inventory::Entity::find()
            .filter(inventory::Column::ProductId.is_in(product_ids))
            .lock_exclusive()
            .all(txn)
            .await
            .map_err(ServiceError::db_context("inventory.lock_batch", ctx.reference_id))?
            .into_iter()
            .map(|r| (r.product_id, r))
            .collect();

        // Plan every line before writing anything so a shortage leaves no partial update.
        let mut planned = Vec::with_capacity(wanted.len());
        for (product_id, qty) in &wanted {
            let Some(record) = records.get(product_id) else {
                warn!(%product_id, %movement, "no inventory record for product; skipping");
                continue;
            };
            let hold = if held { *qty } else { 0 };
            let applied = plan_movement(record, *qty, movement, hold, ctx)?;
            planned.push((record.clone(), applied));
        }

        try_join_all(
            planned
                .iter()
                .map(|(record, applied)| write_stock(txn, record.clone(), applied.after)),
        )
        .await?;

        let applied: Vec<AppliedMovement> = planned.into_iter().map(|(_, a)| a).collect();
        append_movements(txn, &applied, ctx).await;
        Ok(applied)
    }

    /// Expands combos into their constituent products with one batched lookup.
    pub async fn expand_items(
        &self,
        txn: &DatabaseTransaction,
        items: &[StockItem],
    ) -> ServiceResult<Vec<StockLine>> {
        let combo_ids: Vec<Uuid> = items
            .iter()
            .filter_map(|item| match item {
                StockItem::Combo { combo_id, .. } => Some(*combo_id),
                StockItem::Product { .. } => None,
            })
            .collect();

        let mut components: HashMap<Uuid, Vec<combo_product::Model>> = HashMap::new();
        if !combo_ids.is_empty() {
            for row in combo_product::Entity::find()
                .filter(combo_product::Column::ComboId.is_in(combo_ids))
                .all(txn)
                .await
                .map_err(ServiceError::db_context("combo_products.expand", None::<Uuid>))?
            {
                components.entry(row.combo_id).or_default().push(row);
            }
        }

        let mut lines = Vec::new();
        for item in items {
            match *item {
                StockItem::Product {
                    product_id,
                    quantity,
                } => lines.push(StockLine {
                    product_id,
                    quantity,
                }),
                StockItem::Combo { combo_id, quantity } => match components.get(&combo_id) {
                    Some(parts) => lines.extend(parts.iter().map(|part| StockLine {
                        product_id: part.product_id,
                        quantity: quantity * part.quantity,
                    })),
                    None => warn!(%combo_id, "combo has no component products"),
                },
            }
        }
        Ok(lines)
    }

    /// Emits an `InventoryMoved` event per movement. Call after commit.
    pub fn publish(&self, applied: &[AppliedMovement]) {
        for movement in applied {
            counter!("remitflow.inventory.movements", 1, "type" => movement.movement.to_string());
            if let Some(events) = &self.events {
                events.emit(Event::InventoryMoved {
                    inventory_id: movement.inventory_id,
                    product_id: movement.product_id,
                    movement: movement.movement,
                    quantity: movement.quantity,
                    reference_id: movement.reference_id,
                });
            }
        }
    }
}

fn merge_lines(lines: &[StockLine]) -> ServiceResult<BTreeMap<Uuid, i32>> {
    let mut merged = BTreeMap::new();
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::validation(format!(
                "quantity for product {} must be greater than zero",
                line.product_id
            )));
        }
        *merged.entry(line.product_id).or_insert(0) += line.quantity;
    }
    Ok(merged)
}

fn plan_movement(
    record: &inventory::Model,
    qty: i32,
    movement: MovementType,
    held: i32,
    ctx: &MovementContext,
) -> ServiceResult<AppliedMovement> {
    let before = (record.quantity, record.reserved_quantity);
    let after = match movement {
        MovementType::Reserved => plan_reserve(record.quantity, record.reserved_quantity, qty),
        MovementType::Released => Some(plan_release(record.quantity, record.reserved_quantity, qty)),
        MovementType::Sold => plan_reduce(record.quantity, record.reserved_quantity, qty, held),
    }
    .ok_or_else(|| {
        ServiceError::InsufficientStock(format!(
            "product {} has {} available, {} requested",
            record.product_id,
            record.available(),
            qty
        ))
    })?;

    Ok(AppliedMovement {
        inventory_id: record.id,
        product_id: record.product_id,
        movement,
        quantity: qty,
        before,
        after,
        reference_id: ctx.reference_id,
    })
}

async fn write_stock(
    txn: &DatabaseTransaction,
    record: inventory::Model,
    (quantity, reserved): (i32, i32),
) -> ServiceResult<inventory::Model> {
    let id = record.id;
    let mut active: inventory::ActiveModel = record.into();
    active.quantity = Set(quantity);
    active.reserved_quantity = Set(reserved);
    active.available_quantity = Set((quantity - reserved).max(0));
    active.updated_at = Set(Utc::now());
    active
        .update(txn)
        .await
        .map_err(ServiceError::db_context("inventory.update", id))
}

async fn append_movements(txn: &DatabaseTransaction, applied: &[AppliedMovement], ctx: &MovementContext) {
    if applied.is_empty() {
        return;
    }
    let now = Utc::now();
    let rows: Vec<inventory_movement::ActiveModel> = applied
        .iter()
        .map(|m| inventory_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            inventory_id: Set(m.inventory_id),
            product_id: Set(m.product_id),
            movement_type: Set(m.movement),
            quantity_delta: Set(match m.movement {
                MovementType::Released => m.quantity,
                MovementType::Reserved | MovementType::Sold => -m.quantity,
            }),
            previous_quantity: Set(m.before.0),
            new_quantity: Set(m.after.0),
            previous_reserved: Set(m.before.1),
            new_reserved: Set(m.after.1),
            reference_type: Set(ctx.reference_type.to_string()),
            reference_id: Set(ctx.reference_id),
            created_by: Set(ctx.actor),
            notes: Set(ctx.notes.clone()),
            created_at: Set(now),
        })
        .collect();

    db::savepoint(txn, "inventory_movements", |sp| async move {
        inventory_movement::Entity::insert_many(rows).exec(&sp).await?;
        Ok(sp)
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_availability() {
        assert_eq!(plan_reserve(20, 0, 2), Some((20, 2)));
        assert_eq!(plan_reserve(5, 4, 1), Some((5, 5)));
        assert_eq!(plan_reserve(5, 4, 2), None);
    }

    #[test]
    fn release_clamps_at_zero() {
        assert_eq!(plan_release(20, 2, 2), (20, 0));
        assert_eq!(plan_release(20, 1, 5), (20, 0));
    }

    #[test]
    fn reduce_converts_held_reservation() {
        // {quantity:10, reserved:3}, 5 sold against its own hold.
        assert_eq!(plan_reduce(10, 3, 5, 5), Some((5, 0)));
        // Own reservation of all stock can still be sold.
        assert_eq!(plan_reduce(5, 5, 5, 5), Some((0, 0)));
        // Without a hold, other reservations are protected.
        assert_eq!(plan_reduce(10, 3, 5, 0), Some((5, 3)));
        assert_eq!(plan_reduce(10, 8, 5, 0), None);
    }

    #[test]
    fn merge_sums_duplicate_products() {
        let p = Uuid::new_v4();
        let q = Uuid::new_v4();
        let merged = merge_lines(&[
            StockLine { product_id: p, quantity: 2 },
            StockLine { product_id: q, quantity: 1 },
            StockLine { product_id: p, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(merged.get(&p), Some(&5));
        assert_eq!(merged.get(&q), Some(&1));
        assert!(merge_lines(&[StockLine { product_id: p, quantity: 0 }]).is_err());
    }
}
