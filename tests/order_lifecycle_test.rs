//! Order lifecycle against a migrated in-memory database: creation with
//! reservation, proof upload, validation, rejection, cancellation and reopening.

mod common;

use assert_matches::assert_matches;
use common::{receipt, TempDb, TestApp};
use remitflow::{
    db,
    entities::{inventory_movement, inventory_movement::MovementType, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::Event,
    services::inventory::{InventoryLedger, MovementContext},
    services::orders::{CreateOrderRequest, OrderItemInput},
    adapters::{CurrentUser, Role},
};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

fn order_request(user_id: Uuid, items: Vec<OrderItemInput>) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        currency: "USD".into(),
        shipping_cost: dec!(5),
        tax_amount: dec!(0),
        offer_code: None,
        shipping_address: None,
        recipient_info: None,
        notes: None,
        items,
    }
}

#[tokio::test]
async fn create_order_reserves_stock() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(20, 0).await;

    let details = app
        .services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Arroz 5kg", 2, dec!(12.50))],
        ))
        .await
        .unwrap();

    assert_eq!(details.order.status, OrderStatus::Pending);
    assert_eq!(details.order.payment_status, PaymentStatus::Pending);
    assert!(details.order.inventory_reserved);
    assert_eq!(details.order.subtotal, dec!(25));
    assert_eq!(details.order.total_amount, dec!(30));
    assert!(details.order.order_number.starts_with("ORD-"));
    assert_eq!(details.items.len(), 1);

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (20, 2));
    assert_eq!(after.available_quantity, 18);
}

#[tokio::test]
async fn rejecting_payment_releases_reservation() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(20, 0).await;
    let order = app
        .services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Aceite", 2, dec!(4))],
        ))
        .await
        .unwrap()
        .order;

    let rejected = app
        .services
        .orders
        .reject_payment(order.id, &app.admin, "comprobante ilegible")
        .await
        .unwrap();

    assert_eq!(rejected.status, OrderStatus::Pending);
    assert_eq!(rejected.payment_status, PaymentStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("comprobante ilegible"));
    assert!(!rejected.inventory_reserved);

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (20, 0));
}

#[tokio::test]
async fn proof_upload_then_validation_sells_stock() {
    let mut app = TestApp::new().await;
    let stock = app.seed_inventory(20, 0).await;
    let order = app
        .services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Leche en polvo", 3, dec!(9))],
        ))
        .await
        .unwrap()
        .order;

    let uploaded = app
        .services
        .orders
        .upload_payment_proof(order.id, app.user.id, receipt())
        .await
        .unwrap();
    assert_eq!(uploaded.payment_status, PaymentStatus::ProofUploaded);
    let path = uploaded.payment_proof_url.clone().unwrap();
    assert!(app.storage.get(&path).await.is_some());

    let validated = app
        .services
        .orders
        .validate_payment(order.id, &app.admin)
        .await
        .unwrap();
    assert_eq!(validated.status, OrderStatus::Processing);
    assert_eq!(validated.payment_status, PaymentStatus::Validated);
    assert_eq!(validated.validated_by, Some(app.admin.id));
    assert!(validated.version > order.version);

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (17, 0));

    let movements = inventory_movement::Entity::find()
        .filter(inventory_movement::Column::ReferenceId.eq(order.id))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(movements, 2);

    let history = app.services.orders.order_status_history(order.id).await.unwrap();
    assert_eq!(history.len(), 3);

    let events = app.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::PaymentValidated { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn validation_without_proof_needs_override() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(5, 0).await;
    let order = app
        .services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Café", 1, dec!(3))],
        ))
        .await
        .unwrap()
        .order;

    let err = app
        .services
        .orders
        .validate_payment(order.id, &app.admin)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let forced = app
        .services
        .orders
        .force_validate_payment(order.id, &app.admin)
        .await
        .unwrap();
    assert_eq!(forced.payment_status, PaymentStatus::Validated);
    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (4, 0));
}

#[tokio::test]
async fn reduction_clamps_foreign_reservations() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(10, 3).await;
    let ledger = InventoryLedger::default();

    let txn = db::begin(&app.db, "test.reduce").await.unwrap();
    let applied = ledger
        .reduce(&txn, stock.id, 5, &MovementContext::order(Uuid::new_v4(), None))
        .await
        .unwrap();
    db::commit(txn, "test.reduce").await.unwrap();

    assert_eq!(applied.before, (10, 3));
    assert_eq!(applied.after, (5, 0));
    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (5, 0));
}

#[tokio::test]
async fn insufficient_stock_leaves_every_row_untouched() {
    let app = TestApp::new().await;
    let plenty = app.seed_inventory(50, 0).await;
    let scarce = app.seed_inventory(1, 0).await;

    let err = app
        .services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![
                OrderItemInput::product(plenty.product_id, "Azúcar", 4, dec!(2)),
                OrderItemInput::product(scarce.product_id, "Jabón", 2, dec!(1)),
            ],
        ))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(app.inventory(plenty.id).await.reserved_quantity, 0);
    assert_eq!(app.inventory(scarce.id).await.reserved_quantity, 0);
    let page = app.services.orders.list_user_orders(app.user.id, 1, 10).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn combos_reserve_their_parts() {
    let app = TestApp::new().await;
    let rice = app.seed_inventory(10, 0).await;
    let beans = app.seed_inventory(10, 0).await;
    let combo = app
        .seed_combo(&[(rice.product_id, 2), (beans.product_id, 1)])
        .await;

    app.services
        .orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::combo(combo, "Combo familiar", 3, dec!(20))],
        ))
        .await
        .unwrap();

    assert_eq!(app.inventory(rice.id).await.reserved_quantity, 6);
    assert_eq!(app.inventory(beans.id).await.reserved_quantity, 3);
}

#[tokio::test]
async fn completed_order_accepts_no_status_change() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(5, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Pan", 1, dec!(1))],
        ))
        .await
        .unwrap()
        .order;
    orders.force_validate_payment(order.id, &app.admin).await.unwrap();
    orders
        .mark_order_as_dispatched(order.id, &app.admin, Some("camión 3".into()))
        .await
        .unwrap();
    orders
        .mark_order_as_delivered(order.id, &app.admin, receipt())
        .await
        .unwrap();
    let completed = orders.complete_order(order.id, &app.admin).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    assert!(completed.completed_at.is_some());

    for to in [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Dispatched,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ] {
        let err = orders
            .update_order_status(order.id, to, &app.admin, Some("x".into()))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ServiceError::InvalidTransition { ref allowed, .. } if allowed.is_empty()
        );
    }
    let unchanged = orders.get_order(order.id).await.unwrap().order;
    assert_eq!(unchanged.status, OrderStatus::Completed);
}

#[tokio::test]
async fn cancel_and_reopen_round_trip() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(8, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Frijoles", 4, dec!(2))],
        ))
        .await
        .unwrap()
        .order;

    let stranger = Uuid::new_v4();
    assert_matches!(
        orders.cancel_order_by_user(order.id, stranger).await,
        Err(ServiceError::Forbidden(_))
    );

    let cancelled = orders.cancel_order_by_user(order.id, app.user.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(app.inventory(stock.id).await.reserved_quantity, 0);

    let reopened = orders.reopen_order(order.id, app.user.id).await.unwrap();
    assert_eq!(reopened.status, OrderStatus::Pending);
    assert_eq!(reopened.payment_status, PaymentStatus::Pending);
    assert!(reopened.cancellation_reason.is_none());
    assert!(reopened.inventory_reserved);
    assert_eq!(app.inventory(stock.id).await.reserved_quantity, 4);
}

#[tokio::test]
async fn admin_cancel_requires_reason() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(8, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Galletas", 1, dec!(2))],
        ))
        .await
        .unwrap()
        .order;

    assert_matches!(
        orders.cancel_order(order.id, &app.admin, "  ").await,
        Err(ServiceError::ValidationError(_))
    );
    let cancelled = orders
        .update_order_status(order.id, OrderStatus::Cancelled, &app.admin, Some("duplicado".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("duplicado"));
}

#[tokio::test]
async fn proof_link_is_owner_or_admin_only() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(3, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Té", 1, dec!(1))],
        ))
        .await
        .unwrap()
        .order;
    assert_eq!(orders.payment_proof_link(order.id, &app.user).await.unwrap(), None);

    orders
        .upload_payment_proof(order.id, app.user.id, receipt())
        .await
        .unwrap();
    let link = orders.payment_proof_link(order.id, &app.user).await.unwrap();
    assert!(link.unwrap().starts_with("https://files.example.com/"));

    assert!(orders.payment_proof_link(order.id, &app.admin).await.unwrap().is_some());

    let other = CurrentUser {
        id: Uuid::new_v4(),
        email: "otro@example.com".into(),
        role: Role::Customer,
    };
    assert_matches!(
        orders.payment_proof_link(order.id, &other).await,
        Err(ServiceError::Forbidden(_))
    );
}

#[tokio::test]
async fn my_orders_uses_the_signed_in_user() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(10, 0).await;
    for _ in 0..2 {
        app.services
            .orders
            .create_order(order_request(
                app.user.id,
                vec![OrderItemInput::product(stock.product_id, "Sal", 1, dec!(1))],
            ))
            .await
            .unwrap();
    }
    let page = app.services.orders.my_orders(1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert_ne!(page.orders[0].order_number, page.orders[1].order_number);
}

#[tokio::test]
async fn customers_cannot_run_admin_operations() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(5, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Café", 1, dec!(3))],
        ))
        .await
        .unwrap()
        .order;

    assert_matches!(
        orders.force_validate_payment(order.id, &app.user).await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        orders.reject_payment(order.id, &app.user, "no").await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        orders.cancel_order(order.id, &app.user, "no").await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        orders
            .update_order_status(order.id, OrderStatus::Processing, &app.user, None)
            .await,
        Err(ServiceError::Forbidden(_))
    );

    let unchanged = orders.get_order(order.id).await.unwrap().order;
    assert_eq!(unchanged.status, OrderStatus::Pending);
    assert_eq!(unchanged.payment_status, PaymentStatus::Pending);
    assert_eq!(app.inventory(stock.id).await.quantity, 5);
}

#[tokio::test]
async fn start_processing_approves_the_uploaded_proof() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(6, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Leche en polvo", 2, dec!(7))],
        ))
        .await
        .unwrap()
        .order;

    assert_matches!(
        orders.start_processing_order(order.id, &app.admin).await,
        Err(ServiceError::ValidationError(_))
    );

    orders
        .upload_payment_proof(order.id, app.user.id, receipt())
        .await
        .unwrap();
    let processing = orders.start_processing_order(order.id, &app.admin).await.unwrap();
    assert_eq!(processing.status, OrderStatus::Processing);
    assert_eq!(processing.payment_status, PaymentStatus::Validated);
    assert_eq!(processing.validated_by, Some(app.admin.id));

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (4, 0));

    assert_matches!(
        orders.start_processing_order(order.id, &app.admin).await,
        Err(ServiceError::InvalidTransition { .. })
    );
}

#[tokio::test]
async fn admin_reopen_needs_a_reason_and_reserves_again() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(10, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Aceite", 3, dec!(4))],
        ))
        .await
        .unwrap()
        .order;
    orders.cancel_order(order.id, &app.admin, "sin pago").await.unwrap();
    assert_eq!(app.inventory(stock.id).await.reserved_quantity, 0);

    assert_matches!(
        orders.reopen_order_by_admin(order.id, &app.admin, "").await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        orders.reopen_order_by_admin(order.id, &app.user, "pago recibido").await,
        Err(ServiceError::Forbidden(_))
    );

    let reopened = orders
        .reopen_order_by_admin(order.id, &app.admin, "pago recibido")
        .await
        .unwrap();
    assert_eq!(reopened.status, OrderStatus::Pending);
    assert_eq!(reopened.payment_status, PaymentStatus::Pending);
    assert!(reopened.inventory_reserved);
    assert_eq!(app.inventory(stock.id).await.reserved_quantity, 3);

    let history = orders.order_status_history(order.id).await.unwrap();
    assert!(history
        .iter()
        .any(|h| h.new_status == "pending" && h.notes.as_deref() == Some("pago recibido")));
}

#[tokio::test]
async fn ledger_moves_a_single_record() {
    let app = TestApp::new().await;
    let stock = app.seed_inventory(10, 0).await;
    let ledger = InventoryLedger::default();
    let reference = Uuid::new_v4();
    let ctx = MovementContext::order(reference, Some(app.admin.id));

    let txn = db::begin(&app.db, "test.ledger").await.unwrap();
    let reserved = ledger.reserve(&txn, stock.id, 4, &ctx).await.unwrap();
    assert_eq!((reserved.before, reserved.after), ((10, 0), (10, 4)));
    let released = ledger.release(&txn, stock.id, 6, &ctx).await.unwrap();
    assert_eq!(released.after, (10, 0));
    ledger.reserve(&txn, stock.id, 3, &ctx).await.unwrap();
    let sold = ledger.reduce(&txn, stock.id, 3, &ctx).await.unwrap();
    assert_eq!(sold.after, (7, 0));
    assert_matches!(
        ledger.reserve(&txn, stock.id, 0, &ctx).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        ledger.reduce(&txn, stock.id, 8, &ctx).await,
        Err(ServiceError::InsufficientStock(_))
    );
    db::commit(txn, "test.ledger").await.unwrap();

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity, after.available_quantity), (7, 0, 7));

    let movements = inventory_movement::Entity::find()
        .filter(inventory_movement::Column::ReferenceId.eq(reference))
        .all(&*app.db)
        .await
        .unwrap();
    let deltas: Vec<(MovementType, i32)> = movements
        .iter()
        .map(|m| (m.movement_type, m.quantity_delta))
        .collect();
    assert_eq!(movements.len(), 4);
    assert!(deltas.contains(&(MovementType::Reserved, -4)));
    assert!(deltas.contains(&(MovementType::Released, 6)));
    assert!(deltas.contains(&(MovementType::Sold, -3)));
}

#[tokio::test]
async fn concurrent_validations_sell_stock_once() {
    let file = TempDb::new();
    let app = TestApp::on_file(&file.0).await;
    let stock = app.seed_inventory(10, 0).await;
    let orders = &app.services.orders;
    let order = orders
        .create_order(order_request(
            app.user.id,
            vec![OrderItemInput::product(stock.product_id, "Harina", 4, dec!(1.5))],
        ))
        .await
        .unwrap()
        .order;
    orders
        .upload_payment_proof(order.id, app.user.id, receipt())
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        orders.validate_payment(order.id, &app.admin),
        orders.validate_payment(order.id, &app.admin),
    );
    assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);

    let after = app.inventory(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (6, 0));
    let sold = inventory_movement::Entity::find()
        .filter(inventory_movement::Column::ReferenceId.eq(order.id))
        .filter(inventory_movement::Column::MovementType.eq(MovementType::Sold))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(sold, 1);
}
