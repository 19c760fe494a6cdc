//! Remittance lifecycle: pricing, collection-account assignment, the payment
//! and delivery pipeline, recalculation and bank-transfer tracking.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{receipt, TempDb, TestApp};
use remitflow::{
    adapters::StaticExchangeRateProvider,
    entities::{
        bank_transfer::BankTransferStatus, collection_account, remittance_type,
        remittance_type::DeliveryMethod, RateSource, RemittanceStatus,
    },
    errors::ServiceError,
    services::remittances::{BankTransferUpdate, CreateRemittanceRequest},
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use uuid::Uuid;

fn request(user_id: Uuid, remittance_type_id: Uuid, amount: Decimal) -> CreateRemittanceRequest {
    CreateRemittanceRequest {
        user_id,
        remittance_type_id,
        amount_sent: amount,
        recipient_name: "María González".into(),
        recipient_phone: "+5352223344".into(),
        recipient_email: None,
        recipient_address: Some("Calle 23 #456".into()),
        recipient_city: Some("La Habana".into()),
        recipient_id_number: None,
        recipient_id: None,
        bank_account_id: None,
        payment_reference: None,
        offer_code: None,
        notes: None,
    }
}

#[tokio::test]
async fn create_prices_with_type_rate() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;

    let details = app
        .services
        .remittances
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap();
    let r = details.remittance;

    assert_eq!(r.status, RemittanceStatus::PaymentPending);
    assert_eq!(r.commission_total, dec!(3));
    assert_eq!(r.amount_to_deliver, dec!(2328));
    assert_eq!(r.rate_source, RateSource::Type);
    assert!(r.remittance_number.starts_with("REM-"));
    assert!(details.bank_transfers.is_empty());
    assert_eq!(r.collection_account_id, None);
}

#[tokio::test]
async fn amount_outside_limits_is_rejected() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    for amount in [dec!(9.99), dec!(1000.01)] {
        assert_matches!(
            app.services
                .remittances
                .create_remittance(request(app.user.id, rtype.id, amount))
                .await,
            Err(ServiceError::ValidationError(_))
        );
    }
}

#[tokio::test]
async fn rate_falls_back_to_provider_then_one() {
    let app = TestApp::with_collaborators(|c| {
        c.with_exchange_rates(Arc::new(
            StaticExchangeRateProvider::new().with_rate("USD", "CUP", dec!(320)),
        ))
    })
    .await;
    let rtype = app
        .seed_remittance_type(None, dec!(0), dec!(0), DeliveryMethod::Cash)
        .await;
    let quote = app
        .services
        .remittances
        .quote_remittance(rtype.id, dec!(50), None, app.user.id)
        .await
        .unwrap();
    assert_eq!(quote.rate_source, RateSource::Configured);
    assert_eq!(quote.calculation.amount_to_deliver, dec!(16000));

    let bare = TestApp::new().await;
    let rtype = bare
        .seed_remittance_type(None, dec!(0), dec!(0), DeliveryMethod::Cash)
        .await;
    let quote = bare
        .services
        .remittances
        .quote_remittance(rtype.id, dec!(50), None, bare.user.id)
        .await
        .unwrap();
    assert_eq!(quote.rate_source, RateSource::Fallback);
    assert_eq!(quote.calculation.exchange_rate, Decimal::ONE);
}

#[tokio::test]
async fn reverse_quote_matches_forward() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let quote = app
        .services
        .remittances
        .quote_amount_to_send(rtype.id, dec!(2328))
        .await
        .unwrap();
    assert_eq!(quote.calculation.amount_sent, dec!(100));
    assert_eq!(quote.calculation.amount_to_deliver, dec!(2328));
}

#[tokio::test]
async fn collection_account_with_fewest_assignments_is_used() {
    let app = TestApp::new().await;
    let busy = app.seed_collection_account("USD", 5).await;
    let idle = app.seed_collection_account("USD", 1).await;
    let other_currency = app.seed_collection_account("EUR", 0).await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;

    let r = app
        .services
        .remittances
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;
    assert_eq!(r.collection_account_id, Some(idle.id));

    let idle_after = account(&app, idle.id).await;
    assert_eq!(idle_after.assigned_count, 2);
    assert!(idle_after.last_assigned_at.is_some());
    assert_eq!(account(&app, busy.id).await.assigned_count, 5);
    assert_eq!(account(&app, other_currency.id).await.assigned_count, 0);
}

async fn account(app: &TestApp, id: Uuid) -> collection_account::Model {
    collection_account::Entity::find_by_id(id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn full_pipeline_with_rejection_and_delivery_proof() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let svc = &app.services.remittances;
    let r = svc
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;

    let uploaded = svc.upload_payment_proof(r.id, app.user.id, receipt()).await.unwrap();
    assert_eq!(uploaded.status, RemittanceStatus::PaymentProofUploaded);

    assert_matches!(
        svc.reject_payment(r.id, &app.admin, "").await,
        Err(ServiceError::ValidationError(_))
    );
    let rejected = svc.reject_payment(r.id, &app.admin, "monto incorrecto").await.unwrap();
    assert_eq!(rejected.status, RemittanceStatus::PaymentRejected);

    let again = svc.upload_payment_proof(r.id, app.user.id, receipt()).await.unwrap();
    assert_eq!(again.status, RemittanceStatus::PaymentProofUploaded);
    assert!(again.rejection_reason.is_none());

    let validated = svc.validate_payment(r.id, &app.admin).await.unwrap();
    assert_eq!(validated.validated_by, Some(app.admin.id));
    let processing = svc.start_processing(r.id, &app.admin).await.unwrap();
    assert!(processing.processing_started_at.is_some());

    assert_matches!(
        svc.confirm_delivery(r.id, &app.admin, None, None).await,
        Err(ServiceError::ValidationError(_))
    );
    let still = svc.get_remittance(r.id).await.unwrap().remittance;
    assert_eq!(still.status, RemittanceStatus::Processing);

    let delivered = svc
        .confirm_delivery(r.id, &app.admin, Some(receipt()), Some("entregado en mano".into()))
        .await
        .unwrap();
    assert_eq!(delivered.status, RemittanceStatus::Delivered);
    assert!(delivered.delivery_proof_url.is_some());
    assert_eq!(delivered.delivery_notes.as_deref(), Some("entregado en mano"));

    let completed = svc.complete_remittance(r.id, &app.admin).await.unwrap();
    assert_eq!(completed.status, RemittanceStatus::Completed);

    let history = svc.remittance_status_history(r.id).await.unwrap();
    let statuses: Vec<_> = history.iter().map(|h| h.new_status.as_str()).collect();
    assert_eq!(
        statuses,
        vec![
            "payment_pending",
            "payment_proof_uploaded",
            "payment_rejected",
            "payment_proof_uploaded",
            "payment_validated",
            "processing",
            "delivered",
            "completed",
        ]
    );
}

#[tokio::test]
async fn cancellation_follows_the_cancellable_set() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let svc = &app.services.remittances;

    let r = svc
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;
    assert_matches!(
        svc.cancel_remittance_by_user(r.id, Uuid::new_v4(), None).await,
        Err(ServiceError::Forbidden(_))
    );
    let cancelled = svc.cancel_remittance_by_user(r.id, app.user.id, None).await.unwrap();
    assert_eq!(cancelled.status, RemittanceStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let r = svc
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;
    svc.upload_payment_proof(r.id, app.user.id, receipt()).await.unwrap();
    svc.validate_payment(r.id, &app.admin).await.unwrap();
    svc.start_processing(r.id, &app.admin).await.unwrap();
    svc.confirm_delivery(r.id, &app.admin, Some(receipt()), None).await.unwrap();
    assert_matches!(
        svc.cancel_remittance(r.id, &app.admin, "tarde").await,
        Err(ServiceError::InvalidTransition { .. })
    );
}

#[tokio::test]
async fn recalculation_reprices_pending_remittances_only() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::BankTransfer)
        .await;
    let svc = &app.services.remittances;
    let mut req = request(app.user.id, rtype.id, dec!(100));
    req.bank_account_id = Some(Uuid::new_v4());
    let created = svc.create_remittance(req).await.unwrap();
    assert_eq!(created.bank_transfers.len(), 1);
    assert_eq!(created.bank_transfers[0].amount, dec!(2328));

    let mut active: remittance_type::ActiveModel = rtype.clone().into_active_model();
    active.exchange_rate = Set(Some(dec!(25)));
    active.update(&*app.db).await.unwrap();

    let id = created.remittance.id;
    let recalculated = svc
        .recalculate_remittance_at_current_rate(id, &app.admin)
        .await
        .unwrap();
    assert_eq!(recalculated.exchange_rate, dec!(25));
    assert_eq!(recalculated.amount_to_deliver, dec!(2425));
    assert!(recalculated.version > created.remittance.version);

    let transfers = svc.get_remittance(id).await.unwrap().bank_transfers;
    assert_eq!(transfers[0].amount, dec!(2425));

    svc.upload_payment_proof(id, app.user.id, receipt()).await.unwrap();
    svc.validate_payment(id, &app.admin).await.unwrap();
    assert_matches!(
        svc.recalculate_remittance_at_current_rate(id, &app.admin).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn bank_transfer_follows_its_own_table() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::BankTransfer)
        .await;
    let svc = &app.services.remittances;

    assert_matches!(
        svc.create_remittance(request(app.user.id, rtype.id, dec!(100))).await,
        Err(ServiceError::ValidationError(_))
    );

    let mut req = request(app.user.id, rtype.id, dec!(100));
    req.bank_account_id = Some(Uuid::new_v4());
    let transfer = svc.create_remittance(req).await.unwrap().bank_transfers.remove(0);
    assert_eq!(transfer.status, BankTransferStatus::Pending);
    assert_eq!(transfer.currency, "CUP");

    assert_matches!(
        svc.update_bank_transfer_status(
            transfer.id,
            BankTransferStatus::Transferred,
            &app.admin,
            BankTransferUpdate::default()
        )
        .await,
        Err(ServiceError::InvalidTransition { .. })
    );

    let confirmed = svc
        .update_bank_transfer_status(
            transfer.id,
            BankTransferStatus::Confirmed,
            &app.admin,
            BankTransferUpdate {
                transfer_reference: Some("TRX-889".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(confirmed.confirmed_at.is_some());
    assert_eq!(confirmed.transfer_reference.as_deref(), Some("TRX-889"));
    assert_eq!(confirmed.processed_by, Some(app.admin.id));

    assert_matches!(
        svc.update_bank_transfer_status(
            transfer.id,
            BankTransferStatus::Failed,
            &app.admin,
            BankTransferUpdate::default()
        )
        .await,
        Err(ServiceError::ValidationError(_))
    );
    let failed = svc
        .update_bank_transfer_status(
            transfer.id,
            BankTransferStatus::Failed,
            &app.admin,
            BankTransferUpdate {
                failure_reason: Some("cuenta cerrada".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.failure_reason.as_deref(), Some("cuenta cerrada"));
    assert_eq!(svc.get_bank_transfer(transfer.id).await.unwrap().status, BankTransferStatus::Failed);
}

#[tokio::test]
async fn inactive_type_cannot_be_used() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let mut active: remittance_type::ActiveModel = rtype.clone().into_active_model();
    active.is_active = Set(false);
    active.update(&*app.db).await.unwrap();

    assert_matches!(
        app.services
            .remittances
            .create_remittance(request(app.user.id, rtype.id, dec!(100)))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let page = app.services.remittances.my_remittances(1, 20).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn stored_amounts_follow_the_charged_commission() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(1.5), dec!(0), DeliveryMethod::Cash)
        .await;
    let r = app
        .services
        .remittances
        .create_remittance(request(app.user.id, rtype.id, dec!(10.25)))
        .await
        .unwrap()
        .remittance;

    assert_eq!(r.commission_total, dec!(0.15));
    assert_eq!(r.amount_to_deliver, dec!(242.40));
    assert_eq!(r.amount_to_deliver, (r.amount_sent - r.commission_total) * r.exchange_rate);
}

#[tokio::test]
async fn customers_cannot_run_admin_operations() {
    let app = TestApp::new().await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let svc = &app.services.remittances;
    let r = svc
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;
    svc.upload_payment_proof(r.id, app.user.id, receipt()).await.unwrap();

    assert_matches!(
        svc.validate_payment(r.id, &app.user).await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        svc.reject_payment(r.id, &app.user, "no").await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        svc.recalculate_remittance_at_current_rate(r.id, &app.user).await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        svc.cancel_remittance(r.id, &app.user, "no").await,
        Err(ServiceError::Forbidden(_))
    );

    let unchanged = svc.get_remittance(r.id).await.unwrap().remittance;
    assert_eq!(unchanged.status, RemittanceStatus::PaymentProofUploaded);
    assert!(unchanged.validated_by.is_none());
}

#[tokio::test]
async fn concurrent_validations_apply_once() {
    let file = TempDb::new();
    let app = TestApp::on_file(&file.0).await;
    let rtype = app
        .seed_remittance_type(Some(dec!(24)), dec!(2), dec!(1), DeliveryMethod::Cash)
        .await;
    let svc = &app.services.remittances;
    let r = svc
        .create_remittance(request(app.user.id, rtype.id, dec!(100)))
        .await
        .unwrap()
        .remittance;
    svc.upload_payment_proof(r.id, app.user.id, receipt()).await.unwrap();

    let (first, second) = tokio::join!(
        svc.validate_payment(r.id, &app.admin),
        svc.validate_payment(r.id, &app.admin),
    );
    assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);

    let history = svc.remittance_status_history(r.id).await.unwrap();
    let validations = history
        .iter()
        .filter(|h| h.new_status == "payment_validated")
        .count();
    assert_eq!(validations, 1);
    let stored = svc.get_remittance(r.id).await.unwrap().remittance;
    assert_eq!(stored.status, RemittanceStatus::PaymentValidated);
}
