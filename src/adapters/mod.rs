//! Contracts for the services the lifecycle engine calls out to, with the
//! default implementations wired in by [`Collaborators`].

pub mod activity_log;
pub mod auth;
pub mod exchange_rates;
pub mod notifications;
pub mod offers;
pub mod payment_ledger;
pub mod storage;

use std::sync::Arc;

pub use activity_log::{ActivityEntry, ActivityLogger, LogStatus, TracingActivityLogger};
pub use auth::{AuthContext, CurrentUser, Role, StaticAuthContext};
pub use exchange_rates::{DbExchangeRateProvider, ExchangeRateProvider, StaticExchangeRateProvider};
pub use notifications::{LogNotifier, NotificationEvent, Notifier, Recipient, WebhookNotifier};
pub use offers::{NoOffers, Offer, OfferResolver, OfferValidation, StaticOffers};
pub use payment_ledger::{NoopPaymentLedger, PaymentLedger, ValidatedPayment};
pub use storage::{InMemoryObjectStorage, ObjectStorage};

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceResult;

#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthContext>,
    pub storage: Arc<dyn ObjectStorage>,
    pub activity: Arc<dyn ActivityLogger>,
    pub payment_ledger: Arc<dyn PaymentLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub exchange_rates: Arc<dyn ExchangeRateProvider>,
    pub offers: Arc<dyn OfferResolver>,
}

impl Collaborators {
    /// Local defaults: rates from the database, everything else in-process.
    pub fn local(db: Arc<DbPool>) -> Self {
        Self {
            auth: Arc::new(StaticAuthContext::anonymous()),
            storage: Arc::new(InMemoryObjectStorage::default()),
            activity: Arc::new(TracingActivityLogger),
            payment_ledger: Arc::new(NoopPaymentLedger),
            notifier: Arc::new(LogNotifier),
            exchange_rates: Arc::new(DbExchangeRateProvider::new(db)),
            offers: Arc::new(NoOffers),
        }
    }

    /// Like [`Collaborators::local`], delivering notifications to the configured webhook if any.
    pub fn from_config(cfg: &AppConfig, db: Arc<DbPool>) -> ServiceResult<Self> {
        let mut collaborators = Self::local(db);
        if let Some(url) = &cfg.notification_webhook_url {
            collaborators.notifier = Arc::new(WebhookNotifier::new(
                url.clone(),
                cfg.notification_webhook_secret.clone(),
                cfg.side_effect_timeout(),
            )?);
        }
        Ok(collaborators)
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthContext>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_activity_logger(mut self, activity: Arc<dyn ActivityLogger>) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_payment_ledger(mut self, ledger: Arc<dyn PaymentLedger>) -> Self {
        self.payment_ledger = ledger;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_exchange_rates(mut self, rates: Arc<dyn ExchangeRateProvider>) -> Self {
        self.exchange_rates = rates;
        self
    }

    pub fn with_offers(mut self, offers: Arc<dyn OfferResolver>) -> Self {
        self.offers = offers;
        self
    }
}
