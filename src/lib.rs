//! remitflow
//!
//! Order and remittance lifecycle engine: status state machines, an inventory
//! reservation ledger and payment-proof validation on top of a relational store.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod adapters;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;
pub mod validation;

use std::sync::Arc;
use tracing::info;

use crate::adapters::Collaborators;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceResult;
use crate::events::EventSender;
use crate::services::{orders::OrderService, remittances::RemittanceService, ServiceSettings};

/// The lifecycle services sharing one pool, collaborator bundle and event channel.
#[derive(Clone)]
pub struct AppServices {
    pub db: Arc<DbPool>,
    pub orders: OrderService,
    pub remittances: RemittanceService,
    pub event_sender: Option<Arc<EventSender>>,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        collaborators: Collaborators,
        settings: ServiceSettings,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            orders: OrderService::new(
                db.clone(),
                collaborators.clone(),
                settings.clone(),
                event_sender.clone(),
            ),
            remittances: RemittanceService::new(db.clone(), collaborators, settings, event_sender.clone()),
            db,
            event_sender,
        }
    }

    /// Connects, migrates when `auto_migrate` is set, builds the collaborators
    /// named in `cfg` and starts the event logging task.
    pub async fn bootstrap(cfg: &AppConfig) -> ServiceResult<Self> {
        let db = Arc::new(db::establish_connection_from_app_config(cfg).await?);
        let collaborators = Collaborators::from_config(cfg, db.clone())?;
        let (sender, rx) = EventSender::channel(cfg.event_channel_capacity);
        tokio::spawn(events::process_events(rx));
        info!(environment = %cfg.environment, "remitflow services ready");
        Ok(Self::new(db, collaborators, ServiceSettings::from(cfg), Some(Arc::new(sender))))
    }
}

pub mod prelude {
    pub use crate::adapters::*;
    pub use crate::entities::{OrderStatus, PaymentStatus, RateSource, RemittanceStatus};
    pub use crate::errors::*;
    pub use crate::events::{Event, EventSender};
    pub use crate::services::orders::{CreateOrderRequest, OrderItemInput, OrderService};
    pub use crate::services::remittances::{CreateRemittanceRequest, RemittanceService};
    pub use crate::services::transitions::StateMachine;
    pub use crate::services::ServiceSettings;
    pub use crate::AppServices;
}
