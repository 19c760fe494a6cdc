#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use remitflow::{
    adapters::{Collaborators, CurrentUser, InMemoryObjectStorage, Role, StaticAuthContext},
    db::{self, DbPool},
    entities::{collection_account, combo_product, inventory, remittance_type},
    entities::remittance_type::DeliveryMethod,
    events::{Event, EventSender},
    services::ServiceSettings,
    validation::ProofFile,
    AppServices,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Services over a freshly migrated in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: AppServices,
    pub storage: Arc<InMemoryObjectStorage>,
    pub events: mpsc::Receiver<Event>,
    pub user: CurrentUser,
    pub admin: CurrentUser,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_collaborators(|c| c).await
    }

    /// Builds the app after letting `customize` swap collaborators.
    pub async fn with_collaborators(customize: impl FnOnce(Collaborators) -> Collaborators) -> Self {
        Self::build("sqlite::memory:", customize).await
    }

    /// Same services over a file-backed database with a real connection pool,
    /// so separate calls run on separate connections.
    pub async fn on_file(path: &std::path::Path) -> Self {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::build(&url, |c| c).await
    }

    async fn build(url: &str, customize: impl FnOnce(Collaborators) -> Collaborators) -> Self {
        let pool = db::establish_connection(url)
            .await
            .expect("connect sqlite");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let user = CurrentUser {
            id: Uuid::new_v4(),
            email: "cliente@example.com".into(),
            role: Role::Customer,
        };
        let storage = Arc::new(InMemoryObjectStorage::new(
            "https://files.example.com",
            b"test-signing-key".to_vec(),
        ));
        let collaborators = customize(
            Collaborators::local(db.clone())
                .with_auth(Arc::new(StaticAuthContext::new(user.clone())))
                .with_storage(storage.clone()),
        );

        let settings = ServiceSettings {
            side_effect_timeout: Duration::from_millis(500),
            ..ServiceSettings::default()
        };
        let (sender, events) = EventSender::channel(256);
        let services = AppServices::new(db.clone(), collaborators, settings, Some(Arc::new(sender)));

        Self {
            db,
            services,
            storage,
            events,
            user,
            admin: CurrentUser {
                id: Uuid::new_v4(),
                email: "admin@example.com".into(),
                role: Role::Admin,
            },
        }
    }

    pub async fn seed_inventory(&self, quantity: i32, reserved: i32) -> inventory::Model {
        let now = Utc::now();
        inventory::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(Uuid::new_v4()),
            sku: Set(Some(format!("SKU-{}", &Uuid::new_v4().simple().to_string()[..8]))),
            quantity: Set(quantity),
            reserved_quantity: Set(reserved),
            available_quantity: Set(quantity - reserved),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed inventory")
    }

    pub async fn seed_combo(&self, parts: &[(Uuid, i32)]) -> Uuid {
        let combo_id = Uuid::new_v4();
        for (product_id, quantity) in parts {
            combo_product::ActiveModel {
                id: Set(Uuid::new_v4()),
                combo_id: Set(combo_id),
                product_id: Set(*product_id),
                quantity: Set(*quantity),
            }
            .insert(&*self.db)
            .await
            .expect("seed combo part");
        }
        combo_id
    }

    pub async fn inventory(&self, id: Uuid) -> inventory::Model {
        inventory::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("load inventory")
            .expect("inventory row")
    }

    pub async fn seed_remittance_type(
        &self,
        exchange_rate: Option<Decimal>,
        commission_percentage: Decimal,
        commission_fixed: Decimal,
        delivery_method: DeliveryMethod,
    ) -> remittance_type::Model {
        let now = Utc::now();
        remittance_type::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("USD to CUP {delivery_method}")),
            currency_sent: Set("USD".into()),
            currency_delivered: Set("CUP".into()),
            exchange_rate: Set(exchange_rate),
            commission_percentage: Set(commission_percentage),
            commission_fixed: Set(commission_fixed),
            min_amount: Set(Decimal::from(10)),
            max_amount: Set(Decimal::from(1000)),
            delivery_method: Set(delivery_method),
            max_delivery_days: Set(Some(3)),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed remittance type")
    }

    pub async fn seed_collection_account(&self, currency: &str, assigned_count: i32) -> collection_account::Model {
        collection_account::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("{currency} account {assigned_count}")),
            bank_name: Set("Banco Metropolitano".into()),
            account_holder: Set("Remitflow SA".into()),
            account_identifier: Set(Uuid::new_v4().simple().to_string()),
            currency: Set(currency.into()),
            is_active: Set(true),
            assigned_count: Set(assigned_count),
            last_assigned_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed collection account")
    }

    /// Drains every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// A database file under the temp dir, removed on drop.
pub struct TempDb(pub std::path::PathBuf);

impl TempDb {
    pub fn new() -> Self {
        Self(std::env::temp_dir().join(format!("remitflow-{}.db", Uuid::new_v4().simple())))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let _ = std::fs::remove_file(format!("{}{}", self.0.display(), suffix));
        }
    }
}

pub fn receipt() -> ProofFile {
    ProofFile::new("image/png", b"\x89PNG receipt".to_vec())
}
