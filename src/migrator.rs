use sea_orm::{EntityTrait, Schema};
use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_inventory_tables::Migration),
            Box::new(m20240601_000002_create_order_tables::Migration),
            Box::new(m20240601_000003_create_remittance_tables::Migration),
        ]
    }
}

/// Creates the table for `entity` along with every `indexed` column's index.
async fn create_entity_table<E>(manager: &SchemaManager<'_>, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait + Copy,
{
    let schema = Schema::new(manager.get_database_backend());
    manager
        .create_table(schema.create_table_from_entity(entity).if_not_exists().to_owned())
        .await?;
    for mut index in schema.create_index_from_entity(entity) {
        manager.create_index(index.if_not_exists().to_owned()).await?;
    }
    Ok(())
}

async fn drop_entity_table<E>(manager: &SchemaManager<'_>, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    manager
        .drop_table(Table::drop().table(entity).if_exists().to_owned())
        .await
}

mod m20240601_000001_create_inventory_tables {
    use super::*;
    use crate::entities::{combo_product, inventory, inventory_movement};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_inventory_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, inventory::Entity).await?;
            create_entity_table(manager, inventory_movement::Entity).await?;
            create_entity_table(manager, combo_product::Entity).await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            drop_entity_table(manager, combo_product::Entity).await?;
            drop_entity_table(manager, inventory_movement::Entity).await?;
            drop_entity_table(manager, inventory::Entity).await
        }
    }
}

mod m20240601_000002_create_order_tables {
    use super::*;
    use crate::entities::{order, order_item, order_status_history};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, order::Entity).await?;
            create_entity_table(manager, order_item::Entity).await?;
            create_entity_table(manager, order_status_history::Entity).await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            drop_entity_table(manager, order_status_history::Entity).await?;
            drop_entity_table(manager, order_item::Entity).await?;
            drop_entity_table(manager, order::Entity).await
        }
    }
}

mod m20240601_000003_create_remittance_tables {
    use super::*;
    use crate::entities::{
        bank_transfer, collection_account, exchange_rate, remittance, remittance_status_history,
        remittance_type,
    };

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_remittance_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_entity_table(manager, remittance_type::Entity).await?;
            create_entity_table(manager, collection_account::Entity).await?;
            create_entity_table(manager, exchange_rate::Entity).await?;
            create_entity_table(manager, remittance::Entity).await?;
            create_entity_table(manager, remittance_status_history::Entity).await?;
            create_entity_table(manager, bank_transfer::Entity).await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            drop_entity_table(manager, bank_transfer::Entity).await?;
            drop_entity_table(manager, remittance_status_history::Entity).await?;
            drop_entity_table(manager, remittance::Entity).await?;
            drop_entity_table(manager, exchange_rate::Entity).await?;
            drop_entity_table(manager, collection_account::Entity).await?;
            drop_entity_table(manager, remittance_type::Entity).await
        }
    }
}
