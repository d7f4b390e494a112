pub use sea_orm_migration::prelude::*;

mod m20250101_000001_create_vendors_table;
mod m20250101_000002_create_products_table;
mod m20250101_000003_create_promo_codes_table;
mod m20250101_000004_create_admin_settings_table;
mod m20250101_000005_create_orders_table;
mod m20250101_000006_create_outbox_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_vendors_table::Migration),
            Box::new(m20250101_000002_create_products_table::Migration),
            Box::new(m20250101_000003_create_promo_codes_table::Migration),
            Box::new(m20250101_000004_create_admin_settings_table::Migration),
            Box::new(m20250101_000005_create_orders_table::Migration),
            Box::new(m20250101_000006_create_outbox_table::Migration),
        ]
    }
}
