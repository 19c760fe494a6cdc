pub mod bank_transfer;
pub mod collection_account;
pub mod combo_product;
pub mod exchange_rate;
pub mod inventory;
pub mod inventory_movement;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod remittance;
pub mod remittance_status_history;
pub mod remittance_type;

pub use order::{OrderStatus, PaymentStatus};
pub use remittance::{RateSource, RemittanceStatus};
