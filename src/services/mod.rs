// Lifecycle services
pub mod orders;
pub mod remittances;

// Building blocks shared by the lifecycle services
pub mod inventory;
pub mod numbering;
pub mod remittance_calculator;
pub mod side_effects;
pub mod transitions;

use std::time::Duration;

use crate::config::AppConfig;
use crate::errors::Locale;

/// Tunables the lifecycle services read from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub side_effect_timeout: Duration,
    pub max_proof_size_bytes: usize,
    pub payment_proof_bucket: String,
    pub delivery_proof_bucket: String,
    pub signed_url_ttl: Duration,
    pub default_locale: Locale,
    pub number_max_attempts: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            side_effect_timeout: Duration::from_millis(5_000),
            max_proof_size_bytes: 5 * 1024 * 1024,
            payment_proof_bucket: "payment-proofs".to_string(),
            delivery_proof_bucket: "delivery-proofs".to_string(),
            signed_url_ttl: Duration::from_secs(3_600),
            default_locale: Locale::Es,
            number_max_attempts: 3,
        }
    }
}

impl From<&AppConfig> for ServiceSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            side_effect_timeout: cfg.side_effect_timeout(),
            max_proof_size_bytes: cfg.max_proof_size_bytes,
            payment_proof_bucket: cfg.payment_proof_bucket.clone(),
            delivery_proof_bucket: cfg.delivery_proof_bucket.clone(),
            signed_url_ttl: Duration::from_secs(cfg.signed_url_ttl_secs),
            default_locale: cfg.default_locale(),
            number_max_attempts: cfg.order_number_max_attempts,
        }
    }
}
