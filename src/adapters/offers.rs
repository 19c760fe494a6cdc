use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::ServiceResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub code: String,
    /// Flat amount taken off an order subtotal or a remittance commission.
    pub discount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferValidation {
    Valid(Offer),
    Invalid { reason: String },
}

#[async_trait]
pub trait OfferResolver: Send + Sync {
    async fn validate_offer(
        &self,
        code: &str,
        subtotal: Decimal,
        user_id: Uuid,
    ) -> ServiceResult<OfferValidation>;

    async fn record_usage(&self, offer_id: Uuid, user_id: Uuid, reference_id: Uuid) -> ServiceResult<()>;
}

/// Rejects every code.
#[derive(Debug, Clone, Default)]
pub struct NoOffers;

#[async_trait]
impl OfferResolver for NoOffers {
    async fn validate_offer(
        &self,
        code: &str,
        _subtotal: Decimal,
        _user_id: Uuid,
    ) -> ServiceResult<OfferValidation> {
        Ok(OfferValidation::Invalid {
            reason: format!("offer '{code}' is not available"),
        })
    }

    async fn record_usage(&self, _offer_id: Uuid, _user_id: Uuid, _reference_id: Uuid) -> ServiceResult<()> {
        Ok(())
    }
}

/// Fixed set of codes with a minimum subtotal each.
#[derive(Debug, Clone, Default)]
pub struct StaticOffers {
    offers: HashMap<String, (Offer, Decimal)>,
}

impl StaticOffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offer(mut self, code: &str, discount: Decimal, min_subtotal: Decimal) -> Self {
        let offer = Offer {
            id: Uuid::new_v4(),
            code: code.to_ascii_uppercase(),
            discount,
        };
        self.offers.insert(offer.code.clone(), (offer, min_subtotal));
        self
    }

    pub fn offer(&self, code: &str) -> Option<&Offer> {
        self.offers.get(&code.to_ascii_uppercase()).map(|(o, _)| o)
    }
}

#[async_trait]
impl OfferResolver for StaticOffers {
    async fn validate_offer(
        &self,
        code: &str,
        subtotal: Decimal,
        _user_id: Uuid,
    ) -> ServiceResult<OfferValidation> {
        Ok(match self.offers.get(&code.trim().to_ascii_uppercase()) {
            None => OfferValidation::Invalid {
                reason: format!("offer '{code}' does not exist"),
            },
            Some((_, min)) if subtotal < *min => OfferValidation::Invalid {
                reason: format!("offer '{code}' requires a subtotal of at least {min}"),
            },
            Some((offer, _)) => OfferValidation::Valid(offer.clone()),
        })
    }

    async fn record_usage(&self, offer_id: Uuid, user_id: Uuid, reference_id: Uuid) -> ServiceResult<()> {
        tracing::info!(%offer_id, %user_id, %reference_id, "offer used");
        Ok(())
    }
}
