//! Exchange and commission arithmetic for remittances.
//!
//! Commission and delivered amounts are rounded to cents (midpoint away from
//! zero). The delivered amount is derived from the rounded commission, so a
//! stored row always satisfies
//! `amount_to_deliver == round((amount_sent - commission_total) * exchange_rate)`.
//! A reverse quote therefore round-trips to within half a cent of commission
//! times the rate, plus a cent.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::entities::remittance::RateSource;
use crate::errors::{ServiceError, ServiceResult};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Fee schedule and rate applied to a remittance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub exchange_rate: Decimal,
    /// Percent of the sent amount, e.g. `2` for 2%.
    pub commission_percentage: Decimal,
    pub commission_fixed: Decimal,
    pub offer_discount: Decimal,
}

impl Pricing {
    fn validate(&self) -> ServiceResult<()> {
        if self.exchange_rate <= Decimal::ZERO {
            return Err(ServiceError::validation("exchange rate must be greater than zero"));
        }
        if self.commission_percentage < Decimal::ZERO || self.commission_percentage >= HUNDRED {
            return Err(ServiceError::validation(
                "commission percentage must be at least 0 and below 100",
            ));
        }
        if self.commission_fixed < Decimal::ZERO {
            return Err(ServiceError::validation("fixed commission must not be negative"));
        }
        if self.offer_discount < Decimal::ZERO {
            return Err(ServiceError::validation("offer discount must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calculation {
    pub amount_sent: Decimal,
    pub exchange_rate: Decimal,
    pub commission_percentage: Decimal,
    pub commission_fixed: Decimal,
    /// Commission before any offer discount.
    pub gross_commission: Decimal,
    pub offer_discount: Decimal,
    /// Commission actually charged: `max(0, gross - discount)`.
    pub commission_total: Decimal,
    pub amount_to_deliver: Decimal,
}

/// Forward calculation: what the recipient gets for `amount`.
pub fn calculate(amount: Decimal, pricing: &Pricing) -> ServiceResult<Calculation> {
    pricing.validate()?;
    if amount <= Decimal::ZERO {
        return Err(ServiceError::validation("amount must be greater than zero"));
    }

    let gross = amount * pricing.commission_percentage / HUNDRED + pricing.commission_fixed;
    let commission_total = round_money((gross - pricing.offer_discount).max(Decimal::ZERO));
    if commission_total >= amount {
        return Err(ServiceError::validation(format!(
            "commission {} leaves nothing to deliver from {}",
            commission_total, amount
        )));
    }

    Ok(Calculation {
        amount_sent: amount,
        exchange_rate: pricing.exchange_rate,
        commission_percentage: pricing.commission_percentage,
        commission_fixed: pricing.commission_fixed,
        gross_commission: round_money(gross),
        offer_discount: pricing.offer_discount,
        commission_total,
        amount_to_deliver: round_money((amount - commission_total) * pricing.exchange_rate),
    })
}

/// Reverse calculation: the amount to send so the recipient gets `amount_to_deliver`.
///
/// The result is not rounded; callers that need a payable figure round it up.
pub fn amount_to_send(amount_to_deliver: Decimal, pricing: &Pricing) -> ServiceResult<Decimal> {
    pricing.validate()?;
    if amount_to_deliver <= Decimal::ZERO {
        return Err(ServiceError::validation(
            "amount to deliver must be greater than zero",
        ));
    }

    let net = amount_to_deliver / pricing.exchange_rate;
    let keep = Decimal::ONE - pricing.commission_percentage / HUNDRED;
    let amount = (net + pricing.commission_fixed - pricing.offer_discount) / keep;

    // A discount larger than the commission zeroes it, so the sender pays only the net.
    let gross = amount * pricing.commission_percentage / HUNDRED + pricing.commission_fixed;
    if gross < pricing.offer_discount {
        return Ok(net);
    }
    Ok(amount)
}

/// Resolution order for the rate applied to a remittance.
pub fn resolve_rate(
    type_rate: Option<Decimal>,
    configured: Option<Decimal>,
) -> (Decimal, RateSource) {
    if let Some(rate) = type_rate.filter(|r| *r > Decimal::ZERO) {
        return (rate, RateSource::Type);
    }
    if let Some(rate) = configured.filter(|r| *r > Decimal::ZERO) {
        return (rate, RateSource::Configured);
    }
    tracing::warn!("no exchange rate configured; falling back to 1");
    (Decimal::ONE, RateSource::Fallback)
}
