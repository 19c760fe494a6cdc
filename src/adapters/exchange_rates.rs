use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::exchange_rate;
use crate::errors::{ServiceError, ServiceResult};

/// Live currency-pair lookup used when a remittance type carries no rate.
#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    async fn get_rate(&self, from_currency: &str, to_currency: &str) -> ServiceResult<Option<Decimal>>;
}

/// Reads the newest active, already-effective row of `exchange_rates`.
#[derive(Clone)]
pub struct DbExchangeRateProvider {
    db: Arc<DbPool>,
}

impl DbExchangeRateProvider {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ExchangeRateProvider for DbExchangeRateProvider {
    async fn get_rate(&self, from_currency: &str, to_currency: &str) -> ServiceResult<Option<Decimal>> {
        if from_currency.eq_ignore_ascii_case(to_currency) {
            return Ok(Some(Decimal::ONE));
        }
        let row = exchange_rate::Entity::find()
            .filter(exchange_rate::Column::FromCurrency.eq(from_currency.to_ascii_uppercase()))
            .filter(exchange_rate::Column::ToCurrency.eq(to_currency.to_ascii_uppercase()))
            .filter(exchange_rate::Column::IsActive.eq(true))
            .filter(exchange_rate::Column::EffectiveFrom.lte(Utc::now()))
            .order_by_desc(exchange_rate::Column::EffectiveFrom)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_context("exchange_rates.lookup", None::<Uuid>))?;
        Ok(row.map(|r| r.rate).filter(|rate| *rate > Decimal::ZERO))
    }
}

/// Fixed table of rates.
#[derive(Debug, Clone, Default)]
pub struct StaticExchangeRateProvider {
    rates: HashMap<(String, String), Decimal>,
}

impl StaticExchangeRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates
            .insert((from.to_ascii_uppercase(), to.to_ascii_uppercase()), rate);
        self
    }
}

#[async_trait]
impl ExchangeRateProvider for StaticExchangeRateProvider {
    async fn get_rate(&self, from_currency: &str, to_currency: &str) -> ServiceResult<Option<Decimal>> {
        Ok(self
            .rates
            .get(&(from_currency.to_ascii_uppercase(), to_currency.to_ascii_uppercase()))
            .copied())
    }
}
