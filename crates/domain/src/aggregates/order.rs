use std::borrow::Cow;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::errors::DomainError;

/// How far back `date_created` may reach.
const MAX_ORDER_AGE_MONTHS: u32 = 120;

/// Tolerated clock skew for `date_created` in the future.
const MAX_FUTURE_SKEW_HOURS: i64 = 1;

/// Order aggregate as carried on the wire and persisted in the store.
///
/// An order is created once and never mutated afterwards, so the struct is a
/// plain value: the cache hands out clones and the store rebuilds it from rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Order {
    #[validate(custom(function = "non_blank"))]
    pub order_uid: String,

    #[validate(custom(function = "non_blank"))]
    pub track_number: String,

    pub entry: String,

    #[validate(nested)]
    pub delivery: Delivery,

    #[validate(nested)]
    pub payment: Payment,

    #[validate(length(min = 1, message = "order must contain at least one item"), nested)]
    pub items: Vec<Item>,

    pub locale: String,

    #[serde(default)]
    pub internal_signature: String,

    #[validate(custom(function = "non_blank"))]
    pub customer_id: String,

    pub delivery_service: String,

    #[serde(rename = "shardkey")]
    pub shard_key: String,

    pub sm_id: i64,

    #[validate(custom(function = "within_creation_window"))]
    pub date_created: DateTime<Utc>,

    pub oof_shard: String,
}

/// Recipient metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Delivery {
    #[validate(custom(function = "non_blank"))]
    pub name: String,

    #[validate(custom(function = "non_blank"))]
    pub phone: String,

    pub zip: String,

    #[validate(custom(function = "non_blank"))]
    pub city: String,

    #[validate(custom(function = "non_blank"))]
    pub address: String,

    pub region: String,

    #[validate(contains(pattern = "@", message = "email must contain '@'"))]
    pub email: String,
}

/// Payment transaction metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Payment {
    #[validate(custom(function = "non_blank"))]
    pub transaction: String,

    pub request_id: String,

    #[validate(custom(function = "non_blank"))]
    pub currency: String,

    #[validate(custom(function = "non_blank"))]
    pub provider: String,

    #[validate(range(min = 1, message = "amount must be greater than 0"))]
    pub amount: i64,

    pub payment_dt: i64,

    pub bank: String,

    pub delivery_cost: i64,

    pub goods_total: i64,

    pub custom_fee: i64,
}

/// Order line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "consistent_total_price"))]
pub struct Item {
    pub chrt_id: i64,

    pub track_number: String,

    #[validate(range(min = 1, message = "price must be greater than 0"))]
    pub price: i64,

    pub rid: String,

    #[validate(custom(function = "non_blank"))]
    pub name: String,

    pub sale: i64,

    pub size: String,

    pub total_price: i64,

    pub nm_id: i64,

    #[validate(custom(function = "non_blank"))]
    pub brand: String,

    pub status: i64,
}

impl Order {
    /// Check every business invariant before the order may reach the store.
    pub fn ensure_valid(&self) -> Result<(), DomainError> {
        self.validate()?;
        Ok(())
    }
}

fn non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some(Cow::from("value must not be blank"));
        return Err(err);
    }
    Ok(())
}

fn within_creation_window(created: &DateTime<Utc>) -> Result<(), ValidationError> {
    let now = Utc::now();
    let oldest = now
        .checked_sub_months(Months::new(MAX_ORDER_AGE_MONTHS))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let newest = now + Duration::hours(MAX_FUTURE_SKEW_HOURS);

    if *created < oldest {
        let mut err = ValidationError::new("too_old");
        err.message = Some(Cow::from(format!("date_created too old: {}", created)));
        return Err(err);
    }
    if *created > newest {
        let mut err = ValidationError::new("in_future");
        err.message = Some(Cow::from(format!("date_created is in the future: {}", created)));
        return Err(err);
    }
    Ok(())
}

fn consistent_total_price(item: &Item) -> Result<(), ValidationError> {
    // price and sale come straight off the wire; an unrepresentable bound is invalid
    let consistent = item
        .price
        .checked_sub(item.sale)
        .is_some_and(|minimum| item.total_price >= minimum);
    if !consistent {
        let mut err = ValidationError::new("inconsistent_total_price");
        err.message = Some(Cow::from(format!(
            "total price seems inconsistent (price={}, sale={}, total={})",
            item.price, item.sale, item.total_price
        )));
        return Err(err);
    }
    Ok(())
}
