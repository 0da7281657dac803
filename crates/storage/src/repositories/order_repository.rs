use std::time::Instant;

use async_trait::async_trait;
use common::metrics;
use domain::{Delivery, Item, Order, Payment};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::StorageError;

const UNIQUE_VIOLATION: &str = "23505";

/// Durable order store
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist an order with its delivery, payment and items atomically.
    async fn create_order(&self, order: &Order) -> Result<String, StorageError>;

    /// Load a single order; `StorageError::NotFound` if it does not exist.
    async fn get_order_by_id(&self, order_uid: &str) -> Result<Order, StorageError>;

    /// Load every order, used for cache warm-up.
    async fn get_all_orders(&self) -> Result<Vec<Order>, StorageError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StorageError>;
}

/// PostgreSQL implementation of OrderRepository
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_order(
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                order_uid, track_number, entry, locale, internal_signature,
                customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&order.order_uid)
        .bind(&order.track_number)
        .bind(&order.entry)
        .bind(&order.locale)
        .bind(&order.internal_signature)
        .bind(&order.customer_id)
        .bind(&order.delivery_service)
        .bind(&order.shard_key)
        .bind(order.sm_id)
        .bind(order.date_created)
        .bind(&order.oof_shard)
        .execute(&mut **tx)
        .await?;

        let delivery = &order.delivery;
        sqlx::query(
            r#"
            INSERT INTO deliveries (order_uid, name, phone, zip, city, address, region, email)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&order.order_uid)
        .bind(&delivery.name)
        .bind(&delivery.phone)
        .bind(&delivery.zip)
        .bind(&delivery.city)
        .bind(&delivery.address)
        .bind(&delivery.region)
        .bind(&delivery.email)
        .execute(&mut **tx)
        .await?;

        let payment = &order.payment;
        sqlx::query(
            r#"
            INSERT INTO payments (
                order_uid, transaction, request_id, currency, provider,
                amount, payment_dt, bank, delivery_cost, goods_total, custom_fee
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&order.order_uid)
        .bind(&payment.transaction)
        .bind(&payment.request_id)
        .bind(&payment.currency)
        .bind(&payment.provider)
        .bind(payment.amount)
        .bind(payment.payment_dt)
        .bind(&payment.bank)
        .bind(payment.delivery_cost)
        .bind(payment.goods_total)
        .bind(payment.custom_fee)
        .execute(&mut **tx)
        .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO items (
                    order_uid, chrt_id, track_number, price, rid,
                    name, sale, size, total_price, nm_id, brand, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(&order.order_uid)
            .bind(item.chrt_id)
            .bind(&item.track_number)
            .bind(item.price)
            .bind(&item.rid)
            .bind(&item.name)
            .bind(item.sale)
            .bind(&item.size)
            .bind(item.total_price)
            .bind(item.nm_id)
            .bind(&item.brand)
            .bind(item.status)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn fetch_order(&self, order_uid: &str) -> Result<Order, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT order_uid, track_number, entry, locale, internal_signature,
                   customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard
            FROM orders
            WHERE order_uid = $1
            "#,
        )
        .bind(order_uid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(order_uid.to_string()))?;

        let delivery_row = sqlx::query(
            r#"
            SELECT name, phone, zip, city, address, region, email
            FROM deliveries
            WHERE order_uid = $1
            "#,
        )
        .bind(order_uid)
        .fetch_one(&self.pool)
        .await?;

        let payment_row = sqlx::query(
            r#"
            SELECT transaction, request_id, currency, provider, amount,
                   payment_dt, bank, delivery_cost, goods_total, custom_fee
            FROM payments
            WHERE order_uid = $1
            "#,
        )
        .bind(order_uid)
        .fetch_one(&self.pool)
        .await?;

        let item_rows = sqlx::query(
            r#"
            SELECT chrt_id, track_number, price, rid, name,
                   sale, size, total_price, nm_id, brand, status
            FROM items
            WHERE order_uid = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_uid)
        .fetch_all(&self.pool)
        .await?;

        let items = item_rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(order_from_row(
            &row,
            delivery_from_row(&delivery_row)?,
            payment_from_row(&payment_row)?,
            items,
        )?)
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn create_order(&self, order: &Order) -> Result<String, StorageError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        // Dropping `tx` on the error path rolls the whole order back.
        let result = match Self::insert_order(&mut tx, order).await {
            Ok(()) => tx.commit().await.map_err(StorageError::from),
            Err(e) => Err(map_insert_error(&order.order_uid, e)),
        };

        metrics::record_store_operation(
            "create_order",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result?;

        info!(
            order_uid = %order.order_uid,
            items = order.items.len(),
            "Order persisted"
        );
        Ok(order.order_uid.clone())
    }

    async fn get_order_by_id(&self, order_uid: &str) -> Result<Order, StorageError> {
        let started = Instant::now();
        debug!(order_uid, "Loading order from database");

        let result = self.fetch_order(order_uid).await;

        metrics::record_store_operation(
            "get_order_by_id",
            result.is_ok() || matches!(result, Err(StorageError::NotFound(_))),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn get_all_orders(&self) -> Result<Vec<Order>, StorageError> {
        let started = Instant::now();

        let rows = sqlx::query(
            r#"
            SELECT
                o.order_uid, o.track_number, o.entry, o.locale, o.internal_signature,
                o.customer_id, o.delivery_service, o.shardkey, o.sm_id, o.date_created, o.oof_shard,
                row_to_json(d.*) AS delivery,
                row_to_json(p.*) AS payment,
                COALESCE(
                    json_agg(i.* ORDER BY i.id) FILTER (WHERE i.chrt_id IS NOT NULL),
                    '[]'
                ) AS items
            FROM orders o
            JOIN deliveries d ON o.order_uid = d.order_uid
            JOIN payments   p ON o.order_uid = p.order_uid
            LEFT JOIN items i ON o.order_uid = i.order_uid
            GROUP BY o.order_uid, d.order_uid, p.order_uid
            "#,
        )
        .fetch_all(&self.pool)
        .await;

        let orders = rows.map_err(StorageError::from).and_then(|rows| {
            rows.iter()
                .map(|row| -> Result<Order, StorageError> {
                    let Json(delivery): Json<Delivery> = row.try_get("delivery")?;
                    let Json(payment): Json<Payment> = row.try_get("payment")?;
                    let Json(items): Json<Vec<Item>> = row.try_get("items")?;
                    Ok(order_from_row(row, delivery, payment, items)?)
                })
                .collect::<Result<Vec<_>, StorageError>>()
        });

        metrics::record_store_operation(
            "get_all_orders",
            orders.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        let orders = orders?;
        info!(count = orders.len(), "Loaded all orders from database");
        Ok(orders)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn map_insert_error(order_uid: &str, err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StorageError::Conflict(order_uid.to_string());
        }
    }
    StorageError::from(err)
}

fn order_from_row(
    row: &PgRow,
    delivery: Delivery,
    payment: Payment,
    items: Vec<Item>,
) -> Result<Order, sqlx::Error> {
    Ok(Order {
        order_uid: row.try_get("order_uid")?,
        track_number: row.try_get("track_number")?,
        entry: row.try_get("entry")?,
        delivery,
        payment,
        items,
        locale: row.try_get("locale")?,
        internal_signature: row.try_get("internal_signature")?,
        customer_id: row.try_get("customer_id")?,
        delivery_service: row.try_get("delivery_service")?,
        shard_key: row.try_get("shardkey")?,
        sm_id: row.try_get("sm_id")?,
        date_created: row.try_get("date_created")?,
        oof_shard: row.try_get("oof_shard")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<Delivery, sqlx::Error> {
    Ok(Delivery {
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        zip: row.try_get("zip")?,
        city: row.try_get("city")?,
        address: row.try_get("address")?,
        region: row.try_get("region")?,
        email: row.try_get("email")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        transaction: row.try_get("transaction")?,
        request_id: row.try_get("request_id")?,
        currency: row.try_get("currency")?,
        provider: row.try_get("provider")?,
        amount: row.try_get("amount")?,
        payment_dt: row.try_get("payment_dt")?,
        bank: row.try_get("bank")?,
        delivery_cost: row.try_get("delivery_cost")?,
        goods_total: row.try_get("goods_total")?,
        custom_fee: row.try_get("custom_fee")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, sqlx::Error> {
    Ok(Item {
        chrt_id: row.try_get("chrt_id")?,
        track_number: row.try_get("track_number")?,
        price: row.try_get("price")?,
        rid: row.try_get("rid")?,
        name: row.try_get("name")?,
        sale: row.try_get("sale")?,
        size: row.try_get("size")?,
        total_price: row.try_get("total_price")?,
        nm_id: row.try_get("nm_id")?,
        brand: row.try_get("brand")?,
        status: row.try_get("status")?,
    })
}
