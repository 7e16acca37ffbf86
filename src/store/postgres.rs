use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction as DbTransaction};
use tracing::debug;
use uuid::Uuid;

use super::{DeliveryWrite, LedgerStore, SettleWrite, UserWrite, WalletChange, WalletWrite};
use crate::types::{Order, Settings, Transaction, User};

const USER_COLUMNS: &str = "id, email, name, phone, role, wallet_balance, referral_code, referred_by, created_at";
const ORDER_COLUMNS: &str = "id, user_id, network, bundle_gb, amount, phone, payment_ref, payment_status, delivery_status, payment_method, created_at";
const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, status, source, reference, created_at";

// 23505 = unique_violation
const UNIQUE_VIOLATION: &str = "23505";
const PROFILES_PKEY: &str = "profiles_pkey";
const PROFILES_EMAIL_KEY: &str = "profiles_email_key";
const PROFILES_REFERRAL_CODE_KEY: &str = "profiles_referral_code_key";

/// The production ledger store, backed by Postgres.
///
/// Conditional `UPDATE ... WHERE` statements decide every race; the row lock
/// Postgres takes for the update is held until the surrounding transaction
/// commits, so a concurrent duplicate re-evaluates the predicate and loses.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Creates the settings row if it does not exist yet.
    pub async fn seed_settings(&self, price_per_gb: Decimal) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO settings (id, price_per_gb, referrals_enabled, version) VALUES (1, $1, false, 1)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(price_per_gb)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        wallet_balance: row.try_get("wallet_balance")?,
        referral_code: row.try_get("referral_code")?,
        referred_by: row.try_get("referred_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let bundle_gb: i32 = row.try_get("bundle_gb")?;
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        network: row.try_get::<String, _>("network")?.parse()?,
        bundle_gb: u32::try_from(bundle_gb).context("negative bundle size")?,
        amount: row.try_get("amount")?,
        phone: row.try_get("phone")?,
        payment_ref: row.try_get("payment_ref")?,
        payment_status: row.try_get::<String, _>("payment_status")?.parse()?,
        delivery_status: row.try_get::<String, _>("delivery_status")?.parse()?,
        payment_method: row.try_get::<String, _>("payment_method")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: row.try_get::<String, _>("type")?.parse()?,
        amount: row.try_get("amount")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        source: row.try_get::<String, _>("source")?.parse()?,
        reference: row.try_get("reference")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_order_row(conn: &mut PgConnection, order: &Order) -> Result<()> {
    let bundle_gb = i32::try_from(order.bundle_gb).context("bundle size out of range")?;
    sqlx::query(&format!(
        "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
    ))
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.network.as_str())
    .bind(bundle_gb)
    .bind(order.amount)
    .bind(&order.phone)
    .bind(&order.payment_ref)
    .bind(order.payment_status.as_str())
    .bind(order.delivery_status.as_str())
    .bind(order.payment_method.as_str())
    .bind(order.created_at)
    .execute(conn)
    .await
    .with_context(|| format!("Failed to insert order {}", order.payment_ref))?;
    Ok(())
}

/// Returns false when an entry with the same reference already exists.
async fn insert_transaction_row(conn: &mut PgConnection, entry: &Transaction) -> Result<bool> {
    let res = sqlx::query(&format!(
        "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (reference) DO NOTHING"
    ))
    .bind(entry.id)
    .bind(entry.user_id)
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(entry.status.as_str())
    .bind(entry.source.as_str())
    .bind(&entry.reference)
    .bind(entry.created_at)
    .execute(conn)
    .await?;

    Ok(res.rows_affected() == 1)
}

async fn transaction_by_reference_in(
    conn: &mut PgConnection,
    reference: &str,
) -> Result<Option<Transaction>> {
    let row = sqlx::query(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1"
    ))
    .bind(reference)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(transaction_from_row).transpose()
}

async fn rollback(tx: DbTransaction<'_, Postgres>) -> Result<()> {
    tx.rollback().await.context("Failed to roll back")
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_user(&self, user: &User) -> Result<UserWrite> {
        let res = sqlx::query(&format!(
            "INSERT INTO profiles ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.wallet_balance)
        .bind(&user.referral_code)
        .bind(user.referred_by)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(UserWrite::Inserted),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                match db_err.constraint() {
                    Some(PROFILES_PKEY) => Ok(UserWrite::DuplicateId),
                    Some(PROFILES_EMAIL_KEY) => Ok(UserWrite::DuplicateEmail),
                    Some(PROFILES_REFERRAL_CODE_KEY) => Ok(UserWrite::DuplicateReferralCode),
                    other => Err(anyhow!(
                        "unexpected unique violation on {}",
                        other.unwrap_or("an unnamed constraint")
                    )),
                }
            }
            Err(e) => Err(anyhow!(e).context("Failed to insert profile")),
        }
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM profiles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM profiles WHERE referral_code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn apply_wallet_change(&self, change: WalletChange) -> Result<WalletWrite> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = transaction_by_reference_in(tx.as_mut(), &change.entry.reference).await? {
            rollback(tx).await?;
            return Ok(WalletWrite::DuplicateReference(existing));
        }

        let row = sqlx::query(
            r#"UPDATE profiles SET wallet_balance = wallet_balance + $2
               WHERE id = $1 AND wallet_balance = $3
               RETURNING wallet_balance"#,
        )
        .bind(change.user_id)
        .bind(change.entry.amount)
        .bind(change.expected_balance)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some(row) = row else {
            debug!(user_id = %change.user_id, "balance moved under us");
            rollback(tx).await?;
            return Ok(WalletWrite::BalanceChanged);
        };
        let balance: Decimal = row.try_get("wallet_balance")?;

        if !insert_transaction_row(tx.as_mut(), &change.entry).await? {
            rollback(tx).await?;
            let existing = self
                .transaction_by_reference(&change.entry.reference)
                .await?
                .ok_or_else(|| anyhow!("conflicting entry {} disappeared", change.entry.reference))?;
            return Ok(WalletWrite::DuplicateReference(existing));
        }

        if let Some(order) = &change.order {
            insert_order_row(tx.as_mut(), order).await?;
        }

        tx.commit().await?;
        Ok(WalletWrite::Applied { balance })
    }

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = $1 ORDER BY seq DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn transaction_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let mut conn = self.pool.acquire().await?;
        transaction_by_reference_in(&mut conn, reference).await
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_order_row(&mut conn, order).await
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn order_by_payment_ref(&self, payment_ref: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE payment_ref = $1"
        ))
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn orders(&self, user_id: Option<Uuid>) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE ($1::uuid IS NULL OR user_id = $1) ORDER BY seq DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn settle_order(&self, payment_ref: &str, entry: Transaction) -> Result<SettleWrite> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE orders SET payment_status = 'paid'
             WHERE payment_ref = $1 AND payment_status = 'pending'
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(payment_ref)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some(row) = row else {
            rollback(tx).await?;
            return Ok(match self.order_by_payment_ref(payment_ref).await? {
                Some(order) => SettleWrite::NotPending(order),
                None => SettleWrite::Missing,
            });
        };
        let order = order_from_row(&row)?;

        if !insert_transaction_row(tx.as_mut(), &entry).await? {
            rollback(tx).await?;
            return Err(anyhow!(
                "settlement entry {} already exists for a pending order",
                entry.reference
            ));
        }

        tx.commit().await?;
        Ok(SettleWrite::Settled(order))
    }

    async fn mark_delivered(&self, order_id: Uuid) -> Result<DeliveryWrite> {
        let row = sqlx::query(&format!(
            "UPDATE orders SET delivery_status = 'delivered'
             WHERE id = $1 AND payment_status = 'paid'
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(DeliveryWrite::Delivered(order_from_row(&row)?));
        }
        Ok(match self.order(order_id).await? {
            Some(order) => DeliveryWrite::NotPaid(order),
            None => DeliveryWrite::Missing,
        })
    }

    async fn settings(&self) -> Result<Settings> {
        let row = sqlx::query(
            r#"SELECT price_per_gb, referrals_enabled, version FROM settings WHERE id = 1"#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("settings row has not been seeded"))?;

        Ok(Settings {
            price_per_gb: row.try_get("price_per_gb")?,
            referrals_enabled: row.try_get("referrals_enabled")?,
            version: row.try_get("version")?,
        })
    }

    async fn replace_settings(&self, expected_version: i64, settings: &Settings) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE settings SET price_per_gb = $1, referrals_enabled = $2, version = version + 1
               WHERE id = 1 AND version = $3"#,
        )
        .bind(settings.price_per_gb)
        .bind(settings.referrals_enabled)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}
