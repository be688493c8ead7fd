//! PostgreSQL ledger store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use tokio::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

use bankcore_common::{
    AccountId, BankError, Currency, EntryId, OwnerId, Result, TransferId,
};

use crate::account::Account;
use crate::config::DatabaseConfig;
use crate::journal::{EntryStatus, EntryType, LedgerEntry, TransferLegs};
use crate::store::{lock_order, LedgerStore};

const ACCOUNT_COLUMNS: &str = "id, owner_id, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, type, status, transfer_id, created_at";

/// Row of the `accounts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub owner_id: i64,
    pub balance: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = BankError;

    fn try_from(row: AccountRow) -> Result<Self> {
        let currency: Currency = row
            .currency
            .parse()
            .map_err(|e| BankError::Storage(format!("corrupt account {}: {e}", row.id)))?;

        Ok(Account {
            id: AccountId::from_uuid(row.id),
            owner_id: OwnerId::new(row.owner_id),
            balance: row.balance,
            currency,
            created_at: row.created_at,
        })
    }
}

/// Row of the `transactions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: Decimal,
    #[sqlx(rename = "type")]
    pub entry_type: String,
    pub status: String,
    pub transfer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = BankError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let corrupt = |e: String| BankError::Storage(format!("corrupt entry {}: {e}", row.id));
        let entry_type: EntryType = row.entry_type.parse().map_err(corrupt)?;
        let status: EntryStatus = row.status.parse().map_err(corrupt)?;

        Ok(LedgerEntry {
            id: EntryId::from_uuid(row.id),
            account_id: AccountId::from_uuid(row.account_id),
            amount: row.amount,
            entry_type,
            status,
            transfer_id: row.transfer_id.map(TransferId::from_uuid),
            created_at: row.created_at,
        })
    }
}

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

fn storage_error(error: sqlx::Error) -> BankError {
    match error {
        sqlx::Error::PoolTimedOut => {
            BankError::StorageTimeout("acquiring database connection".to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            BankError::StorageTimeout(db.message().to_string())
        }
        other => BankError::Storage(other.to_string()),
    }
}

/// Run the work before a commit under the store deadline, if one is set.
///
/// On expiry `work` is dropped; the open transaction rolls back when its
/// handle is dropped by the caller.
async fn before_commit<T, F>(
    deadline: Option<Instant>,
    operation: &'static str,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, work).await.map_err(|_| {
            BankError::StorageTimeout(format!("{operation} did not reach commit in time"))
        })?,
        None => work.await,
    }
}

fn into_accounts(rows: Vec<AccountRow>) -> Result<Vec<Account>> {
    rows.into_iter().map(Account::try_from).collect()
}

fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<LedgerEntry>> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

/// Ledger store backed by a PostgreSQL pool.
///
/// Balance guards are conditional `UPDATE ... RETURNING` statements, so the
/// sufficiency check and the write are one statement. Transfers lock both
/// rows with `SELECT ... FOR UPDATE` in [`lock_order`] inside one transaction.
///
/// Every write runs in an explicit transaction. With a commit deadline set,
/// only the statements before `COMMIT` are bounded; a commit that has been
/// sent always runs to completion.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    commit_deadline: Option<Duration>,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            commit_deadline: None,
        }
    }

    /// Bound the work before each commit by `limit`.
    pub fn with_commit_deadline(mut self, limit: Duration) -> Self {
        self.commit_deadline = Some(limit);
        self
    }

    /// Open a pool using `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(url = %config.masked_url(), "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url)
            .await
            .map_err(storage_error)?;

        info!("Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BankError::Storage(format!("migration failed: {e}")))?;
        info!("Ledger schema up to date");
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.commit_deadline.map(|limit| Instant::now() + limit)
    }

    async fn begin(
        &self,
        deadline: Option<Instant>,
        operation: &'static str,
    ) -> Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        before_commit(deadline, operation, async {
            self.pool.begin().await.map_err(storage_error)
        })
        .await
    }

    async fn guarded_delta(
        conn: &mut PgConnection,
        id: AccountId,
        delta: Decimal,
    ) -> Result<Decimal> {
        let updated = sqlx::query_scalar::<_, Decimal>(
            "UPDATE accounts SET balance = balance + $1 \
             WHERE id = $2 AND balance + $1 >= 0 \
             RETURNING balance",
        )
        .bind(delta)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;

        if let Some(balance) = updated {
            return Ok(balance);
        }

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&mut *conn)
                .await
                .map_err(storage_error)?;

        if exists {
            Err(BankError::InsufficientFunds {
                account_id: id,
                requested: delta.abs(),
            })
        } else {
            Err(BankError::AccountNotFound(id))
        }
    }

    async fn move_funds(
        conn: &mut PgConnection,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<()> {
        let (first, second) = lock_order(from, to);
        for id in [first, second] {
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *conn)
                .await
                .map_err(storage_error)?
                .ok_or(BankError::AccountNotFound(id))?;
        }

        sqlx::query_scalar::<_, Decimal>(
            "UPDATE accounts SET balance = balance - $1 \
             WHERE id = $2 AND balance >= $1 \
             RETURNING balance",
        )
        .bind(amount)
        .bind(from.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?
        .ok_or(BankError::InsufficientFunds {
            account_id: from,
            requested: amount,
        })?;

        sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
            .bind(amount)
            .bind(to.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn insert_entry<'c, E>(executor: E, entry: &LedgerEntry) -> Result<LedgerEntry>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "INSERT INTO transactions ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(entry.id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.status.as_str())
        .bind(entry.transfer_id.map(|id| *id.as_uuid()))
        .bind(entry.created_at)
        .fetch_one(executor)
        .await
        .map_err(storage_error)?;

        LedgerEntry::try_from(row)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn commit_deadline(&self) -> Option<Duration> {
        self.commit_deadline
    }

    #[instrument(skip(self))]
    async fn create_account(&self, owner_id: OwnerId, currency: Currency) -> Result<Account> {
        let account = Account::open(owner_id, currency);
        let deadline = self.deadline();
        let mut tx = self.begin(deadline, "create_account").await?;

        let row = before_commit(deadline, "create_account", async {
            sqlx::query_as::<_, AccountRow>(&format!(
                "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
                 RETURNING {ACCOUNT_COLUMNS}"
            ))
            .bind(account.id.as_uuid())
            .bind(owner_id.value())
            .bind(account.balance)
            .bind(currency.code())
            .bind(account.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_error)
        })
        .await?;

        tx.commit().await.map_err(storage_error)?;
        Account::try_from(row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or(BankError::AccountNotFound(id))
        .and_then(Account::try_from)
    }

    async fn accounts_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = $1 ORDER BY id"
        ))
        .bind(owner_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        into_accounts(rows)
    }

    #[instrument(skip(self))]
    async fn adjust_balance(&self, id: AccountId, delta: Decimal) -> Result<Decimal> {
        let deadline = self.deadline();
        let mut tx = self.begin(deadline, "adjust_balance").await?;

        let balance =
            before_commit(deadline, "adjust_balance", Self::guarded_delta(&mut tx, id, delta))
                .await?;

        tx.commit().await.map_err(storage_error)?;
        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn adjust_balance_with_entry(
        &self,
        id: AccountId,
        delta: Decimal,
    ) -> Result<(Decimal, LedgerEntry)> {
        if delta.is_zero() {
            return Err(BankError::InvalidAmount);
        }

        let deadline = self.deadline();
        // Dropping `tx` on any early return rolls back the balance change.
        let mut tx = self.begin(deadline, "adjust_balance_with_entry").await?;

        let recorded = before_commit(deadline, "adjust_balance_with_entry", async {
            let balance = Self::guarded_delta(&mut tx, id, delta).await?;
            let entry = Self::insert_entry(&mut *tx, &LedgerEntry::for_delta(id, delta)).await?;
            Ok::<_, BankError>((balance, entry))
        })
        .await?;

        tx.commit().await.map_err(storage_error)?;
        Ok(recorded)
    }

    #[instrument(skip(self))]
    async fn transfer_atomic(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    ) -> Result<()> {
        if from == to {
            return Err(BankError::SameAccount(from));
        }
        if amount <= Decimal::ZERO {
            return Err(BankError::NonPositiveAmount(amount));
        }

        let deadline = self.deadline();
        // Dropping `tx` on any early return rolls the transaction back.
        let mut tx = self.begin(deadline, "transfer_atomic").await?;

        before_commit(
            deadline,
            "transfer_atomic",
            Self::move_funds(&mut tx, from, to, amount),
        )
        .await?;

        tx.commit().await.map_err(storage_error)
    }

    async fn append_entry(
        &self,
        account_id: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        status: EntryStatus,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(BankError::NonPositiveAmount(amount));
        }

        let entry = LedgerEntry::new(account_id, amount, entry_type, status);
        let deadline = self.deadline();
        let mut tx = self.begin(deadline, "append_entry").await?;

        let entry = before_commit(
            deadline,
            "append_entry",
            Self::insert_entry(&mut *tx, &entry),
        )
        .await?;

        tx.commit().await.map_err(storage_error)?;
        Ok(entry)
    }

    async fn append_transfer_legs(&self, legs: TransferLegs) -> Result<[LedgerEntry; 2]> {
        debug_assert!(legs.is_balanced());
        let deadline = self.deadline();
        let mut tx = self.begin(deadline, "append_transfer_legs").await?;

        let entries = before_commit(deadline, "append_transfer_legs", async {
            let debit = Self::insert_entry(&mut *tx, legs.debit()).await?;
            let credit = Self::insert_entry(&mut *tx, legs.credit()).await?;
            Ok::<_, BankError>([debit, credit])
        })
        .await?;

        tx.commit().await.map_err(storage_error)?;
        Ok(entries)
    }

    async fn entries_by_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(account_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        into_entries(rows)
    }

    async fn entries_by_owner(&self, owner_id: OwnerId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT t.id, t.account_id, t.amount, t.type, t.status, t.transfer_id, t.created_at \
             FROM transactions t \
             JOIN accounts a ON t.account_id = a.id \
             WHERE a.owner_id = $1 \
             ORDER BY t.created_at DESC, t.id DESC",
        )
        .bind(owner_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        into_entries(rows)
    }
}
