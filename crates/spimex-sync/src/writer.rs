//! Per-bulletin persistence: every call to [`save_records`] is one transaction.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use spimex_core::TradingRecord;
use thiserror::Error;
use tracing::{error, info, warn};

const INSERT_TRADING_RESULT: &str = r#"
    INSERT INTO spimex_trading_results (
        exchange_product_id,
        exchange_product_name,
        oil_id,
        delivery_basis_id,
        delivery_basis_name,
        delivery_type_id,
        volume,
        total,
        "count",
        "date",
        created_on,
        updated_on
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("no open transaction")]
    NoTransaction,
    #[error("a transaction is already open")]
    TransactionOpen,
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
#[error("saving {records} records failed during {stage}: {source}")]
pub struct PersistError {
    pub records: usize,
    pub stage: &'static str,
    #[source]
    pub source: StoreError,
}

/// Transactional handle held open for a whole run.
#[async_trait]
pub trait ResultSession: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn insert(&mut self, record: &TradingRecord) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Writes one bulletin's records: all of them commit, or none do.
pub async fn save_records(
    session: &mut dyn ResultSession,
    records: &[TradingRecord],
) -> Result<usize, PersistError> {
    let fail = |stage: &'static str, source: StoreError| PersistError {
        records: records.len(),
        stage,
        source,
    };

    session.begin().await.map_err(|e| fail("begin", e))?;
    if records.is_empty() {
        info!("no rows to save, committing empty transaction");
    }

    for (index, record) in records.iter().enumerate() {
        if let Err(source) = session.insert(record).await {
            rollback_quietly(session).await;
            error!(index, product = %record.exchange_product_id, error = %source, "insert failed, bulletin rolled back");
            return Err(fail("insert", source));
        }
    }

    if let Err(source) = session.commit().await {
        rollback_quietly(session).await;
        error!(error = %source, "commit failed, bulletin rolled back");
        return Err(fail("commit", source));
    }

    info!(rows = records.len(), "bulletin committed");
    Ok(records.len())
}

async fn rollback_quietly(session: &mut dyn ResultSession) {
    if let Err(err) = session.rollback().await {
        warn!(error = %err, "rollback failed");
    }
}

/// Postgres session. A transaction is opened by `begin` and consumed by `commit`/`rollback`.
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }
}

#[async_trait]
impl ResultSession for PgSession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn insert(&mut self, record: &TradingRecord) -> Result<(), StoreError> {
        let tx = self.tx.as_mut().ok_or(StoreError::NoTransaction)?;
        sqlx::query(INSERT_TRADING_RESULT)
            .bind(&record.exchange_product_id)
            .bind(&record.exchange_product_name)
            .bind(&record.oil_id)
            .bind(&record.delivery_basis_id)
            .bind(&record.delivery_basis_name)
            .bind(&record.delivery_type_id)
            .bind(record.volume)
            .bind(record.total)
            .bind(record.count)
            .bind(record.date)
            .bind(record.created_on)
            .bind(record.updated_on)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

/// In-process session with the same commit/rollback semantics. Backs `--dry-run`.
#[derive(Debug, Default)]
pub struct MemorySession {
    committed: Vec<TradingRecord>,
    pending: Option<Vec<TradingRecord>>,
    commits: usize,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> &[TradingRecord] {
        &self.committed
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

#[async_trait]
impl ResultSession for MemorySession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.pending.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    async fn insert(&mut self, record: &TradingRecord) -> Result<(), StoreError> {
        self.pending
            .as_mut()
            .ok_or(StoreError::NoTransaction)?
            .push(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(rows) = self.pending.take() {
            self.committed.extend(rows);
            self.commits += 1;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use spimex_core::ProductCodeParts;

    fn record(product_id: &str) -> TradingRecord {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let ts = date.and_hms_opt(12, 0, 0).unwrap();
        let parts = ProductCodeParts::from_product_id(product_id);
        TradingRecord {
            exchange_product_id: product_id.to_string(),
            exchange_product_name: "Бензин (АИ-95-К5)".to_string(),
            oil_id: parts.oil_id,
            delivery_basis_id: parts.delivery_basis_id,
            delivery_basis_name: "Ангарск-группа станций".to_string(),
            delivery_type_id: parts.delivery_type_id,
            volume: 60.0,
            total: 3_600_000.0,
            count: 1,
            date,
            created_on: ts,
            updated_on: ts,
        }
    }

    /// Rejects the n-th insert (1-based) of every transaction.
    struct FlakySession {
        inner: MemorySession,
        fail_on_insert: Option<usize>,
        fail_commit: bool,
        inserts_in_tx: usize,
        rollbacks: usize,
    }

    impl FlakySession {
        fn failing_insert(n: usize) -> Self {
            Self {
                inner: MemorySession::new(),
                fail_on_insert: Some(n),
                fail_commit: false,
                inserts_in_tx: 0,
                rollbacks: 0,
            }
        }
    }

    #[async_trait]
    impl ResultSession for FlakySession {
        async fn begin(&mut self) -> Result<(), StoreError> {
            self.inserts_in_tx = 0;
            self.inner.begin().await
        }

        async fn insert(&mut self, record: &TradingRecord) -> Result<(), StoreError> {
            self.inserts_in_tx += 1;
            if self.fail_on_insert == Some(self.inserts_in_tx) {
                return Err(StoreError::Rejected(format!(
                    "constraint violated by {}",
                    record.exchange_product_id
                )));
            }
            self.inner.insert(record).await
        }

        async fn commit(&mut self) -> Result<(), StoreError> {
            if self.fail_commit {
                return Err(StoreError::Rejected("connection reset".into()));
            }
            self.inner.commit().await
        }

        async fn rollback(&mut self) -> Result<(), StoreError> {
            self.rollbacks += 1;
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn empty_batch_commits_without_rows() {
        let mut session = MemorySession::new();

        let saved = save_records(&mut session, &[]).await.unwrap();

        assert_eq!(saved, 0);
        assert_eq!(session.commits(), 1);
        assert!(session.committed().is_empty());
    }

    #[tokio::test]
    async fn batch_is_committed_once() {
        let mut session = MemorySession::new();
        let records = vec![record("A100ANK060F"), record("A592ALG060F")];

        let saved = save_records(&mut session, &records).await.unwrap();

        assert_eq!(saved, 2);
        assert_eq!(session.commits(), 1);
        assert_eq!(session.committed(), records.as_slice());
    }

    #[tokio::test]
    async fn failure_on_third_insert_rolls_back_only_that_bulletin() {
        let mut session = FlakySession::failing_insert(3);
        let first_bulletin = vec![record("A100ANK060F"), record("A100NVY060F")];
        let second_bulletin = vec![
            record("DTEZNNK060F"),
            record("DTEZSUR065F"),
            record("DTEZTKK060F"),
            record("DTEZUFM060F"),
        ];

        save_records(&mut session, &first_bulletin).await.unwrap();
        let err = save_records(&mut session, &second_bulletin).await.unwrap_err();

        assert_eq!(err.stage, "insert");
        assert_eq!(err.records, 4);
        assert_eq!(session.rollbacks, 1);
        assert_eq!(session.inner.committed(), first_bulletin.as_slice());
    }

    #[tokio::test]
    async fn commit_failure_rolls_back() {
        let mut session = FlakySession {
            fail_commit: true,
            ..FlakySession::failing_insert(usize::MAX)
        };

        let err = save_records(&mut session, &[record("A100ANK060F")]).await.unwrap_err();

        assert_eq!(err.stage, "commit");
        assert_eq!(session.rollbacks, 1);
        assert!(session.inner.committed().is_empty());
    }

    #[tokio::test]
    async fn memory_session_rejects_insert_outside_transaction() {
        let mut session = MemorySession::new();
        let err = session.insert(&record("A100ANK060F")).await.unwrap_err();
        assert!(matches!(err, StoreError::NoTransaction));
    }
}
