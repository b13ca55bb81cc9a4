//! SQLite-backed publication history and quota state.
//!
//! The history is an append-only log of every publication decision. The
//! quota row and the `published` records are only ever written together in
//! one transaction, so a restart never sees a count without its record.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};

use crate::error::HistoryError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS publication_history (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint  TEXT    NOT NULL,
    artifact_id  TEXT    NOT NULL,
    status       TEXT    NOT NULL CHECK (status IN
                     ('published', 'rejected_duplicate', 'rejected_quota', 'failed_permanent')),
    published_at TEXT    NOT NULL,
    date_key     TEXT    NOT NULL,
    receipt_id   TEXT,
    detail       TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_history_published_fingerprint
    ON publication_history(fingerprint) WHERE status = 'published';
CREATE INDEX IF NOT EXISTS idx_history_fingerprint ON publication_history(fingerprint);
CREATE INDEX IF NOT EXISTS idx_history_date ON publication_history(date_key, status);

CREATE TABLE IF NOT EXISTS quota_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    date_key        TEXT    NOT NULL,
    count_today     INTEGER NOT NULL DEFAULT 0,
    last_publish_at TEXT
);
"#;

const RECORD_COLUMNS: &str =
    "fingerprint, artifact_id, status, published_at, date_key, receipt_id, detail";

/// Final status of one publication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Published,
    RejectedDuplicate,
    RejectedQuota,
    FailedPermanent,
}

impl PublicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Published => "published",
            PublicationStatus::RejectedDuplicate => "rejected_duplicate",
            PublicationStatus::RejectedQuota => "rejected_quota",
            PublicationStatus::FailedPermanent => "failed_permanent",
        }
    }
}

impl std::fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationStatus {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "published" => Ok(PublicationStatus::Published),
            "rejected_duplicate" => Ok(PublicationStatus::RejectedDuplicate),
            "rejected_quota" => Ok(PublicationStatus::RejectedQuota),
            "failed_permanent" => Ok(PublicationStatus::FailedPermanent),
            other => Err(HistoryError::Corrupt(format!(
                "unknown publication status '{}'",
                other
            ))),
        }
    }
}

/// One entry of the append-only publication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub fingerprint: String,
    pub artifact_id: String,
    pub status: PublicationStatus,
    /// When the decision was made (the publish time for `Published`).
    pub published_at: DateTime<Utc>,
    pub date_key: String,
    pub receipt_id: Option<String>,
    /// Error text for failures, reason for rejections.
    pub detail: Option<String>,
}

impl PublicationRecord {
    pub fn new(
        fingerprint: impl Into<String>,
        artifact_id: impl Into<String>,
        status: PublicationStatus,
        published_at: DateTime<Utc>,
        date_key: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            artifact_id: artifact_id.into(),
            status,
            published_at,
            date_key: date_key.into(),
            receipt_id: None,
            detail: None,
        }
    }

    pub fn with_receipt(mut self, receipt_id: impl Into<String>) -> Self {
        self.receipt_id = Some(receipt_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Per-day publication counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub date_key: String,
    pub count_today: u32,
    pub last_publish_at: Option<DateTime<Utc>>,
}

impl QuotaState {
    pub fn new(date_key: impl Into<String>) -> Self {
        Self {
            date_key: date_key.into(),
            count_today: 0,
            last_publish_at: None,
        }
    }

    /// Resets the counter when `date_key` is a different day.
    /// `last_publish_at` survives the rollover so the interval still applies.
    pub fn roll_to(&mut self, date_key: &str) {
        if self.date_key != date_key {
            self.date_key = date_key.to_string();
            self.count_today = 0;
        }
    }
}

/// Durable publication history.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Opens (creating if needed) the history database at `path`.
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "Publication history opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory history, lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single long-lived connection; each new connection would be a new database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn load_quota(&self) -> Result<Option<QuotaState>, HistoryError> {
        let row = sqlx::query(
            "SELECT date_key, count_today, last_publish_at FROM quota_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(quota_from_row).transpose()
    }

    /// Fingerprints of every successfully published artifact.
    pub async fn published_fingerprints(&self) -> Result<HashSet<String>, HistoryError> {
        let rows = sqlx::query(
            "SELECT fingerprint FROM publication_history WHERE status = 'published'",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("fingerprint").map_err(HistoryError::from))
            .collect()
    }

    pub async fn is_published(&self, fingerprint: &str) -> Result<bool, HistoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM publication_history WHERE fingerprint = ?1 AND status = 'published'",
        )
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Appends a rejection or failure record.
    ///
    /// `Published` records must go through [`HistoryStore::commit_published`]
    /// so the quota moves with them.
    pub async fn append(&self, record: &PublicationRecord) -> Result<(), HistoryError> {
        if record.status == PublicationStatus::Published {
            return Err(HistoryError::Corrupt(format!(
                "published record for {} appended without a quota update",
                record.fingerprint
            )));
        }

        insert_query(record).execute(&self.pool).await?;
        tracing::debug!(
            fingerprint = %record.fingerprint,
            status = %record.status,
            "Appended publication record"
        );
        Ok(())
    }

    /// Records a successful publication and advances the quota in one
    /// transaction, returning the quota state after the commit.
    pub async fn commit_published(
        &self,
        record: &PublicationRecord,
    ) -> Result<QuotaState, HistoryError> {
        if record.status != PublicationStatus::Published {
            return Err(HistoryError::Corrupt(format!(
                "commit of non-published record with status {}",
                record.status
            )));
        }

        let mut tx = self.pool.begin().await?;

        insert_query(record).execute(&mut *tx).await?;

        sqlx::query(
            "INSERT INTO quota_state (id, date_key, count_today, last_publish_at)
            VALUES (1, ?1, 1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                count_today = CASE
                    WHEN quota_state.date_key = excluded.date_key THEN quota_state.count_today + 1
                    ELSE 1
                END,
                date_key = excluded.date_key,
                last_publish_at = excluded.last_publish_at",
        )
        .bind(&record.date_key)
        .bind(format_timestamp(record.published_at))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT date_key, count_today, last_publish_at FROM quota_state WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        let quota = quota_from_row(&row)?;

        tx.commit().await?;

        tracing::debug!(
            fingerprint = %record.fingerprint,
            date_key = %quota.date_key,
            count_today = quota.count_today,
            "Committed publication"
        );
        Ok(quota)
    }

    /// Every record in append order.
    pub async fn records(&self) -> Result<Vec<PublicationRecord>, HistoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publication_history ORDER BY seq",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn records_for(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<PublicationRecord>, HistoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publication_history WHERE fingerprint = ?1 ORDER BY seq",
            RECORD_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Number of records per status.
    pub async fn status_counts(&self) -> Result<Vec<(PublicationStatus, u64)>, HistoryError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM publication_history GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(PublicationStatus, u64), HistoryError> {
                let status: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                Ok((status.parse()?, n.max(0) as u64))
            })
            .collect()
    }

    /// Published records on `date_key` according to the log itself.
    pub async fn published_on(&self, date_key: &str) -> Result<u32, HistoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM publication_history WHERE date_key = ?1 AND status = 'published'",
        )
        .bind(date_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn insert_query(record: &PublicationRecord) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO publication_history
            (fingerprint, artifact_id, status, published_at, date_key, receipt_id, detail)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&record.fingerprint)
    .bind(&record.artifact_id)
    .bind(record.status.as_str())
    .bind(format_timestamp(record.published_at))
    .bind(&record.date_key)
    .bind(&record.receipt_id)
    .bind(&record.detail)
}

fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn quota_from_row(row: &SqliteRow) -> Result<QuotaState, HistoryError> {
    let count: i64 = row.try_get("count_today")?;
    let count_today = u32::try_from(count)
        .map_err(|_| HistoryError::Corrupt(format!("invalid quota count {}", count)))?;
    let last: Option<String> = row.try_get("last_publish_at")?;

    Ok(QuotaState {
        date_key: row.try_get("date_key")?,
        count_today,
        last_publish_at: last.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<PublicationRecord, HistoryError> {
    let status: String = row.try_get("status")?;
    let published_at: String = row.try_get("published_at")?;

    Ok(PublicationRecord {
        fingerprint: row.try_get("fingerprint")?,
        artifact_id: row.try_get("artifact_id")?,
        status: status.parse()?,
        published_at: parse_timestamp(&published_at)?,
        date_key: row.try_get("date_key")?,
        receipt_id: row.try_get("receipt_id")?,
        detail: row.try_get("detail")?,
    })
}
