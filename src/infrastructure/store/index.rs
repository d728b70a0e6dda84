//! Rebuildable SQLite secondary index: market data, memory lookup, and
//! chat history. Grounded on `core/data/store.py`'s three tables, ported
//! to `sqlx` (the teacher's existing SQLite stack) rather than the raw
//! `sqlite3` stdlib module the original uses. The index is a strict
//! projection of the files under `Store::home` and can always be
//! rebuilt by re-scanning them; nothing here is the source of truth.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::domain::ports::MarketRow;

#[derive(Clone)]
pub struct Index {
    pool: SqlitePool,
}

impl Index {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to index database")?;

        let index = Self { pool };
        index.init().await?;
        Ok(index)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_data (
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                available_at TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                source TEXT NOT NULL,
                data_type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (ticker, timestamp, source)
            );
            CREATE INDEX IF NOT EXISTS idx_market_data_ticker_available
                ON market_data (ticker, available_at);

            CREATE TABLE IF NOT EXISTS memory_index (
                id TEXT PRIMARY KEY,
                ticker TEXT,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_ticker ON memory_index (ticker);
            CREATE INDEX IF NOT EXISTS idx_memory_created_at ON memory_index (created_at);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                extras TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conv_channel_created
                ON conversation_messages (channel_id, created_at, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to initialize index schema")?;

        info!("secondary index schema initialized");
        Ok(())
    }

    pub async fn save_market_row(&self, row: &MarketRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_data
                (ticker, timestamp, available_at, open, high, low, close, volume, source, data_type, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticker, timestamp, source) DO UPDATE SET
                available_at = excluded.available_at,
                open = excluded.open, high = excluded.high, low = excluded.low,
                close = excluded.close, volume = excluded.volume,
                data_type = excluded.data_type, metadata = excluded.metadata
            "#,
        )
        .bind(&row.ticker)
        .bind(row.timestamp.to_rfc3339())
        .bind(row.available_at.to_rfc3339())
        .bind(row.open.to_string())
        .bind(row.high.to_string())
        .bind(row.low.to_string())
        .bind(row.close.to_string())
        .bind(row.volume.to_string())
        .bind(&row.source)
        .bind(&row.data_type)
        .bind(row.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("failed to upsert market row")?;
        Ok(())
    }

    /// Filters `available_at <= as_of` when given; newest first.
    pub async fn query_market(
        &self,
        ticker: &str,
        as_of: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<MarketRow>> {
        let rows: Vec<(String, String, String, String, String, String, String, String, String, String, String)> =
            if let Some(as_of) = as_of {
                sqlx::query_as(
                    r#"
                    SELECT ticker, timestamp, available_at, open, high, low, close, volume, source, data_type, metadata
                    FROM market_data
                    WHERE ticker = ? AND available_at <= ?
                    ORDER BY timestamp DESC
                    LIMIT ?
                    "#,
                )
                .bind(ticker)
                .bind(as_of.to_rfc3339())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            } else {
                sqlx::query_as(
                    r#"
                    SELECT ticker, timestamp, available_at, open, high, low, close, volume, source, data_type, metadata
                    FROM market_data
                    WHERE ticker = ?
                    ORDER BY timestamp DESC
                    LIMIT ?
                    "#,
                )
                .bind(ticker)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            };

        rows.into_iter()
            .map(|r| row_to_market_row(r))
            .collect::<Result<Vec<_>>>()
    }

    pub async fn latest_price(&self, ticker: &str, as_of: Option<DateTime<Utc>>) -> Result<Option<Decimal>> {
        let rows = self.query_market(ticker, as_of, 1).await?;
        Ok(rows.into_iter().next().map(|r| r.close))
    }

    pub async fn index_memory(&self, id: &str, ticker: Option<&str>, tags: &[String], created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_index (id, ticker, tags, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET ticker = excluded.ticker, tags = excluded.tags, created_at = excluded.created_at
            "#,
        )
        .bind(id)
        .bind(ticker)
        .bind(serde_json::to_string(tags)?)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn search_memories(
        &self,
        ticker: Option<&str>,
        tags: Option<&[String]>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT id, tags, created_at FROM memory_index WHERE 1=1");
        if ticker.is_some() {
            sql.push_str(" AND ticker = ?");
        }
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, (String, String, String)>(&sql);
        if let Some(t) = ticker {
            query = query.bind(t);
        }
        if let Some(s) = since {
            query = query.bind(s.to_rfc3339());
        }
        query = query.bind(limit.max(200));

        let rows = query.fetch_all(&self.pool).await?;

        let filtered: Vec<String> = rows
            .into_iter()
            .filter(|(_, tags_json, _)| {
                let Some(wanted) = tags else { return true };
                if wanted.is_empty() {
                    return true;
                }
                let row_tags: Vec<String> = serde_json::from_str(tags_json).unwrap_or_default();
                wanted.iter().any(|w| row_tags.contains(w))
            })
            .map(|(id, _, _)| id)
            .take(limit as usize)
            .collect();

        Ok(filtered)
    }

    pub async fn append_chat(&self, channel_id: &str, role: &str, content: &str, extras: Option<&Value>) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_messages (channel_id, role, content, extras, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(role)
        .bind(content)
        .bind(extras.map(|v| v.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_chat_history(&self, channel_id: &str, limit: i64) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT role, content FROM conversation_messages
            WHERE channel_id = ?
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn row_to_market_row(
    r: (String, String, String, String, String, String, String, String, String, String, String),
) -> Result<MarketRow> {
    let (ticker, timestamp, available_at, open, high, low, close, volume, source, data_type, metadata) = r;
    Ok(MarketRow {
        ticker,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
        available_at: DateTime::parse_from_rfc3339(&available_at)?.with_timezone(&Utc),
        open: open.parse()?,
        high: high.parse()?,
        low: low.parse()?,
        close: close.parse()?,
        volume: volume.parse()?,
        source,
        data_type,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}
