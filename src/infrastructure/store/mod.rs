pub mod index;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use crate::domain::errors::StoreError;
use crate::domain::ports::MarketRow;

use index::Index;

/// Files-as-truth persistence plus a rebuildable SQLite secondary index.
/// Grounded on `core/data/store.py`; atomic writes (write-temp-then-
/// rename) are a deliberate improvement over the source, which writes
/// directly with `path.write_text()`.
#[derive(Clone)]
pub struct Store {
    home: PathBuf,
    index: Index,
}

impl Store {
    pub async fn open(home: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let home = home.into();
        let index = Index::open(&home.join("db.sqlite"))
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))?;
        Ok(Self { home, index })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.home.join(kind)
    }

    /// Atomic replace: write to a sibling temp file, then rename into
    /// place, so readers never observe a partially-written entity.
    pub async fn write_entity(&self, kind: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let dest = dir.join(format!("{key}.json"));
        let tmp = dir.join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));

        fs::write(&tmp, bytes).await.map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &dest).await.map_err(|e| io_err(&dest, e))?;
        Ok(())
    }

    pub async fn read_entity(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.kind_dir(kind).join(format!("{key}.json"));
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Keys ordered by filename (lexicographic, which is chronological
    /// for our `_`-prefixed-date and UUID-suffixed identifiers).
    pub async fn list_entities(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.kind_dir(kind);
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(io_err(&dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn delete_entity(&self, kind: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.kind_dir(kind).join(format!("{key}.json"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub async fn write_json<T: Serialize + Sync>(&self, kind: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_entity(kind, key, &bytes).await
    }

    pub async fn read_json<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>, StoreError> {
        match self.read_entity(kind, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list_json<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for key in self.list_entities(kind).await? {
            if let Some(v) = self.read_json(kind, &key).await? {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub async fn write_markdown(&self, kind: &str, filename: &str, content: &str) -> Result<(), StoreError> {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let dest = dir.join(filename);
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, content).await.map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &dest).await.map_err(|e| io_err(&dest, e))?;
        Ok(())
    }

    /// Appends one line to today's audit log (`events/YYYY-MM-DD.jsonl`).
    pub async fn append_audit_line(&self, date_key: &str, line: &str) -> Result<(), StoreError> {
        let dir = self.kind_dir("events");
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{date_key}.jsonl"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_err(&path, e))?;
        file.write_all(b"\n").await.map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Counts lines in today's audit log whose `type` field matches
    /// `event_type` — backs the `frequency` risk rule.
    pub async fn count_audit_events_today(&self, event_type: &str) -> Result<usize, StoreError> {
        let date_key = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.kind_dir("events").join(format!("{date_key}.jsonl"));
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&path, e)),
        };
        let count = content
            .lines()
            .filter(|line| {
                serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
                    .as_deref()
                    == Some(event_type)
            })
            .count();
        Ok(count)
    }

    /// Tails today's audit log for the orchestrator's `recent_events`
    /// context slice. Best-effort: a missing or unparseable line is
    /// skipped rather than failing the whole read.
    pub async fn recent_audit_events(&self, limit: usize) -> Result<Vec<crate::domain::event::Event>, StoreError> {
        let date_key = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.kind_dir("events").join(format!("{date_key}.jsonl"));
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path, e)),
        };
        let mut events: Vec<crate::domain::event::Event> = content
            .lines()
            .rev()
            .take(limit)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        events.reverse();
        Ok(events)
    }

    // --- market data, delegated to the secondary index ---

    pub async fn append_market_row(&self, row: MarketRow) -> Result<(), StoreError> {
        self.index
            .save_market_row(&row)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn query_market(
        &self,
        ticker: &str,
        as_of: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<MarketRow>, StoreError> {
        self.index
            .query_market(ticker, as_of, limit)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn latest_price(&self, ticker: &str, as_of: Option<DateTime<Utc>>) -> Result<Option<Decimal>, StoreError> {
        self.index
            .latest_price(ticker, as_of)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn index_memory(&self, id: &str, ticker: Option<&str>, tags: &[String], created_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.index
            .index_memory(id, ticker, tags, created_at)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn search_memories(
        &self,
        ticker: Option<&str>,
        tags: Option<&[String]>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.index
            .search_memories(ticker, tags, since, limit)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn append_chat(&self, channel_id: &str, role: &str, content: &str, extras: Option<&Value>) -> Result<(), StoreError> {
        self.index
            .append_chat(channel_id, role, content, extras)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }

    pub async fn load_chat_history(&self, channel_id: &str, limit: i64) -> Result<Vec<(String, String)>, StoreError> {
        self.index
            .load_chat_history(channel_id, limit)
            .await
            .map_err(|e| StoreError::Index(sqlx::Error::Configuration(e.to_string().into())))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
