//! Long-Term Memory Store
//!
//! SQLite-backed memory shared by both agents. Near-duplicate writes are
//! suppressed by a normalized content fingerprint; retrieval scores keyword
//! overlap so arbitrary query text never breaks the search. A retention
//! sweep drops stale low-importance entries, keeping foundational ones.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};

/// Entries older than this (and unimportant) are dropped by the sweep
const RETENTION_DAYS: i64 = 7;
/// Importance at or above this survives the sweep regardless of age
const SWEEP_KEEP_IMPORTANCE: f64 = 0.7;

/// A stored memory
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub source: String,
    pub importance: f64,
    pub kind: String,
    pub created_at: i64,
    pub access_count: i64,
}

/// Search hit with relevance score
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub record: MemoryRecord,
    pub relevance: f64,
}

/// Memory store with SQLite backend
///
/// The connection is internally serialized, so a single store can be shared
/// by both agent loops.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open or create the memory database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Memory store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL DEFAULT 'unknown',
                importance REAL NOT NULL DEFAULT 0.5,
                kind TEXT NOT NULL DEFAULT 'general',
                created_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
            "#,
        )?;
        Ok(())
    }

    /// Normalized content fingerprint for near-duplicate suppression
    fn fingerprint(content: &str) -> String {
        let normalized: String = content
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Save a memory. Returns None when a near-duplicate already exists.
    pub fn save(
        &self,
        content: &str,
        source: &str,
        importance: f64,
        kind: &str,
    ) -> Result<Option<String>> {
        let fingerprint = Self::fingerprint(content);

        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", Utc::now().timestamp_micros(), content).as_bytes());
        let id = hex::encode(&hasher.finalize()[..8]);

        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"
            INSERT INTO memories (id, content, fingerprint, source, importance, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
            params![
                id,
                content,
                fingerprint,
                source,
                importance.clamp(0.0, 1.0),
                kind,
                Utc::now().timestamp()
            ],
        )?;

        if inserted == 0 {
            debug!("Duplicate memory suppressed: {}", crate::prompts::preview(content, 40));
            return Ok(None);
        }

        debug!("Saved memory [{}]: {}", source, crate::prompts::preview(content, 50));
        Ok(Some(id))
    }

    /// Search memories by keyword overlap with the query
    ///
    /// Relevance is the fraction of query tokens found in the entry, so it
    /// lands in 0.0..=1.0 like the vector-distance scores it replaces.
    pub fn search(&self, query: &str, threshold: f64, max_results: usize) -> Result<Vec<MemoryHit>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, source, importance, kind, created_at, access_count
             FROM memories ORDER BY created_at DESC LIMIT 2000",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(MemoryRecord {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    source: row.get(2)?,
                    importance: row.get(3)?,
                    kind: row.get(4)?,
                    created_at: row.get(5)?,
                    access_count: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits: Vec<MemoryHit> = records
            .into_iter()
            .filter_map(|record| {
                let entry_tokens = tokenize(&record.content);
                let matched = query_tokens
                    .iter()
                    .filter(|t| entry_tokens.contains(*t))
                    .count();
                let relevance = matched as f64 / query_tokens.len() as f64;

                (relevance >= threshold).then_some(MemoryHit { record, relevance })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.record
                        .importance
                        .partial_cmp(&a.record.importance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        hits.truncate(max_results);

        for hit in &hits {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1 WHERE id = ?1",
                params![hit.record.id],
            )?;
        }

        Ok(hits)
    }

    /// Format the top hits as a digest block for prompts
    pub fn digest(&self, query: &str, max_results: usize) -> String {
        match self.search(query, 0.3, max_results) {
            Ok(hits) => hits
                .iter()
                .map(|h| format!("- {}", h.record.content))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!("Memory search failed: {e}");
                String::new()
            }
        }
    }

    /// Number of stored memories
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, source, importance, kind, created_at, access_count
             FROM memories ORDER BY created_at DESC LIMIT ?1",
        )?;

        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(MemoryRecord {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    source: row.get(2)?,
                    importance: row.get(3)?,
                    kind: row.get(4)?,
                    created_at: row.get(5)?,
                    access_count: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Retention sweep: drop old, low-importance, non-foundational entries.
    /// Returns the number of removed memories.
    pub fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - RETENTION_DAYS * 24 * 3600;

        let conn = self.conn.lock();
        let removed = conn.execute(
            r#"
            DELETE FROM memories
            WHERE kind != 'foundational'
              AND source != 'personality'
              AND importance < ?1
              AND created_at < ?2
            "#,
            params![SWEEP_KEEP_IMPORTANCE, cutoff],
        )?;

        if removed > 0 {
            info!("Memory sweep removed {removed} stale entries");
        } else {
            debug!("Memory sweep: nothing to remove");
        }

        Ok(removed)
    }

    /// Flush pending state to disk
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")?;
        debug!("Memory store flushed");
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_count() {
        let store = MemoryStore::open_in_memory().unwrap();

        let id = store.save("the user's name is Ada", "spirit", 0.7, "general").unwrap();
        assert!(id.is_some());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_near_duplicate_suppressed() {
        let store = MemoryStore::open_in_memory().unwrap();

        store.save("The user likes Rust", "spirit", 0.7, "general").unwrap();
        // Same content modulo case and spacing
        let dup = store.save("the  user likes   RUST", "spirit", 0.9, "general").unwrap();

        assert!(dup.is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_search_relevance_ordering() {
        let store = MemoryStore::open_in_memory().unwrap();

        store.save("the user prefers dark chocolate", "spirit", 0.5, "general").unwrap();
        store.save("deployment runs on fridays", "spirit", 0.5, "general").unwrap();

        let hits = store.search("what chocolate does the user prefer", 0.3, 5).unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].record.content.contains("chocolate"));

        // Threshold filters out the unrelated entry
        assert!(hits.iter().all(|h| !h.record.content.contains("fridays")));
    }

    #[test]
    fn test_search_empty_query() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.save("something", "spirit", 0.5, "general").unwrap();

        assert!(store.search("  !!! ", 0.3, 5).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_keeps_foundational_and_important() {
        let store = MemoryStore::open_in_memory().unwrap();

        store.save("I am a helpful entity", "personality", 0.9, "foundational").unwrap();
        store.save("important conclusion", "spirit", 0.8, "general").unwrap();
        store.save("ephemeral detail", "spirit", 0.2, "general").unwrap();

        // Backdate everything past the retention window
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE memories SET created_at = created_at - 30 * 24 * 3600",
                [],
            )
            .unwrap();
        }

        let removed = store.sweep().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_digest_formatting() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.save("the user's name is Ada", "spirit", 0.7, "general").unwrap();

        let digest = store.digest("what is the user's name", 5);
        assert!(digest.starts_with("- "));
        assert!(digest.contains("Ada"));
    }
}
