//! Content-keyed cache for merged category geometries.
//!
//! Unions are the expensive step of scoring, so their results are kept in a
//! small SQLite table keyed by evaluation file and category. Values are the
//! union geometry as little-endian WKB. Writes are buffered and flushed in a
//! single transaction via [`UnionCache::commit`].

use std::fmt;
use std::path::Path;

use geo::MultiPolygon;
use rusqlite::{Connection, OptionalExtension};

use crate::category::Category;
use crate::error::CacheError;
use crate::geometry::wkb::{decode_wkb, encode_wkb_multipolygon, DecodedGeometry};

/// Identifies one cached union: evaluation file plus category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    file: String,
    category: Category,
}

impl CacheKey {
    pub fn new(file: impl Into<String>, category: Category) -> Self {
        Self {
            file: file.into(),
            category,
        }
    }

    /// The string form stored in the database: `<file>-<category>`.
    pub fn token(&self) -> String {
        format!("{}-{}", self.file, self.category)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

pub struct UnionCache {
    conn: Connection,
    pending: Vec<(String, Vec<u8>)>,
}

impl UnionCache {
    /// Opens (and bootstraps, if needed) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path)?;
        bootstrap(&conn)?;
        log::info!("Union cache opened at {}", path.display());
        Ok(Self {
            conn,
            pending: Vec::new(),
        })
    }

    /// Opens an in-memory cache for testing.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        bootstrap(&conn)?;
        Ok(Self {
            conn,
            pending: Vec::new(),
        })
    }

    /// Looks the key up, newest pending write first, then the table.
    ///
    /// A missing row, an empty blob and an undecodable blob all come back as
    /// `Ok(None)`; only database access itself can fail.
    pub fn try_get(&self, key: &CacheKey) -> Result<Option<MultiPolygon<f64>>, CacheError> {
        let token = key.token();
        if let Some((_, blob)) = self.pending.iter().rev().find(|(t, _)| *t == token) {
            return Ok(decode_value(&token, blob));
        }
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT geom FROM unions WHERE key = ?1", [&token], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(blob.and_then(|blob| decode_value(&token, &blob)))
    }

    /// Buffers a union for the next [`commit`](Self::commit).
    pub fn put(&mut self, key: &CacheKey, union: &MultiPolygon<f64>) {
        self.pending.push((key.token(), encode_wkb_multipolygon(union)));
    }

    /// Flushes all buffered writes in one transaction.
    pub fn commit(&mut self) -> Result<(), CacheError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        let tx = self.conn.transaction()?;
        for (token, blob) in pending {
            tx.execute(
                "INSERT OR REPLACE INTO unions (key, geom) VALUES (?1, ?2)",
                rusqlite::params![token, blob],
            )?;
        }
        tx.commit()?;
        log::debug!("committed {} union(s) to cache", count);
        Ok(())
    }

    /// Returns the cached union for `key`, computing and buffering it on a
    /// miss. The closure runs at most once per key per run.
    pub fn get_or_compute<F>(
        &mut self,
        key: &CacheKey,
        compute: F,
    ) -> Result<Option<MultiPolygon<f64>>, CacheError>
    where
        F: FnOnce() -> Option<MultiPolygon<f64>>,
    {
        if let Some(cached) = self.try_get(key)? {
            log::debug!("cache hit for {}", key);
            return Ok(Some(cached));
        }
        match compute() {
            Some(union) => {
                self.put(key, &union);
                Ok(Some(union))
            }
            None => Ok(None),
        }
    }

    /// Number of committed rows.
    pub fn len(&self) -> Result<u32, CacheError> {
        let count: u32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM unions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

fn bootstrap(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS unions (
            key        TEXT PRIMARY KEY,
            geom       BLOB NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
}

/// Decodes a stored blob, treating anything unusable as a miss.
fn decode_value(token: &str, blob: &[u8]) -> Option<MultiPolygon<f64>> {
    if blob.is_empty() {
        return None;
    }
    match decode_wkb(blob) {
        Ok(DecodedGeometry::MultiPolygon(mp)) if !mp.0.is_empty() => Some(mp),
        Ok(DecodedGeometry::Polygon(p)) => Some(MultiPolygon(vec![p])),
        Ok(_) => None,
        Err(e) => {
            log::warn!("discarding undecodable cache entry {}: {}", token, e);
            None
        }
    }
}
