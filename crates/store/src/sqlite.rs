//! SQLite-backed driver. Simple, synchronous; none of the callers are
//! latency sensitive here.

use std::sync::Mutex;

use anyhow::{Context, Result};
use metrics::histogram;

use crate::driver::Driver;

pub struct SqliteDriver {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteDriver {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .context("creating objects table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl Driver for SqliteDriver {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT value FROM objects WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO objects(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, value),
        )?;
        histogram!("store_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        // Keys are ASCII, so prefix + char::MAX bounds the range.
        let upper = format!("{}\u{10FFFF}", prefix);
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT key, value FROM objects WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
        )?;
        let mut rows = stmt.query((prefix, upper.as_str()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            out.push((key, value));
        }
        Ok(out)
    }
}
