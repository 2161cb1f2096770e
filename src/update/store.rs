//! Append-only log of [`Update`] records in a redb file.
//!
//! Opening the file takes redb's exclusive lock; a second opener waits
//! until the first [`UpdateStore`] is dropped.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use tracing::debug;

use super::{State, Update};
use crate::{Error, Result};

const TABLE_UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("updates");

const LOCK_RETRY: Duration = Duration::from_millis(50);

pub struct UpdateStore {
    db: Database,
    path: PathBuf,
}

impl UpdateStore {
    /// Open (creating if needed) the store at `path`, waiting up to
    /// `timeout` for another holder to release it.
    pub async fn open(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let started = Instant::now();
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if started.elapsed() < timeout => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(Error::StateConflict(format!(
                        "update store {} is locked by another operation",
                        path.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let txn = db.begin_write()?;
        txn.open_table(TABLE_UPDATES)?;
        txn.commit()?;
        debug!(path = %path.display(), "opened update store");

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new record.
    pub fn create(&self, update: &Update) -> Result<()> {
        let key = update.key();
        let value = serde_json::to_vec(update)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE_UPDATES)?;
            table.insert(key.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        debug!(id = %update.id, state = %update.state, "created update record");
        Ok(())
    }

    /// Overwrite the last record, which must be `update`.
    pub fn write(&self, update: &Update) -> Result<()> {
        let key = update.key();
        let value = serde_json::to_vec(update)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE_UPDATES)?;
            let last_key = table
                .last()?
                .map(|(k, _)| k.value().to_string())
                .ok_or_else(|| Error::Internal("update store is empty".to_string()))?;
            if last_key != key {
                return Err(Error::Internal(format!(
                    "update {} is not the latest record",
                    update.id
                )));
            }
            table.insert(key.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        debug!(id = %update.id, state = %update.state, progress = update.progress, "wrote update record");
        Ok(())
    }

    /// The most recent record.
    pub fn last(&self) -> Result<Option<Update>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE_UPDATES)?;
        let last = match table.last()? {
            Some((_, v)) => Some(serde_json::from_slice(v.value())?),
            None => None,
        };
        Ok(last)
    }

    /// The most recent record in one of `states`.
    pub fn last_with_states(&self, states: &[State]) -> Result<Update> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE_UPDATES)?;
        for item in table.iter()?.rev() {
            let (_, v) = item?;
            let update: Update = serde_json::from_slice(v.value())?;
            if states.contains(&update.state) {
                return Ok(update);
            }
        }
        Err(Error::NotFound(format!(
            "no update in state {}",
            states
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("|")
        )))
    }

    /// Every record, oldest first.
    pub fn list(&self) -> Result<Vec<Update>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE_UPDATES)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, v) = item?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}
