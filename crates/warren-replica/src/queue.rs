//! Durable per-clone update queue.
//!
//! Queue entries are keyed by end-tick, encoded fixed-width so that the
//! store's lexicographic key order is the numeric tick order. Queue
//! persistence failures are fatal to the enclosing write or poll — a
//! lost update is never acceptable.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use warren_core::{Error, Result};

use crate::clone::SubdomainUpdate;

/// Tick keys are fixed-width base-36, zero padded. Eight digits gives a
/// maximum tick of 36^8, about 2.8 trillion.
const TICK_KEY_LEN: usize = 8;
const TICK_KEY_RADIX: u64 = 36;

const QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("update-queue");

/// Encode a tick as a lexicographically sortable queue key.
pub fn tick_key(tick: u64) -> String {
    let mut digits = [b'0'; TICK_KEY_LEN];
    let mut rest = tick;
    for slot in digits.iter_mut().rev() {
        let digit = (rest % TICK_KEY_RADIX) as u8;
        *slot = if digit < 10 {
            b'0' + digit
        } else {
            b'a' + digit - 10
        };
        rest /= TICK_KEY_RADIX;
        if rest == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&digits).into_owned()
}

/// Durable FIFO of [`SubdomainUpdate`]s, ordered by end-tick.
pub struct UpdateQueue {
    db: Database,
}

impl UpdateQueue {
    /// Open (or create) the queue database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(queue_err)?;
        // Ensure the table exists so that reads never race creation
        let tx = db.begin_write().map_err(queue_err)?;
        tx.open_table(QUEUE_TABLE).map_err(queue_err)?;
        tx.commit().map_err(queue_err)?;
        Ok(Self { db })
    }

    /// Insert or overwrite the entry at the update's tick.
    pub fn put(&self, update: &SubdomainUpdate) -> Result<()> {
        let value = serde_json::to_vec(update)?;
        let tx = self.db.begin_write().map_err(queue_err)?;
        {
            let mut table = tx.open_table(QUEUE_TABLE).map_err(queue_err)?;
            table
                .insert(tick_key(update.tick).as_str(), value.as_slice())
                .map_err(queue_err)?;
        }
        tx.commit().map_err(queue_err)
    }

    /// All queued updates in ascending tick order.
    pub fn entries(&self) -> Result<Vec<SubdomainUpdate>> {
        let tx = self.db.begin_read().map_err(queue_err)?;
        let table = tx.open_table(QUEUE_TABLE).map_err(queue_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(queue_err)? {
            let (_, value) = entry.map_err(queue_err)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Number of queued updates.
    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(queue_err)?;
        let table = tx.open_table(QUEUE_TABLE).map_err(queue_err)?;
        let mut count = 0;
        for entry in table.iter().map_err(queue_err)? {
            entry.map_err(queue_err)?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every queued update.
    pub fn clear(&self) -> Result<()> {
        let tx = self.db.begin_write().map_err(queue_err)?;
        tx.delete_table(QUEUE_TABLE).map_err(queue_err)?;
        // Recreate empty so later reads find the table
        tx.open_table(QUEUE_TABLE).map_err(queue_err)?;
        tx.commit().map_err(queue_err)
    }
}

fn queue_err(e: impl std::fmt::Display) -> Error {
    Error::internal(format!("update queue: {e}"))
}
