// This file is part of TESSERA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// TESSERA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TESSERA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TESSERA. If not, see <https://www.gnu.org/licenses/>.

//! Generic ordered key-value storage.
//!
//! The chain core namespaces its records with string key prefixes, so the
//! only requirements on a backend are point lookups, prefix enumeration and
//! atomic multi-key batches (block application must not be observable half
//! done).

use crate::Result;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;

pub mod memory;
#[cfg(feature = "with-rocksdb")]
pub mod rocks;

pub use memory::MemoryDb;
#[cfg(feature = "with-rocksdb")]
pub use rocks::RocksDb;

/// One deferred storage mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Ordered set of mutations applied atomically by `Db::write_batch`.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key.to_owned(), value));
    }

    pub fn delete(&mut self, key: &str) {
        self.ops.push(BatchOp::Delete(key.to_owned()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Trait providing access to the database.
///
/// Lookups of a missing key yield `Ok(None)`; every other storage failure is
/// a `DatabaseFault` and propagates untouched (retry policy belongs to the
/// components owning the operation, never to the store).
#[cfg_attr(test, automock)]
pub trait Db: Send + Sync + 'static {
    /// Load the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, overwriting.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate the `(key, value)` pairs whose key starts with `prefix`,
    /// in ascending key order.
    fn prefix_scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply every operation of `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Read-your-writes view over a pending batch.
///
/// Block application is read-modify-write (a parent chunk promoted earlier in
/// the same batch must be visible to its children), so mutations are staged
/// here and handed to `Db::write_batch` in one shot.
pub struct BatchWriter<'a, D: Db> {
    db: &'a D,
    batch: WriteBatch,
    overlay: HashMap<String, Option<Vec<u8>>>,
}

impl<'a, D: Db> BatchWriter<'a, D> {
    pub fn new(db: &'a D) -> Self {
        BatchWriter {
            db,
            batch: WriteBatch::default(),
            overlay: HashMap::new(),
        }
    }

    /// Read through the pending mutations.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(pending) => Ok(pending.clone()),
            None => self.db.get(key),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        self.overlay.insert(key.to_owned(), Some(value.clone()));
        self.batch.put(key, value);
    }

    pub fn delete(&mut self, key: &str) {
        self.overlay.insert(key.to_owned(), None);
        self.batch.delete(key);
    }

    /// Commit the staged mutations atomically.
    pub fn commit(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.db.write_batch(self.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_writer_read_your_writes() {
        let db = MemoryDb::new();
        db.set("k1", b"old".to_vec()).unwrap();

        let mut writer = BatchWriter::new(&db);
        writer.put("k1", b"new".to_vec());
        writer.put("k2", b"fresh".to_vec());
        writer.delete("k1");

        assert_eq!(writer.get("k1").unwrap(), None);
        assert_eq!(writer.get("k2").unwrap(), Some(b"fresh".to_vec()));
        // Nothing hits the store before commit.
        assert_eq!(db.get("k2").unwrap(), None);

        writer.commit().unwrap();

        assert_eq!(db.get("k1").unwrap(), None);
        assert_eq!(db.get("k2").unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn empty_batch_commit_is_noop() {
        let db = MemoryDb::new();

        BatchWriter::new(&db).commit().unwrap();
    }
}
