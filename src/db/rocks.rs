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

//! RocksDB storage backend.

use crate::db::{BatchOp, Db, WriteBatch};
use crate::{Error, ErrorKind, Result};
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;

fn db_fault(err: rocksdb::Error) -> Error {
    Error::new_ext(ErrorKind::DatabaseFault, err)
}

/// RocksDB-backed store.
///
/// One plain keyspace: the chain core already namespaces with key prefixes,
/// and RocksDB's ordered iteration gives the prefix scans directly.
pub struct RocksDb {
    db: DB,
}

impl RocksDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<RocksDb> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        let db = DB::open(&opts, path).map_err(db_fault)?;
        Ok(RocksDb { db })
    }
}

impl Db for RocksDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(key.as_bytes()).map_err(db_fault)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.put(key.as_bytes(), value).map_err(db_fault)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes()).map_err(db_fault)
    }

    fn prefix_scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut entries = vec![];
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(db_fault)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value.into_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => inner.put(key.as_bytes(), value),
                BatchOp::Delete(key) => inner.delete(key.as_bytes()),
            }
        }
        self.db.write(inner).map_err(db_fault)
    }
}
