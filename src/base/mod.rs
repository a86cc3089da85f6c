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

//! Common facilities shared by the whole crate.

pub mod schema;
pub mod serialize;

pub use schema::{Block, BlockDbChunk, GroupItem, Trx, TrxKind};

/// Crate-wide mutex type.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// Crate-wide read-write lock type.
pub type RwLock<T> = parking_lot::RwLock<T>;

/// Current time as nanoseconds since the unix epoch.
/// Timestamps are persisted as i64, the same representation used on the wire.
pub fn timestamp_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
