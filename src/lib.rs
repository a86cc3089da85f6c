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

//! Tessera permissioned group-chain core.
//!
//! Each group is an independent append-only ledger with its own genesis
//! block, producer set and keys. This crate implements the block
//! synchronization and production engine: DAG block storage tolerating
//! out-of-order arrival, proof-of-authority production with deterministic
//! candidate merge, and the forward/backward catch-up protocol.

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod base;
pub mod chain;
pub mod channel;
pub mod conn;
pub mod crypto;
pub mod db;
pub mod error;

pub use base::schema::{Block, GroupItem, Trx, TrxKind};
pub use chain::{
    ChainConfig, ChainStore, Command, GroupController, GroupKeys, GroupService, Reply, TrxFactory,
};
pub use conn::ChannelTransport;
pub use crypto::{Hash, KeyPair, PublicKey};
pub use error::{Error, ErrorKind, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
