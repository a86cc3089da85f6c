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

//! Group chain core: block storage, production and synchronization.
//!
//! One `GroupService` runs per joined group. Its worker task owns the
//! producer pool, the syncer state machine and every timer, and is mutated
//! only through the service command channel. Sub-modules:
//! - store: durable block DAG plus the applied side-effect tables.
//! - factory: transaction construction, encryption and signing.
//! - apply: block commit pipeline and the transaction apply table.
//! - producer: proof-of-authority block production and candidate merge.
//! - challenge: experimental multi-producer production policy.
//! - syncer: forward/backward catch-up state machine.
//! - controller: per-group composition root and message routing.

pub(crate) mod apply;
pub(crate) mod challenge;
pub(crate) mod producer;
pub(crate) mod syncer;

pub mod controller;
pub mod factory;
pub mod message;
pub mod store;

pub use controller::{GroupController, GroupService};
pub use factory::TrxFactory;
pub use message::{Command, GroupStatus, Reply};
pub use producer::ProducerStatus;
pub use store::ChainStore;
pub use syncer::SyncStatus;

use crate::base::schema::{EncryptKind, GroupItem, TrxKind};
use crate::crypto::cipher::{aes_decrypt, aes_encrypt, SealKeyPair, SealedEnvelope};
use crate::crypto::KeyPair;
use crate::{base::serialize::MessagePack, Error, ErrorKind, Result};
use std::time::Duration;

/// Post payload plaintext ceiling (200 KiB).
pub const OBJECT_SIZE_LIMIT: usize = 200 * 1024;

/// Upper bound on the total payload size packaged into one block (900 KiB).
pub const TRXS_TOTAL_SIZE: usize = 900 * 1024;

/// Consecutive empty sync rounds before the syncer gives up.
pub const SYNC_RETRY_LIMIT: u8 = 5;

/// Chain timing knobs. Production values are the defaults; the tests shrink
/// them to keep the suite fast.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Delay between the first pooled transaction and block production.
    pub produce_timeout: Duration,
    /// Candidate block collection window.
    pub merge_timeout: Duration,
    /// Sync response wait window.
    pub sync_timeout: Duration,
    /// Consecutive empty sync rounds before `SyncFailed`.
    pub sync_retry_limit: u8,
    /// Challenge seed collection window.
    pub challenge_timeout: Duration,
    /// Per-turn block wait of the challenge policy.
    pub challenge_wait_timeout: Duration,
    /// Transaction time-to-live.
    pub trx_ttl: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            produce_timeout: Duration::from_secs(5),
            merge_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(10),
            sync_retry_limit: SYNC_RETRY_LIMIT,
            challenge_timeout: Duration::from_secs(10),
            challenge_wait_timeout: Duration::from_secs(5),
            trx_ttl: Duration::from_secs(30),
        }
    }
}

impl ChainConfig {
    /// Transaction time-to-live in nanoseconds.
    pub fn trx_ttl_nanos(&self) -> i64 {
        self.trx_ttl.as_nanos() as i64
    }
}

/// Key material of one group on this node: the signing identity, the shared
/// symmetric key and, for private group members, the sealed-payload identity.
pub struct GroupKeys {
    pub keypair: KeyPair,
    pub cipher_key: Vec<u8>,
    pub seal: Option<SealKeyPair>,
}

impl GroupKeys {
    /// Build from a group record: decodes the hex cipher key.
    pub fn from_item(item: &GroupItem, keypair: KeyPair, seal: Option<SealKeyPair>) -> Result<Self> {
        let cipher_key = hex::decode(&item.cipher_key)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(GroupKeys {
            keypair,
            cipher_key,
            seal,
        })
    }

    /// Encrypt a transaction payload the way the group expects it.
    pub fn seal_payload(
        &self,
        encrypt_kind: EncryptKind,
        trx_kind: TrxKind,
        plaintext: &[u8],
        recipients: &[Vec<u8>],
    ) -> Result<Vec<u8>> {
        if trx_kind == TrxKind::Post && encrypt_kind == EncryptKind::Private {
            let envelope = SealedEnvelope::seal(recipients, plaintext)?;
            Ok(envelope.serialize())
        } else {
            aes_encrypt(&self.cipher_key, plaintext)
        }
    }

    /// Decrypt a transaction payload.
    ///
    /// # Errors
    ///
    /// `CryptoFault` when a sealed payload arrives and this node carries no
    /// seal identity, or is not among the recipients.
    pub fn open_payload(
        &self,
        encrypt_kind: EncryptKind,
        trx_kind: TrxKind,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if trx_kind == TrxKind::Post && encrypt_kind == EncryptKind::Private {
            let envelope = SealedEnvelope::deserialize(data)?;
            let seal = self
                .seal
                .as_ref()
                .ok_or_else(|| Error::new_ext(ErrorKind::CryptoFault, "no seal identity"))?;
            envelope.open(seal)
        } else {
            aes_decrypt(&self.cipher_key, data)
        }
    }
}
