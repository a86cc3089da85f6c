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

//! Transaction factory: one instance per group.
//!
//! Builds, encrypts and signs every transaction this node emits, and
//! verifies the ones it receives. Nonces come from the per-group sequence in
//! the block store; replay decisions belong to the producer and the syncer,
//! never to the factory itself.

use crate::base::schema::{
    AnnounceItem, AuthItem, Block, GroupItem, NewBlockRespItem, NewBlockRespResult, ProducerItem,
    ReqBlkResult, ReqBlockItem, ReqBlockRespItem, Trx, TrxData, TrxKind,
};
use crate::base::serialize::MessagePack;
use crate::base::{timestamp_nanos, RwLock};
use crate::chain::store::ChainStore;
use crate::chain::{GroupKeys, OBJECT_SIZE_LIMIT};
use crate::crypto::{Hashable, PublicKey};
use crate::db::Db;
use crate::{Error, ErrorKind, Result};
use std::sync::Arc;

/// Transaction factory context data.
pub struct TrxFactory<D: Db> {
    item: Arc<RwLock<GroupItem>>,
    keys: Arc<GroupKeys>,
    store: ChainStore<D>,
    /// Transaction time-to-live (ns).
    ttl_nanos: i64,
}

impl<D: Db> Clone for TrxFactory<D> {
    fn clone(&self) -> Self {
        TrxFactory {
            item: self.item.clone(),
            keys: self.keys.clone(),
            store: self.store.clone(),
            ttl_nanos: self.ttl_nanos,
        }
    }
}

impl<D: Db> TrxFactory<D> {
    pub fn new(
        item: Arc<RwLock<GroupItem>>,
        keys: Arc<GroupKeys>,
        store: ChainStore<D>,
        ttl_nanos: i64,
    ) -> Self {
        TrxFactory {
            item,
            keys,
            store,
            ttl_nanos,
        }
    }

    /// Build, encrypt and sign a transaction.
    ///
    /// `recipients` is consulted only for posts of private groups: the
    /// payload is sealed to the announced members instead of the group key.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` when a post plaintext exceeds the fixed ceiling,
    /// `CryptoFault` when encryption or signing fails.
    pub fn create_trx(
        &self,
        kind: TrxKind,
        plaintext: &[u8],
        recipients: &[Vec<u8>],
    ) -> Result<Trx> {
        if kind == TrxKind::Post && plaintext.len() > OBJECT_SIZE_LIMIT {
            return Err(Error::new_ext(
                ErrorKind::PayloadTooLarge,
                "post content over 200 KiB",
            ));
        }

        let (group_id, sender_pubkey, encrypt_kind) = {
            let item = self.item.read();
            (
                item.group_id.clone(),
                item.user_sign_pubkey.clone(),
                item.encrypt_kind,
            )
        };

        let nonce = self.store.next_nonce(&group_id)?;
        let data = self
            .keys
            .seal_payload(encrypt_kind, kind, plaintext, recipients)?;

        let timestamp = timestamp_nanos();
        let data = TrxData {
            group_id,
            kind,
            sender_pubkey,
            nonce,
            data,
            timestamp,
            expired: timestamp + self.ttl_nanos,
        };

        let id = data.primary_hash();
        let signature = self
            .keys
            .keypair
            .sign(id.as_bytes())
            .map_err(|err| Error::new_ext(ErrorKind::CryptoFault, err.to_string_full()))?;

        Ok(Trx {
            id,
            data,
            signature,
            resend_count: 0,
        })
    }

    /// Recompute the content hash from the visible fields and verify the
    /// sender signature. Never mutates.
    ///
    /// Returns `Ok(false)` on a well-formed transaction with a bad
    /// signature; malformed content is an error.
    pub fn verify_trx(&self, trx: &Trx) -> Result<bool> {
        let hash = trx.data.primary_hash();
        if hash != trx.id {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "trx id does not match payload",
            ));
        }
        Ok(trx
            .data
            .sender_pubkey
            .verify(hash.as_bytes(), &trx.signature))
    }

    /// Open the payload of a received transaction.
    pub fn decrypt_trx(&self, trx: &Trx) -> Result<Vec<u8>> {
        let encrypt_kind = self.item.read().encrypt_kind;
        self.keys
            .open_payload(encrypt_kind, trx.data.kind, &trx.data.data)
    }

    // ---------------------------------------------------------------------
    // Typed constructors
    // ---------------------------------------------------------------------

    pub fn post_trx(&self, content: &[u8], recipients: &[Vec<u8>]) -> Result<Trx> {
        self.create_trx(TrxKind::Post, content, recipients)
    }

    pub fn auth_trx(&self, item: &AuthItem) -> Result<Trx> {
        self.create_trx(TrxKind::Auth, &item.serialize(), &[])
    }

    pub fn producer_trx(&self, item: &ProducerItem) -> Result<Trx> {
        self.create_trx(TrxKind::Producer, &item.serialize(), &[])
    }

    pub fn announce_trx(&self, item: &AnnounceItem) -> Result<Trx> {
        self.create_trx(TrxKind::Announce, &item.serialize(), &[])
    }

    /// "Give me the blocks after X" request.
    pub fn req_block_forward_trx(&self, block: &Block) -> Result<Trx> {
        let item = ReqBlockItem {
            group_id: block.data.group_id.clone(),
            block_id: block.id,
            requester_pubkey: self.item.read().user_sign_pubkey.clone(),
        };
        self.create_trx(TrxKind::ReqBlockForward, &item.serialize(), &[])
    }

    /// "Give me the block before X" request.
    pub fn req_block_backward_trx(&self, block: &Block) -> Result<Trx> {
        let item = ReqBlockItem {
            group_id: block.data.group_id.clone(),
            block_id: block.id,
            requester_pubkey: self.item.read().user_sign_pubkey.clone(),
        };
        self.create_trx(TrxKind::ReqBlockBackward, &item.serialize(), &[])
    }

    /// Response to a block request. `block` is absent for the
    /// `BlockNotFound` answer.
    pub fn req_block_resp_trx(
        &self,
        requester_pubkey: &PublicKey,
        anchor: &ReqBlockItem,
        block: Option<&Block>,
        result: ReqBlkResult,
    ) -> Result<Trx> {
        let item = ReqBlockRespItem {
            result,
            provider_pubkey: self.item.read().user_sign_pubkey.clone(),
            requester_pubkey: requester_pubkey.clone(),
            group_id: anchor.group_id.clone(),
            block_id: anchor.block_id,
            block: block.map(|block| block.serialize()).unwrap_or_default(),
        };
        self.create_trx(TrxKind::ReqBlockResp, &item.serialize(), &[])
    }

    /// Candidate block announcement on the producer channel.
    pub fn block_produced_trx(&self, block: &Block) -> Result<Trx> {
        self.create_trx(TrxKind::BlockProduced, &block.serialize(), &[])
    }

    /// Production-turn claim (challenge policy).
    pub fn challenge_trx(&self, item: &crate::base::schema::ChallengeItem) -> Result<Trx> {
        self.create_trx(TrxKind::Challenge, &item.serialize(), &[])
    }

    /// Block acceptance/rejection acknowledgment.
    pub fn new_block_resp_trx(
        &self,
        block: &Block,
        result: NewBlockRespResult,
    ) -> Result<Trx> {
        let item = NewBlockRespItem {
            result,
            provider_pubkey: self.item.read().user_sign_pubkey.clone(),
            block_producer_pubkey: block.data.producer_pubkey.clone(),
            block_id: block.id,
        };
        self.create_trx(TrxKind::NewBlockResp, &item.serialize(), &[])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_group_item, TEST_GROUP_ID};
    use crate::base::schema::ActionKind;
    use crate::chain::store::tests::create_test_store;
    use crate::chain::tests::create_test_keys;
    use crate::db::MemoryDb;

    pub fn create_test_factory() -> TrxFactory<MemoryDb> {
        let item = Arc::new(RwLock::new(create_test_group_item()));
        let keys = Arc::new(create_test_keys());
        TrxFactory::new(item, keys, create_test_store(), 30_000_000_000)
    }

    #[test]
    fn created_trx_verifies() {
        let factory = create_test_factory();

        let trx = factory.post_trx(b"hello group", &[]).unwrap();

        assert_eq!(trx.data.kind, TrxKind::Post);
        assert_eq!(trx.data.group_id, TEST_GROUP_ID);
        assert!(factory.verify_trx(&trx).unwrap());
        assert!(trx.data.expired > trx.data.timestamp);
    }

    #[test]
    fn created_trx_payload_roundtrip() {
        let factory = create_test_factory();

        let trx = factory.post_trx(b"hello group", &[]).unwrap();

        assert_ne!(trx.data.data, b"hello group");
        assert_eq!(factory.decrypt_trx(&trx).unwrap(), b"hello group");
    }

    #[test]
    fn nonce_increases_per_trx() {
        let factory = create_test_factory();

        let first = factory.post_trx(b"a", &[]).unwrap();
        let second = factory.post_trx(b"b", &[]).unwrap();

        assert!(second.data.nonce > first.data.nonce);
    }

    #[test]
    fn oversized_post_rejected() {
        let factory = create_test_factory();
        let content = vec![0u8; OBJECT_SIZE_LIMIT + 1];

        let err = factory.post_trx(&content, &[]).unwrap_err();

        assert_eq!(err.kind, ErrorKind::PayloadTooLarge);
    }

    #[test]
    fn oversized_limit_applies_to_posts_only() {
        let factory = create_test_factory();
        let item = AuthItem {
            group_id: TEST_GROUP_ID.to_owned(),
            peer_pubkey: factory.item.read().owner_pubkey.clone(),
            action: ActionKind::Add,
            memo: "x".repeat(OBJECT_SIZE_LIMIT),
        };

        factory.auth_trx(&item).unwrap();
    }

    #[test]
    fn tampered_trx_fails_verification() {
        let factory = create_test_factory();
        let mut trx = factory.post_trx(b"hello", &[]).unwrap();

        trx.signature[0] ^= 0xff;
        assert!(!factory.verify_trx(&trx).unwrap());

        trx.data.nonce += 1;
        let err = factory.verify_trx(&trx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn req_block_resp_not_found_has_empty_block() {
        let factory = create_test_factory();
        let genesis = factory.item.read().genesis_block.clone();
        let anchor = ReqBlockItem {
            group_id: TEST_GROUP_ID.to_owned(),
            block_id: genesis.id,
            requester_pubkey: factory.item.read().user_sign_pubkey.clone(),
        };

        let trx = factory
            .req_block_resp_trx(
                &anchor.requester_pubkey.clone(),
                &anchor,
                None,
                ReqBlkResult::BlockNotFound,
            )
            .unwrap();

        let item: ReqBlockRespItem =
            crate::base::serialize::rmp_deserialize(&factory.decrypt_trx(&trx).unwrap()).unwrap();
        assert_eq!(item.result, ReqBlkResult::BlockNotFound);
        assert!(item.block.is_empty());
    }
}
