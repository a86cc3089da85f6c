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

//! Block commit pipeline.
//!
//! Both the producer and the user path land here: cache the incoming block,
//! probe the parent, validate, gather the connectable cache run, apply every
//! contained transaction, promote the run out of the cache and recompute the
//! canonical tip. The transaction side effects and the chunk moves go into
//! one write batch, so a crash can never leave a block half applied.

use crate::base::schema::{
    AnnounceItem, AuthItem, Block, BlockId, ContentItem, GroupItem, ProducerItem, Trx, TrxKind,
};
use crate::base::serialize::rmp_deserialize;
use crate::base::{timestamp_nanos, RwLock};
use crate::chain::store::ChainStore;
use crate::chain::GroupKeys;
use crate::db::{BatchWriter, Db};
use crate::{ErrorKind, Result};

/// What a committed block changed.
#[derive(Debug)]
pub(crate) struct CommitOutcome {
    pub new_height: i64,
    pub new_tips: Vec<BlockId>,
    /// My transactions sitting on a branch that lost the height race,
    /// to be re-published with a bumped resend counter.
    pub resend_trxs: Vec<Trx>,
    /// True when a producer-list update was applied: the caller must rebuild
    /// its producer pool and re-select its consensus role.
    pub producers_changed: bool,
}

/// Apply the side effect of one transaction into `writer`.
/// Returns true when the producer list changed.
fn apply_one<D: Db>(
    store: &ChainStore<D>,
    keys: &GroupKeys,
    item: &GroupItem,
    trx: &Trx,
    writer: &mut BatchWriter<D>,
) -> Result<bool> {
    let group_id = &item.group_id;

    // Sealed posts of private groups may not be addressed to this node:
    // keep the original ciphertext in that case, drop nothing.
    let plaintext = match keys.open_payload(item.encrypt_kind, trx.data.kind, &trx.data.data) {
        Ok(plaintext) => Some(plaintext),
        Err(err) if err.kind == ErrorKind::CryptoFault && trx.data.kind == TrxKind::Post => {
            debug!(
                "<{}> post <{}> not addressed to me, storing ciphertext",
                group_id,
                trx.id.to_hex()
            );
            None
        }
        Err(err) => return Err(err),
    };

    let mut producers_changed = false;
    match trx.data.kind {
        TrxKind::Post => {
            let content = ContentItem {
                trx_id: trx.id,
                publisher_pubkey: trx.data.sender_pubkey.clone(),
                content: plaintext.unwrap_or_else(|| trx.data.data.clone()),
                timestamp: trx.data.timestamp,
            };
            store.add_post_with(writer, group_id, &content);
        }
        TrxKind::Auth => {
            let auth: AuthItem = rmp_deserialize(&plaintext.unwrap_or_default())?;
            if let Err(err) = store.upd_deny_list_with(writer, &auth) {
                warn!("<{}> deny list update skipped: {}", group_id, err.to_string_full());
            }
        }
        TrxKind::Producer => {
            let producer: ProducerItem = rmp_deserialize(&plaintext.unwrap_or_default())?;
            match store.upd_producer_with(writer, &producer) {
                Ok(()) => producers_changed = true,
                Err(err) => {
                    warn!(
                        "<{}> producer list update skipped: {}",
                        group_id,
                        err.to_string_full()
                    );
                }
            }
        }
        TrxKind::Announce => {
            let announce: AnnounceItem = rmp_deserialize(&plaintext.unwrap_or_default())?;
            if let Err(err) = store.upd_announce_with(writer, &announce) {
                warn!(
                    "<{}> announce update skipped: {}",
                    group_id,
                    err.to_string_full()
                );
            }
        }
        kind => {
            warn!("<{}> kind {:?} is never packaged, ignored", group_id, kind);
        }
    }
    Ok(producers_changed)
}

/// Apply every transaction of the gathered blocks.
///
/// Skips already applied transactions (idempotence by id) and replays
/// (non-increasing nonce per sender).
fn apply_trxs<D: Db>(
    store: &ChainStore<D>,
    keys: &GroupKeys,
    item: &GroupItem,
    trxs: &[&Trx],
    writer: &mut BatchWriter<D>,
) -> Result<bool> {
    let mut producers_changed = false;
    for trx in trxs {
        if store.is_trx_exist_with(writer, &trx.id)? {
            debug!(
                "<{}> trx <{}> already applied, record refreshed",
                item.group_id,
                trx.id.to_hex()
            );
            store.add_trx_with(writer, trx);
            continue;
        }

        let account = trx.data.sender_pubkey.to_account_id();
        let applied = store.get_applied_nonce_with(writer, &item.group_id, &account)?;
        if let Some(applied) = applied {
            if trx.data.nonce <= applied {
                debug!(
                    "<{}> trx <{}> nonce {} not above {}, replay dropped",
                    item.group_id,
                    trx.id.to_hex(),
                    trx.data.nonce,
                    applied
                );
                continue;
            }
        }

        producers_changed |= apply_one(store, keys, item, trx, writer)?;
        store.set_applied_nonce_with(writer, &item.group_id, &account, trx.data.nonce);
        store.add_trx_with(writer, trx);
    }
    Ok(producers_changed)
}

/// Commit `block`: the shared tail of `Producer::add_block` and the user
/// path.
///
/// # Errors
///
/// - `BlockAlreadySaved`: the block is already part of the chain, no-op for
///   the caller.
/// - `ParentNotFound`: the parent is not linked yet, the block stays cached
///   and the caller switches the syncer into backward mode.
/// - Validation errors: the block is removed from the cache and rejected.
pub(crate) fn commit_block<D: Db>(
    store: &ChainStore<D>,
    item_lock: &RwLock<GroupItem>,
    keys: &GroupKeys,
    block: &Block,
    collect_resend: bool,
) -> Result<CommitOutcome> {
    let item = item_lock.read().clone();
    let group_id = &item.group_id;

    if store.is_block_exist(&block.id, false)? {
        return Err(ErrorKind::BlockAlreadySaved.into());
    }

    if store.is_block_exist(&block.id, true)? {
        debug!("<{}> block <{}> already cached, record refreshed", group_id, block.id.to_hex());
    }
    store.add_block(block, true)?;

    if !store.is_parent_exist(&block.data.prev_block_id, false)? {
        debug!(
            "<{}> parent of block <{}> missing",
            group_id,
            block.id.to_hex()
        );
        return Err(ErrorKind::ParentNotFound.into());
    }

    let parent = store.get_block(&block.data.prev_block_id, false)?;
    if let Err(err) = block.verify_with_parent(&parent) {
        warn!(
            "<{}> invalid block <{}> dropped from cache: {}",
            group_id,
            block.id.to_hex(),
            err.to_string_full()
        );
        store.rm_block(&block.id, true)?;
        return Err(err);
    }

    // The whole run that became connectable with this block.
    let blocks = store.gather_blocks_from_cache(block)?;

    let mut writer = BatchWriter::new(store.db());
    let trxs: Vec<&Trx> = blocks.iter().flat_map(|block| &block.data.trxs).collect();
    let producers_changed = apply_trxs(store, keys, &item, &trxs, &mut writer)?;

    for block in &blocks {
        debug!(
            "<{}> block <{}> moved from cache to chain",
            group_id,
            block.id.to_hex()
        );
        store.add_block_with(&mut writer, block, false)?;
        store.rm_block_with(&mut writer, &block.id, true);
        store.inc_produced_count_with(&mut writer, group_id, &block.data.producer_pubkey)?;
    }
    // Index the promoted run by height while the chunks are still staged.
    for block in &blocks {
        if let Some(height) = store.get_block_height_with(&writer, &block.id)? {
            store.set_block_seq_with(&mut writer, group_id, height, &block.id);
        }
    }
    writer.commit()?;

    let (new_height, new_tips) =
        store.recal_chain_height(&blocks, item.highest_height, &item.highest_block_id)?;
    debug!(
        "<{}> chain height {} -> {}, {} tip(s)",
        group_id,
        item.highest_height,
        new_height,
        new_tips.len()
    );

    // A linked run that did not reach the canonical height lost the race:
    // my transactions riding on it are resent so they are not silently lost.
    let mut resend_trxs = vec![];
    if collect_resend {
        let branch_height = blocks
            .iter()
            .map(|block| store.get_block_height(&block.id))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(-1);
        if branch_height < new_height {
            let my_pubkey = &item.user_sign_pubkey;
            let trimmed = store.get_trimmed_blocks(&blocks[..1])?;
            for block_id in &trimmed {
                let block = store.get_block(block_id, false)?;
                for trx in &block.data.trxs {
                    if &trx.data.sender_pubkey == my_pubkey {
                        let mut trx = trx.clone();
                        trx.resend_count += 1;
                        resend_trxs.push(trx);
                    }
                }
            }
        }
    }

    {
        let mut item = item_lock.write();
        item.highest_height = new_height;
        item.highest_block_id = new_tips.clone();
        item.last_update = timestamp_nanos();
        store.upd_group(&item)?;
    }

    Ok(CommitOutcome {
        new_height,
        new_tips,
        resend_trxs,
        producers_changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_group_item, TEST_TIMESTAMP};
    use crate::base::schema::{ActionKind, TrxData};
    use crate::chain::store::tests::create_test_store;
    use crate::chain::tests::create_test_keys;
    use crate::chain::ChainStore;
    use crate::crypto::sign::tests::create_test_keypair;
    use crate::crypto::Hashable;
    use crate::db::MemoryDb;
    use std::sync::Arc;

    struct Fixture {
        store: ChainStore<MemoryDb>,
        item: Arc<RwLock<GroupItem>>,
        keys: Arc<GroupKeys>,
        factory: crate::chain::TrxFactory<MemoryDb>,
    }

    fn create_fixture() -> Fixture {
        let store = create_test_store();
        let item = create_test_group_item();
        store.add_genesis_block(&item.genesis_block).unwrap();
        store.add_group(&item).unwrap();
        let item = Arc::new(RwLock::new(item));
        let keys = Arc::new(create_test_keys());
        let factory = crate::chain::TrxFactory::new(
            item.clone(),
            keys.clone(),
            store.clone(),
            30_000_000_000,
        );
        Fixture {
            store,
            item,
            keys,
            factory,
        }
    }

    fn build_block(parent: &Block, trxs: Vec<Trx>, ts: i64) -> Block {
        Block::build(parent, trxs, &create_test_keypair(), ts).unwrap()
    }

    #[test]
    fn commit_applies_posts() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let trx = fixture.factory.post_trx(b"first post", &[]).unwrap();
        let block = build_block(&genesis, vec![trx.clone()], TEST_TIMESTAMP + 1);

        let outcome = commit_block(
            &fixture.store,
            &fixture.item,
            &fixture.keys,
            &block,
            false,
        )
        .unwrap();

        assert_eq!(outcome.new_height, 1);
        assert_eq!(outcome.new_tips, vec![block.id]);
        let contents = fixture
            .store
            .get_group_contents(&fixture.item.read().group_id)
            .unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].content, b"first post");
        // The group record tracks the new tip.
        let item = fixture.item.read();
        assert_eq!(item.highest_height, 1);
        assert_eq!(item.highest_block_id, vec![block.id]);
    }

    #[test]
    fn commit_is_idempotent() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let trx = fixture.factory.post_trx(b"only once", &[]).unwrap();
        let block = build_block(&genesis, vec![trx], TEST_TIMESTAMP + 1);

        commit_block(&fixture.store, &fixture.item, &fixture.keys, &block, false).unwrap();
        let err = commit_block(&fixture.store, &fixture.item, &fixture.keys, &block, false)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BlockAlreadySaved);
        let group_id = fixture.item.read().group_id.clone();
        assert_eq!(fixture.store.get_group_contents(&group_id).unwrap().len(), 1);
        assert_eq!(fixture.item.read().highest_height, 1);
    }

    #[test]
    fn commit_missing_parent_keeps_block_cached() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let b1 = build_block(&genesis, vec![], TEST_TIMESTAMP + 1);
        let b2 = build_block(&b1, vec![], TEST_TIMESTAMP + 2);

        let err = commit_block(&fixture.store, &fixture.item, &fixture.keys, &b2, false)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ParentNotFound);
        assert!(fixture.store.is_block_exist(&b2.id, true).unwrap());
        assert!(!fixture.store.is_block_exist(&b2.id, false).unwrap());
    }

    #[test]
    fn commit_promotes_cached_descendants() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let mut chain = vec![];
        let mut parent = genesis.clone();
        for i in 0..5 {
            let block = build_block(&parent, vec![], TEST_TIMESTAMP + 1 + i);
            chain.push(block.clone());
            parent = block;
        }

        // B5 first: parent missing, stays cached. Then B4..B2 likewise.
        for block in [&chain[4], &chain[3], &chain[2], &chain[1]] {
            let err = commit_block(&fixture.store, &fixture.item, &fixture.keys, block, false)
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::ParentNotFound);
        }

        // B1 connects to genesis and drags the whole run out of the cache.
        let outcome =
            commit_block(&fixture.store, &fixture.item, &fixture.keys, &chain[0], false).unwrap();

        assert_eq!(outcome.new_height, 5);
        assert_eq!(outcome.new_tips, vec![chain[4].id]);
        for (i, block) in chain.iter().enumerate() {
            assert!(fixture.store.is_block_exist(&block.id, false).unwrap());
            assert!(!fixture.store.is_block_exist(&block.id, true).unwrap());
            assert_eq!(
                fixture.store.get_block_height(&block.id).unwrap(),
                i as i64 + 1
            );
        }
        assert_eq!(fixture.item.read().highest_height, 5);
    }

    #[test]
    fn commit_invalid_block_dropped() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let mut block = build_block(&genesis, vec![], TEST_TIMESTAMP + 1);
        block.signature[0] ^= 0xff;

        let err = commit_block(&fixture.store, &fixture.item, &fixture.keys, &block, false)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
        assert!(!fixture.store.is_block_exist(&block.id, true).unwrap());
        assert!(!fixture.store.is_block_exist(&block.id, false).unwrap());
    }

    #[test]
    fn replayed_nonce_not_applied_twice() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let trx = fixture.factory.post_trx(b"pay once", &[]).unwrap();

        // The same payload re-signed under a non-increasing nonce.
        let mut replay_data = trx.data.clone();
        replay_data.nonce = trx.data.nonce;
        replay_data.timestamp += 1;
        let id = replay_data.primary_hash();
        let signature = fixture.keys.keypair.sign(id.as_bytes()).unwrap();
        let replay = Trx {
            id,
            data: replay_data,
            signature,
            resend_count: 0,
        };

        let b1 = build_block(&genesis, vec![trx], TEST_TIMESTAMP + 1);
        commit_block(&fixture.store, &fixture.item, &fixture.keys, &b1, false).unwrap();
        let b2 = build_block(&b1, vec![replay], TEST_TIMESTAMP + 2);
        commit_block(&fixture.store, &fixture.item, &fixture.keys, &b2, false).unwrap();

        let group_id = fixture.item.read().group_id.clone();
        assert_eq!(fixture.store.get_group_contents(&group_id).unwrap().len(), 1);
    }

    #[test]
    fn producer_update_flags_pool_rebuild() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let producer_item = crate::base::schema::ProducerItem {
            group_id: fixture.item.read().group_id.clone(),
            producer_pubkey: create_test_keypair().public_key(),
            action: ActionKind::Add,
            memo: String::new(),
        };
        let trx = fixture.factory.producer_trx(&producer_item).unwrap();
        let block = build_block(&genesis, vec![trx], TEST_TIMESTAMP + 1);

        let outcome =
            commit_block(&fixture.store, &fixture.item, &fixture.keys, &block, false).unwrap();

        assert!(outcome.producers_changed);
        let group_id = fixture.item.read().group_id.clone();
        assert_eq!(fixture.store.get_producers(&group_id).unwrap().len(), 1);
    }

    #[test]
    fn losing_branch_trxs_are_resent() {
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();

        // Canonical branch two blocks deep.
        let c1 = build_block(&genesis, vec![], TEST_TIMESTAMP + 1);
        let c2 = build_block(&c1, vec![], TEST_TIMESTAMP + 2);
        commit_block(&fixture.store, &fixture.item, &fixture.keys, &c1, true).unwrap();
        commit_block(&fixture.store, &fixture.item, &fixture.keys, &c2, true).unwrap();

        // A late rival carrying my transaction links at height 1 and loses.
        let mine = fixture.factory.post_trx(b"on the losing side", &[]).unwrap();
        let rival = build_block(&genesis, vec![mine.clone()], TEST_TIMESTAMP + 3);

        let outcome =
            commit_block(&fixture.store, &fixture.item, &fixture.keys, &rival, true).unwrap();

        assert_eq!(outcome.new_height, 2);
        assert_eq!(outcome.resend_trxs.len(), 1);
        assert_eq!(outcome.resend_trxs[0].id, mine.id);
        assert_eq!(outcome.resend_trxs[0].resend_count, 1);
    }

    #[test]
    fn expired_window_is_not_rechecked_at_commit() {
        // Expiry is an admission check: a block already carrying the trx is
        // applied as-is even when time passed the window meanwhile.
        let fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let keys = create_test_keys();
        let data = TrxData {
            group_id: fixture.item.read().group_id.clone(),
            kind: crate::base::schema::TrxKind::Post,
            sender_pubkey: keys.keypair.public_key(),
            nonce: 1,
            data: crate::crypto::cipher::aes_encrypt(&keys.cipher_key, b"old").unwrap(),
            timestamp: 1,
            expired: 2,
        };
        let id = data.primary_hash();
        let signature = keys.keypair.sign(id.as_bytes()).unwrap();
        let trx = Trx {
            id,
            data,
            signature,
            resend_count: 0,
        };
        let block = build_block(&genesis, vec![trx], TEST_TIMESTAMP + 1);

        commit_block(&fixture.store, &fixture.item, &fixture.keys, &block, false).unwrap();

        let group_id = fixture.item.read().group_id.clone();
        assert_eq!(fixture.store.get_group_contents(&group_id).unwrap().len(), 1);
    }
}
