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

//! Durable block DAG storage.
//!
//! Blocks live as `BlockDbChunk` records in two disjoint namespaces:
//! committed chunks (linked, height assigned) and cached chunks (arrived out
//! of order, height sentinel -1). A cached block is promoted only when its
//! full ancestor path up to an already linked block is present.
//!
//! The store also keeps every per-group table the apply step touches:
//! contents, deny list, producers, announcements, nonces and the block
//! sequence index. The store never retries: `NotFound` lookups yield typed
//! errors, everything else propagates to the calling component.

use crate::base::schema::{
    ActionKind, AnnounceItem, AuthItem, Block, BlockDbChunk, BlockId, ContentItem, GroupItem,
    ProducerItem, Trx, TrxId,
};
use crate::base::serialize::{rmp_deserialize, rmp_serialize, MessagePack};
use crate::crypto::PublicKey;
use crate::db::{BatchWriter, Db};
use crate::{Error, ErrorKind, Result};
use std::collections::HashSet;
use std::sync::Arc;

const TRX_PREFIX: &str = "trx";
const BLK_PREFIX: &str = "blk";
const CHD_PREFIX: &str = "chd";
const SEQ_PREFIX: &str = "seq";
const GRP_PREFIX: &str = "grp";
const CNT_PREFIX: &str = "cnt";
const ATH_PREFIX: &str = "ath";
const PRD_PREFIX: &str = "prd";
const ANN_PREFIX: &str = "ann";
const NONCE_PREFIX: &str = "nonce";
const SND_NONCE_PREFIX: &str = "snonce";
const BLK_COUNT_PREFIX: &str = "blkcnt";

fn blk_key(block_id: &BlockId, cached: bool) -> String {
    match cached {
        true => format!("{}_{}_{}", CHD_PREFIX, BLK_PREFIX, block_id.to_hex()),
        false => format!("{}_{}", BLK_PREFIX, block_id.to_hex()),
    }
}

fn u64_bytes(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn u64_from_bytes(buf: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = buf
        .try_into()
        .map_err(|_| Error::new(ErrorKind::MalformedData))?;
    Ok(u64::from_be_bytes(arr))
}

/// Chain storage facade. One instance serves every group of the node, the
/// records are namespaced by key prefix.
pub struct ChainStore<D: Db> {
    db: Arc<D>,
}

impl<D: Db> Clone for ChainStore<D> {
    fn clone(&self) -> Self {
        ChainStore {
            db: self.db.clone(),
        }
    }
}

impl<D: Db> ChainStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        ChainStore { db }
    }

    /// Backing database handle, used to stage batched mutations.
    pub fn db(&self) -> &D {
        &self.db
    }

    // ---------------------------------------------------------------------
    // Block chunks
    // ---------------------------------------------------------------------

    fn load_chunk(&self, block_id: &BlockId, cached: bool) -> Result<Option<BlockDbChunk>> {
        match self.db.get(&blk_key(block_id, cached))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    fn chunk_or_not_found(&self, block_id: &BlockId, cached: bool) -> Result<BlockDbChunk> {
        self.load_chunk(block_id, cached)?
            .ok_or_else(|| Error::new_ext(ErrorKind::ResourceNotFound, "block chunk not found"))
    }

    /// Install the group genesis block: the only chunk stored at height 0
    /// with no parent link.
    pub fn add_genesis_block(&self, block: &Block) -> Result<()> {
        let chunk = BlockDbChunk {
            block: block.clone(),
            height: 0,
            parent_block_id: None,
            sub_block_ids: vec![],
        };
        let mut writer = BatchWriter::new(self.db.as_ref());
        writer.put(&blk_key(&block.id, false), rmp_serialize(&chunk)?);
        self.set_block_seq_with(&mut writer, &block.data.group_id, 0, &block.id);
        writer.commit()
    }

    /// Store `block`. With `cached = true` the block lands in the cache
    /// namespace untouched. Otherwise the parent chunk is looked up, the
    /// child is linked under it and its height becomes `parent.height + 1`.
    ///
    /// # Errors
    ///
    /// `ParentNotFound` when linking without a stored parent: the signal the
    /// caller consumes to switch the syncer into backward mode.
    pub fn add_block(&self, block: &Block, cached: bool) -> Result<()> {
        let mut writer = BatchWriter::new(self.db.as_ref());
        self.add_block_with(&mut writer, block, cached)?;
        writer.commit()
    }

    /// Batched variant of [`add_block`](Self::add_block), the mutations stay
    /// in `writer`. Reads go through the writer so a parent promoted earlier
    /// in the same batch is visible.
    pub fn add_block_with(
        &self,
        writer: &mut BatchWriter<D>,
        block: &Block,
        cached: bool,
    ) -> Result<()> {
        if cached {
            let chunk = BlockDbChunk::cached(block.clone());
            writer.put(&blk_key(&block.id, true), rmp_serialize(&chunk)?);
            return Ok(());
        }

        // Re-linking a committed block would append a duplicated child entry
        // under the parent, keep the operation idempotent instead.
        if writer.exists(&blk_key(&block.id, false))? {
            return Ok(());
        }

        let parent_key = blk_key(&block.data.prev_block_id, false);
        let mut parent: BlockDbChunk = match writer.get(&parent_key)? {
            Some(buf) => rmp_deserialize(&buf)?,
            None => return Err(ErrorKind::ParentNotFound.into()),
        };

        parent.sub_block_ids.push(block.id);
        let chunk = BlockDbChunk::linked(block.clone(), parent.block.id, parent.height + 1);
        writer.put(&parent_key, rmp_serialize(&parent)?);
        writer.put(&blk_key(&block.id, false), rmp_serialize(&chunk)?);
        Ok(())
    }

    /// Drop a block from one namespace.
    pub fn rm_block(&self, block_id: &BlockId, cached: bool) -> Result<()> {
        self.db.delete(&blk_key(block_id, cached))
    }

    /// Batched variant of [`rm_block`](Self::rm_block).
    pub fn rm_block_with(&self, writer: &mut BatchWriter<D>, block_id: &BlockId, cached: bool) {
        writer.delete(&blk_key(block_id, cached));
    }

    pub fn is_block_exist(&self, block_id: &BlockId, cached: bool) -> Result<bool> {
        Ok(self.db.get(&blk_key(block_id, cached))?.is_some())
    }

    pub fn is_parent_exist(&self, parent_id: &BlockId, cached: bool) -> Result<bool> {
        self.is_block_exist(parent_id, cached)
    }

    pub fn get_block(&self, block_id: &BlockId, cached: bool) -> Result<Block> {
        Ok(self.chunk_or_not_found(block_id, cached)?.block)
    }

    /// Height of a committed block.
    pub fn get_block_height(&self, block_id: &BlockId) -> Result<i64> {
        Ok(self.chunk_or_not_found(block_id, false)?.height)
    }

    /// Materialized children of a committed block (its DAG fan-out). Used to
    /// answer forward sync requests.
    pub fn get_sub_blocks(&self, block_id: &BlockId) -> Result<Vec<Block>> {
        let chunk = self.chunk_or_not_found(block_id, false)?;
        let mut blocks = Vec::with_capacity(chunk.sub_block_ids.len());
        for sub_id in &chunk.sub_block_ids {
            blocks.push(self.chunk_or_not_found(sub_id, false)?.block);
        }
        Ok(blocks)
    }

    /// Immediate ancestor of a committed block. Used to answer backward sync
    /// requests.
    pub fn get_parent_block(&self, block_id: &BlockId) -> Result<Block> {
        let chunk = self.chunk_or_not_found(block_id, false)?;
        let parent_id = chunk
            .parent_block_id
            .ok_or_else(|| Error::new_ext(ErrorKind::ResourceNotFound, "block has no parent"))?;
        Ok(self.chunk_or_not_found(&parent_id, false)?.block)
    }

    /// Starting from `new_block`, repeatedly scan the cache for any block
    /// whose parent is an already collected block, accumulating the whole
    /// connectable run. Terminates when a pass finds nothing new.
    ///
    /// This is how a burst of out-of-order blocks becomes linkable once the
    /// missing ancestor finally arrives.
    pub fn gather_blocks_from_cache(&self, new_block: &Block) -> Result<Vec<Block>> {
        let mut blocks = vec![new_block.clone()];
        let mut collected: HashSet<BlockId> = HashSet::new();
        collected.insert(new_block.id);

        let cache_prefix = format!("{}_{}_", CHD_PREFIX, BLK_PREFIX);
        loop {
            let mut found_new = false;
            for (_key, buf) in self.db.prefix_scan(&cache_prefix)? {
                let chunk: BlockDbChunk = rmp_deserialize(&buf)?;
                if collected.contains(&chunk.block.id) {
                    continue;
                }
                if collected.contains(&chunk.block.data.prev_block_id) {
                    collected.insert(chunk.block.id);
                    blocks.push(chunk.block);
                    found_new = true;
                }
            }
            if !found_new {
                break;
            }
        }
        Ok(blocks)
    }

    /// Recompute the canonical height and tip set after `blocks` got linked.
    /// Ties are kept, not broken: every block at the maximum height stays in
    /// the returned set.
    pub fn recal_chain_height(
        &self,
        blocks: &[Block],
        current_height: i64,
        current_tips: &[BlockId],
    ) -> Result<(i64, Vec<BlockId>)> {
        let mut new_height = current_height;
        let mut tips: Vec<BlockId> = current_tips.to_vec();

        for block in blocks {
            let height = self.get_block_height(&block.id)?;
            if height > new_height {
                new_height = height;
                tips = vec![block.id];
            } else if height == new_height && !tips.contains(&block.id) {
                tips.push(block.id);
            }
        }

        tips.sort();
        Ok((new_height, tips))
    }

    /// Depth-first traversal from `roots` collecting every descendant block
    /// id. Used to find the transactions that were building on a branch that
    /// lost the height race and must be resent.
    pub fn get_trimmed_blocks(&self, roots: &[Block]) -> Result<Vec<BlockId>> {
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut result = vec![];
        let mut stack: Vec<BlockId> = roots.iter().map(|block| block.id).collect();

        while let Some(block_id) = stack.pop() {
            if !visited.insert(block_id) {
                continue;
            }
            result.push(block_id);
            let chunk = self.chunk_or_not_found(&block_id, false)?;
            for sub_id in chunk.sub_block_ids.iter().rev() {
                stack.push(*sub_id);
            }
        }
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Block sequence index
    // ---------------------------------------------------------------------

    /// `height -> block id` index, O(1) lookup by block number.
    pub fn set_block_seq_with(
        &self,
        writer: &mut BatchWriter<D>,
        group_id: &str,
        height: i64,
        block_id: &BlockId,
    ) {
        let key = format!("{}_{}_{:020}", SEQ_PREFIX, group_id, height.max(0));
        writer.put(&key, block_id.to_bytes());
    }

    pub fn get_block_id_by_seq(&self, group_id: &str, height: i64) -> Result<Option<BlockId>> {
        let key = format!("{}_{}_{:020}", SEQ_PREFIX, group_id, height.max(0));
        match self.db.get(&key)? {
            Some(buf) => Ok(Some(BlockId::from_bytes(&buf)?)),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    pub fn add_trx_with(&self, writer: &mut BatchWriter<D>, trx: &Trx) {
        let key = format!("{}_{}", TRX_PREFIX, trx.id.to_hex());
        writer.put(&key, trx.serialize());
    }

    pub fn get_trx(&self, trx_id: &TrxId) -> Result<Option<Trx>> {
        match self.db.get(&format!("{}_{}", TRX_PREFIX, trx_id.to_hex()))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn is_trx_exist(&self, trx_id: &TrxId) -> Result<bool> {
        Ok(self
            .db
            .get(&format!("{}_{}", TRX_PREFIX, trx_id.to_hex()))?
            .is_some())
    }

    /// Existence probe reading through a pending batch.
    pub fn is_trx_exist_with(&self, writer: &BatchWriter<D>, trx_id: &TrxId) -> Result<bool> {
        writer.exists(&format!("{}_{}", TRX_PREFIX, trx_id.to_hex()))
    }

    /// Committed height of a chunk staged in `writer` (or already stored).
    pub fn get_block_height_with(
        &self,
        writer: &BatchWriter<D>,
        block_id: &BlockId,
    ) -> Result<Option<i64>> {
        match writer.get(&blk_key(block_id, false))? {
            Some(buf) => {
                let chunk: BlockDbChunk = rmp_deserialize(&buf)?;
                Ok(Some(chunk.height))
            }
            None => Ok(None),
        }
    }

    /// Next per-group nonce, strictly increasing. First allocation is 1.
    pub fn next_nonce(&self, group_id: &str) -> Result<u64> {
        let key = format!("{}_{}", NONCE_PREFIX, group_id);
        let next = match self.db.get(&key)? {
            Some(buf) => u64_from_bytes(&buf)? + 1,
            None => 1,
        };
        self.db.set(&key, u64_bytes(next))?;
        Ok(next)
    }

    /// Highest applied nonce for a sender within a group. `None` before the
    /// first applied transaction.
    pub fn get_applied_nonce(&self, group_id: &str, account: &str) -> Result<Option<u64>> {
        let key = format!("{}_{}_{}", SND_NONCE_PREFIX, group_id, account);
        match self.db.get(&key)? {
            Some(buf) => Ok(Some(u64_from_bytes(&buf)?)),
            None => Ok(None),
        }
    }

    /// Variant of [`get_applied_nonce`](Self::get_applied_nonce) reading
    /// through a pending batch.
    pub fn get_applied_nonce_with(
        &self,
        writer: &BatchWriter<D>,
        group_id: &str,
        account: &str,
    ) -> Result<Option<u64>> {
        let key = format!("{}_{}_{}", SND_NONCE_PREFIX, group_id, account);
        match writer.get(&key)? {
            Some(buf) => Ok(Some(u64_from_bytes(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn set_applied_nonce_with(
        &self,
        writer: &mut BatchWriter<D>,
        group_id: &str,
        account: &str,
        nonce: u64,
    ) {
        let key = format!("{}_{}_{}", SND_NONCE_PREFIX, group_id, account);
        writer.put(&key, u64_bytes(nonce));
    }

    // ---------------------------------------------------------------------
    // Group records
    // ---------------------------------------------------------------------

    fn grp_key(group_id: &str) -> String {
        format!("{}_{}", GRP_PREFIX, group_id)
    }

    pub fn add_group(&self, item: &GroupItem) -> Result<()> {
        if self.db.get(&Self::grp_key(&item.group_id))?.is_some() {
            return Err(Error::new_ext(
                ErrorKind::Other,
                "group with the same id already exists",
            ));
        }
        self.db
            .set(&Self::grp_key(&item.group_id), rmp_serialize(item)?)
    }

    pub fn upd_group(&self, item: &GroupItem) -> Result<()> {
        self.db
            .set(&Self::grp_key(&item.group_id), rmp_serialize(item)?)
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<GroupItem>> {
        match self.db.get(&Self::grp_key(group_id))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn get_groups(&self) -> Result<Vec<GroupItem>> {
        let mut groups = vec![];
        for (_key, buf) in self.db.prefix_scan(&format!("{}_", GRP_PREFIX))? {
            groups.push(rmp_deserialize(&buf)?);
        }
        Ok(groups)
    }

    pub fn rm_group(&self, group_id: &str) -> Result<()> {
        if self.db.get(&Self::grp_key(group_id))?.is_none() {
            return Err(Error::new_ext(ErrorKind::ResourceNotFound, "unknown group"));
        }
        self.db.delete(&Self::grp_key(group_id))
    }

    /// Drop every record the group left behind: tables, indexes and the
    /// blocks of both namespaces. Used by group delete/leave.
    pub fn clear_group_data(&self, group_id: &str) -> Result<()> {
        let mut writer = BatchWriter::new(self.db.as_ref());
        for prefix in [
            format!("{}_{}_", CNT_PREFIX, group_id),
            format!("{}_{}_", ATH_PREFIX, group_id),
            format!("{}_{}_", PRD_PREFIX, group_id),
            format!("{}_{}_", ANN_PREFIX, group_id),
            format!("{}_{}_", SEQ_PREFIX, group_id),
            format!("{}_{}_", BLK_COUNT_PREFIX, group_id),
            format!("{}_{}", NONCE_PREFIX, group_id),
            format!("{}_{}_", SND_NONCE_PREFIX, group_id),
        ] {
            for (key, _) in self.db.prefix_scan(&prefix)? {
                writer.delete(&key);
            }
        }
        // Blocks are keyed by id: enumerate and match on the owning group.
        for cached in [false, true] {
            let prefix = match cached {
                true => format!("{}_{}_", CHD_PREFIX, BLK_PREFIX),
                false => format!("{}_", BLK_PREFIX),
            };
            for (key, buf) in self.db.prefix_scan(&prefix)? {
                let chunk: BlockDbChunk = rmp_deserialize(&buf)?;
                if chunk.block.data.group_id == group_id {
                    writer.delete(&key);
                }
            }
        }
        writer.commit()
    }

    // ---------------------------------------------------------------------
    // Applied side-effect tables
    // ---------------------------------------------------------------------

    pub fn add_post_with(&self, writer: &mut BatchWriter<D>, group_id: &str, item: &ContentItem) {
        let key = format!(
            "{}_{}_{:020}_{}",
            CNT_PREFIX,
            group_id,
            item.timestamp.max(0),
            item.trx_id.to_hex()
        );
        writer.put(&key, item.serialize());
    }

    /// Group contents in timestamp order.
    pub fn get_group_contents(&self, group_id: &str) -> Result<Vec<ContentItem>> {
        let mut contents = vec![];
        for (_key, buf) in self
            .db
            .prefix_scan(&format!("{}_{}_", CNT_PREFIX, group_id))?
        {
            contents.push(rmp_deserialize(&buf)?);
        }
        Ok(contents)
    }

    pub fn upd_deny_list_with(
        &self,
        writer: &mut BatchWriter<D>,
        item: &AuthItem,
    ) -> Result<()> {
        let key = format!(
            "{}_{}_{}",
            ATH_PREFIX,
            item.group_id,
            item.peer_pubkey.to_account_id()
        );
        match item.action {
            ActionKind::Add => {
                writer.put(&key, item.serialize());
                Ok(())
            }
            ActionKind::Remove => {
                if !writer.exists(&key)? {
                    return Err(Error::new_ext(
                        ErrorKind::ResourceNotFound,
                        "peer not in deny list",
                    ));
                }
                writer.delete(&key);
                Ok(())
            }
        }
    }

    pub fn is_denied(&self, group_id: &str, account: &str) -> Result<bool> {
        let key = format!("{}_{}_{}", ATH_PREFIX, group_id, account);
        Ok(self.db.get(&key)?.is_some())
    }

    pub fn get_denied_users(&self, group_id: &str) -> Result<Vec<AuthItem>> {
        let mut items = vec![];
        for (_key, buf) in self
            .db
            .prefix_scan(&format!("{}_{}_", ATH_PREFIX, group_id))?
        {
            items.push(rmp_deserialize(&buf)?);
        }
        Ok(items)
    }

    pub fn upd_producer_with(
        &self,
        writer: &mut BatchWriter<D>,
        item: &ProducerItem,
    ) -> Result<()> {
        let key = format!(
            "{}_{}_{}",
            PRD_PREFIX,
            item.group_id,
            item.producer_pubkey.to_account_id()
        );
        match item.action {
            ActionKind::Add => {
                writer.put(&key, item.serialize());
                Ok(())
            }
            ActionKind::Remove => {
                if !writer.exists(&key)? {
                    return Err(Error::new_ext(
                        ErrorKind::ResourceNotFound,
                        "producer not registered",
                    ));
                }
                writer.delete(&key);
                Ok(())
            }
        }
    }

    pub fn get_producers(&self, group_id: &str) -> Result<Vec<ProducerItem>> {
        let mut items = vec![];
        for (_key, buf) in self
            .db
            .prefix_scan(&format!("{}_{}_", PRD_PREFIX, group_id))?
        {
            items.push(rmp_deserialize(&buf)?);
        }
        Ok(items)
    }

    pub fn is_producer(&self, group_id: &str, account: &str) -> Result<bool> {
        let key = format!("{}_{}_{}", PRD_PREFIX, group_id, account);
        Ok(self.db.get(&key)?.is_some())
    }

    pub fn upd_announce_with(
        &self,
        writer: &mut BatchWriter<D>,
        item: &AnnounceItem,
    ) -> Result<()> {
        let key = format!(
            "{}_{}_{}",
            ANN_PREFIX,
            item.group_id,
            item.sign_pubkey.to_account_id()
        );
        match item.action {
            ActionKind::Add => {
                writer.put(&key, item.serialize());
                Ok(())
            }
            ActionKind::Remove => {
                if !writer.exists(&key)? {
                    return Err(Error::new_ext(
                        ErrorKind::ResourceNotFound,
                        "member not announced",
                    ));
                }
                writer.delete(&key);
                Ok(())
            }
        }
    }

    pub fn get_announced_users(&self, group_id: &str) -> Result<Vec<AnnounceItem>> {
        let mut items = vec![];
        for (_key, buf) in self
            .db
            .prefix_scan(&format!("{}_{}_", ANN_PREFIX, group_id))?
        {
            items.push(rmp_deserialize(&buf)?);
        }
        Ok(items)
    }

    /// Encryption recipients of a private group: the announced members'
    /// x25519 keys.
    pub fn get_encrypt_pubkeys(&self, group_id: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .get_announced_users(group_id)?
            .into_iter()
            .map(|item| item.encrypt_pubkey)
            .collect())
    }

    /// Per-producer count of committed blocks.
    pub fn inc_produced_count_with(
        &self,
        writer: &mut BatchWriter<D>,
        group_id: &str,
        producer_pubkey: &PublicKey,
    ) -> Result<()> {
        let key = format!(
            "{}_{}_{}",
            BLK_COUNT_PREFIX,
            group_id,
            producer_pubkey.to_account_id()
        );
        let count = match writer.get(&key)? {
            Some(buf) => u64_from_bytes(&buf)? + 1,
            None => 1,
        };
        writer.put(&key, u64_bytes(count));
        Ok(())
    }

    pub fn get_produced_count(&self, group_id: &str, account: &str) -> Result<u64> {
        let key = format!("{}_{}_{}", BLK_COUNT_PREFIX, group_id, account);
        match self.db.get(&key)? {
            Some(buf) => u64_from_bytes(&buf),
            None => Ok(0),
        }
    }
}
