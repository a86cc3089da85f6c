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

//! Proof-of-authority block production.
//!
//! The first transaction entering an empty pool arms the production timer.
//! When it fires, the whole pool snapshot is packaged into one block on the
//! current tip, signed and broadcast on the producer channel. Candidate
//! blocks from other producers are collected during a bounded merge window;
//! the winner is the candidate whose `sha256(signature)` is
//! lexicographically largest, losers' own transactions are re-published.
//!
//! The struct owns no timer task: it exposes deadlines and the worker loop
//! drives it, so all state mutation happens on one task.

use crate::base::schema::{Block, BlockId, GroupItem, Trx, TrxId};
use crate::base::{timestamp_nanos, RwLock};
use crate::chain::apply::{commit_block, CommitOutcome};
use crate::chain::factory::TrxFactory;
use crate::chain::message::Outbound;
use crate::chain::store::ChainStore;
use crate::chain::{ChainConfig, GroupKeys, TRXS_TOTAL_SIZE};
use crate::base::schema::Package;
use crate::db::Db;
use crate::{Error, ErrorKind, Result};
use ring::digest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Producer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Idle,
    Producing,
    Merging,
}

/// What a timer tick produced, to be acted on by the worker loop.
#[derive(Default)]
pub(crate) struct ProducerOutput {
    pub outbound: Vec<Outbound>,
    /// Set when a merge winner could not be linked: the syncer must go
    /// backward from this block.
    pub sync_backward_from: Option<Block>,
    /// The committed block changed the producer list.
    pub producers_changed: bool,
}

/// Select the merge winner: the candidate whose `sha256(signature)` is
/// lexicographically largest. Pure function of the candidate signatures.
pub(crate) fn select_winner(candidates: &HashMap<BlockId, Block>) -> Option<Block> {
    let mut winner: Option<(&Block, Vec<u8>)> = None;
    for block in candidates.values() {
        let hash = digest::digest(&digest::SHA256, &block.signature)
            .as_ref()
            .to_vec();
        match &winner {
            Some((_, best)) if *best >= hash => {}
            _ => winner = Some((block, hash)),
        }
    }
    winner.map(|(block, _)| block.clone())
}

/// Proof-of-authority producer context data.
pub(crate) struct Producer<D: Db> {
    item: Arc<RwLock<GroupItem>>,
    keys: Arc<GroupKeys>,
    store: ChainStore<D>,
    factory: TrxFactory<D>,
    config: ChainConfig,
    /// Pending transactions, replaced wholesale on production.
    trx_pool: HashMap<TrxId, Trx>,
    /// Candidate blocks collected during the merge window.
    block_pool: HashMap<BlockId, Block>,
    status: ProducerStatus,
    produce_deadline: Option<Instant>,
    merge_deadline: Option<Instant>,
}

impl<D: Db> Producer<D> {
    pub fn new(
        item: Arc<RwLock<GroupItem>>,
        keys: Arc<GroupKeys>,
        store: ChainStore<D>,
        factory: TrxFactory<D>,
        config: ChainConfig,
    ) -> Self {
        info!("<{}> producer created", item.read().group_id);
        Producer {
            item,
            keys,
            store,
            factory,
            config,
            trx_pool: HashMap::new(),
            block_pool: HashMap::new(),
            status: ProducerStatus::Idle,
            produce_deadline: None,
            merge_deadline: None,
        }
    }

    pub fn status(&self) -> ProducerStatus {
        self.status
    }

    pub fn pool_len(&self) -> usize {
        self.trx_pool.len()
    }

    /// Earliest pending deadline, drives the worker's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.produce_deadline, self.merge_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Accept a transaction into the pool. The first transaction entering an
    /// empty idle pool arms the production timer.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` for deny-listed senders, `DuplicatedTrx` for already
    /// packaged transactions and nonce replays.
    pub fn add_trx(&mut self, trx: Trx, now: Instant) -> Result<()> {
        let group_id = self.item.read().group_id.clone();
        let account = trx.data.sender_pubkey.to_account_id();

        if self.store.is_denied(&group_id, &account)? {
            debug!("<{}> sender <{}> is deny-listed", group_id, account);
            return Err(ErrorKind::NotAuthorized.into());
        }
        if self.store.is_trx_exist(&trx.id)? {
            debug!(
                "<{}> trx <{}> already packaged, ignored",
                group_id,
                trx.id.to_hex()
            );
            return Err(ErrorKind::DuplicatedTrx.into());
        }
        if let Some(applied) = self.store.get_applied_nonce(&group_id, &account)? {
            if trx.data.nonce <= applied {
                debug!(
                    "<{}> trx <{}> nonce {} replayed, ignored",
                    group_id,
                    trx.id.to_hex(),
                    trx.data.nonce
                );
                return Err(ErrorKind::DuplicatedTrx.into());
            }
        }

        debug!("<{}> trx <{}> pooled", group_id, trx.id.to_hex());
        self.trx_pool.insert(trx.id, trx);

        if self.status == ProducerStatus::Idle {
            self.status = ProducerStatus::Producing;
            self.produce_deadline = Some(now + self.config.produce_timeout);
            debug!("<{}> production timer armed", group_id);
        }
        Ok(())
    }

    /// Collect a candidate block for the current slot. Arms the merge window
    /// on the first candidate.
    pub fn add_produced_block(&mut self, block: Block, now: Instant) {
        let group_id = self.item.read().group_id.clone();
        debug!(
            "<{}> candidate block <{}> collected",
            group_id,
            block.id.to_hex()
        );
        self.block_pool.insert(block.id, block);

        if self.status != ProducerStatus::Merging {
            self.status = ProducerStatus::Merging;
            self.merge_deadline = Some(now + self.config.merge_timeout);
            debug!("<{}> merge window armed", group_id);
        }
    }

    /// Commit a block through the shared pipeline.
    pub fn add_block(&mut self, block: &Block) -> Result<CommitOutcome> {
        commit_block(&self.store, &self.item, &self.keys, block, false)
    }

    /// Fire the deadlines that are due.
    pub fn on_timer(&mut self, now: Instant) -> Result<ProducerOutput> {
        let mut output = ProducerOutput::default();
        if matches!(self.merge_deadline, Some(deadline) if deadline <= now) {
            self.merge_deadline = None;
            self.merge(now, &mut output)?;
        }
        if matches!(self.produce_deadline, Some(deadline) if deadline <= now) {
            self.produce_deadline = None;
            self.produce_block(now, &mut output)?;
        }
        Ok(output)
    }

    /// Package the pool snapshot into one block on the current tip and
    /// broadcast it. The snapshot is authoritative: what is drained now is
    /// exactly what the block carries.
    fn produce_block(&mut self, now: Instant, output: &mut ProducerOutput) -> Result<()> {
        let (group_id, tips, height) = {
            let item = self.item.read();
            (
                item.group_id.clone(),
                item.highest_block_id.clone(),
                item.highest_height,
            )
        };
        if self.trx_pool.is_empty() {
            self.status = ProducerStatus::Idle;
            return Ok(());
        }

        // Packaging order: nonce, then id. Never re-sorted afterwards.
        let mut trxs: Vec<Trx> = self.trx_pool.values().cloned().collect();
        trxs.sort_by(|a, b| (a.data.nonce, a.id).cmp(&(b.data.nonce, b.id)));

        let mut packaged = vec![];
        let mut total_size = 0usize;
        for trx in trxs {
            total_size += trx.data.data.len();
            if total_size > TRXS_TOTAL_SIZE && !packaged.is_empty() {
                break;
            }
            self.trx_pool.remove(&trx.id);
            packaged.push(trx);
        }
        debug!(
            "<{}> packaging {} trx(s), {} left for the next round",
            group_id,
            packaged.len(),
            self.trx_pool.len()
        );

        let tip_id = tips
            .first()
            .copied()
            .ok_or_else(|| Error::new_ext(ErrorKind::ResourceNotFound, "group has no tip"))?;
        let tip = self.store.get_block(&tip_id, false)?;
        let new_block = Block::build(&tip, packaged, &self.keys.keypair, timestamp_nanos())?;
        info!(
            "<{}> produced block <{}> on height {}",
            group_id,
            new_block.id.to_hex(),
            height + 1
        );

        let trx = self.factory.block_produced_trx(&new_block)?;
        output.outbound.push(Outbound::producer(Package::from_trx(&trx)));

        // Collect the own candidate right away instead of waiting for the
        // pubsub echo, then wait for the merge window.
        self.add_produced_block(new_block, now);
        Ok(())
    }

    /// Merge window elapsed: pick the winner, commit it, re-publish the own
    /// transactions of the losing candidates.
    fn merge(&mut self, now: Instant, output: &mut ProducerOutput) -> Result<()> {
        let group_id = self.item.read().group_id.clone();
        let my_pubkey = self.item.read().user_sign_pubkey.clone();

        let winner = match select_winner(&self.block_pool) {
            Some(winner) => winner,
            None => {
                self.status = ProducerStatus::Idle;
                return Ok(());
            }
        };
        let owner_pubkey = self.item.read().owner_pubkey.clone();
        let surfix = match winner.data.producer_pubkey == owner_pubkey {
            true => "OWNER",
            false => "PRODUCER",
        };
        debug!(
            "<{}> merge winner <{}> ({})",
            group_id,
            winner.id.to_hex(),
            surfix
        );

        match self.add_block(&winner) {
            Ok(outcome) => {
                output.producers_changed |= outcome.producers_changed;
                // The winner's producer announces the block to the users.
                if winner.data.producer_pubkey == my_pubkey {
                    debug!("<{}> merge winner is mine, announcing", group_id);
                    output
                        .outbound
                        .push(Outbound::user(Package::from_block(&winner)));
                }
            }
            Err(err) if err.kind == ErrorKind::ParentNotFound => {
                debug!(
                    "<{}> winner parent missing, requesting backward sync",
                    group_id
                );
                output.sync_backward_from = Some(winner.clone());
            }
            Err(err) if err.kind == ErrorKind::BlockAlreadySaved => {
                debug!("<{}> winner already saved, merge no-op", group_id);
            }
            Err(err) => {
                warn!(
                    "<{}> merge winner <{}> rejected: {}",
                    group_id,
                    winner.id.to_hex(),
                    err.to_string_full()
                );
            }
        }

        // Losers' own transactions are not silently dropped: bump the resend
        // counter and put them back on the wire, nonce untouched.
        let winner_trxs: Vec<TrxId> = winner.data.trxs.iter().map(|trx| trx.id).collect();
        for (block_id, block) in &self.block_pool {
            if *block_id == winner.id {
                continue;
            }
            for trx in &block.data.trxs {
                if trx.data.sender_pubkey != my_pubkey || winner_trxs.contains(&trx.id) {
                    continue;
                }
                if self.store.is_trx_exist(&trx.id)? {
                    continue;
                }
                let mut resend = trx.clone();
                resend.resend_count += 1;
                debug!(
                    "<{}> resending trx <{}> (resend {})",
                    group_id,
                    resend.id.to_hex(),
                    resend.resend_count
                );
                output
                    .outbound
                    .push(Outbound::producer(Package::from_trx(&resend)));
            }
        }

        self.block_pool.clear();
        self.status = ProducerStatus::Idle;
        debug!("<{}> merge done", group_id);

        if !self.trx_pool.is_empty() {
            self.status = ProducerStatus::Producing;
            self.produce_deadline = Some(now + self.config.produce_timeout);
            debug!("<{}> pool not empty, next production round armed", group_id);
        }
        Ok(())
    }
}
