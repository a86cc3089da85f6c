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

//! Challenge production policy (experimental alternate to POA).
//!
//! Any node may claim a production turn by broadcasting a random seed.
//! After a fixed collection window all seeds are sorted ascending and turns
//! are attempted in that order: the node owning the current seed produces a
//! block and the others wait for it. A turn that gathers a two-thirds
//! acceptance (all of it for one or two challengers) finishes the round; a
//! turn that times out passes to the next seed. When the seed list is
//! exhausted the round fails and the pooled transactions are dropped.

use crate::base::schema::{
    Block, ChallengeItem, GroupItem, NewBlockRespItem, NewBlockRespResult, Package, Trx, TrxId,
};
use crate::base::{timestamp_nanos, RwLock};
use crate::chain::apply::commit_block;
use crate::chain::factory::TrxFactory;
use crate::chain::message::Outbound;
use crate::chain::store::ChainStore;
use crate::chain::{ChainConfig, GroupKeys};
use crate::db::Db;
use crate::{ErrorKind, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Round states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Idle,
    /// Collecting challenge seeds.
    Challenge,
    /// Walking the sorted seed list.
    Produce,
}

/// Acceptances needed for `challengers` participants: two thirds, except
/// that one or two participants must all agree.
pub(crate) fn accepts_needed(challengers: usize) -> usize {
    match challengers {
        0 | 1 | 2 => challengers,
        n => n * 2 / 3,
    }
}

/// What a timer tick changed.
#[derive(Default)]
pub(crate) struct ChallengeTick {
    pub outbound: Vec<Outbound>,
    /// The round exhausted every challenger and dropped its pool.
    pub round_failed: bool,
}

/// Challenge round context data.
pub(crate) struct ChallengeRound<D: Db> {
    item: Arc<RwLock<GroupItem>>,
    keys: Arc<GroupKeys>,
    store: ChainStore<D>,
    factory: TrxFactory<D>,
    config: ChainConfig,
    trx_pool: HashMap<TrxId, Trx>,
    status: RoundStatus,
    /// Seeds collected this round. BTreeMap keeps the turn order.
    challenge_pool: BTreeMap<u64, ChallengeItem>,
    /// Cursor into the sorted seed list.
    index_position: usize,
    accept_needed: usize,
    accept_recvd: usize,
    /// Own candidate block while waiting for acceptances.
    candidate: Option<Block>,
    challenge_deadline: Option<Instant>,
    wait_block_deadline: Option<Instant>,
}

impl<D: Db> ChallengeRound<D> {
    pub fn new(
        item: Arc<RwLock<GroupItem>>,
        keys: Arc<GroupKeys>,
        store: ChainStore<D>,
        factory: TrxFactory<D>,
        config: ChainConfig,
    ) -> Self {
        info!("<{}> challenge producer created", item.read().group_id);
        ChallengeRound {
            item,
            keys,
            store,
            factory,
            config,
            trx_pool: HashMap::new(),
            status: RoundStatus::Idle,
            challenge_pool: BTreeMap::new(),
            index_position: 0,
            accept_needed: 0,
            accept_recvd: 0,
            candidate: None,
            challenge_deadline: None,
            wait_block_deadline: None,
        }
    }

    pub fn status(&self) -> RoundStatus {
        self.status
    }

    pub fn pool_len(&self) -> usize {
        self.trx_pool.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.challenge_deadline, self.wait_block_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn group_id(&self) -> String {
        self.item.read().group_id.clone()
    }

    /// Add a transaction to the pool, opening a round if none is running.
    pub fn add_trx(&mut self, trx: Trx, now: Instant) -> Result<Vec<Outbound>> {
        self.trx_pool.insert(trx.id, trx);
        match self.status {
            RoundStatus::Idle => self.open_round(None, now),
            _ => Ok(vec![]),
        }
    }

    /// A challenge claim arrived from the wire.
    pub fn update_challenge(
        &mut self,
        challenge: ChallengeItem,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let group_id = self.group_id();
        match self.status {
            RoundStatus::Idle => {
                debug!("<{}> challenge received while idle, joining", group_id);
                self.open_round(Some(challenge), now)
            }
            RoundStatus::Challenge => {
                debug!(
                    "<{}> challenge seed {} collected",
                    group_id, challenge.seed
                );
                self.challenge_pool.insert(challenge.seed, challenge);
                Ok(vec![])
            }
            RoundStatus::Produce => {
                debug!("<{}> producing, challenge ignored", group_id);
                Ok(vec![])
            }
        }
    }

    /// Open a round: claim a turn with a fresh random seed and start the
    /// collection window. `peer_challenge` is the claim that triggered the
    /// round, when it came from the wire.
    fn open_round(
        &mut self,
        peer_challenge: Option<ChallengeItem>,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let my_challenge = ChallengeItem {
            challenger_pubkey: self.item.read().user_sign_pubkey.clone(),
            seed: rand::random(),
        };
        let trx = self.factory.challenge_trx(&my_challenge)?;
        self.challenge_pool
            .insert(my_challenge.seed, my_challenge);
        if let Some(challenge) = peer_challenge {
            self.challenge_pool.insert(challenge.seed, challenge);
        }

        self.status = RoundStatus::Challenge;
        self.challenge_deadline = Some(now + self.config.challenge_timeout);
        debug!("<{}> challenge round opened", self.group_id());
        Ok(vec![Outbound::producer(Package::from_trx(&trx))])
    }

    /// Fire the deadlines that are due.
    pub fn on_timer(&mut self, now: Instant) -> Result<ChallengeTick> {
        let mut tick = ChallengeTick::default();

        if matches!(self.challenge_deadline, Some(deadline) if deadline <= now) {
            self.challenge_deadline = None;
            let challengers = self.challenge_pool.len();
            self.accept_needed = accepts_needed(challengers);
            self.index_position = 0;
            self.status = RoundStatus::Produce;
            debug!(
                "<{}> challenge window closed: {} challenger(s), {} accept(s) needed",
                self.group_id(),
                challengers,
                self.accept_needed
            );
            self.try_produce(now, &mut tick)?;
        }

        if matches!(self.wait_block_deadline, Some(deadline) if deadline <= now) {
            self.wait_block_deadline = None;
            self.index_position += 1;
            if self.index_position >= self.challenge_pool.len() {
                warn!(
                    "<{}> every challenger failed to produce, round dropped",
                    self.group_id()
                );
                self.fail_round();
                tick.round_failed = true;
            } else {
                debug!(
                    "<{}> turn timed out, cursor moved to {}",
                    self.group_id(),
                    self.index_position
                );
                self.try_produce(now, &mut tick)?;
            }
        }

        Ok(tick)
    }

    /// The challenger whose turn it currently is.
    fn current_challenger(&self) -> Option<&ChallengeItem> {
        self.challenge_pool.values().nth(self.index_position)
    }

    /// Attempt the current turn: produce when it is mine, wait otherwise.
    fn try_produce(&mut self, now: Instant, tick: &mut ChallengeTick) -> Result<()> {
        let my_pubkey = self.item.read().user_sign_pubkey.clone();
        let my_turn = match self.current_challenger() {
            Some(challenge) => challenge.challenger_pubkey == my_pubkey,
            None => {
                self.fail_round();
                tick.round_failed = true;
                return Ok(());
            }
        };

        if !my_turn {
            debug!("<{}> not my turn, waiting for the block", self.group_id());
            self.wait_block_deadline = Some(now + self.config.challenge_wait_timeout);
            return Ok(());
        }

        debug!("<{}> my turn to produce", self.group_id());
        let tip_id = *self
            .item
            .read()
            .highest_block_id
            .first()
            .ok_or_else(|| crate::Error::new(ErrorKind::ResourceNotFound))?;
        let tip = self.store.get_block(&tip_id, false)?;
        let mut trxs: Vec<Trx> = self.trx_pool.values().cloned().collect();
        trxs.sort_by(|a, b| (a.data.nonce, a.id).cmp(&(b.data.nonce, b.id)));
        let block = Block::build(&tip, trxs, &self.keys.keypair, timestamp_nanos())?;

        tick.outbound.push(Outbound::user(Package::from_block(&block)));
        self.accept_recvd = 0;
        self.candidate = Some(block);

        if self.accept_needed <= 1 {
            // Alone in the round: nothing to wait for.
            self.commit_candidate(tick)?;
        } else {
            self.wait_block_deadline = Some(now + self.config.challenge_wait_timeout);
        }
        Ok(())
    }

    /// A block arrived while a round is walking the turns.
    pub fn handle_block(&mut self, block: &Block, now: Instant) -> Result<Vec<Outbound>> {
        if self.status != RoundStatus::Produce {
            return Ok(vec![]);
        }
        let group_id = self.group_id();

        let expected = match self.current_challenger() {
            Some(challenge) => challenge.challenger_pubkey.clone(),
            None => return Ok(vec![]),
        };
        if block.data.producer_pubkey != expected {
            warn!(
                "<{}> block from an out-of-turn producer, rejected",
                group_id
            );
            let resp = self
                .factory
                .new_block_resp_trx(block, NewBlockRespResult::Rejected)?;
            return Ok(vec![Outbound::producer(Package::from_trx(&resp))]);
        }

        match commit_block(&self.store, &self.item, &self.keys, block, false) {
            Ok(_) => {
                debug!("<{}> turn block accepted", group_id);
                let resp = self
                    .factory
                    .new_block_resp_trx(block, NewBlockRespResult::Accepted)?;
                self.finish_round(now);
                Ok(vec![Outbound::producer(Package::from_trx(&resp))])
            }
            Err(err) if err.kind == ErrorKind::BlockAlreadySaved => {
                self.finish_round(now);
                Ok(vec![])
            }
            Err(err) => {
                warn!(
                    "<{}> turn block rejected: {}",
                    group_id,
                    err.to_string_full()
                );
                let resp = self
                    .factory
                    .new_block_resp_trx(block, NewBlockRespResult::Rejected)?;
                Ok(vec![Outbound::producer(Package::from_trx(&resp))])
            }
        }
    }

    /// An acceptance acknowledgment arrived for my candidate.
    pub fn handle_block_resp(&mut self, resp: &NewBlockRespItem) -> Result<Vec<Outbound>> {
        let my_pubkey = self.item.read().user_sign_pubkey.clone();
        if self.status != RoundStatus::Produce
            || resp.block_producer_pubkey != my_pubkey
            || resp.result != NewBlockRespResult::Accepted
        {
            return Ok(vec![]);
        }
        let matches_candidate = self
            .candidate
            .as_ref()
            .map(|block| block.id == resp.block_id)
            .unwrap_or(false);
        if !matches_candidate {
            return Ok(vec![]);
        }

        self.accept_recvd += 1;
        debug!(
            "<{}> acceptance {}/{}",
            self.group_id(),
            self.accept_recvd,
            self.accept_needed
        );
        if self.accept_recvd + 1 >= self.accept_needed {
            let mut tick = ChallengeTick::default();
            self.commit_candidate(&mut tick)?;
            return Ok(tick.outbound);
        }
        Ok(vec![])
    }

    /// Commit the own candidate and close the round.
    fn commit_candidate(&mut self, tick: &mut ChallengeTick) -> Result<()> {
        if let Some(block) = self.candidate.take() {
            match commit_block(&self.store, &self.item, &self.keys, &block, false) {
                Ok(_) => {
                    info!(
                        "<{}> challenge block <{}> committed",
                        self.group_id(),
                        block.id.to_hex()
                    );
                }
                Err(err) if err.kind == ErrorKind::BlockAlreadySaved => {}
                Err(err) => {
                    warn!(
                        "<{}> candidate commit failed: {}",
                        self.group_id(),
                        err.to_string_full()
                    );
                    tick.round_failed = true;
                }
            }
        }
        self.finish_round_inner();
        Ok(())
    }

    fn finish_round(&mut self, _now: Instant) {
        self.finish_round_inner();
    }

    /// Reset the per-round state. The packaged transactions went into the
    /// committed block (or are dropped on failure).
    fn finish_round_inner(&mut self) {
        debug!("<{}> challenge round finished", self.group_id());
        self.trx_pool.clear();
        self.challenge_pool.clear();
        self.index_position = 0;
        self.accept_needed = 0;
        self.accept_recvd = 0;
        self.candidate = None;
        self.challenge_deadline = None;
        self.wait_block_deadline = None;
        self.status = RoundStatus::Idle;
    }

    /// The round exhausted its challengers: drop everything.
    fn fail_round(&mut self) {
        self.finish_round_inner();
    }
}
