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

//! Per-group synchronization state machine.
//!
//! Forward sync catches up to the tip ("give me the blocks after X"),
//! backward sync fills missing ancestors ("give me the block before X").
//! One request is in flight at a time; every respondent of the round is
//! recorded. A round that elapses with no response at all is retried, after
//! five consecutive empty rounds the machine parks in `SyncFailed` until an
//! explicit restart. A round that only collected "not found" answers means
//! the peers confirmed there is nothing further: back to idle.
//!
//! The struct owns no timer task: it exposes its deadline and the worker
//! loop drives it.

use crate::base::schema::{Block, BlockId, GroupItem, Package, ReqBlkResult, ReqBlockRespItem};
use crate::base::RwLock;
use crate::chain::factory::TrxFactory;
use crate::chain::message::Outbound;
use crate::chain::ChainConfig;
use crate::db::Db;
use crate::{Error, ErrorKind, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Syncer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    SyncingForward,
    SyncingBackward,
    /// Terminal until explicitly restarted.
    SyncFailed,
}

/// What a timer tick changed.
#[derive(Default)]
pub(crate) struct SyncerTick {
    pub outbound: Vec<Outbound>,
    /// Set when the retry budget ran out this tick.
    pub failed: bool,
}

/// Synchronization context data.
pub(crate) struct Syncer<D: Db> {
    item: Arc<RwLock<GroupItem>>,
    factory: TrxFactory<D>,
    config: ChainConfig,
    status: SyncStatus,
    /// Consecutive empty-response rounds.
    retry_count: u8,
    /// Responses of the current round, keyed by provider account.
    responses: HashMap<String, ReqBlockRespItem>,
    /// Blocks already applied during this sync session.
    blocks_received: HashSet<BlockId>,
    wait_deadline: Option<Instant>,
    /// The block the outstanding request is anchored at.
    anchor: Option<Block>,
}

impl<D: Db> Syncer<D> {
    pub fn new(item: Arc<RwLock<GroupItem>>, factory: TrxFactory<D>, config: ChainConfig) -> Self {
        info!("<{}> syncer created", item.read().group_id);
        Syncer {
            item,
            factory,
            config,
            status: SyncStatus::Idle,
            retry_count: 0,
            responses: HashMap::new(),
            blocks_received: HashSet::new(),
            wait_deadline: None,
            anchor: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.wait_deadline
    }

    fn group_id(&self) -> String {
        self.item.read().group_id.clone()
    }

    /// Issue a "blocks after X" request and arm the wait window.
    fn ask_next_block(&mut self, block: &Block, now: Instant) -> Result<Vec<Outbound>> {
        debug!(
            "<{}> asking block after <{}>",
            self.group_id(),
            block.id.to_hex()
        );
        self.responses.clear();
        let trx = self.factory.req_block_forward_trx(block)?;
        self.anchor = Some(block.clone());
        self.wait_deadline = Some(now + self.config.sync_timeout);
        Ok(vec![Outbound::producer(Package::from_trx(&trx))])
    }

    /// Issue a "block before X" request and arm the wait window.
    fn ask_previous_block(&mut self, block: &Block, now: Instant) -> Result<Vec<Outbound>> {
        debug!(
            "<{}> asking block before <{}>",
            self.group_id(),
            block.id.to_hex()
        );
        self.responses.clear();
        let trx = self.factory.req_block_backward_trx(block)?;
        self.anchor = Some(block.clone());
        self.wait_deadline = Some(now + self.config.sync_timeout);
        Ok(vec![Outbound::producer(Package::from_trx(&trx))])
    }

    /// Start catching up to the tip from `block`.
    ///
    /// Not entered at all when there is nothing to sync: a sole
    /// owner-producer has nobody to ask, and a registered producer syncs
    /// backward reactively when it hits a missing parent.
    ///
    /// # Errors
    ///
    /// Refuses to start while another session is running.
    pub fn sync_forward(
        &mut self,
        block: &Block,
        is_sole_owner: bool,
        is_producer: bool,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let group_id = self.group_id();
        if is_sole_owner {
            debug!("<{}> sole owner-producer, nothing to sync", group_id);
            return Ok(vec![]);
        }
        if is_producer && !self.item.read().is_owner() {
            debug!(
                "<{}> producer syncs backward on demand, forward skipped",
                group_id
            );
            return Ok(vec![]);
        }
        if matches!(
            self.status,
            SyncStatus::SyncingForward | SyncStatus::SyncingBackward
        ) {
            return Err(Error::new_ext(ErrorKind::Other, "already syncing"));
        }

        debug!(
            "<{}> sync forward from block <{}>",
            group_id,
            block.id.to_hex()
        );
        self.blocks_received.clear();
        self.retry_count = 0;
        self.status = SyncStatus::SyncingForward;
        self.ask_next_block(block, now)
    }

    /// Start filling missing ancestors below `block`.
    pub fn sync_backward(&mut self, block: &Block, now: Instant) -> Result<Vec<Outbound>> {
        let group_id = self.group_id();
        if matches!(
            self.status,
            SyncStatus::SyncingForward | SyncStatus::SyncingBackward
        ) {
            return Err(Error::new_ext(ErrorKind::Other, "already syncing"));
        }

        debug!(
            "<{}> sync backward from block <{}>",
            group_id,
            block.id.to_hex()
        );
        self.blocks_received.clear();
        self.retry_count = 0;
        self.status = SyncStatus::SyncingBackward;
        self.ask_previous_block(block, now)
    }

    /// Re-issue the request of the running session anchored at `block`.
    fn continue_sync(&mut self, block: &Block, now: Instant) -> Result<Vec<Outbound>> {
        match self.status {
            SyncStatus::SyncingForward => self.ask_next_block(block, now),
            SyncStatus::SyncingBackward => self.ask_previous_block(block, now),
            SyncStatus::SyncFailed => {
                debug!("<{}> sync failed, restart it explicitly", self.group_id());
                Ok(vec![])
            }
            SyncStatus::Idle => {
                debug!("<{}> syncer idle, nothing to continue", self.group_id());
                Ok(vec![])
            }
        }
    }

    /// Cancel the wait window and force idle. Used when an independent
    /// signal confirms completion.
    pub fn stop_sync(&mut self) {
        debug!("<{}> sync stopped", self.group_id());
        self.wait_deadline = None;
        self.anchor = None;
        self.retry_count = 0;
        self.status = SyncStatus::Idle;
    }

    /// Record a sync response and, when it carries a block, apply it through
    /// `apply` and keep the session moving in the same direction.
    ///
    /// `ParentNotFound` from the apply path is not an error here, it simply
    /// re-issues the request. Duplicate blocks within one session are
    /// dropped.
    pub fn add_block_synced(
        &mut self,
        resp: &ReqBlockRespItem,
        block: Option<Block>,
        now: Instant,
        apply: &mut dyn FnMut(&Block) -> Result<()>,
    ) -> Result<Vec<Outbound>> {
        let group_id = self.group_id();
        if !matches!(
            self.status,
            SyncStatus::SyncingForward | SyncStatus::SyncingBackward
        ) {
            warn!("<{}> not syncing, response ignored", group_id);
            return Ok(vec![]);
        }

        let provider = resp.provider_pubkey.to_account_id();
        debug!("<{}> sync response from <{}>", group_id, provider);
        self.responses.insert(provider, resp.clone());

        if resp.result == ReqBlkResult::BlockNotFound {
            debug!(
                "<{}> BLOCK_NOT_FOUND response, waiting out the round",
                group_id
            );
            return Ok(vec![]);
        }

        let block = match block {
            Some(block) => block,
            None => return Ok(vec![]),
        };
        if self.blocks_received.contains(&block.id) {
            debug!(
                "<{}> block <{}> already received this session",
                group_id,
                block.id.to_hex()
            );
            return Ok(vec![]);
        }

        let apply_result = apply(&block);
        self.blocks_received.insert(block.id);
        self.retry_count = 0;

        match self.status {
            SyncStatus::SyncingForward => {
                if let Err(err) = &apply_result {
                    info!("<{}> forward apply: {}", group_id, err.to_string_full());
                }
                // Pipelined catch-up: immediately ask for the next one.
                self.continue_sync(&block, now)
            }
            _ => {
                match apply_result {
                    Err(err) if err.kind == ErrorKind::ParentNotFound => {
                        debug!("<{}> still missing an ancestor, continuing", group_id);
                        self.continue_sync(&block, now)
                    }
                    Err(err) => {
                        info!("<{}> backward apply: {}", group_id, err.to_string_full());
                        Ok(vec![])
                    }
                    // The chain connected, the wait window will close the
                    // session when the round is over.
                    Ok(()) => Ok(vec![]),
                }
            }
        }
    }

    /// Fire the wait window if it is due.
    pub fn on_timer(&mut self, now: Instant) -> Result<SyncerTick> {
        let mut tick = SyncerTick::default();
        let due = matches!(self.wait_deadline, Some(deadline) if deadline <= now);
        if !due {
            return Ok(tick);
        }
        self.wait_deadline = None;
        let group_id = self.group_id();

        if !self.responses.is_empty() {
            // Every respondent confirmed there is nothing further in this
            // direction.
            debug!(
                "<{}> {} response(s) this round, sync done",
                group_id,
                self.responses.len()
            );
            self.retry_count = 0;
            self.anchor = None;
            self.status = SyncStatus::Idle;
            return Ok(tick);
        }

        self.retry_count += 1;
        if self.retry_count >= self.config.sync_retry_limit {
            error!(
                "<{}> retry limit <{}> reached, sync failed, check the network",
                group_id, self.config.sync_retry_limit
            );
            self.status = SyncStatus::SyncFailed;
            tick.failed = true;
            return Ok(tick);
        }

        debug!(
            "<{}> empty round, retrying (attempt {})",
            group_id, self.retry_count
        );
        let anchor = match self.anchor.clone() {
            Some(anchor) => anchor,
            None => return Ok(tick),
        };
        tick.outbound = self.continue_sync(&anchor, now)?;
        Ok(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_group_item;
    use crate::base::schema::{Trx, TrxKind};
    use crate::base::serialize::rmp_deserialize;
    use crate::chain::store::tests::create_test_store;
    use crate::chain::tests::create_test_keys;
    use crate::db::MemoryDb;
    use std::time::Duration;

    struct Fixture {
        syncer: Syncer<MemoryDb>,
        item: Arc<RwLock<GroupItem>>,
    }

    fn create_fixture() -> Fixture {
        let store = create_test_store();
        let mut item = create_test_group_item();
        // This node is a plain user, not the owner.
        item.user_sign_pubkey = crate::crypto::KeyPair::Ed25519(
            crate::crypto::ed25519::KeyPair::from_random(),
        )
        .public_key();
        store.add_genesis_block(&item.genesis_block).unwrap();
        let item = Arc::new(RwLock::new(item));
        let keys = Arc::new(create_test_keys());
        let factory = TrxFactory::new(item.clone(), keys, store, 30_000_000_000);
        let config = ChainConfig {
            sync_timeout: Duration::from_millis(100),
            ..ChainConfig::default()
        };
        let syncer = Syncer::new(item.clone(), factory, config);
        Fixture { syncer, item }
    }

    fn outbound_req_kind(outbound: &Outbound) -> TrxKind {
        let trx: Trx = rmp_deserialize(&outbound.package.data).unwrap();
        trx.data.kind
    }

    fn fake_response(fixture: &Fixture, result: ReqBlkResult) -> ReqBlockRespItem {
        let item = fixture.item.read();
        ReqBlockRespItem {
            result,
            provider_pubkey: item.owner_pubkey.clone(),
            requester_pubkey: item.user_sign_pubkey.clone(),
            group_id: item.group_id.clone(),
            block_id: item.genesis_block.id,
            block: vec![],
        }
    }

    #[test]
    fn forward_sync_emits_request() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let now = Instant::now();

        let outbound = fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap();

        assert_eq!(fixture.syncer.status(), SyncStatus::SyncingForward);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound_req_kind(&outbound[0]), TrxKind::ReqBlockForward);
        assert!(fixture.syncer.next_deadline().is_some());
    }

    #[test]
    fn sole_owner_never_syncs() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();

        let outbound = fixture
            .syncer
            .sync_forward(&genesis, true, false, Instant::now())
            .unwrap();

        assert!(outbound.is_empty());
        assert_eq!(fixture.syncer.status(), SyncStatus::Idle);
    }

    #[test]
    fn single_request_in_flight() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let now = Instant::now();
        fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap();

        let err = fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Other);
    }

    #[test]
    fn backward_sync_emits_request() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();

        let outbound = fixture
            .syncer
            .sync_backward(&genesis, Instant::now())
            .unwrap();

        assert_eq!(fixture.syncer.status(), SyncStatus::SyncingBackward);
        assert_eq!(outbound_req_kind(&outbound[0]), TrxKind::ReqBlockBackward);
    }

    #[test]
    fn retry_bound_parks_in_sync_failed() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let mut now = Instant::now();
        fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap();

        let mut reissues = 0;
        let mut failed_tick = 0;
        for round in 1..=5 {
            now = fixture.syncer.next_deadline().unwrap_or(now) + Duration::from_millis(1);
            let tick = fixture.syncer.on_timer(now).unwrap();
            if !tick.outbound.is_empty() {
                reissues += 1;
            }
            if tick.failed {
                failed_tick = round;
                break;
            }
        }

        assert_eq!(fixture.syncer.status(), SyncStatus::SyncFailed);
        assert_eq!(reissues, 4);
        assert_eq!(failed_tick, 5);

        // Terminal until restarted: the timer stays quiet.
        let tick = fixture
            .syncer
            .on_timer(now + Duration::from_secs(1))
            .unwrap();
        assert!(tick.outbound.is_empty());
        assert!(!tick.failed);
    }

    #[test]
    fn not_found_round_returns_to_idle() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let now = Instant::now();
        fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap();

        let resp = fake_response(&fixture, ReqBlkResult::BlockNotFound);
        let outbound = fixture
            .syncer
            .add_block_synced(&resp, None, now, &mut |_| Ok(()))
            .unwrap();
        assert!(outbound.is_empty());

        let deadline = fixture.syncer.next_deadline().unwrap();
        let tick = fixture
            .syncer
            .on_timer(deadline + Duration::from_millis(1))
            .unwrap();

        assert!(tick.outbound.is_empty());
        assert_eq!(fixture.syncer.status(), SyncStatus::Idle);
    }

    #[test]
    fn forward_block_applies_and_continues() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let now = Instant::now();
        fixture
            .syncer
            .sync_forward(&genesis, false, false, now)
            .unwrap();

        let keypair = crate::crypto::sign::tests::create_test_keypair();
        let b1 = Block::build(&genesis, vec![], &keypair, 1).unwrap();
        let mut resp = fake_response(&fixture, ReqBlkResult::BlockInTrx);
        resp.block_id = b1.id;

        let mut applied = vec![];
        let outbound = fixture
            .syncer
            .add_block_synced(&resp, Some(b1.clone()), now, &mut |block| {
                applied.push(block.id);
                Ok(())
            })
            .unwrap();

        assert_eq!(applied, vec![b1.id]);
        // Pipelined: the next request goes out at once, anchored at b1.
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound_req_kind(&outbound[0]), TrxKind::ReqBlockForward);
        assert_eq!(fixture.syncer.status(), SyncStatus::SyncingForward);

        // The same block again within the session is dropped.
        let outbound = fixture
            .syncer
            .add_block_synced(&resp, Some(b1), now, &mut |_| {
                panic!("must not re-apply");
            })
            .unwrap();
        assert!(outbound.is_empty());
    }

    #[test]
    fn backward_parent_not_found_continues() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        let now = Instant::now();
        fixture.syncer.sync_backward(&genesis, now).unwrap();

        let keypair = crate::crypto::sign::tests::create_test_keypair();
        let b1 = Block::build(&genesis, vec![], &keypair, 1).unwrap();
        let mut resp = fake_response(&fixture, ReqBlkResult::BlockInTrx);
        resp.block_id = b1.id;

        // Ancestor still missing: keep walking backward.
        let outbound = fixture
            .syncer
            .add_block_synced(&resp, Some(b1.clone()), now, &mut |_| {
                Err(ErrorKind::ParentNotFound.into())
            })
            .unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound_req_kind(&outbound[0]), TrxKind::ReqBlockBackward);

        // Chain connected: no further request, the round closes on its own.
        let b2 = Block::build(&b1, vec![], &keypair, 2).unwrap();
        let mut resp = fake_response(&fixture, ReqBlkResult::BlockInTrx);
        resp.block_id = b2.id;
        let outbound = fixture
            .syncer
            .add_block_synced(&resp, Some(b2), now, &mut |_| Ok(()))
            .unwrap();
        assert!(outbound.is_empty());
        assert_eq!(fixture.syncer.status(), SyncStatus::SyncingBackward);
    }

    #[test]
    fn stop_sync_forces_idle() {
        let mut fixture = create_fixture();
        let genesis = fixture.item.read().genesis_block.clone();
        fixture
            .syncer
            .sync_forward(&genesis, false, false, Instant::now())
            .unwrap();

        fixture.syncer.stop_sync();

        assert_eq!(fixture.syncer.status(), SyncStatus::Idle);
        assert!(fixture.syncer.next_deadline().is_none());
    }

    #[test]
    fn response_ignored_while_idle() {
        let mut fixture = create_fixture();
        let resp = fake_response(&fixture, ReqBlkResult::BlockInTrx);

        let outbound = fixture
            .syncer
            .add_block_synced(&resp, None, Instant::now(), &mut |_| Ok(()))
            .unwrap();

        assert!(outbound.is_empty());
    }
}
