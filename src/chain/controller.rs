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

//! Per-group composition root.
//!
//! `GroupController` owns one producer (or challenge round), one syncer and
//! the group configuration, decodes the wire packages consumed from the
//! channels and routes them by kind. `GroupService` wraps the controller in
//! its worker task: the task is the sole mutator of the group state, every
//! interaction goes through the command channel, and all timers are driven
//! from its single loop so a teardown cannot race a firing timer.

use crate::base::schema::{
    Block, ChallengeItem, GroupItem, NewBlockRespItem, NewBlockRespResult, Package, PackageKind,
    ReqBlkResult, ReqBlockItem, ReqBlockRespItem, Trx, TrxKind,
};
use crate::base::serialize::rmp_deserialize;
use crate::base::{timestamp_nanos, RwLock};
use crate::chain::apply::commit_block;
use crate::chain::challenge::ChallengeRound;
use crate::chain::factory::TrxFactory;
use crate::chain::message::{
    ChannelKind, Command, GroupRequestReceiver, GroupRequestSender, GroupStatus, Outbound, Reply,
};
use crate::chain::producer::{Producer, ProducerStatus};
use crate::chain::store::ChainStore;
use crate::chain::syncer::{SyncStatus, Syncer};
use crate::chain::{ChainConfig, GroupKeys};
use crate::channel::{confirmed_channel, ChannelError, Receiver};
use crate::conn::ChannelTransport;
use crate::base::schema::ConsensusKind;
use crate::db::Db;
use crate::{Error, ErrorKind, Result};
use async_std::task;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker idle tick when no timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Install a new group: genesis block plus the group record.
/// Used by both group-create and group-join.
pub fn create_group<D: Db>(store: &ChainStore<D>, item: &GroupItem) -> Result<()> {
    store.add_genesis_block(&item.genesis_block)?;
    store.add_group(item)?;
    info!("<{}> group installed", item.group_id);
    Ok(())
}

/// Remove a group and everything it stored.
/// The group service must be stopped first.
pub fn remove_group<D: Db>(store: &ChainStore<D>, group_id: &str) -> Result<()> {
    store.rm_group(group_id)?;
    store.clear_group_data(group_id)?;
    info!("<{}> group removed", group_id);
    Ok(())
}

/// Per-group composition root and message router.
pub struct GroupController<D: Db> {
    config: ChainConfig,
    item: Arc<RwLock<GroupItem>>,
    keys: Arc<GroupKeys>,
    store: ChainStore<D>,
    factory: TrxFactory<D>,
    /// POA producer, present while this node is an authorized producer.
    producer: Option<Producer<D>>,
    /// Challenge round, present when the group runs the challenge policy.
    challenge: Option<ChallengeRound<D>>,
    syncer: Syncer<D>,
    /// Registered producers keyed by account id.
    producer_pool: HashMap<String, crate::base::schema::ProducerItem>,
}

impl<D: Db> GroupController<D> {
    pub fn new(
        item: GroupItem,
        keys: GroupKeys,
        store: ChainStore<D>,
        config: ChainConfig,
    ) -> Result<Self> {
        let item = Arc::new(RwLock::new(item));
        let keys = Arc::new(keys);
        let factory = TrxFactory::new(
            item.clone(),
            keys.clone(),
            store.clone(),
            config.trx_ttl_nanos(),
        );
        let syncer = Syncer::new(item.clone(), factory.clone(), config.clone());

        let mut controller = GroupController {
            config,
            item,
            keys,
            store,
            factory,
            producer: None,
            challenge: None,
            syncer,
            producer_pool: HashMap::new(),
        };
        controller.refresh_producer_pool()?;
        controller.create_consensus();
        Ok(controller)
    }

    /// Reload the registered producers from the applied producer table.
    fn refresh_producer_pool(&mut self) -> Result<()> {
        let group_id = self.item.read().group_id.clone();
        self.producer_pool.clear();
        for producer in self.store.get_producers(&group_id)? {
            let account = producer.producer_pubkey.to_account_id();
            let owner_mark = match producer.producer_pubkey == self.item.read().owner_pubkey {
                true => " (group owner)",
                false => "",
            };
            info!("<{}> producer <{}>{} loaded", group_id, account, owner_mark);
            self.producer_pool.insert(account, producer);
        }
        Ok(())
    }

    /// Select the production role from the configured policy and the
    /// producer table.
    fn create_consensus(&mut self) {
        let (consensus_kind, group_id) = {
            let item = self.item.read();
            (item.consensus_kind, item.group_id.clone())
        };
        match consensus_kind {
            ConsensusKind::Challenge => {
                if self.challenge.is_none() {
                    self.challenge = Some(ChallengeRound::new(
                        self.item.clone(),
                        self.keys.clone(),
                        self.store.clone(),
                        self.factory.clone(),
                        self.config.clone(),
                    ));
                }
            }
            ConsensusKind::Poa => {
                if self.is_producer_node() {
                    if self.producer.is_none() {
                        info!("<{}> this node produces blocks", group_id);
                        self.producer = Some(Producer::new(
                            self.item.clone(),
                            self.keys.clone(),
                            self.store.clone(),
                            self.factory.clone(),
                            self.config.clone(),
                        ));
                    }
                } else if self.producer.take().is_some() {
                    info!("<{}> producer role revoked", group_id);
                }
            }
        }
    }

    fn my_account(&self) -> String {
        self.item.read().user_sign_pubkey.to_account_id()
    }

    /// The group owner is always a producer; other nodes qualify through the
    /// producer table.
    fn is_producer_node(&self) -> bool {
        self.item.read().is_owner() || self.producer_pool.contains_key(&self.my_account())
    }

    /// True for an owner with no other registered producer: there is nobody
    /// to sync with.
    fn is_sole_owner(&self) -> bool {
        let item = self.item.read();
        if !item.is_owner() {
            return false;
        }
        let owner_account = item.owner_pubkey.to_account_id();
        !self
            .producer_pool
            .keys()
            .any(|account| account != &owner_account)
    }

    /// Earliest deadline of any owned timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.syncer.next_deadline();
        if let Some(producer) = &self.producer {
            deadline = match (deadline, producer.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        if let Some(challenge) = &self.challenge {
            deadline = match (deadline, challenge.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        deadline
    }

    /// Fire every timer that is due and collect the resulting traffic.
    pub(crate) fn tick(&mut self, now: Instant) -> Result<Vec<Outbound>> {
        let mut outbound = vec![];

        let producer_output = match &mut self.producer {
            Some(producer) => Some(producer.on_timer(now)?),
            None => None,
        };
        if let Some(output) = producer_output {
            outbound.extend(output.outbound);
            if output.producers_changed {
                self.refresh_producer_pool()?;
                self.create_consensus();
            }
            // A producer that hit a missing parent fills the gap backward.
            if let Some(block) = output.sync_backward_from {
                match self.syncer.sync_backward(&block, now) {
                    Ok(sync_out) => outbound.extend(sync_out),
                    Err(err) => debug!("backward sync not started: {}", err.to_string_full()),
                }
            }
        }

        if let Some(challenge) = &mut self.challenge {
            let tick = challenge.on_timer(now)?;
            outbound.extend(tick.outbound);
        }

        let tick = self.syncer.on_timer(now)?;
        outbound.extend(tick.outbound);
        Ok(outbound)
    }

    /// Decode one wire package and route it.
    pub(crate) fn handle_package(&mut self, buf: &[u8], now: Instant) -> Result<Vec<Outbound>> {
        let package: Package = rmp_deserialize(buf)?;
        match package.kind {
            PackageKind::Block => {
                let block: Block = rmp_deserialize(&package.data)?;
                self.handle_block(block, now)
            }
            PackageKind::Trx => {
                let trx: Trx = rmp_deserialize(&package.data)?;
                self.handle_trx(trx, now)
            }
        }
    }

    /// Route one decoded transaction by kind.
    fn handle_trx(&mut self, trx: Trx, now: Instant) -> Result<Vec<Outbound>> {
        let group_id = self.item.read().group_id.clone();
        let my_pubkey = self.item.read().user_sign_pubkey.clone();

        if !self.factory.verify_trx(&trx)? {
            debug!(
                "<{}> trx <{}> signature invalid, dropped",
                group_id,
                trx.id.to_hex()
            );
            return Ok(vec![]);
        }
        if trx.is_expired(timestamp_nanos()) {
            debug!("<{}> trx <{}> expired, dropped", group_id, trx.id.to_hex());
            return Ok(vec![]);
        }

        match trx.data.kind {
            TrxKind::Post | TrxKind::Auth | TrxKind::Producer | TrxKind::Announce => {
                if let Some(challenge) = &mut self.challenge {
                    return challenge.add_trx(trx, now);
                }
                if let Some(producer) = &mut self.producer {
                    if let Err(err) = producer.add_trx(trx, now) {
                        debug!("<{}> trx not pooled: {}", group_id, err.to_string_full());
                    }
                }
                Ok(vec![])
            }
            TrxKind::Challenge => {
                let challenge_item: ChallengeItem =
                    rmp_deserialize(&self.factory.decrypt_trx(&trx)?)?;
                match &mut self.challenge {
                    Some(challenge) => challenge.update_challenge(challenge_item, now),
                    None => Ok(vec![]),
                }
            }
            TrxKind::ReqBlockForward => {
                if trx.data.sender_pubkey == my_pubkey {
                    return Ok(vec![]);
                }
                self.answer_forward(&trx)
            }
            TrxKind::ReqBlockBackward => {
                if trx.data.sender_pubkey == my_pubkey {
                    return Ok(vec![]);
                }
                self.answer_backward(&trx)
            }
            TrxKind::ReqBlockResp => {
                if trx.data.sender_pubkey == my_pubkey {
                    return Ok(vec![]);
                }
                self.handle_req_block_resp(&trx, now)
            }
            TrxKind::BlockProduced => {
                if self.producer.is_some() {
                    let block: Block = rmp_deserialize(&self.factory.decrypt_trx(&trx)?)?;
                    if let Some(producer) = &mut self.producer {
                        producer.add_produced_block(block, now);
                    }
                }
                Ok(vec![])
            }
            TrxKind::NewBlockResp => {
                let resp: NewBlockRespItem = rmp_deserialize(&self.factory.decrypt_trx(&trx)?)?;
                match &mut self.challenge {
                    Some(challenge) => challenge.handle_block_resp(&resp),
                    None => {
                        debug!("<{}> block ack observed: {:?}", group_id, resp.result);
                        Ok(vec![])
                    }
                }
            }
        }
    }

    /// The sender of a sync request must not be deny-listed.
    fn request_allowed(&self, trx: &Trx) -> Result<bool> {
        let group_id = self.item.read().group_id.clone();
        let account = trx.data.sender_pubkey.to_account_id();
        if self.store.is_denied(&group_id, &account)? {
            debug!("<{}> sync request from deny-listed <{}>", group_id, account);
            return Ok(false);
        }
        Ok(true)
    }

    /// Answer a forward request with the children of the anchor, one
    /// response per block, or a single not-found.
    fn answer_forward(&mut self, trx: &Trx) -> Result<Vec<Outbound>> {
        if !self.is_producer_node() || !self.request_allowed(trx)? {
            return Ok(vec![]);
        }
        let req: ReqBlockItem = rmp_deserialize(&self.factory.decrypt_trx(trx)?)?;

        let sub_blocks = match self.store.get_sub_blocks(&req.block_id) {
            Ok(blocks) => blocks,
            Err(err) if err.kind == ErrorKind::ResourceNotFound => {
                debug!("unknown anchor <{}>, request ignored", req.block_id.to_hex());
                return Ok(vec![]);
            }
            Err(err) => return Err(err),
        };

        let mut outbound = vec![];
        if sub_blocks.is_empty() {
            let resp = self.factory.req_block_resp_trx(
                &req.requester_pubkey,
                &req,
                None,
                ReqBlkResult::BlockNotFound,
            )?;
            outbound.push(Outbound::producer(Package::from_trx(&resp)));
        } else {
            for block in &sub_blocks {
                let resp = self.factory.req_block_resp_trx(
                    &req.requester_pubkey,
                    &req,
                    Some(block),
                    ReqBlkResult::BlockInTrx,
                )?;
                outbound.push(Outbound::producer(Package::from_trx(&resp)));
            }
        }
        Ok(outbound)
    }

    /// Answer a backward request with the parent of the anchor.
    fn answer_backward(&mut self, trx: &Trx) -> Result<Vec<Outbound>> {
        if !self.is_producer_node() || !self.request_allowed(trx)? {
            return Ok(vec![]);
        }
        let req: ReqBlockItem = rmp_deserialize(&self.factory.decrypt_trx(trx)?)?;

        if !self.store.is_block_exist(&req.block_id, false)? {
            debug!("unknown anchor <{}>, request ignored", req.block_id.to_hex());
            return Ok(vec![]);
        }
        let block = self.store.get_block(&req.block_id, false)?;

        let resp = match self
            .store
            .is_parent_exist(&block.data.prev_block_id, false)?
        {
            true => {
                let parent = self.store.get_parent_block(&req.block_id)?;
                self.factory.req_block_resp_trx(
                    &req.requester_pubkey,
                    &req,
                    Some(&parent),
                    ReqBlkResult::BlockInTrx,
                )?
            }
            false => self.factory.req_block_resp_trx(
                &req.requester_pubkey,
                &req,
                None,
                ReqBlkResult::BlockNotFound,
            )?,
        };
        Ok(vec![Outbound::producer(Package::from_trx(&resp))])
    }

    /// A sync response addressed to some requester: apply when it is mine.
    fn handle_req_block_resp(&mut self, trx: &Trx, now: Instant) -> Result<Vec<Outbound>> {
        let resp: ReqBlockRespItem = rmp_deserialize(&self.factory.decrypt_trx(trx)?)?;
        let (my_pubkey, owner_pubkey, group_id) = {
            let item = self.item.read();
            (
                item.user_sign_pubkey.clone(),
                item.owner_pubkey.clone(),
                item.group_id.clone(),
            )
        };
        if resp.requester_pubkey != my_pubkey {
            return Ok(vec![]);
        }

        let block = match resp.block.is_empty() {
            true => None,
            false => Some(rmp_deserialize::<Block>(&resp.block)?),
        };
        if let Some(block) = &block {
            let producer_account = block.data.producer_pubkey.to_account_id();
            let registered = block.data.producer_pubkey == owner_pubkey
                || self.producer_pool.contains_key(&producer_account);
            if !registered {
                warn!(
                    "<{}> synced block from unregistered producer <{}>, rejected",
                    group_id, producer_account
                );
                return Ok(vec![]);
            }
        }

        let store = self.store.clone();
        let item = self.item.clone();
        let keys = self.keys.clone();
        let collect_resend = !self.is_producer_node();
        let mut producers_changed = false;
        let mut resend_trxs = vec![];

        let mut outbound = self.syncer.add_block_synced(&resp, block, now, &mut |block| {
            let outcome = commit_block(&store, &item, &keys, block, collect_resend)?;
            producers_changed |= outcome.producers_changed;
            resend_trxs.extend(outcome.resend_trxs);
            Ok(())
        })?;

        if producers_changed {
            self.refresh_producer_pool()?;
            self.create_consensus();
        }
        for trx in resend_trxs {
            outbound.push(Outbound::producer(Package::from_trx(&trx)));
        }
        Ok(outbound)
    }

    /// A full block from the user channel.
    fn handle_block(&mut self, block: Block, now: Instant) -> Result<Vec<Outbound>> {
        if let Some(challenge) = &mut self.challenge {
            return challenge.handle_block(&block, now);
        }

        let (group_id, owner_pubkey) = {
            let item = self.item.read();
            (item.group_id.clone(), item.owner_pubkey.clone())
        };
        let producer_account = block.data.producer_pubkey.to_account_id();
        let registered = block.data.producer_pubkey == owner_pubkey
            || self.producer_pool.contains_key(&producer_account);
        if !registered {
            warn!(
                "<{}> block <{}> from unregistered producer <{}>, rejected",
                group_id,
                block.id.to_hex(),
                producer_account
            );
            return Ok(vec![]);
        }

        let collect_resend = !self.is_producer_node();
        match commit_block(&self.store, &self.item, &self.keys, &block, collect_resend) {
            Ok(outcome) => {
                let mut outbound = vec![];
                if outcome.producers_changed {
                    self.refresh_producer_pool()?;
                    self.create_consensus();
                }
                for trx in outcome.resend_trxs {
                    outbound.push(Outbound::producer(Package::from_trx(&trx)));
                }
                Ok(outbound)
            }
            Err(err) if err.kind == ErrorKind::ParentNotFound => {
                debug!(
                    "<{}> block <{}> kept cached, filling ancestors backward",
                    group_id,
                    block.id.to_hex()
                );
                match self.syncer.sync_backward(&block, now) {
                    Ok(outbound) => Ok(outbound),
                    Err(err) => {
                        debug!("backward sync not started: {}", err.to_string_full());
                        Ok(vec![])
                    }
                }
            }
            Err(err) if err.kind == ErrorKind::BlockAlreadySaved => Ok(vec![]),
            Err(err)
                if matches!(
                    err.kind,
                    ErrorKind::InvalidSignature | ErrorKind::MalformedData
                ) =>
            {
                // Validation failures are answered with a typed rejection.
                warn!(
                    "<{}> block <{}> rejected: {}",
                    group_id,
                    block.id.to_hex(),
                    err.to_string_full()
                );
                let resp = self
                    .factory
                    .new_block_resp_trx(&block, NewBlockRespResult::Rejected)?;
                Ok(vec![Outbound::producer(Package::from_trx(&resp))])
            }
            Err(err) => Err(err),
        }
    }

    /// Build, publish and (on producer nodes) pool an own transaction.
    fn submit_trx(&mut self, trx: Trx, now: Instant) -> Result<Vec<Outbound>> {
        let mut outbound = vec![Outbound::producer(Package::from_trx(&trx))];
        if let Some(challenge) = &mut self.challenge {
            outbound.extend(challenge.add_trx(trx, now)?);
        } else if let Some(producer) = &mut self.producer {
            // Pool directly instead of waiting for the pubsub echo.
            if let Err(err) = producer.add_trx(trx, now) {
                debug!("own trx not pooled: {}", err.to_string_full());
            }
        }
        Ok(outbound)
    }

    /// Handle one service command. Returns the reply plus the traffic to
    /// publish.
    pub(crate) fn handle_command(
        &mut self,
        command: Command,
        now: Instant,
    ) -> (Reply, Vec<Outbound>) {
        let result = match command {
            Command::Post { content } => self.cmd_post(&content, now),
            Command::UpdAuth(item) => self
                .factory
                .auth_trx(&item)
                .and_then(|trx| self.submit_with_id(trx, now)),
            Command::UpdProducer(item) => self
                .factory
                .producer_trx(&item)
                .and_then(|trx| self.submit_with_id(trx, now)),
            Command::UpdAnnounce(item) => self
                .factory
                .announce_trx(&item)
                .and_then(|trx| self.submit_with_id(trx, now)),
            Command::HandlePackage(buf) => self
                .handle_package(&buf, now)
                .map(|outbound| (Reply::Ok, outbound)),
            Command::StartSync => self.cmd_start_sync(now),
            Command::StopSync => {
                self.syncer.stop_sync();
                Ok((Reply::Ok, vec![]))
            }
            Command::GetStatus => Ok((Reply::Status(self.status()), vec![])),
            Command::Stop => Ok((Reply::Ok, vec![])),
        };
        match result {
            Ok((reply, outbound)) => (reply, outbound),
            Err(err) => (Reply::Err(err), vec![]),
        }
    }

    fn submit_with_id(&mut self, trx: Trx, now: Instant) -> Result<(Reply, Vec<Outbound>)> {
        let trx_id = trx.id;
        let outbound = self.submit_trx(trx, now)?;
        Ok((Reply::TrxId(trx_id), outbound))
    }

    fn cmd_post(&mut self, content: &[u8], now: Instant) -> Result<(Reply, Vec<Outbound>)> {
        let group_id = self.item.read().group_id.clone();
        let recipients = self.store.get_encrypt_pubkeys(&group_id)?;
        let trx = self.factory.post_trx(content, &recipients)?;
        self.submit_with_id(trx, now)
    }

    /// Start forward synchronization from the current tip. An explicit start
    /// is also the only way out of `SyncFailed`, and it resets the retry
    /// budget. The producer pool survives the failure untouched.
    fn cmd_start_sync(&mut self, now: Instant) -> Result<(Reply, Vec<Outbound>)> {
        if self.syncer.status() == SyncStatus::SyncFailed {
            info!(
                "<{}> restarting failed sync session",
                self.item.read().group_id
            );
            self.syncer.stop_sync();
        }
        let tip_id = *self
            .item
            .read()
            .highest_block_id
            .first()
            .ok_or_else(|| Error::new_ext(ErrorKind::ResourceNotFound, "group has no tip"))?;
        let tip = self.store.get_block(&tip_id, false)?;
        let outbound =
            self.syncer
                .sync_forward(&tip, self.is_sole_owner(), self.is_producer_node(), now)?;
        Ok((Reply::Ok, outbound))
    }

    fn status(&self) -> GroupStatus {
        let item = self.item.read();
        GroupStatus {
            group_id: item.group_id.clone(),
            highest_height: item.highest_height,
            highest_block_id: item.highest_block_id.clone(),
            sync_status: self.syncer.status(),
            producer_status: self.producer.as_ref().map(Producer::status),
            trx_pool_len: self
                .producer
                .as_ref()
                .map(Producer::pool_len)
                .unwrap_or_default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn sync_status(&self) -> SyncStatus {
        self.syncer.status()
    }

    #[cfg(test)]
    pub(crate) fn producer_status(&self) -> Option<ProducerStatus> {
        self.producer.as_ref().map(Producer::status)
    }

    #[cfg(test)]
    pub(crate) fn group_item(&self) -> GroupItem {
        self.item.read().clone()
    }
}

/// Handle to a running group worker.
///
/// Starting the service spawns the worker task plus one pump task per
/// subscribed channel; stopping it cancels the subscriptions first and then
/// terminates the worker, so no timer can fire against torn-down state.
pub struct GroupService<D: Db> {
    group_id: String,
    tx_chan: GroupRequestSender,
    handle: Option<task::JoinHandle<()>>,
    subscriptions: Vec<Receiver<Vec<u8>>>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: Db> GroupService<D> {
    /// Start the worker for an installed group.
    pub fn start(
        item: GroupItem,
        keys: GroupKeys,
        store: ChainStore<D>,
        config: ChainConfig,
        transport: Arc<dyn ChannelTransport>,
    ) -> Result<GroupService<D>> {
        let group_id = item.group_id.clone();
        let producer_channel = item.producer_channel_id();
        let user_channel = item.user_channel_id();

        let controller = GroupController::new(item, keys, store, config)?;
        let (tx_chan, rx_chan) = confirmed_channel::<Command, Reply>();

        let mut subscriptions = vec![];
        for channel_id in [producer_channel.clone(), user_channel.clone()] {
            let receiver = transport.subscribe(&channel_id)?;
            subscriptions.push(receiver.clone());
            let pump_tx = tx_chan.clone();
            task::spawn(async move {
                while let Ok(buf) = receiver.recv().await {
                    if pump_tx.send(Command::HandlePackage(buf)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let handle = task::spawn(run_worker(
            controller,
            rx_chan,
            transport,
            producer_channel,
            user_channel,
        ));

        debug!("<{}> group service started", group_id);
        Ok(GroupService {
            group_id,
            tx_chan,
            handle: Some(handle),
            subscriptions,
            _marker: std::marker::PhantomData,
        })
    }

    /// Command channel of the worker.
    pub fn request_channel(&self) -> GroupRequestSender {
        self.tx_chan.clone()
    }

    /// Stop the worker: unsubscribe, cancel every timer, terminate.
    pub async fn stop(&mut self) {
        debug!("<{}> stopping group service", self.group_id);
        for subscription in &self.subscriptions {
            subscription.close();
        }
        self.subscriptions.clear();

        if let Some(handle) = self.handle.take() {
            if let Ok(receiver) = self.tx_chan.send(Command::Stop).await {
                let _ = receiver.recv().await;
            }
            handle.await;
        }
    }

    /// Stop, synchronous wrapper.
    pub fn stop_sync(&mut self) {
        task::block_on(self.stop())
    }
}

/// The worker loop: commands and timers multiplexed on one task.
async fn run_worker<D: Db>(
    mut controller: GroupController<D>,
    rx_chan: GroupRequestReceiver,
    transport: Arc<dyn ChannelTransport>,
    producer_channel: String,
    user_channel: String,
) {
    let publish = |outbound: Vec<Outbound>| {
        for out in outbound {
            let channel_id = match out.channel {
                ChannelKind::Producer => &producer_channel,
                ChannelKind::User => &user_channel,
            };
            match crate::base::serialize::rmp_serialize(&out.package) {
                Ok(buf) => {
                    if let Err(err) = transport.publish(channel_id, buf) {
                        // Transient publish failures are not retried here:
                        // the owning component's timer loop covers them.
                        warn!("publish to <{}> failed: {}", channel_id, err.to_string_full());
                    }
                }
                Err(err) => warn!("package encode failed: {}", err.to_string_full()),
            }
        }
    };

    loop {
        let now = Instant::now();
        let timeout = match controller.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).max(Duration::ZERO),
            None => IDLE_TICK,
        };

        match rx_chan.recv_timeout(timeout).await {
            Ok((Command::Stop, res_chan)) => {
                let _ = res_chan.send(Reply::Ok).await;
                break;
            }
            Ok((command, res_chan)) => {
                let (reply, outbound) = controller.handle_command(command, Instant::now());
                publish(outbound);
                let _ = res_chan.send(reply).await;
            }
            Err(ChannelError::RecvTimeout) => match controller.tick(Instant::now()) {
                Ok(outbound) => publish(outbound),
                Err(err) => warn!("timer tick failed: {}", err.to_string_full()),
            },
            Err(_) => break,
        }
    }
    debug!("group worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{create_test_group_item, TEST_TIMESTAMP};
    use crate::base::schema::TrxData;
    use crate::base::serialize::rmp_serialize;
    use crate::chain::store::tests::create_test_store;
    use crate::conn::Loopback;
    use crate::crypto::sign::tests::create_test_keypair;
    use crate::crypto::{Hashable, KeyPair};
    use crate::db::MemoryDb;

    struct Node {
        controller: GroupController<MemoryDb>,
        store: ChainStore<MemoryDb>,
    }

    fn create_node(user_keypair: KeyPair) -> Node {
        let store = create_test_store();
        let mut item = create_test_group_item();
        item.user_sign_pubkey = user_keypair.public_key();
        create_group(&store, &item).unwrap();
        let keys = GroupKeys::from_item(&item, user_keypair, None).unwrap();
        let controller =
            GroupController::new(item, keys, store.clone(), ChainConfig::default()).unwrap();
        Node { controller, store }
    }

    fn create_owner_node() -> Node {
        create_node(create_test_keypair())
    }

    fn create_user_node() -> Node {
        create_node(KeyPair::Ed25519(crate::crypto::ed25519::KeyPair::from_random()))
    }

    /// Build B1..Bn with the owner key and commit them on `node`.
    fn grow_chain(node: &Node, len: usize) -> Vec<Block> {
        let keypair = create_test_keypair();
        let mut parent = node.controller.item.read().genesis_block.clone();
        let mut blocks = vec![];
        for i in 0..len {
            let block =
                Block::build(&parent, vec![], &keypair, TEST_TIMESTAMP + 1 + i as i64).unwrap();
            commit_block(
                &node.store,
                &node.controller.item,
                &node.controller.keys,
                &block,
                false,
            )
            .unwrap();
            blocks.push(block.clone());
            parent = block;
        }
        blocks
    }

    fn deliver(node: &mut Node, traffic: &[Outbound]) -> Vec<Outbound> {
        let mut out = vec![];
        for outbound in traffic {
            let buf = rmp_serialize(&outbound.package).unwrap();
            out.extend(
                node.controller
                    .handle_package(&buf, Instant::now())
                    .unwrap(),
            );
        }
        out
    }

    #[test]
    fn linear_catch_up() {
        let mut owner = create_owner_node();
        let blocks = grow_chain(&owner, 5);
        let mut user = create_user_node();
        assert_eq!(user.controller.group_item().highest_height, 0);

        let (reply, mut to_owner) = user
            .controller
            .handle_command(Command::StartSync, Instant::now());
        assert!(matches!(reply, Reply::Ok));
        assert_eq!(user.controller.sync_status(), SyncStatus::SyncingForward);

        for _ in 0..32 {
            if to_owner.is_empty() {
                break;
            }
            let to_user = deliver(&mut owner, &to_owner);
            to_owner = deliver(&mut user, &to_user);
        }

        // The last round only collected a not-found: the window closes the
        // session.
        let deadline = user.controller.syncer.next_deadline().unwrap();
        user.controller
            .tick(deadline + Duration::from_millis(1))
            .unwrap();

        let item = user.controller.group_item();
        assert_eq!(item.highest_height, 5);
        assert_eq!(item.highest_block_id, vec![blocks[4].id]);
        assert_eq!(user.controller.sync_status(), SyncStatus::Idle);
        for block in &blocks {
            assert!(user.store.is_block_exist(&block.id, false).unwrap());
        }
    }

    #[test]
    fn backward_fill() {
        let mut owner = create_owner_node();
        let blocks = grow_chain(&owner, 5);
        let mut user = create_user_node();

        // B5 lands directly: parent missing, cached, backward sync starts.
        let b5 = blocks[4].clone();
        let buf = rmp_serialize(&Package::from_block(&b5)).unwrap();
        let mut to_owner = user
            .controller
            .handle_package(&buf, Instant::now())
            .unwrap();

        assert_eq!(user.controller.sync_status(), SyncStatus::SyncingBackward);
        assert!(user.store.is_block_exist(&b5.id, true).unwrap());

        for _ in 0..32 {
            if to_owner.is_empty() {
                break;
            }
            let to_user = deliver(&mut owner, &to_owner);
            to_owner = deliver(&mut user, &to_user);
        }

        // The whole run moved from the cache to committed storage.
        let item = user.controller.group_item();
        assert_eq!(item.highest_height, 5);
        assert_eq!(item.highest_block_id, vec![b5.id]);
        for block in &blocks {
            assert!(user.store.is_block_exist(&block.id, false).unwrap());
            assert!(!user.store.is_block_exist(&block.id, true).unwrap());
        }

        // And the round wait closes the session.
        let deadline = user.controller.syncer.next_deadline().unwrap();
        user.controller
            .tick(deadline + Duration::from_millis(1))
            .unwrap();
        assert_eq!(user.controller.sync_status(), SyncStatus::Idle);
    }

    #[test]
    fn expired_trx_never_pooled() {
        let mut owner = create_owner_node();
        let keys = &owner.controller.keys;

        let data = TrxData {
            group_id: owner.controller.item.read().group_id.clone(),
            kind: TrxKind::Post,
            sender_pubkey: keys.keypair.public_key(),
            nonce: 1,
            data: crate::crypto::cipher::aes_encrypt(&keys.cipher_key, b"stale").unwrap(),
            timestamp: 1,
            expired: 2,
        };
        let id = data.primary_hash();
        let signature = keys.keypair.sign(id.as_bytes()).unwrap();
        let expired = Trx {
            id,
            data,
            signature,
            resend_count: 0,
        };

        let buf = rmp_serialize(&Package::from_trx(&expired)).unwrap();
        let outbound = owner
            .controller
            .handle_package(&buf, Instant::now())
            .unwrap();

        assert!(outbound.is_empty());
        // Nothing pooled: no production timer armed either.
        assert_eq!(
            owner.controller.producer_status(),
            Some(ProducerStatus::Idle)
        );
    }

    #[test]
    fn post_command_pools_and_publishes() {
        let mut owner = create_owner_node();

        let (reply, outbound) = owner.controller.handle_command(
            Command::Post {
                content: b"hello group".to_vec(),
            },
            Instant::now(),
        );

        assert!(matches!(reply, Reply::TrxId(_)));
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].channel, ChannelKind::Producer);
        assert_eq!(
            owner.controller.producer_status(),
            Some(ProducerStatus::Producing)
        );
    }

    #[test]
    fn user_node_has_no_producer() {
        let user = create_user_node();

        assert!(user.controller.producer_status().is_none());
    }

    #[test]
    fn unregistered_producer_block_dropped() {
        let mut user = create_user_node();
        let genesis = user.controller.item.read().genesis_block.clone();
        let intruder = KeyPair::Ed25519(crate::crypto::ed25519::KeyPair::from_random());
        let block = Block::build(&genesis, vec![], &intruder, TEST_TIMESTAMP + 1).unwrap();

        let buf = rmp_serialize(&Package::from_block(&block)).unwrap();
        let outbound = user
            .controller
            .handle_package(&buf, Instant::now())
            .unwrap();

        assert!(outbound.is_empty());
        assert!(!user.store.is_block_exist(&block.id, false).unwrap());
        assert!(!user.store.is_block_exist(&block.id, true).unwrap());
    }

    #[test]
    fn tampered_block_answered_with_rejection() {
        let mut user = create_user_node();
        let genesis = user.controller.item.read().genesis_block.clone();
        let owner_keypair = create_test_keypair();
        let mut block =
            Block::build(&genesis, vec![], &owner_keypair, TEST_TIMESTAMP + 1).unwrap();
        block.signature[0] ^= 0xff;

        let buf = rmp_serialize(&Package::from_block(&block)).unwrap();
        let outbound = user
            .controller
            .handle_package(&buf, Instant::now())
            .unwrap();

        assert_eq!(outbound.len(), 1);
        let trx: Trx = rmp_deserialize(&outbound[0].package.data).unwrap();
        assert_eq!(trx.data.kind, TrxKind::NewBlockResp);
    }

    #[test]
    fn sync_restart_after_failure() {
        let mut user = create_user_node();
        let (_, _outbound) = user
            .controller
            .handle_command(Command::StartSync, Instant::now());

        // Ride the retry loop into SyncFailed.
        for _ in 0..6 {
            let deadline = match user.controller.syncer.next_deadline() {
                Some(deadline) => deadline,
                None => break,
            };
            user.controller
                .tick(deadline + Duration::from_millis(1))
                .unwrap();
        }
        assert_eq!(user.controller.sync_status(), SyncStatus::SyncFailed);

        // Only an explicit restart leaves the failed state.
        let (reply, outbound) = user
            .controller
            .handle_command(Command::StartSync, Instant::now());
        assert!(matches!(reply, Reply::Ok));
        assert_eq!(outbound.len(), 1);
        assert_eq!(user.controller.sync_status(), SyncStatus::SyncingForward);
    }

    #[test]
    fn group_lifecycle() {
        let store = create_test_store();
        let item = create_test_group_item();

        create_group(&store, &item).unwrap();
        assert!(store.get_group(&item.group_id).unwrap().is_some());
        assert!(store
            .is_block_exist(&item.genesis_block.id, false)
            .unwrap());

        remove_group(&store, &item.group_id).unwrap();
        assert!(store.get_group(&item.group_id).unwrap().is_none());
        assert!(!store
            .is_block_exist(&item.genesis_block.id, false)
            .unwrap());
    }

    #[test]
    fn service_produces_from_post() {
        let transport = Arc::new(Loopback::new());
        let store = create_test_store();
        let item = create_test_group_item();
        create_group(&store, &item).unwrap();
        let keys = GroupKeys::from_item(&item, create_test_keypair(), None).unwrap();
        let config = ChainConfig {
            produce_timeout: Duration::from_millis(50),
            merge_timeout: Duration::from_millis(50),
            ..ChainConfig::default()
        };

        let mut service =
            GroupService::start(item, keys, store, config, transport).unwrap();
        let chan = service.request_channel();

        task::block_on(async {
            let receiver = chan
                .send(Command::Post {
                    content: b"first post".to_vec(),
                })
                .await
                .unwrap();
            assert!(matches!(receiver.recv().await.unwrap(), Reply::TrxId(_)));

            let mut height = 0;
            for _ in 0..100 {
                task::sleep(Duration::from_millis(50)).await;
                let receiver = chan.send(Command::GetStatus).await.unwrap();
                if let Reply::Status(status) = receiver.recv().await.unwrap() {
                    height = status.highest_height;
                    if height >= 1 {
                        break;
                    }
                }
            }
            assert_eq!(height, 1);

            service.stop().await;
        });
    }
}
