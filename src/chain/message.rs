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

//! Messages exchanged with the per-group worker task.
//!
//! The worker owns every piece of per-group mutable state; the rest of the
//! process talks to it exclusively through these commands over the service
//! request channel.

use crate::base::schema::{AnnounceItem, AuthItem, BlockId, ProducerItem, TrxId};
use crate::base::schema::Package;
use crate::chain::producer::ProducerStatus;
use crate::chain::syncer::SyncStatus;
use crate::channel;
use crate::Error;

/// Commands accepted by a group worker.
#[derive(Debug)]
pub enum Command {
    /// Submit application content to the group.
    Post {
        content: Vec<u8>,
    },
    /// Submit a deny-list update.
    UpdAuth(AuthItem),
    /// Submit a producer-list update.
    UpdProducer(ProducerItem),
    /// Submit a member announcement.
    UpdAnnounce(AnnounceItem),
    /// Raw payload consumed from a subscribed channel.
    HandlePackage(Vec<u8>),
    /// Start (or restart after `SyncFailed`) forward synchronization.
    StartSync,
    /// Force the syncer back to idle.
    StopSync,
    /// Snapshot of the group state.
    GetStatus,
    /// Terminate the worker.
    Stop,
}

/// Worker answers.
#[derive(Debug)]
pub enum Reply {
    /// Accepted, nothing else to report.
    Ok,
    /// The submitted content became this transaction.
    TrxId(TrxId),
    /// State snapshot.
    Status(GroupStatus),
    /// The command failed.
    Err(Error),
}

/// Observable state of one group.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub group_id: String,
    pub highest_height: i64,
    pub highest_block_id: Vec<BlockId>,
    pub sync_status: SyncStatus,
    pub producer_status: Option<ProducerStatus>,
    pub trx_pool_len: usize,
}

/// Group request sender alias.
pub type GroupRequestSender = channel::RequestSender<Command, Reply>;

/// Group request receiver alias.
pub type GroupRequestReceiver = channel::RequestReceiver<Command, Reply>;

/// Which channel an outbound package goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Producer,
    User,
}

/// A package queued for publication by the worker loop.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub channel: ChannelKind,
    pub package: Package,
}

impl Outbound {
    pub fn producer(package: Package) -> Self {
        Outbound {
            channel: ChannelKind::Producer,
            package,
        }
    }

    pub fn user(package: Package) -> Self {
        Outbound {
            channel: ChannelKind::User,
            package,
        }
    }
}
