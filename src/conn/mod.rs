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

//! Publish-subscribe transport seam.
//!
//! The chain core publishes and consumes opaque byte payloads on named
//! channels; discovery, gossip and the actual network stack live behind this
//! trait. Delivery is at-least-once and ordered within one channel, the core
//! tolerates duplicates and cross-channel reordering.

use crate::base::Mutex;
use crate::channel::{simple_channel, Receiver, Sender};
use crate::{Error, ErrorKind, Result};
use std::collections::HashMap;

/// Transport capability consumed by the group controllers.
///
/// `publish` must not block the caller for long: implementations are expected
/// to hand the payload to a bounded queue or a dedicated task so a slow
/// network cannot stall the block-production clock.
pub trait ChannelTransport: Send + Sync + 'static {
    /// Broadcast `data` to every subscriber of `channel_id`.
    fn publish(&self, channel_id: &str, data: Vec<u8>) -> Result<()>;

    /// Subscribe to `channel_id`. Unsubscription is dropping (or closing)
    /// the returned receiver.
    fn subscribe(&self, channel_id: &str) -> Result<Receiver<Vec<u8>>>;
}

/// In-process transport: every subscriber of a channel receives every
/// published payload. Backs the test suite and single-process deployments.
#[derive(Default)]
pub struct Loopback {
    subscribers: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(channel_id)
            .map(|subs| subs.iter().filter(|sub| !sub.is_closed()).count())
            .unwrap_or_default()
    }
}

impl ChannelTransport for Loopback {
    fn publish(&self, channel_id: &str, data: Vec<u8>) -> Result<()> {
        let mut map = self.subscribers.lock();
        let subs = match map.get_mut(channel_id) {
            Some(subs) => subs,
            None => return Ok(()),
        };
        // Lazily prune the subscribers gone since the last publish.
        subs.retain(|sub| !sub.is_closed());
        for sub in subs.iter() {
            // Non-blocking on purpose: publish must never stall the group
            // worker clock. A full subscriber queue loses the payload, the
            // syncer's retry loop recovers it.
            sub.try_send(data.clone())
                .map_err(|err| Error::new_ext(ErrorKind::Other, err))?;
        }
        Ok(())
    }

    fn subscribe(&self, channel_id: &str) -> Result<Receiver<Vec<u8>>> {
        let (sender, receiver) = simple_channel();
        self.subscribers
            .lock()
            .entry(channel_id.to_owned())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
