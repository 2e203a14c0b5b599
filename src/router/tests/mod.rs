// Copyright 2020 Sigma Prime Pty Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Test utilities and infrastructure for router tests.
//!
//! The main components are:
//!
//! - [`RouterTestBuilder`]: a builder for creating test network
//!   configurations with peers, topics, and various settings.
//! - [`TestHost`]: a host that records every outbound batch and dial.
//! - [`StaticScore`]: a table-driven scoring engine recording every
//!   notification.

mod mesh;

use std::collections::{HashMap, HashSet};

use super::*;
use crate::{config::Config, score::ScoreThresholds, topic::Topic};

/// A [`Host`] implementation recording everything the router hands it.
#[derive(Default)]
pub(super) struct TestHost {
    /// Topic membership as seen by the outer router.
    pub(super) topic_peers: HashMap<TopicHash, Vec<PeerId>>,
    /// The seen-messages set of the outer router.
    pub(super) seen: HashSet<MessageId>,
    /// Every RPC part sent, flattened in delivery order.
    pub(super) sent: Vec<(PeerId, RpcOut)>,
    /// Every dial requested through peer exchange.
    pub(super) dialed: Vec<(PeerId, Option<Vec<u8>>)>,
    /// Peers whose outbound queue reads as full.
    pub(super) full_peers: HashSet<PeerId>,
}

impl Host for TestHost {
    fn peers_in_topic(&self, topic: &TopicHash) -> Vec<PeerId> {
        self.topic_peers.get(topic).cloned().unwrap_or_default()
    }

    fn has_seen(&self, message_id: &MessageId) -> bool {
        self.seen.contains(message_id)
    }

    fn send_rpc(&mut self, peer_id: &PeerId, batch: Vec<RpcOut>) -> Result<(), SendError> {
        if self.full_peers.contains(peer_id) {
            return Err(SendError::QueueFull);
        }
        for rpc in batch {
            self.sent.push((*peer_id, rpc));
        }
        Ok(())
    }

    fn dial(&mut self, peer_id: PeerId, signed_peer_record: Option<Vec<u8>>) {
        self.dialed.push((peer_id, signed_peer_record));
    }
}

/// A scoring engine backed by a static score table, recording every
/// notification the router makes.
#[derive(Default)]
pub(super) struct StaticScore {
    scores: HashMap<PeerId, f64>,
    pub(super) penalties: HashMap<PeerId, usize>,
    pub(super) grafted: Vec<(PeerId, TopicHash)>,
    pub(super) pruned: Vec<(PeerId, TopicHash)>,
    pub(super) delivered: Vec<(PeerId, MessageId)>,
}

impl StaticScore {
    pub(super) fn set_score(&mut self, peer_id: &PeerId, score: f64) {
        self.scores.insert(*peer_id, score);
    }

    pub(super) fn penalties_for(&self, peer_id: &PeerId) -> usize {
        self.penalties.get(peer_id).copied().unwrap_or(0)
    }
}

impl PeerScore for StaticScore {
    fn score(&self, peer_id: &PeerId) -> f64 {
        self.scores.get(peer_id).copied().unwrap_or(0.0)
    }

    fn add_penalty(&mut self, peer_id: &PeerId, count: usize) {
        *self.penalties.entry(*peer_id).or_insert(0) += count;
    }

    fn graft(&mut self, peer_id: &PeerId, topic: TopicHash) {
        self.grafted.push((*peer_id, topic));
    }

    fn prune(&mut self, peer_id: &PeerId, topic: TopicHash) {
        self.pruned.push((*peer_id, topic));
    }

    fn deliver_message(&mut self, peer_id: &PeerId, message_id: &MessageId, _topic: &TopicHash) {
        self.delivered.push((*peer_id, message_id.clone()));
    }

    fn connected(&mut self, _peer_id: &PeerId) {}

    fn disconnected(&mut self, _peer_id: &PeerId) {}
}

pub(super) type TestRouter = Router<TestHost, StaticScore>;

/// A builder for creating test networks with configurable peers and topics.
///
/// Call [`create_network`](Self::create_network) to finalize; it returns the
/// router, the created peers and the topic hashes.
#[derive(Default)]
pub(super) struct RouterTestBuilder {
    peer_no: usize,
    outbound: usize,
    topics: Vec<String>,
    to_subscribe: bool,
    peer_kind: Option<PeerKind>,
    config: Option<Config>,
    thresholds: Option<ScoreThresholds>,
}

impl RouterTestBuilder {
    pub(super) fn peer_no(mut self, peer_no: usize) -> Self {
        self.peer_no = peer_no;
        self
    }

    /// The number of created peers (out of `peer_no`) whose connection is
    /// locally initiated.
    pub(super) fn outbound(mut self, outbound: usize) -> Self {
        self.outbound = outbound;
        self
    }

    pub(super) fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub(super) fn to_subscribe(mut self, to_subscribe: bool) -> Self {
        self.to_subscribe = to_subscribe;
        self
    }

    pub(super) fn peer_kind(mut self, peer_kind: PeerKind) -> Self {
        self.peer_kind = Some(peer_kind);
        self
    }

    pub(super) fn gs_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub(super) fn thresholds(mut self, thresholds: ScoreThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    pub(super) fn create_network(self) -> (TestRouter, Vec<PeerId>, Vec<TopicHash>) {
        let config = self.config.unwrap_or_default();
        let thresholds = self.thresholds.unwrap_or_default();
        let mut gs = Router::with_peer_score(
            config,
            TestHost::default(),
            StaticScore::default(),
            thresholds,
        );

        let topic_hashes = self
            .topics
            .iter()
            .map(|t| Topic::new(t.clone()).hash())
            .collect::<Vec<_>>();

        let mut peers = Vec::new();
        for i in 0..self.peer_no {
            let peer_id = add_peer(
                &mut gs,
                &topic_hashes,
                i < self.outbound,
                self.peer_kind.unwrap_or(PeerKind::Gossipsubv1_1),
            );
            peers.push(peer_id);
        }

        if self.to_subscribe {
            for topic_hash in &topic_hashes {
                gs.subscribe(topic_hash.clone());
            }
        }

        (gs, peers, topic_hashes)
    }
}

/// Registers a new connected peer subscribed to `topics`.
pub(super) fn add_peer(
    gs: &mut TestRouter,
    topics: &[TopicHash],
    outbound: bool,
    kind: PeerKind,
) -> PeerId {
    let peer_id = PeerId::random();
    for topic_hash in topics {
        gs.host
            .topic_peers
            .entry(topic_hash.clone())
            .or_default()
            .push(peer_id);
    }
    gs.on_peer_active(peer_id, kind, outbound);
    peer_id
}

/// Removes a peer from the network entirely.
pub(super) fn disconnect_peer(gs: &mut TestRouter, peer_id: &PeerId) {
    for peers in gs.host.topic_peers.values_mut() {
        peers.retain(|p| p != peer_id);
    }
    gs.on_peer_disconnected(peer_id);
}

/// Counts the sent RPC parts satisfying `filter`.
pub(super) fn count_sent<F>(gs: &TestRouter, mut filter: F) -> usize
where
    F: FnMut(&PeerId, &RpcOut) -> bool,
{
    gs.host
        .sent
        .iter()
        .filter(|(peer_id, rpc)| filter(peer_id, rpc))
        .count()
}

/// Empties the record of sent RPC parts.
pub(super) fn flush_sent(gs: &mut TestRouter) {
    gs.host.sent.clear();
}

/// Builds a message published to `topics` with a random source and payload,
/// returning it together with its id under the default id function.
pub(super) fn random_message(gs: &TestRouter, topics: Vec<TopicHash>) -> (MessageId, RawMessage) {
    let message = RawMessage {
        source: Some(PeerId::random()),
        data: (0..16).map(|_| rand::random::<u8>()).collect(),
        sequence_number: Some(rand::random::<u64>()),
        topics,
        signature: None,
    };
    (gs.config.message_id(&message), message)
}
