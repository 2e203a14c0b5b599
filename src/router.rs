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

use std::{
    cmp::{max, Ordering},
    collections::{HashMap, HashSet},
    task::{Context, Poll},
    time::Duration,
};

use futures::StreamExt;
use hashlink::LinkedHashSet;
use libp2p_identity::PeerId;
use rand::{seq::SliceRandom, thread_rng};
use web_time::Instant;

use crate::{
    backoff::BackoffStorage,
    config::Config,
    error::{PublishError, SendError},
    gossip_promises::GossipPromises,
    interval::Interval,
    mcache::MessageCache,
    score::{NullScore, PeerScore, ScoreThresholds},
    topic::TopicHash,
    trackers::CounterTable,
    types::{
        ControlAction, Graft, IHave, IWant, MessageId, PeerHandler, PeerInfo, PeerKind, Prune,
        RawMessage, RpcIn, RpcOut,
    },
};

#[cfg(test)]
mod tests;

/// The capabilities the embedding node injects into the router.
///
/// The router owns the routing state exclusively; everything it needs from
/// the outside (subscription bookkeeping, message dedup, the transport and
/// the dialer) comes through this trait.
pub trait Host {
    /// All currently known peers subscribed to `topic`.
    fn peers_in_topic(&self, topic: &TopicHash) -> Vec<PeerId>;

    /// Whether the message id is in the seen-messages set of the outer
    /// router.
    fn has_seen(&self, message_id: &MessageId) -> bool;

    /// Delivers a batch of RPC parts to a peer. Parts of a batch must reach
    /// the peer in order; the router never retries a failed batch.
    fn send_rpc(&mut self, peer_id: &PeerId, batch: Vec<RpcOut>) -> Result<(), SendError>;

    /// Requests a connection to a peer learned through peer exchange. The
    /// signed peer record is passed along unvalidated.
    fn dial(&mut self, peer_id: PeerId, signed_peer_record: Option<Vec<u8>>);
}

/// The meshsub routing state machine.
///
/// Maintains a mesh of peers per subscribed topic, fanout sets for topics the
/// node publishes to without subscribing, the message cache feeding IHAVE
/// gossip and IWANT retransmissions, and the backoff and request trackers
/// protecting all of it from misbehaving peers.
///
/// Every entry point takes `&mut self` and runs to completion; drive all
/// calls from a single task. Outbound RPC parts are queued per peer and
/// flushed in batch before each entry point returns.
pub struct Router<H, S = NullScore> {
    /// Configuration providing gossip performance parameters.
    config: Config,

    /// The injected host environment.
    host: H,

    /// The scoring capability.
    scorer: S,

    /// The thresholds peer scores are compared against.
    thresholds: ScoreThresholds,

    /// The attributes of each connected peer.
    connected_peers: HashMap<PeerId, PeerHandler>,

    /// Configuration-pinned peers that receive every message and are never
    /// meshed.
    direct_peers: HashSet<PeerId>,

    /// Overlay network of connected peers - Maps topics to connected
    /// meshsub peers.
    mesh: HashMap<TopicHash, LinkedHashSet<PeerId>>,

    /// Map of topics to list of peers that we publish to, but don't
    /// subscribe to.
    fanout: HashMap<TopicHash, LinkedHashSet<PeerId>>,

    /// The last publish time for topics, driving fanout expiry.
    fanout_last_pub: HashMap<TopicHash, Instant>,

    /// Storage for backoffs.
    backoffs: BackoffStorage,

    /// Message cache for the last few heartbeats.
    mcache: MessageCache,

    /// Counts the number of IHAVE messages received from each peer since the
    /// last heartbeat.
    count_received_ihave: CounterTable,

    /// Counts the number of IWANT message ids sent to each peer since the
    /// last heartbeat.
    count_sent_iwant: CounterTable,

    /// Tracks the IWANT requests awaiting fulfilment.
    gossip_promises: GossipPromises,

    /// Outbound RPC parts queued per peer until the next flush.
    pending_rpc: HashMap<PeerId, Vec<RpcOut>>,

    /// Heartbeat interval stream, armed on first peer activation.
    heartbeat: Option<Interval>,

    /// Number of heartbeats since the start of the router.
    heartbeat_ticks: u64,
}

impl<H: Host> Router<H, NullScore> {
    /// Creates a router without peer scoring.
    pub fn new(config: Config, host: H) -> Self {
        Self::with_peer_score(config, host, NullScore, ScoreThresholds::default())
    }
}

impl<H, S> Router<H, S>
where
    H: Host,
    S: PeerScore,
{
    /// Creates a router with the given scoring capability.
    pub fn with_peer_score(config: Config, host: H, scorer: S, thresholds: ScoreThresholds) -> Self {
        Router {
            backoffs: BackoffStorage::new(
                config.prune_backoff(),
                config.graft_flood_threshold(),
            ),
            mcache: MessageCache::new(config.history_gossip(), config.history_length()),
            host,
            scorer,
            thresholds,
            connected_peers: HashMap::new(),
            direct_peers: HashSet::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            count_received_ihave: CounterTable::new(),
            count_sent_iwant: CounterTable::new(),
            gossip_promises: GossipPromises::default(),
            pending_rpc: HashMap::new(),
            heartbeat: None,
            heartbeat_ticks: 0,
            config,
        }
    }

    /// The injected host environment.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Lists the topics we are currently subscribed to.
    pub fn topics(&self) -> impl Iterator<Item = &TopicHash> {
        self.mesh.keys()
    }

    /// Lists all mesh peers for a certain topic.
    pub fn mesh_peers(&self, topic_hash: &TopicHash) -> impl Iterator<Item = &PeerId> {
        self.mesh.get(topic_hash).into_iter().flat_map(|x| x.iter())
    }

    /// Adds a peer to the set of direct peers. Direct peers receive all
    /// published and forwarded messages and are never part of a mesh.
    pub fn add_direct_peer(&mut self, peer_id: PeerId) {
        tracing::debug!(peer=%peer_id, "Adding direct peer");
        self.direct_peers.insert(peer_id);
    }

    /// Removes a peer from the set of direct peers.
    pub fn remove_direct_peer(&mut self, peer_id: &PeerId) {
        tracing::debug!(peer=%peer_id, "Removing direct peer");
        self.direct_peers.remove(peer_id);
    }

    /// Whether requests from the peer should be processed at all. Direct
    /// peers always pass; everyone else must not be graylisted.
    pub fn accept_requests_from(&self, peer_id: &PeerId) -> bool {
        self.direct_peers.contains(peer_id)
            || !self
                .score_below_threshold(peer_id, |ts| ts.graylist_threshold)
                .0
    }

    /// Registers a newly active peer and its negotiated protocol.
    ///
    /// The heartbeat task is armed on the first activation.
    pub fn on_peer_active(&mut self, peer_id: PeerId, kind: PeerKind, outbound: bool) {
        tracing::debug!(peer=%peer_id, %kind, outbound, "New peer active");
        self.connected_peers
            .insert(peer_id, PeerHandler { kind, outbound });
        self.scorer.connected(&peer_id);

        if self.heartbeat.is_none() {
            self.heartbeat = Some(Interval::new_initial(
                self.config.heartbeat_initial_delay(),
                self.config.heartbeat_interval(),
            ));
        }
    }

    /// Removes a disconnected peer from every table and drops its queued
    /// outbound parts.
    pub fn on_peer_disconnected(&mut self, peer_id: &PeerId) {
        tracing::debug!(peer=%peer_id, "Peer disconnected");

        for peers in self.mesh.values_mut() {
            peers.remove(peer_id);
        }
        for peers in self.fanout.values_mut() {
            peers.remove(peer_id);
        }

        // Queued parts are dropped, not delivered.
        self.pending_rpc.remove(peer_id);
        self.connected_peers.remove(peer_id);
        self.scorer.disconnected(peer_id);
    }

    /// Subscribe to a topic.
    ///
    /// Returns `Ok(true)` if the subscription worked. Returns `Ok(false)` if
    /// we were already subscribed.
    pub fn subscribe(&mut self, topic: impl Into<TopicHash>) -> bool {
        let topic_hash = topic.into();
        tracing::debug!(topic=%topic_hash, "Subscribing to topic");
        if self.mesh.contains_key(&topic_hash) {
            tracing::debug!(topic=%topic_hash, "Topic is already in the mesh");
            return false;
        }

        self.join(&topic_hash);
        self.flush_pending();
        tracing::debug!(topic=%topic_hash, "Subscribed to topic");
        true
    }

    /// Unsubscribes from a topic, pruning every current mesh peer.
    ///
    /// Returns `true` if we were subscribed to this topic.
    pub fn unsubscribe(&mut self, topic: impl Into<TopicHash>) -> bool {
        let topic_hash = topic.into();
        tracing::debug!(topic=%topic_hash, "Unsubscribing from topic");
        if !self.mesh.contains_key(&topic_hash) {
            tracing::debug!(topic=%topic_hash, "Already unsubscribed from topic");
            return false;
        }

        self.leave(&topic_hash);
        self.flush_pending();
        tracing::debug!(topic=%topic_hash, "Unsubscribed from topic");
        true
    }

    /// Publishes a locally originated message to the network.
    pub fn publish(&mut self, message: RawMessage) -> Result<MessageId, PublishError> {
        let msg_id = self.config.message_id(&message);
        tracing::trace!(message=%msg_id, "Publishing message");

        let now = Instant::now();
        for topic in &message.topics {
            self.fanout_last_pub.insert(topic.clone(), now);
        }

        let mut recipient_peers = HashSet::new();
        if self.config.flood_publish() {
            // Forward to all peers above the publish threshold.
            for topic in &message.topics {
                recipient_peers.extend(
                    self.host
                        .peers_in_topic(topic)
                        .into_iter()
                        .filter(|p| self.connected_peers.contains_key(p))
                        .filter(|p| {
                            self.direct_peers.contains(p)
                                || !self.score_below_threshold(p, |ts| ts.publish_threshold).0
                        }),
                );
            }
        } else {
            for topic in &message.topics {
                let mesh_peers: Vec<PeerId> =
                    self.mesh.get(topic).into_iter().flatten().copied().collect();
                let fanout_peers: Vec<PeerId> = self
                    .fanout
                    .get(topic)
                    .into_iter()
                    .flatten()
                    .copied()
                    .collect();
                if !mesh_peers.is_empty() {
                    // Mesh peers.
                    recipient_peers.extend(mesh_peers);
                } else if !fanout_peers.is_empty() {
                    // Fanout peers.
                    recipient_peers.extend(fanout_peers);
                } else {
                    // We have no fanout peers, select mesh_n of them.
                    let new_peers = get_random_peers(
                        &self.host,
                        &self.connected_peers,
                        topic,
                        self.config.mesh_n(),
                        |p| {
                            !self.direct_peers.contains(p)
                                && !self.score_below_threshold(p, |ts| ts.publish_threshold).0
                        },
                    );
                    if !self.mesh.contains_key(topic) {
                        // Install them as the fanout for the topic.
                        tracing::debug!(topic=%topic, "Installing fanout peers for topic");
                        self.fanout
                            .insert(topic.clone(), new_peers.iter().copied().collect());
                    }
                    recipient_peers.extend(new_peers);
                }
            }
        }

        // Direct peers receive every published message.
        recipient_peers.extend(
            self.direct_peers
                .iter()
                .filter(|p| self.connected_peers.contains_key(p)),
        );

        if recipient_peers.is_empty() {
            return Err(PublishError::InsufficientPeers);
        }

        self.mcache.put(&msg_id, message.clone());

        for peer_id in &recipient_peers {
            tracing::trace!(peer=%peer_id, "Sending message to peer");
            self.queue_rpc(*peer_id, RpcOut::Publish(message.clone()));
        }

        // A broadcast succeeds as long as any recipient accepted it.
        if self.flush_pending() == 0 {
            return Err(PublishError::AllQueuesFull(recipient_peers.len()));
        }

        tracing::debug!(message=%msg_id, "Published message");
        Ok(msg_id)
    }

    /// Handles a decoded RPC received from a peer: forwards carried messages
    /// and dispatches control items by kind.
    pub fn on_inbound_rpc(&mut self, peer_id: &PeerId, rpc: RpcIn) {
        if !self.connected_peers.contains_key(peer_id) {
            tracing::error!(peer=%peer_id, "RPC from peer that is not connected");
            return;
        }

        for message in rpc.messages {
            self.handle_received_message(message, peer_id);
        }

        let mut graft_topics = Vec::new();
        let mut prune_data = Vec::new();
        let mut ihave_msgs = Vec::new();
        let mut iwant_ids = Vec::new();
        for action in rpc.control {
            match action {
                ControlAction::Graft(Graft { topic_hash }) => graft_topics.push(topic_hash),
                ControlAction::Prune(Prune {
                    topic_hash,
                    peers,
                    backoff,
                }) => prune_data.push((topic_hash, peers, backoff)),
                ControlAction::IHave(IHave {
                    topic_hash,
                    message_ids,
                }) => ihave_msgs.push((topic_hash, message_ids)),
                ControlAction::IWant(IWant { message_ids }) => iwant_ids.extend(message_ids),
            }
        }

        if !ihave_msgs.is_empty() {
            self.handle_ihave(peer_id, ihave_msgs);
        }
        if !iwant_ids.is_empty() {
            self.handle_iwant(peer_id, iwant_ids);
        }
        if !graft_topics.is_empty() {
            self.handle_graft(peer_id, graft_topics);
        }
        if !prune_data.is_empty() {
            self.handle_prune(peer_id, prune_data);
        }

        self.flush_pending();
    }

    /// Runs one heartbeat. Public so that embedders and tests can drive the
    /// router without an executor; [`poll`](Router::poll) calls this on every
    /// interval tick.
    pub fn heartbeat(&mut self) {
        tracing::debug!("Starting heartbeat");
        self.heartbeat_ticks += 1;

        let mut to_graft: HashMap<PeerId, Vec<TopicHash>> = HashMap::new();
        let mut to_prune: HashMap<PeerId, Vec<TopicHash>> = HashMap::new();
        let mut no_px = HashSet::new();

        // Clean up per-window gossip counters.
        self.count_sent_iwant.clear();
        self.count_received_ihave.clear();

        // Apply penalties for broken IWANT promises.
        self.apply_iwant_penalties();

        // Cache the scores of all connected peers.
        let scores: HashMap<PeerId, f64> = self
            .connected_peers
            .keys()
            .map(|peer_id| (*peer_id, self.scorer.score(peer_id)))
            .collect();
        let score_of = |scores: &HashMap<PeerId, f64>, p: &PeerId| *scores.get(p).unwrap_or(&0.0);

        // Maintain the mesh for each topic.
        for (topic_hash, peers) in self.mesh.iter_mut() {
            let host = &self.host;
            let connected_peers = &self.connected_peers;
            let direct_peers = &self.direct_peers;
            let backoffs = &self.backoffs;
            let is_outbound =
                |p: &PeerId| connected_peers.get(p).is_some_and(|handler| handler.outbound);

            // Drop all peers with negative score, without PX.
            let to_remove_peers = peers
                .iter()
                .filter(|&p| score_of(&scores, p) < 0.0)
                .copied()
                .collect::<Vec<_>>();
            for peer_id in to_remove_peers {
                tracing::debug!(
                    peer=%peer_id,
                    score=%score_of(&scores, &peer_id),
                    topic=%topic_hash,
                    "HEARTBEAT: Prune peer with negative score"
                );
                peers.remove(&peer_id);
                to_prune.entry(peer_id).or_default().push(topic_hash.clone());
                no_px.insert(peer_id);
            }

            // Too little peers - add some.
            if peers.len() < self.config.mesh_n_low() {
                tracing::debug!(
                    topic=%topic_hash,
                    "HEARTBEAT: Mesh low. Topic contains: {} needs: {}",
                    peers.len(),
                    self.config.mesh_n_low()
                );
                // Not enough peers - get mesh_n - current_length more.
                let desired_peers = self.config.mesh_n() - peers.len();
                let peer_list =
                    get_random_peers(host, connected_peers, topic_hash, desired_peers, |peer| {
                        !peers.contains(peer)
                            && !direct_peers.contains(peer)
                            && !backoffs.is_backoff(topic_hash, peer)
                            && score_of(&scores, peer) >= 0.0
                    });
                for peer in &peer_list {
                    to_graft.entry(*peer).or_default().push(topic_hash.clone());
                }
                peers.extend(peer_list);
            }

            // Too many peers - remove some.
            if peers.len() > self.config.mesh_n_high() {
                tracing::debug!(
                    topic=%topic_hash,
                    "HEARTBEAT: Mesh high. Topic contains: {} needs: {}",
                    peers.len(),
                    self.config.mesh_n()
                );
                let mut rng = thread_rng();

                // Sort by score descending and keep the retain_scores best
                // regardless of what the shuffle does to the remainder.
                let mut sorted = peers.iter().copied().collect::<Vec<_>>();
                sorted.sort_by(|p1, p2| {
                    score_of(&scores, p2)
                        .partial_cmp(&score_of(&scores, p1))
                        .unwrap_or(Ordering::Equal)
                });
                let keep_count = self.config.retain_scores().min(sorted.len());
                let keep_pool = &sorted[..keep_count];
                let mut rest = sorted[keep_count..].to_vec();
                rest.shuffle(&mut rng);

                // Ensure the retained set holds enough outbound peers.
                let outbound_count = keep_pool
                    .iter()
                    .chain(rest.iter())
                    .take(self.config.mesh_n())
                    .filter(|p| is_outbound(p))
                    .count();
                let deficit = self.config.mesh_outbound_min().saturating_sub(outbound_count);
                let out_picks = rest
                    .iter()
                    .filter(|p| is_outbound(p))
                    .take(deficit)
                    .copied()
                    .collect::<Vec<_>>();

                let retained = out_picks
                    .iter()
                    .chain(keep_pool.iter())
                    .chain(rest.iter())
                    .copied()
                    .collect::<LinkedHashSet<_>>()
                    .into_iter()
                    .take(self.config.mesh_n())
                    .collect::<LinkedHashSet<_>>();

                for peer_id in peers.iter() {
                    if !retained.contains(peer_id) {
                        to_prune
                            .entry(*peer_id)
                            .or_default()
                            .push(topic_hash.clone());
                    }
                }
                *peers = retained;
            }

            // Do we have enough outbound peers?
            let outbound = peers.iter().filter(|p| is_outbound(p)).count();
            if outbound < self.config.mesh_outbound_min() {
                let needed = self.config.mesh_outbound_min() - outbound;
                let peer_list =
                    get_random_peers(host, connected_peers, topic_hash, needed, |peer| {
                        !peers.contains(peer)
                            && !direct_peers.contains(peer)
                            && !backoffs.is_backoff(topic_hash, peer)
                            && score_of(&scores, peer) >= 0.0
                            && is_outbound(peer)
                    });
                for peer in &peer_list {
                    to_graft.entry(*peer).or_default().push(topic_hash.clone());
                }
                peers.extend(peer_list);
            }

            // Should we try to improve the mesh with opportunistic grafting?
            if self.heartbeat_ticks % self.config.opportunistic_graft_ticks() == 0
                && peers.len() > 1
            {
                // Opportunistic grafting works as follows: we check the
                // median score of peers in the mesh; if this score is below
                // the opportunistic_graft_threshold, we select a few peers at
                // random with score over the median.
                let mut peers_by_score = peers.iter().copied().collect::<Vec<_>>();
                peers_by_score.sort_by(|p1, p2| {
                    score_of(&scores, p1)
                        .partial_cmp(&score_of(&scores, p2))
                        .unwrap_or(Ordering::Equal)
                });

                let middle = peers_by_score.len() / 2;
                let median = if peers_by_score.len() % 2 == 0 {
                    let sub_middle = score_of(&scores, &peers_by_score[middle - 1]);
                    let middle_score = score_of(&scores, &peers_by_score[middle]);
                    (sub_middle + middle_score) * 0.5
                } else {
                    score_of(&scores, &peers_by_score[middle])
                };

                if median < self.thresholds.opportunistic_graft_threshold {
                    let peer_list = get_random_peers(
                        host,
                        connected_peers,
                        topic_hash,
                        self.config.opportunistic_graft_peers(),
                        |peer| {
                            !peers.contains(peer)
                                && !direct_peers.contains(peer)
                                && !backoffs.is_backoff(topic_hash, peer)
                                && score_of(&scores, peer) > median
                        },
                    );
                    tracing::debug!(
                        topic=%topic_hash,
                        "Opportunistically graft in topic with peers {:?}",
                        peer_list
                    );
                    for peer in &peer_list {
                        to_graft.entry(*peer).or_default().push(topic_hash.clone());
                    }
                    peers.extend(peer_list);
                }
            }
        }

        // Maintain fanout: drop peers that left the topic or fell below the
        // publish threshold and top the set back up.
        for (topic_hash, peers) in self.fanout.iter_mut() {
            let host = &self.host;
            let connected_peers = &self.connected_peers;
            let direct_peers = &self.direct_peers;
            let topic_peers: HashSet<PeerId> = host.peers_in_topic(topic_hash).into_iter().collect();
            let publish_threshold = self.thresholds.publish_threshold;

            let to_remove_peers = peers
                .iter()
                .filter(|&p| {
                    !connected_peers.contains_key(p)
                        || !topic_peers.contains(p)
                        || score_of(&scores, p) < publish_threshold
                })
                .copied()
                .collect::<Vec<_>>();
            for peer_id in to_remove_peers {
                tracing::debug!(
                    peer=%peer_id,
                    topic=%topic_hash,
                    "HEARTBEAT: Peer removed from fanout for topic"
                );
                peers.remove(&peer_id);
            }

            // Not enough peers.
            if peers.len() < self.config.mesh_n() {
                let needed_peers = self.config.mesh_n() - peers.len();
                let new_peers =
                    get_random_peers(host, connected_peers, topic_hash, needed_peers, |peer| {
                        !peers.contains(peer)
                            && !direct_peers.contains(peer)
                            && score_of(&scores, peer) >= publish_threshold
                    });
                peers.extend(new_peers);
            }
        }

        self.emit_gossip();

        // Remove expired fanout topics.
        {
            let fanout = &mut self.fanout; // help the borrow checker
            let fanout_ttl = self.config.fanout_ttl();
            self.fanout_last_pub.retain(|topic_hash, last_pub_time| {
                if *last_pub_time + fanout_ttl < Instant::now() {
                    tracing::debug!(
                        topic=%topic_hash,
                        "HEARTBEAT: Fanout topic removed due to timeout"
                    );
                    fanout.remove(topic_hash);
                    return false;
                }
                true
            });
        }

        // Send graft/prunes.
        if !to_graft.is_empty() || !to_prune.is_empty() {
            self.send_graft_prune(to_graft, to_prune, no_px);
        }

        // Shift the memcache.
        self.mcache.shift();

        self.flush_pending();
        tracing::debug!("Completed Heartbeat");
    }

    /// Drives the heartbeat interval. The interval is armed by the first
    /// [`on_peer_active`](Router::on_peer_active); before that this is a
    /// no-op.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            let ticked = match self.heartbeat.as_mut() {
                Some(interval) => matches!(interval.poll_next_unpin(cx), Poll::Ready(Some(()))),
                None => false,
            };
            if !ticked {
                return Poll::Pending;
            }
            self.heartbeat();
        }
    }

    /// Meshsub JOIN(topic) - adds topic peers to mesh and sends them GRAFT
    /// messages.
    fn join(&mut self, topic_hash: &TopicHash) {
        tracing::debug!(topic=%topic_hash, "Running JOIN for topic");

        let mut rng = thread_rng();
        let mut added_peers: Vec<PeerId> = Vec::new();

        // Check if we have peers in fanout[topic] and add them to the mesh
        // if we do, removing the fanout entry.
        if let Some(fanout_peers) = self.fanout.remove(topic_hash) {
            tracing::debug!(
                topic=%topic_hash,
                "JOIN: Adding peers from the fanout for topic"
            );
            let mut candidates = fanout_peers
                .into_iter()
                .filter(|p| self.connected_peers.contains_key(p))
                .filter(|p| {
                    !self.direct_peers.contains(p)
                        && !self.score_below_threshold(p, |_| 0.0).0
                        && !self.backoffs.is_backoff(topic_hash, p)
                })
                .collect::<Vec<_>>();
            candidates.shuffle(&mut rng);
            candidates.truncate(self.config.mesh_n());
            added_peers.extend(candidates);
        }

        // Check if we need to get more peers, which we randomly select.
        if added_peers.len() < self.config.mesh_n() {
            let new_peers = get_random_peers(
                &self.host,
                &self.connected_peers,
                topic_hash,
                self.config.mesh_n() - added_peers.len(),
                |peer| {
                    !added_peers.contains(peer)
                        && !self.direct_peers.contains(peer)
                        && !self.score_below_threshold(peer, |_| 0.0).0
                        && !self.backoffs.is_backoff(topic_hash, peer)
                },
            );
            tracing::debug!(
                "JOIN: Inserting {:?} random peers into the mesh",
                new_peers.len()
            );
            added_peers.extend(new_peers);
        }

        self.mesh
            .insert(topic_hash.clone(), added_peers.iter().copied().collect());

        for peer_id in added_peers {
            tracing::debug!(peer=%peer_id, "JOIN: Sending Graft message to peer");
            self.scorer.graft(&peer_id, topic_hash.clone());
            self.queue_rpc(
                peer_id,
                RpcOut::Graft(Graft {
                    topic_hash: topic_hash.clone(),
                }),
            );
        }

        // The subscription supersedes any fanout state for the topic.
        self.fanout_last_pub.remove(topic_hash);

        tracing::debug!(topic=%topic_hash, "Completed JOIN for topic");
    }

    /// Meshsub LEAVE(topic) - Notifies mesh\[topic\] peers with PRUNE
    /// messages.
    fn leave(&mut self, topic_hash: &TopicHash) {
        tracing::debug!(topic=%topic_hash, "Running LEAVE for topic");

        if let Some(peers) = self.mesh.remove(topic_hash) {
            for peer_id in peers {
                tracing::debug!(peer=%peer_id, "LEAVE: Sending PRUNE to peer");
                let on_unsubscribe = true;
                let prune =
                    self.make_prune(topic_hash, &peer_id, self.config.do_px(), on_unsubscribe);
                self.queue_rpc(peer_id, RpcOut::Prune(prune));
            }
        }
        tracing::debug!(topic=%topic_hash, "Completed LEAVE for topic");
    }

    /// Creates a PRUNE meshsub action and sets the local backoff for the
    /// peer.
    fn make_prune(
        &mut self,
        topic_hash: &TopicHash,
        peer_id: &PeerId,
        do_px: bool,
        on_unsubscribe: bool,
    ) -> Prune {
        self.scorer.prune(peer_id, topic_hash.clone());

        let backoff = if on_unsubscribe {
            self.config.unsubscribe_backoff()
        } else {
            self.config.prune_backoff()
        };
        self.backoffs.update_backoff(topic_hash, peer_id, backoff);

        if !self
            .connected_peers
            .get(peer_id)
            .is_some_and(|handler| handler.kind.supports_px())
        {
            // A v1.0 peer cannot parse the backoff or peer exchange fields.
            return Prune {
                topic_hash: topic_hash.clone(),
                peers: Vec::new(),
                backoff: None,
            };
        }

        // Select peers for peer exchange.
        let peers = if do_px {
            get_random_peers(
                &self.host,
                &self.connected_peers,
                topic_hash,
                self.config.prune_peers(),
                |p| p != peer_id && !self.score_below_threshold(p, |_| 0.0).0,
            )
            .into_iter()
            .map(|p| PeerInfo {
                peer_id: Some(p),
                signed_peer_record: None,
            })
            .collect()
        } else {
            Vec::new()
        };

        Prune {
            topic_hash: topic_hash.clone(),
            peers,
            backoff: Some(backoff.as_secs()),
        }
    }

    /// Handles a received message: clears the matching gossip promise,
    /// records the delivery with the scorer, relays to mesh and direct peers
    /// and retains the message for gossip.
    fn handle_received_message(&mut self, message: RawMessage, propagation_source: &PeerId) {
        let msg_id = self.config.message_id(&message);
        tracing::debug!(message=%msg_id, peer=%propagation_source, "Handling received message");

        self.gossip_promises.deliver_message(&msg_id);
        for topic in &message.topics {
            self.scorer.deliver_message(propagation_source, &msg_id, topic);
        }

        let mut recipient_peers = HashSet::new();
        for topic in &message.topics {
            if let Some(mesh_peers) = self.mesh.get(topic) {
                recipient_peers.extend(mesh_peers.iter().copied());
            }
        }
        recipient_peers.extend(
            self.direct_peers
                .iter()
                .filter(|p| self.connected_peers.contains_key(p)),
        );
        recipient_peers.remove(propagation_source);
        if let Some(source) = message.source.as_ref() {
            recipient_peers.remove(source);
        }

        self.mcache.put(&msg_id, message.clone());

        for peer_id in recipient_peers {
            tracing::debug!(peer=%peer_id, message=%msg_id, "Forwarding message to peer");
            self.queue_rpc(peer_id, RpcOut::Forward(message.clone()));
        }
    }

    /// Handles an IHAVE control message. Checks our cache of messages. If the
    /// message is unknown, requests it with an IWANT control message.
    fn handle_ihave(&mut self, peer_id: &PeerId, ihave_msgs: Vec<(TopicHash, Vec<MessageId>)>) {
        // We ignore IHAVE gossip from any peer whose score is below the
        // gossip threshold.
        if let (true, score) = self.score_below_threshold(peer_id, |ts| ts.gossip_threshold) {
            tracing::debug!(
                peer=%peer_id,
                %score,
                "IHAVE: ignoring peer with score below threshold"
            );
            return;
        }

        // IHAVE flood protection.
        let peer_have = self.count_received_ihave.add(peer_id, 1);
        if peer_have > self.config.max_ihave_messages() {
            tracing::debug!(
                peer=%peer_id,
                "IHAVE: peer has advertised too many times ({}) within this heartbeat \
            interval; ignoring",
                peer_have
            );
            return;
        }

        let iasked = self.count_sent_iwant.get(peer_id);
        if iasked >= self.config.max_ihave_length() {
            tracing::debug!(
                peer=%peer_id,
                "IHAVE: peer has already advertised too many messages ({}); ignoring",
                iasked
            );
            return;
        }

        tracing::trace!(peer=%peer_id, "Handling IHAVE for peer");

        let mut iwant_ids = HashSet::new();
        for (topic, ids) in ihave_msgs {
            // Only process the message if we are subscribed.
            if !self.mesh.contains_key(&topic) {
                tracing::debug!(
                    %topic,
                    "IHAVE: Ignoring IHAVE - Not subscribed to topic"
                );
                continue;
            }

            for id in ids {
                // Have not seen this message and are not currently requesting
                // it.
                if !self.host.has_seen(&id) && !self.gossip_promises.contains(&id) {
                    iwant_ids.insert(id);
                }
            }
        }

        if !iwant_ids.is_empty() {
            let iask = iwant_ids
                .len()
                .min(self.config.max_ihave_length() - iasked);

            tracing::debug!(
                peer=%peer_id,
                "IHAVE: Asking for {} out of {} messages from peer",
                iask,
                iwant_ids.len()
            );

            // Ask in random order.
            let mut iwant_ids_vec: Vec<_> = iwant_ids.into_iter().collect();
            let mut rng = thread_rng();
            iwant_ids_vec.partial_shuffle(&mut rng, iask);
            iwant_ids_vec.truncate(iask);

            self.count_sent_iwant.add(peer_id, iask);

            self.gossip_promises.add_promise(
                *peer_id,
                &iwant_ids_vec,
                Instant::now() + self.config.iwant_followup_time(),
            );
            tracing::trace!(
                peer=%peer_id,
                "IHAVE: Asking for the following messages from peer: {:?}",
                iwant_ids_vec
            );

            self.queue_rpc(
                *peer_id,
                RpcOut::IWant(IWant {
                    message_ids: iwant_ids_vec,
                }),
            );
        }
    }

    /// Handles an IWANT control message. Checks our cache of messages. If the
    /// message exists it is forwarded to the requesting peer.
    fn handle_iwant(&mut self, peer_id: &PeerId, iwant_msgs: Vec<MessageId>) {
        // We ignore IWANT gossip from any peer whose score is below the
        // gossip threshold.
        if let (true, score) = self.score_below_threshold(peer_id, |ts| ts.gossip_threshold) {
            tracing::debug!(
                peer=%peer_id,
                %score,
                "IWANT: ignoring peer with score below threshold"
            );
            return;
        }

        tracing::debug!(peer=%peer_id, "Handling IWANT for peer");

        for id in iwant_msgs {
            // If we have it and the retransmission count is below the
            // threshold, forward the message.
            if let Some((msg, count)) = self
                .mcache
                .get_for_peer(peer_id, &id)
                .map(|(msg, count)| (msg.clone(), count))
            {
                if count < self.config.gossip_retransmission() {
                    tracing::debug!(peer=%peer_id, "IWANT: Sending cached messages to peer");
                    self.queue_rpc(*peer_id, RpcOut::Forward(msg));
                } else {
                    tracing::debug!(
                        peer=%peer_id,
                        message=%id,
                        "IWANT: Peer has asked for message too many times; ignoring request"
                    );
                }
            }
        }
    }

    /// Handles GRAFT control messages. If subscribed to the topic, adds the
    /// peer to mesh, if not, responds with PRUNE messages.
    fn handle_graft(&mut self, peer_id: &PeerId, topics: Vec<TopicHash>) {
        tracing::debug!(peer=%peer_id, "Handling GRAFT message for peer");

        let Some(handler) = self.connected_peers.get(peer_id).copied() else {
            tracing::error!(peer=%peer_id, "Peer non-existent when handling graft");
            return;
        };

        let mut to_prune_topics = Vec::new();
        let mut do_px = self.config.do_px();

        let (below_zero, score) = self.score_below_threshold(peer_id, |_| 0.0);
        for topic_hash in topics {
            // Spam hardening: ignore GRAFTs for unknown topics.
            if !self.mesh.contains_key(&topic_hash) {
                tracing::debug!(
                    peer=%peer_id,
                    topic=%topic_hash,
                    "GRAFT: Received graft for unknown topic from peer"
                );
                // Don't do PX when there is an unknown topic to avoid leaking
                // our peers.
                do_px = false;
                continue;
            }

            // We don't GRAFT to/from direct peers; complain loudly if this
            // happens.
            if self.direct_peers.contains(peer_id) {
                tracing::warn!(peer=%peer_id, "GRAFT: ignoring request from direct peer");
                to_prune_topics.push(topic_hash);
                // But don't PX.
                do_px = false;
                continue;
            }

            // Make sure we are not backing off that peer.
            if self.backoffs.is_backoff(&topic_hash, peer_id) {
                tracing::warn!(
                    peer=%peer_id,
                    "[Penalty] Peer attempted graft within backoff time, penalizing"
                );
                self.scorer.add_penalty(peer_id, 1);
                // Check the flood cutoff.
                if self.backoffs.is_flood(&topic_hash, peer_id) {
                    // Extra penalty.
                    self.scorer.add_penalty(peer_id, 1);
                }
                // No PX.
                do_px = false;
                to_prune_topics.push(topic_hash);
                continue;
            }

            // Check the score.
            if below_zero {
                // We don't GRAFT peers with negative score...
                tracing::debug!(
                    peer=%peer_id,
                    %score,
                    topic=%topic_hash,
                    "GRAFT: ignoring peer with negative score"
                );
                // ...we do send them PRUNE however, because it's a matter of
                // protocol correctness. But we won't PX to them.
                do_px = false;
                to_prune_topics.push(topic_hash);
                continue;
            }

            // Check mesh upper bound and only allow graft if the upper bound
            // is not reached or if it is an outbound peer.
            let peers = self
                .mesh
                .get_mut(&topic_hash)
                .expect("topic filtered to subscribed");
            if peers.len() >= self.config.mesh_n_high() && !handler.outbound {
                to_prune_topics.push(topic_hash);
                continue;
            }

            // If the peer is already in the mesh ignore the graft.
            if !peers.insert(*peer_id) {
                tracing::debug!(
                    peer=%peer_id,
                    topic=%topic_hash,
                    "GRAFT: Received graft for peer that is already in topic"
                );
                continue;
            }

            tracing::debug!(
                peer=%peer_id,
                topic=%topic_hash,
                "GRAFT: Mesh link added for peer in topic"
            );
            self.scorer.graft(peer_id, topic_hash.clone());
            self.queue_rpc(*peer_id, RpcOut::Graft(Graft { topic_hash }));
        }

        if !to_prune_topics.is_empty() {
            // Build the prune messages to send.
            tracing::debug!(peer=%peer_id, "GRAFT: Not grafting peer - Sending PRUNE");
            let on_unsubscribe = false;
            for prune in to_prune_topics
                .iter()
                .map(|t| self.make_prune(t, peer_id, do_px, on_unsubscribe))
                .collect::<Vec<_>>()
            {
                self.queue_rpc(*peer_id, RpcOut::Prune(prune));
            }
        }
        tracing::debug!(peer=%peer_id, "Completed GRAFT handling for peer");
    }

    /// Handles PRUNE control messages. Removes peer from the mesh, applies
    /// the signalled backoff and processes peer exchange.
    fn handle_prune(
        &mut self,
        peer_id: &PeerId,
        prune_data: Vec<(TopicHash, Vec<PeerInfo>, Option<u64>)>,
    ) {
        tracing::debug!(peer=%peer_id, "Handling PRUNE message for peer");
        let Some(handler) = self.connected_peers.get(peer_id).copied() else {
            tracing::error!(peer=%peer_id, "Peer non-existent when handling prune");
            return;
        };

        let (below_threshold, score) =
            self.score_below_threshold(peer_id, |ts| ts.accept_px_threshold);
        for (topic_hash, px, backoff) in prune_data {
            if !handler.kind.supports_px() {
                // A v1.0 peer has no business sending v1.1 fields.
                if backoff.is_some() || !px.is_empty() {
                    tracing::warn!(
                        peer=%peer_id,
                        "[Penalty] Peer sent PRUNE with v1.1 fields over a v1.0 protocol"
                    );
                    self.scorer.add_penalty(peer_id, 1);
                }
                self.remove_peer_from_mesh(peer_id, &topic_hash, None, false);
                continue;
            }

            self.remove_peer_from_mesh(peer_id, &topic_hash, backoff, true);

            if self.mesh.contains_key(&topic_hash) && !px.is_empty() {
                // We ignore PX from peers with insufficient score.
                if below_threshold {
                    tracing::debug!(
                        peer=%peer_id,
                        %score,
                        topic=%topic_hash,
                        "PRUNE: ignoring PX from peer with insufficient score"
                    );
                    continue;
                }

                if self.config.prune_peers() > 0 {
                    self.px_connect(px);
                }
            }
        }
        tracing::debug!(peer=%peer_id, "Completed PRUNE handling for peer");
    }

    /// Removes the peer from the mesh of a topic, recording the backoff the
    /// peer signalled (or the default one).
    fn remove_peer_from_mesh(
        &mut self,
        peer_id: &PeerId,
        topic_hash: &TopicHash,
        backoff: Option<u64>,
        update_backoff: bool,
    ) {
        if let Some(peers) = self.mesh.get_mut(topic_hash) {
            if peers.remove(peer_id) {
                tracing::debug!(
                    peer=%peer_id,
                    topic=%topic_hash,
                    "PRUNE: Removing peer from the mesh for topic"
                );
                self.scorer.prune(peer_id, topic_hash.clone());
            }
        }
        if update_backoff {
            // Is there a backoff specified by the peer? if so obey it.
            let time = match backoff {
                Some(seconds) => Duration::from_secs(seconds),
                None => self.config.prune_backoff(),
            };
            self.backoffs.update_backoff(topic_hash, peer_id, time);
        }
    }

    /// Hands the peers of an accepted PRUNE peer exchange list to the host's
    /// dialer.
    fn px_connect(&mut self, mut px: Vec<PeerInfo>) {
        let n = self.config.prune_peers();
        // Ignore peerInfo with no ID.
        px.retain(|p| p.peer_id.is_some());
        if px.len() > n {
            // Only use at most prune_peers many random peers.
            let mut rng = thread_rng();
            px.partial_shuffle(&mut rng, n);
            px.truncate(n);
        }

        for p in px {
            let peer_id = p.peer_id.expect("infos without id are filtered");
            // The record is forwarded opaquely; dialing already connected
            // peers is pointless.
            if !self.connected_peers.contains_key(&peer_id) {
                tracing::debug!(peer=%peer_id, "PX: dialing peer");
                self.host.dial(peer_id, p.signed_peer_record);
            }
        }
    }

    /// Applies penalties to peers that did not respond to our IWANT requests.
    fn apply_iwant_penalties(&mut self) {
        for (peer_id, count) in self.gossip_promises.get_broken_promises() {
            self.scorer.add_penalty(&peer_id, count);
        }
    }

    /// Emits gossip - Send IHAVE messages to a random set of gossip peers.
    /// This is applied to mesh and fanout peers.
    fn emit_gossip(&mut self) {
        let mut rng = thread_rng();
        let mut messages = Vec::new();
        for (topic_hash, peers) in self.mesh.iter().chain(self.fanout.iter()) {
            let mut message_ids = self.mcache.ids_for_topic(topic_hash);
            if message_ids.is_empty() {
                continue;
            }

            // Shuffle to emit in random order and cap the id list.
            message_ids.shuffle(&mut rng);
            message_ids.truncate(self.config.max_ihave_length());

            // Dynamic number of peers to gossip based on `gossip_factor`
            // with minimum `gossip_lazy`.
            let n_map = |m| {
                max(
                    self.config.gossip_lazy(),
                    (self.config.gossip_factor() * m as f64) as usize,
                )
            };
            let to_msg_peers = get_random_peers_dynamic(
                &self.host,
                &self.connected_peers,
                topic_hash,
                n_map,
                |peer| {
                    !peers.contains(peer)
                        && !self.direct_peers.contains(peer)
                        && !self.score_below_threshold(peer, |ts| ts.gossip_threshold).0
                },
            );

            tracing::debug!("Gossiping IHAVE to {} peers", to_msg_peers.len());

            for peer_id in to_msg_peers {
                messages.push((
                    peer_id,
                    RpcOut::IHave(IHave {
                        topic_hash: topic_hash.clone(),
                        message_ids: message_ids.clone(),
                    }),
                ));
            }
        }
        for (peer_id, message) in messages {
            self.queue_rpc(peer_id, message);
        }
    }

    /// Handles multiple GRAFT/PRUNE messages and coalesces them into chunked
    /// control messages.
    fn send_graft_prune(
        &mut self,
        to_graft: HashMap<PeerId, Vec<TopicHash>>,
        mut to_prune: HashMap<PeerId, Vec<TopicHash>>,
        no_px: HashSet<PeerId>,
    ) {
        // Handle the grafts and overlapping prunes per peer.
        for (peer_id, topics) in to_graft.into_iter() {
            for topic_hash in &topics {
                self.scorer.graft(&peer_id, topic_hash.clone());
                self.queue_rpc(
                    peer_id,
                    RpcOut::Graft(Graft {
                        topic_hash: topic_hash.clone(),
                    }),
                );
            }

            // If there are prunes associated with the same peer add them.
            if let Some(topics) = to_prune.remove(&peer_id) {
                for topic_hash in topics {
                    let prune = self.make_prune(
                        &topic_hash,
                        &peer_id,
                        self.config.do_px() && !no_px.contains(&peer_id),
                        false,
                    );
                    self.queue_rpc(peer_id, RpcOut::Prune(prune));
                }
            }
        }

        // Handle the remaining prunes.
        for (peer_id, topics) in to_prune.into_iter() {
            for topic_hash in topics {
                let prune = self.make_prune(
                    &topic_hash,
                    &peer_id,
                    self.config.do_px() && !no_px.contains(&peer_id),
                    false,
                );
                self.queue_rpc(peer_id, RpcOut::Prune(prune));
            }
        }
    }

    /// Determines if a peer's score is below a given `ScoreThresholds` field
    /// chosen via the `threshold` parameter.
    fn score_below_threshold(
        &self,
        peer_id: &PeerId,
        threshold: impl Fn(&ScoreThresholds) -> f64,
    ) -> (bool, f64) {
        let score = self.scorer.score(peer_id);
        (score < threshold(&self.thresholds), score)
    }

    /// Queues an outbound RPC part for a peer. Parts are delivered in
    /// enqueue order at the next flush.
    fn queue_rpc(&mut self, peer_id: PeerId, rpc: RpcOut) {
        if !self.connected_peers.contains_key(&peer_id) {
            tracing::error!(peer=%peer_id, "Could not queue RPC for non-connected peer");
            return;
        }
        self.pending_rpc.entry(peer_id).or_default().push(rpc);
    }

    /// Hands every queued batch to the host. Returns the number of batches
    /// the host accepted; failed batches are dropped, not retried.
    fn flush_pending(&mut self) -> usize {
        let mut delivered = 0;
        for (peer_id, batch) in self.pending_rpc.drain() {
            match self.host.send_rpc(&peer_id, batch) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(peer=%peer_id, %error, "Failed to send RPC batch to peer")
                }
            }
        }
        delivered
    }
}

/// Helper function to get a subset of random meshsub peers for a
/// `topic_hash` filtered by the function `f`. The number of peers to get
/// equals the output of `n_map` that gets as input the number of filtered
/// peers.
fn get_random_peers_dynamic<H: Host>(
    host: &H,
    connected_peers: &HashMap<PeerId, PeerHandler>,
    topic_hash: &TopicHash,
    // Maps the number of total peers to the number of selected peers.
    n_map: impl Fn(usize) -> usize,
    mut f: impl FnMut(&PeerId) -> bool,
) -> Vec<PeerId> {
    let mut gossip_peers = host
        .peers_in_topic(topic_hash)
        .into_iter()
        .filter(|peer_id| connected_peers.contains_key(peer_id))
        .filter(|peer_id| f(peer_id))
        .collect::<Vec<PeerId>>();

    // If we have less than needed, return them.
    let n = n_map(gossip_peers.len());
    if gossip_peers.len() <= n {
        tracing::debug!("RANDOM PEERS: Got {:?} peers", gossip_peers.len());
        return gossip_peers;
    }

    // We have more peers than needed, shuffle them and return n of them.
    let mut rng = thread_rng();
    gossip_peers.partial_shuffle(&mut rng, n);
    gossip_peers.truncate(n);

    tracing::debug!("RANDOM PEERS: Got {:?} peers", n);
    gossip_peers
}

/// Helper function to get a set of `n` random meshsub peers for a
/// `topic_hash` filtered by the function `f`.
fn get_random_peers<H: Host>(
    host: &H,
    connected_peers: &HashMap<PeerId, PeerHandler>,
    topic_hash: &TopicHash,
    n: usize,
    f: impl FnMut(&PeerId) -> bool,
) -> Vec<PeerId> {
    get_random_peers_dynamic(host, connected_peers, topic_hash, |_| n, f)
}
