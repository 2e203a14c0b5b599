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

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    error::ConfigBuilderError,
    types::{MessageId, RawMessage},
};

/// The type of the function used to derive a [`MessageId`] from a message.
pub type MessageIdFn = dyn Fn(&RawMessage) -> MessageId + Send + Sync + 'static;

/// Configuration parameters that define the performance of the meshsub
/// network.
#[derive(Clone)]
pub struct Config {
    history_length: usize,
    history_gossip: usize,
    mesh_n: usize,
    mesh_n_low: usize,
    mesh_n_high: usize,
    retain_scores: usize,
    mesh_outbound_min: usize,
    gossip_lazy: usize,
    gossip_factor: f64,
    heartbeat_initial_delay: Duration,
    heartbeat_interval: Duration,
    fanout_ttl: Duration,
    gossip_retransmission: u32,
    max_ihave_length: usize,
    max_ihave_messages: usize,
    prune_backoff: Duration,
    unsubscribe_backoff: Duration,
    graft_flood_threshold: Duration,
    opportunistic_graft_ticks: u64,
    opportunistic_graft_peers: usize,
    iwant_followup_time: Duration,
    flood_publish: bool,
    do_px: bool,
    prune_peers: usize,
    message_id_fn: Arc<MessageIdFn>,
}

impl Config {
    /// Number of heartbeats to keep in the message cache.
    pub fn history_length(&self) -> usize {
        self.history_length
    }

    /// Number of past heartbeats to gossip about.
    pub fn history_gossip(&self) -> usize {
        self.history_gossip
    }

    /// Target number of peers for the mesh network (D in the spec).
    pub fn mesh_n(&self) -> usize {
        self.mesh_n
    }

    /// Minimum number of peers in mesh network before adding more (D_lo in
    /// the spec).
    pub fn mesh_n_low(&self) -> usize {
        self.mesh_n_low
    }

    /// Maximum number of peers in mesh network before removing some (D_high
    /// in the spec).
    pub fn mesh_n_high(&self) -> usize {
        self.mesh_n_high
    }

    /// Number of highest-scoring mesh peers that are always retained when the
    /// mesh is rebalanced (D_score in the spec).
    pub fn retain_scores(&self) -> usize {
        self.retain_scores
    }

    /// Minimum number of outbound peers kept in the mesh (D_out in the spec).
    pub fn mesh_outbound_min(&self) -> usize {
        self.mesh_outbound_min
    }

    /// Minimum number of peers to emit gossip to during a heartbeat (D_lazy
    /// in the spec).
    pub fn gossip_lazy(&self) -> usize {
        self.gossip_lazy
    }

    /// Affects how many peers we will emit gossip to at each heartbeat. We
    /// will send gossip to `gossip_factor * (total number of non-mesh
    /// peers)`, or `gossip_lazy`, whichever is greater.
    pub fn gossip_factor(&self) -> f64 {
        self.gossip_factor
    }

    /// Initial delay before the first heartbeat.
    pub fn heartbeat_initial_delay(&self) -> Duration {
        self.heartbeat_initial_delay
    }

    /// Time between each heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Time to live for fanout peers.
    pub fn fanout_ttl(&self) -> Duration {
        self.fanout_ttl
    }

    /// Controls how many times we will allow a peer to request the same
    /// message id through IWANT gossip before we start ignoring them.
    pub fn gossip_retransmission(&self) -> u32 {
        self.gossip_retransmission
    }

    /// The maximum number of messages to include in an IHAVE message, and the
    /// maximum number of IHAVE ids we will accept and request with IWANT from
    /// a peer within a heartbeat.
    pub fn max_ihave_length(&self) -> usize {
        self.max_ihave_length
    }

    /// The maximum number of IHAVE messages to accept from a peer within a
    /// heartbeat.
    pub fn max_ihave_messages(&self) -> usize {
        self.max_ihave_messages
    }

    /// Time that a peer must wait before attempting to graft into our mesh
    /// again after being pruned.
    pub fn prune_backoff(&self) -> Duration {
        self.prune_backoff
    }

    /// Backoff imposed when pruning due to unsubscribing from a topic.
    pub fn unsubscribe_backoff(&self) -> Duration {
        self.unsubscribe_backoff
    }

    /// A graft arriving within this interval of a prune is treated as a
    /// backoff flood and penalized twice.
    pub fn graft_flood_threshold(&self) -> Duration {
        self.graft_flood_threshold
    }

    /// Number of heartbeat ticks between attempts to improve the mesh with
    /// opportunistic grafting.
    pub fn opportunistic_graft_ticks(&self) -> u64 {
        self.opportunistic_graft_ticks
    }

    /// The number of peers opportunistically grafted per attempt.
    pub fn opportunistic_graft_peers(&self) -> usize {
        self.opportunistic_graft_peers
    }

    /// Time to wait for a peer to deliver a message requested through IWANT
    /// before a broken-promise penalty applies.
    pub fn iwant_followup_time(&self) -> Duration {
        self.iwant_followup_time
    }

    /// When true, published messages are forwarded to all peers in the topic
    /// with an acceptable score rather than only mesh/fanout peers.
    pub fn flood_publish(&self) -> bool {
        self.flood_publish
    }

    /// Whether peer exchange is enabled on PRUNEs this node emits.
    pub fn do_px(&self) -> bool {
        self.do_px
    }

    /// The maximum number of peers accepted from (and embedded in) a single
    /// PRUNE peer exchange list.
    pub fn prune_peers(&self) -> usize {
        self.prune_peers
    }

    /// Derives the [`MessageId`] of a message with the configured function.
    pub fn message_id(&self, message: &RawMessage) -> MessageId {
        (self.message_id_fn)(message)
    }
}

impl Default for Config {
    fn default() -> Self {
        // use ConfigBuilder to also validate defaults
        ConfigBuilder::default()
            .build()
            .expect("Default config parameters should be valid parameters")
    }
}

/// The builder struct for constructing a meshsub configuration.
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            config: Config {
                history_length: 5,
                history_gossip: 3,
                mesh_n: 6,
                mesh_n_low: 4,
                mesh_n_high: 12,
                retain_scores: 4,
                mesh_outbound_min: 2,
                gossip_lazy: 6, // default to mesh_n
                gossip_factor: 0.25,
                heartbeat_initial_delay: Duration::from_millis(100),
                heartbeat_interval: Duration::from_secs(1),
                fanout_ttl: Duration::from_secs(60),
                gossip_retransmission: 3,
                max_ihave_length: 5000,
                max_ihave_messages: 10,
                prune_backoff: Duration::from_secs(60),
                unsubscribe_backoff: Duration::from_secs(10),
                graft_flood_threshold: Duration::from_secs(10),
                opportunistic_graft_ticks: 60,
                opportunistic_graft_peers: 2,
                iwant_followup_time: Duration::from_secs(3),
                flood_publish: true,
                do_px: true,
                prune_peers: 16,
                message_id_fn: Arc::new(|message| {
                    // default message id is: source + sequence number
                    let mut source_string = match message.source.as_ref() {
                        Some(peer_id) => peer_id.to_base58(),
                        None => String::from("anonymous"),
                    };
                    source_string
                        .push_str(&message.sequence_number.unwrap_or_default().to_string());
                    MessageId::from(source_string)
                }),
            },
        }
    }
}

impl ConfigBuilder {
    pub fn history_length(&mut self, history_length: usize) -> &mut Self {
        self.config.history_length = history_length;
        self
    }

    pub fn history_gossip(&mut self, history_gossip: usize) -> &mut Self {
        self.config.history_gossip = history_gossip;
        self
    }

    pub fn mesh_n(&mut self, mesh_n: usize) -> &mut Self {
        self.config.mesh_n = mesh_n;
        self
    }

    pub fn mesh_n_low(&mut self, mesh_n_low: usize) -> &mut Self {
        self.config.mesh_n_low = mesh_n_low;
        self
    }

    pub fn mesh_n_high(&mut self, mesh_n_high: usize) -> &mut Self {
        self.config.mesh_n_high = mesh_n_high;
        self
    }

    pub fn retain_scores(&mut self, retain_scores: usize) -> &mut Self {
        self.config.retain_scores = retain_scores;
        self
    }

    pub fn mesh_outbound_min(&mut self, mesh_outbound_min: usize) -> &mut Self {
        self.config.mesh_outbound_min = mesh_outbound_min;
        self
    }

    pub fn gossip_lazy(&mut self, gossip_lazy: usize) -> &mut Self {
        self.config.gossip_lazy = gossip_lazy;
        self
    }

    pub fn gossip_factor(&mut self, gossip_factor: f64) -> &mut Self {
        self.config.gossip_factor = gossip_factor;
        self
    }

    pub fn heartbeat_initial_delay(&mut self, heartbeat_initial_delay: Duration) -> &mut Self {
        self.config.heartbeat_initial_delay = heartbeat_initial_delay;
        self
    }

    pub fn heartbeat_interval(&mut self, heartbeat_interval: Duration) -> &mut Self {
        self.config.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn fanout_ttl(&mut self, fanout_ttl: Duration) -> &mut Self {
        self.config.fanout_ttl = fanout_ttl;
        self
    }

    pub fn gossip_retransmission(&mut self, gossip_retransmission: u32) -> &mut Self {
        self.config.gossip_retransmission = gossip_retransmission;
        self
    }

    pub fn max_ihave_length(&mut self, max_ihave_length: usize) -> &mut Self {
        self.config.max_ihave_length = max_ihave_length;
        self
    }

    pub fn max_ihave_messages(&mut self, max_ihave_messages: usize) -> &mut Self {
        self.config.max_ihave_messages = max_ihave_messages;
        self
    }

    pub fn prune_backoff(&mut self, prune_backoff: Duration) -> &mut Self {
        self.config.prune_backoff = prune_backoff;
        self
    }

    pub fn unsubscribe_backoff(&mut self, unsubscribe_backoff: Duration) -> &mut Self {
        self.config.unsubscribe_backoff = unsubscribe_backoff;
        self
    }

    pub fn graft_flood_threshold(&mut self, graft_flood_threshold: Duration) -> &mut Self {
        self.config.graft_flood_threshold = graft_flood_threshold;
        self
    }

    pub fn opportunistic_graft_ticks(&mut self, opportunistic_graft_ticks: u64) -> &mut Self {
        self.config.opportunistic_graft_ticks = opportunistic_graft_ticks;
        self
    }

    pub fn opportunistic_graft_peers(&mut self, opportunistic_graft_peers: usize) -> &mut Self {
        self.config.opportunistic_graft_peers = opportunistic_graft_peers;
        self
    }

    pub fn iwant_followup_time(&mut self, iwant_followup_time: Duration) -> &mut Self {
        self.config.iwant_followup_time = iwant_followup_time;
        self
    }

    pub fn flood_publish(&mut self, flood_publish: bool) -> &mut Self {
        self.config.flood_publish = flood_publish;
        self
    }

    pub fn do_px(&mut self, do_px: bool) -> &mut Self {
        self.config.do_px = do_px;
        self
    }

    pub fn prune_peers(&mut self, prune_peers: usize) -> &mut Self {
        self.config.prune_peers = prune_peers;
        self
    }

    pub fn message_id_fn<F>(&mut self, id_fn: F) -> &mut Self
    where
        F: Fn(&RawMessage) -> MessageId + Send + Sync + 'static,
    {
        self.config.message_id_fn = Arc::new(id_fn);
        self
    }

    pub fn build(&self) -> Result<Config, ConfigBuilderError> {
        if self.config.history_length < self.config.history_gossip {
            return Err(ConfigBuilderError::HistoryLengthTooSmall);
        }

        if !(self.config.mesh_n_low <= self.config.mesh_n
            && self.config.mesh_n <= self.config.mesh_n_high)
        {
            return Err(ConfigBuilderError::MeshParametersInvalid);
        }

        if self.config.mesh_outbound_min > self.config.mesh_n / 2 {
            return Err(ConfigBuilderError::MeshOutboundInvalid);
        }

        if self.config.retain_scores > self.config.mesh_n {
            return Err(ConfigBuilderError::RetainScoresInvalid);
        }

        if self.config.unsubscribe_backoff.is_zero() {
            return Err(ConfigBuilderError::UnsubscribeBackoffIsZero);
        }

        Ok(self.config.clone())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Config");
        let _ = builder.field("history_length", &self.history_length);
        let _ = builder.field("history_gossip", &self.history_gossip);
        let _ = builder.field("mesh_n", &self.mesh_n);
        let _ = builder.field("mesh_n_low", &self.mesh_n_low);
        let _ = builder.field("mesh_n_high", &self.mesh_n_high);
        let _ = builder.field("retain_scores", &self.retain_scores);
        let _ = builder.field("mesh_outbound_min", &self.mesh_outbound_min);
        let _ = builder.field("gossip_lazy", &self.gossip_lazy);
        let _ = builder.field("gossip_factor", &self.gossip_factor);
        let _ = builder.field("heartbeat_initial_delay", &self.heartbeat_initial_delay);
        let _ = builder.field("heartbeat_interval", &self.heartbeat_interval);
        let _ = builder.field("fanout_ttl", &self.fanout_ttl);
        let _ = builder.field("gossip_retransmission", &self.gossip_retransmission);
        let _ = builder.field("max_ihave_length", &self.max_ihave_length);
        let _ = builder.field("max_ihave_messages", &self.max_ihave_messages);
        let _ = builder.field("prune_backoff", &self.prune_backoff);
        let _ = builder.field("unsubscribe_backoff", &self.unsubscribe_backoff);
        let _ = builder.field("graft_flood_threshold", &self.graft_flood_threshold);
        let _ = builder.field("opportunistic_graft_ticks", &self.opportunistic_graft_ticks);
        let _ = builder.field("opportunistic_graft_peers", &self.opportunistic_graft_peers);
        let _ = builder.field("iwant_followup_time", &self.iwant_followup_time);
        let _ = builder.field("flood_publish", &self.flood_publish);
        let _ = builder.field("do_px", &self.do_px);
        let _ = builder.field("prune_peers", &self.prune_peers);
        builder.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topic::Topic;

    #[test]
    fn create_config_with_message_id_as_plain_function() {
        let config = ConfigBuilder::default()
            .message_id_fn(|m: &RawMessage| {
                let mut v = m.data.clone();
                v.extend_from_slice(b"RANDOM");
                MessageId::from(v)
            })
            .build()
            .unwrap();

        let message = RawMessage {
            source: None,
            data: vec![1, 2, 3, 4],
            sequence_number: Some(1),
            topics: vec![Topic::new("test").hash()],
            signature: None,
        };

        let expected = {
            let mut v = message.data.clone();
            v.extend_from_slice(b"RANDOM");
            MessageId::from(v)
        };
        assert_eq!(config.message_id(&message), expected);
    }

    #[test]
    fn wrong_mesh_params_are_rejected() {
        assert!(matches!(
            ConfigBuilder::default().mesh_n_low(7).build(),
            Err(ConfigBuilderError::MeshParametersInvalid)
        ));
        assert!(matches!(
            ConfigBuilder::default().mesh_outbound_min(4).build(),
            Err(ConfigBuilderError::MeshOutboundInvalid)
        ));
        assert!(matches!(
            ConfigBuilder::default().retain_scores(7).build(),
            Err(ConfigBuilderError::RetainScoresInvalid)
        ));
    }
}
