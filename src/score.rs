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

//! The scoring capability consumed by the router.
//!
//! The numeric model behind peer scores is a separate subsystem; the router
//! only queries the current score and reports routing events. A scoring
//! engine implements [`PeerScore`]; [`NullScore`] disables scoring entirely.

use libp2p_identity::PeerId;

use crate::{MessageId, TopicHash};

/// The thresholds the router compares peer scores against.
#[derive(Debug, Clone)]
pub struct ScoreThresholds {
    /// The score threshold below which gossip propagation is suppressed;
    /// should be negative.
    pub gossip_threshold: f64,
    /// The score threshold below which we shouldn't publish when using flood
    /// publishing (also applies to fanout peers); should be negative and
    /// <= `gossip_threshold`.
    pub publish_threshold: f64,
    /// The score threshold below which message processing is suppressed
    /// altogether, implementing an effective graylist according to peer
    /// score; should be negative, and <= `publish_threshold`.
    pub graylist_threshold: f64,
    /// The score threshold below which PX will be ignored; this should be
    /// positive and limited to scores attainable by bootstrappers and other
    /// trusted nodes.
    pub accept_px_threshold: f64,
    /// The median mesh score threshold before triggering opportunistic
    /// grafting; this should have a small positive value.
    pub opportunistic_graft_threshold: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        ScoreThresholds {
            gossip_threshold: -10.0,
            publish_threshold: -50.0,
            graylist_threshold: -80.0,
            accept_px_threshold: 10.0,
            opportunistic_graft_threshold: 20.0,
        }
    }
}

/// The router's view of the scoring engine.
///
/// Routing decisions call [`score`](PeerScore::score); everything else is a
/// notification the engine folds into its own bookkeeping.
pub trait PeerScore {
    /// The current score of a peer. Unknown peers score `0.0`.
    fn score(&self, peer_id: &PeerId) -> f64;

    /// The peer misbehaved at the protocol level (backoff violation, IHAVE
    /// flood, broken IWANT promise, invalid field combination).
    fn add_penalty(&mut self, peer_id: &PeerId, count: usize);

    /// The peer was added to the mesh for a topic.
    fn graft(&mut self, peer_id: &PeerId, topic: TopicHash);

    /// The peer was removed from the mesh for a topic.
    fn prune(&mut self, peer_id: &PeerId, topic: TopicHash);

    /// The peer delivered a first-seen message.
    fn deliver_message(&mut self, peer_id: &PeerId, message_id: &MessageId, topic: &TopicHash);

    /// A connection to the peer was established.
    fn connected(&mut self, peer_id: &PeerId);

    /// The last connection to the peer closed.
    fn disconnected(&mut self, peer_id: &PeerId);
}

/// A scoring engine that scores every peer `0.0` and drops all events.
///
/// With [`NullScore`] every peer passes the (negative) gossip, publish and
/// graylist thresholds and no peer passes `accept_px_threshold`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScore;

impl PeerScore for NullScore {
    fn score(&self, _peer_id: &PeerId) -> f64 {
        0.0
    }

    fn add_penalty(&mut self, _peer_id: &PeerId, _count: usize) {}

    fn graft(&mut self, _peer_id: &PeerId, _topic: TopicHash) {}

    fn prune(&mut self, _peer_id: &PeerId, _topic: TopicHash) {}

    fn deliver_message(
        &mut self,
        _peer_id: &PeerId,
        _message_id: &MessageId,
        _topic: &TopicHash,
    ) {
    }

    fn connected(&mut self, _peer_id: &PeerId) {}

    fn disconnected(&mut self, _peer_id: &PeerId) {}
}
