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

//! The routing core of the gossipsub v1.0/v1.1 family of pubsub protocols,
//! decoupled from transport, framing and message validation. For protocol
//! details, see the [gossipsub
//! spec](https://github.com/libp2p/specs/tree/master/pubsub/gossipsub).
//!
//! For each subscribed topic the [`Router`] maintains a *mesh* of peers that
//! receive full messages, grown and shrunk with GRAFT/PRUNE control messages
//! toward a target degree. Peers outside the mesh receive lazy IHAVE
//! announcements of recent message ids and pull missing messages with IWANT.
//! Topics the node publishes to without subscribing are served by *fanout*
//! sets that expire when publishing stops. A periodic heartbeat rebalances
//! meshes, rotates the message cache, expires fanout, penalizes unanswered
//! IWANT requests and emits gossip.
//!
//! The router operates on decoded values and reaches the outside world only
//! through the injected [`Host`] (subscription bookkeeping, the
//! seen-messages set, the transport, the dialer) and [`PeerScore`] (scoring
//! engine) capabilities.
//!
//! # Concurrency model
//!
//! Every entry point takes `&mut self`, runs to completion and flushes
//! queued outbound RPC parts before returning; drive the router from a
//! single task and call [`Router::poll`] to keep the heartbeat running.
//! Within one peer outbound parts are delivered in enqueue order, between
//! peers no order is guaranteed. On disconnect, parts still queued for the
//! peer are dropped.
//!
//! All tables fed by remote input are LRU-bounded; an evicted entry is
//! indistinguishable from an expired one.

mod backoff;
mod config;
mod error;
mod gossip_promises;
mod interval;
mod mcache;
mod router;
mod score;
mod topic;
mod trackers;
mod types;

pub use crate::{
    config::{Config, ConfigBuilder, MessageIdFn},
    error::{ConfigBuilderError, PublishError, SendError},
    router::{Host, Router},
    score::{NullScore, PeerScore, ScoreThresholds},
    topic::{Topic, TopicHash},
    types::{
        ControlAction, Graft, IHave, IWant, MessageId, PeerInfo, PeerKind, Prune, RawMessage,
        RpcIn, RpcOut,
    },
};
