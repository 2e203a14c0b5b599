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

//! A collection of types used by the meshsub router.

use libp2p_identity::PeerId;

use crate::TopicHash;

/// A message id, as decided by the injected message id function.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Vec<u8>);

impl MessageId {
    pub fn new(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl<T: Into<Vec<u8>>> From<T> for MessageId {
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex_fmt::HexFmt(&self.0))
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex_fmt::HexFmt(&self.0))
    }
}

/// A decoded message as it is passed between the wire codec and the router.
///
/// The router treats the content as opaque; only the id (via the configured
/// message id function) and the topic list are inspected.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RawMessage {
    /// Id of the peer that published this message.
    pub source: Option<PeerId>,

    /// Content of the message. Its meaning is out of scope of this library.
    pub data: Vec<u8>,

    /// A sequence number chosen by the publisher.
    pub sequence_number: Option<u64>,

    /// The topics this message was published to.
    pub topics: Vec<TopicHash>,

    /// The signature of the message if it's signed. Carried opaquely.
    pub signature: Option<Vec<u8>>,
}

/// Describes the types of peers that can exist in the meshsub context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// A gossipsub 1.1 peer.
    Gossipsubv1_1,
    /// A gossipsub 1.0 peer.
    Gossipsub,
}

impl PeerKind {
    /// Whether the peer speaks a protocol version with backoff and peer
    /// exchange on PRUNE.
    pub(crate) fn supports_px(&self) -> bool {
        matches!(self, PeerKind::Gossipsubv1_1)
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Gossipsubv1_1 => "/meshsub/1.1.0",
            Self::Gossipsub => "/meshsub/1.0.0",
        };
        f.write_str(s)
    }
}

/// Attributes of a connected peer, registered on activation and held for the
/// lifetime of the connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerHandler {
    /// The kind of protocol the peer negotiated.
    pub(crate) kind: PeerKind,
    /// Whether the local node initiated the connection.
    pub(crate) outbound: bool,
}

/// A peer candidate carried in the PRUNE peer exchange list.
///
/// The signed peer record is forwarded opaquely; the router never validates
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Option<PeerId>,
    pub signed_peer_record: Option<Vec<u8>>,
}

/// A GRAFT control message: the sender wants to be added to our mesh for the
/// topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Graft {
    pub topic_hash: TopicHash,
}

/// A PRUNE control message: the sender removed us from its mesh for the
/// topic. The backoff and peer list are only populated by v1.1 peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prune {
    pub topic_hash: TopicHash,
    /// Candidate peers for re-meshing (peer exchange).
    pub peers: Vec<PeerInfo>,
    /// Backoff duration in seconds before we may regraft.
    pub backoff: Option<u64>,
}

/// An IHAVE control message: ids of messages the sender holds for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IHave {
    pub topic_hash: TopicHash,
    pub message_ids: Vec<MessageId>,
}

/// An IWANT control message: ids the sender would like the full message for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IWant {
    pub message_ids: Vec<MessageId>,
}

/// A control message received from a remote, already decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Graft(Graft),
    Prune(Prune),
    IHave(IHave),
    IWant(IWant),
}

/// A decoded RPC received from a remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcIn {
    /// Full messages carried by this RPC.
    pub messages: Vec<RawMessage>,
    /// Control messages carried by this RPC.
    pub control: Vec<ControlAction>,
}

/// An outbound RPC part queued for a peer, flushed in batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOut {
    /// Publish a message to the network.
    Publish(RawMessage),
    /// Forward a received message.
    Forward(RawMessage),
    /// Graft a mesh link for a topic.
    Graft(Graft),
    /// Prune a mesh link for a topic.
    Prune(Prune),
    /// Advertise held message ids for a topic.
    IHave(IHave),
    /// Request full messages by id.
    IWant(IWant),
}
