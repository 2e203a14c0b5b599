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

//! Error types that can result from meshsub routing.

/// Error associated with publishing a message.
#[derive(Debug)]
pub enum PublishError {
    /// There were no peers to send this message to.
    InsufficientPeers,
    /// Messages could not be sent because the queues for all peers were full.
    /// The usize represents the number of peers that were attempted.
    AllQueuesFull(usize),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for PublishError {}

/// Error returned by the host when an outbound RPC batch cannot be accepted.
///
/// The router never retries a failed batch; broadcasts succeed as long as any
/// recipient accepted its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The peer's outbound queue is full.
    QueueFull,
    /// The peer is no longer reachable.
    Disconnected,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

/// Error associated with [`ConfigBuilder::build`](crate::ConfigBuilder::build).
#[derive(Debug)]
pub enum ConfigBuilderError {
    /// History length less than history gossip length.
    HistoryLengthTooSmall,
    /// The inequality doesn't hold mesh_n_low <= mesh_n <= mesh_n_high.
    MeshParametersInvalid,
    /// The inequality doesn't hold mesh_outbound_min <= mesh_n / 2.
    MeshOutboundInvalid,
    /// The inequality doesn't hold retain_scores <= mesh_n.
    RetainScoresInvalid,
    /// unsubscribe_backoff is zero.
    UnsubscribeBackoffIsZero,
}

impl std::error::Error for ConfigBuilderError {}

impl std::fmt::Display for ConfigBuilderError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::HistoryLengthTooSmall => {
                write!(f, "History length less than history gossip length")
            }
            Self::MeshParametersInvalid => write!(
                f,
                "The inequality doesn't hold mesh_n_low <= mesh_n <= mesh_n_high"
            ),
            Self::MeshOutboundInvalid => write!(
                f,
                "The inequality doesn't hold mesh_outbound_min <= mesh_n / 2"
            ),
            Self::RetainScoresInvalid => {
                write!(f, "The inequality doesn't hold retain_scores <= mesh_n")
            }
            Self::UnsubscribeBackoffIsZero => write!(f, "unsubscribe_backoff is zero"),
        }
    }
}
