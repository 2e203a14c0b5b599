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

//! Tests for heartbeat-driven mesh maintenance.

use std::{collections::HashSet, time::Duration};

use libp2p_identity::PeerId;

use super::{add_peer, count_sent, disconnect_peer, flush_sent, RouterTestBuilder};
use crate::{
    config::ConfigBuilder,
    score::{PeerScore, ScoreThresholds},
    types::{Graft, PeerKind, RpcOut},
};

/// tests that the heartbeat grafts peers when the mesh drops below the lower
/// bound
#[test]
fn test_heartbeat_mesh_addition() {
    let (mut gs, _, topic_hashes) = RouterTestBuilder::default()
        .peer_no(20)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    let mesh_n = gs.config.mesh_n();
    assert_eq!(gs.mesh.get(&topic_hashes[0]).unwrap().len(), mesh_n);

    // drop below the lower bound
    let to_drop: Vec<PeerId> = gs
        .mesh
        .get(&topic_hashes[0])
        .unwrap()
        .iter()
        .take(3)
        .copied()
        .collect();
    for peer_id in to_drop {
        gs.mesh.get_mut(&topic_hashes[0]).unwrap().remove(&peer_id);
    }
    flush_sent(&mut gs);

    gs.heartbeat();

    assert_eq!(
        gs.mesh.get(&topic_hashes[0]).unwrap().len(),
        mesh_n,
        "Expected the mesh to be filled back to mesh_n"
    );
    assert_eq!(
        count_sent(&gs, |_, rpc| matches!(rpc, RpcOut::Graft(Graft { topic_hash }) if topic_hash == &topic_hashes[0])),
        3,
        "Expected a GRAFT for each added peer"
    );
}

/// tests that an overfull mesh is rebalanced to mesh_n, keeping the top
/// scorers and enough outbound peers
#[test]
fn test_heartbeat_mesh_subtraction() {
    let config = ConfigBuilder::default().build().unwrap();
    // 14 peers in the mesh, 3 of them outbound
    let n = config.mesh_n_high() + 2;
    let (mut gs, peers, topic_hashes) = RouterTestBuilder::default()
        .peer_no(n)
        .outbound(3)
        .topics(vec![String::from("topic1")])
        .to_subscribe(false)
        .gs_config(config)
        .create_network();

    gs.mesh
        .insert(topic_hashes[0].clone(), peers.iter().copied().collect());
    // ascending scores, the best peers are at the end
    for (i, peer_id) in peers.iter().enumerate() {
        gs.scorer.set_score(peer_id, i as f64);
    }

    gs.heartbeat();

    let mesh: HashSet<PeerId> = gs.mesh.get(&topic_hashes[0]).unwrap().iter().copied().collect();
    assert_eq!(mesh.len(), gs.config.mesh_n(), "Expected the mesh to shrink to mesh_n");

    // the retain_scores best peers survive the rebalance
    let top: Vec<PeerId> = peers[peers.len() - gs.config.retain_scores()..].to_vec();
    for peer_id in &top {
        assert!(mesh.contains(peer_id), "Expected a top-scored peer to be retained");
    }

    // enough outbound peers survive (the first 3 created peers are outbound)
    let outbound_in_mesh = peers[..3].iter().filter(|p| mesh.contains(p)).count();
    assert!(
        outbound_in_mesh >= gs.config.mesh_outbound_min(),
        "Expected at least mesh_outbound_min outbound peers to be retained"
    );
}

/// tests that mesh peers with negative score are pruned on the heartbeat,
/// without peer exchange
#[test]
fn test_heartbeat_prunes_negative_scored_peers() {
    let (mut gs, _, topic_hashes) = RouterTestBuilder::default()
        .peer_no(20)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    let bad_peer = *gs.mesh.get(&topic_hashes[0]).unwrap().iter().next().unwrap();
    gs.scorer.set_score(&bad_peer, -5.0);
    flush_sent(&mut gs);

    gs.heartbeat();

    assert!(
        !gs.mesh.get(&topic_hashes[0]).unwrap().contains(&bad_peer),
        "Expected negative scored peer to be pruned"
    );
    let prunes: Vec<_> = gs
        .host
        .sent
        .iter()
        .filter_map(|(p, rpc)| match rpc {
            RpcOut::Prune(prune) if p == &bad_peer => Some(prune.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(prunes.len(), 1);
    assert!(
        prunes[0].peers.is_empty(),
        "Expected no PX towards a negative scored peer"
    );
    // invariant: every remaining mesh peer has non-negative score
    for peer_id in gs.mesh.get(&topic_hashes[0]).unwrap() {
        assert!(gs.scorer.score(peer_id) >= 0.0);
    }
}

/// tests that peers under backoff are not grafted by the heartbeat
#[test]
fn test_heartbeat_does_not_graft_backoffed_peers() {
    let (mut gs, peers, topic_hashes) = RouterTestBuilder::default()
        .peer_no(8)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    // back off everyone and empty the mesh
    for peer_id in &peers {
        gs.backoffs
            .update_backoff(&topic_hashes[0], peer_id, Duration::from_secs(60));
    }
    gs.mesh.get_mut(&topic_hashes[0]).unwrap().clear();

    gs.heartbeat();

    assert!(
        gs.mesh.get(&topic_hashes[0]).unwrap().is_empty(),
        "Expected no backoffed peer to be grafted"
    );
}

/// tests that the heartbeat grafts additional outbound peers when the mesh
/// holds fewer than mesh_outbound_min of them
#[test]
fn test_heartbeat_outbound_topup() {
    let (mut gs, _, topic_hashes) = RouterTestBuilder::default()
        .peer_no(20)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    // all mesh peers are inbound; add outbound candidates
    let outbound: Vec<PeerId> = (0..3)
        .map(|_| add_peer(&mut gs, &topic_hashes, true, PeerKind::Gossipsubv1_1))
        .collect();

    gs.heartbeat();

    let mesh = gs.mesh.get(&topic_hashes[0]).unwrap();
    let outbound_in_mesh = outbound.iter().filter(|p| mesh.contains(p)).count();
    assert_eq!(
        outbound_in_mesh,
        gs.config.mesh_outbound_min(),
        "Expected the outbound deficit to be topped up"
    );
}

/// tests opportunistic grafting of better scored peers into a mediocre mesh
#[test]
fn test_heartbeat_opportunistic_grafting() {
    let config = ConfigBuilder::default()
        .opportunistic_graft_ticks(1)
        .build()
        .unwrap();
    let thresholds = ScoreThresholds {
        opportunistic_graft_threshold: 5.0,
        ..Default::default()
    };
    let (mut gs, peers, topic_hashes) = RouterTestBuilder::default()
        .peer_no(10)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .gs_config(config)
        .thresholds(thresholds)
        .create_network();

    // mesh peers score 0 (median below the threshold); outsiders score high
    let mesh: HashSet<PeerId> = gs.mesh.get(&topic_hashes[0]).unwrap().iter().copied().collect();
    let outsiders: Vec<PeerId> = peers.iter().filter(|p| !mesh.contains(p)).copied().collect();
    for peer_id in &outsiders {
        gs.scorer.set_score(peer_id, 10.0);
    }

    gs.heartbeat();

    let new_mesh = gs.mesh.get(&topic_hashes[0]).unwrap();
    let grafted_outsiders = outsiders.iter().filter(|p| new_mesh.contains(p)).count();
    assert_eq!(
        grafted_outsiders,
        gs.config.opportunistic_graft_peers(),
        "Expected opportunistic grafting of better scored peers"
    );
}

/// tests that opportunistic grafting leaves a healthy mesh alone
#[test]
fn test_no_opportunistic_grafting_above_threshold() {
    let config = ConfigBuilder::default()
        .opportunistic_graft_ticks(1)
        .build()
        .unwrap();
    let thresholds = ScoreThresholds {
        opportunistic_graft_threshold: 5.0,
        ..Default::default()
    };
    let (mut gs, peers, topic_hashes) = RouterTestBuilder::default()
        .peer_no(10)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .gs_config(config)
        .thresholds(thresholds)
        .create_network();

    for peer_id in &peers {
        gs.scorer.set_score(peer_id, 20.0);
    }
    let before = gs.mesh.get(&topic_hashes[0]).unwrap().len();

    gs.heartbeat();

    assert_eq!(gs.mesh.get(&topic_hashes[0]).unwrap().len(), before);
}

/// tests that the mesh never exceeds mesh_n_high after a heartbeat
#[test]
fn test_mesh_bounded_after_heartbeat() {
    let (mut gs, _, topic_hashes) = RouterTestBuilder::default()
        .peer_no(30)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    // grafts from many peers can transiently exceed the bound
    let extra: Vec<PeerId> = (0..25)
        .map(|_| add_peer(&mut gs, &topic_hashes, true, PeerKind::Gossipsubv1_1))
        .collect();
    gs.handle_graft(&extra[0], topic_hashes.clone());
    gs.mesh
        .get_mut(&topic_hashes[0])
        .unwrap()
        .extend(extra.iter().copied());
    assert!(gs.mesh.get(&topic_hashes[0]).unwrap().len() > gs.config.mesh_n_high());

    gs.heartbeat();

    assert!(gs.mesh.get(&topic_hashes[0]).unwrap().len() <= gs.config.mesh_n_high());
}

/// tests that a disconnected peer is removed from meshes and its queued
/// parts are dropped
#[test]
fn test_disconnect_removes_peer_state() {
    let (mut gs, _, topic_hashes) = RouterTestBuilder::default()
        .peer_no(20)
        .topics(vec![String::from("topic1")])
        .to_subscribe(true)
        .create_network();

    let peer_id = *gs.mesh.get(&topic_hashes[0]).unwrap().iter().next().unwrap();

    // leave a part queued for the peer without flushing
    gs.queue_rpc(
        peer_id,
        RpcOut::Graft(Graft {
            topic_hash: topic_hashes[0].clone(),
        }),
    );
    assert!(gs.pending_rpc.contains_key(&peer_id));

    disconnect_peer(&mut gs, &peer_id);

    assert!(!gs.mesh.get(&topic_hashes[0]).unwrap().contains(&peer_id));
    assert!(
        !gs.pending_rpc.contains_key(&peer_id),
        "Expected queued parts for the peer to be dropped"
    );
    assert!(!gs.connected_peers.contains_key(&peer_id));
}
