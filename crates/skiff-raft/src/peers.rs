//! Peer-set persistence and the canonical peer-set encoding carried by
//! membership-change log entries and snapshot metadata.

use crate::error::Result;
use crate::transport::Transport;
use crate::types::NodeId;
use bytes::Bytes;
use parking_lot::RwLock;

/// Persists the current peer set across restarts.
pub trait PeerStore: Send + Sync + 'static {
    fn peers(&self) -> Result<Vec<NodeId>>;

    fn set_peers(&self, peers: &[NodeId]) -> Result<()>;
}

/// In-memory [`PeerStore`], seeded with a static initial peer set.
#[derive(Default)]
pub struct MemPeerStore {
    peers: RwLock<Vec<NodeId>>,
}

impl MemPeerStore {
    pub fn new(initial: Vec<NodeId>) -> Self {
        Self {
            peers: RwLock::new(initial),
        }
    }
}

impl PeerStore for MemPeerStore {
    fn peers(&self) -> Result<Vec<NodeId>> {
        Ok(self.peers.read().clone())
    }

    fn set_peers(&self, peers: &[NodeId]) -> Result<()> {
        *self.peers.write() = peers.to_vec();
        Ok(())
    }
}

/// Encode a peer set through the transport's address encoding.
///
/// The result is the canonical payload of AddPeer/RemovePeer entries and
/// the `peers` field of snapshots and vote responses. Decoding preserves
/// order, so replaying a membership entry reconstructs the same set.
pub(crate) fn encode_peers(peers: &[NodeId], trans: &dyn Transport) -> Result<Bytes> {
    let encoded: Vec<Vec<u8>> = peers
        .iter()
        .map(|p| trans.encode_peer(p).to_vec())
        .collect();
    Ok(Bytes::from(bincode::serialize(&encoded)?))
}

pub(crate) fn decode_peers(data: &[u8], trans: &dyn Transport) -> Result<Vec<NodeId>> {
    let encoded: Vec<Vec<u8>> = bincode::deserialize(data)?;
    Ok(encoded.iter().map(|p| trans.decode_peer(p)).collect())
}

pub(crate) fn peer_contained(peers: &[NodeId], peer: &NodeId) -> bool {
    peers.iter().any(|p| p == peer)
}

pub(crate) fn exclude_peer(peers: &[NodeId], peer: &NodeId) -> Vec<NodeId> {
    peers.iter().filter(|p| *p != peer).cloned().collect()
}
