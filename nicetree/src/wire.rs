//! Wire format for protocol messages.
//!
//! Every protocol message is one variant of [`Message`]. Datagrams are the
//! bincode encoding of that enum, so the variant tag doubles as the command
//! code and handlers receive fully typed payloads.

use serde::{Deserialize, Serialize};

use crate::types::{
    ClusterMergeRequest, Control, Heartbeat, LeaderHeartbeat, LeaderTransfer, Multicast, NodeId,
    QueryResponse, MAX_LAYERS,
};

/// Encoding and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// All protocol messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Query(Control),
    QueryResponse(QueryResponse),
    JoinCluster(Control),
    PollRp(Control),
    PollRpResponse(Control),
    Heartbeat(Heartbeat),
    LeaderHeartbeat(LeaderHeartbeat),
    LeaderTransfer(LeaderTransfer),
    JoinEval(Control),
    JoinEvalResponse(Control),
    Remove(Control),
    PeerTemporary(Control),
    PeerTemporaryRelease(Control),
    PingProbe(Control),
    PingProbeResponse(Control),
    ClusterMergeRequest(ClusterMergeRequest),
    ForceMerge(Control),
    Multicast(Multicast),
}

impl Message {
    /// The originating node.
    pub fn src(&self) -> NodeId {
        match self {
            Message::Query(m)
            | Message::JoinCluster(m)
            | Message::PollRp(m)
            | Message::PollRpResponse(m)
            | Message::JoinEval(m)
            | Message::JoinEvalResponse(m)
            | Message::Remove(m)
            | Message::PeerTemporary(m)
            | Message::PeerTemporaryRelease(m)
            | Message::PingProbe(m)
            | Message::PingProbeResponse(m)
            | Message::ForceMerge(m) => m.src,
            Message::QueryResponse(m) => m.src,
            Message::Heartbeat(m) => m.src,
            Message::LeaderHeartbeat(m) => m.src,
            Message::LeaderTransfer(m) => m.src,
            Message::ClusterMergeRequest(m) => m.src,
            Message::Multicast(m) => m.src,
        }
    }

    /// The layer the message refers to, if any.
    pub fn layer(&self) -> Option<u8> {
        match self {
            Message::Query(m)
            | Message::JoinCluster(m)
            | Message::PollRp(m)
            | Message::PollRpResponse(m)
            | Message::JoinEval(m)
            | Message::JoinEvalResponse(m)
            | Message::Remove(m)
            | Message::PeerTemporary(m)
            | Message::PeerTemporaryRelease(m)
            | Message::PingProbe(m)
            | Message::PingProbeResponse(m)
            | Message::ForceMerge(m) => m.layer,
            Message::QueryResponse(m) => Some(m.layer),
            Message::Heartbeat(m) => Some(m.layer),
            Message::LeaderHeartbeat(m) => Some(m.layer),
            Message::LeaderTransfer(m) => Some(m.layer),
            Message::ClusterMergeRequest(m) => Some(m.layer),
            Message::Multicast(m) => m.layer,
        }
    }

    /// Messages referring to a layer at or beyond `MAX_LAYERS` are dropped.
    pub fn has_valid_layer(&self) -> bool {
        self.layer().map_or(true, |l| (l as usize) < MAX_LAYERS)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Query(_) => "QUERY",
            Message::QueryResponse(_) => "QUERY_RESPONSE",
            Message::JoinCluster(_) => "JOIN_CLUSTER",
            Message::PollRp(_) => "POLL_RP",
            Message::PollRpResponse(_) => "POLL_RP_RESPONSE",
            Message::Heartbeat(_) => "HEARTBEAT",
            Message::LeaderHeartbeat(_) => "LEADERHEARTBEAT",
            Message::LeaderTransfer(_) => "LEADERTRANSFER",
            Message::JoinEval(_) => "JOINEVAL",
            Message::JoinEvalResponse(_) => "JOINEVAL_RESPONSE",
            Message::Remove(_) => "REMOVE",
            Message::PeerTemporary(_) => "PEER_TEMPORARY",
            Message::PeerTemporaryRelease(_) => "PEER_TEMPORARY_RELEASE",
            Message::PingProbe(_) => "PING_PROBE",
            Message::PingProbeResponse(_) => "PING_PROBE_RESPONSE",
            Message::ClusterMergeRequest(_) => "CLUSTER_MERGE_REQUEST",
            Message::ForceMerge(_) => "FORCE_MERGE",
            Message::Multicast(_) => "MULTICAST",
        }
    }
}

/// Types that can be encoded to a datagram.
pub trait Encode {
    fn encode_to_vec(&self) -> Result<Vec<u8>, WireError>;
}

/// Types that can be decoded from a datagram.
pub trait Decode: Sized {
    fn decode_from_slice(data: &[u8]) -> Result<Self, WireError>;
}

impl Encode for Message {
    fn encode_to_vec(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(WireError::Encode)
    }
}

impl Decode for Message {
    fn decode_from_slice(data: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(data).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;
    use crate::types::HeartbeatStamp;

    fn node(n: u32) -> NodeId {
        NodeId::from_ipv4(n, 1024)
    }

    #[test]
    fn test_leader_heartbeat_roundtrip() {
        let msg = Message::LeaderHeartbeat(LeaderHeartbeat {
            src: node(1),
            layer: 2,
            stamp: HeartbeatStamp {
                seq_no: 7,
                seq_rsp_no: 6,
                hb_delay: Duration::from_millis(12),
            },
            members: vec![node(1), node(2), node(3)],
            distances: vec![Some(0.0), Some(14.5), None],
            supercluster_leader: Some(node(9)),
            supercluster_members: vec![node(1), node(9)],
        });

        let encoded = msg.encode_to_vec().unwrap();
        let decoded = Message::decode_from_slice(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let msg = Message::Query(Control::new(node(1), None));
        let encoded = msg.encode_to_vec().unwrap();
        assert!(Message::decode_from_slice(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode_from_slice(&[]).is_err());
    }

    #[test]
    fn test_src_and_layer_accessors() {
        let msg = Message::ClusterMergeRequest(ClusterMergeRequest {
            src: node(4),
            layer: 1,
            members: vec![node(4), node(5)],
            new_cluster_leader: None,
        });
        assert_eq!(msg.src(), node(4));
        assert_eq!(msg.layer(), Some(1));
        assert_eq!(msg.kind(), "CLUSTER_MERGE_REQUEST");

        let query = Message::Query(Control::new(node(3), None));
        assert_eq!(query.layer(), None);
    }

    #[test]
    fn test_layer_validation() {
        let ok = Message::JoinCluster(Control::new(node(1), Some(MAX_LAYERS - 1)));
        let bad = Message::JoinCluster(Control::new(node(1), Some(MAX_LAYERS)));
        assert!(ok.has_valid_layer());
        assert!(!bad.has_valid_layer());
        assert!(Message::Query(Control::new(node(1), None)).has_valid_layer());
    }
}
