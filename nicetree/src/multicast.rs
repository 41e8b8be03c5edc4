//! Application-level multicast over the cluster hierarchy.
//!
//! Data flows along cluster edges: every node hands a message to all the
//! clusters it belongs to, except the one it arrived from. Leaders bridge
//! layers, so a message reaches the whole group in O(log N) hops.

use tracing::{debug, trace};

use crate::config::NiceConfig;
use crate::node::Node;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{Multicast, Payload, MAX_LAYERS, MULTICAST_HOP_LIMIT};
use crate::wire::Message;

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    pub(crate) fn originate_multicast(&mut self, payload: Payload) {
        let me = self.node_id;
        debug!(node = %me, len = payload.len(), "multicasting");
        self.send_data_to_overlay(Multicast {
            src: me,
            last_hop: me,
            hop_count: 0,
            layer: None,
            payload,
        });
    }

    /// Forward `msg` into every cluster this node belongs to except the one
    /// it arrived on, and to any temporarily attached newcomers.
    pub(crate) fn send_data_to_overlay(&mut self, msg: Multicast) {
        let me = self.node_id;
        let originated = msg.src == me;

        let mut targets = Vec::new();
        for layer in 0..MAX_LAYERS {
            let cluster = &self.clusters[layer];
            if !cluster.contains(&me) || msg.layer == Some(layer as u8) {
                continue;
            }
            // The last hop already covered its own clusters
            if !originated && cluster.contains(&msg.last_hop) {
                continue;
            }
            targets.extend(
                cluster
                    .iter()
                    .filter(|m| **m != me)
                    .map(|m| (*m, Some(layer as u8))),
            );
        }

        let mut temp: Vec<_> = self
            .temp_peers
            .keys()
            .filter(|p| **p != msg.last_hop && **p != msg.src)
            .map(|p| (*p, msg.layer))
            .collect();
        temp.sort();
        targets.extend(temp);

        for (to, layer) in targets {
            trace!(node = %me, %to, layer = ?layer, "multicast hop");
            self.send(
                to,
                Message::Multicast(Multicast {
                    src: msg.src,
                    last_hop: me,
                    hop_count: msg.hop_count,
                    layer,
                    payload: msg.payload.clone(),
                }),
            );
        }
    }

    pub(crate) fn handle_multicast(&mut self, msg: Multicast) {
        if msg.src == self.node_id {
            self.metrics.multicast_own_echo += 1;
            return;
        }

        let hop_count = msg.hop_count.saturating_add(1);
        if hop_count >= MULTICAST_HOP_LIMIT {
            debug!(node = %self.node_id, src = %msg.src, hop_count, "multicast hop limit reached");
            return;
        }

        let origin = msg.src;
        let payload = msg.payload.clone();
        self.metrics.multicast_forwarded += 1;
        self.send_data_to_overlay(Multicast { hop_count, ..msg });

        self.metrics.multicast_delivered += 1;
        self.push_incoming_data(origin, payload);
    }
}
