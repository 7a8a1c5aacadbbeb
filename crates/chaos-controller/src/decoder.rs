//! Record → (daemon connection, container) decoding

use std::sync::Arc;

use chaos_core::{ChaosError, Result};

use crate::client::{ClientPool, DaemonConnector, FaultDaemon};
use crate::experiment::RecordId;
use crate::inventory::{Target, TargetResolver};

/// Where to send the RPC for a record, and which container it targets
pub struct Decoded {
    pub daemon: Arc<dyn FaultDaemon>,
    pub target: Target,
}

pub struct Decoder {
    resolver: Arc<dyn TargetResolver>,
    pool: ClientPool,
}

impl Decoder {
    pub fn new(resolver: Arc<dyn TargetResolver>, connector: Arc<dyn DaemonConnector>) -> Self {
        Self {
            resolver,
            pool: ClientPool::new(connector),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn TargetResolver> {
        &self.resolver
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Resolve a record's target and the pooled client of its node.
    ///
    /// A target that no longer exists is `TargetGone`; a node without a
    /// known or reachable daemon is `Connection`.
    pub fn decode(&self, id: &RecordId) -> Result<Decoded> {
        let target = self
            .resolver
            .resolve(id)?
            .ok_or_else(|| ChaosError::TargetGone(id.to_string()))?;

        let address = self.resolver.daemon_address(&target.node).ok_or_else(|| {
            ChaosError::Connection(format!("no daemon address for node {}", target.node))
        })?;

        let daemon = self.pool.get_or_connect(&target.node, &address)?;
        Ok(Decoded { daemon, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpConnector;
    use crate::inventory::{ContainerEntry, Inventory, PodEntry};
    use std::time::Duration;

    fn decoder() -> Decoder {
        let mut inventory = Inventory::default();
        inventory
            .nodes
            .insert("node-a".to_string(), "127.0.0.1:31767".to_string());
        for (name, node) in [("p0", "node-a"), ("p1", "node-a"), ("p2", "node-x")] {
            inventory.pods.push(PodEntry {
                namespace: "web".to_string(),
                name: name.to_string(),
                node: node.to_string(),
                containers: vec![ContainerEntry {
                    name: "app".to_string(),
                    id: format!("containerd://{}", name),
                }],
            });
        }

        Decoder::new(
            Arc::new(inventory),
            Arc::new(HttpConnector::new(Duration::from_secs(1))),
        )
    }

    #[test]
    fn test_decode_shares_client_per_node() {
        let decoder = decoder();
        let a = decoder.decode(&RecordId::new("web", "p0", "app")).unwrap();
        let b = decoder.decode(&RecordId::new("web", "p1", "app")).unwrap();

        assert!(Arc::ptr_eq(&a.daemon, &b.daemon));
        assert_eq!(b.target.container_id.to_string(), "containerd://p1");
        assert_eq!(decoder.pool().len(), 1);
    }

    #[test]
    fn test_decode_missing_pod_is_target_gone() {
        let err = decoder()
            .decode(&RecordId::new("web", "deleted", "app"))
            .err()
            .unwrap();
        assert!(err.is_target_gone());
    }

    #[test]
    fn test_decode_unknown_node_is_connection_error() {
        let err = decoder()
            .decode(&RecordId::new("web", "p2", "app"))
            .err()
            .unwrap();
        assert!(matches!(err, ChaosError::Connection(_)));
    }
}
