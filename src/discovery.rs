//! Node discovery over the presence substrate
//!
//! Alive nodes live in the cluster-wide `colyseus:nodes` set; membership
//! changes are announced on the `colyseus:nodes:discovery` channel so
//! external proxies can react without polling, then snapshot the set.

use crate::error::Result;
use crate::presence::Presence;
use crate::types::Node;
use std::sync::Arc;
use tracing::info;

/// Cluster-wide set of alive nodes.
pub const NODES_SET: &str = "colyseus:nodes";

/// Broadcast channel announcing node additions and removals.
pub const DISCOVERY_CHANNEL: &str = "colyseus:nodes:discovery";

/// Advertise `node` to the cluster.
pub async fn register_node(presence: &Arc<dyn Presence>, node: &Node) -> Result<()> {
    let address = node.external_address();
    presence.sadd(NODES_SET, &address).await?;
    presence
        .publish(DISCOVERY_CHANNEL, &format!("add,{}", address))
        .await?;
    info!(node = %address, "node registered");
    Ok(())
}

/// Withdraw `node` from the cluster.
pub async fn unregister_node(presence: &Arc<dyn Presence>, node: &Node) -> Result<()> {
    let address = node.external_address();
    presence.srem(NODES_SET, &address).await?;
    presence
        .publish(DISCOVERY_CHANNEL, &format!("remove,{}", address))
        .await?;
    info!(node = %address, "node unregistered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::LocalPresence;

    #[tokio::test]
    async fn test_register_and_unregister_node() {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let mut updates = presence.subscribe(DISCOVERY_CHANNEL).await.unwrap();
        let node = Node::new("p1", "10.0.0.4", 2567);

        register_node(&presence, &node).await.unwrap();
        assert_eq!(
            presence.smembers(NODES_SET).await.unwrap(),
            vec!["p1/10.0.0.4:2567"]
        );
        assert_eq!(updates.recv().await.unwrap(), "add,p1/10.0.0.4:2567");

        unregister_node(&presence, &node).await.unwrap();
        assert!(presence.smembers(NODES_SET).await.unwrap().is_empty());
        assert_eq!(updates.recv().await.unwrap(), "remove,p1/10.0.0.4:2567");
    }
}
