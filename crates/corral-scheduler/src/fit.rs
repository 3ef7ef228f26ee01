//! Capacity and port-conflict checks for first-fit placement.
//!
//! Usage is recomputed from the container set on every call; nothing
//! here caches derived state.

use corral_store::{Container, Node, NodeUsage};
use tracing::debug;

/// Whether `container` fits on a node with the given usage: every
/// dimension's remaining capacity must cover the container's limit.
pub fn fits(node: &Node, usage: &NodeUsage, container: &Container) -> bool {
    node.cpu_limit.saturating_sub(usage.cpu) >= container.cpu_limit
        && node.memory_limit.saturating_sub(usage.memory) >= container.memory_limit
        && node.storage_limit.saturating_sub(usage.storage) >= container.storage_limit
}

/// First host port of `container` that collides with an already-claimed
/// port, if any.
pub fn port_conflict(claimed: &[u16], container: &Container) -> Option<u16> {
    container
        .ports
        .iter()
        .map(|p| p.host_port)
        .find(|port| claimed.contains(port))
}

/// First-fit node selection: scan nodes in listing order and return the
/// first that satisfies capacity on all dimensions and has no host-port
/// collision with containers already assigned to it.
pub fn select_node<'a>(
    nodes: &'a [Node],
    all_containers: &[Container],
    container: &Container,
) -> Option<&'a Node> {
    for node in nodes {
        let usage = node.usage(all_containers);
        if !fits(node, &usage, container) {
            debug!(node = %node.id, container = %container.id, "insufficient capacity");
            continue;
        }
        let claimed = node.claimed_host_ports(all_containers);
        if let Some(port) = port_conflict(&claimed, container) {
            debug!(node = %node.id, container = %container.id, port, "host port collision");
            continue;
        }
        return Some(node);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_store::*;
    use std::collections::HashMap;

    fn node(id: &str, cpu: u64, mem: u64, storage: u64) -> Node {
        Node {
            id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            cpu_limit: cpu,
            memory_limit: mem,
            storage_limit: storage,
            containers: Vec::new(),
        }
    }

    fn container(id: &str, cpu: u64, mem: u64, storage: u64, host_ports: &[u16]) -> Container {
        Container {
            id: id.to_string(),
            namespace: "default".to_string(),
            image: "nginx:latest".to_string(),
            env: HashMap::new(),
            ports: host_ports
                .iter()
                .map(|&host_port| PortMapping {
                    host_port,
                    container_port: 80,
                    protocol: Protocol::Tcp,
                })
                .collect(),
            cpu_limit: cpu,
            memory_limit: mem,
            storage_limit: storage,
            stop_timeout_secs: 10,
            node_id: String::new(),
            desired_status: DesiredStatus::Running,
            status: ContainerStatus::Unknown,
        }
    }

    #[test]
    fn fits_requires_every_dimension() {
        let n = node("n1", 4, 8, 100);
        let free = NodeUsage::default();

        assert!(fits(&n, &free, &container("c", 4, 8, 100, &[])));
        assert!(!fits(&n, &free, &container("c", 5, 1, 1, &[])));
        assert!(!fits(&n, &free, &container("c", 1, 9, 1, &[])));
        assert!(!fits(&n, &free, &container("c", 1, 1, 101, &[])));
    }

    #[test]
    fn fits_accounts_for_existing_usage() {
        let n = node("n1", 4, 8, 100);
        let usage = NodeUsage { cpu: 3, memory: 4, storage: 50 };

        assert!(fits(&n, &usage, &container("c", 1, 4, 50, &[])));
        assert!(!fits(&n, &usage, &container("c", 2, 1, 1, &[])));
    }

    #[test]
    fn port_conflict_detects_collision() {
        let c = container("c", 1, 1, 1, &[8080, 9090]);
        assert_eq!(port_conflict(&[8080], &c), Some(8080));
        assert_eq!(port_conflict(&[7070], &c), None);
        assert_eq!(port_conflict(&[], &c), None);
    }

    #[test]
    fn select_node_is_first_fit() {
        // Both nodes fit; the first in listing order wins.
        let nodes = vec![node("n1", 4, 8, 100), node("n2", 8, 16, 200)];
        let c = container("c1", 1, 1, 5, &[8080]);

        let chosen = select_node(&nodes, &[], &c).unwrap();
        assert_eq!(chosen.id, "n1");
    }

    #[test]
    fn select_node_skips_full_nodes() {
        let mut small = node("n1", 1, 1, 1);
        small.containers.push("c0".to_string());
        let nodes = vec![small, node("n2", 4, 8, 100)];

        let mut existing = container("c0", 1, 1, 1, &[]);
        existing.node_id = "n1".to_string();

        let c = container("c1", 1, 1, 5, &[]);
        let chosen = select_node(&nodes, &[existing], &c).unwrap();
        assert_eq!(chosen.id, "n2");
    }

    #[test]
    fn select_node_skips_port_collisions() {
        let mut n1 = node("n1", 8, 16, 200);
        n1.containers.push("c0".to_string());
        let nodes = vec![n1, node("n2", 4, 8, 100)];

        let mut existing = container("c0", 1, 1, 1, &[8080]);
        existing.node_id = "n1".to_string();

        let c = container("c1", 1, 1, 5, &[8080]);
        let chosen = select_node(&nodes, &[existing], &c).unwrap();
        assert_eq!(chosen.id, "n2");
    }

    #[test]
    fn select_node_returns_none_when_nothing_fits() {
        let nodes = vec![node("n1", 1, 1, 1)];
        let c = container("c1", 2, 1, 1, &[]);
        assert!(select_node(&nodes, &[], &c).is_none());
    }
}
