use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};

/// Namespaces never searched unless named explicitly
pub const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub phase: String,
    /// Image of the first container
    pub image: String,
    /// Name of the first container, the exec target
    pub container: Option<String>,
}

impl PodInfo {
    pub fn from_k8s_pod(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();
        let first = spec.and_then(|s| s.containers.first());

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            uid: metadata.uid.clone().unwrap_or_default(),
            node_name: spec.and_then(|s| s.node_name.clone()),
            pod_ip: status.and_then(|s| s.pod_ip.clone()),
            host_ip: status.and_then(|s| s.host_ip.clone()),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            image: first.and_then(|c| c.image.clone()).unwrap_or_default(),
            container: first.map(|c| c.name.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub hostname: String,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

impl NodeInfo {
    pub fn from_k8s_node(node: &Node) -> Self {
        let name = node.metadata.name.clone().unwrap_or_default();
        let addresses = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .cloned()
            .unwrap_or_default();
        let find = |kind: &str| {
            addresses
                .iter()
                .find(|a| a.type_ == kind)
                .map(|a| a.address.clone())
        };

        Self {
            hostname: find("Hostname").unwrap_or_else(|| name.clone()),
            internal_ip: find("InternalIP"),
            external_ip: find("ExternalIP"),
            name,
        }
    }

    /// Preferred address for reaching the node
    pub fn address(&self) -> Option<&str> {
        self.internal_ip
            .as_deref()
            .or(self.external_ip.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeAddress, NodeStatus, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    #[test]
    fn test_pod_info() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("vpp-node-x2k4d".into()),
                namespace: Some("vpp".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".into()),
                containers: vec![Container {
                    name: "vpp".into(),
                    image: Some("ligato/vpp-base:21.01".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.244.1.7".into()),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        };

        let info = PodInfo::from_k8s_pod(&pod);
        assert_eq!(info.name, "vpp-node-x2k4d");
        assert_eq!(info.node_name.as_deref(), Some("worker-1"));
        assert_eq!(info.image, "ligato/vpp-base:21.01");
        assert_eq!(info.container.as_deref(), Some("vpp"));
        assert!(info.is_running());
    }

    #[test]
    fn test_node_info_addresses() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "ExternalIP".into(),
                        address: "203.0.113.5".into(),
                    },
                    NodeAddress {
                        type_: "InternalIP".into(),
                        address: "192.168.1.11".into(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = NodeInfo::from_k8s_node(&node);
        assert_eq!(info.hostname, "worker-1");
        assert_eq!(info.address(), Some("192.168.1.11"));
    }

    #[test]
    fn test_system_namespaces() {
        assert!(is_system_namespace("kube-system"));
        assert!(!is_system_namespace("default"));
    }
}
