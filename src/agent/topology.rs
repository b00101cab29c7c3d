//! Cross-instance topology
//!
//! Endpoints are interned into an arena and referenced by index from the
//! edges. Edges are directed; a bidirectional link is two edges.

use super::model::{Config, KvItem, LinuxInterface, VppInterface};
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, warn};

/// Config snapshot of one instance, input to [`build`]
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub instance: String,
    pub config: Arc<Config>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Network {
    /// Dataplane of an instance
    Vpp { instance: String },
    /// Linux host side of an instance
    Host { instance: String },
    /// Memif socket without a known peer
    Socket,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub network: Network,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Endpoint {
    pub fn vpp(instance: &str, interface: &str) -> Self {
        Self {
            network: Network::Vpp {
                instance: instance.to_string(),
            },
            interface: interface.to_string(),
            namespace: None,
        }
    }

    pub fn host(instance: &str, iface: &LinuxInterface) -> Self {
        Self {
            network: Network::Host {
                instance: instance.to_string(),
            },
            interface: iface.host_name().to_string(),
            namespace: iface.namespace_ref(),
        }
    }

    pub fn socket(path: &str) -> Self {
        Self {
            network: Network::Socket,
            interface: path.to_string(),
            namespace: None,
        }
    }

    pub fn instance(&self) -> Option<&str> {
        match &self.network {
            Network::Vpp { instance } | Network::Host { instance } => Some(instance),
            Network::Socket => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.network {
            Network::Vpp { instance } => write!(f, "{}/vpp/{}", instance, self.interface),
            Network::Host { instance } => match &self.namespace {
                Some(ns) => write!(f, "{}/host[{}]/{}", instance, ns, self.interface),
                None => write!(f, "{}/host/{}", instance, self.interface),
            },
            Network::Socket => write!(f, "socket:{}", self.interface),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionType {
    MemifSock,
    AfpacketToHost,
    HostToAfpacket,
    TapToHost,
    HostToTap,
    VxlanTun,
    VethPair,
    L2Xconn,
}

impl ConnectionType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::MemifSock => "memif-sock",
            ConnectionType::AfpacketToHost => "afpacket-to-host",
            ConnectionType::HostToAfpacket => "host-to-afpacket",
            ConnectionType::TapToHost => "tap-to-host",
            ConnectionType::HostToTap => "host-to-tap",
            ConnectionType::VxlanTun => "vxlan-tun",
            ConnectionType::VethPair => "veth-pair",
            ConnectionType::L2Xconn => "l2xconn",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub source: EndpointId,
    pub destination: EndpointId,
    pub kind: ConnectionType,
    pub state: Option<LinkState>,
}

/// Resolved edge, the serialized form of a connection
#[derive(Debug, Clone, Serialize)]
pub struct Edge<'a> {
    pub source: &'a Endpoint,
    pub destination: &'a Endpoint,
    pub metadata: EdgeMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeMetadata {
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LinkState>,
}

#[derive(Debug, Default)]
pub struct Topology {
    endpoints: Vec<Endpoint>,
    index: HashMap<Endpoint, EndpointId>,
    connections: Vec<Connection>,
    seen: HashSet<(EndpointId, EndpointId, ConnectionType)>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, endpoint: Endpoint) -> EndpointId {
        if let Some(id) = self.index.get(&endpoint) {
            return *id;
        }
        let id = EndpointId(self.endpoints.len());
        self.endpoints.push(endpoint.clone());
        self.index.insert(endpoint, id);
        id
    }

    pub fn endpoint(&self, id: EndpointId) -> &Endpoint {
        &self.endpoints[id.0]
    }

    /// Add an edge unless an identical one exists. Returns true when added.
    pub fn connect(
        &mut self,
        source: Endpoint,
        destination: Endpoint,
        kind: ConnectionType,
        state: Option<LinkState>,
    ) -> bool {
        let source = self.intern(source);
        let destination = self.intern(destination);
        if !self.seen.insert((source, destination, kind)) {
            return false;
        }
        self.connections.push(Connection {
            source,
            destination,
            kind,
            state,
        });
        true
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge<'_>> {
        self.connections.iter().map(|c| Edge {
            source: self.endpoint(c.source),
            destination: self.endpoint(c.destination),
            metadata: EdgeMetadata {
                kind: c.kind,
                state: c.state,
            },
        })
    }

    /// Set of `(source, destination, type)` triples, for comparing graphs
    pub fn edge_set(&self) -> HashSet<(Endpoint, Endpoint, ConnectionType)> {
        self.edges()
            .map(|e| (e.source.clone(), e.destination.clone(), e.metadata.kind))
            .collect()
    }

    /// Keep connections whose source matches `src` and destination matches
    /// `dst`. An endpoint matches when its instance or interface contains the
    /// pattern.
    pub fn filter(&self, src: Option<&str>, dst: Option<&str>) -> Topology {
        fn matches(endpoint: &Endpoint, pattern: Option<&str>) -> bool {
            pattern.map_or(true, |p| {
                endpoint.instance().is_some_and(|i| i.contains(p)) || endpoint.interface.contains(p)
            })
        }

        let mut filtered = Topology::new();
        for edge in self.edges() {
            if matches(edge.source, src) && matches(edge.destination, dst) {
                filtered.connect(
                    edge.source.clone(),
                    edge.destination.clone(),
                    edge.metadata.kind,
                    edge.metadata.state,
                );
            }
        }
        filtered
    }

    /// Graphviz rendering
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph topology {\n  rankdir=LR;\n  node [shape=box];\n");
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let _ = writeln!(out, "  n{} [label=\"{}\"];", i, escape_dot(&endpoint.to_string()));
        }
        for c in &self.connections {
            let label = match c.state {
                Some(LinkState::Down) => format!("{} (down)", c.kind),
                _ => c.kind.to_string(),
            };
            let style = match c.state {
                Some(LinkState::Down) => ", style=dashed",
                _ => "",
            };
            let _ = writeln!(
                out,
                "  n{} -> n{} [label=\"{}\"{}];",
                c.source.0, c.destination.0, label, style
            );
        }
        out.push_str("}\n");
        out
    }
}

impl Serialize for Topology {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.edges())
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Build the topology graph from the config snapshots of all instances
pub fn build(instances: &[InstanceConfig]) -> Topology {
    let mut topo = Topology::new();

    for inst in instances {
        for iface in &inst.config.vpp_interfaces {
            correlate_vpp_interface(&mut topo, inst, iface, instances);
        }
        for iface in &inst.config.linux_interfaces {
            correlate_linux_interface(&mut topo, inst, iface);
        }
        for xc in &inst.config.l2_xconnects {
            let xc = &xc.value;
            if inst.config.vpp_interface(&xc.transmit_interface).is_none()
                || inst.config.vpp_interface(&xc.receive_interface).is_none()
            {
                warn!(
                    "Skipping xconnect {} -> {} on {}: unknown interface",
                    xc.receive_interface, xc.transmit_interface, inst.instance
                );
                continue;
            }
            topo.connect(
                Endpoint::vpp(&inst.instance, &xc.transmit_interface),
                Endpoint::vpp(&inst.instance, &xc.receive_interface),
                ConnectionType::L2Xconn,
                None,
            );
        }
    }

    debug!(
        "Built topology: {} endpoints, {} connections",
        topo.endpoints.len(),
        topo.connections.len()
    );
    topo
}

fn correlate_vpp_interface(
    topo: &mut Topology,
    inst: &InstanceConfig,
    iface: &KvItem<VppInterface>,
    instances: &[InstanceConfig],
) {
    let value = &iface.value;
    let local = Endpoint::vpp(&inst.instance, &value.name);

    if let Some(memif) = &value.memif {
        let mut matched = false;
        for peer in instances {
            for other in &peer.config.vpp_interfaces {
                if peer.instance == inst.instance && other.key == iface.key {
                    continue;
                }
                let Some(other_memif) = &other.value.memif else {
                    continue;
                };
                if other_memif.id != memif.id || !same_socket(inst, iface, peer, other) {
                    continue;
                }
                matched = true;
                topo.connect(
                    local.clone(),
                    Endpoint::vpp(&peer.instance, &other.value.name),
                    ConnectionType::MemifSock,
                    None,
                );
            }
        }
        if !matched {
            topo.connect(
                local.clone(),
                Endpoint::socket(&memif.socket_filename),
                ConnectionType::MemifSock,
                Some(LinkState::Down),
            );
        }
    }

    if let Some(afpacket) = &value.afpacket {
        let host = inst
            .config
            .linux_interfaces
            .iter()
            .find(|h| h.value.host_name() == afpacket.host_if_name);
        match host {
            Some(host) => {
                let host = Endpoint::host(&inst.instance, &host.value);
                topo.connect(local.clone(), host.clone(), ConnectionType::AfpacketToHost, None);
                topo.connect(host, local.clone(), ConnectionType::HostToAfpacket, None);
            }
            None => warn!(
                "No host interface {} for af-packet {} on {}",
                afpacket.host_if_name, value.name, inst.instance
            ),
        }
    }

    if value.tap.is_some() {
        let host = inst.config.linux_interfaces.iter().find(|h| {
            h.value
                .tap
                .as_ref()
                .is_some_and(|t| t.vpp_tap_if_name == value.name)
        });
        match host {
            Some(host) => {
                topo.connect(
                    local.clone(),
                    Endpoint::host(&inst.instance, &host.value),
                    ConnectionType::TapToHost,
                    None,
                );
            }
            None => warn!(
                "No host TAP referencing {} on {}",
                value.name, inst.instance
            ),
        }
    }

    if let Some(vxlan) = &value.vxlan {
        for peer in instances.iter().filter(|p| p.instance != inst.instance) {
            for other in &peer.config.vpp_interfaces {
                let Some(other_vxlan) = &other.value.vxlan else {
                    continue;
                };
                if other_vxlan.vni == vxlan.vni
                    && other_vxlan.src_address == vxlan.dst_address
                    && other_vxlan.dst_address == vxlan.src_address
                {
                    topo.connect(
                        local.clone(),
                        Endpoint::vpp(&peer.instance, &other.value.name),
                        ConnectionType::VxlanTun,
                        None,
                    );
                }
            }
        }
    }
}

/// Memif sockets are the same file when their inodes agree. Without inode
/// information on both sides only equal paths within one instance count.
fn same_socket(
    a_inst: &InstanceConfig,
    a: &KvItem<VppInterface>,
    b_inst: &InstanceConfig,
    b: &KvItem<VppInterface>,
) -> bool {
    match (a.inode(), b.inode()) {
        (Some(x), Some(y)) => x == y,
        _ => {
            let path = |i: &KvItem<VppInterface>| {
                i.value
                    .memif
                    .as_ref()
                    .map(|m| m.socket_filename.clone())
                    .unwrap_or_default()
            };
            a_inst.instance == b_inst.instance && path(a) == path(b)
        }
    }
}

fn correlate_linux_interface(
    topo: &mut Topology,
    inst: &InstanceConfig,
    iface: &KvItem<LinuxInterface>,
) {
    let value = &iface.value;
    let local = Endpoint::host(&inst.instance, value);

    if let Some(veth) = &value.veth {
        match inst.config.linux_interface(&veth.peer_if_name) {
            Some(peer) => {
                topo.connect(
                    local.clone(),
                    Endpoint::host(&inst.instance, &peer.value),
                    ConnectionType::VethPair,
                    None,
                );
            }
            None => warn!(
                "Veth {} on {} has unknown peer {}",
                value.name, inst.instance, veth.peer_if_name
            ),
        }
    }

    if let Some(tap) = &value.tap {
        match inst.config.vpp_interface(&tap.vpp_tap_if_name) {
            Some(dp) => {
                topo.connect(
                    local,
                    Endpoint::vpp(&inst.instance, &dp.value.name),
                    ConnectionType::HostToTap,
                    None,
                );
            }
            None => warn!(
                "Host TAP {} on {} references unknown interface {}",
                value.name, inst.instance, tap.vpp_tap_if_name
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::super::model::*;
    use std::collections::BTreeMap;

    pub fn item<T>(key: &str, value: T) -> KvItem<T> {
        KvItem {
            key: key.to_string(),
            value,
            metadata: BTreeMap::new(),
            origin: Origin::NorthBound,
        }
    }

    pub fn memif(name: &str, id: u32, socket: &str, inode: Option<u64>) -> KvItem<VppInterface> {
        let mut i = item(
            &format!("config/vpp/v2/interfaces/{}", name),
            VppInterface {
                name: name.to_string(),
                kind: "MEMIF".into(),
                memif: Some(MemifLink {
                    master: false,
                    id,
                    socket_filename: socket.to_string(),
                }),
                ..Default::default()
            },
        );
        if let Some(inode) = inode {
            i.metadata.insert(INODE_KEY.into(), serde_json::json!(inode));
        }
        i
    }

    pub fn vxlan(name: &str, src: &str, dst: &str, vni: u32) -> KvItem<VppInterface> {
        item(
            &format!("config/vpp/v2/interfaces/{}", name),
            VppInterface {
                name: name.to_string(),
                kind: "VXLAN_TUNNEL".into(),
                vxlan: Some(VxlanLink {
                    src_address: src.to_string(),
                    dst_address: dst.to_string(),
                    vni,
                }),
                ..Default::default()
            },
        )
    }
}
