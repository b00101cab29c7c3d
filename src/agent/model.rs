//! Typed records decoded from `agentctl dump` output

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key holding the memif socket file inode
pub const INODE_KEY: &str = "inode";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    #[default]
    Unknown,
    NorthBound,
    SouthBound,
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(1) => Origin::NorthBound,
            Raw::Num(2) => Origin::SouthBound,
            Raw::Num(_) => Origin::Unknown,
            Raw::Text(s) => match s.to_ascii_lowercase().as_str() {
                "fromnb" | "nb" | "north-bound" | "northbound" => Origin::NorthBound,
                "fromsb" | "sb" | "south-bound" | "southbound" => Origin::SouthBound,
                _ => Origin::Unknown,
            },
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::Unknown => "unknown",
            Origin::NorthBound => "north-bound",
            Origin::SouthBound => "south-bound",
        };
        write!(f, "{}", s)
    }
}

/// One key-value item of a dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvItem<T> {
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
    #[serde(rename = "Value", alias = "value")]
    pub value: T,
    #[serde(rename = "Metadata", alias = "metadata", default, deserialize_with = "null_as_default")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Origin", alias = "origin", default)]
    pub origin: Origin,
}

impl<T> KvItem<T> {
    pub fn inode(&self) -> Option<u64> {
        match self.metadata.get(INODE_KEY)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VppInterface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    #[serde(alias = "phys_address")]
    pub phys_address: String,
    #[serde(alias = "ip_addresses")]
    pub ip_addresses: Vec<String>,
    pub vrf: u32,
    pub mtu: u32,
    pub memif: Option<MemifLink>,
    pub vxlan: Option<VxlanLink>,
    pub afpacket: Option<AfpacketLink>,
    pub tap: Option<VppTapLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemifLink {
    pub master: bool,
    pub id: u32,
    #[serde(alias = "socket_filename")]
    pub socket_filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VxlanLink {
    #[serde(alias = "src_address")]
    pub src_address: String,
    #[serde(alias = "dst_address")]
    pub dst_address: String,
    pub vni: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AfpacketLink {
    #[serde(alias = "host_if_name")]
    pub host_if_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VppTapLink {
    pub version: u32,
    #[serde(alias = "host_if_name")]
    pub host_if_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxInterface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    pub namespace: Option<LinuxNamespace>,
    #[serde(alias = "host_if_name")]
    pub host_if_name: String,
    #[serde(alias = "ip_addresses")]
    pub ip_addresses: Vec<String>,
    pub veth: Option<VethLink>,
    pub tap: Option<LinuxTapLink>,
}

impl LinuxInterface {
    /// Name as seen by the kernel
    pub fn host_name(&self) -> &str {
        if self.host_if_name.is_empty() {
            &self.name
        } else {
            &self.host_if_name
        }
    }

    pub fn namespace_ref(&self) -> Option<String> {
        self.namespace
            .as_ref()
            .filter(|ns| !ns.reference.is_empty())
            .map(|ns| ns.reference.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub kind: String,
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VethLink {
    #[serde(alias = "peer_if_name")]
    pub peer_if_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxTapLink {
    /// Name of the VPP TAP this host TAP belongs to
    #[serde(alias = "vpp_tap_if_name")]
    pub vpp_tap_if_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct L2XConnect {
    #[serde(alias = "receive_interface")]
    pub receive_interface: String,
    #[serde(alias = "transmit_interface")]
    pub transmit_interface: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityAssociation {
    pub index: u32,
    pub spi: u32,
    pub protocol: String,
    #[serde(alias = "crypto_alg")]
    pub crypto_alg: String,
    #[serde(alias = "crypto_key")]
    pub crypto_key: String,
    #[serde(alias = "integ_alg")]
    pub integ_alg: String,
    #[serde(alias = "integ_key")]
    pub integ_key: String,
    #[serde(alias = "tunnel_src_addr")]
    pub tunnel_src_addr: String,
    #[serde(alias = "tunnel_dst_addr")]
    pub tunnel_dst_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityPolicy {
    #[serde(alias = "spd_index")]
    pub spd_index: u32,
    #[serde(alias = "sa_index")]
    pub sa_index: u32,
    pub priority: i32,
    #[serde(alias = "is_outbound")]
    pub is_outbound: bool,
    #[serde(alias = "remote_addr_start")]
    pub remote_addr_start: String,
    #[serde(alias = "remote_addr_stop")]
    pub remote_addr_stop: String,
    #[serde(alias = "local_addr_start")]
    pub local_addr_start: String,
    #[serde(alias = "local_addr_stop")]
    pub local_addr_stop: String,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelProtection {
    pub interface: String,
    #[serde(alias = "sa_out")]
    pub sa_out: Vec<u32>,
    #[serde(alias = "sa_in")]
    pub sa_in: Vec<u32>,
}

/// Snapshot of the agent's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Config {
    pub vpp_interfaces: Vec<KvItem<VppInterface>>,
    pub linux_interfaces: Vec<KvItem<LinuxInterface>>,
    pub l2_xconnects: Vec<KvItem<L2XConnect>>,
    pub ipsec_tun_protects: Vec<KvItem<TunnelProtection>>,
    pub ipsec_sas: Vec<KvItem<SecurityAssociation>>,
    pub ipsec_sps: Vec<KvItem<SecurityPolicy>>,
}

impl Config {
    pub fn vpp_interface(&self, name: &str) -> Option<&KvItem<VppInterface>> {
        self.vpp_interfaces.iter().find(|i| i.value.name == name)
    }

    pub fn linux_interface(&self, name: &str) -> Option<&KvItem<LinuxInterface>> {
        self.linux_interfaces.iter().find(|i| i.value.name == name)
    }

    pub fn security_association(&self, index: u32) -> Option<&SecurityAssociation> {
        self.ipsec_sas
            .iter()
            .map(|i| &i.value)
            .find(|sa| sa.index == index)
    }
}

/// Summary of `agentctl status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentStatus {
    pub build_version: Option<String>,
    pub state: Option<String>,
    /// Unparsed command output
    pub raw: String,
}

impl AgentStatus {
    /// Parse status output. JSON output is mined for the agent's build
    /// version and state; anything else is kept as raw text.
    pub fn parse(output: &str) -> Self {
        let mut status = AgentStatus {
            raw: output.trim().to_string(),
            ..Default::default()
        };
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(output) {
            let agent = json.get("AgentStatus").or_else(|| json.get("agent_status"));
            if let Some(agent) = agent {
                status.build_version = agent
                    .get("BuildVersion")
                    .or_else(|| agent.get("build_version"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                status.state = agent
                    .get("State")
                    .or_else(|| agent.get("state"))
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
            }
        }
        status
    }
}

/// Decode one model's dump. Empty output and `null` decode to no items.
pub(crate) fn decode_dump<T>(model: &str, data: &[u8]) -> Result<Vec<KvItem<T>>, String>
where
    T: for<'de> Deserialize<'de>,
{
    let trimmed = String::from_utf8_lossy(data);
    let trimmed = trimmed.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| format!("decoding {} dump: {}", model, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_vpp_interface_dump() {
        let data = br#"[
          {"Key":"config/vpp/v2/interfaces/memif1","Value":{"name":"memif1","type":"MEMIF","enabled":true,
            "memif":{"master":true,"id":1,"socketFilename":"/run/vpp/memif.sock"}},
           "Metadata":{"SwIfIndex":1},"Origin":1},
          {"Key":"config/vpp/v2/interfaces/UNTAGGED-local0","Value":{"name":"UNTAGGED-local0","type":"SOFTWARE_LOOPBACK"},
           "Metadata":null,"Origin":2}
        ]"#;
        let items: Vec<KvItem<VppInterface>> = decode_dump("vpp.interfaces", data).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].origin, Origin::NorthBound);
        assert_eq!(items[0].value.memif.as_ref().unwrap().id, 1);
        assert_eq!(items[1].origin, Origin::SouthBound);
        assert!(items[1].metadata.is_empty());
    }

    #[test]
    fn test_decode_snake_case_and_string_origin() {
        let data = br#"[{"key":"k","value":{"name":"veth1","type":"VETH","host_if_name":"eth1",
            "veth":{"peer_if_name":"veth2"}},"origin":"FromNB"}]"#;
        let items: Vec<KvItem<LinuxInterface>> = decode_dump("linux", data).unwrap();
        assert_eq!(items[0].value.host_name(), "eth1");
        assert_eq!(items[0].value.veth.as_ref().unwrap().peer_if_name, "veth2");
        assert_eq!(items[0].origin, Origin::NorthBound);
    }

    #[test]
    fn test_empty_dump() {
        assert!(decode_dump::<L2XConnect>("x", b"null\n").unwrap().is_empty());
        assert!(decode_dump::<L2XConnect>("x", b"{").is_err());
    }

    #[test]
    fn test_agent_status_parse() {
        let status = AgentStatus::parse(r#"{"AgentStatus":{"BuildVersion":"v3.2.0","State":"OK"}}"#);
        assert_eq!(status.build_version.as_deref(), Some("v3.2.0"));
        assert_eq!(status.state.as_deref(), Some("OK"));

        let plain = AgentStatus::parse("AGENT\n  State: OK\n");
        assert!(plain.build_version.is_none());
        assert!(plain.raw.contains("State: OK"));
    }

    #[test]
    fn test_inode_metadata() {
        let mut item = KvItem {
            key: "k".into(),
            value: VppInterface::default(),
            metadata: BTreeMap::new(),
            origin: Origin::Unknown,
        };
        assert_eq!(item.inode(), None);
        item.metadata.insert(INODE_KEY.into(), serde_json::json!(4242));
        assert_eq!(item.inode(), Some(4242));
    }
}
