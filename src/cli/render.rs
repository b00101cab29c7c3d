//! Plain text rendering for command output

use crate::agent::topology::{LinkState, Topology};
use crate::agent::Agent;
use crate::providers::Metadata;
use crate::trace::Packet;
use crate::vpp::InstanceState;
use std::fmt::Write as _;
use std::time::Duration;

const NOT_AVAILABLE: &str = "N/A";
const TABLE_WIDTH: usize = 110;

/// One row of the instances table
pub struct InstanceRow<'a> {
    pub id: &'a str,
    pub metadata: &'a Metadata,
    pub state: &'a InstanceState,
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn or_na(value: &str) -> &str {
    if value.is_empty() {
        NOT_AVAILABLE
    } else {
        value
    }
}

pub fn format_uptime(uptime: Option<Duration>) -> String {
    match uptime {
        Some(d) => humantime::format_duration(Duration::from_secs(d.as_secs())).to_string(),
        None => NOT_AVAILABLE.to_string(),
    }
}

pub fn instances_table(rows: &[InstanceRow<'_>]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36} {:<10} {:<18} {:>7} {:<7} {:<7} {:<7} {:>12} {:>6}",
        "INSTANCE", "ENV", "VERSION", "PID", "CLI", "API", "STATS", "UPTIME", "IFACES"
    );
    let _ = writeln!(out, "{}", "-".repeat(TABLE_WIDTH));

    for row in rows {
        let state = row.state;
        let env = row.metadata.get("env").map(String::as_str).unwrap_or_default();
        let pid = match state.version.pid {
            0 => NOT_AVAILABLE.to_string(),
            pid => pid.to_string(),
        };
        let ifaces = if state.last_update.is_some() {
            state.interfaces.len().to_string()
        } else {
            "-".to_string()
        };
        let _ = write!(
            out,
            "{:<36} {:<10} {:<18} {:>7} {:<7} {:<7} {:<7} {:>12} {:>6}",
            truncate(row.id, 36),
            or_na(env),
            truncate(or_na(&state.version.version), 18),
            pid,
            state.status.cli.to_string(),
            state.status.bin_api.to_string(),
            state.status.stats_api.to_string(),
            format_uptime(state.uptime),
            ifaces
        );
        if state.updating {
            out.push_str("  updating...");
        } else if let Some(err) = &state.error {
            let _ = write!(out, "  ({})", truncate(err, 60));
        }
        out.push('\n');
    }
    out
}

/// Detailed block for `discover`
pub fn instance_details(row: &InstanceRow<'_>, agent: Option<&Agent>) -> String {
    let state = row.state;
    let mut out = String::new();
    let _ = writeln!(out, "Instance {}", row.id);
    let _ = writeln!(out, "{}", "-".repeat(40));
    for (key, value) in row.metadata {
        let _ = writeln!(out, "  {:<16} {}", format!("{}:", key), value);
    }
    let _ = writeln!(out, "  {:<16} {}", "version:", or_na(&state.version.version));
    let _ = writeln!(
        out,
        "  {:<16} cli={} api={} stats={}",
        "status:", state.status.cli, state.status.bin_api, state.status.stats_api
    );
    let _ = writeln!(out, "  {:<16} {}", "uptime:", format_uptime(state.uptime));

    match agent {
        Some(agent) => {
            let version = agent.status.build_version.as_deref().unwrap_or(NOT_AVAILABLE);
            let config = &agent.config;
            let _ = writeln!(
                out,
                "  {:<16} {} ({} vpp interfaces, {} linux interfaces, {} xconnects)",
                "agent:",
                version,
                config.vpp_interfaces.len(),
                config.linux_interfaces.len(),
                config.l2_xconnects.len()
            );
        }
        None => {
            let _ = writeln!(out, "  {:<16} {}", "agent:", NOT_AVAILABLE);
        }
    }

    if !state.interfaces.is_empty() {
        let _ = writeln!(out, "  interfaces:");
        for iface in &state.interfaces {
            let link = match (iface.admin_up, iface.link_up) {
                (true, true) => "up",
                (true, false) => "no-link",
                _ => "down",
            };
            let _ = writeln!(
                out,
                "    {:<4} {:<24} {:<8} {}",
                iface.index,
                truncate(&iface.name, 24),
                link,
                iface.ip_addresses.join(", ")
            );
        }
    }
    out
}

pub fn topology_table(topology: &Topology) -> String {
    let mut out = String::new();
    if topology.is_empty() {
        out.push_str("No connections found.\n");
        return out;
    }
    let _ = writeln!(
        out,
        "{:<44} {:<44} {:<17} {:<5}",
        "SOURCE", "DESTINATION", "TYPE", "STATE"
    );
    let _ = writeln!(out, "{}", "-".repeat(TABLE_WIDTH));
    for edge in topology.edges() {
        let state = match edge.metadata.state {
            Some(LinkState::Up) => "up",
            Some(LinkState::Down) => "down",
            None => "-",
        };
        let _ = writeln!(
            out,
            "{:<44} {:<44} {:<17} {:<5}",
            truncate(&edge.source.to_string(), 44),
            truncate(&edge.destination.to_string(), 44),
            edge.metadata.kind.as_str(),
            state
        );
    }
    out
}

/// Parsed packets of one instance, with capture times relative to the
/// packet's first capture
pub fn packets(instance_id: &str, packets: &[Packet]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Instance {}: {} packets", instance_id, packets.len());
    for packet in packets {
        let _ = writeln!(
            out,
            "  Packet {} (thread {}): {} captures",
            packet.id,
            packet.thread,
            packet.captures.len()
        );
        let first = packet.captures.first().map(|c| c.start).unwrap_or_default();
        for capture in &packet.captures {
            let elapsed = capture.start.saturating_sub(first);
            let _ = writeln!(out, "    {:<13} {}", format!("+{:?}", elapsed), capture.name);
        }
    }
    out
}

pub fn exec_output(instance_id: &str, cmd: &str, output: &str) -> String {
    let mut out = format!("=== {} | {} ===\n", instance_id, cmd);
    out.push_str(output);
    if !output.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::Config;
    use crate::agent::topology::{self, testing::memif, InstanceConfig};
    use crate::trace::Capture;
    use crate::vpp::{Status, VersionInfo};
    use std::sync::Arc;

    fn metadata() -> Metadata {
        let mut m = Metadata::new();
        m.insert("env".into(), "local".into());
        m.insert("pid".into(), "1425".into());
        m
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("vpp1", 10), "vpp1");
        assert_eq!(truncate("kind-a/vpp/vpp-node-x2k4d", 12), "kind-a/vp...");
    }

    #[test]
    fn test_instances_table_not_available() {
        let state = InstanceState::default();
        let meta = metadata();
        let table = instances_table(&[InstanceRow {
            id: "local-1425",
            metadata: &meta,
            state: &state,
        }]);
        let row = table.lines().nth(2).unwrap();
        assert!(row.starts_with("local-1425"));
        assert!(row.contains("N/A"));
        assert!(row.contains("unknown"));
    }

    #[test]
    fn test_instances_table_updating() {
        let mut state = InstanceState {
            version: VersionInfo {
                version: "v21.01-release".into(),
                pid: 1425,
            },
            uptime: Some(Duration::from_secs(3725)),
            updating: true,
            ..Default::default()
        };
        state.status.cli = Status::Ok;
        let meta = metadata();
        let table = instances_table(&[InstanceRow {
            id: "local-1425",
            metadata: &meta,
            state: &state,
        }]);
        let row = table.lines().nth(2).unwrap();
        assert!(row.contains("v21.01-release"));
        assert!(row.contains("1h 2m 5s"));
        assert!(row.ends_with("updating..."));
    }

    #[test]
    fn test_topology_table() {
        let mut a = Config::default();
        a.vpp_interfaces.push(memif("m0", 1, "/run/vpp/memif.sock", None));
        let topo = topology::build(&[InstanceConfig {
            instance: "vpp1".into(),
            config: Arc::new(a),
        }]);
        let table = topology_table(&topo);
        assert!(table.contains("memif-sock"));
        assert!(table.contains("socket:/run/vpp/memif.sock"));
        assert!(table.contains("down"));

        assert_eq!(topology_table(&Topology::new()), "No connections found.\n");
    }

    #[test]
    fn test_packets_relative_times() {
        let packet = Packet {
            id: 0,
            thread: 1,
            captures: vec![
                Capture {
                    name: "memif-input".into(),
                    start: Duration::from_micros(1_000_000),
                    content: String::new(),
                },
                Capture {
                    name: "ip4-input".into(),
                    start: Duration::from_micros(1_000_250),
                    content: String::new(),
                },
            ],
        };
        let out = packets("vpp1", &[packet]);
        assert!(out.contains("Packet 0 (thread 1): 2 captures"));
        assert!(out.contains("+0ns"));
        assert!(out.contains("+250µs"));
        assert!(out.contains("ip4-input"));
    }

    #[test]
    fn test_exec_output_header() {
        assert_eq!(
            exec_output("vpp1", "show err", "no errors"),
            "=== vpp1 | show err ===\nno errors\n"
        );
    }
}
