//! Parsers for CLI output, used when the binary API is unavailable

use super::{Interface, LogLine, VersionInfo};
use crate::{ProbeError, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

const LOG_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S:%3f";

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

/// Parse `show version verbose`
pub fn parse_version(output: &str) -> Result<VersionInfo> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    static PID: OnceLock<Regex> = OnceLock::new();

    let version = regex(&VERSION, r"Version:\s+(\S+)")
        .captures(output)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ProbeError::Parse("version not found in CLI output".to_string()))?;
    let pid = regex(&PID, r"PID:\s+([0-9]+)")
        .captures(output)
        .ok_or_else(|| ProbeError::Parse("PID not found in CLI output".to_string()))?[1]
        .parse()
        .map_err(|e| ProbeError::Parse(format!("invalid PID: {}", e)))?;

    Ok(VersionInfo { version, pid })
}

/// Parse `show clock`, e.g. `Time now 3180.278756, Tue, 1 Dec 2020 11:52:45 GMT`
pub fn parse_uptime(output: &str) -> Result<Duration> {
    static CLOCK: OnceLock<Regex> = OnceLock::new();

    let caps = regex(&CLOCK, r"Time now\s+([0-9]+)(?:\.([0-9]+))?")
        .captures(output)
        .ok_or_else(|| ProbeError::Parse(format!("unexpected clock output: {:?}", output.trim())))?;

    let secs: u64 = caps[1]
        .parse()
        .map_err(|e| ProbeError::Parse(format!("invalid seconds: {}", e)))?;
    let micros = match caps.get(2) {
        Some(frac) => {
            let digits: String = frac.as_str().chars().chain("000000".chars()).take(6).collect();
            digits
                .parse::<u64>()
                .map_err(|e| ProbeError::Parse(format!("invalid fraction: {}", e)))?
        }
        None => 0,
    };

    Ok(Duration::from_secs(secs) + Duration::from_micros(micros))
}

/// Parse `show interface` together with `show interface addr`
pub fn parse_interfaces(show_int: &str, show_addr: &str) -> Vec<Interface> {
    static ROW: OnceLock<Regex> = OnceLock::new();
    let row = regex(&ROW, r"^(\S+)\s+(\d+)\s+(up|down)\s+(\d+)/");

    let addresses = parse_interface_addresses(show_addr);
    let mut interfaces = Vec::new();

    for line in show_int.lines() {
        let Some(caps) = row.captures(line) else {
            continue;
        };
        let (Ok(index), Ok(mtu)) = (caps[2].parse::<u32>(), caps[4].parse::<u32>()) else {
            warn!("Skipping malformed interface row {:?}", line);
            continue;
        };
        let name = caps[1].to_string();
        let up = &caps[3] == "up";
        interfaces.push(Interface {
            index,
            ip_addresses: addresses.get(&name).cloned().unwrap_or_default(),
            name,
            admin_up: up,
            link_up: up,
            mtu,
            ..Default::default()
        });
    }

    interfaces
}

fn parse_interface_addresses(output: &str) -> HashMap<String, Vec<String>> {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static ADDR: OnceLock<Regex> = OnceLock::new();
    let header = regex(&HEADER, r"^(\S+) \((up|dn)\):");
    let addr = regex(&ADDR, r"^\s+L3 (\S+)");

    let mut result: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if let Some(caps) = header.captures(line) {
            let name = caps[1].to_string();
            result.entry(name.clone()).or_default();
            current = Some(name);
        } else if let (Some(caps), Some(name)) = (addr.captures(line), current.as_ref()) {
            result.entry(name.clone()).or_default().push(caps[1].to_string());
        }
    }
    result
}

/// Parse `show logging`. Lines that do not start a new entry are appended to
/// the previous entry's message.
pub fn parse_logs(output: &str) -> Vec<LogLine> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line_re = regex(
        &LINE,
        r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}:\d{3}) (\w+)\s+(\S+)\s+(.*)$",
    );

    let mut logs: Vec<LogLine> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = line_re.captures(line) {
            let timestamp = NaiveDateTime::parse_from_str(&caps[1], LOG_TIME_FORMAT)
                .map_err(|e| warn!("Invalid log timestamp {:?}: {}", &caps[1], e))
                .ok();
            logs.push(LogLine {
                timestamp,
                level: caps[2].to_string(),
                class: caps[3].to_string(),
                message: caps[4].trim_end().to_string(),
            });
        } else if let Some(last) = logs.last_mut() {
            let extra = line.trim();
            if !extra.is_empty() {
                last.message.push('\n');
                last.message.push_str(extra);
            }
        }
    }
    logs
}

/// Keep log lines strictly newer than `since`. Lines without a timestamp are
/// kept.
pub fn filter_logs_since(logs: Vec<LogLine>, since: Option<NaiveDateTime>) -> Vec<LogLine> {
    match since {
        None => logs,
        Some(since) => logs
            .into_iter()
            .filter(|l| l.timestamp.map_or(true, |t| t > since))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VERSION: &str = "Version:                  v21.01-release
Compiled by:              root
Compile host:             buildhost
Compile date:             2021-01-27T17:05:42
Compile location:         /w/workspace/vpp
Compiler:                 Clang/LLVM 10.0.0
Current PID:              1425
";

    #[test]
    fn test_parse_version() {
        let info = parse_version(SHOW_VERSION).unwrap();
        assert_eq!(info.version, "v21.01-release");
        assert_eq!(info.pid, 1425);
    }

    #[test]
    fn test_parse_version_missing_pid() {
        assert!(matches!(
            parse_version("Version: v20.09"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_uptime() {
        let d = parse_uptime("Time now 3180.278756, Tue, 1 Dec 2020 11:52:45 GMT").unwrap();
        assert_eq!(d.as_micros(), 3_180_278_756);
        assert_eq!(humantime::format_duration(d).to_string(), "53m 278ms 756us");
    }

    #[test]
    fn test_parse_uptime_distinct_inputs() {
        let a = parse_uptime("Time now 1.5, x").unwrap();
        let b = parse_uptime("Time now 1.05, x").unwrap();
        let c = parse_uptime("Time now 1.000005, x").unwrap();
        assert_eq!(a.as_micros(), 1_500_000);
        assert_eq!(b.as_micros(), 1_050_000);
        assert_eq!(c.as_micros(), 1_000_005);
        assert!(parse_uptime("clock unavailable").is_err());
    }

    #[test]
    fn test_parse_interfaces() {
        let show_int = "              Name               Idx    State  MTU (L3/IP4/IP6/MPLS)     Counter          Count
local0                            0     down          0/0/0/0
memif1/0                          1      up          9000/0/0/0     rx packets                    10
                                                                    rx bytes                    1000
tap0                              2      up          1500/0/0/0
";
        let show_addr = "local0 (dn):
memif1/0 (up):
  L3 10.10.1.1/24
  L3 fd00::1/64
tap0 (up):
";
        let ifaces = parse_interfaces(show_int, show_addr);
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[0].name, "local0");
        assert!(!ifaces[0].admin_up);
        assert_eq!(ifaces[1].mtu, 9000);
        assert_eq!(ifaces[1].ip_addresses, vec!["10.10.1.1/24", "fd00::1/64"]);
        assert!(ifaces[2].ip_addresses.is_empty());
    }

    #[test]
    fn test_parse_logs_and_filter() {
        let output = "2020/12/01 11:52:40:101 notice     plugin/load    Loaded plugin: memif_plugin.so
2020/12/01 11:52:41:500 warn       memif          socket /run/vpp/memif.sock
    connection refused
2020/12/01 11:52:45:000 error      interface      hw_add_del_mac_address: failed
";
        let logs = parse_logs(output);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[1].level, "warn");
        assert_eq!(logs[1].class, "memif");
        assert!(logs[1].message.ends_with("connection refused"));

        let since = NaiveDateTime::parse_from_str("2020/12/01 11:52:41:500", LOG_TIME_FORMAT).unwrap();
        let newer = filter_logs_since(logs, Some(since));
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].level, "error");
    }
}
