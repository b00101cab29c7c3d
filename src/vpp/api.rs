//! Binary API access
//!
//! The wire encoding is hidden behind [`RpcChannel`]; callers exchange the
//! typed [`Request`] / [`Reply`] messages below. Dump requests are
//! terminated the way VPP does it: a control ping follows the dump and its
//! reply marks the end of the stream.

use super::transport::{HttpProxy, UnixJsonConn};
use super::{Interface, LogLine, VersionInfo};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// API modules an instance must expose to be usable over RPC
pub const REQUIRED_MODULES: &[&str] = &["vpe", "interface", "ip"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Request {
    ShowVersion,
    ShowVpeSystemTime,
    ControlPing,
    SwInterfaceDump,
    SwInterfaceGetTable { sw_if_index: u32, is_ipv6: bool },
    IpAddressDump { sw_if_index: u32, is_ipv6: bool },
    LogDump { start_timestamp: f64 },
    ApiVersions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Reply {
    ShowVersionReply {
        #[serde(default)]
        program: String,
        version: String,
        #[serde(default)]
        build_date: String,
        #[serde(default)]
        build_directory: String,
    },
    ShowVpeSystemTimeReply {
        vpe_system_time: f64,
    },
    ControlPingReply {
        vpe_pid: u32,
        #[serde(default)]
        client_index: u32,
    },
    SwInterfaceDetails(SwInterfaceDetails),
    SwInterfaceGetTableReply {
        vrf_id: u32,
    },
    IpAddressDetails {
        sw_if_index: u32,
        prefix: String,
    },
    LogDetails {
        timestamp: f64,
        #[serde(default)]
        level: String,
        #[serde(default)]
        msg_class: String,
        message: String,
    },
    ApiVersionsReply {
        api_versions: Vec<ModuleVersion>,
    },
    Error {
        retval: i32,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwInterfaceDetails {
    pub sw_if_index: u32,
    pub sup_sw_if_index: u32,
    pub interface_name: String,
    pub interface_dev_type: String,
    pub tag: String,
    pub l2_address: String,
    pub admin_up: bool,
    pub link_up: bool,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request expecting exactly one reply
    async fn request(&self, req: &Request) -> Result<Reply>;

    /// Send a dump request and collect every reply it produces
    async fn multi_request(&self, req: &Request) -> Result<Vec<Reply>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn check_reply(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error { retval, message } => {
            Err(ProbeError::Rpc(format!("retval {}: {}", retval, message)))
        }
        other => Ok(other),
    }
}

fn unexpected(op: &str, reply: &Reply) -> ProbeError {
    ProbeError::Rpc(format!("{}: unexpected reply {:?}", op, reply))
}

/// Channel over the instance's local API socket
pub struct SocketChannel {
    conn: UnixJsonConn,
}

impl SocketChannel {
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let conn = UnixJsonConn::connect(path, timeout)
            .await
            .map_err(|e| ProbeError::capability("binapi", e))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RpcChannel for SocketChannel {
    async fn request(&self, req: &Request) -> Result<Reply> {
        let mut replies: Vec<Reply> = self.conn.exchange(&[req], |_| true).await?;
        let reply = replies
            .pop()
            .ok_or_else(|| ProbeError::Rpc("empty reply".to_string()))?;
        check_reply(reply)
    }

    async fn multi_request(&self, req: &Request) -> Result<Vec<Reply>> {
        let ping = Request::ControlPing;
        let replies: Vec<Reply> = self
            .conn
            .exchange(&[req, &ping], |r| {
                matches!(r, Reply::ControlPingReply { .. } | Reply::Error { .. })
            })
            .await?;

        let mut out = Vec::with_capacity(replies.len());
        for reply in replies {
            match check_reply(reply)? {
                Reply::ControlPingReply { .. } => break,
                other => out.push(other),
            }
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        self.conn.close().await;
        Ok(())
    }
}

/// Channel through the HTTP RPC proxy next to the instance
pub struct ProxyChannel {
    proxy: std::sync::Arc<HttpProxy>,
    lock: Mutex<()>,
}

impl ProxyChannel {
    pub fn new(proxy: std::sync::Arc<HttpProxy>) -> Self {
        Self {
            proxy,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RpcChannel for ProxyChannel {
    async fn request(&self, req: &Request) -> Result<Reply> {
        let _guard = self.lock.lock().await;
        let reply: Reply = self.proxy.post("/rpc", req).await?;
        check_reply(reply)
    }

    async fn multi_request(&self, req: &Request) -> Result<Vec<Reply>> {
        let _guard = self.lock.lock().await;
        let replies: Vec<Reply> = self.proxy.post("/rpc/dump", req).await?;
        replies.into_iter().map(check_reply).collect()
    }
}

/// Verify the peer exposes every module in [`REQUIRED_MODULES`]
pub async fn check_compatibility(ch: &dyn RpcChannel) -> Result<()> {
    let versions = match ch.request(&Request::ApiVersions).await? {
        Reply::ApiVersionsReply { api_versions } => api_versions,
        other => return Err(unexpected("api versions", &other)),
    };
    let missing: Vec<&str> = REQUIRED_MODULES
        .iter()
        .copied()
        .filter(|m| !versions.iter().any(|v| v.name == *m))
        .collect();
    if !missing.is_empty() {
        return Err(ProbeError::capability(
            "binapi",
            format!("incompatible API, missing modules: {}", missing.join(", ")),
        ));
    }
    debug!("API compatible ({} modules)", versions.len());
    Ok(())
}

pub async fn control_ping(ch: &dyn RpcChannel) -> Result<u32> {
    match ch.request(&Request::ControlPing).await? {
        Reply::ControlPingReply { vpe_pid, .. } => Ok(vpe_pid),
        other => Err(unexpected("control ping", &other)),
    }
}

pub async fn version_info(ch: &dyn RpcChannel) -> Result<VersionInfo> {
    let version = match ch.request(&Request::ShowVersion).await? {
        Reply::ShowVersionReply { version, .. } => version,
        other => return Err(unexpected("show version", &other)),
    };
    let pid = control_ping(ch).await?;
    Ok(VersionInfo { version, pid })
}

pub async fn uptime(ch: &dyn RpcChannel) -> Result<Duration> {
    match ch.request(&Request::ShowVpeSystemTime).await? {
        Reply::ShowVpeSystemTimeReply { vpe_system_time } => {
            Duration::try_from_secs_f64(vpe_system_time)
                .map_err(|e| ProbeError::Parse(format!("system time {}: {}", vpe_system_time, e)))
        }
        other => Err(unexpected("show system time", &other)),
    }
}

/// Dump interfaces with their VRF tables and IP addresses
pub async fn list_interfaces(ch: &dyn RpcChannel) -> Result<Vec<Interface>> {
    let mut interfaces = BTreeMap::new();
    for reply in ch.multi_request(&Request::SwInterfaceDump).await? {
        match reply {
            Reply::SwInterfaceDetails(d) => {
                interfaces.insert(d.sw_if_index, Interface::from_details(d));
            }
            other => return Err(unexpected("interface dump", &other)),
        }
    }

    for (index, iface) in interfaces.iter_mut() {
        for is_ipv6 in [false, true] {
            let table = Request::SwInterfaceGetTable {
                sw_if_index: *index,
                is_ipv6,
            };
            match ch.request(&table).await? {
                Reply::SwInterfaceGetTableReply { vrf_id } => {
                    if is_ipv6 {
                        iface.vrf_ipv6 = vrf_id;
                    } else {
                        iface.vrf_ipv4 = vrf_id;
                    }
                }
                other => return Err(unexpected("interface get table", &other)),
            }

            let dump = Request::IpAddressDump {
                sw_if_index: *index,
                is_ipv6,
            };
            for reply in ch.multi_request(&dump).await? {
                if let Reply::IpAddressDetails { prefix, .. } = reply {
                    iface.ip_addresses.push(prefix);
                }
            }
        }
    }

    Ok(interfaces.into_values().collect())
}

/// Dump log entries, optionally only those newer than `since`
pub async fn dump_logs(ch: &dyn RpcChannel, since: Option<NaiveDateTime>) -> Result<Vec<LogLine>> {
    let start_timestamp = since
        .map(|t| t.and_utc().timestamp_micros() as f64 / 1e6)
        .unwrap_or(0.0);
    let replies = ch.multi_request(&Request::LogDump { start_timestamp }).await?;

    let mut logs = Vec::with_capacity(replies.len());
    for reply in replies {
        if let Reply::LogDetails {
            timestamp,
            level,
            msg_class,
            message,
        } = reply
        {
            let micros = (timestamp * 1e6) as i64;
            logs.push(LogLine {
                timestamp: DateTime::from_timestamp_micros(micros).map(|t| t.naive_utc()),
                level,
                class: msg_class,
                message,
            });
        }
    }
    Ok(logs)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Channel answering from a fixed script of replies
    #[derive(Default)]
    pub struct ScriptedChannel {
        pub single: StdMutex<Vec<Reply>>,
        pub multi: StdMutex<Vec<Vec<Reply>>>,
        pub requests: StdMutex<Vec<Request>>,
        pub fail_close: bool,
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn request(&self, req: &Request) -> Result<Reply> {
            self.requests.lock().unwrap().push(req.clone());
            let mut single = self.single.lock().unwrap();
            if single.is_empty() {
                return Err(ProbeError::Rpc("no scripted reply".to_string()));
            }
            check_reply(single.remove(0))
        }

        async fn multi_request(&self, req: &Request) -> Result<Vec<Reply>> {
            self.requests.lock().unwrap().push(req.clone());
            let mut multi = self.multi.lock().unwrap();
            if multi.is_empty() {
                return Ok(Vec::new());
            }
            Ok(multi.remove(0))
        }

        async fn close(&self) -> Result<()> {
            if self.fail_close {
                return Err(ProbeError::Rpc("connection reset".to_string()));
            }
            Ok(())
        }
    }
}
