//! Statistics planes
//!
//! The stats segment is read-only from our side; several readers may sample
//! it at once.

use super::transport::{HttpProxy, UnixJsonConn};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStats {
    pub vector_rate: f64,
    pub input_rate: f64,
    pub last_update: f64,
    pub last_stats_clear: f64,
    pub heartbeat: u64,
    pub num_worker_threads: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterPair {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceCounters {
    pub index: u32,
    pub name: String,
    pub rx: CounterPair,
    pub tx: CounterPair,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub drops: u64,
    pub punts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCounters {
    pub index: u32,
    pub name: String,
    pub clocks: u64,
    pub vectors: u64,
    pub calls: u64,
    pub suspends: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCounter {
    pub node: String,
    pub reason: String,
    pub value: u64,
}

/// One sample of every plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub system: SystemStats,
    pub interfaces: Vec<InterfaceCounters>,
    pub nodes: Vec<NodeCounters>,
    pub errors: Vec<ErrorCounter>,
}

impl Stats {
    /// Error counters with a non-zero value
    pub fn active_errors(&self) -> impl Iterator<Item = &ErrorCounter> {
        self.errors.iter().filter(|e| e.value > 0)
    }
}

#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn system_stats(&self) -> Result<SystemStats>;
    async fn interface_stats(&self) -> Result<Vec<InterfaceCounters>>;
    async fn node_stats(&self) -> Result<Vec<NodeCounters>>;
    async fn error_stats(&self) -> Result<Vec<ErrorCounter>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sample all planes in order
pub async fn collect(stats: &dyn StatsProvider) -> Result<Stats> {
    Ok(Stats {
        system: stats.system_stats().await?,
        interfaces: stats.interface_stats().await?,
        nodes: stats.node_stats().await?,
        errors: stats.error_stats().await?,
    })
}

#[derive(Serialize)]
struct PlaneRequest<'a> {
    plane: &'a str,
}

/// Stats read through the local stats socket
pub struct SocketStats {
    conn: UnixJsonConn,
}

impl SocketStats {
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let conn = UnixJsonConn::connect(path, timeout)
            .await
            .map_err(|e| ProbeError::capability("stats", e))?;
        Ok(Self { conn })
    }

    async fn plane<R>(&self, plane: &str) -> Result<R>
    where
        R: serde::de::DeserializeOwned + Send,
    {
        let mut replies: Vec<R> = self
            .conn
            .exchange(&[PlaneRequest { plane }], |_| true)
            .await?;
        replies
            .pop()
            .ok_or_else(|| ProbeError::Rpc(format!("empty {} stats reply", plane)))
    }
}

#[async_trait]
impl StatsProvider for SocketStats {
    async fn system_stats(&self) -> Result<SystemStats> {
        self.plane("system").await
    }

    async fn interface_stats(&self) -> Result<Vec<InterfaceCounters>> {
        self.plane("interface").await
    }

    async fn node_stats(&self) -> Result<Vec<NodeCounters>> {
        self.plane("node").await
    }

    async fn error_stats(&self) -> Result<Vec<ErrorCounter>> {
        self.plane("error").await
    }

    async fn close(&self) -> Result<()> {
        self.conn.close().await;
        Ok(())
    }
}

/// Stats served by the RPC proxy next to the instance
pub struct ProxyStats {
    proxy: Arc<HttpProxy>,
}

impl ProxyStats {
    pub fn new(proxy: Arc<HttpProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl StatsProvider for ProxyStats {
    async fn system_stats(&self) -> Result<SystemStats> {
        self.proxy.get("/stats/system").await
    }

    async fn interface_stats(&self) -> Result<Vec<InterfaceCounters>> {
        self.proxy.get("/stats/interface").await
    }

    async fn node_stats(&self) -> Result<Vec<NodeCounters>> {
        self.proxy.get("/stats/node").await
    }

    async fn error_stats(&self) -> Result<Vec<ErrorCounter>> {
        self.proxy.get("/stats/error").await
    }
}
