//! Instance providers
//!
//! A [`Provider`] enumerates VPP instances in one environment and hands out a
//! [`Handler`] per instance. Handlers expose the per-instance capability set:
//! command execution, the CLI, the binary API and the stats segment.

pub mod cluster;
pub mod container;
pub mod local;
pub mod query;
pub mod registry;

pub use query::{parse_queries, parse_query, QueryParams};
pub use registry::{default_registry, Registry};

use crate::exec::{Command, CommandRunner};
use crate::vpp::api::RpcChannel;
use crate::vpp::cli::CliExecutor;
use crate::vpp::stats::StatsProvider;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Instance metadata, keys depend on the environment
pub type Metadata = BTreeMap<String, String>;

/// Hosting environment of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Local,
    Container,
    Cluster,
}

impl Env {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Env::Local => "local",
            Env::Container => "container",
            Env::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Env {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Env::Local),
            "container" | "docker" => Ok(Env::Container),
            "cluster" | "kube" | "kubernetes" => Ok(Env::Cluster),
            other => Err(ProbeError::UnknownEnv(other.to_string())),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn env(&self) -> Env;

    fn name(&self) -> &str;

    /// Find instances matching any of the given clauses.
    /// An empty slice matches every candidate.
    async fn query(&self, params: &[QueryParams]) -> Result<Vec<Arc<dyn Handler>>>;

    /// Check that the backing environment is still reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Close every handler this provider produced
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Identifier, unique within the owning provider
    fn id(&self) -> &str;

    fn metadata(&self) -> &Metadata;

    /// Runner executing commands in the instance's context
    fn runner(&self) -> Arc<dyn CommandRunner>;

    fn command(&self, program: &str, args: &[String]) -> Command {
        self.runner().command(program, args)
    }

    async fn get_cli(&self) -> Result<Arc<dyn CliExecutor>>;

    async fn get_api(&self) -> Result<Arc<dyn RpcChannel>>;

    async fn get_stats(&self) -> Result<Arc<dyn StatsProvider>>;

    /// Release RPC, stats and tunnel resources. Safe to call repeatedly.
    async fn close(&self) -> Result<()>;
}

/// Lazily acquired, memoized capability guarded by a per-handler lock.
/// Failed acquisitions are not cached, the next call retries.
pub struct CapabilityCell<T: ?Sized> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> CapabilityCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = init().await?;
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Remove the cached value, returning it for cleanup
    pub async fn take(&self) -> Option<Arc<T>> {
        self.inner.lock().await.take()
    }
}

impl<T: ?Sized> Default for CapabilityCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handlers produced by a provider, keyed by id. A handler is created once
/// per instance and handed out again by later queries.
#[derive(Default)]
pub(crate) struct HandlerSet {
    handlers: std::sync::Mutex<BTreeMap<String, Arc<dyn Handler>>>,
}

impl HandlerSet {
    pub(crate) fn get_or_insert_with<F>(&self, id: &str, create: F) -> Arc<dyn Handler>
    where
        F: FnOnce() -> Arc<dyn Handler>,
    {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.entry(id.to_string()).or_insert_with(create).clone()
    }

    /// Close and forget handlers whose id is not in `keep`, i.e. instances
    /// that disappeared or no longer match the latest query
    pub(crate) async fn retain(&self, keep: &BTreeSet<String>) {
        let stale: Vec<Arc<dyn Handler>> = {
            let mut handlers = self
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ids: Vec<String> = handlers
                .keys()
                .filter(|id| !keep.contains(*id))
                .cloned()
                .collect();
            ids.iter().filter_map(|id| handlers.remove(id)).collect()
        };
        if stale.is_empty() {
            return;
        }
        tracing::debug!("Dropping {} stale handlers", stale.len());
        // failures are logged by close_all
        let _ = close_all(&stale).await;
    }

    /// Close and forget every handler
    pub(crate) async fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<dyn Handler>> = {
            let mut handlers = self
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *handlers).into_values().collect()
        };
        close_all(&drained).await
    }
}

/// Close the RPC channel and stats client cached by a handler. Both are
/// released even when one fails; the first failure is returned.
pub(crate) async fn release_channels(
    id: &str,
    api: &CapabilityCell<dyn RpcChannel>,
    stats: &CapabilityCell<dyn StatsProvider>,
) -> Result<()> {
    let mut first_err = None;
    if let Some(api) = api.take().await {
        if let Err(e) = api.close().await {
            tracing::warn!("Closing RPC channel of {} failed: {}", id, e);
            first_err.get_or_insert(e);
        }
    }
    if let Some(stats) = stats.take().await {
        if let Err(e) = stats.close().await {
            tracing::warn!("Closing stats client of {} failed: {}", id, e);
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Close every handler in `handlers`, logging failures and returning the first
pub(crate) async fn close_all(handlers: &[Arc<dyn Handler>]) -> Result<()> {
    let mut first_err = None;
    for handler in handlers {
        if let Err(e) = handler.close().await {
            tracing::warn!("Closing handler {} failed: {}", handler.id(), e);
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
