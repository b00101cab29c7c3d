//! Trace orchestration across instances
//!
//! Begin tracing everywhere, run the workload, end tracing everywhere and
//! persist each result. The workload's outcome is reported next to the
//! traces and never discards them.

use super::{TraceResult, Tracer};
use crate::exec::HostExecutor;
use crate::vpp::Instance;
use crate::{ProbeError, Result};
use chrono::{DateTime, Local};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FILE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// What to run while tracing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    /// Shell command, run with `sh -c`
    Command(String),
    /// Just wait
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct TraceOptions {
    pub nodes: Vec<String>,
    pub num_packets: u32,
    pub result_dir: PathBuf,
}

pub struct InstanceTrace {
    pub instance: Arc<Instance>,
    pub result: TraceResult,
    /// Where the raw result was written, if persisting succeeded
    pub file: Option<PathBuf>,
}

pub struct TraceRun {
    pub traces: Vec<InstanceTrace>,
    pub workload_error: Option<ProbeError>,
}

pub async fn run_trace(
    instances: &[Arc<Instance>],
    options: &TraceOptions,
    workload: &Workload,
    cancel: &CancellationToken,
) -> Result<TraceRun> {
    let begins = instances.iter().map(|instance| async move {
        let mut tracer = Tracer::with_packets(instance.cli(), options.num_packets);
        match tracer.begin_trace(options.nodes.as_slice()).await {
            Ok(()) => Ok((instance.clone(), tracer)),
            Err(e) => {
                warn!("Starting trace on {} failed: {}", instance.id(), e);
                Err(e)
            }
        }
    });

    let mut started = Vec::new();
    for res in join_all(begins).await {
        match res {
            Ok(pair) => started.push(pair),
            // Empty node list fails the same way everywhere
            Err(ProbeError::NodesEmpty) => return Err(ProbeError::NodesEmpty),
            Err(_) => {}
        }
    }
    if started.is_empty() {
        return Err(ProbeError::TraceStartEmpty);
    }
    info!("Tracing started on {} instances", started.len());

    let workload_error = run_workload(workload, cancel).await.err();
    if let Some(e) = &workload_error {
        warn!("Workload failed: {}", e);
    }

    let ends = started.into_iter().map(|(instance, mut tracer)| async move {
        match tracer.end_trace().await {
            Ok(result) => Some((instance, result.clone())),
            Err(e) => {
                warn!("Ending trace on {} failed: {}", instance.id(), e);
                None
            }
        }
    });

    let mut traces = Vec::new();
    for (instance, result) in join_all(ends).await.into_iter().flatten() {
        let file = match persist(&options.result_dir, &instance, &result).await {
            Ok(path) => {
                info!(
                    "Saved trace of {} ({} packets) to {}",
                    instance.id(),
                    result.packets.len(),
                    path.display()
                );
                Some(path)
            }
            Err(e) => {
                warn!("Saving trace of {} failed: {}", instance.id(), e);
                None
            }
        };
        traces.push(InstanceTrace {
            instance,
            result,
            file,
        });
    }

    Ok(TraceRun {
        traces,
        workload_error,
    })
}

async fn run_workload(workload: &Workload, cancel: &CancellationToken) -> Result<()> {
    match workload {
        Workload::Sleep(duration) => {
            debug!("Tracing for {:?}", duration);
            tokio::select! {
                _ = cancel.cancelled() => Err(ProbeError::Cancelled),
                _ = tokio::time::sleep(*duration) => Ok(()),
            }
        }
        Workload::Command(cmd) => {
            info!("Running workload: {}", cmd);
            let args = ["-c".to_string(), cmd.clone()];
            let run = HostExecutor::run_attached("sh", &args);
            tokio::select! {
                _ = cancel.cancelled() => Err(ProbeError::Cancelled),
                res = run => res.map_err(|e| ProbeError::Workload(e.to_string())),
            }
        }
    }
}

/// Lowercase, with ` ` -> `-`, `:` -> `_` and `/` -> `~`
pub fn sanitize_id(id: &str) -> String {
    id.to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' => '-',
            ':' => '_',
            '/' => '~',
            other => other,
        })
        .collect()
}

pub fn result_file_name(instance_id: &str, time: &DateTime<Local>) -> String {
    format!(
        "vpptrace_{}_{}.txt",
        sanitize_id(instance_id),
        time.format(FILE_TIME_FORMAT)
    )
}

pub fn result_header(instance_id: &str, version: &str, result: &TraceResult) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "# Trace time: {}\n# Host: {}\n# Instance: {}\n# Version: {}\n# Packets: {}\n",
        result.trace_time.to_rfc3339(),
        host,
        instance_id,
        version,
        result.packets.len()
    )
}

async fn persist(dir: &Path, instance: &Instance, result: &TraceResult) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(result_file_name(instance.id(), &result.trace_time));
    let version = instance.version().await.version;

    let mut content = result_header(instance.id(), &version, result);
    content.push_str(&result.raw_data);
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
