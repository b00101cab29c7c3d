//! Packet tracing
//!
//! A [`Tracer`] arms the trace buffer of one instance and collects the
//! result; the [`orchestrator`] drives tracers on many instances around a
//! user workload.

pub mod orchestrator;
pub mod parser;

pub use parser::{Capture, Packet};

use crate::config::DEFAULT_NUM_PACKETS;
use crate::vpp::cli::CliExecutor;
use crate::{ProbeError, Result};
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TraceResult {
    pub trace_time: DateTime<Local>,
    pub raw_data: String,
    pub packets: Vec<Packet>,
}

pub struct Tracer {
    cli: Arc<dyn CliExecutor>,
    num_packets: u32,
    to_retrieve: u32,
    last_result: Option<TraceResult>,
}

impl Tracer {
    pub fn new(cli: Arc<dyn CliExecutor>) -> Self {
        Self::with_packets(cli, DEFAULT_NUM_PACKETS)
    }

    pub fn with_packets(cli: Arc<dyn CliExecutor>, num_packets: u32) -> Self {
        Self {
            cli,
            num_packets,
            to_retrieve: 0,
            last_result: None,
        }
    }

    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    pub fn to_retrieve(&self) -> u32 {
        self.to_retrieve
    }

    pub fn last_result(&self) -> Option<&TraceResult> {
        self.last_result.as_ref()
    }

    /// Clear the trace buffer and add a trace on every node, in one batch
    pub async fn begin_trace<S: AsRef<str>>(&mut self, nodes: &[S]) -> Result<()> {
        if nodes.is_empty() {
            return Err(ProbeError::NodesEmpty);
        }

        let mut cmds = Vec::with_capacity(nodes.len() + 1);
        cmds.push("clear trace".to_string());
        for node in nodes {
            cmds.push(format!("trace add {} {}", node.as_ref(), self.num_packets));
        }
        self.cli.run_cli_batch(&cmds).await?;

        self.to_retrieve = self.num_packets.saturating_mul(nodes.len() as u32);
        debug!(
            "Tracing {} nodes, expecting up to {} packets",
            nodes.len(),
            self.to_retrieve
        );
        Ok(())
    }

    /// Fetch and parse the trace buffer
    pub async fn end_trace(&mut self) -> Result<&TraceResult> {
        let max = self.to_retrieve.max(self.num_packets);
        let raw_data = self.cli.run_cli(&format!("show trace max {}", max)).await?;
        let trace_time = Local::now();
        let packets = parser::parse_trace(&raw_data)?;

        Ok(self.last_result.insert(TraceResult {
            trace_time,
            raw_data,
            packets,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpp::testing::FakeCli;

    #[tokio::test]
    async fn test_begin_trace_requires_nodes() {
        let mut tracer = Tracer::new(Arc::new(FakeCli::default()));
        let nodes: [&str; 0] = [];
        assert!(matches!(
            tracer.begin_trace(&nodes).await,
            Err(ProbeError::NodesEmpty)
        ));
    }

    #[tokio::test]
    async fn test_begin_and_end_trace() {
        let cli = Arc::new(FakeCli::with(&[(
            "show trace max 200",
            "No packets in trace buffer\n",
        )]));
        let mut tracer = Tracer::with_packets(cli.clone(), 100);

        tracer
            .begin_trace(&["memif-input", "af-packet-input"])
            .await
            .unwrap();
        assert_eq!(tracer.to_retrieve(), 200);
        assert_eq!(
            cli.batches.lock().unwrap()[0],
            vec![
                "clear trace",
                "trace add memif-input 100",
                "trace add af-packet-input 100"
            ]
        );

        let result = tracer.end_trace().await.unwrap();
        assert!(result.packets.is_empty());
        assert!(tracer.last_result().is_some());
    }

    #[tokio::test]
    async fn test_end_without_begin_uses_num_packets() {
        let cli = Arc::new(FakeCli::with(&[("show trace max 50", "")]));
        let mut tracer = Tracer::with_packets(cli, 50);
        assert!(tracer.end_trace().await.is_ok());
    }

    #[tokio::test]
    async fn test_end_trace_keeps_unrecognized_output() {
        let raw = "trace buffer is disabled on this worker\n";
        let cli = Arc::new(FakeCli::with(&[("show trace max 50", raw)]));
        let mut tracer = Tracer::with_packets(cli, 50);

        let result = tracer.end_trace().await.unwrap();
        assert!(result.packets.is_empty());
        assert_eq!(result.raw_data, raw);
        assert_eq!(tracer.last_result().unwrap().raw_data, raw);
    }
}
