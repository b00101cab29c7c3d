//! VPP CLI access through `vppctl`

use crate::config::VppConfig;
use crate::exec::{CommandRunner, Wrapper};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Prompt printed by vppctl on a fresh interactive session
const BANNER_PROMPT: &str = "vpp# ";

#[async_trait]
pub trait CliExecutor: Send + Sync {
    /// Run one CLI command and return its cleaned output
    async fn run_cli(&self, cmd: &str) -> Result<String>;

    /// Run several commands, one round-trip where the backend allows it
    async fn run_cli_batch(&self, cmds: &[String]) -> Result<String> {
        let mut out = String::new();
        for cmd in cmds {
            out.push_str(&self.run_cli(cmd).await?);
        }
        Ok(out)
    }
}

/// Normalize CLI output: CR/LF to LF, drop everything up to and including
/// the last banner prompt, trim leading newlines.
pub fn clean_cli_output(output: &str) -> String {
    let normalized = output.replace("\r\n", "\n").replace('\r', "\n");
    let body = match normalized.rfind(BANNER_PROMPT) {
        Some(idx) => &normalized[idx + BANNER_PROMPT.len()..],
        None => normalized.as_str(),
    };
    body.trim_start_matches('\n').to_string()
}

/// CLI executor running `vppctl -s <addr> <cmd>` through a command runner
pub struct VppCtl {
    base: Arc<dyn CommandRunner>,
    vppctl: String,
    addr: String,
    wrapped: Wrapper,
}

impl VppCtl {
    pub fn new(base: Arc<dyn CommandRunner>, vppctl: &str, addr: &str) -> Self {
        let wrapped = Wrapper::new(base.clone(), vppctl, ["-s", addr]);
        Self {
            base,
            vppctl: vppctl.to_string(),
            addr: addr.to_string(),
            wrapped,
        }
    }

    /// Pick the CLI socket when it exists inside the instance, otherwise
    /// fall back to the TCP CLI endpoint.
    pub async fn detect(base: Arc<dyn CommandRunner>, config: &VppConfig) -> Self {
        let probe = base
            .command("ls", &[config.cli_socket.clone()])
            .output()
            .await;
        let addr = match probe {
            Ok(_) => config.cli_socket.as_str(),
            Err(e) => {
                debug!(
                    "CLI socket {} not found ({}), using {}",
                    config.cli_socket, e, config.cli_tcp_addr
                );
                config.cli_tcp_addr.as_str()
            }
        };
        Self::new(base, &config.vppctl, addr)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl CliExecutor for VppCtl {
    async fn run_cli(&self, cmd: &str) -> Result<String> {
        let out = self.wrapped.command(cmd, &[]).output().await?;
        Ok(clean_cli_output(&String::from_utf8_lossy(&out)))
    }

    async fn run_cli_batch(&self, cmds: &[String]) -> Result<String> {
        let mut script = cmds.join("\n");
        script.push('\n');
        let out = self
            .base
            .command(&self.vppctl, &["-s".to_string(), self.addr.clone()])
            .stdin(script)
            .output()
            .await?;
        Ok(clean_cli_output(&String::from_utf8_lossy(&out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingExecutor;
    use crate::exec::{ExecOutput, Runner};

    const BANNER: &str = "    _______    _        _   _____  ___ \r\n __/ __/ _ \\  (_)__    | | / / _ \\/ _ \\\r\n _/ _// // / / / _ \\   | |/ / ___/ ___/\r\n /_/ /____(_)_/\\___/   |___/_/  /_/    \r\n\r\nvpp# show version\r\n";

    #[test]
    fn test_clean_strips_banner() {
        assert_eq!(clean_cli_output(BANNER), "show version\n");
    }

    #[test]
    fn test_clean_is_idempotent() {
        for input in [
            BANNER,
            "\n\nvpp v21.01 built by root\r\n",
            "vpp# vpp# show clock\r\n",
            "",
            "\r\r\rTime now 1.0\r",
        ] {
            let once = clean_cli_output(input);
            assert_eq!(clean_cli_output(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn test_clean_normalizes_line_endings() {
        assert_eq!(
            clean_cli_output("\r\n\r\nline1\r\nline2\rline3\n"),
            "line1\nline2\nline3\n"
        );
    }

    #[tokio::test]
    async fn test_run_cli_wraps_vppctl() {
        let exec = Arc::new(RecordingExecutor::default());
        exec.reply(ExecOutput {
            status: Some(0),
            stdout: b"vpp v21.01\r\n".to_vec(),
            stderr: Vec::new(),
        });
        let cli = VppCtl::new(Arc::new(Runner::new(exec.clone())), "vppctl", "/run/vpp/cli.sock");

        let out = cli.run_cli("show version").await.unwrap();
        assert_eq!(out, "vpp v21.01\n");

        let calls = exec.calls();
        assert_eq!(calls[0].0, "vppctl");
        assert_eq!(calls[0].1, vec!["-s", "/run/vpp/cli.sock", "show version"]);
    }

    #[tokio::test]
    async fn test_batch_uses_stdin() {
        let exec = Arc::new(RecordingExecutor::default());
        let cli = VppCtl::new(Arc::new(Runner::new(exec.clone())), "vppctl", "localhost:5002");

        cli.run_cli_batch(&["clear trace".to_string(), "trace add memif-input 10".to_string()])
            .await
            .unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["-s", "localhost:5002"]);
        assert_eq!(
            calls[0].2.as_deref(),
            Some(&b"clear trace\ntrace add memif-input 10\n"[..])
        );
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_tcp() {
        let exec = Arc::new(RecordingExecutor::default());
        exec.reply(ExecOutput {
            status: Some(2),
            stdout: Vec::new(),
            stderr: b"ls: cannot access '/run/vpp/cli.sock'".to_vec(),
        });
        let cli = VppCtl::detect(Arc::new(Runner::new(exec)), &VppConfig::default()).await;
        assert_eq!(cli.addr(), "localhost:5002");
    }
}
