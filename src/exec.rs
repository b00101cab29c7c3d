//! Scoped process execution
//!
//! A [`CommandRunner`] builds [`Command`]s that execute inside some context:
//! the host, a container or a pod. [`Wrapper`] prefixes every command with a
//! fixed program and arguments, which is how `vppctl -s <sock>` and
//! `docker exec <id>` are layered on top of a plain runner.

use crate::{ProbeError, Result};
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Backend that actually starts a process somewhere
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput>;

    /// Short label used as the operation name in errors, e.g. "pod exec"
    fn describe(&self) -> String;
}

/// Capability to construct commands in a fixed execution context
pub trait CommandRunner: Send + Sync {
    fn command(&self, program: &str, args: &[String]) -> Command;
}

/// A command ready to run, with optional stdin data and output sinks
pub struct Command {
    executor: Arc<dyn Executor>,
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
}

impl Command {
    pub fn new(executor: Arc<dyn Executor>, program: &str, args: &[String]) -> Self {
        Self {
            executor,
            program: program.to_string(),
            args: args.to_vec(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn stdout(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    pub fn stderr(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Run to completion, copying captured output into the configured sinks.
    /// Fails when the process exits non-zero.
    pub async fn run(mut self) -> Result<()> {
        let output = self.execute().await?;

        if let Some(sink) = self.stdout.as_mut() {
            sink.write_all(&output.stdout)?;
            sink.flush()?;
        }
        if let Some(sink) = self.stderr.as_mut() {
            sink.write_all(&output.stderr)?;
            sink.flush()?;
        }

        self.check_status(&output)
    }

    /// Run to completion and return stdout.
    /// A non-zero exit yields an error carrying a stderr excerpt.
    pub async fn output(mut self) -> Result<Vec<u8>> {
        let output = self.execute().await?;

        if let Some(sink) = self.stderr.as_mut() {
            sink.write_all(&output.stderr)?;
        }

        self.check_status(&output)?;
        Ok(output.stdout)
    }

    async fn execute(&mut self) -> Result<ExecOutput> {
        debug!("{} {}", self.executor.describe(), self);
        let output = self
            .executor
            .execute(&self.program, &self.args, self.stdin.as_deref())
            .await?;
        trace!(
            "{} exited with {:?} ({} bytes stdout, {} bytes stderr)",
            self.program,
            output.status,
            output.stdout.len(),
            output.stderr.len()
        );
        Ok(output)
    }

    fn check_status(&self, output: &ExecOutput) -> Result<()> {
        if output.success() {
            return Ok(());
        }
        let message = match output.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        Err(ProbeError::exec(
            format!("{} {}", self.executor.describe(), self),
            message,
            &output.stderr,
        ))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runner that hands every command to a single executor
#[derive(Clone)]
pub struct Runner {
    executor: Arc<dyn Executor>,
}

impl Runner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Runner executing processes directly on the host
    pub fn host() -> Self {
        Self::new(Arc::new(HostExecutor))
    }
}

impl CommandRunner for Runner {
    fn command(&self, program: &str, args: &[String]) -> Command {
        Command::new(self.executor.clone(), program, args)
    }
}

/// Prefixes every command with a fixed program and leading arguments.
///
/// `Wrapper::new(r, "vppctl", ["-s", sock]).command("show", ["version"])`
/// is `r.command("vppctl", ["-s", sock, "show", "version"])`.
#[derive(Clone)]
pub struct Wrapper {
    inner: Arc<dyn CommandRunner>,
    prefix: String,
    args: Vec<String>,
}

impl Wrapper {
    pub fn new<I, S>(inner: Arc<dyn CommandRunner>, prefix: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            prefix: prefix.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl CommandRunner for Wrapper {
    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut full = Vec::with_capacity(self.args.len() + args.len() + 1);
        full.extend(self.args.iter().cloned());
        full.push(program.to_string());
        full.extend(args.iter().cloned());
        self.inner.command(&self.prefix, &full)
    }
}

/// Executes processes on the local host
pub struct HostExecutor;

impl HostExecutor {
    /// Run a host process attached to this terminal: stdin, stdout and
    /// stderr are inherited so output streams live. The child is killed
    /// when the returned future is dropped.
    pub async fn run_attached(program: &str, args: &[String]) -> Result<()> {
        debug!("exec (attached) {} {}", program, args.join(" "));
        let operation = format!("exec {}", program);
        let status = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::exec(operation.as_str(), e, b""))?
            .wait()
            .await?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ProbeError::exec(
                operation,
                format!("exit status {}", code),
                b"",
            )),
            None => Err(ProbeError::exec(operation, "killed by signal", b"")),
        }
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProbeError::exec(format!("exec {}", program), e, b""))?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(tokio::spawn(async move {
                    let res = pipe.write_all(&data).await;
                    drop(pipe);
                    res
                }))
            }
            _ => None,
        };

        let output = child.wait_with_output().await?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Writing stdin to {} failed: {}", program, e),
                Err(e) => debug!("Stdin writer for {} did not finish: {}", program, e),
            }
        }

        Ok(ExecOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn describe(&self) -> String {
        "exec".to_string()
    }
}
