//! Command execution inside a pod over the exec subresource

use crate::exec::{ExecOutput, Executor};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use kube::Api;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub struct PodExecutor {
    pods: Api<Pod>,
    pod: String,
    container: Option<String>,
}

impl PodExecutor {
    pub fn new(pods: Api<Pod>, pod: &str, container: Option<String>) -> Self {
        Self {
            pods,
            pod: pod.to_string(),
            container,
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Exit code carried by the exec status frame
pub fn exit_code(status: Option<&Status>) -> Option<i32> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse().ok())
        });
    Some(code.unwrap_or(1))
}

#[async_trait]
impl Executor for PodExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(program.to_string());
        command.extend(args.iter().cloned());

        let mut params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = &self.container {
            params = params.container(container.clone());
        }

        let op = || format!("pod exec {}", program);
        let mut attached = self
            .pods
            .exec(&self.pod, command, &params)
            .await
            .map_err(|e| ProbeError::exec(op(), e, b""))?;

        if let (Some(data), Some(mut writer)) = (stdin, attached.stdin()) {
            writer.write_all(data).await?;
            writer.shutdown().await?;
        }

        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!("Exec session in {} ended with error: {}", self.pod, e);
        }

        Ok(ExecOutput {
            status: exit_code(status.as_ref()),
            stdout,
            stderr,
        })
    }

    fn describe(&self) -> String {
        "pod exec".to_string()
    }
}
