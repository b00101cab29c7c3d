//! Transports carrying API and stats requests
//!
//! Message encoding is opaque to the rest of the crate. Two carriers exist:
//! newline-delimited JSON frames over a Unix socket (local instances), and
//! JSON over HTTP against the RPC proxy running next to the instance
//! (containers and pods).

use crate::{ProbeError, Result};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Connection exchanging JSON lines over a Unix socket.
///
/// Requests are serialized under a lock, one logical exchange at a time.
pub struct UnixJsonConn {
    path: PathBuf,
    timeout: Duration,
    stream: Mutex<Option<BufStream<UnixStream>>>,
}

impl UnixJsonConn {
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = Self::open(path, timeout).await?;
        Ok(Self {
            path: path.to_path_buf(),
            timeout,
            stream: Mutex::new(Some(stream)),
        })
    }

    async fn open(path: &Path, timeout: Duration) -> Result<BufStream<UnixStream>> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", path.display()),
                )
            })??;
        debug!("Connected to {}", path.display());
        Ok(BufStream::new(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `frames` and read replies until `done` returns true for one.
    /// The connection is dropped and re-opened on the next call after any
    /// failure so a half-read exchange never leaks into the next one.
    pub async fn exchange<T, R, F>(&self, frames: &[T], mut done: F) -> Result<Vec<R>>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
        F: FnMut(&R) -> bool + Send,
    {
        let mut guard = self.stream.lock().await;
        let stream = match guard.take() {
            Some(stream) => stream,
            None => Self::open(&self.path, self.timeout).await?,
        };

        let exchange = Self::exchange_on(stream, frames, &mut done);
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok((stream, replies))) => {
                *guard = Some(stream);
                Ok(replies)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Rpc(format!(
                "exchange on {} timed out after {:?}",
                self.path.display(),
                self.timeout
            ))),
        }
    }

    async fn exchange_on<T, R, F>(
        mut stream: BufStream<UnixStream>,
        frames: &[T],
        done: &mut F,
    ) -> Result<(BufStream<UnixStream>, Vec<R>)>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
        F: FnMut(&R) -> bool + Send,
    {
        let mut buf = BytesMut::with_capacity(256);
        for frame in frames {
            serde_json::to_writer((&mut buf).writer(), frame)?;
            buf.put_u8(b'\n');
        }
        stream.write_all(&buf).await?;
        stream.flush().await?;

        let mut replies = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(ProbeError::Rpc("connection closed by peer".to_string()));
            }
            if line.trim().is_empty() {
                continue;
            }
            trace!("<- {}", line.trim_end());
            let reply: R = serde_json::from_str(line.trim_end())?;
            let finished = done(&reply);
            replies.push(reply);
            if finished {
                return Ok((stream, replies));
            }
        }
    }

    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutting down {} failed: {}", self.path.display(), e);
            }
        }
    }
}

/// Client of the HTTP RPC proxy running next to an instance
pub struct HttpProxy {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProxy {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vpp-probe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post<T, R>(&self, path: &str, body: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        trace!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        trace!("GET {}", url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_unix_exchange_reads_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            assert!(first.contains("dump"));
            assert!(second.contains("ping"));
            write
                .write_all(b"{\"n\":1}\n{\"n\":2}\n{\"n\":0,\"end\":true}\n")
                .await
                .unwrap();
        });

        let conn = UnixJsonConn::connect(&path, Duration::from_secs(5))
            .await
            .unwrap();
        let replies: Vec<Value> = conn
            .exchange(&[json!({"msg": "dump"}), json!({"msg": "ping"})], |r: &Value| {
                r.get("end").is_some()
            })
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[1]["n"], 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let res = UnixJsonConn::connect(&dir.path().join("none.sock"), Duration::from_secs(1)).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_proxy_base_url_trimmed() {
        let proxy = HttpProxy::new("http://10.1.1.1:9191/", Duration::from_secs(1)).unwrap();
        assert_eq!(proxy.base_url(), "http://10.1.1.1:9191");
    }
}
