use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown environment: {0} (expected local, container or cluster)")]
    UnknownEnv(String),

    #[error("Invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("Failed to connect to {env} environment: {message}")]
    EnvironmentConnect { env: String, message: String },

    #[error("Provider {provider} query failed: {message}")]
    Query { provider: String, message: String },

    #[error("Capability {capability} unavailable: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("{operation}: {message}{}", format_stderr(.stderr))]
    Exec {
        operation: String,
        message: String,
        stderr: String,
    },

    #[error("Workload failed: {0}")]
    Workload(String),

    #[error("Duplicate provider: {0}")]
    DuplicateProvider(String),

    #[error("No instances discovered")]
    NoInstancesDiscovered,

    #[error("Trace nodes must not be empty")]
    NodesEmpty,

    #[error("Trace could not be started on any instance")]
    TraceStartEmpty,

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Handler {0} is closed")]
    HandlerClosed(String),
}

impl ProbeError {
    pub fn capability(capability: &'static str, message: impl ToString) -> Self {
        ProbeError::Capability {
            capability,
            message: message.to_string(),
        }
    }

    pub fn exec(operation: impl Into<String>, message: impl ToString, stderr: &[u8]) -> Self {
        ProbeError::Exec {
            operation: operation.into(),
            message: message.to_string(),
            stderr: stderr_excerpt(stderr),
        }
    }
}

/// Maximum number of stderr bytes carried in an error message.
const STDERR_EXCERPT_LEN: usize = 512;

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_LEN {
        return text.to_string();
    }
    let mut end = STDERR_EXCERPT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_includes_stderr() {
        let err = ProbeError::exec("pod exec vppctl", "exit status 1", b"clib_socket_init: connect\n");
        assert_eq!(
            err.to_string(),
            "pod exec vppctl: exit status 1: clib_socket_init: connect"
        );
    }

    #[test]
    fn test_exec_error_without_stderr() {
        let err = ProbeError::exec("exec ls", "exit status 2", b"");
        assert_eq!(err.to_string(), "exec ls: exit status 2");
    }

    #[test]
    fn test_stderr_excerpt_is_truncated() {
        let long = vec![b'x'; 2000];
        let excerpt = stderr_excerpt(&long);
        assert!(excerpt.len() < 600);
        assert!(excerpt.ends_with("..."));
    }
}
