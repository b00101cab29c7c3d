//! Management agent config retrieval
//!
//! The agent running next to the dataplane is queried with its control tool
//! `agentctl` through the handler's command runner. Retrieval yields a
//! complete [`Config`] snapshot or an error; partial snapshots are never
//! returned.

pub mod ipsec;
pub mod model;
pub mod topology;

pub use model::{AgentStatus, Config, KvItem, Origin};

use crate::providers::Handler;
use crate::{ProbeError, Result};
use model::{
    decode_dump, L2XConnect, LinuxInterface, SecurityAssociation, SecurityPolicy, TunnelProtection,
    VppInterface, INODE_KEY,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const AGENTCTL: &str = "agentctl";

const MODEL_VPP_INTERFACES: &str = "vpp.interfaces";
const MODEL_LINUX_INTERFACES: &str = "linux.interfaces.interface";
const MODEL_L2_XCONNECT: &str = "vpp.l2.xconnect";
const MODEL_IPSEC_TUN_PROTECT: &str = "vpp.ipsec.tun-protect";
const MODEL_IPSEC_SA: &str = "vpp.ipsec.sa";
const MODEL_IPSEC_SP: &str = "vpp.ipsec.sp";

/// Default DP loopback present in every dataplane
const DP_LOOPBACK_SUFFIX: &str = "local0";
const HOST_LOOPBACK: &str = "lo";

/// Agent found next to an instance, with its config snapshot
#[derive(Debug, Clone, Default)]
pub struct Agent {
    pub status: AgentStatus,
    pub config: Arc<Config>,
}

/// Probe the agent and retrieve its config. `Ok(None)` means there is no
/// usable agent; the instance is still fine for raw inspection.
pub async fn retrieve(handler: &dyn Handler) -> Result<Option<Agent>> {
    let status = match handler
        .command(AGENTCTL, &["status".to_string()])
        .output()
        .await
    {
        Ok(out) => AgentStatus::parse(&String::from_utf8_lossy(&out)),
        Err(e) => {
            info!("No agent on {}: {}", handler.id(), e);
            return Ok(None);
        }
    };

    let config = retrieve_config(handler).await?;
    debug!(
        "Agent config on {}: {} vpp interfaces, {} linux interfaces, {} xconnects",
        handler.id(),
        config.vpp_interfaces.len(),
        config.linux_interfaces.len(),
        config.l2_xconnects.len()
    );

    Ok(Some(Agent {
        status,
        config: Arc::new(config),
    }))
}

pub async fn retrieve_config(handler: &dyn Handler) -> Result<Config> {
    let mut vpp_interfaces: Vec<KvItem<VppInterface>> = dump(handler, MODEL_VPP_INTERFACES).await?;
    let mut linux_interfaces: Vec<KvItem<LinuxInterface>> =
        dump(handler, MODEL_LINUX_INTERFACES).await?;
    let l2_xconnects: Vec<KvItem<L2XConnect>> = dump(handler, MODEL_L2_XCONNECT).await?;

    // IPsec models are missing on older agents
    let ipsec_tun_protects: Vec<KvItem<TunnelProtection>> =
        dump_optional(handler, MODEL_IPSEC_TUN_PROTECT).await;
    let ipsec_sas: Vec<KvItem<SecurityAssociation>> = dump_optional(handler, MODEL_IPSEC_SA).await;
    let ipsec_sps: Vec<KvItem<SecurityPolicy>> = dump_optional(handler, MODEL_IPSEC_SP).await;

    vpp_interfaces.retain(|i| {
        !(i.origin == Origin::SouthBound && i.value.name.ends_with(DP_LOOPBACK_SUFFIX))
    });
    linux_interfaces
        .retain(|i| !(i.origin == Origin::SouthBound && i.value.name == HOST_LOOPBACK));

    for item in vpp_interfaces.iter_mut() {
        enrich_memif_inode(handler, item).await;
    }

    Ok(Config {
        vpp_interfaces,
        linux_interfaces,
        l2_xconnects,
        ipsec_tun_protects,
        ipsec_sas,
        ipsec_sps,
    })
}

async fn dump<T: DeserializeOwned>(handler: &dyn Handler, model: &str) -> Result<Vec<KvItem<T>>> {
    let args = ["dump", "--format", "json", model].map(String::from);
    let out = handler.command(AGENTCTL, &args).output().await?;
    decode_dump(model, &out).map_err(ProbeError::Parse)
}

async fn dump_optional<T: DeserializeOwned>(handler: &dyn Handler, model: &str) -> Vec<KvItem<T>> {
    match dump(handler, model).await {
        Ok(items) => items,
        Err(e) => {
            warn!("Dumping {} on {} failed: {}", model, handler.id(), e);
            Vec::new()
        }
    }
}

/// Record the inode of the memif socket file so sockets mounted under
/// different paths in different instances can be matched.
async fn enrich_memif_inode(handler: &dyn Handler, item: &mut KvItem<VppInterface>) {
    let Some(memif) = item.value.memif.as_ref() else {
        return;
    };
    if memif.socket_filename.is_empty() {
        return;
    }

    let args = ["-L", "-c", "%i", memif.socket_filename.as_str()].map(String::from);
    match handler.command("stat", &args).output().await {
        Ok(out) => match String::from_utf8_lossy(&out).trim().parse::<u64>() {
            Ok(inode) => {
                item.metadata
                    .insert(INODE_KEY.to_string(), serde_json::Value::from(inode));
            }
            Err(e) => debug!("Unexpected stat output for {}: {}", memif.socket_filename, e),
        },
        Err(e) => debug!(
            "Cannot stat memif socket {} on {}: {}",
            memif.socket_filename,
            handler.id(),
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecOutput;
    use crate::vpp::testing::{FakeCli, FakeHandler};

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            status: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_no_agent() {
        let handler = FakeHandler::new("local-1", FakeCli::default());
        handler.exec.reply(ExecOutput {
            status: Some(127),
            stdout: Vec::new(),
            stderr: b"agentctl: not found".to_vec(),
        });
        assert!(retrieve(&handler).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_filters_loopbacks_and_adds_inode() {
        let handler = FakeHandler::new("local-1", FakeCli::default());
        handler.exec.reply(ok(r#"{"AgentStatus":{"BuildVersion":"v3.2.0"}}"#));
        handler.exec.reply(ok(r#"[
          {"Key":"config/vpp/v2/interfaces/memif1","Value":{"name":"memif1","type":"MEMIF",
            "memif":{"id":1,"socketFilename":"/run/vpp/memif.sock"}},"Origin":1},
          {"Key":"config/vpp/v2/interfaces/UNTAGGED-local0","Value":{"name":"UNTAGGED-local0"},"Origin":2}
        ]"#));
        handler.exec.reply(ok(r#"[
          {"Key":"config/linux/interfaces/v2/interface/lo","Value":{"name":"lo"},"Origin":2},
          {"Key":"config/linux/interfaces/v2/interface/veth1","Value":{"name":"veth1","type":"VETH"},"Origin":1}
        ]"#));
        handler.exec.reply(ok("[]"));
        handler.exec.reply(ok("null"));
        handler.exec.reply(ExecOutput {
            status: Some(1),
            stdout: Vec::new(),
            stderr: b"unknown model".to_vec(),
        });
        handler.exec.reply(ok("[]"));
        handler.exec.reply(ok("131073\n"));

        let agent = retrieve(&handler).await.unwrap().unwrap();
        assert_eq!(agent.status.build_version.as_deref(), Some("v3.2.0"));

        let config = &agent.config;
        assert_eq!(config.vpp_interfaces.len(), 1);
        assert_eq!(config.vpp_interfaces[0].inode(), Some(131073));
        assert_eq!(config.linux_interfaces.len(), 1);
        assert_eq!(config.linux_interfaces[0].value.name, "veth1");
        assert!(config.ipsec_sas.is_empty());

        let calls = handler.exec.calls();
        assert_eq!(calls[1].1, vec!["dump", "--format", "json", "vpp.interfaces"]);
        assert_eq!(calls.last().unwrap().0, "stat");
        assert_eq!(
            calls.last().unwrap().1,
            vec!["-L", "-c", "%i", "/run/vpp/memif.sock"]
        );
    }

    #[tokio::test]
    async fn test_required_model_failure_is_error() {
        let handler = FakeHandler::new("local-1", FakeCli::default());
        handler.exec.reply(ok("AGENT OK"));
        handler.exec.reply(ok("not json"));
        assert!(matches!(
            retrieve(&handler).await,
            Err(ProbeError::Parse(_))
        ));
    }
}
