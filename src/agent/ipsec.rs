//! IPsec correlation across instances
//!
//! Security policies are indexed by traffic direction `(src, dst)`: for an
//! inbound policy the source is the remote address, for an outbound one it
//! is the local address. An inbound policy on B pairs with an outbound
//! policy on A for the same flow, and their SAs are compared field by field.

use super::model::{SecurityAssociation, SecurityPolicy};
use super::topology::InstanceConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Which SA fields agree between the two sides of a flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchMask(u8);

impl MatchMask {
    pub const SPI: u8 = 1 << 0;
    pub const CRYPTO_KEY: u8 = 1 << 1;
    pub const INTEG_KEY: u8 = 1 << 2;
    pub const ALL: u8 = Self::SPI | Self::CRYPTO_KEY | Self::INTEG_KEY;

    pub fn compare(a: &SecurityAssociation, b: &SecurityAssociation) -> Self {
        let mut mask = 0;
        if a.spi == b.spi {
            mask |= Self::SPI;
        }
        if a.crypto_key == b.crypto_key {
            mask |= Self::CRYPTO_KEY;
        }
        if a.integ_key == b.integ_key {
            mask |= Self::INTEG_KEY;
        }
        Self(mask)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn is_full(&self) -> bool {
        self.0 == Self::ALL
    }
}

impl fmt::Display for MatchMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit, name| if self.contains(bit) { name } else { "-" };
        write!(
            f,
            "{}/{}/{}",
            flag(Self::SPI, "spi"),
            flag(Self::CRYPTO_KEY, "crypto"),
            flag(Self::INTEG_KEY, "integ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub src: String,
    pub dst: String,
}

/// Outbound side on one instance paired with the inbound side on another
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpsecCorrelation {
    pub flow: FlowKey,
    pub outbound_instance: String,
    pub outbound_sa: u32,
    pub inbound_instance: String,
    pub inbound_sa: u32,
    /// Absent when either side lacks the referenced SA
    pub mask: Option<MatchMask>,
}

struct PolicyRef<'a> {
    instance: &'a InstanceConfig,
    policy: &'a SecurityPolicy,
}

type FlowMap<'a> = BTreeMap<FlowKey, Vec<PolicyRef<'a>>>;

fn flow_maps(instances: &[InstanceConfig]) -> (FlowMap<'_>, FlowMap<'_>) {
    let mut inbound: FlowMap = BTreeMap::new();
    let mut outbound: FlowMap = BTreeMap::new();

    for instance in instances {
        for sp in &instance.config.ipsec_sps {
            let policy = &sp.value;
            let r = PolicyRef { instance, policy };
            if policy.is_outbound {
                let key = FlowKey {
                    src: policy.local_addr_start.clone(),
                    dst: policy.remote_addr_start.clone(),
                };
                outbound.entry(key).or_default().push(r);
            } else {
                let key = FlowKey {
                    src: policy.remote_addr_start.clone(),
                    dst: policy.local_addr_start.clone(),
                };
                inbound.entry(key).or_default().push(r);
            }
        }
    }

    (inbound, outbound)
}

/// Pair inbound and outbound policies across instances. An empty result is
/// reported as "no IPsec correlations found".
pub fn correlate(instances: &[InstanceConfig]) -> Vec<IpsecCorrelation> {
    let (inbound, outbound) = flow_maps(instances);
    if inbound.is_empty() || outbound.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::new();
    for (flow, ins) in &inbound {
        let Some(outs) = outbound.get(flow) else {
            continue;
        };
        for inb in ins {
            for out in outs
                .iter()
                .filter(|o| o.instance.instance != inb.instance.instance)
            {
                let in_sa = inb.instance.config.security_association(inb.policy.sa_index);
                let out_sa = out.instance.config.security_association(out.policy.sa_index);
                let mask = match (out_sa, in_sa) {
                    (Some(a), Some(b)) => Some(MatchMask::compare(a, b)),
                    _ => None,
                };
                result.push(IpsecCorrelation {
                    flow: flow.clone(),
                    outbound_instance: out.instance.instance.clone(),
                    outbound_sa: out.policy.sa_index,
                    inbound_instance: inb.instance.instance.clone(),
                    inbound_sa: inb.policy.sa_index,
                    mask,
                });
            }
        }
    }
    result
}

/// Human readable report of [`correlate`] results
pub fn report(correlations: &[IpsecCorrelation]) -> String {
    if correlations.is_empty() {
        return "no IPsec correlations found\n".to_string();
    }
    let mut out = String::new();
    for c in correlations {
        let mask = c
            .mask
            .map(|m| format!("{} ({:03b})", m, m.bits()))
            .unwrap_or_else(|| "SA missing".to_string());
        out.push_str(&format!(
            "{} -> {}: {} sa {} => {} sa {} [{}]\n",
            c.flow.src, c.flow.dst, c.outbound_instance, c.outbound_sa, c.inbound_instance, c.inbound_sa, mask
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::model::Config;
    use super::super::topology::testing::item;
    use super::*;
    use std::sync::Arc;

    fn sa(index: u32, spi: u32, crypto: &str, integ: &str) -> SecurityAssociation {
        SecurityAssociation {
            index,
            spi,
            crypto_key: crypto.into(),
            integ_key: integ.into(),
            ..Default::default()
        }
    }

    fn sp(sa_index: u32, outbound: bool, local: &str, remote: &str) -> SecurityPolicy {
        SecurityPolicy {
            sa_index,
            is_outbound: outbound,
            local_addr_start: local.into(),
            remote_addr_start: remote.into(),
            ..Default::default()
        }
    }

    fn instance(id: &str, sas: Vec<SecurityAssociation>, sps: Vec<SecurityPolicy>) -> InstanceConfig {
        InstanceConfig {
            instance: id.into(),
            config: Arc::new(Config {
                ipsec_sas: sas.into_iter().map(|s| item("sa", s)).collect(),
                ipsec_sps: sps.into_iter().map(|s| item("sp", s)).collect(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_mask_bits() {
        let a = sa(1, 100, "k1", "i1");
        assert_eq!(MatchMask::compare(&a, &a).bits(), 0b111);
        assert_eq!(MatchMask::compare(&a, &sa(2, 100, "k2", "i1")).bits(), 0b101);
        assert_eq!(MatchMask::compare(&a, &sa(2, 101, "k1", "i2")).bits(), 0b010);
        assert_eq!(
            MatchMask::compare(&a, &sa(2, 100, "x", "y")).to_string(),
            "spi/-/-"
        );
    }

    #[test]
    fn test_correlate_tunnel_pair() {
        let a = instance(
            "a",
            vec![sa(1, 1000, "ck", "ik"), sa(2, 1001, "ck2", "ik2")],
            vec![sp(1, true, "10.0.0.1", "10.0.0.2"), sp(2, false, "10.0.0.1", "10.0.0.2")],
        );
        let b = instance(
            "b",
            vec![sa(10, 1000, "ck", "other"), sa(11, 1001, "ck2", "ik2")],
            vec![sp(10, false, "10.0.0.2", "10.0.0.1"), sp(11, true, "10.0.0.2", "10.0.0.1")],
        );

        let result = correlate(&[a, b]);
        assert_eq!(result.len(), 2);

        let a_to_b = result.iter().find(|c| c.outbound_instance == "a").unwrap();
        assert_eq!(a_to_b.flow.src, "10.0.0.1");
        assert_eq!(a_to_b.inbound_sa, 10);
        assert_eq!(a_to_b.mask.unwrap().bits(), MatchMask::SPI | MatchMask::CRYPTO_KEY);

        let b_to_a = result.iter().find(|c| c.outbound_instance == "b").unwrap();
        assert!(b_to_a.mask.unwrap().is_full());
    }

    #[test]
    fn test_missing_sa_and_empty_maps() {
        let a = instance("a", vec![], vec![sp(5, true, "1.1.1.1", "2.2.2.2")]);
        let b = instance("b", vec![sa(6, 1, "", "")], vec![sp(6, false, "2.2.2.2", "1.1.1.1")]);
        let result = correlate(&[a.clone(), b]);
        assert_eq!(result.len(), 1);
        assert!(result[0].mask.is_none());
        assert!(report(&result).contains("SA missing"));

        let only_outbound = correlate(&[a]);
        assert!(only_outbound.is_empty());
        assert_eq!(report(&only_outbound), "no IPsec correlations found\n");
    }
}
