//! Node scoring for the `node_selector` placement algorithm used by flush
//! evacuation and initial domain placement (`mem`, `load`, `vcpus`, `vms`).
//!
//! Each selector is a single TOPSIS criterion: this reuses the multi-criteria
//! scoring machine from an HA resource scheduler even though there is only
//! ever one active criterion here, so adding a weighted combination later
//! (e.g. `mem+load`) does not require a new algorithm.

mod topsis;

use std::str::FromStr;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use topsis::{score_alternatives, TopsisCriteria, TopsisCriterion, TopsisMatrix};

/// Telemetry snapshot of one candidate node, as published under
/// `/nodes/<name>/memfree`, `/memused`, `/cpuload`, `/vcpualloc`,
/// `/runningdomains`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    pub name: String,
    pub mem_free: u64,
    pub mem_used: u64,
    pub cpu_load: f64,
    pub vcpu_alloc: u32,
    pub running_domains: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelector {
    Mem,
    Load,
    Vcpus,
    Vms,
}

impl FromStr for NodeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mem" => NodeSelector::Mem,
            "load" => NodeSelector::Load,
            "vcpus" => NodeSelector::Vcpus,
            "vms" => NodeSelector::Vms,
            other => anyhow::bail!("unknown node_selector '{other}'"),
        })
    }
}

impl NodeSelector {
    fn value(self, usage: &NodeUsage) -> f64 {
        match self {
            // higher mem_free is better: maximize.
            NodeSelector::Mem => usage.mem_free as f64,
            // lower load is better: minimize.
            NodeSelector::Load => usage.cpu_load,
            NodeSelector::Vcpus => usage.vcpu_alloc as f64,
            NodeSelector::Vms => usage.running_domains as f64,
        }
    }

    fn criteria(self) -> Result<TopsisCriteria<1>, Error> {
        let weight = match self {
            NodeSelector::Mem => 1.0,
            NodeSelector::Load | NodeSelector::Vcpus | NodeSelector::Vms => -1.0,
        };
        TopsisCriteria::new([TopsisCriterion::new(self.name().to_string(), weight)])
    }

    fn name(self) -> &'static str {
        match self {
            NodeSelector::Mem => "mem",
            NodeSelector::Load => "load",
            NodeSelector::Vcpus => "vcpus",
            NodeSelector::Vms => "vms",
        }
    }
}

/// Ranks `candidates` best-first according to `selector`. Callers are
/// expected to have already applied the `node_limit` restriction and
/// excluded self and non-`ready`/non-`run` nodes (spec: flush algorithm step
/// 2) before calling this; an empty `candidates` is not an error here, it is
/// the caller's job to treat "no eligible target" as a stall.
pub fn rank_nodes(candidates: &[NodeUsage], selector: NodeSelector) -> Result<Vec<String>, Error> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let criteria = selector.criteria().context("invalid node selector criteria")?;
    let matrix = TopsisMatrix::new(
        candidates
            .iter()
            .map(|usage| [selector.value(usage)])
            .collect(),
    )
    .context("failed to normalize node usage matrix")?;

    let scores = score_alternatives(&matrix, &criteria).context("failed to score candidate nodes")?;

    let mut ranked: Vec<(String, f64)> = candidates
        .iter()
        .zip(scores)
        .map(|(usage, score)| (usage.name.clone(), score))
        .collect();
    ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));

    Ok(ranked.into_iter().map(|(name, _)| name).collect())
}

/// Picks the single best target for a domain migration/placement decision.
/// `node_limit` restricts the candidate pool to these names when non-empty.
pub fn select_target<'a>(
    usages: &'a [NodeUsage],
    selector: NodeSelector,
    node_limit: &[String],
    exclude: &str,
) -> Result<Option<&'a str>, Error> {
    let filtered: Vec<NodeUsage> = usages
        .iter()
        .filter(|usage| usage.name != exclude)
        .filter(|usage| node_limit.is_empty() || node_limit.iter().any(|name| name == &usage.name))
        .cloned()
        .collect();

    let ranked = rank_nodes(&filtered, selector)?;
    Ok(ranked
        .into_iter()
        .next()
        .and_then(|name| usages.iter().find(|usage| usage.name == name))
        .map(|usage| usage.name.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(name: &str, mem_free: u64, cpu_load: f64, vcpu_alloc: u32, running_domains: u32) -> NodeUsage {
        NodeUsage {
            name: name.to_string(),
            mem_free,
            mem_used: 0,
            cpu_load,
            vcpu_alloc,
            running_domains,
        }
    }

    #[test]
    fn mem_selector_prefers_most_free_memory() {
        let nodes = vec![
            usage("hv1", 1_000, 0.1, 2, 1),
            usage("hv2", 8_000, 0.1, 2, 1),
            usage("hv3", 4_000, 0.1, 2, 1),
        ];
        let ranked = rank_nodes(&nodes, NodeSelector::Mem).unwrap();
        assert_eq!(ranked[0], "hv2");
    }

    #[test]
    fn load_selector_prefers_lowest_load() {
        let nodes = vec![
            usage("hv1", 1_000, 0.9, 2, 1),
            usage("hv2", 1_000, 0.1, 2, 1),
        ];
        let ranked = rank_nodes(&nodes, NodeSelector::Load).unwrap();
        assert_eq!(ranked[0], "hv2");
    }

    #[test]
    fn select_target_excludes_self_and_respects_node_limit() {
        let nodes = vec![
            usage("hv1", 9_000, 0.1, 2, 1),
            usage("hv2", 1_000, 0.1, 2, 1),
            usage("hv3", 5_000, 0.1, 2, 1),
        ];
        let target = select_target(
            &nodes,
            NodeSelector::Mem,
            &["hv2".to_string(), "hv3".to_string()],
            "hv1",
        )
        .unwrap();
        assert_eq!(target, Some("hv3"));
    }

    #[test]
    fn selector_parses_from_str() {
        assert_eq!("mem".parse::<NodeSelector>().unwrap(), NodeSelector::Mem);
        assert!("bogus".parse::<NodeSelector>().is_err());
    }
}
