use std::collections::HashMap;

use log::debug;
use serde_json::Value;

use crate::error::SpyctlError;
use crate::merge::network::merge_network;
use crate::merge::selector::{merge_container_selectors, merge_label_selectors};
use crate::merge::tree::merge_trees;
use crate::policy::model::{Policy, PolicySpec};
use crate::policy::net::NetworkPolicy;
use crate::policy::process::ProcessNode;

const LATEST_TIMESTAMP_FIELD: &str = "latestTimestamp";

/// Merge two or more policy documents into one whose allowed behavior is
/// a superset of every input's.
///
/// The first document is the base: metadata, response and uninterpreted
/// spec fields pass through from it (except `latestTimestamp`, which
/// takes the greatest value observed). Process forests, network rules
/// and selectors are merged per the engine rules; the result is a new
/// document, inputs are never mutated.
pub fn merge_policies(policies: &[Policy]) -> Result<Policy, SpyctlError> {
    let Some(base) = policies.first() else {
        return Err(SpyctlError::validation(
            "policies",
            "",
            "at least one policy document is required",
        ));
    };
    for policy in policies {
        policy.validate()?;
    }
    debug!("merging {} policy documents", policies.len());

    let forests: Vec<&[ProcessNode]> = policies
        .iter()
        .map(|p| p.spec.process_policy.as_slice())
        .collect();
    let (process_policy, id_map) = merge_trees(&forests)?;

    let rule_sets: Vec<&NetworkPolicy> =
        policies.iter().map(|p| &p.spec.network_policy).collect();
    let network_policy = merge_network(&rule_sets, &id_map)?;
    check_rule_references(&process_policy, &network_policy)?;

    let mut container_selector = base.spec.container_selector.clone();
    let mut pod_selector = base.spec.pod_selector.clone();
    let mut namespace_selector = base.spec.namespace_selector.clone();
    for policy in &policies[1..] {
        container_selector = merge_container_selectors(
            container_selector.as_ref(),
            policy.spec.container_selector.as_ref(),
        );
        pod_selector =
            merge_label_selectors(pod_selector.as_ref(), policy.spec.pod_selector.as_ref());
        namespace_selector = merge_label_selectors(
            namespace_selector.as_ref(),
            policy.spec.namespace_selector.as_ref(),
        );
    }

    let mut metadata = base.metadata.clone();
    if let Some(latest) = greatest_timestamp(policies) {
        metadata.insert(LATEST_TIMESTAMP_FIELD.to_string(), latest);
    }

    Ok(Policy {
        api_version: base.api_version.clone(),
        kind: base.kind.clone(),
        metadata,
        spec: PolicySpec {
            container_selector,
            pod_selector,
            namespace_selector,
            process_policy,
            network_policy,
            response: base.spec.response.clone(),
            extra: base.spec.extra.clone(),
        },
    })
}

/// Every process id referenced by a merged rule must name a node in the
/// merged forest, and that node must carry a non-empty exe list.
fn check_rule_references(
    forest: &[ProcessNode],
    network: &NetworkPolicy,
) -> Result<(), SpyctlError> {
    let mut exe_by_id: HashMap<&str, bool> = HashMap::new();
    fn walk<'a>(nodes: &'a [ProcessNode], out: &mut HashMap<&'a str, bool>) {
        for node in nodes {
            out.insert(&node.id, !node.exe.is_empty());
            walk(&node.children, out);
        }
    }
    walk(forest, &mut exe_by_id);
    for rule in network.ingress.iter().chain(&network.egress) {
        for id in &rule.processes {
            match exe_by_id.get(id.as_str()) {
                None => {
                    return Err(SpyctlError::DanglingReference {
                        process_id: id.clone(),
                    });
                }
                Some(false) => {
                    return Err(SpyctlError::validation(
                        "networkPolicy.processes",
                        id,
                        "referenced process has an empty exe list",
                    ));
                }
                Some(true) => {}
            }
        }
    }
    Ok(())
}

/// Greatest `latestTimestamp` across the inputs, comparing numbers
/// numerically and strings lexically. Mixed or absent values keep the
/// first seen.
fn greatest_timestamp(policies: &[Policy]) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for policy in policies {
        let Some(value) = policy.metadata.get(LATEST_TIMESTAMP_FIELD) else {
            continue;
        };
        best = match best {
            None => Some(value),
            Some(current) => {
                let newer = match (current, value) {
                    (Value::Number(a), Value::Number(b)) => {
                        b.as_f64().unwrap_or(f64::MIN) > a.as_f64().unwrap_or(f64::MIN)
                    }
                    (Value::String(a), Value::String(b)) => b > a,
                    _ => false,
                };
                if newer { Some(value) } else { Some(current) }
            }
        };
    }
    best.cloned()
}
