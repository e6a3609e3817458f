use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::error::SpyctlError;
use crate::merge::tree::IdMap;
use crate::policy::net::{
    Cidr, Direction, IpBlock, NetworkPolicy, NetworkRule, PeerSelector, PortProto,
};

/// Union ingress/egress rules from multiple policies.
///
/// Process id references are re-keyed through `id_map` (indexed by the
/// rule set's position, which must line up with the forest order passed
/// to `merge_trees`). Rules grouping to the same (process set, port set)
/// pair union their peer selectors with exact, string-normalized dedup;
/// overlapping but non-identical CIDRs stay separate. A reference with
/// no id-map entry aborts the merge.
pub fn merge_network(
    rule_sets: &[&NetworkPolicy],
    id_map: &IdMap,
) -> Result<NetworkPolicy, SpyctlError> {
    let merged = NetworkPolicy {
        ingress: merge_direction(rule_sets, id_map, Direction::Ingress)?,
        egress: merge_direction(rule_sets, id_map, Direction::Egress)?,
    };
    debug!(
        "merged network policy: {} ingress, {} egress rules",
        merged.ingress.len(),
        merged.egress.len()
    );
    Ok(merged)
}

/// Group key: (remapped process ids, port set). BTreeMap iteration gives
/// the deterministic output order (first process id, then first port).
type GroupKey = (Vec<String>, Vec<PortProto>);

#[derive(Default)]
struct PeerAccum {
    /// Normalized (cidr, except) pairs; the block identity for dedup.
    blocks: BTreeSet<(Cidr, Vec<Cidr>)>,
    domains: BTreeSet<String>,
}

fn merge_direction(
    rule_sets: &[&NetworkPolicy],
    id_map: &IdMap,
    direction: Direction,
) -> Result<Vec<NetworkRule>, SpyctlError> {
    let mut groups: BTreeMap<GroupKey, PeerAccum> = BTreeMap::new();
    for (set_idx, rule_set) in rule_sets.iter().enumerate() {
        for rule in rule_set.rules(direction) {
            let peers = rule.peers(direction)?;
            let key = group_key(rule, set_idx, id_map, direction)?;
            let accum = groups.entry(key).or_default();
            for peer in peers {
                match peer {
                    PeerSelector::IpBlock(block) => {
                        accum.blocks.insert(normalize_block(block, direction)?);
                    }
                    PeerSelector::DnsSelector(names) => {
                        accum.domains.extend(names.iter().cloned());
                    }
                }
            }
        }
    }
    let mut rules = Vec::with_capacity(groups.len());
    for ((processes, ports), accum) in groups {
        // a rule whose peer list collapsed to nothing allows nothing
        if accum.blocks.is_empty() && accum.domains.is_empty() {
            continue;
        }
        let mut peers: Vec<PeerSelector> = accum
            .domains
            .into_iter()
            .map(|name| PeerSelector::DnsSelector(vec![name]))
            .collect();
        peers.extend(accum.blocks.into_iter().map(|(cidr, except)| {
            PeerSelector::IpBlock(IpBlock {
                cidr: cidr.normalized(),
                except: if except.is_empty() {
                    None
                } else {
                    Some(except.iter().map(Cidr::normalized).collect())
                },
            })
        }));
        let (from, to) = match direction {
            Direction::Ingress => (Some(peers), None),
            Direction::Egress => (None, Some(peers)),
        };
        rules.push(NetworkRule {
            from,
            to,
            processes,
            ports,
        });
    }
    Ok(rules)
}

fn group_key(
    rule: &NetworkRule,
    set_idx: usize,
    id_map: &IdMap,
    direction: Direction,
) -> Result<GroupKey, SpyctlError> {
    let mut processes = BTreeSet::new();
    for old_id in &rule.processes {
        let new_id =
            id_map
                .remap(set_idx, old_id)
                .ok_or_else(|| SpyctlError::DanglingReference {
                    process_id: old_id.clone(),
                })?;
        processes.insert(new_id.to_string());
    }
    let mut ports = BTreeSet::new();
    for port in &rule.ports {
        port.validate(&format!("networkPolicy.{}.ports", direction.as_str()))?;
        ports.insert(port.clone());
    }
    Ok((
        processes.into_iter().collect(),
        ports.into_iter().collect(),
    ))
}

/// Parse and normalize an ipBlock, validating the cidr, every except
/// entry, and that each except network lies inside the outer cidr.
fn normalize_block(
    block: &IpBlock,
    direction: Direction,
) -> Result<(Cidr, Vec<Cidr>), SpyctlError> {
    let field = format!(
        "networkPolicy.{}.{}.ipBlock",
        direction.as_str(),
        direction.peer_field()
    );
    let cidr = Cidr::parse(&block.cidr)
        .map_err(|reason| SpyctlError::validation(format!("{field}.cidr"), &block.cidr, reason))?;
    let mut except = BTreeSet::new();
    for raw in block.except.iter().flatten() {
        let net = Cidr::parse(raw)
            .map_err(|reason| SpyctlError::validation(format!("{field}.except"), raw, reason))?;
        if !cidr.contains(&net) {
            return Err(SpyctlError::validation(
                format!("{field}.except"),
                raw,
                format!("except network must lie within {}", block.cidr),
            ));
        }
        except.insert(net);
    }
    Ok((cidr, except.into_iter().collect()))
}
