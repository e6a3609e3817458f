use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::error::SpyctlError;
use crate::policy::model::Policy;
use crate::policy::net::{Direction, NetworkPolicy, PeerSelector, PortProto};
use crate::policy::process::ProcessNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One process-tree delta, keyed by name path (the merge identity).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessChange {
    pub path: String,
    pub diff: ChangeKind,
    #[serde(rename = "exeAdded", skip_serializing_if = "Vec::is_empty")]
    pub exe_added: Vec<String>,
    #[serde(rename = "exeRemoved", skip_serializing_if = "Vec::is_empty")]
    pub exe_removed: Vec<String>,
    #[serde(rename = "euserAdded", skip_serializing_if = "Vec::is_empty")]
    pub euser_added: Vec<String>,
    #[serde(rename = "euserRemoved", skip_serializing_if = "Vec::is_empty")]
    pub euser_removed: Vec<String>,
}

/// One atomic network delta: a single (peer, port, process) unit of a
/// rule, in one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleChange {
    pub direction: String,
    pub diff: ChangeKind,
    pub peer: PeerSelector,
    pub port: PortProto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct DiffReport {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<RuleChange>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty() && self.network.is_empty()
    }
}

/// Compare two policies using the same identity rules as the merge:
/// process nodes match by name path, network rules are exploded into
/// atomic (direction, peer, port, process) units and set-compared.
/// Reports what `other` adds, removes or changes relative to `original`.
pub fn diff_policies(original: &Policy, other: &Policy) -> Result<DiffReport, SpyctlError> {
    original.validate()?;
    other.validate()?;
    let mut report = DiffReport::default();
    diff_forest(
        &original.spec.process_policy,
        &other.spec.process_policy,
        "",
        &mut report.processes,
    );
    diff_network(
        &original.spec.network_policy,
        &other.spec.network_policy,
        &mut report.network,
    )?;
    Ok(report)
}

fn diff_forest(
    original: &[ProcessNode],
    other: &[ProcessNode],
    parent_path: &str,
    out: &mut Vec<ProcessChange>,
) {
    for other_node in other {
        let path = join_path(parent_path, &other_node.name);
        match original.iter().find(|n| n.name == other_node.name) {
            None => mark_subtree(other_node, parent_path, ChangeKind::Added, out),
            Some(orig_node) => {
                let (exe_added, exe_removed) = set_delta(&orig_node.exe, &other_node.exe);
                let (euser_added, euser_removed) = set_delta(
                    orig_node.euser.as_deref().unwrap_or_default(),
                    other_node.euser.as_deref().unwrap_or_default(),
                );
                let socks_changed = !same_socket_set(
                    &orig_node.listening_sockets,
                    &other_node.listening_sockets,
                );
                if !exe_added.is_empty()
                    || !exe_removed.is_empty()
                    || !euser_added.is_empty()
                    || !euser_removed.is_empty()
                    || socks_changed
                {
                    out.push(ProcessChange {
                        path: path.clone(),
                        diff: ChangeKind::Changed,
                        exe_added,
                        exe_removed,
                        euser_added,
                        euser_removed,
                    });
                }
                diff_forest(&orig_node.children, &other_node.children, &path, out);
            }
        }
    }
    for orig_node in original {
        if !other.iter().any(|n| n.name == orig_node.name) {
            mark_subtree(orig_node, parent_path, ChangeKind::Removed, out);
        }
    }
}

fn mark_subtree(
    node: &ProcessNode,
    parent_path: &str,
    kind: ChangeKind,
    out: &mut Vec<ProcessChange>,
) {
    let path = join_path(parent_path, &node.name);
    out.push(ProcessChange {
        path: path.clone(),
        diff: kind,
        exe_added: vec![],
        exe_removed: vec![],
        euser_added: vec![],
        euser_removed: vec![],
    });
    for child in &node.children {
        mark_subtree(child, &path, kind, out);
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn set_delta(original: &[String], other: &[String]) -> (Vec<String>, Vec<String>) {
    let orig: BTreeSet<&String> = original.iter().collect();
    let new: BTreeSet<&String> = other.iter().collect();
    let added = new.difference(&orig).map(|s| (*s).clone()).collect();
    let removed = orig.difference(&new).map(|s| (*s).clone()).collect();
    (added, removed)
}

fn same_socket_set(original: &[PortProto], other: &[PortProto]) -> bool {
    let a: BTreeSet<&PortProto> = original.iter().collect();
    let b: BTreeSet<&PortProto> = other.iter().collect();
    a == b
}

/// One rule exploded into its atomic allow units.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleAtom {
    direction: Direction,
    peer: PeerSelector,
    port: PortProto,
    process: Option<String>,
}

impl RuleAtom {
    fn sort_key(&self) -> (Direction, Option<String>, PortProto, String) {
        let peer = match &self.peer {
            PeerSelector::IpBlock(block) => block.cidr.clone(),
            PeerSelector::DnsSelector(names) => names.join(","),
        };
        (
            self.direction,
            self.process.clone(),
            self.port.clone(),
            peer,
        )
    }
}

fn diff_network(
    original: &NetworkPolicy,
    other: &NetworkPolicy,
    out: &mut Vec<RuleChange>,
) -> Result<(), SpyctlError> {
    let orig_atoms = atomize(original)?;
    let other_atoms = atomize(other)?;
    let mut changes: Vec<(ChangeKind, &RuleAtom)> = Vec::new();
    for atom in other_atoms.difference(&orig_atoms) {
        changes.push((ChangeKind::Added, atom));
    }
    for atom in orig_atoms.difference(&other_atoms) {
        changes.push((ChangeKind::Removed, atom));
    }
    changes.sort_by_key(|(kind, atom)| (atom.sort_key(), *kind == ChangeKind::Removed));
    out.extend(changes.into_iter().map(|(kind, atom)| RuleChange {
        direction: atom.direction.as_str().to_string(),
        diff: kind,
        peer: atom.peer.clone(),
        port: atom.port.clone(),
        process: atom.process.clone(),
    }));
    Ok(())
}

fn atomize(network: &NetworkPolicy) -> Result<HashSet<RuleAtom>, SpyctlError> {
    let mut atoms = HashSet::new();
    for direction in [Direction::Ingress, Direction::Egress] {
        for rule in network.rules(direction) {
            for peer in rule.peers(direction)? {
                // dnsSelector lists split into one atom per domain
                let peers: Vec<PeerSelector> = match peer {
                    PeerSelector::DnsSelector(names) => names
                        .iter()
                        .map(|n| PeerSelector::DnsSelector(vec![n.clone()]))
                        .collect(),
                    block => vec![block.clone()],
                };
                for peer in peers {
                    for port in &rule.ports {
                        if rule.processes.is_empty() {
                            atoms.insert(RuleAtom {
                                direction,
                                peer: peer.clone(),
                                port: port.clone(),
                                process: None,
                            });
                        } else {
                            for process in &rule.processes {
                                atoms.insert(RuleAtom {
                                    direction,
                                    peer: peer.clone(),
                                    port: port.clone(),
                                    process: Some(process.clone()),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(atoms)
}
