use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SpyctlError;
use crate::policy::net::PortProto;

/// One node in a process-tree forest. Field order matches the wire format
/// stored by the API (`name`, `exe`, `id`, `euser`, `listeningSockets`,
/// `children`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    pub name: String,
    pub exe: Vec<String>,
    pub id: String,
    /// Effective users. Omitted on the wire for a child whose set equals
    /// its parent's; the merge engine resolves inheritance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub euser: Option<Vec<String>>,
    #[serde(
        rename = "listeningSockets",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub listening_sockets: Vec<PortProto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProcessNode>,
}

/// Validate one process forest before merging.
///
/// Checks that every node carries a non-empty name and id, that ids are
/// unique within the document, and that every root has a non-empty
/// effective user set. Failures surface the offending node path.
pub fn validate_forest(forest: &[ProcessNode]) -> Result<(), SpyctlError> {
    let mut seen_ids = HashSet::new();
    for root in forest {
        if root.euser.as_ref().is_none_or(|e| e.is_empty()) {
            return Err(SpyctlError::structural(
                node_path("", root),
                "root process has no effective users",
            ));
        }
        validate_node(root, "", &mut seen_ids)?;
    }
    Ok(())
}

fn validate_node(
    node: &ProcessNode,
    parent_path: &str,
    seen_ids: &mut HashSet<String>,
) -> Result<(), SpyctlError> {
    let path = node_path(parent_path, node);
    if node.name.is_empty() {
        return Err(SpyctlError::structural(path, "node is missing a name"));
    }
    if node.id.is_empty() {
        return Err(SpyctlError::structural(path, "node is missing an id"));
    }
    if !seen_ids.insert(node.id.clone()) {
        return Err(SpyctlError::structural(
            path,
            format!("duplicate process id '{}'", node.id),
        ));
    }
    for child in &node.children {
        validate_node(child, &path, seen_ids)?;
    }
    Ok(())
}

fn node_path(parent_path: &str, node: &ProcessNode) -> String {
    let label = if node.id.is_empty() {
        &node.name
    } else {
        &node.id
    };
    if parent_path.is_empty() {
        label.to_string()
    } else {
        format!("{parent_path}/{label}")
    }
}
