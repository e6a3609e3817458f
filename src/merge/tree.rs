use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::error::SpyctlError;
use crate::policy::net::PortProto;
use crate::policy::process::{ProcessNode, validate_forest};

/// Mapping from (source forest index, original id) to the canonical id
/// assigned in the merged forest. Threaded into the network-rule merge to
/// re-key process references.
#[derive(Debug, Default)]
pub struct IdMap {
    map: HashMap<(usize, String), String>,
}

impl IdMap {
    pub fn remap(&self, forest: usize, old_id: &str) -> Option<&str> {
        self.map.get(&(forest, old_id.to_string())).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn record(&mut self, forest: usize, old_id: String, new_id: String) {
        self.map.insert((forest, old_id), new_id);
    }
}

/// Merge any number of process forests into one forest representing the
/// union of their allowed behavior.
///
/// Nodes are matched by name at each tree level: roots against roots,
/// children among the siblings of their matched parent. Matched nodes
/// union their `exe`, `euser` and `listeningSockets` sets; unmatched
/// nodes are appended after the existing siblings. A final pre-order
/// pass assigns every node a canonical `name_index` id with a
/// document-wide per-name counter, so merging a merged forest with
/// itself reproduces identical ids.
pub fn merge_trees(forests: &[&[ProcessNode]]) -> Result<(Vec<ProcessNode>, IdMap), SpyctlError> {
    for forest in forests {
        validate_forest(forest)?;
    }
    let mut roots: Vec<BuildNode> = Vec::new();
    let no_eusers = BTreeSet::new();
    for (forest_idx, forest) in forests.iter().enumerate() {
        for node in *forest {
            merge_into_siblings(&mut roots, forest_idx, node, &no_eusers);
        }
    }
    let mut id_map = IdMap::default();
    let mut counters: HashMap<String, u32> = HashMap::new();
    let merged: Vec<ProcessNode> = roots
        .into_iter()
        .map(|root| finalize(root, None, &mut counters, &mut id_map))
        .collect();
    debug!(
        "merged {} forests into {} roots ({} id mappings)",
        forests.len(),
        merged.len(),
        id_map.len()
    );
    Ok((merged, id_map))
}

/// Intermediate node with set-typed fields and the source ids that
/// contributed to it.
struct BuildNode {
    name: String,
    exe: BTreeSet<String>,
    euser: BTreeSet<String>,
    listening_sockets: Vec<PortProto>,
    children: Vec<BuildNode>,
    sources: Vec<(usize, String)>,
}

fn merge_into_siblings(
    siblings: &mut Vec<BuildNode>,
    forest_idx: usize,
    node: &ProcessNode,
    inherited_eusers: &BTreeSet<String>,
) {
    // Children without their own euser field inherit the parent's set.
    let eusers: BTreeSet<String> = match &node.euser {
        Some(own) if !own.is_empty() => own.iter().cloned().collect(),
        _ => inherited_eusers.clone(),
    };
    let target = match siblings.iter_mut().position(|b| b.name == node.name) {
        Some(pos) => &mut siblings[pos],
        None => {
            siblings.push(BuildNode {
                name: node.name.clone(),
                exe: BTreeSet::new(),
                euser: BTreeSet::new(),
                listening_sockets: Vec::new(),
                children: Vec::new(),
                sources: Vec::new(),
            });
            siblings.last_mut().expect("just pushed")
        }
    };
    target.exe.extend(node.exe.iter().cloned());
    target.euser.extend(eusers.iter().cloned());
    for sock in &node.listening_sockets {
        if !target.listening_sockets.contains(sock) {
            target.listening_sockets.push(sock.clone());
        }
    }
    target.sources.push((forest_idx, node.id.clone()));
    for child in &node.children {
        merge_into_siblings(&mut target.children, forest_idx, child, &eusers);
    }
}

fn finalize(
    node: BuildNode,
    parent_eusers: Option<&BTreeSet<String>>,
    counters: &mut HashMap<String, u32>,
    id_map: &mut IdMap,
) -> ProcessNode {
    let index = counters.entry(node.name.clone()).or_insert(0);
    let id = format!("{}_{}", node.name, index);
    *index += 1;
    for (forest_idx, old_id) in node.sources {
        id_map.record(forest_idx, old_id, id.clone());
    }
    // euser is dropped on the wire when it matches the parent's set
    let euser = match parent_eusers {
        Some(parent) if *parent == node.euser => None,
        _ => Some(node.euser.iter().cloned().collect()),
    };
    let mut listening_sockets = node.listening_sockets;
    listening_sockets.sort();
    let children = node
        .children
        .into_iter()
        .map(|child| finalize(child, Some(&node.euser), counters, id_map))
        .collect();
    ProcessNode {
        name: node.name,
        exe: node.exe.into_iter().collect(),
        id,
        euser,
        listening_sockets,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::net::Protocol;

    fn leaf(name: &str, id: &str, exe: &[&str], euser: Option<&[&str]>) -> ProcessNode {
        ProcessNode {
            name: name.to_string(),
            exe: exe.iter().map(|s| s.to_string()).collect(),
            id: id.to_string(),
            euser: euser.map(|e| e.iter().map(|s| s.to_string()).collect()),
            listening_sockets: vec![],
            children: vec![],
        }
    }

    fn with_children(mut node: ProcessNode, children: Vec<ProcessNode>) -> ProcessNode {
        node.children = children;
        node
    }

    fn dev_forest() -> Vec<ProcessNode> {
        vec![with_children(
            leaf(
                "python",
                "python_0",
                &["/usr/local/bin/python3.6"],
                Some(&["root"]),
            ),
            vec![
                with_children(
                    leaf("sh", "sh_1", &["/bin/dash"], None),
                    vec![leaf("uname", "uname_2", &["/bin/uname"], None)],
                ),
            ],
        )]
    }

    fn prod_forest() -> Vec<ProcessNode> {
        vec![with_children(
            leaf(
                "python",
                "python_7",
                &["/usr/local/bin/python3.7"],
                Some(&["root", "web"]),
            ),
            vec![
                with_children(
                    leaf("sh", "sh_8", &["/bin/bash"], None),
                    vec![leaf("uname", "uname_9", &["/bin/uname"], None)],
                ),
            ],
        )]
    }

    #[test]
    fn merges_same_named_roots_and_unions_exes() {
        let (dev, prod) = (dev_forest(), prod_forest());
        let (merged, id_map) = merge_trees(&[&dev, &prod]).unwrap();
        assert_eq!(merged.len(), 1, "one python root expected");
        let python = &merged[0];
        assert_eq!(python.id, "python_0");
        assert_eq!(
            python.exe,
            vec!["/usr/local/bin/python3.6", "/usr/local/bin/python3.7"]
        );
        assert_eq!(
            python.euser.as_deref().unwrap(),
            ["root", "web"],
            "eusers union across inputs"
        );
        // both source pythons are re-keyed to the surviving id
        assert_eq!(id_map.remap(0, "python_0").unwrap(), "python_0");
        assert_eq!(id_map.remap(1, "python_7").unwrap(), "python_0");
        assert_eq!(id_map.remap(1, "sh_8").unwrap(), "sh_0");
        assert_eq!(id_map.remap(1, "uname_9").unwrap(), "uname_0");
    }

    #[test]
    fn merge_with_self_is_idempotent() {
        let dev = dev_forest();
        let (once, _) = merge_trees(&[&dev]).unwrap();
        let (twice, _) = merge_trees(&[&once, &once]).unwrap();
        assert_eq!(once, twice, "merging a merged forest with itself is a no-op");
    }

    #[test]
    fn commutative_up_to_id_renaming() {
        let a = dev_forest();
        let mut b = prod_forest();
        b.push(with_children(
            leaf("nginx", "nginx_0", &["/usr/sbin/nginx"], Some(&["www"])),
            vec![],
        ));
        let (ab, _) = merge_trees(&[&a, &b]).unwrap();
        let (ba, _) = merge_trees(&[&b, &a]).unwrap();
        // compare identity content only, sibling order and ids may differ
        fn summarize(forest: &[ProcessNode], out: &mut Vec<(String, Vec<String>)>) {
            for n in forest {
                out.push((n.name.clone(), n.exe.clone()));
                summarize(&n.children, out);
            }
        }
        let (mut sa, mut sb) = (Vec::new(), Vec::new());
        summarize(&ab, &mut sa);
        summarize(&ba, &mut sb);
        sa.sort();
        sb.sort();
        assert_eq!(sa, sb);
    }

    #[test]
    fn unmatched_roots_append_after_existing() {
        let a = dev_forest();
        let b = vec![with_children(
            leaf("nginx", "nginx_0", &["/usr/sbin/nginx"], Some(&["www"])),
            vec![],
        )];
        let (merged, _) = merge_trees(&[&a, &b]).unwrap();
        assert_eq!(merged[0].name, "python");
        assert_eq!(merged[1].name, "nginx");
        assert_eq!(merged[1].id, "nginx_0");
    }

    #[test]
    fn merging_with_empty_forest_is_identity_modulo_ids() {
        let a = dev_forest();
        let empty: Vec<ProcessNode> = vec![];
        let (merged, _) = merge_trees(&[&a, &empty]).unwrap();
        let (alone, _) = merge_trees(&[&a]).unwrap();
        assert_eq!(merged, alone);
    }

    #[test]
    fn same_name_different_exe_still_merge() {
        let a = vec![leaf("worker", "worker_0", &["/opt/a"], Some(&["root"]))];
        let b = vec![leaf("worker", "worker_1", &["/opt/b"], Some(&["root"]))];
        let (merged, _) = merge_trees(&[&a, &b]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].exe, vec!["/opt/a", "/opt/b"]);
    }

    #[test]
    fn same_name_nodes_in_different_subtrees_get_distinct_ids() {
        let a = vec![
            with_children(
                leaf("python", "python_0", &["/usr/bin/python"], Some(&["root"])),
                vec![leaf("sh", "sh_1", &["/bin/sh"], None)],
            ),
            with_children(
                leaf("bash", "bash_2", &["/bin/bash"], Some(&["root"])),
                vec![leaf("sh", "sh_3", &["/bin/sh"], None)],
            ),
        ];
        let (merged, _) = merge_trees(&[&a]).unwrap();
        assert_eq!(merged[0].children[0].id, "sh_0");
        assert_eq!(merged[1].children[0].id, "sh_1");
    }

    #[test]
    fn child_eusers_inherit_and_collapse_on_output() {
        let (merged, _) = merge_trees(&[&dev_forest()]).unwrap();
        let sh = &merged[0].children[0];
        assert!(
            sh.euser.is_none(),
            "inherited eusers are not repeated on the wire"
        );
    }

    #[test]
    fn listening_sockets_dedup_exactly() {
        let sock = PortProto {
            protocol: Protocol::TCP,
            port: 5000,
            end_port: None,
        };
        let mut a = leaf("python", "python_0", &["/usr/bin/python"], Some(&["root"]));
        a.listening_sockets = vec![sock.clone()];
        let mut b = leaf("python", "python_1", &["/usr/bin/python"], Some(&["root"]));
        b.listening_sockets = vec![sock.clone()];
        let (merged, _) = merge_trees(&[&[a][..], &[b][..]]).unwrap();
        assert_eq!(merged[0].listening_sockets, vec![sock]);
    }

    #[test]
    fn invalid_forest_aborts_merge() {
        let bad = vec![leaf("python", "python_0", &["/usr/bin/python"], None)];
        assert!(matches!(
            merge_trees(&[&bad]),
            Err(SpyctlError::Structural { .. })
        ));
    }
}
