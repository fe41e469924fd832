//! The dependency graph: tables as nodes, foreign keys as edges.
//!
//! Nodes are canonical `schema.table` strings. Parallel edges (a table
//! referencing the same parent through two renamed foreign keys) are kept
//! as separate entries in the adjacency lists, so no alias nodes are
//! needed. The graph is rebuilt from introspection and must be acyclic.

use std::collections::{HashMap, HashSet};

use quarry_core::error::{Error, Result};
use quarry_core::identifier::{master_of, QualifiedName};
use quarry_dialect::ForeignKeyInfo;

/// Properties of one foreign key edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeProps {
    /// `child attribute -> parent attribute`, in constraint order.
    pub attr_map: Vec<(String, String)>,
    /// The FK columns lie entirely within the child's primary key.
    pub primary: bool,
    /// At least one attribute is renamed across the edge.
    pub aliased: bool,
    /// The FK does not cover the child's whole primary key.
    pub multi: bool,
}

/// DAG over fully qualified table names.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    loaded: bool,
    primary_keys: HashMap<String, HashSet<String>>,
    /// parent -> [(child, props)]
    out_edges: HashMap<String, Vec<(String, EdgeProps)>>,
    /// child -> [(parent, props)]
    in_edges: HashMap<String, Vec<(String, EdgeProps)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn invalidate(&mut self) {
        self.loaded = false;
    }

    /// Rebuilds from introspected primary keys and foreign keys, asserting
    /// acyclicity. Cross-schema constraints may be reported twice (once per
    /// schema scan) and are deduplicated.
    pub fn rebuild(
        &mut self,
        nodes: Vec<(String, HashSet<String>)>,
        foreign_keys: Vec<ForeignKeyInfo>,
    ) -> Result<()> {
        self.primary_keys = nodes.into_iter().collect();
        self.out_edges = HashMap::new();
        self.in_edges = HashMap::new();

        let mut seen: HashSet<(String, String)> = HashSet::new();
        for fk in foreign_keys {
            let child = fk.child.to_string();
            let parent = fk.parent.to_string();
            if !seen.insert((fk.constraint.clone(), child.clone())) {
                continue;
            }
            let child_pk = self.primary_keys.get(&child).cloned().unwrap_or_default();
            let fk_attrs: HashSet<&String> = fk.attr_map.iter().map(|(c, _)| c).collect();
            let props = EdgeProps {
                primary: fk_attrs.iter().all(|a| child_pk.contains(a.as_str())),
                aliased: fk.attr_map.iter().any(|(c, p)| c != p),
                multi: fk_attrs.len() != child_pk.len()
                    || !fk_attrs.iter().all(|a| child_pk.contains(a.as_str())),
                attr_map: fk.attr_map,
            };
            self.primary_keys.entry(parent.clone()).or_default();
            self.primary_keys.entry(child.clone()).or_default();
            self.out_edges
                .entry(parent.clone())
                .or_default()
                .push((child.clone(), props.clone()));
            self.in_edges.entry(child).or_default().push((parent, props));
        }

        self.assert_acyclic()?;
        self.loaded = true;
        Ok(())
    }

    fn assert_acyclic(&self) -> Result<()> {
        // Kahn's algorithm; leftovers mean a cycle
        let mut in_degree: HashMap<&str, usize> = self
            .primary_keys
            .keys()
            .map(|n| (n.as_str(), 0))
            .collect();
        for (child, parents) in &self.in_edges {
            *in_degree.entry(child.as_str()).or_insert(0) +=
                parents.iter().map(|(p, _)| p).collect::<HashSet<_>>().len();
        }
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(node) = ready.pop() {
            visited += 1;
            if let Some(children) = self.out_edges.get(node) {
                let unique: HashSet<&str> = children.iter().map(|(c, _)| c.as_str()).collect();
                for child in unique {
                    let degree = in_degree.get_mut(child).expect("known node");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(child);
                    }
                }
            }
        }
        if visited != in_degree.len() {
            return Err(Error::invalid(
                "the dependency graph is cyclic; only acyclic dependencies are supported",
            ));
        }
        Ok(())
    }

    /// The primary key of a node, when known.
    pub fn primary_key(&self, table: &str) -> Option<&HashSet<String>> {
        self.primary_keys.get(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.primary_keys.contains_key(table)
    }

    /// Tables this table references. With `primary` set, only edges whose
    /// FK lies within (true) or partially outside (false) the primary key.
    pub fn parents(&self, table: &str, primary: Option<bool>) -> Vec<(String, EdgeProps)> {
        self.in_edges
            .get(table)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(_, props)| primary.is_none_or(|p| props.primary == p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tables referencing this table, with the same `primary` filter.
    pub fn children(&self, table: &str, primary: Option<bool>) -> Vec<(String, EdgeProps)> {
        self.out_edges
            .get(table)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(_, props)| primary.is_none_or(|p| props.primary == p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topological order over all tables, with two part-table guarantees:
    /// a master is ordered after all of its parts' outside dependencies,
    /// and every part is placed immediately after its master.
    pub fn topo_sort(&self) -> Vec<String> {
        self.topo_sort_subset(None)
    }

    fn topo_sort_subset(&self, subset: Option<&HashSet<String>>) -> Vec<String> {
        let in_subset =
            |n: &str| subset.is_none_or(|s| s.contains(n));

        // adjacency with deduplicated edges, plus part->master lifting
        let mut nodes: Vec<&str> = self
            .primary_keys
            .keys()
            .map(String::as_str)
            .filter(|n| in_subset(n))
            .collect();
        nodes.sort();

        let mut successors: HashMap<&str, HashSet<String>> =
            nodes.iter().map(|n| (*n, HashSet::new())).collect();
        let mut add_edge = |from: &str, to: &str, successors: &mut HashMap<&str, HashSet<String>>| {
            if from != to && in_subset(from) && in_subset(to) {
                if let Some(set) = successors.get_mut(from) {
                    set.insert(to.to_string());
                }
            }
        };
        for (parent, children) in &self.out_edges {
            for (child, _) in children {
                add_edge(parent, child, &mut successors);
            }
        }
        // lift a part's outside parents onto its master so the master sorts
        // after them
        for part in &nodes {
            if let Some(master) = master_node(part) {
                if !self.primary_keys.contains_key(&master) {
                    continue;
                }
                for (parent, _) in self.parents(part, None) {
                    let parent_master = master_node(&parent);
                    if parent != master && parent_master.as_deref() != Some(master.as_str()) {
                        add_edge(&parent, &master, &mut successors);
                    }
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (*n, 0)).collect();
        for targets in successors.values() {
            for t in targets {
                if let Some(d) = in_degree.get_mut(t.as_str()) {
                    *d += 1;
                }
            }
        }
        let mut ready: Vec<&str> = nodes.iter().filter(|n| in_degree[*n] == 0).copied().collect();
        ready.sort_unstable_by(|a, b| b.cmp(a)); // pop smallest first
        let mut sorted: Vec<String> = Vec::with_capacity(nodes.len());
        while let Some(node) = ready.pop() {
            sorted.push(node.to_string());
            if let Some(targets) = successors.get(node) {
                let mut newly_ready = Vec::new();
                for t in targets {
                    if let Some(d) = in_degree.get_mut(t.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            newly_ready.push(t.clone());
                        }
                    }
                }
                newly_ready.sort();
                for t in newly_ready.into_iter().rev() {
                    let node_ref = self
                        .primary_keys
                        .get_key_value(&t)
                        .map(|(k, _)| k.as_str())
                        .expect("known node");
                    ready.push(node_ref);
                }
                ready.sort_unstable_by(|a, b| b.cmp(a));
            }
        }

        // pull every part up to the position immediately after its master
        let mut pos = sorted.len();
        let mut placed: HashSet<String> = HashSet::new();
        while pos > 1 {
            pos -= 1;
            let part = sorted[pos].clone();
            let Some(master) = master_node(&part) else { continue };
            if placed.contains(&part) || !sorted.contains(&master) {
                continue;
            }
            placed.insert(part.clone());
            let insert_pos = sorted.iter().position(|n| *n == master).expect("master present") + 1;
            if pos > insert_pos {
                sorted.remove(pos);
                sorted.insert(insert_pos, part);
                pos += 1; // re-examine the element that slid into this slot
            }
        }
        sorted
    }

    /// All tables reachable from this one (self included, first), in
    /// topological order.
    pub fn descendants(&self, table: &str) -> Vec<String> {
        let mut reach: HashSet<String> = HashSet::new();
        let mut stack = vec![table.to_string()];
        while let Some(node) = stack.pop() {
            if reach.insert(node.clone()) {
                for (child, _) in self.children(&node, None) {
                    stack.push(child);
                }
            }
        }
        self.topo_sort_subset(Some(&reach))
    }

    /// All tables this one depends on (self included, first), closest
    /// ancestors next.
    pub fn ancestors(&self, table: &str) -> Vec<String> {
        let mut reach: HashSet<String> = HashSet::new();
        let mut stack = vec![table.to_string()];
        while let Some(node) = stack.pop() {
            if reach.insert(node.clone()) {
                for (parent, _) in self.parents(&node, None) {
                    stack.push(parent);
                }
            }
        }
        let mut sorted = self.topo_sort_subset(Some(&reach));
        sorted.reverse();
        sorted
    }
}

/// Master node name (`schema.master`) for a part node (`schema.part`).
fn master_node(node: &str) -> Option<String> {
    let qualified = QualifiedName::parse(node).ok()?;
    master_of(&qualified.table).map(|m| format!("{}.{m}", qualified.schema))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk(child: &str, parent: &str, attrs: &[(&str, &str)]) -> ForeignKeyInfo {
        ForeignKeyInfo {
            constraint: format!("fk_{child}_{parent}_{}", attrs.len()),
            child: QualifiedName::parse(child).unwrap(),
            parent: QualifiedName::parse(parent).unwrap(),
            attr_map: attrs
                .iter()
                .map(|(c, p)| (c.to_string(), p.to_string()))
                .collect(),
        }
    }

    fn node(name: &str, pk: &[&str]) -> (String, HashSet<String>) {
        (name.to_string(), pk.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn edge_flags() {
        let mut graph = DependencyGraph::new();
        graph
            .rebuild(
                vec![
                    node("s.subject", &["subject_id"]),
                    node("s.session", &["subject_id", "session_id"]),
                    node("s.note", &["note_id"]),
                ],
                vec![
                    fk("s.session", "s.subject", &[("subject_id", "subject_id")]),
                    fk("s.note", "s.subject", &[("owner_id", "subject_id")]),
                ],
            )
            .unwrap();

        let parents = graph.parents("s.session", Some(true));
        assert_eq!(parents.len(), 1);
        assert!(parents[0].1.primary);
        assert!(parents[0].1.multi); // FK covers part of the PK
        assert!(!parents[0].1.aliased);

        let note_parents = graph.parents("s.note", None);
        assert!(note_parents[0].1.aliased);
        assert!(!note_parents[0].1.primary);
        assert!(graph.parents("s.note", Some(true)).is_empty());
    }

    #[test]
    fn cycles_are_fatal() {
        let mut graph = DependencyGraph::new();
        let err = graph
            .rebuild(
                vec![node("s.a", &["x"]), node("s.b", &["x"])],
                vec![
                    fk("s.a", "s.b", &[("x", "x")]),
                    fk("s.b", "s.a", &[("x", "x")]),
                ],
            )
            .unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn topo_sort_keeps_parts_adjacent() {
        let mut graph = DependencyGraph::new();
        graph
            .rebuild(
                vec![
                    node("s.exp", &["exp_id"]),
                    node("s.exp__trial", &["exp_id", "trial"]),
                    node("s.stimulus", &["stim_id"]),
                    node("s.result", &["exp_id", "trial"]),
                ],
                vec![
                    fk("s.exp__trial", "s.exp", &[("exp_id", "exp_id")]),
                    fk("s.exp__trial", "s.stimulus", &[("stim_id", "stim_id")]),
                    fk(
                        "s.result",
                        "s.exp__trial",
                        &[("exp_id", "exp_id"), ("trial", "trial")],
                    ),
                ],
            )
            .unwrap();

        let order = graph.topo_sort();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        // part comes immediately after its master
        assert_eq!(pos("s.exp__trial"), pos("s.exp") + 1);
        // the master is ordered after the part's outside dependency
        assert!(pos("s.stimulus") < pos("s.exp"));
        assert!(pos("s.result") > pos("s.exp__trial"));
    }

    #[test]
    fn descendants_and_ancestors_are_topological() {
        let mut graph = DependencyGraph::new();
        graph
            .rebuild(
                vec![
                    node("s.a", &["x"]),
                    node("s.b", &["x"]),
                    node("s.c", &["x"]),
                    node("s.unrelated", &["y"]),
                ],
                vec![
                    fk("s.b", "s.a", &[("x", "x")]),
                    fk("s.c", "s.b", &[("x", "x")]),
                ],
            )
            .unwrap();

        assert_eq!(graph.descendants("s.a"), ["s.a", "s.b", "s.c"]);
        assert_eq!(graph.descendants("s.c"), ["s.c"]);
        assert_eq!(graph.ancestors("s.c"), ["s.c", "s.b", "s.a"]);
    }
}
