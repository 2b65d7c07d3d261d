//! # Dependency Graph
//!
//! Adjacency over cell addresses, kept in both directions:
//! - forward: `parent -> {child: label}`
//! - reverse: `child -> {parent: label}`
//!
//! The label is the set of input names through which the child reads the
//! parent. All maps are `BTreeMap`s, so iteration order is deterministic.
//!
//! Edges are only rewritten through [`Dag::replace_parents`], which is what
//! `Context::pull` uses to diff a cell's current inputs against the edges
//! recorded for it.

use crate::address::Address;
use crate::CellError;
use std::collections::{BTreeMap, BTreeSet};

/// Input names through which a child references a parent.
pub type EdgeLabel = BTreeSet<String>;

// =============================================================================
// GENERATIONS
// =============================================================================

/// Result of a topological generation walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generations {
    /// Address -> generation (longest path from the roots).
    pub by_address: BTreeMap<Address, usize>,
    /// Generation -> addresses in it.
    pub by_generation: BTreeMap<usize, BTreeSet<Address>>,
}

impl Generations {
    /// Addresses in ascending generation order, skipping `exclude`.
    #[must_use]
    pub fn flatten(&self, exclude: &[usize]) -> Vec<Address> {
        self.by_generation
            .iter()
            .filter(|(generation, _)| !exclude.contains(generation))
            .flat_map(|(_, addresses)| addresses.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn generation_of(&self, address: &Address) -> Option<usize> {
        self.by_address.get(address).copied()
    }

    /// Number of generations, including generation 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.by_generation.len()
    }
}

// =============================================================================
// DAG
// =============================================================================

/// The dependency graph between addressed cells.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    forward: BTreeMap<Address, BTreeMap<Address, EdgeLabel>>,
    reverse: BTreeMap<Address, BTreeMap<Address, EdgeLabel>>,
}

impl Dag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `parent -> child`, merging `label` into an existing edge.
    pub fn add_edge(&mut self, parent: &Address, child: &Address, label: impl Into<String>) {
        let label = label.into();
        self.forward
            .entry(parent.clone())
            .or_default()
            .entry(child.clone())
            .or_default()
            .insert(label.clone());
        self.reverse
            .entry(child.clone())
            .or_default()
            .entry(parent.clone())
            .or_default()
            .insert(label);
    }

    /// Remove `parent -> child`. Returns whether the edge existed.
    pub fn remove_edge(&mut self, parent: &Address, child: &Address) -> bool {
        let existed = remove_nested(&mut self.forward, parent, child);
        remove_nested(&mut self.reverse, child, parent);
        existed
    }

    #[must_use]
    pub fn contains_edge(&self, parent: &Address, child: &Address) -> bool {
        self.forward
            .get(parent)
            .is_some_and(|children| children.contains_key(child))
    }

    /// Direct dependents of `address`.
    pub fn children(&self, address: &Address) -> impl Iterator<Item = &Address> + '_ {
        self.forward
            .get(address)
            .into_iter()
            .flat_map(|children| children.keys())
    }

    /// Direct dependencies of `address`, with labels.
    #[must_use]
    pub fn parents(&self, address: &Address) -> BTreeMap<Address, EdgeLabel> {
        self.reverse.get(address).cloned().unwrap_or_default()
    }

    /// Make `parents` the exact parent set of `child`.
    ///
    /// Edges to parents no longer listed are removed, new ones added, and
    /// labels of kept edges replaced. Returns `(added, removed)`.
    pub fn replace_parents(
        &mut self,
        child: &Address,
        parents: BTreeMap<Address, EdgeLabel>,
    ) -> (usize, usize) {
        let previous = self.parents(child);

        let mut removed = 0;
        for parent in previous.keys() {
            if !parents.contains_key(parent) && self.remove_edge(parent, child) {
                removed += 1;
            }
        }

        let mut added = 0;
        for (parent, label) in parents {
            match previous.get(&parent) {
                Some(old) if *old == label => continue,
                Some(_) => {
                    self.remove_edge(&parent, child);
                }
                None => added += 1,
            }
            for name in label {
                self.add_edge(&parent, child, name);
            }
        }

        (added, removed)
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeMap::len).sum()
    }

    /// Number of distinct addresses taking part in any edge.
    #[must_use]
    pub fn address_count(&self) -> usize {
        self.forward
            .keys()
            .chain(self.reverse.keys())
            .collect::<BTreeSet<_>>()
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Assign every address reachable from `roots` to a generation.
    ///
    /// Breadth-first from generation 0. An address reached again at a later
    /// generation moves to that generation, so its final generation is the
    /// longest path from any root and every ancestor sits strictly before
    /// it. The walk ends when a generation produces no frontier.
    ///
    /// The graph must be acyclic. A walk that runs past the number of known
    /// addresses can only be going around a cycle and fails with
    /// `CellError::CircularDependency`.
    pub fn topological_generations(&self, roots: &[Address]) -> Result<Generations, CellError> {
        let mut generations = Generations::default();
        let limit = self.address_count().saturating_add(1);

        let mut frontier: BTreeSet<Address> = roots.iter().cloned().collect();
        for root in &frontier {
            generations.by_address.insert(root.clone(), 0);
        }
        if !frontier.is_empty() {
            generations.by_generation.insert(0, frontier.clone());
        }

        let mut generation = 0usize;
        loop {
            let next: BTreeSet<Address> = frontier
                .iter()
                .flat_map(|address| self.children(address).cloned())
                .collect();
            if next.is_empty() {
                break;
            }

            generation = generation.saturating_add(1);
            if generation > limit {
                return Err(CellError::CircularDependency(
                    next.iter().map(ToString::to_string).collect(),
                ));
            }

            for address in &next {
                if let Some(old) = generations.by_address.insert(address.clone(), generation) {
                    if let Some(bucket) = generations.by_generation.get_mut(&old) {
                        bucket.remove(address);
                    }
                }
                generations
                    .by_generation
                    .entry(generation)
                    .or_default()
                    .insert(address.clone());
            }
            frontier = next;
        }

        generations.by_generation.retain(|_, bucket| !bucket.is_empty());
        Ok(generations)
    }

    /// Everything downstream of `root`, in ascending generation order.
    ///
    /// `exclude` lists generations to leave out; callers pass `&[0]` to skip
    /// the root itself.
    pub fn descendants(&self, root: &Address, exclude: &[usize]) -> Result<Vec<Address>, CellError> {
        Ok(self
            .topological_generations(std::slice::from_ref(root))?
            .flatten(exclude))
    }
}

fn remove_nested(
    map: &mut BTreeMap<Address, BTreeMap<Address, EdgeLabel>>,
    outer: &Address,
    inner: &Address,
) -> bool {
    let Some(targets) = map.get_mut(outer) else {
        return false;
    };
    let existed = targets.remove(inner).is_some();
    if targets.is_empty() {
        map.remove(outer);
    }
    existed
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn addr(key: &str) -> Address {
        Address::new(None, [("key".to_string(), Value::from(key))])
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut dag = Dag::new();
        let (a, b) = (addr("a"), addr("b"));

        dag.add_edge(&a, &b, "x");
        dag.add_edge(&a, &b, "x");
        assert_eq!(dag.edge_count(), 1);
        assert!(dag.contains_edge(&a, &b));
        assert_eq!(dag.parents(&b).get(&a).map(BTreeSet::len), Some(1));

        assert!(dag.remove_edge(&a, &b));
        assert!(!dag.remove_edge(&a, &b));
        assert!(dag.is_empty());
        assert!(dag.parents(&b).is_empty());
    }

    #[test]
    fn labels_merge_on_repeated_edges() {
        let mut dag = Dag::new();
        let (a, b) = (addr("a"), addr("b"));
        dag.add_edge(&a, &b, "x");
        dag.add_edge(&a, &b, "y");

        let label = dag.parents(&b).remove(&a).expect("edge");
        assert_eq!(label.into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn longest_path_wins() {
        // a -> b -> c and a -> c: c must come after b.
        let mut dag = Dag::new();
        let (a, b, c) = (addr("a"), addr("b"), addr("c"));
        dag.add_edge(&a, &b, "x");
        dag.add_edge(&b, &c, "x");
        dag.add_edge(&a, &c, "y");

        let generations = dag.topological_generations(&[a.clone()]).expect("walk");
        assert_eq!(generations.generation_of(&a), Some(0));
        assert_eq!(generations.generation_of(&b), Some(1));
        assert_eq!(generations.generation_of(&c), Some(2));
        assert!(!generations.by_generation[&1].contains(&c));
    }

    #[test]
    fn descendants_skip_the_root() {
        let mut dag = Dag::new();
        let (a, b, c, d) = (addr("a"), addr("b"), addr("c"), addr("d"));
        dag.add_edge(&a, &b, "x");
        dag.add_edge(&b, &c, "x");
        dag.add_edge(&d, &c, "x");

        let order = dag.descendants(&a, &[0]).expect("walk");
        assert_eq!(order, vec![b, c]);
    }

    #[test]
    fn unknown_root_has_no_descendants() {
        let dag = Dag::new();
        let generations = dag.topological_generations(&[addr("z")]).expect("walk");
        assert_eq!(generations.depth(), 1);
        assert!(dag.descendants(&addr("z"), &[0]).expect("walk").is_empty());
    }

    #[test]
    fn cycle_is_reported_instead_of_looping() {
        let mut dag = Dag::new();
        let (a, b) = (addr("a"), addr("b"));
        dag.add_edge(&a, &b, "x");
        dag.add_edge(&b, &a, "x");

        let result = dag.topological_generations(&[a]);
        assert!(matches!(result, Err(CellError::CircularDependency(_))));
    }

    #[test]
    fn replace_parents_diffs_edges() {
        let mut dag = Dag::new();
        let (a, b, c) = (addr("a"), addr("b"), addr("c"));
        dag.add_edge(&a, &c, "x");
        dag.add_edge(&b, &c, "y");

        let parents = BTreeMap::from([
            (b.clone(), EdgeLabel::from(["y".to_string()])),
            (addr("d"), EdgeLabel::from(["z".to_string()])),
        ]);
        let (added, removed) = dag.replace_parents(&c, parents);

        assert_eq!((added, removed), (1, 1));
        assert!(!dag.contains_edge(&a, &c));
        assert!(dag.contains_edge(&b, &c));
        assert!(dag.contains_edge(&addr("d"), &c));
        assert_eq!(dag.children(&a).count(), 0);
    }

    #[test]
    fn replace_parents_relabels_kept_edges() {
        let mut dag = Dag::new();
        let (a, c) = (addr("a"), addr("c"));
        dag.add_edge(&a, &c, "x");

        let parents = BTreeMap::from([(a.clone(), EdgeLabel::from(["w".to_string()]))]);
        assert_eq!(dag.replace_parents(&c, parents), (0, 0));
        let label = dag.parents(&c).remove(&a).expect("edge");
        assert!(label.contains("w") && !label.contains("x"));
    }
}
