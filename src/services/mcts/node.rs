//! MCTS node arena
//!
//! Nodes form a tree with parent pointers; an arena plus indices avoids
//! cyclic owning references. The children map is keyed by transform id.

use std::collections::HashMap;

use crate::models::{ValidationResult, ValidationStatus};

pub type NodeId = usize;

/// A node in the search tree representing one SQL state
#[derive(Debug, Clone)]
pub struct MctsNode {
    pub query_sql: String,
    pub state_hash: String,
    pub prior: f64,
    pub parent: Option<NodeId>,
    /// Transform that produced this node; None for the root
    pub transform: Option<String>,
    pub depth: usize,
    pub visit_count: u64,
    pub value_sum: f64,
    pub children: HashMap<String, NodeId>,
    pub expanded: bool,
    /// Untried (transform, prior) pairs, ordered by descending prior
    pub remaining_transforms: Vec<(String, f64)>,
    /// Cached validation of this node's SQL
    pub validation: Option<ValidationResult>,
    /// Set when the expansion that created this node failed
    pub transform_error: Option<String>,
}

impl MctsNode {
    pub fn avg_reward(&self) -> f64 {
        self.value_sum / (self.visit_count.max(1)) as f64
    }

    /// A node is valid iff its latest validation passed equivalence
    pub fn is_valid(&self) -> bool {
        self.validation
            .as_ref()
            .map(|v| v.status == ValidationStatus::Pass)
            .unwrap_or(false)
    }

    pub fn speedup(&self) -> f64 {
        self.validation.as_ref().map(|v| v.speedup).unwrap_or(1.0)
    }

    /// PUCT score with first-play urgency for unvisited nodes
    pub fn puct_score(&self, parent_visits: u64, c_puct: f64, fpu: f64) -> f64 {
        let parent_visits = parent_visits.max(1);
        let exploitation = if self.visit_count > 0 { self.avg_reward() } else { fpu };
        let exploration =
            c_puct * self.prior * (parent_visits as f64).sqrt() / (1.0 + self.visit_count as f64);
        exploitation + exploration
    }

    fn base(sql: String, state_hash: String) -> Self {
        Self {
            query_sql: sql,
            state_hash,
            prior: 0.0,
            parent: None,
            transform: None,
            depth: 0,
            visit_count: 0,
            value_sum: 0.0,
            children: HashMap::new(),
            expanded: false,
            remaining_transforms: Vec::new(),
            validation: None,
            transform_error: None,
        }
    }
}

/// Flat arena owning every node of one search
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<MctsNode>,
}

impl NodeArena {
    pub fn new_root(
        sql: String,
        state_hash: String,
        remaining: Vec<(String, f64)>,
    ) -> (Self, NodeId) {
        let mut root = MctsNode::base(sql, state_hash);
        root.remaining_transforms = remaining;
        (Self { nodes: vec![root] }, 0)
    }

    pub fn get(&self, id: NodeId) -> &MctsNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut MctsNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    /// Create a child; depth is parent depth + 1 by construction
    pub fn add_child(
        &mut self,
        parent: NodeId,
        transform: &str,
        sql: String,
        state_hash: String,
        prior: f64,
        remaining: Vec<(String, f64)>,
    ) -> NodeId {
        let depth = self.nodes[parent].depth + 1;
        let id = self.nodes.len();
        let mut node = MctsNode::base(sql, state_hash);
        node.parent = Some(parent);
        node.transform = Some(transform.to_string());
        node.depth = depth;
        node.prior = prior;
        node.remaining_transforms = remaining;
        self.nodes.push(node);
        self.nodes[parent].children.insert(transform.to_string(), id);
        id
    }

    /// Transforms applied along the path from root to `id`
    pub fn path_transforms(&self, id: NodeId) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id];
            if let Some(t) = &node.transform {
                path.push(t.clone());
            }
            current = node.parent;
        }
        path.reverse();
        path
    }

    /// True when `hash` matches `id` or any of its ancestors
    pub fn hash_on_path(&self, id: NodeId, hash: &str) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id];
            if node.state_hash == hash {
                return true;
            }
            current = node.parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_depth_and_path() {
        let (mut arena, root) = NodeArena::new_root(
            "SELECT 1".into(),
            "h0".into(),
            vec![("a".into(), 0.6), ("b".into(), 0.4)],
        );
        let c1 = arena.add_child(root, "a", "SELECT 2".into(), "h1".into(), 0.5, vec![]);
        let c2 = arena.add_child(c1, "b", "SELECT 3".into(), "h2".into(), 0.5, vec![]);

        assert_eq!(arena.get(root).depth, 0);
        assert!(arena.get(root).transform.is_none());
        assert_eq!(arena.get(c1).depth, 1);
        assert_eq!(arena.get(c2).depth, 2);
        assert_eq!(arena.path_transforms(c2), vec!["a", "b"]);
        assert_eq!(arena.get(root).children.get("a"), Some(&c1));
    }

    #[test]
    fn test_avg_reward_guard_against_zero_visits() {
        let (arena, root) = NodeArena::new_root("SELECT 1".into(), "h0".into(), vec![]);
        assert_eq!(arena.get(root).avg_reward(), 0.0);
    }

    #[test]
    fn test_puct_monotonicity() {
        let (mut arena, root) = NodeArena::new_root("SELECT 1".into(), "h0".into(), vec![]);
        let c = arena.add_child(root, "a", "SELECT 2".into(), "h1".into(), 0.4, vec![]);

        // Strictly increasing in parent visits
        let s1 = arena.get(c).puct_score(1, 1.4, 0.5);
        let s2 = arena.get(c).puct_score(16, 1.4, 0.5);
        assert!(s2 > s1);

        // Strictly increasing in prior
        arena.get_mut(c).prior = 0.8;
        let s3 = arena.get(c).puct_score(16, 1.4, 0.5);
        assert!(s3 > s2);

        // Strictly decreasing in own visit count (holding Q fixed at 0)
        arena.get_mut(c).visit_count = 5;
        arena.get_mut(c).value_sum = 0.0;
        let s4 = arena.get(c).puct_score(16, 1.4, 0.0);
        arena.get_mut(c).visit_count = 10;
        let s5 = arena.get(c).puct_score(16, 1.4, 0.0);
        assert!(s5 < s4);
    }

    #[test]
    fn test_hash_cycle_detection() {
        let (mut arena, root) = NodeArena::new_root("SELECT 1".into(), "h0".into(), vec![]);
        let c1 = arena.add_child(root, "a", "SELECT 2".into(), "h1".into(), 0.5, vec![]);
        assert!(arena.hash_on_path(c1, "h0"));
        assert!(arena.hash_on_path(c1, "h1"));
        assert!(!arena.hash_on_path(c1, "h2"));
    }
}
