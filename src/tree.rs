//! Arena-backed rooted tree with precomputed traversal orders.

use serde::{Deserialize, Serialize};

use crate::model::ModelError;

pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    length: f64,
    name: Option<String>,
}

/// A rooted tree whose nodes are stored in a flat arena.
///
/// Branches are identified with their child node and numbered in node order,
/// skipping the root. That numbering fixes the layout of every per-branch
/// parameter vector.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    post_order: Vec<NodeId>,
    pre_order: Vec<NodeId>,
    height_levels: Vec<Vec<NodeId>>,
    depth_levels: Vec<Vec<NodeId>>,
    tips: Vec<NodeId>,
    tip_index: Vec<Option<usize>>,
    branch_index: Vec<Option<usize>>,
    branches: Vec<NodeId>,
}

impl Tree {
    /// Build a tree from a parent array. Exactly one entry must be `None`.
    pub fn from_parents(
        parents: &[Option<NodeId>],
        lengths: &[f64],
        names: Vec<Option<String>>,
    ) -> Result<Self, ModelError> {
        let n = parents.len();
        if lengths.len() != n {
            return Err(ModelError::DimensionMismatch {
                what: "branch lengths",
                expected: n,
                found: lengths.len(),
            });
        }
        if names.len() != n {
            return Err(ModelError::DimensionMismatch {
                what: "node names",
                expected: n,
                found: names.len(),
            });
        }

        let mut nodes: Vec<Node> = names
            .into_iter()
            .zip(parents)
            .zip(lengths)
            .map(|((name, &parent), &length)| Node {
                parent,
                children: vec![],
                length,
                name,
            })
            .collect();

        let mut root = None;
        for (id, &parent) in parents.iter().enumerate() {
            match parent {
                None if root.is_some() => {
                    return Err(ModelError::InvalidTree("more than one root".into()));
                }
                None => root = Some(id),
                Some(parent) if parent >= n || parent == id => {
                    return Err(ModelError::InvalidTree(format!(
                        "node {id} has invalid parent {parent}"
                    )));
                }
                Some(parent) => {
                    if !(lengths[id] >= 0.) || !lengths[id].is_finite() {
                        return Err(ModelError::InvalidTree(format!(
                            "node {id} has branch length {}",
                            lengths[id]
                        )));
                    }
                    nodes[parent].children.push(id);
                }
            }
        }
        let root = root.ok_or_else(|| ModelError::InvalidTree("no root".into()))?;
        nodes[root].length = 0.;

        let mut pre_order = Vec::with_capacity(n);
        let mut depth = vec![0usize; n];
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            pre_order.push(node);
            for &child in nodes[node].children.iter().rev() {
                depth[child] = depth[node] + 1;
                stack.push(child);
            }
        }
        if pre_order.len() != n {
            return Err(ModelError::InvalidTree(
                "not every node is reachable from the root".into(),
            ));
        }

        let mut post_order = Vec::with_capacity(n);
        let mut stack = vec![(root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                post_order.push(node);
            } else {
                stack.push((node, true));
                for &child in nodes[node].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }

        let mut height = vec![0usize; n];
        for &node in post_order.iter() {
            height[node] = nodes[node]
                .children
                .iter()
                .map(|&child| height[child] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut height_levels = vec![vec![]; height[root] + 1];
        for &node in post_order.iter() {
            height_levels[height[node]].push(node);
        }
        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut depth_levels = vec![vec![]; max_depth + 1];
        for &node in pre_order.iter() {
            depth_levels[depth[node]].push(node);
        }

        let tips: Vec<NodeId> = (0..n).filter(|&id| nodes[id].children.is_empty()).collect();
        let mut tip_index = vec![None; n];
        for (index, &tip) in tips.iter().enumerate() {
            tip_index[tip] = Some(index);
        }
        let branches: Vec<NodeId> = (0..n).filter(|&id| id != root).collect();
        let mut branch_index = vec![None; n];
        for (index, &node) in branches.iter().enumerate() {
            branch_index[node] = Some(index);
        }

        Ok(Self {
            nodes,
            root,
            post_order,
            pre_order,
            height_levels,
            depth_levels,
            tips,
            tip_index,
            branch_index,
            branches,
        })
    }

    /// Parse a Newick string such as `((a:1,b:1):0.5,c:1.5);`.
    ///
    /// Internal node labels are accepted and kept as names. A missing branch
    /// length is read as zero.
    pub fn from_newick(text: &str) -> Result<Self, ModelError> {
        let mut parser = NewickParser {
            bytes: text.trim().as_bytes(),
            pos: 0,
            parents: vec![],
            lengths: vec![],
            names: vec![],
        };
        parser.tree()?;
        parser.skip_whitespace();
        if parser.peek() == Some(b';') {
            parser.pos += 1;
        }
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters"));
        }
        Self::from_parents(&parser.parents, &parser.lengths, parser.names)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].children
    }

    pub fn is_tip(&self, node: NodeId) -> bool {
        self.nodes[node].children.is_empty()
    }

    /// Length of the branch above `node`, zero for the root.
    pub fn length(&self, node: NodeId) -> f64 {
        self.nodes[node].length
    }

    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.nodes[node].name.as_deref()
    }

    pub fn tips(&self) -> &[NodeId] {
        &self.tips
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    /// Position of `node` in [`Tree::tips`].
    pub fn tip_index(&self, node: NodeId) -> Option<usize> {
        self.tip_index[node]
    }

    pub fn tip_by_name(&self, name: &str) -> Option<usize> {
        self.tips
            .iter()
            .position(|&tip| self.nodes[tip].name.as_deref() == Some(name))
    }

    /// Child nodes of all branches, in branch order.
    pub fn branches(&self) -> &[NodeId] {
        &self.branches
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn branch_index(&self, node: NodeId) -> Option<usize> {
        self.branch_index[node]
    }

    pub fn post_order(&self) -> &[NodeId] {
        &self.post_order
    }

    pub fn pre_order(&self) -> &[NodeId] {
        &self.pre_order
    }

    /// Nodes grouped by height. Level `k` only depends on levels below `k`.
    pub fn height_levels(&self) -> &[Vec<NodeId>] {
        &self.height_levels
    }

    /// Nodes grouped by depth. Level `k` only depends on level `k - 1`.
    pub fn depth_levels(&self) -> &[Vec<NodeId>] {
        &self.depth_levels
    }

    /// Distance from the root to `node`, under the given rates.
    pub fn root_distance(&self, node: NodeId, rates: &BranchRates) -> f64 {
        let mut distance = 0.;
        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            if let Some(branch) = self.branch_index[current] {
                distance += self.nodes[current].length * rates.rate(branch);
            }
            current = parent;
        }
        distance
    }

    /// Most recent common ancestor of two nodes.
    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut ancestors = vec![false; self.nodes.len()];
        let mut current = Some(a);
        while let Some(node) = current {
            ancestors[node] = true;
            current = self.nodes[node].parent;
        }
        let mut current = b;
        while !ancestors[current] {
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }
}

/// Rate multipliers applied to branch lengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BranchRates {
    Strict(f64),
    PerBranch(Vec<f64>),
}

impl Default for BranchRates {
    fn default() -> Self {
        BranchRates::Strict(1.)
    }
}

impl BranchRates {
    pub fn rate(&self, branch: usize) -> f64 {
        match self {
            BranchRates::Strict(rate) => *rate,
            BranchRates::PerBranch(rates) => rates[branch],
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match self {
            BranchRates::Strict(rate) => vec![*rate],
            BranchRates::PerBranch(rates) => rates.clone(),
        }
    }

    pub(crate) fn validate(&self, tree: &Tree) -> Result<(), ModelError> {
        let values = match self {
            BranchRates::Strict(rate) => std::slice::from_ref(rate),
            BranchRates::PerBranch(rates) => {
                if rates.len() != tree.branch_count() {
                    return Err(ModelError::DimensionMismatch {
                        what: "branch rates",
                        expected: tree.branch_count(),
                        found: rates.len(),
                    });
                }
                rates.as_slice()
            }
        };
        match values.iter().find(|rate| !(**rate >= 0.) || !rate.is_finite()) {
            Some(&value) => Err(ModelError::InvalidParameter {
                name: "branch rate",
                value,
            }),
            None => Ok(()),
        }
    }
}

struct NewickParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    parents: Vec<Option<NodeId>>,
    lengths: Vec<f64>,
    names: Vec<Option<String>>,
}

impl NewickParser<'_> {
    fn error(&self, message: &str) -> ModelError {
        ModelError::Newick {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn node(&mut self, parent: Option<NodeId>) -> NodeId {
        self.parents.push(parent);
        self.lengths.push(0.);
        self.names.push(None);
        self.parents.len() - 1
    }

    /// Parse the whole tree with an explicit stack of open clades, so deep
    /// caterpillars do not grow the call stack.
    fn tree(&mut self) -> Result<(), ModelError> {
        let mut open: Vec<NodeId> = vec![];
        let mut node = self.node(None);
        let mut closed = false;
        loop {
            self.skip_whitespace();
            if !closed && self.peek() == Some(b'(') {
                self.pos += 1;
                open.push(node);
                node = self.node(Some(node));
                continue;
            }
            self.annotate(node)?;
            let Some(&parent) = open.last() else {
                return Ok(());
            };
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    node = self.node(Some(parent));
                    closed = false;
                }
                Some(b')') => {
                    self.pos += 1;
                    open.pop();
                    node = parent;
                    closed = true;
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    /// Label and branch length after a tip or a closed clade.
    fn annotate(&mut self, id: NodeId) -> Result<(), ModelError> {
        let label = self.label();
        if !label.is_empty() {
            self.names[id] = Some(label);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
            {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.bytes[start..self.pos])
                .map_err(|_| self.error("invalid branch length"))?;
            self.lengths[id] = text
                .parse()
                .map_err(|_| self.error("invalid branch length"))?;
        }
        Ok(())
    }

    fn label(&mut self) -> String {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b'(' | b')' | b',' | b':' | b';') && !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_newick() {
        let tree = Tree::from_newick("((a:1,b:2):0.5,c:1.5);").unwrap();
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.tip_count(), 3);
        assert_eq!(tree.root(), 0);
        let a = tree.tips()[tree.tip_by_name("a").unwrap()];
        let b = tree.tips()[tree.tip_by_name("b").unwrap()];
        assert_eq!(tree.length(b), 2.);
        assert_eq!(tree.parent(a), tree.parent(b));
        assert_eq!(tree.root_distance(a, &BranchRates::Strict(2.)), 3.);
        assert_eq!(tree.branch_count(), 4);
        assert_eq!(tree.common_ancestor(a, b), 1);
        assert_eq!(tree.common_ancestor(a, tree.tips()[2]), 0);
    }

    #[test]
    fn traversal_orders() {
        let tree = Tree::from_newick("(((a:1,b:1):1,c:2):1,(d:1,e:1):2);").unwrap();
        let mut seen = vec![false; tree.node_count()];
        for &node in tree.post_order() {
            for &child in tree.children(node) {
                assert!(seen[child]);
            }
            seen[node] = true;
        }
        assert_eq!(*tree.post_order().last().unwrap(), tree.root());
        assert_eq!(tree.pre_order()[0], tree.root());
        assert_eq!(tree.height_levels().len(), 4);
        assert_eq!(tree.height_levels()[0].len(), 5);
        assert_eq!(tree.depth_levels()[0], vec![tree.root()]);
        let total: usize = tree.depth_levels().iter().map(|level| level.len()).sum();
        assert_eq!(total, tree.node_count());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Tree::from_parents(&[None, None], &[0., 1.], vec![None, None]),
            Err(ModelError::InvalidTree(_))
        ));
        assert!(matches!(
            Tree::from_parents(&[None, Some(0)], &[0., -1.], vec![None, None]),
            Err(ModelError::InvalidTree(_))
        ));
        assert!(matches!(
            Tree::from_parents(&[Some(1), Some(0)], &[0., 1.], vec![None, None]),
            Err(ModelError::InvalidTree(_))
        ));
        assert!(matches!(
            Tree::from_newick("((a:1,b:1);"),
            Err(ModelError::Newick { .. })
        ));
    }

    #[test]
    fn deep_caterpillar() {
        let depth = 20_000;
        let mut text = "(".repeat(depth);
        text.push_str("t0:1");
        for i in 1..depth {
            text.push_str(&format!(",t{i}:1):1"));
        }
        text.push_str(&format!(",t{depth}:1);"));
        let tree = Tree::from_newick(&text).unwrap();
        assert_eq!(tree.tip_count(), depth + 1);
        assert_eq!(tree.node_count(), 2 * depth + 1);
        assert_eq!(tree.depth_levels().len(), depth + 1);
        let deepest = tree.tips()[tree.tip_by_name("t0").unwrap()];
        assert_eq!(tree.root_distance(deepest, &BranchRates::default()), depth as f64);
    }

    #[test]
    fn rejects_clade_after_clade() {
        assert!(matches!(
            Tree::from_newick("((a:1,b:1)(c:1,d:1));"),
            Err(ModelError::Newick { .. })
        ));
        let tree = Tree::from_newick(" ( a : 1 , ( b:1 , c:2 ) x : 0.5 ) ; ").unwrap();
        assert_eq!(tree.tip_count(), 3);
        assert_eq!(tree.name(2), Some("x"));
    }

    #[test]
    fn rates() {
        let tree = Tree::from_newick("(a:1,b:1);").unwrap();
        assert!(BranchRates::PerBranch(vec![1.]).validate(&tree).is_err());
        assert!(BranchRates::PerBranch(vec![1., -1.]).validate(&tree).is_err());
        assert!(BranchRates::Strict(0.5).validate(&tree).is_ok());
    }
}
