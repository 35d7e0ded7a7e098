//! Separator (elimination) tree of a nested-dissection ordering.
//!
//! Nodes are stored in postorder with the root last. Every node owns a
//! contiguous range `[sep_begin, sep_end)` of the (permuted) variables and a
//! sorted list of update variables: the later variables its frontal matrix
//! couples to.

use std::collections::BTreeSet;

use log::debug;

use crate::error::MfError;
use crate::matrix::{CsrMatrix, SparseMatrix};

/// Separator range and children of one node, before symbolic analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparatorNode {
    pub sep_begin: usize,
    pub sep_end: usize,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl SeparatorNode {
    pub fn leaf(sep_begin: usize, sep_end: usize) -> Self {
        SeparatorNode {
            sep_begin,
            sep_end,
            left: None,
            right: None,
        }
    }

    pub fn with_children(mut self, left: Option<usize>, right: Option<usize>) -> Self {
        self.left = left;
        self.right = right;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub sep_begin: usize,
    pub sep_end: usize,
    pub upd: Vec<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl TreeNode {
    pub fn dim_sep(&self) -> usize {
        self.sep_end - self.sep_begin
    }

    pub fn dim_upd(&self) -> usize {
        self.upd.len()
    }

    fn children(&self) -> impl Iterator<Item = usize> {
        self.left.into_iter().chain(self.right)
    }
}

#[derive(Debug, Clone)]
pub struct EliminationTree {
    n: usize,
    nodes: Vec<TreeNode>,
}

fn malformed(node: &TreeNode, reason: impl Into<String>) -> MfError {
    MfError::MalformedTree {
        begin: node.sep_begin,
        end: node.sep_end,
        reason: reason.into(),
    }
}

/// Dense flop estimate of partially eliminating one front.
fn front_flops(dim_sep: usize, dim_upd: usize) -> f64 {
    let ds = dim_sep as f64;
    let du = dim_upd as f64;
    2.0 / 3.0 * ds * ds * ds + 2.0 * ds * ds * du + 2.0 * ds * du * du
}

impl EliminationTree {
    /// Validate a tree over `n` variables.
    pub fn new(n: usize, nodes: Vec<TreeNode>) -> Result<Self, MfError> {
        if nodes.is_empty() {
            return Err(MfError::MalformedTree {
                begin: 0,
                end: n,
                reason: "empty tree".to_string(),
            });
        }
        let mut parent: Vec<Option<usize>> = vec![None; nodes.len()];
        for (k, node) in nodes.iter().enumerate() {
            if node.sep_begin >= node.sep_end || node.sep_end > n {
                return Err(malformed(node, format!("separator outside [0, {})", n)));
            }
            for c in node.children() {
                if c >= k {
                    return Err(malformed(node, format!("child {} does not precede its parent {}", c, k)));
                }
                if parent[c].is_some() {
                    return Err(malformed(&nodes[c], "node has two parents"));
                }
                parent[c] = Some(k);
            }
            if node.left.is_some() && node.left == node.right {
                return Err(malformed(node, "left and right child coincide"));
            }
            if node.upd.windows(2).any(|w| w[0] >= w[1]) {
                return Err(malformed(node, "update indices not strictly increasing"));
            }
            if node.upd.first().is_some_and(|&u| u < node.sep_end) {
                return Err(malformed(node, "update index inside or before the separator"));
            }
            if node.upd.last().is_some_and(|&u| u >= n) {
                return Err(malformed(node, format!("update index beyond {}", n)));
            }
        }
        let last = nodes.len() - 1;
        if let Some(k) = parent[..last].iter().position(|p| p.is_none()) {
            return Err(malformed(&nodes[k], "node is not connected to the root"));
        }

        let mut ranges: Vec<(usize, usize)> = nodes.iter().map(|x| (x.sep_begin, x.sep_end)).collect();
        ranges.sort_unstable();
        let mut next = 0;
        for &(b, e) in &ranges {
            if b != next {
                return Err(MfError::MalformedTree {
                    begin: b,
                    end: e,
                    reason: format!("separators do not tile [0, {}): gap or overlap at {}", n, next),
                });
            }
            next = e;
        }
        if next != n {
            return Err(MfError::MalformedTree {
                begin: next,
                end: n,
                reason: "variables not covered by any separator".to_string(),
            });
        }

        for node in &nodes {
            for c in node.children() {
                let child = &nodes[c];
                let inside = child.upd.iter().all(|&u| {
                    (node.sep_begin..node.sep_end).contains(&u) || node.upd.binary_search(&u).is_ok()
                });
                if !inside {
                    return Err(malformed(child, "update set not contained in the parent front"));
                }
            }
        }
        Ok(EliminationTree { n, nodes })
    }

    /// Update sets from the pattern of `A + Aᵀ`, then validation.
    pub fn symbolic(a: &CsrMatrix<f64>, seps: &[SeparatorNode]) -> Result<Self, MfError> {
        let n = square_dim(a)?;
        let adj = a.symmetric_pattern();
        let mut nodes: Vec<TreeNode> = Vec::with_capacity(seps.len());
        for (k, s) in seps.iter().enumerate() {
            let mut set = BTreeSet::new();
            if s.sep_end > n || s.sep_begin >= s.sep_end {
                return Err(MfError::MalformedTree {
                    begin: s.sep_begin,
                    end: s.sep_end,
                    reason: format!("separator outside [0, {})", n),
                });
            }
            for v in s.sep_begin..s.sep_end {
                set.extend(adj[v].iter().copied().filter(|&u| u >= s.sep_end));
            }
            for c in s.left.into_iter().chain(s.right) {
                if c >= k {
                    return Err(MfError::MalformedTree {
                        begin: s.sep_begin,
                        end: s.sep_end,
                        reason: format!("child {} does not precede its parent {}", c, k),
                    });
                }
                set.extend(nodes[c].upd.iter().copied().filter(|&u| u >= s.sep_end));
            }
            nodes.push(TreeNode {
                sep_begin: s.sep_begin,
                sep_end: s.sep_end,
                upd: set.into_iter().collect(),
                left: s.left,
                right: s.right,
            });
        }
        let tree = Self::new(n, nodes)?;
        debug!(
            "symbolic analysis: {} variables, {} fronts, {} factor nonzeros",
            n,
            tree.len(),
            tree.factor_nonzeros()
        );
        Ok(tree)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, k: usize) -> &TreeNode {
        &self.nodes[k]
    }

    pub fn root(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Factor nonzeros of a dense factorization of every front.
    pub fn factor_nonzeros(&self) -> u64 {
        self.nodes
            .iter()
            .map(|x| crate::matrix::dense::front_nonzeros(x.dim_sep(), x.dim_upd()) as u64)
            .sum()
    }

    fn subtree_flops(&self) -> Vec<f64> {
        let mut w = vec![0.0; self.nodes.len()];
        for (k, x) in self.nodes.iter().enumerate() {
            w[k] = front_flops(x.dim_sep(), x.dim_upd()) + x.children().map(|c| w[c]).sum::<f64>();
        }
        w
    }

    /// Processes per node for a run on `total_procs` ranks: the root gets all
    /// of them, siblings split their parent's share in proportion to the
    /// work in their subtrees.
    pub fn proportional_split(&self, total_procs: usize) -> Vec<usize> {
        let w = self.subtree_flops();
        let mut procs = vec![1; self.nodes.len()];
        procs[self.root()] = total_procs.max(1);
        for k in (0..self.nodes.len()).rev() {
            let p = procs[k];
            let x = &self.nodes[k];
            match (x.left, x.right) {
                (Some(l), Some(r)) => {
                    if p == 1 {
                        procs[l] = 1;
                        procs[r] = 1;
                    } else {
                        let total = w[l] + w[r];
                        let share = if total > 0.0 { w[l] / total } else { 0.5 };
                        let pl = ((p as f64 * share).round() as usize).clamp(1, p - 1);
                        procs[l] = pl;
                        procs[r] = p - pl;
                    }
                }
                (Some(c), None) | (None, Some(c)) => procs[c] = p,
                (None, None) => {}
            }
        }
        procs
    }

    /// Check explicit per-node process counts for a run on `total_procs`.
    pub fn validate_process_counts(&self, procs: &[usize], total_procs: usize) -> Result<(), MfError> {
        if procs.len() != self.nodes.len() {
            return Err(MfError::DimensionMismatch {
                expected: self.nodes.len(),
                found: procs.len(),
            });
        }
        if procs[self.root()] != total_procs {
            return Err(MfError::ProcessCount {
                expected: total_procs,
                found: procs[self.root()],
            });
        }
        for (k, x) in self.nodes.iter().enumerate() {
            if procs[k] == 0 {
                return Err(malformed(x, "front without processes"));
            }
            let children: usize = x.children().map(|c| procs[c]).sum();
            if procs[k] == 1 {
                if x.children().any(|c| procs[c] != 1) {
                    return Err(malformed(x, "distributed child under a sequential front"));
                }
            } else if children > procs[k] {
                return Err(MfError::ProcessCount {
                    expected: procs[k],
                    found: children,
                });
            }
        }
        Ok(())
    }
}

fn square_dim(a: &CsrMatrix<f64>) -> Result<usize, MfError> {
    if a.nrows() != a.ncols() {
        return Err(MfError::DimensionMismatch {
            expected: a.nrows(),
            found: a.ncols(),
        });
    }
    Ok(a.nrows())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1D Laplacian on 0..7, ordered as [0,1,2] [4,5,6] | 3
    fn chain() -> CsrMatrix<f64> {
        let n = 7;
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 2.0));
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
                t.push((i + 1, i, -1.0));
            }
        }
        let a = CsrMatrix::from_triplets(n, n, &t).unwrap();
        a.permute_symmetric(&[0, 1, 2, 4, 5, 6, 3])
    }

    fn seps() -> Vec<SeparatorNode> {
        vec![
            SeparatorNode::leaf(0, 3),
            SeparatorNode::leaf(3, 6),
            SeparatorNode::leaf(6, 7).with_children(Some(0), Some(1)),
        ]
    }

    #[test]
    fn symbolic_update_sets() {
        let t = EliminationTree::symbolic(&chain(), &seps()).unwrap();
        assert_eq!(t.node(0).upd, vec![6]);
        assert_eq!(t.node(1).upd, vec![6]);
        assert!(t.node(2).upd.is_empty());
        let total: usize = t.nodes().iter().map(|x| x.dim_sep()).sum();
        assert_eq!(total, t.n());
    }

    #[test]
    fn rejects_overlap_and_gaps() {
        let node = |b, e| TreeNode {
            sep_begin: b,
            sep_end: e,
            upd: vec![],
            left: None,
            right: None,
        };
        let mut root = node(2, 4);
        root.left = Some(0);
        assert!(matches!(
            EliminationTree::new(4, vec![node(0, 3), root.clone()]),
            Err(MfError::MalformedTree { .. })
        ));
        assert!(EliminationTree::new(5, vec![node(0, 2), root.clone()]).is_err());
        assert!(EliminationTree::new(4, vec![node(0, 2), root]).is_ok());
        assert!(EliminationTree::new(0, vec![]).is_err());
    }

    #[test]
    fn rejects_update_outside_parent() {
        let mut nodes = vec![
            TreeNode { sep_begin: 0, sep_end: 1, upd: vec![2], left: None, right: None },
            TreeNode { sep_begin: 1, sep_end: 2, upd: vec![], left: None, right: None },
            TreeNode { sep_begin: 2, sep_end: 3, upd: vec![], left: Some(0), right: Some(1) },
        ];
        assert!(EliminationTree::new(3, nodes.clone()).is_ok());
        nodes[1].upd = vec![3];
        assert!(EliminationTree::new(3, nodes.clone()).is_err());
        nodes[1].upd = vec![];
        nodes[0].upd = vec![2, 2];
        assert!(EliminationTree::new(3, nodes).is_err());
    }

    #[test]
    fn proportional_split_balances_siblings() {
        let t = EliminationTree::symbolic(&chain(), &seps()).unwrap();
        assert_eq!(t.proportional_split(4), vec![2, 2, 4]);
        assert_eq!(t.proportional_split(2), vec![1, 1, 2]);
        assert_eq!(t.proportional_split(1), vec![1, 1, 1]);
        t.validate_process_counts(&t.proportional_split(5), 5).unwrap();
    }

    #[test]
    fn process_count_validation() {
        let t = EliminationTree::symbolic(&chain(), &seps()).unwrap();
        assert!(t.validate_process_counts(&[3, 1, 4], 4).is_ok());
        assert!(matches!(
            t.validate_process_counts(&[3, 2, 4], 4),
            Err(MfError::ProcessCount { expected: 4, found: 5 })
        ));
        assert!(t.validate_process_counts(&[2, 2, 3], 4).is_err());
        assert!(t.validate_process_counts(&[2, 1, 1], 1).is_err());
        assert!(t.validate_process_counts(&[0, 1, 2], 2).is_err());
    }
}
