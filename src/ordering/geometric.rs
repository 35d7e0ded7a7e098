//! Geometric nested dissection of regular grids.
//!
//! A box of grid points is cut in two by a plane orthogonal to its longest
//! dimension; both halves are ordered first, the plane last. Boxes with at
//! most `leaf_size` points, or too thin to cut, become leaves.
//!
//! Grid point `(x, y, z)` of an `nx × ny × nz` grid has index
//! `x + nx * (y + ny * z)`.

use log::debug;

use crate::tree::SeparatorNode;

/// Permutation and separator tree of a nested-dissection ordering.
#[derive(Debug, Clone)]
pub struct GridOrdering {
    /// `perm[new] = old`
    pub perm: Vec<usize>,
    /// Postorder, root last.
    pub seps: Vec<SeparatorNode>,
}

impl GridOrdering {
    /// `iperm[old] = new`
    pub fn inverse(&self) -> Vec<usize> {
        let mut iperm = vec![0; self.perm.len()];
        for (new, &old) in self.perm.iter().enumerate() {
            iperm[old] = new;
        }
        iperm
    }
}

#[derive(Clone, Copy)]
struct Box3 {
    lo: [usize; 3],
    hi: [usize; 3],
}

impl Box3 {
    fn len(&self, d: usize) -> usize {
        self.hi[d] - self.lo[d]
    }

    fn volume(&self) -> usize {
        (0..3).map(|d| self.len(d)).product()
    }

    fn longest(&self) -> usize {
        (0..3).fold(0, |best, d| if self.len(d) > self.len(best) { d } else { best })
    }
}

struct Dissection {
    dims: [usize; 3],
    leaf_size: usize,
    perm: Vec<usize>,
    seps: Vec<SeparatorNode>,
}

impl Dissection {
    fn number(&mut self, b: Box3) -> (usize, usize) {
        let begin = self.perm.len();
        for z in b.lo[2]..b.hi[2] {
            for y in b.lo[1]..b.hi[1] {
                for x in b.lo[0]..b.hi[0] {
                    self.perm.push(x + self.dims[0] * (y + self.dims[1] * z));
                }
            }
        }
        (begin, self.perm.len())
    }

    fn dissect(&mut self, b: Box3) -> usize {
        let d = b.longest();
        if b.volume() <= self.leaf_size || b.len(d) < 3 {
            let (begin, end) = self.number(b);
            self.seps.push(SeparatorNode::leaf(begin, end));
            return self.seps.len() - 1;
        }
        let mid = b.lo[d] + b.len(d) / 2;
        let mut left = b;
        left.hi[d] = mid;
        let mut right = b;
        right.lo[d] = mid + 1;
        let mut plane = b;
        plane.lo[d] = mid;
        plane.hi[d] = mid + 1;
        let l = self.dissect(left);
        let r = self.dissect(right);
        let (begin, end) = self.number(plane);
        self.seps
            .push(SeparatorNode::leaf(begin, end).with_children(Some(l), Some(r)));
        self.seps.len() - 1
    }
}

/// Nested dissection of an `nx × ny × nz` grid (`nz = 1` for 2D).
pub fn nested_dissection(nx: usize, ny: usize, nz: usize, leaf_size: usize) -> GridOrdering {
    let dims = [nx, ny, nz];
    let mut nd = Dissection {
        dims,
        leaf_size: leaf_size.max(1),
        perm: Vec::with_capacity(nx * ny * nz),
        seps: Vec::new(),
    };
    if nx * ny * nz > 0 {
        nd.dissect(Box3 { lo: [0; 3], hi: dims });
    }
    debug!(
        "nested dissection of {}x{}x{}: {} separators",
        nx,
        ny,
        nz,
        nd.seps.len()
    );
    GridOrdering {
        perm: nd.perm,
        seps: nd.seps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_is_a_bijection() {
        let o = nested_dissection(7, 5, 3, 4);
        let mut seen = vec![false; 105];
        for &p in &o.perm {
            assert!(!seen[p]);
            seen[p] = true;
        }
        assert!(seen.iter().all(|&s| s));
        let iperm = o.inverse();
        assert!(o.perm.iter().enumerate().all(|(new, &old)| iperm[old] == new));
    }

    #[test]
    fn separators_are_postordered() {
        let o = nested_dissection(9, 9, 1, 6);
        let root = o.seps.last().unwrap();
        assert_eq!(root.sep_end, 81);
        // the first cut is the middle column x = 4
        assert_eq!(root.sep_end - root.sep_begin, 9);
        assert!(o.perm[root.sep_begin..].iter().all(|&p| p % 9 == 4));
        for (k, s) in o.seps.iter().enumerate() {
            for c in s.left.into_iter().chain(s.right) {
                assert!(c < k);
                assert!(o.seps[c].sep_end <= s.sep_begin);
            }
        }
    }

    #[test]
    fn small_grid_is_one_leaf() {
        let o = nested_dissection(2, 2, 2, 100);
        assert_eq!(o.seps, vec![SeparatorNode::leaf(0, 8)]);
    }
}
