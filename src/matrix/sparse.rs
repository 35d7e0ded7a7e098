// SparseMatrix trait and the CSR storage the factorization reads from

use std::collections::HashMap;

use faer::Mat;
use faer::sparse::{SparseRowMat, SymbolicSparseRowMat, Triplet};
use faer::traits::ComplexField;
use num_traits::{One, Zero};

use crate::error::MfError;

/// A read‐only sparse matrix supporting y = A * x.
pub trait SparseMatrix<T> {
    /// Number of rows.
    fn nrows(&self) -> usize;
    /// Number of columns.
    fn ncols(&self) -> usize;
    /// Compute y = A * x.  `x.len() == ncols()`, `y.len() == nrows()`.
    fn spmv(&self, x: &[T], y: &mut [T]);
}

/// Compressed sparse row matrix over faer's `SparseRowMat`, column indices
/// sorted and unique in every row.
#[derive(Debug, Clone)]
pub struct CsrMatrix<T> {
    inner: SparseRowMat<usize, T>,
}

impl<T: ComplexField + Copy + Zero + One> CsrMatrix<T> {
    /// Build a CSR from raw row‐ptr, col‐idx, and values. Column indices must
    /// be sorted and unique within each row.
    pub fn from_csr(
        nrows: usize,
        ncols: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<T>,
    ) -> Self {
        let symbolic = SymbolicSparseRowMat::new_checked(nrows, ncols, row_ptr, None, col_idx);
        let inner = SparseRowMat::new(symbolic, values);
        Self { inner }
    }

    /// Build from `(row, col, value)` triplets in any order; duplicates are
    /// summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Result<Self, MfError> {
        let t: Vec<Triplet<usize, usize, T>> = triplets.iter().map(|&(i, j, v)| Triplet::new(i, j, v)).collect();
        let inner = SparseRowMat::try_new_from_triplets(nrows, ncols, &t)
            .map_err(|e| MfError::InvalidMatrix(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &SparseRowMat<usize, T> {
        &self.inner
    }

    pub fn nnz(&self) -> usize {
        self.inner.as_ref().symbolic().compute_nnz()
    }

    /// Column indices and values of row `i`.
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let m = self.inner.as_ref();
        (m.symbolic().col_idx_of_row_raw(i), m.val_of_row(i))
    }

    /// Entry `(i, j)`, zero when not stored.
    pub fn get(&self, i: usize, j: usize) -> T {
        let (cols, vals) = self.row(i);
        match cols.binary_search(&j) {
            Ok(k) => vals[k],
            Err(_) => T::zero(),
        }
    }

    /// Symmetric permutation `B(i, j) = A(perm[i], perm[j])`.
    pub fn permute_symmetric(&self, perm: &[usize]) -> Self {
        let n = self.inner.nrows();
        assert_eq!(n, self.inner.ncols());
        assert_eq!(perm.len(), n);
        let mut iperm = vec![0; n];
        for (new, &old) in perm.iter().enumerate() {
            iperm[old] = new;
        }
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx = Vec::with_capacity(self.nnz());
        let mut values = Vec::with_capacity(self.nnz());
        row_ptr.push(0);
        for &old in perm {
            let (cols, vals) = self.row(old);
            let mut row: Vec<(usize, T)> = cols.iter().zip(vals).map(|(&j, &v)| (iperm[j], v)).collect();
            row.sort_unstable_by_key(|&(j, _)| j);
            for (j, v) in row {
                col_idx.push(j);
                values.push(v);
            }
            row_ptr.push(col_idx.len());
        }
        Self::from_csr(n, n, row_ptr, col_idx, values)
    }

    /// Neighbours of every row in the pattern of `A + Aᵀ`, sorted, without
    /// the diagonal.
    pub fn symmetric_pattern(&self) -> Vec<Vec<usize>> {
        let n = self.inner.nrows().max(self.inner.ncols());
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..self.inner.nrows() {
            for &j in self.row(i).0 {
                if i != j {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }
        for a in adj.iter_mut() {
            a.sort_unstable();
            a.dedup();
        }
        adj
    }
}

impl CsrMatrix<f64> {
    /// Dense `|I| × |J|` block `A(I[i], J[j])`, keeping only entries whose row
    /// or column lies before `sep_end`: the part of a front owned by its
    /// separator.
    pub fn extract_separator(&self, sep_end: usize, rows: &[usize], cols: &[usize]) -> Mat<f64> {
        let mut b = Mat::<f64>::zeros(rows.len(), cols.len());
        if rows.is_empty() || cols.is_empty() {
            return b;
        }
        let pos: HashMap<usize, usize> = cols.iter().enumerate().map(|(k, &j)| (j, k)).collect();
        for (bi, &i) in rows.iter().enumerate() {
            let (rcols, rvals) = self.row(i);
            for (&j, &v) in rcols.iter().zip(rvals) {
                if i >= sep_end && j >= sep_end {
                    continue;
                }
                if let Some(&bj) = pos.get(&j) {
                    b[(bi, bj)] = v;
                }
            }
        }
        b
    }

    pub fn to_dense(&self) -> Mat<f64> {
        self.inner.to_dense()
    }
}

impl<T: ComplexField + Copy + Zero + One> SparseMatrix<T> for CsrMatrix<T> {
    fn nrows(&self) -> usize {
        self.inner.nrows()
    }
    fn ncols(&self) -> usize {
        self.inner.ncols()
    }
    fn spmv(&self, x: &[T], y: &mut [T]) {
        assert_eq!(x.len(), self.ncols());
        assert_eq!(y.len(), self.nrows());
        for (i, yi) in y.iter_mut().enumerate() {
            let (cols, vals) = self.row(i);
            *yi = cols
                .iter()
                .zip(vals)
                .fold(T::zero(), |acc, (&j, &v)| acc + v * x[j]);
        }
    }
}

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "rayon")]
impl<T: ComplexField + Copy + Zero + One + Send + Sync> CsrMatrix<T> {
    /// Parallel SpMV using Rayon
    pub fn spmv_parallel(&self, x: &[T], y: &mut [T]) {
        assert_eq!(x.len(), self.ncols());
        assert_eq!(y.len(), self.nrows());
        y.par_iter_mut().enumerate().for_each(|(i, yi)| {
            let (cols, vals) = self.row(i);
            *yi = cols
                .iter()
                .zip(vals)
                .fold(T::zero(), |acc, (&j, &v)| acc + v * x[j]);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_spmv() {
        // 3×3 identity in CSR: row_ptr=[0,1,2,3], col_idx=[0,1,2], vals=[1,1,1]
        let m = CsrMatrix::from_csr(3, 3, vec![0,1,2,3], vec![0,1,2], vec![1.0,1.0,1.0]);
        let x = vec![2.0, 3.0, 5.0];
        let mut y = vec![0.0; 3];
        m.spmv(&x, &mut y);
        assert_eq!(y, x);
    }

    #[test]
    fn simple_pattern() {
        // 2×3 matrix [[1,2,0],[0,3,4]]
        let m = CsrMatrix::from_csr(
            2, 3,
            vec![0,2,4],
            vec![0,1,1,2],
            vec![1.0,2.0,3.0,4.0],
        );
        let x = vec![1.0, 1.0, 1.0];
        let mut y = vec![0.0; 2];
        m.spmv(&x, &mut y);
        assert_eq!(y, vec![3.0, 7.0]);
        assert_eq!(m.get(1, 2), 4.0);
        assert_eq!(m.get(1, 0), 0.0);
    }

    #[test]
    fn triplets_sum_duplicates() {
        let m = CsrMatrix::from_triplets(2, 2, &[(0, 1, 1.0), (1, 0, 2.0), (0, 1, 0.5)]).unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.get(0, 1), 1.5);
    }

    #[test]
    fn unordered_triplets_land_sorted_in_faer_storage() {
        let m = CsrMatrix::from_triplets(
            3,
            4,
            &[(2, 3, 1.0), (0, 2, 4.0), (2, 0, -1.0), (0, 0, 2.0), (2, 3, 0.5), (0, 2, 1.0)],
        )
        .unwrap();
        assert_eq!(m.inner().nrows(), 3);
        assert_eq!(m.inner().ncols(), 4);
        assert_eq!(m.nnz(), 4);
        assert_eq!(m.row(0), (&[0usize, 2][..], &[2.0, 5.0][..]));
        assert_eq!(m.row(1).0.len(), 0);
        assert_eq!(m.row(2), (&[0usize, 3][..], &[-1.0, 1.5][..]));
        let d = m.to_dense();
        assert_eq!(d[(0, 2)], 5.0);
        assert_eq!(d[(2, 3)], 1.5);
        assert_eq!(d[(1, 1)], 0.0);
    }

    #[test]
    fn out_of_range_triplet_is_rejected() {
        let r = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (2, 1, 1.0)]);
        assert!(matches!(r, Err(MfError::InvalidMatrix(_))));
    }

    #[test]
    fn permutation_and_pattern() {
        // path 0 - 1 - 2, relabelled so that the middle vertex comes last
        let a = CsrMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 2.0), (0, 1, -1.0), (1, 0, -1.0), (1, 1, 2.0), (1, 2, -1.0), (2, 1, -1.0), (2, 2, 2.0)],
        )
        .unwrap();
        let b = a.permute_symmetric(&[0, 2, 1]);
        assert_eq!(b.get(0, 2), -1.0);
        assert_eq!(b.get(1, 2), -1.0);
        assert_eq!(b.get(0, 1), 0.0);
        assert_eq!(b.symmetric_pattern(), vec![vec![2], vec![2], vec![0, 1]]);
    }

    #[test]
    fn separator_extraction_skips_update_block() {
        let a = CsrMatrix::from_triplets(3, 3, &[(0, 0, 1.0), (1, 2, 5.0), (2, 1, 6.0), (2, 2, 7.0), (0, 2, 3.0)]).unwrap();
        let b = a.extract_separator(1, &[0, 2], &[2, 0]);
        assert_eq!(b[(0, 0)], 3.0);
        assert_eq!(b[(0, 1)], 1.0);
        assert_eq!(b[(1, 0)], 0.0); // (2, 2) belongs to the update block
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn parallel_spmv_matches_serial() {
        let a = CsrMatrix::from_triplets(3, 3, &[(0, 0, 1.0), (0, 2, 2.0), (2, 1, -1.0), (1, 1, 4.0)]).unwrap();
        let x = vec![1.0, 2.0, 3.0];
        let mut y0 = vec![0.0; 3];
        let mut y1 = vec![0.0; 3];
        a.spmv(&x, &mut y0);
        a.spmv_parallel(&x, &mut y1);
        assert_eq!(y0, y1);
    }
}
