//! Shared problem builders for the integration tests.

#![allow(dead_code)]

use faer::Mat;
use faer::linalg::solvers::SolveCore;
use multifront::matrix::{CsrMatrix, SparseMatrix};
use multifront::ordering::nested_dissection;
use multifront::tree::EliminationTree;
use rand::Rng;

/// Five-point convection-diffusion stencil on an `nx × ny` grid, mildly
/// nonsymmetric so that pivoting matters.
pub fn convection_diffusion_2d(nx: usize, ny: usize) -> CsrMatrix<f64> {
    convection_diffusion_3d(nx, ny, 1)
}

/// Seven-point stencil on an `nx × ny × nz` grid.
pub fn convection_diffusion_3d(nx: usize, ny: usize, nz: usize) -> CsrMatrix<f64> {
    let n = nx * ny * nz;
    let id = |x: usize, y: usize, z: usize| x + nx * (y + ny * z);
    let mut t = Vec::with_capacity(7 * n);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let i = id(x, y, z);
                t.push((i, i, 6.5));
                if x > 0 {
                    t.push((i, id(x - 1, y, z), -1.3));
                }
                if x + 1 < nx {
                    t.push((i, id(x + 1, y, z), -0.7));
                }
                if y > 0 {
                    t.push((i, id(x, y - 1, z), -1.1));
                }
                if y + 1 < ny {
                    t.push((i, id(x, y + 1, z), -0.9));
                }
                if z > 0 {
                    t.push((i, id(x, y, z - 1), -1.0));
                }
                if z + 1 < nz {
                    t.push((i, id(x, y, z + 1), -1.0));
                }
            }
        }
    }
    CsrMatrix::from_triplets(n, n, &t).unwrap()
}

/// Nested-dissection ordered matrix and its elimination tree.
pub fn ordered_problem(a: &CsrMatrix<f64>, dims: [usize; 3], leaf_size: usize) -> (CsrMatrix<f64>, EliminationTree) {
    let nd = nested_dissection(dims[0], dims[1], dims[2], leaf_size);
    let ap = a.permute_symmetric(&nd.perm);
    let tree = EliminationTree::symbolic(&ap, &nd.seps).unwrap();
    (ap, tree)
}

/// Reference solution through faer's partial-pivoting LU.
pub fn dense_solve(a: &CsrMatrix<f64>, b: &[f64]) -> Vec<f64> {
    let dense: Mat<f64> = a.to_dense();
    let lu = faer::linalg::solvers::PartialPivLu::new(dense.as_ref());
    let mut x = b.to_vec();
    let n = x.len();
    let x_mat = faer::MatMut::from_column_major_slice_mut(&mut x, n, 1);
    lu.solve_in_place_with_conj(faer::Conj::No, x_mat);
    x
}

/// `‖A x - b‖∞` relative to `‖b‖∞`.
pub fn relative_residual(a: &CsrMatrix<f64>, x: &[f64], b: &[f64]) -> f64 {
    let mut ax = vec![0.0; a.nrows()];
    #[cfg(feature = "rayon")]
    a.spmv_parallel(x, &mut ax);
    #[cfg(not(feature = "rayon"))]
    a.spmv(x, &mut ax);
    let r = ax.iter().zip(b).fold(0.0f64, |m, (y, bi)| m.max((y - bi).abs()));
    let bn = b.iter().fold(0.0f64, |m, bi| m.max(bi.abs()));
    r / bn.max(f64::MIN_POSITIVE)
}

pub fn random_rhs(n: usize) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect()
}
