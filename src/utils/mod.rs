/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared sparse and dense linear algebra helpers for the GMRF model.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared helpers for sparse Cholesky factorization, rank-revealing pivoted
//! Cholesky, sparse matrix assembly and products, and working with faer matrices.

use faer::dyn_stack::{MemBuffer, MemStack};
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::linalg::cholesky::{
    CholeskySymbolicParams, SymbolicCholeskyRaw, SymmetricOrdering, factorize_symbolic_cholesky,
};
use faer::sparse::linalg::triangular_solve::{
    solve_lower_triangular_in_place, solve_lower_triangular_transpose_in_place,
};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Conj, Mat, Par, Side};
use num_traits::ToPrimitive;
use thiserror::Error;

/// Relative tolerance used when a pivoted Cholesky decides a pivot is zero.
const RANK_TOLERANCE: f64 = 1.0e-10;
/// Largest relative residual tolerated before a matrix is declared indefinite.
const PSD_TOLERANCE: f64 = 1.0e-8;

/// Errors from the linear-algebra helpers.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum LinalgError {
    #[error("matrix is not square ({rows} x {cols})")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("symbolic Cholesky analysis failed")]
    SymbolicFactorization,
    #[error("linear solve produced non-finite values")]
    NonFinite,
    #[error("sparse entries do not fit a {rows} x {cols} matrix")]
    SparseConstruction { rows: usize, cols: usize },
}

/// Sparse Cholesky `Π A Πᵀ = L Lᵀ` of a symmetric positive-definite matrix.
///
/// `Π` is the fill-reducing AMD ordering chosen by faer; the factor is always
/// simplicial so that `L` is available for triangular solves.
#[derive(Debug, Clone)]
pub struct SparseCholesky {
    lower: SparseColMat<usize, f64>,
    /// `(Π v)[i] = v[forward[i]]`.
    forward: Vec<usize>,
    /// Inverse of `forward`.
    inverse: Vec<usize>,
}

impl SparseCholesky {
    /// Factor `matrix`; only its lower triangle is read.
    ///
    /// # Errors
    ///
    /// Returns `LinalgError` if the matrix is not square, the symbolic
    /// analysis fails, or the matrix is not numerically positive definite.
    pub fn new(matrix: &SparseColMat<usize, f64>) -> Result<Self, LinalgError> {
        let dim = matrix.nrows();
        if matrix.ncols() != dim {
            return Err(LinalgError::NotSquare {
                rows: dim,
                cols: matrix.ncols(),
            });
        }
        let symbolic = factorize_symbolic_cholesky(
            matrix.symbolic(),
            Side::Lower,
            SymmetricOrdering::Amd,
            CholeskySymbolicParams {
                supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
                ..Default::default()
            },
        )
        .map_err(|_| LinalgError::SymbolicFactorization)?;

        let par = Par::Seq;
        let mut values = vec![0.0; symbolic.len_val()];
        let mut buffer =
            MemBuffer::new(symbolic.factorize_numeric_llt_scratch::<f64>(par, Default::default()));
        symbolic
            .factorize_numeric_llt(
                &mut values,
                matrix.as_ref(),
                Side::Lower,
                Default::default(),
                par,
                MemStack::new(&mut buffer),
                Default::default(),
            )
            .map_err(|_| LinalgError::NotPositiveDefinite)?;

        let SymbolicCholeskyRaw::Simplicial(simplicial) = symbolic.raw() else {
            return Err(LinalgError::SymbolicFactorization);
        };
        let pattern = simplicial
            .factor()
            .to_owned()
            .map_err(|_| LinalgError::SymbolicFactorization)?;
        let lower = SparseColMat::new(pattern, values);
        let (forward, inverse) = symbolic.perm().map_or_else(
            || ((0..dim).collect(), (0..dim).collect()),
            |perm| {
                let (forward, inverse) = perm.arrays();
                (forward.to_vec(), inverse.to_vec())
            },
        );

        let factor = Self {
            lower,
            forward,
            inverse,
        };
        if factor.log_determinant().is_finite() {
            Ok(factor)
        } else {
            Err(LinalgError::NotPositiveDefinite)
        }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    /// Number of stored entries of `L`.
    #[must_use]
    pub fn factor_nnz(&self) -> usize {
        self.lower.val().len()
    }

    /// `log |A|`; the diagonal of `L` is the first entry of every column.
    #[must_use]
    pub fn log_determinant(&self) -> f64 {
        let col_ptr = self.lower.symbolic().col_ptr();
        let values = self.lower.val();
        2.0 * (0..self.dim())
            .map(|col| values[col_ptr[col]].ln())
            .sum::<f64>()
    }

    /// Solve `A x = b`.
    ///
    /// # Errors
    ///
    /// Returns `LinalgError::NonFinite` if the solution is not finite.
    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LinalgError> {
        let mut work = Mat::from_fn(self.dim(), 1, |row, _| rhs[self.forward[row]]);
        solve_lower_triangular_in_place(self.lower.as_ref(), Conj::No, work.as_mut(), Par::Seq);
        solve_lower_triangular_transpose_in_place(
            self.lower.as_ref(),
            Conj::No,
            work.as_mut(),
            Par::Seq,
        );
        let solution: Vec<f64> = (0..self.dim())
            .map(|row| work[(self.inverse[row], 0)])
            .collect();
        if solution.iter().all(|value| value.is_finite()) {
            Ok(solution)
        } else {
            Err(LinalgError::NonFinite)
        }
    }

    /// `Πᵀ L⁻ᵀ z`; maps a standard-normal vector to a draw with covariance `A⁻¹`.
    #[must_use]
    pub fn solve_upper(&self, noise: &[f64]) -> Vec<f64> {
        let mut work = Mat::from_fn(self.dim(), 1, |row, _| noise[row]);
        solve_lower_triangular_transpose_in_place(
            self.lower.as_ref(),
            Conj::No,
            work.as_mut(),
            Par::Seq,
        );
        (0..self.dim())
            .map(|row| work[(self.inverse[row], 0)])
            .collect()
    }
}

/// Result of a diagonally pivoted Cholesky on a symmetric PSD matrix.
#[derive(Debug, Clone)]
pub struct PivotedRank {
    /// Numerical rank.
    pub rank: usize,
    /// Indices selected as pivots, in pivot order.
    pub pivots: Vec<usize>,
    /// Indices never pivoted; perturbing their diagonal restores full rank.
    pub remaining: Vec<usize>,
    /// Most negative trailing diagonal seen, `0` for PSD input.
    pub min_residual_diagonal: f64,
    /// Largest absolute entry of the unpivoted Schur complement, relative to the input scale.
    pub residual_norm: f64,
}

impl PivotedRank {
    /// Whether the factored matrix is positive semi-definite up to rounding.
    #[must_use]
    pub fn is_positive_semidefinite(&self) -> bool {
        self.min_residual_diagonal >= 0.0 && self.residual_norm <= PSD_TOLERANCE
    }
}

/// Rank-revealing pivoted Cholesky for symmetric positive semi-definite matrices.
#[must_use]
pub fn pivoted_rank(matrix: &Mat<f64>) -> PivotedRank {
    let dim = matrix.nrows();
    let mut work = matrix.clone();
    let scale = (0..dim)
        .map(|idx| matrix[(idx, idx)].abs())
        .fold(0.0, f64::max)
        .max(f64::MIN_POSITIVE);
    let threshold = RANK_TOLERANCE * scale * usize_to_f64(dim.max(1));
    let mut active: Vec<usize> = (0..dim).collect();
    let mut pivots = Vec::with_capacity(dim);
    let mut min_residual_diagonal = 0.0_f64;

    while !active.is_empty() {
        let (position, pivot) = active
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| work[(*a, *a)].total_cmp(&work[(*b, *b)]))
            .unwrap_or((0, active[0]));
        let value = work[(pivot, pivot)];
        if value <= threshold {
            break;
        }
        active.swap_remove(position);
        for &row in &active {
            let factor = work[(row, pivot)] / value;
            for &col in &active {
                work[(row, col)] -= factor * work[(pivot, col)];
            }
        }
        pivots.push(pivot);
    }
    let mut residual_norm = 0.0_f64;
    for &row in &active {
        min_residual_diagonal = min_residual_diagonal.min(work[(row, row)]);
        for &col in &active {
            residual_norm = residual_norm.max(work[(row, col)].abs());
        }
    }
    active.sort_unstable();

    PivotedRank {
        rank: pivots.len(),
        pivots,
        remaining: active,
        min_residual_diagonal: if min_residual_diagonal < -threshold {
            min_residual_diagonal
        } else {
            0.0
        },
        residual_norm: residual_norm / scale,
    }
}

/// Build a sparse matrix from `(row, col, value)` entries, summing duplicates.
///
/// # Errors
///
/// Returns `LinalgError::SparseConstruction` if an entry is out of bounds.
pub fn sparse_from_entries(
    nrows: usize,
    ncols: usize,
    entries: impl IntoIterator<Item = (usize, usize, f64)>,
) -> Result<SparseColMat<usize, f64>, LinalgError> {
    let mut merged = std::collections::BTreeMap::<(usize, usize), f64>::new();
    for (row, col, value) in entries {
        if row >= nrows || col >= ncols {
            return Err(LinalgError::SparseConstruction {
                rows: nrows,
                cols: ncols,
            });
        }
        *merged.entry((col, row)).or_insert(0.0) += value;
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = merged
        .into_iter()
        .filter(|(_, value)| *value != 0.0)
        .map(|((col, row), value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(|_| {
        LinalgError::SparseConstruction {
            rows: nrows,
            cols: ncols,
        }
    })
}

/// Visit every stored entry of a sparse matrix as `(row, col, value)`.
pub fn for_each_sparse_entry(
    matrix: &SparseColMat<usize, f64>,
    mut f: impl FnMut(usize, usize, f64),
) {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            f(row_idx[idx], col, values[idx]);
        }
    }
}

/// Sparse matrix-vector product `A x`.
#[must_use]
pub fn sparse_mul_vec(matrix: &SparseColMat<usize, f64>, vector: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; matrix.nrows()];
    for_each_sparse_entry(matrix, |row, col, value| {
        out[row] += value * vector[col];
    });
    out
}

/// Dense copy of a sparse matrix.
#[must_use]
pub fn sparse_to_dense(matrix: &SparseColMat<usize, f64>) -> Mat<f64> {
    let mut dense = Mat::<f64>::zeros(matrix.nrows(), matrix.ncols());
    for_each_sparse_entry(matrix, |row, col, value| {
        dense[(row, col)] += value;
    });
    dense
}

/// Row-wise nonzero lists of a sparse matrix.
#[must_use]
pub fn sparse_rows(matrix: &SparseColMat<usize, f64>) -> Vec<Vec<(usize, f64)>> {
    let mut rows = vec![Vec::new(); matrix.nrows()];
    for_each_sparse_entry(matrix, |row, col, value| rows[row].push((col, value)));
    rows
}

/// Quadratic form `xᵀ A x` for a sparse matrix.
#[must_use]
pub fn sparse_quadratic_form(matrix: &SparseColMat<usize, f64>, x: &[f64]) -> f64 {
    let mut total = 0.0;
    for_each_sparse_entry(matrix, |row, col, value| {
        total += x[row] * value * x[col];
    });
    total
}

/// `Σ_k scale_k A_k` over matrices of the same shape.
///
/// # Errors
///
/// Returns `LinalgError::SparseConstruction` if the shapes differ.
pub fn sparse_linear_combination(
    terms: &[(f64, &SparseColMat<usize, f64>)],
) -> Result<SparseColMat<usize, f64>, LinalgError> {
    let (nrows, ncols) = terms
        .first()
        .map_or((0, 0), |(_, matrix)| (matrix.nrows(), matrix.ncols()));
    let mut entries = Vec::new();
    for (scale, matrix) in terms {
        if matrix.nrows() != nrows || matrix.ncols() != ncols {
            return Err(LinalgError::SparseConstruction {
                rows: nrows,
                cols: ncols,
            });
        }
        for_each_sparse_entry(matrix, |row, col, value| entries.push((row, col, scale * value)));
    }
    sparse_from_entries(nrows, ncols, entries)
}

/// Sparse copy of a dense matrix, dropping exact zeros.
///
/// # Errors
///
/// Returns `LinalgError::SparseConstruction` if faer rejects the entries.
pub fn sparse_from_dense(matrix: &Mat<f64>) -> Result<SparseColMat<usize, f64>, LinalgError> {
    let entries = (0..matrix.ncols()).flat_map(move |col| {
        (0..matrix.nrows()).map(move |row| (row, col, matrix[(row, col)]))
    });
    sparse_from_entries(matrix.nrows(), matrix.ncols(), entries)
}

/// Diagonal sparse matrix.
///
/// # Errors
///
/// Returns `LinalgError::SparseConstruction` if faer rejects the entries.
pub fn sparse_diagonal(values: &[f64]) -> Result<SparseColMat<usize, f64>, LinalgError> {
    sparse_from_entries(
        values.len(),
        values.len(),
        values.iter().enumerate().map(|(idx, &value)| (idx, idx, value)),
    )
}

#[must_use]
pub fn sparse_is_finite(matrix: &SparseColMat<usize, f64>) -> bool {
    matrix.val().iter().all(|value| value.is_finite())
}

/// Dense matrix-vector product.
#[must_use]
pub fn dense_mul_vec(matrix: &Mat<f64>, x: &[f64]) -> Vec<f64> {
    (0..matrix.nrows())
        .map(|row| (0..matrix.ncols()).map(|col| matrix[(row, col)] * x[col]).sum())
        .collect()
}

/// Dense transpose-matrix-vector product `Aᵀ x`.
#[must_use]
pub fn dense_transpose_mul_vec(matrix: &Mat<f64>, x: &[f64]) -> Vec<f64> {
    (0..matrix.ncols())
        .map(|col| (0..matrix.nrows()).map(|row| matrix[(row, col)] * x[row]).sum())
        .collect()
}

#[must_use]
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

#[must_use]
pub fn is_symmetric(matrix: &Mat<f64>, tolerance: f64) -> bool {
    let dim = matrix.nrows();
    if matrix.ncols() != dim {
        return false;
    }
    for row in 0..dim {
        for col in (row + 1)..dim {
            let scale = matrix[(row, col)].abs().max(matrix[(col, row)].abs()).max(1.0);
            if (matrix[(row, col)] - matrix[(col, row)]).abs() > tolerance * scale {
                return false;
            }
        }
    }
    true
}

pub fn usize_to_f64(value: usize) -> f64 {
    value.to_f64().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 4.0,
            (1, 1) => 5.0,
            (2, 2) => 6.0,
            (0, 1) | (1, 0) => 2.0,
            (1, 2) | (2, 1) => 1.0,
            _ => 0.0,
        })
    }

    #[test]
    fn sparse_cholesky_solve_recovers_rhs() {
        let matrix = spd();
        let factor =
            SparseCholesky::new(&sparse_from_dense(&matrix).expect("sparse")).expect("spd factor");
        let solution = factor.solve(&[1.0, 2.0, 3.0]).expect("finite solve");
        let back = dense_mul_vec(&matrix, &solution);
        assert_relative_eq!(back[0], 1.0, epsilon = 1.0e-12);
        assert_relative_eq!(back[1], 2.0, epsilon = 1.0e-12);
        assert_relative_eq!(back[2], 3.0, epsilon = 1.0e-12);
    }

    #[test]
    fn sparse_cholesky_rejects_singular_matrix() {
        let singular = sparse_from_dense(&Mat::from_fn(2, 2, |_, _| 1.0)).expect("sparse");
        let err = SparseCholesky::new(&singular).expect_err("singular matrix should fail");
        assert_eq!(err, LinalgError::NotPositiveDefinite);
    }

    #[test]
    fn log_determinant_matches_dense_determinant() {
        let diagonal = sparse_diagonal(&[2.0, 3.0, 4.0]).expect("diagonal");
        let factor = SparseCholesky::new(&diagonal).expect("diagonal factor");
        assert_relative_eq!(factor.log_determinant(), 24.0_f64.ln(), epsilon = 1.0e-12);

        // det = 4(30 - 1) - 2(12) = 92
        let factor =
            SparseCholesky::new(&sparse_from_dense(&spd()).expect("sparse")).expect("spd factor");
        assert_relative_eq!(factor.log_determinant(), 92.0_f64.ln(), epsilon = 1.0e-12);
    }

    #[test]
    fn upper_solve_whitens_the_quadratic_form() {
        // x = Πᵀ L⁻ᵀ z gives xᵀ A x = zᵀ z.
        let matrix = sparse_from_dense(&spd()).expect("sparse");
        let factor = SparseCholesky::new(&matrix).expect("spd factor");
        let noise = [0.3, -1.2, 0.8];
        let x = factor.solve_upper(&noise);
        let norm: f64 = noise.iter().map(|value| value * value).sum();
        assert_relative_eq!(sparse_quadratic_form(&matrix, &x), norm, epsilon = 1.0e-12);
    }

    #[test]
    fn long_path_precision_factors_without_dense_fill() {
        let dim = 2_000;
        let entries = (0..dim).flat_map(|idx| {
            let mut row = vec![(idx, idx, 2.5)];
            if idx + 1 < dim {
                row.push((idx, idx + 1, -1.0));
                row.push((idx + 1, idx, -1.0));
            }
            row
        });
        let matrix = sparse_from_entries(dim, dim, entries).expect("tridiagonal");
        let factor = SparseCholesky::new(&matrix).expect("diagonally dominant");
        assert!(factor.factor_nnz() < 4 * dim, "nnz {}", factor.factor_nnz());
        let rhs = vec![1.0; dim];
        let solution = factor.solve(&rhs).expect("finite");
        let back = sparse_mul_vec(&matrix, &solution);
        for value in back {
            assert_relative_eq!(value, 1.0, epsilon = 1.0e-10);
        }
    }

    #[test]
    fn pivoted_rank_detects_rank_one() {
        let ones = Mat::from_fn(3, 3, |_, _| 1.0);
        let rank = pivoted_rank(&ones);
        assert_eq!(rank.rank, 1);
        assert_eq!(rank.remaining.len(), 2);
        assert!(rank.is_positive_semidefinite());
    }

    #[test]
    fn pivoted_rank_flags_indefinite_residual() {
        let swap = Mat::from_fn(2, 2, |i, j| if i == j { 0.0 } else { 1.0 });
        assert!(!pivoted_rank(&swap).is_positive_semidefinite());
    }

    #[test]
    fn sparse_entries_are_merged() {
        let matrix = sparse_from_entries(2, 2, [(0, 0, 1.0), (0, 0, 2.0), (1, 0, -1.0)])
            .expect("in-bounds entries");
        let dense = sparse_to_dense(&matrix);
        assert_relative_eq!(dense[(0, 0)], 3.0);
        assert_relative_eq!(dense[(1, 0)], -1.0);
        assert_eq!(sparse_mul_vec(&matrix, &[1.0, 5.0]), vec![3.0, -1.0]);
    }

    #[test]
    fn linear_combination_scales_and_sums() {
        let a = sparse_diagonal(&[1.0, 2.0]).expect("a");
        let b = sparse_from_entries(2, 2, [(0, 1, 1.0), (1, 0, 1.0)]).expect("b");
        let combined = sparse_linear_combination(&[(3.0, &a), (0.5, &b)]).expect("same shape");
        let dense = sparse_to_dense(&combined);
        assert_relative_eq!(dense[(0, 0)], 3.0);
        assert_relative_eq!(dense[(1, 1)], 6.0);
        assert_relative_eq!(dense[(0, 1)], 0.5);
        let other = sparse_diagonal(&[1.0]).expect("other");
        assert!(sparse_linear_combination(&[(1.0, &a), (1.0, &other)]).is_err());
    }

    #[test]
    fn matrix_is_finite_detects_nan() {
        let matrix = Mat::from_fn(2, 1, |i, _| if i == 0 { 1.0 } else { f64::NAN });
        assert!(!matrix_is_finite(&matrix));
    }
}
