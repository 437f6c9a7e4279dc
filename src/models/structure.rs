/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Structural matrices for GMRF priors: graph Laplacians and difference penalties.
//
// Created on: 18 Oct 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Structural matrices
//!
//! Sparse, symmetric positive semi-definite structure matrices for GMRF
//! random effects: graph Laplacians built from an adjacency relation,
//! difference penalties built from a small basis, and explicit matrices.
//!
//! Every matrix records its exact rank deficiency (nullity) and the diagonal
//! cells perturbed by [`Regularization`] to make it positive definite.

use std::collections::{BTreeMap, HashMap};

use faer::sparse::SparseColMat;
use thiserror::Error;

use crate::utils::{
    LinalgError, for_each_sparse_entry, is_symmetric, pivoted_rank, sparse_from_entries,
    sparse_is_finite, sparse_mul_vec, sparse_to_dense,
};

/// Default perturbation added to anchor cells.
pub const DEFAULT_ANCHOR_EPSILON: f64 = 1.0e-4;

const SYMMETRY_TOLERANCE: f64 = 1.0e-10;

/// Errors raised while building adjacency relations and structural matrices.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StructureError {
    #[error("structure must have at least one node")]
    Empty,
    #[error("node identifier `{0}` appears more than once")]
    DuplicateNode(String),
    #[error("edge ({from}, {to}) refers to a node outside 0..{nodes}")]
    NodeOutOfRange { from: usize, to: usize, nodes: usize },
    #[error("edge ({from}, {to}) has invalid weight {weight}")]
    InvalidEdgeWeight { from: usize, to: usize, weight: f64 },
    #[error("difference basis must contain at least one non-zero finite coefficient")]
    EmptyBasis,
    #[error("structural matrix must be square; found {rows} x {cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("structural matrix contains non-finite values")]
    NonFinite,
    #[error("structural matrix is not symmetric")]
    NotSymmetric,
    #[error("structural matrix is not positive semi-definite")]
    NotPositiveSemidefinite,
    #[error("regularization epsilon must be finite and positive; found {0}")]
    InvalidEpsilon(f64),
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Undirected, weighted adjacency relation over an ordered node list.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacency {
    node_ids: Vec<String>,
    /// Edge weights keyed by `(low, high)` node index.
    edges: BTreeMap<(usize, usize), f64>,
}

impl Adjacency {
    /// Build from ordered node identifiers and a node → neighbours mapping.
    ///
    /// Neighbours that are not in `node_ids` are ignored, self loops are
    /// dropped and the relation is symmetrized with unit weights.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` for empty or duplicated node lists.
    pub fn from_neighbor_map<S: AsRef<str>>(
        node_ids: Vec<String>,
        neighbors: &HashMap<String, Vec<S>>,
    ) -> Result<Self, StructureError> {
        if node_ids.is_empty() {
            return Err(StructureError::Empty);
        }
        let mut index = HashMap::with_capacity(node_ids.len());
        for (position, id) in node_ids.iter().enumerate() {
            if index.insert(id.as_str(), position).is_some() {
                return Err(StructureError::DuplicateNode(id.clone()));
            }
        }

        let mut edges = BTreeMap::new();
        let mut ignored = 0_usize;
        for (node, listed) in neighbors {
            let Some(&from) = index.get(node.as_str()) else {
                ignored += listed.len();
                continue;
            };
            for neighbor in listed {
                match index.get(neighbor.as_ref()) {
                    Some(&to) if to != from => {
                        edges.insert((from.min(to), from.max(to)), 1.0);
                    }
                    Some(_) => {}
                    None => ignored += 1,
                }
            }
        }
        if ignored > 0 {
            log::debug!("ignored {ignored} adjacency entries referring to nodes outside the model");
        }

        Ok(Self { node_ids, edges })
    }

    /// Unit-weight adjacency from index pairs; repeated pairs collapse.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` if an index is out of range or there are no nodes.
    pub fn from_edges(node_count: usize, edges: &[(usize, usize)]) -> Result<Self, StructureError> {
        let weighted: Vec<(usize, usize, f64)> =
            edges.iter().map(|&(from, to)| (from, to, 1.0)).collect();
        let mut adjacency = Self::from_weighted_edges(node_count, &weighted)?;
        for weight in adjacency.edges.values_mut() {
            *weight = 1.0;
        }
        Ok(adjacency)
    }

    /// Weighted adjacency from index triples; weights of repeated pairs add up.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` for out-of-range indices or negative/non-finite weights.
    pub fn from_weighted_edges(
        node_count: usize,
        edges: &[(usize, usize, f64)],
    ) -> Result<Self, StructureError> {
        if node_count == 0 {
            return Err(StructureError::Empty);
        }
        let mut merged = BTreeMap::new();
        for &(from, to, weight) in edges {
            if from >= node_count || to >= node_count {
                return Err(StructureError::NodeOutOfRange {
                    from,
                    to,
                    nodes: node_count,
                });
            }
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(StructureError::InvalidEdgeWeight { from, to, weight });
            }
            if from == to || weight == 0.0 {
                continue;
            }
            *merged.entry((from.min(to), from.max(to))).or_insert(0.0) += weight;
        }
        Ok(Self {
            node_ids: (0..node_count).map(|idx| idx.to_string()).collect(),
            edges: merged,
        })
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    #[must_use]
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Weighted degree of every node.
    #[must_use]
    pub fn degrees(&self) -> Vec<f64> {
        let mut degrees = vec![0.0; self.node_count()];
        for (&(low, high), &weight) in &self.edges {
            degrees[low] += weight;
            degrees[high] += weight;
        }
        degrees
    }

    /// Connected components, each sorted, ordered by their smallest node.
    #[must_use]
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut parent: Vec<usize> = (0..self.node_count()).collect();
        for &(low, high) in self.edges.keys() {
            let root_low = find_root(&mut parent, low);
            let root_high = find_root(&mut parent, high);
            if root_low != root_high {
                parent[root_low.max(root_high)] = root_low.min(root_high);
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for node in 0..self.node_count() {
            let root = find_root(&mut parent, node);
            groups.entry(root).or_default().push(node);
        }
        groups.into_values().collect()
    }
}

fn find_root(parent: &mut [usize], node: usize) -> usize {
    let mut root = node;
    while parent[root] != root {
        root = parent[root];
    }
    let mut current = node;
    while parent[current] != root {
        let next = parent[current];
        parent[current] = root;
        current = next;
    }
    root
}

/// How a structural matrix is made non-singular.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Regularization {
    /// Keep the matrix exactly as built, singular or not.
    Never,
    /// Perturb one anchor cell per null direction, only when rank deficient.
    WhenRankDeficient { epsilon: f64 },
    /// Always perturb: anchors for every null direction, or cell 0 for a full-rank matrix.
    Always { epsilon: f64 },
}

impl Default for Regularization {
    fn default() -> Self {
        Self::WhenRankDeficient {
            epsilon: DEFAULT_ANCHOR_EPSILON,
        }
    }
}

impl Regularization {
    fn resolve_anchors(
        self,
        rank_deficiency: usize,
        null_anchors: Vec<usize>,
    ) -> Result<(Vec<usize>, f64), StructureError> {
        let epsilon = match self {
            Self::Never => return Ok((Vec::new(), 0.0)),
            Self::WhenRankDeficient { epsilon } | Self::Always { epsilon } => epsilon,
        };
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(StructureError::InvalidEpsilon(epsilon));
        }
        match (self, rank_deficiency) {
            (Self::Always { .. }, 0) => Ok((vec![0], epsilon)),
            (_, 0) => Ok((Vec::new(), 0.0)),
            _ => Ok((null_anchors, epsilon)),
        }
    }
}

/// Construction method of a structural matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    /// Degree minus adjacency.
    GraphLaplacian,
    /// `DᵀD` for a banded difference operator.
    DifferenceBasis,
    /// Supplied directly by the caller.
    Explicit,
}

/// Immutable sparse structure (precision) matrix of one random-effect dimension.
#[derive(Debug, Clone)]
pub struct StructuralMatrix {
    kind: StructureKind,
    raw: SparseColMat<usize, f64>,
    regularized: SparseColMat<usize, f64>,
    rank_deficiency: usize,
    anchors: Vec<usize>,
    epsilon: f64,
    component_count: Option<usize>,
}

impl StructuralMatrix {
    /// Graph Laplacian `D - A` of an adjacency relation.
    ///
    /// The rank deficiency equals the number of connected components;
    /// anchors are the first node of each component.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` for an invalid regularization epsilon.
    pub fn from_adjacency(
        adjacency: &Adjacency,
        regularization: Regularization,
    ) -> Result<Self, StructureError> {
        let n = adjacency.node_count();
        let mut entries = Vec::with_capacity(4 * adjacency.edge_count());
        for (&(low, high), &weight) in &adjacency.edges {
            entries.push((low, low, weight));
            entries.push((high, high, weight));
            entries.push((low, high, -weight));
            entries.push((high, low, -weight));
        }
        let components = adjacency.connected_components();
        let first_nodes = components.iter().map(|component| component[0]).collect();
        let mut matrix = Self::assemble(
            StructureKind::GraphLaplacian,
            n,
            entries,
            components.len(),
            first_nodes,
            regularization,
        )?;
        matrix.component_count = Some(components.len());
        Ok(matrix)
    }

    /// Difference penalty `DᵀD` over `node_count` ordered nodes.
    ///
    /// Each row of `D` is `basis` shifted by one position, so `[-1, 1]` gives
    /// a first-order random walk. Leading and trailing zeros are ignored; for a
    /// basis of length `L` the rank deficiency is `min(node_count, L - 1)`,
    /// anchored at the first cells.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` for an empty basis, zero nodes, or an invalid epsilon.
    pub fn from_difference_basis(
        node_count: usize,
        basis: &[f64],
        regularization: Regularization,
    ) -> Result<Self, StructureError> {
        if node_count == 0 {
            return Err(StructureError::Empty);
        }
        if basis.iter().any(|value| !value.is_finite()) {
            return Err(StructureError::EmptyBasis);
        }
        let first = basis.iter().position(|value| *value != 0.0);
        let last = basis.iter().rposition(|value| *value != 0.0);
        let (Some(first), Some(last)) = (first, last) else {
            return Err(StructureError::EmptyBasis);
        };
        let trimmed = &basis[first..=last];
        let width = trimmed.len();

        let mut entries = Vec::new();
        if node_count >= width {
            for offset in 0..=(node_count - width) {
                for (j, bj) in trimmed.iter().enumerate() {
                    for (k, bk) in trimmed.iter().enumerate() {
                        entries.push((offset + j, offset + k, bj * bk));
                    }
                }
            }
        }
        let rank_deficiency = node_count.min(width - 1);
        Self::assemble(
            StructureKind::DifferenceBasis,
            node_count,
            entries,
            rank_deficiency,
            (0..rank_deficiency).collect(),
            regularization,
        )
    }

    /// Caller-supplied symmetric positive semi-definite matrix.
    ///
    /// The nullity is found with a diagonally pivoted Cholesky; anchors are the
    /// cells left unpivoted.
    ///
    /// # Errors
    ///
    /// Returns `StructureError` if the matrix is not square, symmetric, finite and PSD.
    pub fn from_explicit(
        matrix: &SparseColMat<usize, f64>,
        regularization: Regularization,
    ) -> Result<Self, StructureError> {
        let (rows, cols) = (matrix.nrows(), matrix.ncols());
        if rows != cols {
            return Err(StructureError::NotSquare { rows, cols });
        }
        if rows == 0 {
            return Err(StructureError::Empty);
        }
        if !sparse_is_finite(matrix) {
            return Err(StructureError::NonFinite);
        }
        let dense = sparse_to_dense(matrix);
        if !is_symmetric(&dense, SYMMETRY_TOLERANCE) {
            return Err(StructureError::NotSymmetric);
        }
        let rank = pivoted_rank(&dense);
        if !rank.is_positive_semidefinite() {
            return Err(StructureError::NotPositiveSemidefinite);
        }

        let mut entries = Vec::new();
        for_each_sparse_entry(matrix, |row, col, value| entries.push((row, col, value)));
        Self::assemble(
            StructureKind::Explicit,
            rows,
            entries,
            rows - rank.rank,
            rank.remaining,
            regularization,
        )
    }

    fn assemble(
        kind: StructureKind,
        n: usize,
        entries: Vec<(usize, usize, f64)>,
        rank_deficiency: usize,
        null_anchors: Vec<usize>,
        regularization: Regularization,
    ) -> Result<Self, StructureError> {
        let (anchors, epsilon) = regularization.resolve_anchors(rank_deficiency, null_anchors)?;
        let raw = sparse_from_entries(n, n, entries.iter().copied())?;
        let regularized = sparse_from_entries(
            n,
            n,
            entries
                .into_iter()
                .chain(anchors.iter().map(|&cell| (cell, cell, epsilon))),
        )?;
        Ok(Self {
            kind,
            raw,
            regularized,
            rank_deficiency,
            anchors,
            epsilon,
            component_count: None,
        })
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.raw.nrows()
    }

    #[must_use]
    pub const fn kind(&self) -> StructureKind {
        self.kind
    }

    /// Nullity of the matrix before regularization.
    #[must_use]
    pub const fn rank_deficiency(&self) -> usize {
        self.rank_deficiency
    }

    /// Nullity of the matrix actually used as a prior precision component.
    #[must_use]
    pub fn nullity_after_regularization(&self) -> usize {
        if self.anchors.is_empty() {
            self.rank_deficiency
        } else {
            0
        }
    }

    /// Diagonal cells perturbed by regularization.
    #[must_use]
    pub fn anchors(&self) -> &[usize] {
        &self.anchors
    }

    #[must_use]
    pub const fn regularization_epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of connected components, for graph Laplacians.
    #[must_use]
    pub const fn component_count(&self) -> Option<usize> {
        self.component_count
    }

    /// The (regularized) matrix used in the GMRF prior.
    #[must_use]
    pub const fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.regularized
    }

    /// The matrix exactly as built, before any anchor perturbation.
    #[must_use]
    pub const fn raw_matrix(&self) -> &SparseColMat<usize, f64> {
        &self.raw
    }

    #[must_use]
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        sparse_mul_vec(&self.regularized, x)
    }

    #[must_use]
    pub fn quadratic_form(&self, x: &[f64]) -> f64 {
        self.mul_vec(x).iter().zip(x).map(|(qx, xi)| qx * xi).sum()
    }

    #[must_use]
    pub fn to_dense(&self) -> faer::Mat<f64> {
        sparse_to_dense(&self.regularized)
    }
}
