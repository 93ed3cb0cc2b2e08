//! Sparse matrices and the mesh Laplacian
//!
//! A minimal CSR representation sized for the deformer: symmetric positive
//! semi-definite operators around 5k x 5k with vertex-degree sparsity.

use std::collections::BTreeSet;

use rayon::prelude::*;

/// Compressed sparse row matrix, `f64` values.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    pub n_rows: usize,
    pub n_cols: usize,
    pub row_ptr: Vec<usize>,
    pub col_idx: Vec<usize>,
    pub values: Vec<f64>,
}

impl CsrMatrix {
    /// Build from per-row sorted `(col, value)` entries.
    fn from_rows(n_cols: usize, rows: Vec<Vec<(usize, f64)>>) -> Self {
        let n_rows = rows.len();
        let nnz: usize = rows.iter().map(|r| r.len()).sum();
        let mut row_ptr = Vec::with_capacity(n_rows + 1);
        let mut col_idx = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);

        row_ptr.push(0);
        for row in rows {
            for (col, value) in row {
                col_idx.push(col);
                values.push(value);
            }
            row_ptr.push(col_idx.len());
        }

        Self {
            n_rows,
            n_cols,
            row_ptr,
            col_idx,
            values,
        }
    }

    /// `y = self * x`, rows in parallel.
    pub fn spmv(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.n_cols);
        debug_assert_eq!(y.len(), self.n_rows);
        y.par_iter_mut().enumerate().for_each(|(row, out)| {
            let start = self.row_ptr[row];
            let end = self.row_ptr[row + 1];
            let mut acc = 0.0;
            for k in start..end {
                acc += self.values[k] * x[self.col_idx[k]];
            }
            *out = acc;
        });
    }

    pub fn diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.n_rows];
        for row in 0..self.n_rows {
            for k in self.row_ptr[row]..self.row_ptr[row + 1] {
                if self.col_idx[k] == row {
                    diag[row] = self.values[k];
                    break;
                }
            }
        }
        diag
    }

    /// Sparse-sparse product `self * other`.
    pub fn matmul(&self, other: &CsrMatrix) -> CsrMatrix {
        debug_assert_eq!(self.n_cols, other.n_rows);
        let rows: Vec<Vec<(usize, f64)>> = (0..self.n_rows)
            .into_par_iter()
            .map(|row| {
                let mut scratch: Vec<(usize, f64)> = Vec::new();
                for k in self.row_ptr[row]..self.row_ptr[row + 1] {
                    let a = self.values[k];
                    let mid = self.col_idx[k];
                    for j in other.row_ptr[mid]..other.row_ptr[mid + 1] {
                        scratch.push((other.col_idx[j], a * other.values[j]));
                    }
                }
                scratch.sort_by_key(|&(col, _)| col);
                let mut merged: Vec<(usize, f64)> = Vec::with_capacity(scratch.len());
                for (col, value) in scratch {
                    match merged.last_mut() {
                        Some(last) if last.0 == col => last.1 += value,
                        _ => merged.push((col, value)),
                    }
                }
                merged
            })
            .collect();
        CsrMatrix::from_rows(other.n_cols, rows)
    }

    /// A copy with every value multiplied by `alpha`.
    pub fn scaled(&self, alpha: f64) -> CsrMatrix {
        let mut out = self.clone();
        for v in out.values.iter_mut() {
            *v *= alpha;
        }
        out
    }

    pub fn row_sum(&self, row: usize) -> f64 {
        (self.row_ptr[row]..self.row_ptr[row + 1])
            .map(|k| self.values[k])
            .sum()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        for k in self.row_ptr[row]..self.row_ptr[row + 1] {
            if self.col_idx[k] == col {
                return self.values[k];
            }
        }
        0.0
    }
}

/// Uniform graph Laplacian over the mesh edges: `L_ii = deg(i)`,
/// `L_ij = -1` for neighbors. Symmetric, PSD, zero row sums.
pub fn build_laplacian(n_vertices: usize, faces: &[[u32; 3]]) -> CsrMatrix {
    let mut adjacency: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); n_vertices];
    for face in faces {
        for e in 0..3 {
            let a = face[e];
            let b = face[(e + 1) % 3];
            if a != b {
                adjacency[a as usize].insert(b);
                adjacency[b as usize].insert(a);
            }
        }
    }

    let rows: Vec<Vec<(usize, f64)>> = adjacency
        .iter()
        .enumerate()
        .map(|(i, neighbors)| {
            if neighbors.is_empty() {
                return Vec::new();
            }
            let mut row = Vec::with_capacity(neighbors.len() + 1);
            let mut placed_diag = false;
            for &j in neighbors {
                let j = j as usize;
                if !placed_diag && j > i {
                    row.push((i, neighbors.len() as f64));
                    placed_diag = true;
                }
                row.push((j, -1.0));
            }
            if !placed_diag {
                row.push((i, neighbors.len() as f64));
            }
            row
        })
        .collect();

    CsrMatrix::from_rows(n_vertices, rows)
}
