use crate::transition::TransitionMatrix;
use bioreactor_common::NeighborTable;
use rayon::prelude::*;

/// Per-compartment cumulative distribution over neighbor slots.
///
/// Row-major and neighbor-indexed: column `k` of row `i` refers to the `k`-th
/// entry of row `i` of the neighbor table. A row stops at the first slot that
/// names the compartment itself; later columns stay at zero and are not part of
/// the distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeProbabilityTable {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
    lengths: Vec<usize>,
}

impl CumulativeProbabilityTable {
    /// Builds the table. Row `i`, column `k` holds
    /// `sum_{m <= k} M[i][n_m] / |M[i][i]|`, or zero when `M[i][i] == 0`.
    pub fn build(neighbors: &NeighborTable, matrix: &TransitionMatrix) -> Self {
        let n_rows = neighbors.n_rows();
        let n_cols = neighbors.n_cols();
        debug_assert_eq!(n_rows, matrix.n_compartments());

        let mut values = vec![0.0; n_rows * n_cols];
        let mut lengths = vec![0; n_rows];
        if n_cols == 0 {
            return Self { n_rows, n_cols, values, lengths };
        }

        values
            .par_chunks_mut(n_cols)
            .zip(lengths.par_iter_mut())
            .enumerate()
            .for_each(|(i, (row_out, len_out))| {
                let out_flow = matrix.coeff(i, i);
                let mut cumsum = 0.0;
                let mut count = 0;
                for &j in neighbors.row(i) {
                    if j == i {
                        break;
                    }
                    let proba =
                        if out_flow != 0.0 { matrix.coeff(i, j) / out_flow.abs() } else { 0.0 };
                    cumsum += proba;
                    row_out[count] = cumsum;
                    count += 1;
                }
                *len_out = count;
            });

        Self { n_rows, n_cols, values, lengths }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Populated part of row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        let start = i * self.n_cols;
        &self.values[start..start + self.lengths[i]]
    }

    /// Whole row `i`, zero padding included.
    pub fn padded_row(&self, i: usize) -> &[f64] {
        let start = i * self.n_cols;
        &self.values[start..start + self.n_cols]
    }
}
