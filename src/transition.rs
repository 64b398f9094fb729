use bioreactor_common::FlowSnapshot;
use rayon::prelude::*;

/// Signed transition-rate matrix between compartments.
///
/// Off-diagonal entries are kept in compressed sparse rows (only non-zero raw
/// flows are stored). The diagonal is kept dense: `M[i][i]` is minus the sum of
/// row `i`'s off-diagonal entries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    n_compartments: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    diagonal: Vec<f64>,
}

impl TransitionMatrix {
    /// Builds the matrix from a square row-major flow table (`[i * n + j]` is the
    /// flow from `i` to `j`). Values are copied as-is, NaN and negative included.
    pub fn build(flows: &[f64], n_compartments: usize) -> Self {
        debug_assert_eq!(flows.len(), n_compartments * n_compartments);

        // Each row is independent: copy its off-diagonal flows and sum them.
        let rows: Vec<(Vec<(usize, f64)>, f64)> = (0..n_compartments)
            .into_par_iter()
            .map(|i| {
                let raw = &flows[i * n_compartments..(i + 1) * n_compartments];
                let mut entries = Vec::new();
                let mut row_sum = 0.0;
                for (j, &value) in raw.iter().enumerate() {
                    if j == i {
                        continue;
                    }
                    // NaN compares unequal to zero, so it is stored and propagates.
                    if value != 0.0 {
                        entries.push((j, value));
                    }
                    row_sum += value;
                }
                (entries, -row_sum)
            })
            .collect();

        let nnz = rows.iter().map(|(entries, _)| entries.len()).sum();
        let mut row_offsets = Vec::with_capacity(n_compartments + 1);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        let mut diagonal = Vec::with_capacity(n_compartments);
        row_offsets.push(0);
        for (entries, diag) in rows {
            for (j, value) in entries {
                col_indices.push(j);
                values.push(value);
            }
            row_offsets.push(col_indices.len());
            diagonal.push(diag);
        }

        Self { n_compartments, row_offsets, col_indices, values, diagonal }
    }

    /// Liquid-phase matrix of a snapshot.
    pub fn from_snapshot(snapshot: &FlowSnapshot) -> Self {
        Self::build(snapshot.liquid_flow(), snapshot.n_compartments())
    }

    /// Matrix with no exchange at all between compartments.
    pub fn empty(n_compartments: usize) -> Self {
        Self {
            n_compartments,
            row_offsets: vec![0; n_compartments + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
            diagonal: vec![0.0; n_compartments],
        }
    }

    pub fn n_compartments(&self) -> usize {
        self.n_compartments
    }

    /// Number of stored off-diagonal entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Entry `M[i][j]`; absent off-diagonal entries are zero.
    pub fn coeff(&self, i: usize, j: usize) -> f64 {
        if i == j {
            return self.diagonal[i];
        }
        let range = self.row_offsets[i]..self.row_offsets[i + 1];
        match self.col_indices[range.clone()].binary_search(&j) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.0,
        }
    }

    /// Stored off-diagonal entries of row `i`, in column order.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_offsets[i]..self.row_offsets[i + 1];
        self.col_indices[range.clone()].iter().copied().zip(self.values[range].iter().copied())
    }

    /// Raw diagonal, `M[i][i]` (non-positive for non-negative flows).
    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    /// Negated diagonal: total outflow rate of each compartment.
    pub fn outflow(&self) -> Vec<f64> {
        self.diagonal.iter().map(|d| -d).collect()
    }

    /// Dense row-major copy. Only meant for small matrices.
    pub fn to_dense(&self) -> Vec<f64> {
        let n = self.n_compartments;
        let mut dense = vec![0.0; n * n];
        for i in 0..n {
            dense[i * n + i] = self.diagonal[i];
            for (j, value) in self.row(i) {
                dense[i * n + j] = value;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn three_compartment_scenario() {
        let flows = [0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 1.0, 0.0];
        let matrix = TransitionMatrix::build(&flows, 3);
        assert_eq!(matrix.to_dense(), vec![-2.0, 2.0, 0.0, 1.0, -4.0, 3.0, 0.0, 1.0, -1.0]);
        assert_eq!(matrix.outflow(), vec![2.0, 4.0, 1.0]);
        assert_eq!(matrix.nnz(), 4);
    }

    #[test]
    fn raw_diagonal_of_flow_table_is_ignored() {
        let flows = [7.0, 1.0, 2.0, 9.0];
        let matrix = TransitionMatrix::build(&flows, 2);
        assert_eq!(matrix.coeff(0, 0), -1.0);
        assert_eq!(matrix.coeff(1, 1), -2.0);
    }

    #[test]
    fn nan_and_negative_flows_propagate() {
        let flows = [0.0, f64::NAN, 0.0, -1.0, 0.0, 0.5, 0.0, 0.0, 0.0];
        let matrix = TransitionMatrix::build(&flows, 3);
        assert!(matrix.coeff(0, 1).is_nan());
        assert!(matrix.coeff(0, 0).is_nan());
        assert_eq!(matrix.coeff(1, 0), -1.0);
        assert_eq!(matrix.coeff(1, 1), 0.5);
        assert_eq!(matrix.coeff(2, 2), 0.0);
    }

    #[test]
    fn empty_matrix_has_no_outflow() {
        let matrix = TransitionMatrix::empty(4);
        assert_eq!(matrix.outflow(), vec![0.0; 4]);
        assert_eq!(matrix.row(2).count(), 0);
    }

    fn flow_table() -> impl Strategy<Value = (usize, Vec<f64>)> {
        (1usize..12).prop_flat_map(|n| {
            let cell = prop_oneof![3 => Just(0.0), 2 => 0.0f64..100.0];
            (Just(n), prop::collection::vec(cell, n * n))
        })
    }

    proptest! {
        #[test]
        fn diagonal_conserves_row_outflow((n, flows) in flow_table()) {
            let matrix = TransitionMatrix::build(&flows, n);
            for i in 0..n {
                let off: f64 = (0..n).filter(|&j| j != i).map(|j| matrix.coeff(i, j)).sum();
                assert_abs_diff_eq!(matrix.coeff(i, i), -off, epsilon = 1e-5);
                for j in (0..n).filter(|&j| j != i) {
                    prop_assert_eq!(matrix.coeff(i, j), flows[i * n + j]);
                }
            }
        }
    }
}
