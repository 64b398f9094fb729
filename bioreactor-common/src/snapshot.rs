use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape problems found while assembling a snapshot or a neighbor table.
///
/// Only shapes and indices are checked here. Flow values themselves are never
/// validated: NaN or negative flows flow straight through to the builders.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("{what} has length {len}, expected {expected}")]
    Length { what: &'static str, len: usize, expected: usize },

    #[error("neighbor table of length {len} cannot be split into {rows} rows")]
    Ragged { len: usize, rows: usize },

    #[error("compartment {compartment} lists neighbor {neighbor} out of {n_compartments}")]
    NeighborOutOfRange { compartment: usize, neighbor: usize, n_compartments: usize },
}

/// Compartment adjacency: one row per compartment, a fixed number of neighbor
/// slots per row, stored row-major.
///
/// A slot holding the row's own index marks the end of the real neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborTable {
    n_rows: usize,
    n_cols: usize,
    data: Vec<usize>,
}

impl NeighborTable {
    /// Builds a table from flat row-major data split into `n_rows` rows.
    pub fn new(data: Vec<usize>, n_rows: usize) -> Result<Self, SnapshotError> {
        if n_rows == 0 {
            if data.is_empty() {
                return Ok(Self { n_rows: 0, n_cols: 0, data });
            }
            return Err(SnapshotError::Ragged { len: data.len(), rows: 0 });
        }
        if data.len() % n_rows != 0 {
            return Err(SnapshotError::Ragged { len: data.len(), rows: n_rows });
        }
        let n_cols = data.len() / n_rows;
        Ok(Self { n_rows, n_cols, data })
    }

    /// Builds a table from per-compartment lists, padding short rows with the
    /// compartment's own index.
    pub fn from_rows(rows: &[Vec<usize>]) -> Self {
        let n_rows = rows.len();
        let n_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for (i, row) in rows.iter().enumerate() {
            data.extend_from_slice(row);
            data.extend(std::iter::repeat(i).take(n_cols - row.len()));
        }
        Self { n_rows, n_cols, data }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of neighbor slots per row.
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn row(&self, compartment: usize) -> &[usize] {
        let start = compartment * self.n_cols;
        &self.data[start..start + self.n_cols]
    }

    /// Flat row-major view, as sent over the wire.
    pub fn as_slice(&self) -> &[usize] {
        &self.data
    }

    /// Checks that every listed neighbor is a valid compartment index.
    pub fn validate(&self, n_compartments: usize) -> Result<(), SnapshotError> {
        for compartment in 0..self.n_rows {
            if let Some(&neighbor) = self.row(compartment).iter().find(|&&j| j >= n_compartments) {
                return Err(SnapshotError::NeighborOutOfRange {
                    compartment,
                    neighbor,
                    n_compartments,
                });
            }
        }
        Ok(())
    }
}

/// One CFD-derived flow field: flows between compartments, volumes and
/// adjacency. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    n_compartments: usize,
    /// Square liquid flow table, row-major, `[i * n + j]` = flow from i to j.
    liquid_flow: Vec<f64>,
    /// Square gas flow table, present for two-phase cases.
    gas_flow: Option<Vec<f64>>,
    liquid_volume: Vec<f64>,
    gas_volume: Vec<f64>,
    neighbors: NeighborTable,
}

impl FlowSnapshot {
    /// Creates a single-phase snapshot. Gas volumes default to zero.
    pub fn new(
        liquid_flow: Vec<f64>,
        liquid_volume: Vec<f64>,
        neighbors: NeighborTable,
    ) -> Result<Self, SnapshotError> {
        let n = liquid_volume.len();
        check_len("liquid flow table", liquid_flow.len(), n * n)?;
        check_len("neighbor table rows", neighbors.n_rows(), n)?;
        neighbors.validate(n)?;
        Ok(Self {
            n_compartments: n,
            liquid_flow,
            gas_flow: None,
            liquid_volume,
            gas_volume: vec![0.0; n],
            neighbors,
        })
    }

    /// Attaches the gas phase.
    pub fn with_gas(
        mut self,
        gas_flow: Vec<f64>,
        gas_volume: Vec<f64>,
    ) -> Result<Self, SnapshotError> {
        let n = self.n_compartments;
        check_len("gas flow table", gas_flow.len(), n * n)?;
        check_len("gas volume vector", gas_volume.len(), n)?;
        self.gas_flow = Some(gas_flow);
        self.gas_volume = gas_volume;
        Ok(self)
    }

    pub fn n_compartments(&self) -> usize {
        self.n_compartments
    }

    pub fn liquid_flow(&self) -> &[f64] {
        &self.liquid_flow
    }

    pub fn gas_flow(&self) -> Option<&[f64]> {
        self.gas_flow.as_deref()
    }

    pub fn liquid_volume(&self) -> &[f64] {
        &self.liquid_volume
    }

    pub fn gas_volume(&self) -> &[f64] {
        &self.gas_volume
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Liquid flow from compartment `i` to compartment `j`.
    #[inline]
    pub fn flow(&self, i: usize, j: usize) -> f64 {
        self.liquid_flow[i * self.n_compartments + j]
    }
}

fn check_len(what: &'static str, len: usize, expected: usize) -> Result<(), SnapshotError> {
    if len != expected {
        return Err(SnapshotError::Length { what, len, expected });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_pads_with_own_index() {
        let table = NeighborTable::from_rows(&[vec![1], vec![0, 2], vec![1]]);
        assert_eq!(table.n_cols(), 2);
        assert_eq!(table.row(0), &[1, 0]);
        assert_eq!(table.row(1), &[0, 2]);
        assert_eq!(table.row(2), &[1, 2]);
    }

    #[test]
    fn ragged_neighbor_data_is_rejected() {
        let err = NeighborTable::new(vec![1, 0, 2], 2).unwrap_err();
        assert_eq!(err, SnapshotError::Ragged { len: 3, rows: 2 });
    }

    #[test]
    fn snapshot_checks_shapes_and_indices() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let err = FlowSnapshot::new(vec![0.0; 3], vec![1.0, 1.0], neighbors.clone()).unwrap_err();
        assert!(matches!(err, SnapshotError::Length { expected: 4, .. }));

        let bad = NeighborTable::from_rows(&[vec![5], vec![0]]);
        let err = FlowSnapshot::new(vec![0.0; 4], vec![1.0, 1.0], bad).unwrap_err();
        assert!(matches!(err, SnapshotError::NeighborOutOfRange { neighbor: 5, .. }));

        let snapshot =
            FlowSnapshot::new(vec![0.0, 2.0, 1.0, 0.0], vec![1.0, 1.0], neighbors).unwrap();
        assert_eq!(snapshot.flow(0, 1), 2.0);
        assert_eq!(snapshot.gas_volume(), &[0.0, 0.0]);
        assert!(snapshot.gas_flow().is_none());
    }

    #[test]
    fn negative_and_nan_flows_are_accepted() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let snapshot = FlowSnapshot::new(vec![0.0, -1.0, f64::NAN, 0.0], vec![1.0, 1.0], neighbors);
        assert!(snapshot.is_ok());
    }
}
