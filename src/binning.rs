//! The (z, k) grid. Every bin lookup in the pipeline goes through [`BinEdges`],
//! and every bin is half-open: `[lo, hi)`.
use crate::constants::{BIN_CENTER_DECIMALS, Z_SPACING_TOLERANCE};
use crate::error::ConfigError;
use crate::utils::{is_strictly_increasing, round_to};
use crate::{KBinIndex, ZBinIndex};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinEdges {
    z: Vec<f64>,
    k: Vec<f64>,
}

/// Redshift and wavenumber bin of every sample of a table. Computed once per run,
/// then shared read-only by the aggregation and covariance workers.
#[derive(Debug, Clone)]
pub struct SampleBins {
    pub z_index: Vec<Option<ZBinIndex>>,
    pub k_index: Vec<Option<KBinIndex>>,
}

impl BinEdges {
    /// Constructs the grid, checking that both sets of edges are usable.
    pub fn new(z: Vec<f64>, k: Vec<f64>) -> Result<Self, ConfigError> {
        if z.len() < 2 || !is_strictly_increasing(&z) {
            return Err(ConfigError::InvalidEdges { axis: "redshift" });
        }
        if k.len() < 2 || !is_strictly_increasing(&k) {
            return Err(ConfigError::InvalidEdges { axis: "wavenumber" });
        }
        Ok(BinEdges { z, k })
    }

    pub fn z_edges(&self) -> &[f64] {
        &self.z
    }

    pub fn k_edges(&self) -> &[f64] {
        &self.k
    }

    pub fn nbins_z(&self) -> usize {
        self.z.len() - 1
    }

    pub fn nbins_k(&self) -> usize {
        self.k.len() - 1
    }

    /// Number of (z, k) cells.
    pub fn ncells(&self) -> usize {
        self.nbins_z() * self.nbins_k()
    }

    /// Row of cell `(izbin, ikbin)` in the mean table.
    pub fn cell_index(&self, izbin: ZBinIndex, ikbin: KBinIndex) -> usize {
        izbin * self.nbins_k() + ikbin
    }

    pub fn k_min(&self) -> f64 {
        self.k[0]
    }

    pub fn k_max(&self) -> f64 {
        self.k[self.k.len() - 1]
    }

    pub fn z_bounds(&self, izbin: ZBinIndex) -> (f64, f64) {
        (self.z[izbin], self.z[izbin + 1])
    }

    pub fn k_bounds(&self, ikbin: KBinIndex) -> (f64, f64) {
        (self.k[ikbin], self.k[ikbin + 1])
    }

    /// Redshift bin centers, rounded to 5 decimals.
    pub fn z_centers(&self) -> Vec<f64> {
        self.z
            .windows(2)
            .map(|pair| round_to((pair[0] + pair[1]) / 2.0, BIN_CENTER_DECIMALS))
            .collect()
    }

    pub fn k_centers(&self) -> Vec<f64> {
        self.k.windows(2).map(|pair| (pair[0] + pair[1]) / 2.0).collect()
    }

    pub fn z_index(&self, z: f64) -> Option<ZBinIndex> {
        bin_index(&self.z, z)
    }

    pub fn k_index(&self, k: f64) -> Option<KBinIndex> {
        bin_index(&self.k, k)
    }

    /// Assigns every sample to its z and k bin.
    pub fn assign<'a>(
        &self,
        z: impl IntoIterator<Item = &'a f64>,
        k: impl IntoIterator<Item = &'a f64>,
    ) -> SampleBins {
        SampleBins {
            z_index: z.into_iter().map(|&z| self.z_index(z)).collect(),
            k_index: k.into_iter().map(|&k| self.k_index(k)).collect(),
        }
    }

    /// Number of entries of `z_array` falling in each redshift bin.
    pub fn count_z(&self, z_array: &[f64]) -> Vec<usize> {
        let mut counts = vec![0; self.nbins_z()];
        for izbin in z_array.iter().filter_map(|&z| self.z_index(z)) {
            counts[izbin] += 1;
        }
        counts
    }

    /// Spacing between redshift bin centers, required to be uniform when
    /// chunks are shared between neighbouring redshift bins.
    ///
    /// With a single redshift bin the spacing is the width of that bin.
    pub fn z_spacing(&self) -> Result<f64, ConfigError> {
        let centers = self.z_centers();
        if centers.len() < 2 {
            return Ok(self.z[1] - self.z[0]);
        }

        let deltas: Vec<f64> = centers.windows(2).map(|pair| pair[1] - pair[0]).collect();
        let reference = deltas[0];
        let uniform = deltas
            .iter()
            .all(|delta| (delta - reference).abs() <= Z_SPACING_TOLERANCE + 1.0e-5 * reference.abs());

        if uniform {
            Ok(reference)
        } else {
            Err(ConfigError::NonUniformZBins)
        }
    }
}

/// Half-open bin lookup. Values outside the edges, and NaNs, have no bin.
fn bin_index(edges: &[f64], x: f64) -> Option<usize> {
    let (first, last) = (edges[0], edges[edges.len() - 1]);
    if !(x >= first && x < last) {
        return None;
    }
    // Number of edges <= x, minus one, is the bin
    Some(edges.partition_point(|&edge| edge <= x) - 1)
}

#[test]
fn test_bin_lookup_is_half_open() {
    let edges = BinEdges::new(vec![1.5, 2.5], vec![0.05, 0.15, 0.25]).unwrap();
    assert_eq!(edges.k_index(0.05), Some(0));
    assert_eq!(edges.k_index(0.1), Some(0));
    assert_eq!(edges.k_index(0.15), Some(1));
    assert_eq!(edges.k_index(0.25), None);
    assert_eq!(edges.k_index(0.01), None);
    assert_eq!(edges.k_index(f64::NAN), None);
    assert_eq!(edges.z_index(2.5), None);
    assert_eq!(edges.z_index(1.5), Some(0));
}

#[test]
fn test_invalid_edges_are_rejected() {
    assert_eq!(
        BinEdges::new(vec![2.0], vec![0.1, 0.2]),
        Err(ConfigError::InvalidEdges { axis: "redshift" })
    );
    assert_eq!(
        BinEdges::new(vec![2.0, 3.0], vec![0.2, 0.1]),
        Err(ConfigError::InvalidEdges { axis: "wavenumber" })
    );
}

#[test]
fn test_grid_shape_and_cell_index() {
    let edges = BinEdges::new(vec![2.0, 2.2, 2.4, 2.6], vec![0.0, 0.1, 0.2]).unwrap();
    assert_eq!(edges.nbins_z(), 3);
    assert_eq!(edges.nbins_k(), 2);
    assert_eq!(edges.ncells(), 6);
    assert_eq!(edges.cell_index(2, 1), 5);
    assert_eq!(edges.z_centers(), vec![2.1, 2.3, 2.5]);
}

#[test]
fn test_count_z() {
    let edges = BinEdges::new(vec![2.0, 2.2, 2.4], vec![0.0, 0.1]).unwrap();
    let counts = edges.count_z(&[2.0, 2.1, 2.2, 2.39, 2.4, 1.0]);
    assert_eq!(counts, vec![2, 2]);
}

#[test]
fn test_z_spacing_uniform() {
    let edges = BinEdges::new(vec![2.0, 2.2, 2.4, 2.6], vec![0.0, 0.1]).unwrap();
    let spacing = edges.z_spacing().unwrap();
    assert!((spacing - 0.2).abs() < 1e-9);
}

#[test]
fn test_z_spacing_non_uniform() {
    let edges = BinEdges::new(vec![2.0, 2.2, 2.6], vec![0.0, 0.1]).unwrap();
    assert_eq!(edges.z_spacing(), Err(ConfigError::NonUniformZBins));
}
