//! Per (z, k) cell statistics of every tracked quantity.
use crate::binning::{BinEdges, SampleBins};
use crate::ingest::{Pk1dTable, Quantity};
use crate::weights::{CellSample, Estimator};
use crate::{KBinIndex, ZBinIndex};
use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityStats {
    pub mean: f64,
    pub error: f64,
    pub min: f64,
    pub max: f64,
    /// `None` when medians are not computed.
    pub median: Option<f64>,
}

impl QuantityStats {
    pub fn undefined(medians: bool) -> Self {
        QuantityStats {
            mean: f64::NAN,
            error: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            median: medians.then_some(f64::NAN),
        }
    }
}

/// Statistics of one (z, k) cell. `stats` is aligned with the quantities of
/// the owning [`MeanStatTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanStatRow {
    pub zbin: f64,
    pub index_zbin: ZBinIndex,
    /// Number of chunk samples in the cell.
    pub n: usize,
    pub stats: Vec<QuantityStats>,
}

/// One row per cell, ordered by redshift bin then wavenumber bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanStatTable {
    pub quantities: Vec<Quantity>,
    pub nbins_k: usize,
    pub rows: Vec<MeanStatRow>,
}

impl MeanStatTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, izbin: ZBinIndex, ikbin: KBinIndex) -> &MeanStatRow {
        &self.rows[izbin * self.nbins_k + ikbin]
    }

    /// Statistics of `quantity` in cell `(izbin, ikbin)`, if that quantity is tracked.
    pub fn stats(&self, izbin: ZBinIndex, ikbin: KBinIndex, quantity: Quantity) -> Option<&QuantityStats> {
        let position = self.quantities.iter().position(|&q| q == quantity)?;
        Some(&self.row(izbin, ikbin).stats[position])
    }

    /// Mean of `quantity` for every cell, in row order.
    pub fn means(&self, quantity: Quantity) -> Option<Vec<f64>> {
        let position = self.quantities.iter().position(|&q| q == quantity)?;
        Some(self.rows.iter().map(|row| row.stats[position].mean).collect())
    }
}

/// Per redshift bin summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub z_min: f64,
    pub z_max: f64,
    pub k_min: f64,
    pub k_max: f64,
    /// Number of accepted chunks in the redshift bin.
    pub n_chunks: usize,
}

/// Variance vs SNR fit of `Pk` in one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnrFitRow {
    pub z: f64,
    pub k: f64,
    pub amplitude: f64,
    pub zeta: f64,
    pub standard_dev: Vec<f64>,
}

impl SnrFitRow {
    fn undefined(z: f64, k: f64, nbins_snr: usize) -> Self {
        SnrFitRow {
            z,
            k,
            amplitude: f64::NAN,
            zeta: f64::NAN,
            standard_dev: vec![f64::NAN; nbins_snr],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSettings {
    /// Spacing of the redshift bin centers. `Some` when chunks are shared
    /// between neighbouring redshift bins with proximity weights.
    pub z_spacing: Option<f64>,
    pub medians: bool,
    /// Number of SNR bins, when the SNR fit of `Pk` is exported.
    pub snrfit_bins: Option<usize>,
}

/// Rows of one redshift bin, as produced by one worker.
#[derive(Debug, Clone)]
pub struct ZBinBlock {
    pub izbin: ZBinIndex,
    pub rows: Vec<MeanStatRow>,
    pub snrfit: Vec<SnrFitRow>,
}

/// Members of every k bin of redshift bin `izbin`, with their redshift weights.
struct Members {
    indices: Vec<Vec<usize>>,
    z_weights: Option<Vec<Vec<f64>>>,
}

fn select_members(
    izbin: ZBinIndex,
    table: &Pk1dTable,
    sample_bins: &SampleBins,
    edges: &BinEdges,
    z_spacing: Option<f64>,
) -> Members {
    let nbins_k = edges.nbins_k();
    let mut indices = vec![vec![]; nbins_k];

    let Some(delta_z) = z_spacing else {
        for (i, (z_index, k_index)) in sample_bins.z_index.iter().zip(&sample_bins.k_index).enumerate() {
            if let (Some(iz), Some(ik)) = (z_index, k_index) {
                if *iz == izbin {
                    indices[*ik].push(i);
                }
            }
        }
        return Members {
            indices,
            z_weights: None,
        };
    };

    let centers = edges.z_centers();
    let center = centers[izbin];
    let edge_bin = izbin == 0 || izbin + 1 == edges.nbins_z();
    let mut z_weights = vec![vec![]; nbins_k];

    for (i, &z) in table.forest_z().iter().enumerate() {
        let Some(ik) = sample_bins.k_index[i] else {
            continue;
        };
        // First and last bins only use chunks within the bin, to avoid edge effects
        let selected = if edge_bin {
            sample_bins.z_index[i] == Some(izbin)
        } else {
            z > centers[izbin - 1] && z < centers[izbin + 1]
        };
        if selected {
            indices[ik].push(i);
            z_weights[ik].push(1.0 - (z - center).abs() / delta_z);
        }
    }

    Members {
        indices,
        z_weights: Some(z_weights),
    }
}

/// Computes the statistics of every cell of redshift bin `izbin`.
///
/// `n_chunks` is the number of accepted chunks in that redshift bin: when it
/// is zero every row of the bin is left undefined.
pub fn fill_average_pk_redshift(
    izbin: ZBinIndex,
    table: &Pk1dTable,
    sample_bins: &SampleBins,
    edges: &BinEdges,
    estimator: &dyn Estimator,
    settings: &AggregationSettings,
    n_chunks: usize,
) -> Result<ZBinBlock> {
    let nbins_k = edges.nbins_k();
    let zbin = edges.z_centers()[izbin];
    let k_centers = edges.k_centers();
    let quantities = table.quantities();

    let undefined_row = |n: usize| MeanStatRow {
        zbin,
        index_zbin: izbin,
        n,
        stats: vec![QuantityStats::undefined(settings.medians); quantities.len()],
    };
    let undefined_fit = |ikbin: KBinIndex| {
        settings
            .snrfit_bins
            .map(|nbins_snr| SnrFitRow::undefined(zbin, k_centers[ikbin], nbins_snr))
    };

    if n_chunks == 0 {
        return Ok(ZBinBlock {
            izbin,
            rows: (0..nbins_k).map(|_| undefined_row(0)).collect(),
            snrfit: (0..nbins_k).filter_map(undefined_fit).collect(),
        });
    }

    let members = select_members(izbin, table, sample_bins, edges, settings.z_spacing);
    let snr = table.forest_snr();

    let mut rows = Vec::with_capacity(nbins_k);
    let mut snrfit = Vec::with_capacity(nbins_k);
    for ikbin in 0..nbins_k {
        let cell = &members.indices[ikbin];
        let cell_z_weights = members.z_weights.as_ref().map(|z_weights| &z_weights[ikbin]);
        let (z_lo, z_hi) = edges.z_bounds(izbin);
        let (k_lo, k_hi) = edges.k_bounds(ikbin);

        if cell.is_empty() {
            log::warn!("0 chunks found in bin {z_lo}<z<{z_hi}, {k_lo}<k<{k_hi}");
            rows.push(undefined_row(0));
            snrfit.extend(undefined_fit(ikbin));
            continue;
        }

        let mut row = undefined_row(cell.len());
        let mut fit_row = undefined_fit(ikbin);
        for (position, &quantity) in quantities.iter().enumerate() {
            let Some(column) = table.column(quantity) else {
                continue;
            };

            // Drop NaN entries, along with their snr and redshift weight
            let mut values = Vec::with_capacity(cell.len());
            let mut member_snr = Vec::with_capacity(cell.len());
            let mut member_z_weights = Vec::with_capacity(cell.len());
            for (m, &i) in cell.iter().enumerate() {
                if column[i].is_nan() {
                    continue;
                }
                values.push(column[i]);
                member_snr.push(snr[i]);
                if let Some(z_weights) = cell_z_weights {
                    member_z_weights.push(z_weights[m]);
                }
            }
            let n_nan = cell.len() - values.len();
            if n_nan > 0 {
                log::warn!(
                    "{n_nan} nan values of {} detected in bin {z_lo}<z<{z_hi}, {k_lo}<k<{k_hi}",
                    quantity.name()
                );
            }
            if values.is_empty() {
                continue;
            }

            let sample = CellSample {
                values: &values,
                snr: &member_snr,
                z_weights: cell_z_weights.map(|_| member_z_weights.as_slice()),
            };
            let estimate = estimator.estimate(&sample).with_context(|| {
                format!(
                    "failed to average {} in bin {z_lo}<z<{z_hi}, {k_lo}<k<{k_hi}",
                    quantity.name()
                )
            })?;

            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let median = settings.medians.then(|| Data::new(values.clone()).median());
            row.stats[position] = QuantityStats {
                mean: estimate.mean,
                error: estimate.error,
                min,
                max,
                median,
            };

            if quantity == Quantity::Pk {
                if let (Some(fit_row), Some(fit)) = (fit_row.as_mut(), estimate.snr_fit) {
                    fit_row.amplitude = fit.amplitude;
                    fit_row.zeta = fit.zeta;
                    fit_row.standard_dev = fit.standard_dev;
                }
            }
        }

        rows.push(row);
        snrfit.extend(fit_row);
    }

    Ok(ZBinBlock { izbin, rows, snrfit })
}

/// Per redshift bin metadata, from the redshifts of the accepted chunks.
pub fn metadata_table(edges: &BinEdges, z_array: &[f64]) -> Vec<MetadataRow> {
    edges
        .count_z(z_array)
        .into_iter()
        .enumerate()
        .map(|(izbin, n_chunks)| {
            let (z_min, z_max) = edges.z_bounds(izbin);
            MetadataRow {
                z_min,
                z_max,
                k_min: edges.k_min(),
                k_max: edges.k_max(),
                n_chunks,
            }
        })
        .collect()
}

#[cfg(test)]
use crate::utils::loader::{ChunkHeader, Pk1dChunk};
#[cfg(test)]
use crate::weights::WeightMethod;
#[cfg(test)]
use ndarray::Array1;

#[cfg(test)]
fn flat_chunk(los_id: i64, mean_z: f64, mean_snr: f64, pk_raw: [f64; 2]) -> Pk1dChunk {
    Pk1dChunk::new(
        ChunkHeader {
            los_id,
            chunk_id: Some(0),
            mean_z,
            mean_snr,
        },
        Array1::from(vec![0.1, 0.2]),
        Array1::from(pk_raw.to_vec()),
        Array1::zeros(2),
        Array1::zeros(2),
        Array1::ones(2),
    )
}

#[cfg(test)]
const SETTINGS: AggregationSettings = AggregationSettings {
    z_spacing: None,
    medians: true,
    snrfit_bins: None,
};

#[cfg(test)]
fn aggregate(
    chunks: &[Pk1dChunk],
    edges: &BinEdges,
    method: WeightMethod,
    settings: &AggregationSettings,
) -> Result<Vec<ZBinBlock>> {
    let table = Pk1dTable::from_chunks(chunks).unwrap();
    let z_array: Vec<f64> = chunks.iter().map(|chunk| chunk.header.mean_z).collect();
    let n_chunks = edges.count_z(&z_array);
    let sample_bins = edges.assign(table.forest_z(), table.k());
    let estimator = method.estimator(crate::constants::MEANPK_FITRANGE_SNR);
    (0..edges.nbins_z())
        .map(|izbin| {
            let estimator = estimator.as_ref();
            fill_average_pk_redshift(izbin, &table, &sample_bins, edges, estimator, settings, n_chunks[izbin])
        })
        .collect()
}

#[test]
fn test_single_chunk_fills_both_k_bins() {
    let edges = BinEdges::new(vec![1.5, 2.5], vec![0.05, 0.15, 0.25]).unwrap();
    let blocks = aggregate(&[flat_chunk(1, 2.0, 5.0, [1.0, 1.0])], &edges, WeightMethod::NoWeights, &SETTINGS).unwrap();
    assert_eq!(blocks[0].rows.len(), 2);
    for row in blocks[0].rows.iter() {
        assert_eq!(row.n, 1);
        assert_eq!(row.zbin, 2.0);
        assert_eq!(row.stats[5].mean, 1.0);
    }
}

#[test]
fn test_identical_chunks_have_zero_error() {
    let edges = BinEdges::new(vec![1.5, 2.5], vec![0.05, 0.15, 0.25]).unwrap();
    let chunks: Vec<Pk1dChunk> = (0..3).map(|i| flat_chunk(i, 2.0, 5.0, [1.0, 1.0])).collect();
    let blocks = aggregate(&chunks, &edges, WeightMethod::NoWeights, &SETTINGS).unwrap();
    for row in blocks[0].rows.iter() {
        assert_eq!(row.n, 3);
        let pk = row.stats[5];
        assert_eq!(pk.mean, 1.0);
        assert_eq!(pk.error, 0.0);
        assert_eq!(pk.median, Some(1.0));
    }
}

#[test]
fn test_empty_cells_are_kept_with_nan() {
    let edges = BinEdges::new(vec![1.5, 2.5, 3.5], vec![0.05, 0.15, 0.25, 0.35]).unwrap();
    let chunks = vec![flat_chunk(1, 2.0, 5.0, [1.0, 1.0]), flat_chunk(2, 2.2, 5.0, [3.0, 3.0])];
    let blocks = aggregate(&chunks, &edges, WeightMethod::NoWeights, &SETTINGS).unwrap();

    // Every cell has a row, sparse input or not
    assert_eq!(blocks.iter().map(|block| block.rows.len()).sum::<usize>(), 6);

    // k bin without samples
    let row = &blocks[0].rows[2];
    assert_eq!(row.n, 0);
    assert!(row.stats.iter().all(|stats| stats.mean.is_nan() && stats.error.is_nan()));

    // Redshift bin without chunks
    assert!(blocks[1].rows.iter().all(|row| row.n == 0 && row.zbin == 3.0 && row.index_zbin == 1));
    assert!(blocks[1].rows[0].stats[5].mean.is_nan());

    let pk = blocks[0].rows[0].stats[5];
    assert_eq!(pk.mean, 2.0);
    assert_eq!((pk.min, pk.max), (1.0, 3.0));
}

#[test]
fn test_nan_values_are_ignored() {
    let edges = BinEdges::new(vec![1.5, 2.5], vec![0.05, 0.15, 0.25]).unwrap();
    let mut chunks: Vec<Pk1dChunk> = (0..3).map(|i| flat_chunk(i, 2.0, 5.0, [i as f64, 1.0])).collect();
    chunks[0].pk_diff = Array1::from(vec![f64::NAN, 0.0]);
    let blocks = aggregate(&chunks, &edges, WeightMethod::NoWeights, &SETTINGS).unwrap();

    let row = &blocks[0].rows[0];
    assert_eq!(row.n, 3);
    // Pk_diff is quantity 3
    assert_eq!(row.stats[3].mean, 0.0);
    assert_eq!(row.stats[1].mean, 1.0);
}

#[test]
fn test_simple_snr_fails_on_snr_of_one() {
    let edges = BinEdges::new(vec![1.5, 2.5], vec![0.05, 0.15, 0.25]).unwrap();
    let chunks = vec![flat_chunk(1, 2.0, 1.0, [1.0, 1.0]), flat_chunk(2, 2.0, 3.0, [1.0, 1.0])];
    assert!(aggregate(&chunks, &edges, WeightMethod::SimpleSnr, &SETTINGS).is_err());
}

#[test]
fn test_z_weights_share_chunks_between_bins() {
    let edges = BinEdges::new(vec![2.0, 2.2, 2.4, 2.6], vec![0.05, 0.15, 0.25]).unwrap();
    let settings = AggregationSettings {
        z_spacing: Some(edges.z_spacing().unwrap()),
        ..SETTINGS
    };
    // Centers are 2.1, 2.3 and 2.5
    let chunks = vec![
        flat_chunk(1, 2.15, 5.0, [1.0, 1.0]),
        flat_chunk(2, 2.3, 5.0, [2.0, 2.0]),
        flat_chunk(3, 2.45, 5.0, [4.0, 4.0]),
    ];
    let blocks = aggregate(&chunks, &edges, WeightMethod::NoWeights, &settings).unwrap();

    // Middle bin sees all three chunks
    let middle = &blocks[1].rows[0];
    assert_eq!(middle.n, 3);
    let weights = [0.25, 1.0, 0.25];
    let expected = (0.25 * 1.0 + 2.0 + 0.25 * 4.0) / weights.iter().sum::<f64>();
    assert!((middle.stats[5].mean - expected).abs() < 1e-9);

    // Edge bins only use their own chunks
    assert_eq!(blocks[0].rows[0].n, 1);
    assert_eq!(blocks[2].rows[0].n, 1);
}

#[test]
fn test_snrfit_rows_for_every_cell() {
    let edges = BinEdges::new(vec![1.5, 2.5, 3.5], vec![0.05, 0.15, 0.25]).unwrap();
    let settings = AggregationSettings {
        snrfit_bins: Some(9),
        ..SETTINGS
    };
    let chunks: Vec<Pk1dChunk> = (0..20)
        .map(|i| flat_chunk(i, 2.0, 2.5 + (i % 6) as f64, [1.0 + (i % 4) as f64, 1.0]))
        .collect();
    let blocks = aggregate(&chunks, &edges, WeightMethod::FitSnr, &settings).unwrap();

    assert_eq!(blocks[0].snrfit.len(), 2);
    assert_eq!(blocks[1].snrfit.len(), 2);
    let fitted = &blocks[0].snrfit[0];
    assert!(fitted.amplitude >= 0.0 && fitted.zeta >= 0.0);
    assert_eq!(fitted.standard_dev.len(), 9);
    assert!((fitted.k - 0.1).abs() < 1e-12);
    assert!(blocks[1].snrfit[0].amplitude.is_nan());
}

#[test]
fn test_metadata_table() {
    let edges = BinEdges::new(vec![1.5, 2.5, 3.5], vec![0.05, 0.15, 0.25]).unwrap();
    let metadata = metadata_table(&edges, &[2.0, 2.1, 3.0]);
    assert_eq!(metadata.len(), 2);
    assert_eq!(metadata[0].n_chunks, 2);
    assert_eq!(metadata[1].n_chunks, 1);
    assert_eq!((metadata[1].z_min, metadata[1].z_max), (2.5, 3.5));
    assert_eq!((metadata[0].k_min, metadata[0].k_max), (0.05, 0.25));
}
