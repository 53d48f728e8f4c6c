//! Covariance of the mean `Pk` between wavenumber bins, from the correlation
//! of samples belonging to the same sub-forest, and its bootstrap estimate.
use crate::binning::SampleBins;
use crate::{KBinIndex, Series, SubForestId, ZBinIndex};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// One coefficient of the covariance matrix of one redshift bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovarianceRow {
    pub zbin: f64,
    pub index_zbin: ZBinIndex,
    pub index_kbin: KBinIndex,
    pub index_kbin2: KBinIndex,
    /// Number of sample pairs entering the coefficient.
    pub n: usize,
    pub covariance: f64,
    pub boot_covariance: Option<f64>,
    pub error_boot_covariance: Option<f64>,
}

/// Covariance matrix of one redshift bin.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceBlock {
    pub izbin: ZBinIndex,
    pub n: Array2<usize>,
    pub covariance: Array2<f64>,
}

impl CovarianceBlock {
    fn undefined(izbin: ZBinIndex, nbins_k: usize) -> Self {
        CovarianceBlock {
            izbin,
            n: Array2::zeros((nbins_k, nbins_k)),
            covariance: Array2::from_elem((nbins_k, nbins_k), f64::NAN),
        }
    }
}

/// Samples of one redshift bin grouped by sub-forest. Keys are sorted and unique;
/// members of each group are table rows in table order.
#[derive(Debug, Clone, Default)]
pub struct SubForestGroups {
    pub keys: Vec<SubForestId>,
    pub members: Vec<Vec<usize>>,
}

impl SubForestGroups {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Every group once, in key order.
    pub fn all(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }
}

/// Groups the samples of redshift bin `izbin` by sub-forest.
pub fn group_sub_forests(
    izbin: ZBinIndex,
    sample_bins: &SampleBins,
    sub_forest_id: &[SubForestId],
) -> SubForestGroups {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, id) in sub_forest_id.iter().enumerate() {
        if sample_bins.z_index[i] == Some(izbin) {
            groups.entry(id.as_str()).or_default().push(i);
        }
    }

    let (keys, members) = groups
        .into_iter()
        .map(|(key, rows)| (key.to_string(), rows))
        .unzip();
    SubForestGroups { keys, members }
}

/// Covariance of `Pk` for redshift bin `izbin`, using the groups listed in
/// `selection` (repeated groups count repeatedly).
///
/// Within each group every pair of samples `(p, q >= p)` lying in valid k bins
/// contributes `Pk_p * Pk_q` to the upper-triangle cell of their two bins.
/// Each cell is then `(sum / n - mean_j * mean_j') / n` and mirrored.
///
/// Note the division by `n` is applied twice; this normalization is inherited
/// and still needs review.
pub fn compute_cov(
    izbin: ZBinIndex,
    groups: &SubForestGroups,
    selection: &[usize],
    pk: &Series,
    k_index: &[Option<KBinIndex>],
    mean_pk: &[f64],
    n_chunks: usize,
) -> CovarianceBlock {
    let nbins_k = mean_pk.len();
    if n_chunks == 0 {
        return CovarianceBlock::undefined(izbin, nbins_k);
    }

    let mut sum = Array2::<f64>::zeros((nbins_k, nbins_k));
    let mut n = Array2::<usize>::zeros((nbins_k, nbins_k));
    for &group in selection {
        let rows = &groups.members[group];
        for (p, &row) in rows.iter().enumerate() {
            let Some(ikbin) = k_index[row] else {
                continue;
            };
            for &row2 in &rows[p..] {
                let Some(ikbin2) = k_index[row2] else {
                    continue;
                };
                let cell = (ikbin.min(ikbin2), ikbin.max(ikbin2));
                sum[cell] += pk[row] * pk[row2];
                n[cell] += 1;
            }
        }
    }

    let mut covariance = Array2::<f64>::zeros((nbins_k, nbins_k));
    for ikbin in 0..nbins_k {
        for ikbin2 in ikbin..nbins_k {
            let count = n[(ikbin, ikbin2)] as f64;
            let value = (sum[(ikbin, ikbin2)] / count - mean_pk[ikbin] * mean_pk[ikbin2]) / count;
            covariance[(ikbin, ikbin2)] = value;
            covariance[(ikbin2, ikbin)] = value;
            n[(ikbin2, ikbin)] = n[(ikbin, ikbin2)];
        }
    }

    CovarianceBlock { izbin, n, covariance }
}

/// Draws `number_bootstrap` resamples, with replacement, of `n_groups` group
/// indices. Each resample has `n_groups` entries.
pub fn draw_bootstrap_resamples(rng: &mut StdRng, n_groups: usize, number_bootstrap: usize) -> Vec<Vec<usize>> {
    (0..number_bootstrap)
        .map(|_| {
            if n_groups == 0 {
                return vec![];
            }
            (0..n_groups).map(|_| rng.random_range(0..n_groups)).collect()
        })
        .collect()
}

/// Mean and (population) standard deviation over the bootstrap realizations.
pub fn bootstrap_summary(blocks: &[CovarianceBlock], nbins_k: usize) -> (Array2<f64>, Array2<f64>) {
    let mut mean = Array2::<f64>::zeros((nbins_k, nbins_k));
    let mut std = Array2::<f64>::zeros((nbins_k, nbins_k));
    for ikbin in 0..nbins_k {
        for ikbin2 in 0..nbins_k {
            let values: Vec<f64> = blocks.iter().map(|block| block.covariance[(ikbin, ikbin2)]).collect();
            mean[(ikbin, ikbin2)] = values.iter().mean();
            std[(ikbin, ikbin2)] = values.iter().population_std_dev();
        }
    }
    (mean, std)
}

/// Flattens a block into rows, `index_kbin` major.
pub fn covariance_rows(
    zbin: f64,
    block: &CovarianceBlock,
    bootstrap: Option<(&Array2<f64>, &Array2<f64>)>,
) -> Vec<CovarianceRow> {
    let nbins_k = block.covariance.nrows();
    let mut rows = Vec::with_capacity(nbins_k * nbins_k);
    for ikbin in 0..nbins_k {
        for ikbin2 in 0..nbins_k {
            let cell = (ikbin, ikbin2);
            rows.push(CovarianceRow {
                zbin,
                index_zbin: block.izbin,
                index_kbin: ikbin,
                index_kbin2: ikbin2,
                n: block.n[cell],
                covariance: block.covariance[cell],
                boot_covariance: bootstrap.map(|(mean, _)| mean[cell]),
                error_boot_covariance: bootstrap.map(|(_, std)| std[cell]),
            });
        }
    }
    rows
}

#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
fn grouped_samples() -> (SampleBins, Vec<SubForestId>, Series) {
    let sample_bins = SampleBins {
        z_index: vec![Some(0); 6],
        k_index: vec![Some(0), Some(1), Some(1), Some(0), None, Some(0)],
    };
    let ids = vec!["1_0", "1_0", "2_0", "2_0", "2_0", "3_0"]
        .into_iter()
        .map(String::from)
        .collect();
    let pk = Series::from(vec![1.0, 2.0, 4.0, 3.0, 100.0, 2.0]);
    (sample_bins, ids, pk)
}

#[test]
fn test_groups_are_sorted_and_restricted_to_bin() {
    let (mut sample_bins, ids, _) = grouped_samples();
    sample_bins.z_index[5] = Some(1);
    let groups = group_sub_forests(0, &sample_bins, &ids);
    assert_eq!(groups.keys, vec!["1_0", "2_0"]);
    assert_eq!(groups.members, vec![vec![0, 1], vec![2, 3, 4]]);
}

#[test]
fn test_covariance_by_hand() {
    let (sample_bins, ids, pk) = grouped_samples();
    let groups = group_sub_forests(0, &sample_bins, &ids);
    let mean_pk = [2.0, 3.0];
    let block = compute_cov(0, &groups, &groups.all(), &pk, &sample_bins.k_index, &mean_pk, 3);

    // (0,0): 1 + 9 + 4 over 3 pairs; (0,1): 2 + 12 over 2 pairs; (1,1): 4 + 16 over 2 pairs
    assert_eq!(block.n, ndarray::arr2(&[[3, 2], [2, 2]]));
    let expected = [
        [(14.0 / 3.0 - 4.0) / 3.0, (7.0 - 6.0) / 2.0],
        [(7.0 - 6.0) / 2.0, (10.0 - 9.0) / 2.0],
    ];
    for i in 0..2 {
        for j in 0..2 {
            assert!((block.covariance[(i, j)] - expected[i][j]).abs() < 1e-12);
        }
    }
}

#[test]
fn test_covariance_is_symmetric() {
    let sample_bins = SampleBins {
        z_index: vec![Some(0); 8],
        k_index: vec![Some(2), Some(0), Some(1), Some(2), Some(1), Some(0), Some(2), Some(1)],
    };
    let ids: Vec<SubForestId> = (0..8).map(|i| format!("{}_0", i % 2)).collect();
    let pk = Series::from(vec![1.3, 0.2, 5.1, 2.2, 0.7, 3.3, 1.1, 0.4]);
    let groups = group_sub_forests(0, &sample_bins, &ids);

    let block = compute_cov(0, &groups, &groups.all(), &pk, &sample_bins.k_index, &[1.0, 2.0, 3.0], 3);
    assert_eq!(block.covariance, block.covariance.t());
    assert_eq!(block.n, block.n.t());
}

#[test]
fn test_empty_redshift_bin_is_nan() {
    let groups = SubForestGroups::default();
    let block = compute_cov(4, &groups, &[], &Series::zeros(0), &[], &[1.0, 1.0], 0);
    assert_eq!(block.izbin, 4);
    assert!(block.covariance.iter().all(|c| c.is_nan()));
    assert!(block.n.iter().all(|&n| n == 0));

    let rows = covariance_rows(2.2, &block, None);
    assert_eq!(rows.len(), 4);
    assert_eq!((rows[1].index_kbin, rows[1].index_kbin2), (0, 1));
    assert!(rows.iter().all(|row| row.boot_covariance.is_none()));
}

#[test]
fn test_bootstrap_resamples_are_reproducible() {
    let a = draw_bootstrap_resamples(&mut StdRng::seed_from_u64(3), 5, 4);
    let b = draw_bootstrap_resamples(&mut StdRng::seed_from_u64(3), 5, 4);
    assert_eq!(a, b);
    assert_eq!(a.len(), 4);
    assert!(a.iter().all(|resample| resample.len() == 5 && resample.iter().all(|&i| i < 5)));
    assert!(draw_bootstrap_resamples(&mut StdRng::seed_from_u64(3), 0, 2).iter().all(Vec::is_empty));
}

#[test]
fn test_bootstrap_summary() {
    let block = |value: f64| CovarianceBlock {
        izbin: 0,
        n: Array2::ones((1, 1)),
        covariance: Array2::from_elem((1, 1), value),
    };
    let (mean, std) = bootstrap_summary(&[block(1.0), block(3.0)], 1);
    assert_eq!(mean[(0, 0)], 2.0);
    assert_eq!(std[(0, 0)], 1.0);
}
