//! Weighting strategies used to average a quantity over the chunks of one (z, k) cell.
//!
//! Each strategy implements [`Estimator`]; the run selects one through
//! [`WeightMethod`] and uses it for every cell.
use crate::constants::{MEANPK_FITRANGE_SNR, MIN_FIT_SNR, SIMPLE_SNR_LIMIT};
use crate::error::ConfigError;
use crate::utils::arange;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde_derive::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightMethod {
    /// Plain average.
    NoWeights,
    /// Weights computed directly from SNR. Kept for record, not recommended.
    SimpleSnr,
    /// Weights from a fit of the dispersion of the quantity against SNR.
    FitSnr,
}

impl FromStr for WeightMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_weights" => Ok(WeightMethod::NoWeights),
            "simple_snr" => Ok(WeightMethod::SimpleSnr),
            "fit_snr" => Ok(WeightMethod::FitSnr),
            other => Err(ConfigError::UnknownWeightMethod(other.to_string())),
        }
    }
}

impl fmt::Display for WeightMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WeightMethod::NoWeights => "no_weights",
            WeightMethod::SimpleSnr => "simple_snr",
            WeightMethod::FitSnr => "fit_snr",
        })
    }
}

impl WeightMethod {
    /// Builds the estimator for this method.
    pub fn estimator(self, snr_fit_range: [f64; 2]) -> Box<dyn Estimator> {
        match self {
            WeightMethod::NoWeights => Box::new(NoWeights),
            WeightMethod::SimpleSnr => Box::new(SimpleSnr),
            WeightMethod::FitSnr => Box::new(FitSnr::new(snr_fit_range)),
        }
    }
}

/// The values of one quantity over the members of a cell. NaN values must
/// already have been removed; `snr` and `z_weights` are aligned with `values`.
#[derive(Debug, Clone, Copy)]
pub struct CellSample<'a> {
    pub values: &'a [f64],
    pub snr: &'a [f64],
    /// Redshift proximity weights, when chunks are shared between redshift bins.
    pub z_weights: Option<&'a [f64]>,
}

impl CellSample<'_> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub mean: f64,
    pub error: f64,
    /// Only produced by the SNR fit strategy.
    pub snr_fit: Option<SnrFit>,
}

impl Estimate {
    fn undefined() -> Self {
        Estimate {
            mean: f64::NAN,
            error: f64::NAN,
            snr_fit: None,
        }
    }
}

/// Result of fitting `variance(snr) = amplitude / (snr - 1)^2 + zeta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnrFit {
    pub amplitude: f64,
    pub zeta: f64,
    /// Dispersion of the quantity in each SNR bin (NaN for empty bins).
    pub standard_dev: Vec<f64>,
}

pub trait Estimator: Send + Sync {
    /// Weighted mean and its error for one cell.
    fn estimate(&self, sample: &CellSample) -> Result<Estimate>;
}

/// Unweighted mean with the unbiased standard error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWeights;

impl Estimator for NoWeights {
    fn estimate(&self, sample: &CellSample) -> Result<Estimate> {
        if sample.is_empty() {
            return Ok(Estimate::undefined());
        }
        let n = sample.len() as f64;
        let std = sample.values.iter().population_std_dev();

        let (mean, error) = match sample.z_weights {
            Some(z_weights) => {
                let sum_weights: f64 = z_weights.iter().sum();
                let sum_weights_squared: f64 = z_weights.iter().map(|w| w * w).sum();
                (
                    weighted_average(sample.values, z_weights),
                    std * sum_weights_squared.sqrt() / sum_weights,
                )
            }
            // unbiased estimate: n - 1
            None => (sample.values.iter().mean(), std / (n - 1.0).sqrt()),
        };

        Ok(Estimate {
            mean,
            error,
            snr_fit: None,
        })
    }
}

/// Weights `(snr - 1)^2`, frozen at `(SIMPLE_SNR_LIMIT - 1)^2` for bright forests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSnr;

impl Estimator for SimpleSnr {
    fn estimate(&self, sample: &CellSample) -> Result<Estimate> {
        if sample.snr.iter().any(|&snr| snr <= 1.0) {
            bail!("Cannot add weights with SNR<=1.");
        }
        if sample.is_empty() {
            return Ok(Estimate::undefined());
        }

        let weights: Vec<f64> = sample
            .snr
            .iter()
            .enumerate()
            .map(|(i, &snr)| {
                let weight = if snr > SIMPLE_SNR_LIMIT {
                    (SIMPLE_SNR_LIMIT - 1.0).powi(2)
                } else {
                    (snr - 1.0).powi(2)
                };
                weight * sample.z_weights.map_or(1.0, |z_weights| z_weights[i])
            })
            .collect();

        let mean = weighted_average(sample.values, &weights);

        // Rescale the weights to find the error: weights_true = weights * (n - 1) / alpha
        let alpha: f64 = sample
            .values
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * (x - mean).powi(2))
            .sum();
        let sum_weights: f64 = weights.iter().sum();
        let error = (alpha / (sum_weights * (sample.len() as f64 - 1.0))).sqrt();

        Ok(Estimate {
            mean,
            error,
            snr_fit: None,
        })
    }
}

/// Inverse-variance weights, with the variance modelled as a function of SNR.
#[derive(Debug, Clone)]
pub struct FitSnr {
    snr_bin_edges: Vec<f64>,
    snr_max: f64,
}

impl Default for FitSnr {
    fn default() -> Self {
        FitSnr::new(MEANPK_FITRANGE_SNR)
    }
}

impl FitSnr {
    /// SNR bins of unit width spanning `range`.
    pub fn new(range: [f64; 2]) -> Self {
        FitSnr {
            snr_bin_edges: arange(range[0], range[1] + 1.0, 1.0),
            snr_max: range[1],
        }
    }

    pub fn snr_bin_edges(&self) -> &[f64] {
        &self.snr_bin_edges
    }

    pub fn snr_bin_centers(&self) -> Vec<f64> {
        self.snr_bin_edges
            .windows(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect()
    }
}

impl Estimator for FitSnr {
    fn estimate(&self, sample: &CellSample) -> Result<Estimate> {
        if sample.is_empty() {
            return Ok(Estimate::undefined());
        }

        // Fit function to observed dispersion
        let standard_dev = binned_std(sample.snr, sample.values, &self.snr_bin_edges);
        let variance: Vec<f64> = standard_dev.iter().map(|std| std * std).collect();
        let Some((amplitude, zeta)) = fit_variance_vs_snr(&self.snr_bin_centers(), &variance) else {
            log::warn!("No populated SNR bin to fit the variance against SNR");
            return Ok(Estimate {
                snr_fit: Some(SnrFit {
                    amplitude: f64::NAN,
                    zeta: f64::NAN,
                    standard_dev,
                }),
                ..Estimate::undefined()
            });
        };

        let snr_fit = SnrFit {
            amplitude,
            zeta,
            standard_dev,
        };

        // Model variance from fit function
        let variance_estimated: Vec<f64> = sample
            .snr
            .iter()
            .map(|&snr| fitfunc_variance_pk1d(snr.min(self.snr_max).max(MIN_FIT_SNR), amplitude, zeta))
            .collect();

        // No dispersion to weight with (identical values, or one member per SNR bin)
        if variance_estimated.iter().any(|&variance| variance.is_nan() || variance <= 0.0) {
            log::debug!("Vanishing variance model (a={amplitude}, b={zeta}), using equal weights");
            return Ok(Estimate {
                snr_fit: Some(snr_fit),
                ..NoWeights.estimate(sample)?
            });
        }

        let weights: Vec<f64> = variance_estimated
            .iter()
            .map(|variance| 1.0 / variance)
            .enumerate()
            .map(|(i, weight)| weight * sample.z_weights.map_or(1.0, |z_weights| z_weights[i]))
            .collect();

        let mean = weighted_average(sample.values, &weights);
        let sum_weights: f64 = weights.iter().sum();
        let error = match sample.z_weights {
            // Analytic expression for the re-weighted average
            Some(z_weights) => {
                let reweighted: f64 = weights.iter().zip(z_weights).map(|(w, zw)| w * zw).sum();
                reweighted.sqrt() / sum_weights
            }
            None => (1.0 / sum_weights).sqrt(),
        };

        Ok(Estimate {
            mean,
            error,
            snr_fit: Some(snr_fit),
        })
    }
}

/// Model of the variance of an individual P1D as a function of the forest SNR.
pub fn fitfunc_variance_pk1d(snr: f64, amplitude: f64, zeta: f64) -> f64 {
    amplitude / (snr - 1.0).powi(2) + zeta
}

/// Least-squares fit of `fitfunc_variance_pk1d` to `variance` at `snr`, with
/// both parameters constrained to be non-negative. Non-finite points are
/// ignored; returns `None` when no point is left.
///
/// The model is linear in its parameters, so the constrained optimum is either
/// the unconstrained solution or lies on one of the two faces `amplitude = 0`,
/// `zeta = 0`.
pub fn fit_variance_vs_snr(snr: &[f64], variance: &[f64]) -> Option<(f64, f64)> {
    let points: Vec<(f64, f64)> = snr
        .iter()
        .zip(variance)
        .filter(|(s, v)| s.is_finite() && v.is_finite() && **s != 1.0)
        .map(|(&s, &v)| (s, v))
        .collect();
    if points.is_empty() {
        return None;
    }

    let n = points.len();
    let design = DMatrix::from_fn(n, 2, |i, j| {
        if j == 0 {
            (points[i].0 - 1.0).powi(-2)
        } else {
            1.0
        }
    });
    let target = DVector::from_iterator(n, points.iter().map(|&(_, v)| v));
    let residual = |(amplitude, zeta): (f64, f64)| {
        (&design * DVector::from_vec(vec![amplitude, zeta]) - &target).norm_squared()
    };

    let mut candidates = Vec::with_capacity(3);

    // Unconstrained solution of the normal equations
    let transpose = design.transpose();
    if let Some(inverse) = (&transpose * &design).try_inverse() {
        let solution = inverse * (&transpose * &target);
        if solution[0] >= 0.0 && solution[1] >= 0.0 {
            candidates.push((solution[0], solution[1]));
        }
    }

    // zeta = 0
    let slope = design.column(0);
    let amplitude = (slope.dot(&target) / slope.norm_squared()).max(0.0);
    candidates.push((amplitude, 0.0));

    // amplitude = 0
    let zeta = (target.sum() / n as f64).max(0.0);
    candidates.push((0.0, zeta));

    candidates
        .into_iter()
        .map(|candidate| (candidate, residual(candidate)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate)
}

/// Population standard deviation of `values` in each SNR bin. Bins are
/// half-open except the last, which includes its upper edge. Empty bins are NaN.
pub fn binned_std(snr: &[f64], values: &[f64], edges: &[f64]) -> Vec<f64> {
    let nbins = edges.len().saturating_sub(1);
    let mut binned: Vec<Vec<f64>> = vec![vec![]; nbins];

    for (&s, &value) in snr.iter().zip(values) {
        if nbins == 0 || !(s >= edges[0] && s <= edges[nbins]) {
            continue;
        }
        let bin = (edges.partition_point(|&edge| edge <= s) - 1).min(nbins - 1);
        binned[bin].push(value);
    }

    binned
        .iter()
        .map(|bin| {
            if bin.is_empty() {
                f64::NAN
            } else {
                bin.iter().population_std_dev()
            }
        })
        .collect()
}

fn weighted_average(values: &[f64], weights: &[f64]) -> f64 {
    let (sum, sum_weights) = values
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(sum, sum_weights), (x, w)| (sum + x * w, sum_weights + w));
    sum / sum_weights
}

#[cfg(test)]
fn assert_close(a: f64, b: f64, tolerance: f64) {
    assert!((a - b).abs() <= tolerance, "{a} != {b} (tolerance {tolerance})");
}

#[test]
fn test_weight_method_from_str() {
    assert_eq!("no_weights".parse::<WeightMethod>(), Ok(WeightMethod::NoWeights));
    assert_eq!("fit_snr".parse::<WeightMethod>(), Ok(WeightMethod::FitSnr));
    assert_eq!("simple_snr".parse::<WeightMethod>(), Ok(WeightMethod::SimpleSnr));
    assert_eq!(
        "snr".parse::<WeightMethod>(),
        Err(ConfigError::UnknownWeightMethod(String::from("snr")))
    );
    assert_eq!(WeightMethod::FitSnr.to_string(), "fit_snr");
}

#[test]
fn test_no_weights_is_textbook_mean_and_standard_error() {
    let values = [1.0, 2.0, 4.0, 7.0, 11.0];
    let snr = [3.0; 5];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let estimate = NoWeights.estimate(&sample).unwrap();

    // Sample mean and s / sqrt(n) with the n - 1 sample variance
    let mean = 5.0;
    let sample_variance = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / 4.0;
    assert_close(estimate.mean, mean, 1e-12);
    assert_close(estimate.error, (sample_variance / 5.0).sqrt(), 1e-12);
    assert!(estimate.snr_fit.is_none());
}

#[test]
fn test_no_weights_with_z_weights() {
    let values = [1.0, 3.0];
    let snr = [3.0; 2];
    let z_weights = [1.0, 0.5];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: Some(&z_weights),
    };
    let estimate = NoWeights.estimate(&sample).unwrap();
    assert_close(estimate.mean, 2.5 / 1.5, 1e-12);
    assert_close(estimate.error, 1.0 * 1.25_f64.sqrt() / 1.5, 1e-12);
}

#[test]
fn test_simple_snr_weights_are_capped() {
    let values = [1.0, 2.0, 3.0];
    let snr = [2.0, 3.0, 10.0];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let estimate = SimpleSnr.estimate(&sample).unwrap();

    // weights 1, 4, 9
    let mean = (1.0 + 8.0 + 27.0) / 14.0;
    assert_close(estimate.mean, mean, 1e-12);
    let alpha: f64 = [(1.0, 1.0), (2.0, 4.0), (3.0, 9.0)]
        .iter()
        .map(|(x, w)| w * (x - mean) * (x - mean))
        .sum();
    assert_close(estimate.error, (alpha / (14.0 * 2.0)).sqrt(), 1e-12);
}

#[test]
fn test_simple_snr_rejects_snr_of_one() {
    let values = [1.0, 2.0];
    let snr = [1.0, 5.0];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let error = SimpleSnr.estimate(&sample).unwrap_err();
    assert!(error.to_string().contains("SNR<=1"));
}

#[test]
fn test_fit_recovers_exact_model() {
    let snr: Vec<f64> = (1..10).map(|i| i as f64 + 0.5).collect();
    let variance: Vec<f64> = snr.iter().map(|&s| fitfunc_variance_pk1d(s, 2.0, 0.3)).collect();
    let (amplitude, zeta) = fit_variance_vs_snr(&snr, &variance).unwrap();
    assert_close(amplitude, 2.0, 1e-9);
    assert_close(zeta, 0.3, 1e-9);
}

#[test]
fn test_fit_respects_non_negativity() {
    // Variance increasing with snr would need a negative amplitude
    let snr: Vec<f64> = (1..10).map(|i| i as f64 + 0.5).collect();
    let variance: Vec<f64> = snr.iter().map(|&s| s).collect();
    let (amplitude, zeta) = fit_variance_vs_snr(&snr, &variance).unwrap();
    assert_eq!(amplitude, 0.0);
    assert_close(zeta, variance.iter().sum::<f64>() / 9.0, 1e-12);
}

#[test]
fn test_fit_ignores_empty_bins() {
    let snr = [1.5, 2.5, 3.5];
    let variance = [f64::NAN, fitfunc_variance_pk1d(2.5, 1.0, 0.0), fitfunc_variance_pk1d(3.5, 1.0, 0.0)];
    let (amplitude, zeta) = fit_variance_vs_snr(&snr, &variance).unwrap();
    assert_close(amplitude, 1.0, 1e-9);
    assert_close(zeta, 0.0, 1e-9);
    assert!(fit_variance_vs_snr(&snr, &[f64::NAN; 3]).is_none());
}

#[test]
fn test_binned_std() {
    let edges = [1.0, 2.0, 3.0];
    let snr = [1.0, 1.5, 2.0, 3.0, 3.5, 0.5];
    let values = [1.0, 3.0, 5.0, 9.0, 100.0, 100.0];
    let std = binned_std(&snr, &values, &edges);
    assert_eq!(std.len(), 2);
    assert_close(std[0], 1.0, 1e-12);
    // Last bin includes its upper edge
    assert_close(std[1], 2.0, 1e-12);
    assert!(binned_std(&[1.5], &[1.0], &[1.0, 2.0, 3.0])[1].is_nan());
}

#[test]
fn test_fit_snr_weighted_mean() {
    // Two populations with the same mean but different dispersion
    let mut values = vec![];
    let mut snr = vec![];
    for i in 0..40 {
        let s = 1.5 + (i % 9) as f64;
        let spread = 1.0 / (s - 1.0);
        values.push(if i % 2 == 0 { 10.0 + spread } else { 10.0 - spread });
        snr.push(s);
    }
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let fit_snr = FitSnr::default();
    assert_eq!(fit_snr.snr_bin_edges().len(), 10);

    let estimate = fit_snr.estimate(&sample).unwrap();
    let fit = estimate.snr_fit.unwrap();
    assert_eq!(fit.standard_dev.len(), 9);
    assert!(fit.amplitude >= 0.0 && fit.zeta >= 0.0);
    assert!((estimate.mean - 10.0).abs() < 0.5);
    assert!(estimate.error.is_finite() && estimate.error > 0.0);
}

#[test]
fn test_fit_snr_identical_values_use_equal_weights() {
    let values = [0.1; 6];
    let snr = [2.5, 3.5, 4.5, 5.5, 2.5, 3.5];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let estimate = FitSnr::default().estimate(&sample).unwrap();
    let fit = estimate.snr_fit.unwrap();
    assert_eq!((fit.amplitude, fit.zeta), (0.0, 0.0));
    assert_close(estimate.mean, 0.1, 1e-12);
    assert_close(estimate.error, 0.0, 1e-12);
}

#[test]
fn test_fit_snr_one_member_per_snr_bin_uses_equal_weights() {
    let values = [1.0, 2.0, 3.0];
    let snr = [2.5, 4.5, 7.5];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let estimate = FitSnr::default().estimate(&sample).unwrap();
    // Plain mean, population std / sqrt(n - 1)
    assert_close(estimate.mean, 2.0, 1e-12);
    assert_close(estimate.error, (1.0_f64 / 3.0).sqrt(), 1e-12);
    assert!(estimate.snr_fit.is_some());
}

/// Pairs at the centers of three SNR bins with dispersion exactly
/// `1 / (snr - 1)`, plus one forest below and one above the fit range.
#[cfg(test)]
fn exact_variance_sample() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let values = vec![12.0, 8.0, 10.4, 9.6, 10.0 + 1.0 / 4.5, 10.0 - 1.0 / 4.5, 100.0, 4.0];
    let snr = vec![1.5, 1.5, 3.5, 3.5, 5.5, 5.5, 0.5, 20.0];
    // 1 / variance, with snr clamped to 1.01 and 10
    let weights = vec![0.25, 0.25, 6.25, 6.25, 20.25, 20.25, 1e-4, 81.0];
    (values, snr, weights)
}

#[test]
fn test_fit_snr_inverse_variance_weights() {
    let (values, snr, weights) = exact_variance_sample();
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: None,
    };
    let estimate = FitSnr::default().estimate(&sample).unwrap();
    let fit = estimate.snr_fit.unwrap();
    assert_close(fit.amplitude, 1.0, 1e-9);
    assert_close(fit.zeta, 0.0, 1e-9);
    assert_close(fit.standard_dev[2], 0.4, 1e-12);

    let sum_weights: f64 = weights.iter().sum();
    let sum: f64 = values.iter().zip(&weights).map(|(x, w)| x * w).sum();
    assert_close(estimate.mean, sum / sum_weights, 1e-9);
    assert_close(estimate.error, (1.0 / sum_weights).sqrt(), 1e-9);
}

#[test]
fn test_fit_snr_error_with_z_weights() {
    let (values, snr, weights) = exact_variance_sample();
    let z_weights = [1.0, 0.5, 0.8, 0.2, 1.0, 0.6, 0.9, 0.3];
    let sample = CellSample {
        values: &values,
        snr: &snr,
        z_weights: Some(&z_weights),
    };
    let estimate = FitSnr::default().estimate(&sample).unwrap();

    let weights: Vec<f64> = weights.iter().zip(&z_weights).map(|(w, zw)| w * zw).collect();
    let sum_weights: f64 = weights.iter().sum();
    let sum: f64 = values.iter().zip(&weights).map(|(x, w)| x * w).sum();
    let reweighted: f64 = weights.iter().zip(&z_weights).map(|(w, zw)| w * zw).sum();
    assert_close(estimate.mean, sum / sum_weights, 1e-9);
    assert_close(estimate.error, reweighted.sqrt() / sum_weights, 1e-9);
}
