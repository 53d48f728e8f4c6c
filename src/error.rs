use std::path::PathBuf;
use thiserror::Error;

/// Invalid or incompatible options. These are all detected before any
/// parallel work starts and abort the whole run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("option for weight method '{0}' not found (expected no_weights, simple_snr or fit_snr)")]
    UnknownWeightMethod(String),

    #[error("unknown snr cut scheme '{0}' (expected eboss)")]
    UnknownSnrCutScheme(String),

    #[error("snr cut needs at least one threshold")]
    EmptySnrCut,

    #[error("got {thresholds} snr cuts but {redshifts} redshifts: provide the same size for both arrays")]
    SnrCutRedshiftMismatch { thresholds: usize, redshifts: usize },

    #[error("simple_snr weights require snr > 1, but the snr cut lets through chunks with snr >= {0}")]
    SimpleSnrCutBelowOne(f64),

    #[error("weighting method {0} with a redshift-dependent snr cut is not tested and would bias the result")]
    WeightedRedshiftDependentCut(String),

    #[error("{axis} bin edges must hold at least two finite, strictly increasing values")]
    InvalidEdges { axis: &'static str },

    #[error("z bins should have equal widths with apply_z_weights")]
    NonUniformZBins,

    #[error("sub_forest_id cannot be computed from individual pk files, but it is necessary to compute the covariance")]
    MissingSubForestId,

    #[error("{0} must be at least 1")]
    ZeroWorkers(&'static str),

    #[error("number_bootstrap must be at least 1")]
    ZeroBootstrap,

    #[error("output file already exists: {0}")]
    OutputExists(PathBuf),
}
