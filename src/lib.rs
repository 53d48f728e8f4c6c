#[macro_use]
extern crate lazy_static;

pub mod binning;
pub mod constants;
pub mod covariance;
pub mod error;
pub mod ingest;
pub mod mean;
pub mod postproc;
pub mod utils;
pub mod weights;

// Note that this has to stay constant throughout the entire pipeline
// e.g. for ingestion, the mean tables and the covariance blocks
pub type FloatType = f64;

pub type ZBinIndex = usize;
pub type KBinIndex = usize;
pub type LosId = i64;
pub type SubForestId = String;
pub type Series = ndarray::Array1<FloatType>;
