use anyhow::Result;
use clap::Parser;
use pk1d_postprocess::constants::{DEFAULT_NUMBER_BOOTSTRAP, MEANPK_FITRANGE_SNR};
use pk1d_postprocess::ingest::SnrCut;
use pk1d_postprocess::postproc::{run_postproc_pk1d, PostprocConfig};
use pk1d_postprocess::utils::{arange, round_to};
use pk1d_postprocess::weights::WeightMethod;
use std::path::PathBuf;

/// Compute the mean P1D, and optionally its covariance, from individual P1D files.
#[derive(Parser, Debug)]
#[command(name = "pk1d_postprocess")]
struct Cli {
    /// Directory to individual P1D files
    #[arg(long)]
    in_dir: PathBuf,

    /// Output file name. Defaults to mean_Pk1d_[weight_method][_medians][_snr_cut][_vel].bin in in-dir
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Minimal value of the redshift edge array
    #[arg(long, default_value_t = 2.1)]
    zedge_min: f64,

    /// Maximal value of the redshift edge array (excluded)
    #[arg(long, default_value_t = 6.5)]
    zedge_max: f64,

    /// Width of the redshift bins
    #[arg(long, default_value_t = 0.2)]
    zedge_bin: f64,

    /// Minimal value of the wavenumber edge array, in inverse Angstrom (or s/km with --velunits)
    #[arg(long)]
    kedge_min: f64,

    /// Maximal value of the wavenumber edge array (excluded)
    #[arg(long)]
    kedge_max: f64,

    /// Width of the wavenumber bins
    #[arg(long)]
    kedge_bin: f64,

    /// Weighting scheme for the mean P1D computation: no_weights, simple_snr or fit_snr
    #[arg(long, default_value = "no_weights")]
    weight_method: WeightMethod,

    /// Each chunk contributes to the two nearest redshift bins, with linear weights
    #[arg(long)]
    apply_z_weights: bool,

    /// Name of the text file where SNR fit results are stored, with fit_snr weights
    #[arg(long)]
    output_snrfit: Option<PathBuf>,

    /// Apply a redshift-dependent SNR quality cut
    #[arg(long)]
    apply_mean_snr_cut: bool,

    /// Choice of SNR cut type
    #[arg(long, default_value = "eboss")]
    snr_cut_scheme: String,

    /// Overwrite the output
    #[arg(long)]
    overwrite: bool,

    /// Compute mean P1D in velocity units
    #[arg(long)]
    velunits: bool,

    /// Skip computation of median quantities
    #[arg(long)]
    no_median: bool,

    /// Number of CPUs used to read input P1D files
    #[arg(long, default_value_t = 8)]
    ncpu: usize,

    /// Number of workers computing statistics and covariance
    #[arg(long, default_value_t = 8)]
    number_worker: usize,

    /// Compute the covariance of the mean P1D
    #[arg(long)]
    covariance: bool,

    /// Compute the covariance with the bootstrap method
    #[arg(long)]
    bootstrap: bool,

    /// Number of bootstrap samples
    #[arg(long, default_value_t = DEFAULT_NUMBER_BOOTSTRAP)]
    number_bootstrap: usize,

    /// Seed of the bootstrap resampling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn default_output_file(&self) -> PathBuf {
        let med_ext = if self.no_median { "" } else { "_medians" };
        let snr_ext = if self.apply_mean_snr_cut { "_snr_cut" } else { "" };
        let vel_ext = if self.velunits { "_vel" } else { "" };
        self.in_dir.join(format!(
            "mean_Pk1d_{}{med_ext}{snr_ext}{vel_ext}.bin",
            self.weight_method
        ))
    }

    fn into_config(self) -> Result<PostprocConfig> {
        let snr_cut = match self.apply_mean_snr_cut {
            true => Some(SnrCut::scheme(&self.snr_cut_scheme)?),
            false => None,
        };

        let zbin_edges = arange(self.zedge_min, self.zedge_max, self.zedge_bin)
            .into_iter()
            .map(|z| round_to(z, 5))
            .collect();
        let kbin_edges = arange(self.kedge_min, self.kedge_max, self.kedge_bin);
        let output_file = self
            .output_file
            .clone()
            .unwrap_or_else(|| self.default_output_file());

        let mut config = PostprocConfig::new(self.in_dir, output_file, zbin_edges, kbin_edges);
        config.weight_method = self.weight_method;
        config.apply_z_weights = self.apply_z_weights;
        config.snr_cut = snr_cut;
        config.output_snrfit = self.output_snrfit;
        config.nomedians = self.no_median;
        config.velunits = self.velunits;
        config.overwrite = self.overwrite;
        config.ncpu = self.ncpu;
        config.number_worker = self.number_worker;
        config.compute_covariance = self.covariance;
        config.compute_bootstrap = self.bootstrap;
        config.number_bootstrap = self.number_bootstrap;
        config.seed = self.seed;
        config.snr_fit_range = MEANPK_FITRANGE_SNR;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.log_file {
        Some(path) => simple_logging::log_to_file(path, log::LevelFilter::Info)?,
        None => env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .init(),
    }

    let config = cli.into_config()?;
    let summary = run_postproc_pk1d(&config)?;
    log::info!(
        "{} cells from {} lines of sight",
        summary.mean.len(),
        summary.header.nqso
    );

    Ok(())
}
