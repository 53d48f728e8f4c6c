//! Run orchestration: ingestion, per redshift bin statistics, covariance and
//! bootstrap, then output.
use crate::binning::{BinEdges, SampleBins};
use crate::constants::{DEFAULT_NUMBER_BOOTSTRAP, MEANPK_FITRANGE_SNR};
use crate::covariance::{
    bootstrap_summary, compute_cov, covariance_rows, draw_bootstrap_resamples, group_sub_forests,
    CovarianceBlock, CovarianceRow,
};
use crate::error::ConfigError;
use crate::ingest::{read_pk1d, Pk1dTable, Quantity, SnrCut};
use crate::mean::{
    fill_average_pk_redshift, metadata_table, AggregationSettings, MeanStatTable, MetadataRow,
    SnrFitRow,
};
use crate::utils::balancer::Balancer;
use crate::utils::io::{ensure_writable, read_bincode, write_bincode, write_text_table};
use crate::utils::loader::{retrieve_sources, RecordSource};
use crate::weights::{FitSnr, WeightMethod};
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options of the statistics stage.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanPk1dOptions {
    pub weight_method: WeightMethod,
    /// Each chunk contributes to the two nearest redshift bins with a linear weight.
    pub apply_z_weights: bool,
    pub nomedians: bool,
    /// Convert k from inverse Angstrom to s/km before computing statistics.
    pub velunits: bool,
    /// Keep the variance vs SNR fit of `Pk` for every cell (fit_snr only).
    pub output_snrfit: bool,
    pub compute_covariance: bool,
    pub compute_bootstrap: bool,
    pub number_bootstrap: usize,
    pub number_worker: usize,
    pub seed: u64,
    pub snr_fit_range: [f64; 2],
}

impl Default for MeanPk1dOptions {
    fn default() -> Self {
        MeanPk1dOptions {
            weight_method: WeightMethod::NoWeights,
            apply_z_weights: false,
            nomedians: false,
            velunits: false,
            output_snrfit: false,
            compute_covariance: false,
            compute_bootstrap: false,
            number_bootstrap: DEFAULT_NUMBER_BOOTSTRAP,
            number_worker: 8,
            seed: 0,
            snr_fit_range: MEANPK_FITRANGE_SNR,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeanPk1dOutput {
    pub mean: MeanStatTable,
    pub metadata: Vec<MetadataRow>,
    pub covariance: Option<Vec<CovarianceRow>>,
    pub snrfit: Option<Vec<SnrFitRow>>,
}

/// Computes the mean P1D statistics of `table` on the grid `edges`.
///
/// `z_array` holds the mean redshift of every accepted chunk.
pub fn compute_mean_pk1d(
    mut table: Pk1dTable,
    z_array: &[f64],
    edges: &BinEdges,
    options: &MeanPk1dOptions,
) -> Result<MeanPk1dOutput> {
    if options.compute_bootstrap && options.number_bootstrap == 0 {
        return Err(ConfigError::ZeroBootstrap.into());
    }

    // Convert data into velocity units
    if options.velunits {
        table.convert_to_velocity_units();
    }

    let z_spacing = match options.apply_z_weights {
        true => Some(edges.z_spacing()?),
        false => None,
    };

    let mut with_covariance = options.compute_covariance || options.compute_bootstrap;
    if with_covariance {
        if table.sub_forest_id().is_none() {
            return Err(ConfigError::MissingSubForestId.into());
        }
        if options.weight_method != WeightMethod::NoWeights {
            log::warn!("Covariance calculations are not compatible with SNR weighting method yet. Skipping calculation");
            with_covariance = false;
        } else if options.apply_z_weights {
            log::warn!("Covariance calculations are not compatible with redshift weighting yet. Skipping calculation");
            with_covariance = false;
        }
    }

    let fit_snr = FitSnr::new(options.snr_fit_range);
    let snrfit_bins = match (options.output_snrfit, options.weight_method) {
        (true, WeightMethod::FitSnr) => Some(fit_snr.snr_bin_centers().len()),
        (true, method) => {
            log::warn!("No SNR fit to output with weight method {method}");
            None
        }
        (false, _) => None,
    };
    let settings = AggregationSettings {
        z_spacing,
        medians: !options.nomedians,
        snrfit_bins,
    };

    let balancer = Balancer::new(options.number_worker)?;
    let nbins_z = edges.nbins_z();
    let nbins_k = edges.nbins_k();
    let sample_bins = edges.assign(table.forest_z(), table.k());
    let n_chunks = edges.count_z(z_array);
    let estimator = options.weight_method.estimator(options.snr_fit_range);

    log::info!("Computing average p1d");
    let blocks = balancer.map((0..nbins_z).collect(), |izbin| {
        fill_average_pk_redshift(
            izbin,
            &table,
            &sample_bins,
            edges,
            estimator.as_ref(),
            &settings,
            n_chunks[izbin],
        )
    })?;

    let mut rows = Vec::with_capacity(edges.ncells());
    let mut snrfit = Vec::new();
    for (izbin, block) in blocks.into_iter().enumerate() {
        if block.izbin != izbin || block.rows.len() != nbins_k {
            bail!("statistics of redshift bin {izbin} are misplaced or incomplete");
        }
        rows.extend(block.rows);
        snrfit.extend(block.snrfit);
    }
    let mean = MeanStatTable {
        quantities: table.quantities().to_vec(),
        nbins_k,
        rows,
    };

    let covariance = if with_covariance {
        Some(compute_covariance_table(&table, &sample_bins, edges, &mean, &n_chunks, options, &balancer)?)
    } else {
        None
    };

    Ok(MeanPk1dOutput {
        mean,
        metadata: metadata_table(edges, z_array),
        covariance,
        snrfit: snrfit_bins.map(|_| snrfit),
    })
}

fn compute_covariance_table(
    table: &Pk1dTable,
    sample_bins: &SampleBins,
    edges: &BinEdges,
    mean: &MeanStatTable,
    n_chunks: &[usize],
    options: &MeanPk1dOptions,
    balancer: &Balancer,
) -> Result<Vec<CovarianceRow>> {
    let sub_forest_id = table.sub_forest_id().ok_or(ConfigError::MissingSubForestId)?;
    let nbins_z = edges.nbins_z();
    let nbins_k = edges.nbins_k();
    let z_centers = edges.z_centers();
    let pk = table.pk();
    let k_index = &sample_bins.k_index;

    let groups = balancer.map((0..nbins_z).collect(), |izbin| {
        Ok(group_sub_forests(izbin, sample_bins, sub_forest_id))
    })?;
    let mean_pk: Vec<Vec<f64>> = (0..nbins_z)
        .map(|izbin| {
            (0..nbins_k)
                .map(|ikbin| {
                    mean.stats(izbin, ikbin, Quantity::Pk)
                        .map_or(f64::NAN, |stats| stats.mean)
                })
                .collect()
        })
        .collect();

    log::info!("Computing covariance matrix");
    let blocks = balancer.map((0..nbins_z).collect(), |izbin| {
        let selection = groups[izbin].all();
        Ok(compute_cov(izbin, &groups[izbin], &selection, pk, k_index, &mean_pk[izbin], n_chunks[izbin]))
    })?;
    check_blocks(&blocks, (0..nbins_z).collect())?;

    let bootstrap = if options.compute_bootstrap {
        log::info!("Computing covariance matrix with bootstrap method");

        // Resamples are drawn up front so the result does not depend on scheduling
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut tasks = Vec::with_capacity(nbins_z * options.number_bootstrap);
        for (izbin, group) in groups.iter().enumerate() {
            for selection in draw_bootstrap_resamples(&mut rng, group.len(), options.number_bootstrap) {
                tasks.push((izbin, selection));
            }
        }

        let boot_blocks = balancer.map(tasks, |(izbin, selection)| {
            Ok(compute_cov(izbin, &groups[izbin], &selection, pk, k_index, &mean_pk[izbin], n_chunks[izbin]))
        })?;
        let expected = (0..nbins_z)
            .flat_map(|izbin| std::iter::repeat(izbin).take(options.number_bootstrap))
            .collect();
        check_blocks(&boot_blocks, expected)?;

        Some(
            boot_blocks
                .chunks(options.number_bootstrap)
                .map(|realizations| bootstrap_summary(realizations, nbins_k))
                .collect::<Vec<_>>(),
        )
    } else {
        None
    };

    let mut rows = Vec::with_capacity(nbins_z * nbins_k * nbins_k);
    for (izbin, block) in blocks.iter().enumerate() {
        let summary = bootstrap.as_ref().map(|summaries| {
            let (mean, std) = &summaries[izbin];
            (mean, std)
        });
        rows.extend(covariance_rows(z_centers[izbin], block, summary));
    }
    Ok(rows)
}

fn check_blocks(blocks: &[CovarianceBlock], expected: Vec<usize>) -> Result<()> {
    if blocks.len() != expected.len() {
        bail!("expected {} covariance blocks, received {}", expected.len(), blocks.len());
    }
    for (block, izbin) in blocks.iter().zip(expected) {
        if block.izbin != izbin {
            bail!("covariance block of redshift bin {} found where {izbin} was expected", block.izbin);
        }
    }
    Ok(())
}

/// Complete configuration of one post-processing run.
#[derive(Debug, Clone, PartialEq)]
pub struct PostprocConfig {
    pub data_dir: PathBuf,
    pub output_file: PathBuf,
    pub zbin_edges: Vec<f64>,
    pub kbin_edges: Vec<f64>,
    pub weight_method: WeightMethod,
    pub apply_z_weights: bool,
    pub snr_cut: Option<SnrCut>,
    pub output_snrfit: Option<PathBuf>,
    pub nomedians: bool,
    pub velunits: bool,
    pub overwrite: bool,
    /// Workers reading the individual P1D files.
    pub ncpu: usize,
    /// Workers computing statistics and covariance.
    pub number_worker: usize,
    pub compute_covariance: bool,
    pub compute_bootstrap: bool,
    pub number_bootstrap: usize,
    pub seed: u64,
    pub snr_fit_range: [f64; 2],
}

impl PostprocConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        output_file: impl Into<PathBuf>,
        zbin_edges: Vec<f64>,
        kbin_edges: Vec<f64>,
    ) -> Self {
        let defaults = MeanPk1dOptions::default();
        PostprocConfig {
            data_dir: data_dir.into(),
            output_file: output_file.into(),
            zbin_edges,
            kbin_edges,
            weight_method: defaults.weight_method,
            apply_z_weights: defaults.apply_z_weights,
            snr_cut: None,
            output_snrfit: None,
            nomedians: defaults.nomedians,
            velunits: defaults.velunits,
            overwrite: false,
            ncpu: 8,
            number_worker: defaults.number_worker,
            compute_covariance: defaults.compute_covariance,
            compute_bootstrap: defaults.compute_bootstrap,
            number_bootstrap: defaults.number_bootstrap,
            seed: defaults.seed,
            snr_fit_range: defaults.snr_fit_range,
        }
    }

    /// Checks every option before any work starts, returning the grid.
    pub fn validate(&self) -> Result<BinEdges, ConfigError> {
        let edges = BinEdges::new(self.zbin_edges.clone(), self.kbin_edges.clone())?;

        if self.apply_z_weights {
            edges.z_spacing()?;
        }
        if let Some(snr_cut) = &self.snr_cut {
            if snr_cut.is_redshift_dependent() && self.weight_method != WeightMethod::NoWeights {
                return Err(ConfigError::WeightedRedshiftDependentCut(self.weight_method.to_string()));
            }
            if self.weight_method == WeightMethod::SimpleSnr && snr_cut.min_threshold() < 1.0 {
                return Err(ConfigError::SimpleSnrCutBelowOne(snr_cut.min_threshold()));
            }
        }
        if self.ncpu == 0 {
            return Err(ConfigError::ZeroWorkers("ncpu"));
        }
        if self.number_worker == 0 {
            return Err(ConfigError::ZeroWorkers("number_worker"));
        }
        if self.compute_bootstrap && self.number_bootstrap == 0 {
            return Err(ConfigError::ZeroBootstrap);
        }

        ensure_writable(&self.output_file, self.overwrite)?;
        if let Some(path) = &self.output_snrfit {
            ensure_writable(path, self.overwrite)?;
        }

        Ok(edges)
    }

    pub fn mean_options(&self) -> MeanPk1dOptions {
        MeanPk1dOptions {
            weight_method: self.weight_method,
            apply_z_weights: self.apply_z_weights,
            nomedians: self.nomedians,
            velunits: self.velunits,
            output_snrfit: self.output_snrfit.is_some(),
            compute_covariance: self.compute_covariance,
            compute_bootstrap: self.compute_bootstrap,
            number_bootstrap: self.number_bootstrap,
            number_worker: self.number_worker,
            seed: self.seed,
            snr_fit_range: self.snr_fit_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHeader {
    pub velunits: bool,
    /// Number of distinct lines of sight.
    pub nqso: usize,
}

/// Everything a run produces, persisted as one bincode file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pk1dSummary {
    pub header: OutputHeader,
    pub mean: MeanStatTable,
    pub metadata: Vec<MetadataRow>,
    pub covariance: Option<Vec<CovarianceRow>>,
}

impl Pk1dSummary {
    pub fn write(&self, path: &Path, overwrite: bool) -> Result<()> {
        write_bincode(path, self, overwrite)
    }

    pub fn read(path: &Path) -> Result<Self> {
        read_bincode(path)
    }
}

/// Writes the variance vs SNR fits, one row per cell: `z k a b` and the
/// standard deviation in every SNR bin.
pub fn write_snrfit(path: &Path, rows: &[SnrFitRow], snr_fit_range: [f64; 2], overwrite: bool) -> Result<()> {
    let snr_edges: Vec<String> = FitSnr::new(snr_fit_range)
        .snr_bin_edges()
        .iter()
        .map(|edge| edge.to_string())
        .collect();
    let header = vec![
        String::from("Result of fit: Variance(Pks) vs SNR"),
        format!("SNR bin edges used: {}", snr_edges.join(",  ")),
        String::from("z k a b standard_dev_points"),
    ];
    let table: Vec<Vec<f64>> = rows
        .iter()
        .map(|row| {
            let mut values = vec![row.z, row.k, row.amplitude, row.zeta];
            values.extend(&row.standard_dev);
            values
        })
        .collect();
    write_text_table(path, &header, &table, overwrite)
}

/// Runs the whole post-processing on the given sources.
pub fn run_postproc_on_sources<S: RecordSource + 'static>(
    config: &PostprocConfig,
    sources: Vec<S>,
) -> Result<Pk1dSummary> {
    let edges = config.validate()?;
    let options = config.mean_options();

    let n_sources = sources.len();
    let k_max = edges.k_max();
    let snr_cut = config.snr_cut.clone();
    let balancer = Balancer::new(config.ncpu)?;
    let outputs = balancer.map_blocking_io(sources, move |source| {
        read_pk1d(&source, k_max, snr_cut.as_ref())
            .with_context(|| format!("failed to read individual P1Ds from {}", source.name()))
    })?;
    drop(balancer);

    let (tables, z_arrays): (Vec<Pk1dTable>, Vec<Vec<f64>>) = outputs.into_iter().flatten().unzip();
    log::info!("{} of {n_sources} sources contain selected chunks", tables.len());
    let Some(table) = Pk1dTable::concat(tables) else {
        bail!("no chunk was selected in {}", config.data_dir.display());
    };
    let z_array: Vec<f64> = z_arrays.concat();
    let nqso = table.number_of_los();
    log::info!("Individual P1Ds read, now computing statistics.");

    let output = compute_mean_pk1d(table, &z_array, &edges, &options)?;

    let summary = Pk1dSummary {
        header: OutputHeader {
            velunits: config.velunits,
            nqso,
        },
        mean: output.mean,
        metadata: output.metadata,
        covariance: output.covariance,
    };
    summary.write(&config.output_file, config.overwrite)?;
    log::info!("Mean P1D written to {}", config.output_file.display());

    if let (Some(path), Some(rows)) = (&config.output_snrfit, &output.snrfit) {
        write_snrfit(path, rows, config.snr_fit_range, config.overwrite)?;
        log::info!("SNR fit results written to {}", path.display());
    }

    Ok(summary)
}

/// Reads every individual P1D file of `config.data_dir` and runs the post-processing.
pub fn run_postproc_pk1d(config: &PostprocConfig) -> Result<Pk1dSummary> {
    // Fail on configuration before touching the input directory
    config.validate()?;
    let sources = retrieve_sources(&config.data_dir)?;
    run_postproc_on_sources(config, sources)
}

#[cfg(test)]
use crate::utils::loader::{ChunkHeader, Pk1dChunk};
#[cfg(test)]
use ndarray::Array1;
#[cfg(test)]
use rand::Rng;

#[cfg(test)]
fn random_chunks(n: usize, seed: u64) -> Vec<Pk1dChunk> {
    let mut rng = StdRng::seed_from_u64(seed);
    let k: Vec<f64> = (0..12).map(|i| 0.01 + 0.02 * i as f64).collect();
    (0..n)
        .map(|i| {
            let pk_raw: Vec<f64> = k.iter().map(|_| rng.random_range(0.5..1.5)).collect();
            let pk_noise: Vec<f64> = k.iter().map(|_| rng.random_range(0.0..0.3)).collect();
            Pk1dChunk::new(
                ChunkHeader {
                    los_id: (i / 3) as i64,
                    chunk_id: Some((i % 3) as i64),
                    mean_z: rng.random_range(2.0..3.0),
                    mean_snr: rng.random_range(1.2..12.0),
                },
                Array1::from(k.clone()),
                Array1::from(pk_raw),
                Array1::from(pk_noise),
                Array1::zeros(k.len()),
                Array1::ones(k.len()),
            )
        })
        .collect()
}

#[cfg(test)]
fn run_in_memory(chunks: &[Pk1dChunk], edges: &BinEdges, options: &MeanPk1dOptions) -> MeanPk1dOutput {
    let table = Pk1dTable::from_chunks(chunks).unwrap();
    let z_array: Vec<f64> = chunks.iter().map(|chunk| chunk.header.mean_z).collect();
    compute_mean_pk1d(table, &z_array, edges, options).unwrap()
}

#[test]
fn test_worker_count_does_not_change_output() {
    let chunks = random_chunks(90, 11);
    let edges = BinEdges::new(vec![2.0, 2.25, 2.5, 2.75, 3.0, 3.25], vec![0.0, 0.06, 0.12, 0.18, 0.24]).unwrap();

    for weight_method in [WeightMethod::NoWeights, WeightMethod::FitSnr] {
        let options = MeanPk1dOptions {
            weight_method,
            output_snrfit: true,
            compute_covariance: true,
            compute_bootstrap: true,
            number_bootstrap: 7,
            seed: 5,
            number_worker: 1,
            ..MeanPk1dOptions::default()
        };
        let sequential = run_in_memory(&chunks, &edges, &options);
        let parallel = run_in_memory(&chunks, &edges, &MeanPk1dOptions { number_worker: 4, ..options });

        // NaN != NaN, so compare the serialized bytes
        let bytes = |output: &MeanPk1dOutput| {
            bincode::serialize(&(&output.mean, &output.metadata, &output.covariance, &output.snrfit)).unwrap()
        };
        assert_eq!(bytes(&sequential), bytes(&parallel));
        assert_eq!(sequential.mean.len(), 20);

        // Every populated cell has a mean, including constant columns like cor_reso
        for row in sequential.mean.rows.iter().filter(|row| row.n > 0) {
            assert!(row.stats.iter().all(|stats| stats.mean.is_finite()), "{weight_method}: {row:?}");
        }
    }

    // The pool is capped by the available parallelism
    let workers = Balancer::new(4).unwrap().workers;
    if workers == 1 {
        eprintln!("single cpu host: 1 vs 4 workers both ran sequentially");
    }
}

#[test]
fn test_covariance_shape_and_symmetry() {
    let chunks = random_chunks(60, 3);
    let edges = BinEdges::new(vec![2.0, 2.5, 3.0, 3.5], vec![0.0, 0.08, 0.16, 0.24]).unwrap();
    let options = MeanPk1dOptions {
        compute_covariance: true,
        compute_bootstrap: true,
        number_bootstrap: 4,
        number_worker: 2,
        ..MeanPk1dOptions::default()
    };
    let output = run_in_memory(&chunks, &edges, &options);
    let covariance = output.covariance.unwrap();
    assert_eq!(covariance.len(), 3 * 3 * 3);

    for row in covariance.iter().filter(|row| row.index_zbin < 2) {
        let mirror = covariance
            .iter()
            .find(|other| {
                other.index_zbin == row.index_zbin
                    && other.index_kbin == row.index_kbin2
                    && other.index_kbin2 == row.index_kbin
            })
            .unwrap();
        assert_eq!(row.covariance.to_bits(), mirror.covariance.to_bits());
        assert_eq!(row.n, mirror.n);
        assert!(row.boot_covariance.is_some());
    }

    // No chunk above z = 3
    assert!(covariance.iter().filter(|row| row.index_zbin == 2).all(|row| row.covariance.is_nan() && row.n == 0));
}

#[test]
fn test_covariance_is_skipped_with_snr_weights() {
    let chunks = random_chunks(30, 4);
    let edges = BinEdges::new(vec![2.0, 2.5, 3.0], vec![0.0, 0.1, 0.2]).unwrap();
    let options = MeanPk1dOptions {
        weight_method: WeightMethod::FitSnr,
        compute_covariance: true,
        number_worker: 1,
        ..MeanPk1dOptions::default()
    };
    assert!(run_in_memory(&chunks, &edges, &options).covariance.is_none());
}

#[test]
fn test_medians_follow_the_option() {
    let chunks = random_chunks(30, 8);
    let edges = BinEdges::new(vec![2.0, 2.5, 3.0], vec![0.0, 0.1, 0.2]).unwrap();
    let options = MeanPk1dOptions {
        number_worker: 1,
        ..MeanPk1dOptions::default()
    };
    let with_medians = run_in_memory(&chunks, &edges, &options);
    assert!(with_medians.mean.rows.iter().flat_map(|row| &row.stats).all(|stats| stats.median.is_some()));

    let without = run_in_memory(&chunks, &edges, &MeanPk1dOptions { nomedians: true, ..options });
    assert!(without.mean.rows.iter().flat_map(|row| &row.stats).all(|stats| stats.median.is_none()));
}

#[test]
fn test_covariance_needs_sub_forest_id() {
    let mut chunks = random_chunks(6, 4);
    for chunk in chunks.iter_mut() {
        chunk.header.chunk_id = None;
    }
    let table = Pk1dTable::from_chunks(&chunks).unwrap();
    let edges = BinEdges::new(vec![2.0, 3.0], vec![0.0, 0.1]).unwrap();
    let options = MeanPk1dOptions {
        compute_covariance: true,
        number_worker: 1,
        ..MeanPk1dOptions::default()
    };
    let error = compute_mean_pk1d(table, &[2.5; 6], &edges, &options).unwrap_err();
    assert_eq!(error.downcast_ref::<ConfigError>(), Some(&ConfigError::MissingSubForestId));
}

#[test]
fn test_validate() {
    let dir = tempfile::tempdir().unwrap();
    let config = PostprocConfig::new(dir.path(), dir.path().join("out.bin"), vec![2.0, 2.2, 2.4], vec![0.0, 0.1]);
    assert!(config.validate().is_ok());

    let invalid = |f: &dyn Fn(&mut PostprocConfig)| {
        let mut config = config.clone();
        f(&mut config);
        config.validate().unwrap_err()
    };
    assert_eq!(
        invalid(&|c| {
            c.apply_z_weights = true;
            c.zbin_edges = vec![2.0, 2.2, 2.8];
        }),
        ConfigError::NonUniformZBins
    );
    assert_eq!(invalid(&|c| c.kbin_edges = vec![0.1]), ConfigError::InvalidEdges { axis: "wavenumber" });
    assert_eq!(invalid(&|c| c.ncpu = 0), ConfigError::ZeroWorkers("ncpu"));
    assert_eq!(
        invalid(&|c| {
            c.compute_bootstrap = true;
            c.number_bootstrap = 0;
        }),
        ConfigError::ZeroBootstrap
    );
    assert_eq!(
        invalid(&|c| {
            c.weight_method = WeightMethod::SimpleSnr;
            c.snr_cut = Some(SnrCut::global(0.5));
        }),
        ConfigError::SimpleSnrCutBelowOne(0.5)
    );
    assert_eq!(
        invalid(&|c| {
            c.weight_method = WeightMethod::FitSnr;
            c.snr_cut = Some(SnrCut::scheme("eboss").unwrap());
        }),
        ConfigError::WeightedRedshiftDependentCut(String::from("fit_snr"))
    );

    std::fs::write(&config.output_file, b"").unwrap();
    assert_eq!(invalid(&|_| {}), ConfigError::OutputExists(config.output_file.clone()));
    assert!(PostprocConfig { overwrite: true, ..config }.validate().is_ok());
}
