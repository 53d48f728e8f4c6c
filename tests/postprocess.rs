use ndarray::Array1;
use pk1d_postprocess::error::ConfigError;
use pk1d_postprocess::ingest::{Quantity, SnrCut};
use pk1d_postprocess::postproc::{run_postproc_pk1d, Pk1dSummary, PostprocConfig};
use pk1d_postprocess::utils::loader::{ChunkHeader, CsvSource, Pk1dChunk};
use pk1d_postprocess::weights::WeightMethod;
use std::path::Path;

fn chunk(los_id: i64, chunk_id: i64, mean_z: f64, mean_snr: f64, level: f64) -> Pk1dChunk {
    let k = vec![0.1, 0.2];
    Pk1dChunk::new(
        ChunkHeader {
            los_id,
            chunk_id: Some(chunk_id),
            mean_z,
            mean_snr,
        },
        Array1::from(k),
        Array1::from(vec![level, level + 0.5]),
        Array1::zeros(2),
        Array1::zeros(2),
        Array1::ones(2),
    )
}

fn write_sources(dir: &Path) {
    CsvSource::write(
        dir.join("Pk1D-0.csv"),
        &[chunk(1, 0, 2.0, 5.0, 1.0), chunk(1, 1, 2.1, 5.0, 2.0)],
    )
    .unwrap();
    CsvSource::write(
        dir.join("Pk1D-1.csv"),
        &[chunk(2, 0, 2.2, 1.5, 3.0), chunk(3, 0, 3.0, 6.0, 4.0)],
    )
    .unwrap();
    // Nothing selected in this one with an snr cut
    CsvSource::write(dir.join("Pk1D-2.csv"), &[chunk(4, 0, 2.3, 1.0, 100.0)]).unwrap();
}

fn config(dir: &Path) -> PostprocConfig {
    let mut config = PostprocConfig::new(
        dir,
        dir.join("mean_Pk1d.bin"),
        vec![1.5, 2.5, 3.5, 4.5],
        vec![0.05, 0.15, 0.25],
    );
    config.ncpu = 2;
    config.number_worker = 2;
    config
}

#[test]
fn test_run_writes_readable_summary() {
    let dir = tempfile::tempdir().unwrap();
    write_sources(dir.path());
    let mut config = config(dir.path());
    config.snr_cut = Some(SnrCut::global(1.2));
    config.compute_covariance = true;
    config.compute_bootstrap = true;
    config.number_bootstrap = 5;

    let summary = run_postproc_pk1d(&config).unwrap();
    let read = Pk1dSummary::read(&config.output_file).unwrap();
    assert_eq!(read.header, summary.header);
    assert_eq!(read.mean.len(), summary.mean.len());

    // The snr = 1 chunk is cut, leaving 3 lines of sight
    assert_eq!(read.header.nqso, 3);
    assert!(!read.header.velunits);

    assert_eq!(read.mean.len(), 3 * 2);
    let n_chunks: Vec<usize> = read.metadata.iter().map(|row| row.n_chunks).collect();
    assert_eq!(n_chunks, vec![3, 1, 0]);

    let pk = read.mean.stats(0, 0, Quantity::Pk).unwrap();
    assert!((pk.mean - 2.0).abs() < 1e-12);
    assert_eq!(pk.median, Some(2.0));
    assert_eq!(read.mean.row(0, 1).n, 3);
    assert_eq!(read.mean.row(2, 0).n, 0);
    assert!(read.mean.stats(2, 0, Quantity::Pk).unwrap().mean.is_nan());

    let covariance = read.covariance.unwrap();
    assert_eq!(covariance.len(), 3 * 2 * 2);
    assert!(covariance.iter().all(|row| row.boot_covariance.is_some()));
    assert!(covariance[8..].iter().all(|row| row.covariance.is_nan()));
}

#[test]
fn test_existing_output_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    write_sources(dir.path());
    let mut config = config(dir.path());
    run_postproc_pk1d(&config).unwrap();

    let error = run_postproc_pk1d(&config).unwrap_err();
    assert_eq!(
        error.downcast_ref::<ConfigError>(),
        Some(&ConfigError::OutputExists(config.output_file.clone()))
    );

    config.overwrite = true;
    config.velunits = true;
    let summary = run_postproc_pk1d(&config).unwrap();
    assert!(Pk1dSummary::read(&config.output_file).unwrap().header.velunits);
    assert_eq!(summary.header.nqso, 4);
}

#[test]
fn test_snrfit_file() {
    let dir = tempfile::tempdir().unwrap();
    write_sources(dir.path());
    let mut config = config(dir.path());
    config.weight_method = WeightMethod::FitSnr;
    config.snr_cut = Some(SnrCut::global(1.2));
    config.output_snrfit = Some(dir.path().join("snrfit.txt"));
    run_postproc_pk1d(&config).unwrap();

    let text = std::fs::read_to_string(dir.path().join("snrfit.txt")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "# Result of fit: Variance(Pks) vs SNR");
    assert_eq!(lines[1], "# SNR bin edges used: 1,  2,  3,  4,  5,  6,  7,  8,  9,  10");
    assert_eq!(lines.len(), 3 + 3 * 2);
    // z k a b and 9 SNR bins
    assert_eq!(lines[3].split_whitespace().count(), 13);
    assert!(lines[3].starts_with("2.00000e+00 1.00000e-01"));
}

#[test]
fn test_no_selected_chunk_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_sources(dir.path());
    let mut config = config(dir.path());
    config.snr_cut = Some(SnrCut::global(50.0));
    assert!(run_postproc_pk1d(&config).is_err());
    assert!(!config.output_file.exists());
}
