use crate::{LosId, Series};
use anyhow::{Context, Result};
use glob::glob;
use itertools::Itertools;
use ndarray::Array1;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Individual P1D files are matched with this pattern inside the input directory.
pub const SOURCE_PATTERN: &str = "Pk1D*.csv";

/// Per-chunk header values. These are constant over all k samples of a chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHeader {
    pub los_id: LosId,
    pub chunk_id: Option<i64>,
    pub mean_z: f64,
    pub mean_snr: f64,
}

/// The individual P1D of one forest chunk, as produced upstream.
#[derive(Debug, Clone)]
pub struct Pk1dChunk {
    pub header: ChunkHeader,
    pub k: Series,
    pub pk_raw: Series,
    pub pk_noise: Series,
    pub pk_diff: Series,
    pub cor_reso: Series,
    /// Noise and resolution corrected power. Derived at ingestion when missing.
    pub pk: Option<Series>,
    pub pk_noise_miss: Option<Series>,
}

impl Pk1dChunk {
    pub fn new(
        header: ChunkHeader,
        k: Series,
        pk_raw: Series,
        pk_noise: Series,
        pk_diff: Series,
        cor_reso: Series,
    ) -> Self {
        Pk1dChunk {
            header,
            k,
            pk_raw,
            pk_noise,
            pk_diff,
            cor_reso,
            pk: None,
            pk_noise_miss: None,
        }
    }

    pub fn with_pk(mut self, pk: Series) -> Self {
        self.pk = Some(pk);
        self
    }

    pub fn with_pk_noise_miss(mut self, pk_noise_miss: Series) -> Self {
        self.pk_noise_miss = Some(pk_noise_miss);
        self
    }

    /// Number of k modes.
    pub fn len(&self) -> usize {
        self.k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_empty()
    }

    /// True if every power array is aligned with `k`.
    pub fn is_consistent(&self) -> bool {
        let n = self.k.len();
        [&self.pk_raw, &self.pk_noise, &self.pk_diff, &self.cor_reso]
            .into_iter()
            .chain(self.pk.as_ref())
            .chain(self.pk_noise_miss.as_ref())
            .all(|series| series.len() == n)
    }

    /// Grouping key for the covariance: chunks sharing it are correlated.
    pub fn sub_forest_id(&self) -> Option<String> {
        self.header
            .chunk_id
            .map(|chunk_id| format!("{}_{}", self.header.los_id, chunk_id))
    }
}

/// Anything that yields individual P1D chunks, e.g. one file on disk.
pub trait RecordSource: Send + Sync {
    /// Used in diagnostics.
    fn name(&self) -> String;

    /// Reads every chunk of this source, in order.
    fn read_chunks(&self) -> Result<Vec<Pk1dChunk>>;
}

/// Chunks that are already in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    pub name: String,
    pub chunks: Vec<Pk1dChunk>,
}

impl RecordSource for MemorySource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read_chunks(&self) -> Result<Vec<Pk1dChunk>> {
        Ok(self.chunks.clone())
    }
}

/// One row per k mode. Rows sharing `hdu` (and adjacent in the file) form one chunk.
#[derive(Debug, Deserialize, Serialize)]
struct Pk1dCsvRow {
    hdu: usize,
    los_id: LosId,
    chunk_id: Option<i64>,
    mean_z: f64,
    mean_snr: f64,
    k: f64,
    pk_raw: f64,
    pk_noise: f64,
    pk_diff: f64,
    cor_reso: f64,
    pk: Option<f64>,
    pk_noise_miss: Option<f64>,
}

/// An individual P1D file in csv format.
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvSource { path: path.into() }
    }

    /// Writes chunks in the layout `read_chunks` expects.
    pub fn write(path: impl AsRef<Path>, chunks: &[Pk1dChunk]) -> Result<CsvSource> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;

        for (hdu, chunk) in chunks.iter().enumerate() {
            for i in 0..chunk.len() {
                writer.serialize(Pk1dCsvRow {
                    hdu,
                    los_id: chunk.header.los_id,
                    chunk_id: chunk.header.chunk_id,
                    mean_z: chunk.header.mean_z,
                    mean_snr: chunk.header.mean_snr,
                    k: chunk.k[i],
                    pk_raw: chunk.pk_raw[i],
                    pk_noise: chunk.pk_noise[i],
                    pk_diff: chunk.pk_diff[i],
                    cor_reso: chunk.cor_reso[i],
                    pk: chunk.pk.as_ref().map(|pk| pk[i]),
                    pk_noise_miss: chunk.pk_noise_miss.as_ref().map(|miss| miss[i]),
                })?;
            }
        }
        writer.flush()?;

        Ok(CsvSource::new(path))
    }
}

impl RecordSource for CsvSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn read_chunks(&self) -> Result<Vec<Pk1dChunk>> {
        // Load csv file
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .with_context(|| format!("failed to open file at {}", self.path.display()))?;

        let rows: Vec<Pk1dCsvRow> = reader
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("row format is invalid in {}", self.path.display()))?;

        // Group adjacent rows by hdu; header values come from the first row of each chunk
        let grouped = rows.into_iter().group_by(|row| row.hdu);
        let chunks = grouped
            .into_iter()
            .map(|(_hdu, group)| chunk_from_rows(group.collect()))
            .collect();

        Ok(chunks)
    }
}

fn chunk_from_rows(rows: Vec<Pk1dCsvRow>) -> Pk1dChunk {
    let first = &rows[0];
    let header = ChunkHeader {
        los_id: first.los_id,
        chunk_id: first.chunk_id,
        mean_z: first.mean_z,
        mean_snr: first.mean_snr,
    };

    let column = |f: fn(&Pk1dCsvRow) -> f64| -> Series { rows.iter().map(f).collect() };
    let optional_column = |f: fn(&Pk1dCsvRow) -> Option<f64>| -> Option<Series> {
        rows.iter().map(f).collect::<Option<Vec<f64>>>().map(Array1::from)
    };

    Pk1dChunk {
        header,
        k: column(|row| row.k),
        pk_raw: column(|row| row.pk_raw),
        pk_noise: column(|row| row.pk_noise),
        pk_diff: column(|row| row.pk_diff),
        cor_reso: column(|row| row.cor_reso),
        pk: optional_column(|row| row.pk),
        pk_noise_miss: optional_column(|row| row.pk_noise_miss),
    }
}

/// Finds all individual P1D files in `data_dir`.
pub fn retrieve_sources(data_dir: impl AsRef<Path>) -> Result<Vec<CsvSource>> {
    let pattern = data_dir.as_ref().join(SOURCE_PATTERN);
    let pattern = pattern.to_str().context("input directory is not valid unicode")?;

    let mut paths: Vec<PathBuf> = glob(pattern)
        .context("couldn't build the search pattern for individual P1D files")?
        .collect::<std::result::Result<_, _>>()?;
    paths.sort();
    log::info!("Found {} individual P1D files in {}", paths.len(), data_dir.as_ref().display());

    Ok(paths.into_iter().map(CsvSource::new).collect())
}

#[cfg(test)]
fn flat_chunk(los_id: LosId, chunk_id: Option<i64>, k: &[f64], pk_raw: f64) -> Pk1dChunk {
    let n = k.len();
    Pk1dChunk::new(
        ChunkHeader {
            los_id,
            chunk_id,
            mean_z: 2.0,
            mean_snr: 5.0,
        },
        Array1::from(k.to_vec()),
        Array1::from_elem(n, pk_raw),
        Array1::zeros(n),
        Array1::zeros(n),
        Array1::ones(n),
    )
}

#[test]
fn test_csv_write_then_read_keeps_chunk_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let chunks = vec![
        flat_chunk(7, Some(0), &[0.1, 0.2, 0.3], 1.0),
        flat_chunk(7, Some(1), &[0.1, 0.2], 2.0).with_pk(Array1::from(vec![1.5, 1.5])),
        flat_chunk(9, None, &[0.1], 3.0),
    ];
    let source = CsvSource::write(dir.path().join("Pk1D-0.csv"), &chunks).unwrap();

    let read = source.read_chunks().unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[0].len(), 3);
    assert_eq!(read[1].len(), 2);
    assert_eq!(read[2].len(), 1);
    assert_eq!(read[0].header, chunks[0].header);
    assert!(read[0].pk.is_none());
    assert_eq!(read[1].pk.as_ref().unwrap()[1], 1.5);
    assert_eq!(read[1].pk_raw[0], 2.0);
    assert_eq!(read[2].header.chunk_id, None);
    assert_eq!(read[2].sub_forest_id(), None);
    assert_eq!(read[1].sub_forest_id(), Some(String::from("7_1")));
}

#[test]
fn test_retrieve_sources_matches_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let chunks = vec![flat_chunk(1, None, &[0.1], 1.0)];
    CsvSource::write(dir.path().join("Pk1D-1.csv"), &chunks).unwrap();
    CsvSource::write(dir.path().join("Pk1D-0.csv"), &chunks).unwrap();
    CsvSource::write(dir.path().join("other.csv"), &chunks).unwrap();

    let sources = retrieve_sources(dir.path()).unwrap();
    assert_eq!(sources.len(), 2);
    assert!(sources[0].path.ends_with("Pk1D-0.csv"));
}

#[test]
fn test_inconsistent_chunk_is_detected() {
    let mut chunk = flat_chunk(1, None, &[0.1, 0.2], 1.0);
    assert!(chunk.is_consistent());
    chunk.pk_noise = Array1::zeros(3);
    assert!(!chunk.is_consistent());
}
