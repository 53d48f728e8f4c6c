//! Reading individual P1Ds into one flat table of chunk samples, with the
//! quality cuts applied on the way in.
use crate::constants::{
    EBOSS_SNR_CUT, EBOSS_SNR_CUT_REDSHIFTS, LYA_WAVELENGTH, NOISE_OUTLIER_FACTOR, SPEED_LIGHT,
};
use crate::error::ConfigError;
use crate::utils::loader::{Pk1dChunk, RecordSource};
use crate::utils::nearest_index;
use crate::{LosId, Series, SubForestId};
use anyhow::Result;
use itertools::Itertools;
use ndarray::{Array1, Zip};
use serde_derive::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Every quantity for which statistics are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    K,
    PkRaw,
    PkNoise,
    PkDiff,
    CorReso,
    Pk,
    PkNoiseMiss,
    ForestZ,
    ForestSnr,
    Delta2,
    PkNorescor,
    PkNonoise,
    PkNoraw,
    PkNorawMiss,
}

impl Quantity {
    /// Column name, as used in the output tables (e.g. `meanPk_raw`).
    pub const fn name(self) -> &'static str {
        match self {
            Quantity::K => "k",
            Quantity::PkRaw => "Pk_raw",
            Quantity::PkNoise => "Pk_noise",
            Quantity::PkDiff => "Pk_diff",
            Quantity::CorReso => "cor_reso",
            Quantity::Pk => "Pk",
            Quantity::PkNoiseMiss => "Pk_noise_miss",
            Quantity::ForestZ => "forest_z",
            Quantity::ForestSnr => "forest_snr",
            Quantity::Delta2 => "Delta2",
            Quantity::PkNorescor => "Pk_norescor",
            Quantity::PkNonoise => "Pk_nonoise",
            Quantity::PkNoraw => "Pk_noraw",
            Quantity::PkNorawMiss => "Pk_noraw_miss",
        }
    }

    /// Power spectra scale as 1/k under a change of units.
    pub const fn is_power_like(self) -> bool {
        matches!(
            self,
            Quantity::PkRaw
                | Quantity::PkNoise
                | Quantity::PkDiff
                | Quantity::Pk
                | Quantity::PkNoiseMiss
                | Quantity::PkNorescor
                | Quantity::PkNonoise
                | Quantity::PkNoraw
                | Quantity::PkNorawMiss
        )
    }

    /// Tracked quantities, in output order.
    pub fn tracked(with_noise_miss: bool) -> Vec<Quantity> {
        use Quantity::*;
        let mut quantities = vec![K, PkRaw, PkNoise, PkDiff, CorReso, Pk];
        if with_noise_miss {
            quantities.push(PkNoiseMiss);
        }
        quantities.extend([ForestZ, ForestSnr, Delta2, PkNorescor, PkNonoise, PkNoraw]);
        if with_noise_miss {
            quantities.push(PkNorawMiss);
        }
        quantities
    }
}

/// Minimum mean SNR a chunk must have to be kept.
#[derive(Debug, Clone, PartialEq)]
pub struct SnrCut {
    thresholds: Vec<f64>,
    redshifts: Option<Vec<f64>>,
}

impl SnrCut {
    /// Same threshold at every redshift.
    pub fn global(threshold: f64) -> Self {
        SnrCut {
            thresholds: vec![threshold],
            redshifts: None,
        }
    }

    /// One threshold per redshift; a chunk uses the threshold of the closest redshift.
    pub fn redshift_dependent(
        thresholds: Vec<f64>,
        redshifts: Option<Vec<f64>>,
    ) -> Result<Self, ConfigError> {
        match (thresholds.len(), &redshifts) {
            (0, _) => Err(ConfigError::EmptySnrCut),
            (1, None) => Ok(SnrCut::global(thresholds[0])),
            (n, Some(z)) if n == z.len() => Ok(SnrCut {
                thresholds,
                redshifts,
            }),
            (n, z) => Err(ConfigError::SnrCutRedshiftMismatch {
                thresholds: n,
                redshifts: z.as_ref().map_or(0, Vec::len),
            }),
        }
    }

    /// Named cut schemes.
    pub fn scheme(name: &str) -> Result<Self, ConfigError> {
        match name {
            "eboss" => SnrCut::redshift_dependent(
                EBOSS_SNR_CUT.clone(),
                Some(EBOSS_SNR_CUT_REDSHIFTS.clone()),
            ),
            other => Err(ConfigError::UnknownSnrCutScheme(other.to_string())),
        }
    }

    /// Threshold applying to a chunk at redshift `z`.
    pub fn threshold(&self, z: f64) -> f64 {
        match &self.redshifts {
            Some(redshifts) if self.thresholds.len() > 1 => {
                let index = nearest_index(redshifts, z).unwrap_or(0);
                self.thresholds[index]
            }
            _ => self.thresholds[0],
        }
    }

    pub fn is_redshift_dependent(&self) -> bool {
        self.thresholds.len() > 1
    }

    /// Smallest threshold at any redshift.
    pub fn min_threshold(&self) -> f64 {
        self.thresholds.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

/// One row per (chunk, k mode), one column per tracked quantity.
#[derive(Debug, Clone)]
pub struct Pk1dTable {
    quantities: Vec<Quantity>,
    columns: Vec<Series>,
    forest_id: Vec<LosId>,
    sub_forest_id: Option<Vec<SubForestId>>,
}

impl Pk1dTable {
    /// Builds the table from accepted chunks and computes the derived quantities.
    /// Returns `None` if there are no chunks.
    pub fn from_chunks(chunks: &[Pk1dChunk]) -> Option<Self> {
        if chunks.is_empty() {
            return None;
        }

        let with_noise_miss = chunks.iter().all(|chunk| chunk.pk_noise_miss.is_some());
        if !with_noise_miss && chunks.iter().any(|chunk| chunk.pk_noise_miss.is_some()) {
            log::warn!("Pk_noise_miss is missing from some chunks: dropping it for all");
        }

        let with_sub_forest_id = chunks.iter().all(|chunk| chunk.header.chunk_id.is_some());
        if !with_sub_forest_id && chunks.iter().any(|chunk| chunk.header.chunk_id.is_some()) {
            log::warn!("CHUNK_ID is missing from some chunks: sub_forest_id is dropped for all");
        }

        let quantities = Quantity::tracked(with_noise_miss);
        let size: usize = chunks.iter().map(Pk1dChunk::len).sum();

        // Raw columns, concatenated chunk after chunk
        let concat = |f: &dyn Fn(&Pk1dChunk) -> Series| -> Series {
            let mut values = Vec::with_capacity(size);
            for chunk in chunks {
                values.extend(f(chunk).iter().copied());
            }
            Array1::from(values)
        };
        let k = concat(&|chunk| chunk.k.clone());
        let pk_raw = concat(&|chunk| chunk.pk_raw.clone());
        let pk_noise = concat(&|chunk| chunk.pk_noise.clone());
        let pk_diff = concat(&|chunk| chunk.pk_diff.clone());
        let cor_reso = concat(&|chunk| chunk.cor_reso.clone());
        let pk = concat(&|chunk| clean_pk(chunk));
        let forest_z = concat(&|chunk| Array1::from_elem(chunk.len(), chunk.header.mean_z));
        let forest_snr = concat(&|chunk| Array1::from_elem(chunk.len(), chunk.header.mean_snr));
        let pk_noise_miss = with_noise_miss.then(|| {
            concat(&|chunk| {
                chunk
                    .pk_noise_miss
                    .clone()
                    .unwrap_or_else(|| Array1::from_elem(chunk.len(), f64::NAN))
            })
        });

        let forest_id: Vec<LosId> = chunks
            .iter()
            .flat_map(|chunk| std::iter::repeat(chunk.header.los_id).take(chunk.len()))
            .collect();
        let sub_forest_id: Option<Vec<SubForestId>> = with_sub_forest_id.then(|| {
            chunks
                .iter()
                .flat_map(|chunk| {
                    let id = chunk.sub_forest_id().unwrap_or_default();
                    std::iter::repeat(id).take(chunk.len())
                })
                .collect()
        });

        // Derived columns
        let columns = quantities
            .iter()
            .map(|quantity| match quantity {
                Quantity::K => k.clone(),
                Quantity::PkRaw => pk_raw.clone(),
                Quantity::PkNoise => pk_noise.clone(),
                Quantity::PkDiff => pk_diff.clone(),
                Quantity::CorReso => cor_reso.clone(),
                Quantity::Pk => pk.clone(),
                Quantity::PkNoiseMiss => pk_noise_miss.clone().unwrap_or_default(),
                Quantity::ForestZ => forest_z.clone(),
                Quantity::ForestSnr => forest_snr.clone(),
                Quantity::Delta2 => &k * &pk / PI,
                Quantity::PkNorescor => &pk_raw - &pk_noise,
                Quantity::PkNonoise => &pk_raw / &cor_reso,
                Quantity::PkNoraw => &pk_noise / &cor_reso,
                Quantity::PkNorawMiss => pk_noise_miss
                    .as_ref()
                    .map(|miss| miss / &cor_reso)
                    .unwrap_or_default(),
            })
            .collect();

        Some(Pk1dTable {
            quantities,
            columns,
            forest_id,
            sub_forest_id,
        })
    }

    /// Stacks the tables of several sources. Optional columns survive only if
    /// every table has them. Returns `None` if there is nothing to stack.
    pub fn concat(tables: Vec<Pk1dTable>) -> Option<Self> {
        if tables.len() <= 1 {
            return tables.into_iter().next();
        }

        let has_noise_miss = |table: &Pk1dTable| table.column(Quantity::PkNoiseMiss).is_some();
        let with_noise_miss = tables.iter().all(has_noise_miss);
        if !with_noise_miss && tables.iter().any(has_noise_miss) {
            log::warn!("Pk_noise_miss is missing from some files: dropping it for all");
        }
        let quantities = Quantity::tracked(with_noise_miss);

        let with_sub_forest_id = tables.iter().all(|table| table.sub_forest_id.is_some());
        if !with_sub_forest_id && tables.iter().any(|table| table.sub_forest_id.is_some()) {
            log::warn!("sub_forest_id is missing from some files: dropping it for all");
        }

        let columns = quantities
            .iter()
            .map(|&quantity| {
                let mut values = Vec::new();
                for table in tables.iter() {
                    // Every table holds the quantities selected above
                    if let Some(column) = table.column(quantity) {
                        values.extend(column.iter().copied());
                    }
                }
                Array1::from(values)
            })
            .collect();

        let forest_id = tables.iter().flat_map(|t| t.forest_id.iter().copied()).collect();
        let sub_forest_id = with_sub_forest_id.then(|| {
            tables
                .iter()
                .flat_map(|t| t.sub_forest_id.iter().flatten().cloned())
                .collect()
        });

        Some(Pk1dTable {
            quantities,
            columns,
            forest_id,
            sub_forest_id,
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.forest_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forest_id.is_empty()
    }

    pub fn quantities(&self) -> &[Quantity] {
        &self.quantities
    }

    pub fn column(&self, quantity: Quantity) -> Option<&Series> {
        self.quantities
            .iter()
            .position(|&q| q == quantity)
            .map(|index| &self.columns[index])
    }

    /// Columns that are always present.
    pub fn k(&self) -> &Series {
        &self.columns[0]
    }

    pub fn pk(&self) -> &Series {
        self.required(Quantity::Pk)
    }

    pub fn forest_z(&self) -> &Series {
        self.required(Quantity::ForestZ)
    }

    pub fn forest_snr(&self) -> &Series {
        self.required(Quantity::ForestSnr)
    }

    fn required(&self, quantity: Quantity) -> &Series {
        let index = self
            .quantities
            .iter()
            .position(|&q| q == quantity)
            .unwrap_or_else(|| unreachable!("{} is always tracked", quantity.name()));
        &self.columns[index]
    }

    pub fn forest_id(&self) -> &[LosId] {
        &self.forest_id
    }

    pub fn sub_forest_id(&self) -> Option<&[SubForestId]> {
        self.sub_forest_id.as_deref()
    }

    /// Number of distinct lines of sight.
    pub fn number_of_los(&self) -> usize {
        self.forest_id.iter().unique().count()
    }

    /// Converts k from inverse Angstrom to s/km, rescaling every power-like
    /// quantity accordingly.
    pub fn convert_to_velocity_units(&mut self) {
        let factor: Series = self
            .forest_z()
            .mapv(|z| LYA_WAVELENGTH * (1.0 + z) / SPEED_LIGHT);

        for (quantity, column) in self.quantities.iter().zip(self.columns.iter_mut()) {
            if *quantity == Quantity::K {
                Zip::from(column).and(&factor).par_for_each(|k, &f| *k *= f);
            } else if quantity.is_power_like() {
                Zip::from(column).and(&factor).par_for_each(|pk, &f| *pk /= f);
            }
        }
    }
}

/// The clean power `(Pk_raw - Pk_noise) / cor_reso`, unless the chunk already
/// carries a non-zero one.
fn clean_pk(chunk: &Pk1dChunk) -> Series {
    match &chunk.pk {
        Some(pk) if pk.iter().filter(|x| !x.is_nan()).sum::<f64>() != 0.0 => pk.clone(),
        _ => (&chunk.pk_raw - &chunk.pk_noise) / &chunk.cor_reso,
    }
}

/// True if, below `k_max`, the noise power of some mode dwarfs its raw power.
fn has_noise_outlier(chunk: &Pk1dChunk, k_max: f64) -> bool {
    chunk
        .k
        .iter()
        .zip(chunk.pk_noise.iter().zip(chunk.pk_raw.iter()))
        .any(|(&k, (&noise, &raw))| k < k_max && noise > NOISE_OUTLIER_FACTOR * raw)
}

/// Reads one source and applies the chunk quality cuts.
///
/// Returns the table of accepted chunks along with the mean redshift of each
/// accepted chunk, or `None` if no chunk was selected.
pub fn read_pk1d<S: RecordSource + ?Sized>(
    source: &S,
    k_max: f64,
    snr_cut: Option<&SnrCut>,
) -> Result<Option<(Pk1dTable, Vec<f64>)>> {
    let name = source.name();
    let chunks = source.read_chunks()?;

    let mut accepted = Vec::with_capacity(chunks.len());
    let mut z_array = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        if !chunk.is_consistent() {
            log::warn!("source {name} chunk {i} has arrays of different lengths: discarded");
            continue;
        }

        if let Some(cut) = snr_cut {
            if chunk.header.mean_snr < cut.threshold(chunk.header.mean_z) {
                continue;
            }
        }

        // Empirically remove very noisy chunks
        if has_noise_outlier(&chunk, k_max) {
            log::warn!("source {name} chunk {i} has very high noise power: discarded");
            continue;
        }

        z_array.push(chunk.header.mean_z);
        accepted.push(chunk);
    }

    log::debug!("source {name}: kept {} chunks", accepted.len());
    Ok(Pk1dTable::from_chunks(&accepted).map(|table| (table, z_array)))
}

#[cfg(test)]
use crate::utils::loader::{ChunkHeader, MemorySource};

#[cfg(test)]
fn chunk(mean_z: f64, mean_snr: f64, pk_raw: [f64; 2], pk_noise: [f64; 2]) -> Pk1dChunk {
    Pk1dChunk::new(
        ChunkHeader {
            los_id: 1,
            chunk_id: Some(0),
            mean_z,
            mean_snr,
        },
        Array1::from(vec![0.1, 0.2]),
        Array1::from(pk_raw.to_vec()),
        Array1::from(pk_noise.to_vec()),
        Array1::zeros(2),
        Array1::from(vec![2.0, 2.0]),
    )
}

#[cfg(test)]
fn source(chunks: Vec<Pk1dChunk>) -> MemorySource {
    MemorySource {
        name: String::from("test"),
        chunks,
    }
}

#[test]
fn test_clean_pk_is_derived_when_missing_or_zero() {
    let missing = chunk(2.0, 5.0, [3.0, 5.0], [1.0, 1.0]);
    let zero = missing.clone().with_pk(Array1::zeros(2));
    let given = missing.clone().with_pk(Array1::from(vec![7.0, 7.0]));

    let (table, _) = read_pk1d(&source(vec![missing, zero, given]), 1.0, None)
        .unwrap()
        .unwrap();
    let pk = table.pk();
    assert_eq!(pk.to_vec(), vec![1.0, 2.0, 1.0, 2.0, 7.0, 7.0]);
}

#[test]
fn test_derived_quantities() {
    let (table, z_array) = read_pk1d(&source(vec![chunk(2.0, 5.0, [3.0, 5.0], [1.0, 1.0])]), 1.0, None)
        .unwrap()
        .unwrap();
    assert_eq!(z_array, vec![2.0]);
    assert_eq!(table.len(), 2);
    assert_eq!(table.column(Quantity::PkNorescor).unwrap().to_vec(), vec![2.0, 4.0]);
    assert_eq!(table.column(Quantity::PkNonoise).unwrap().to_vec(), vec![1.5, 2.5]);
    assert_eq!(table.column(Quantity::PkNoraw).unwrap().to_vec(), vec![0.5, 0.5]);
    assert!((table.column(Quantity::Delta2).unwrap()[1] - 0.2 * 2.0 / PI).abs() < 1e-12);
    assert_eq!(table.forest_snr().to_vec(), vec![5.0, 5.0]);
    assert!(table.column(Quantity::PkNoiseMiss).is_none());
    assert_eq!(table.sub_forest_id().unwrap()[0], "1_0");
}

#[test]
fn test_global_snr_cut_drops_chunks() {
    let cut = SnrCut::global(3.0);
    let chunks = vec![chunk(2.0, 2.5, [1.0, 1.0], [0.0, 0.0]), chunk(2.0, 3.5, [1.0, 1.0], [0.0, 0.0])];
    let (table, z_array) = read_pk1d(&source(chunks), 1.0, Some(&cut)).unwrap().unwrap();
    assert_eq!(z_array.len(), 1);
    assert_eq!(table.forest_snr()[0], 3.5);
}

#[test]
fn test_redshift_dependent_snr_cut_uses_nearest_redshift() {
    let cut = SnrCut::redshift_dependent(vec![4.0, 2.0], Some(vec![2.0, 3.0])).unwrap();
    assert_eq!(cut.threshold(2.2), 4.0);
    assert_eq!(cut.threshold(2.9), 2.0);

    let chunks = vec![chunk(2.1, 3.0, [1.0, 1.0], [0.0, 0.0]), chunk(2.9, 3.0, [1.0, 1.0], [0.0, 0.0])];
    let (_, z_array) = read_pk1d(&source(chunks), 1.0, Some(&cut)).unwrap().unwrap();
    assert_eq!(z_array, vec![2.9]);
}

#[test]
fn test_snr_cut_configuration_errors() {
    assert_eq!(
        SnrCut::redshift_dependent(vec![4.0, 2.0], None),
        Err(ConfigError::SnrCutRedshiftMismatch {
            thresholds: 2,
            redshifts: 0
        })
    );
    assert_eq!(SnrCut::redshift_dependent(vec![], None), Err(ConfigError::EmptySnrCut));
    assert!(SnrCut::scheme("eboss").unwrap().is_redshift_dependent());
    assert!(!SnrCut::global(2.0).is_redshift_dependent());
    assert_eq!(
        SnrCut::scheme("desi"),
        Err(ConfigError::UnknownSnrCutScheme(String::from("desi")))
    );
}

#[test]
fn test_noisy_chunk_is_discarded() {
    let noisy = chunk(2.0, 5.0, [1.0, 1.0], [2.0e6, 0.0]);
    assert!(read_pk1d(&source(vec![noisy.clone()]), 1.0, None).unwrap().is_none());

    // Only modes below the last k edge are inspected
    assert!(read_pk1d(&source(vec![noisy]), 0.05, None).unwrap().is_some());
}

#[test]
fn test_inconsistent_chunk_is_discarded() {
    let mut bad = chunk(2.0, 5.0, [1.0, 1.0], [0.0, 0.0]);
    bad.pk_diff = Array1::zeros(5);
    let good = chunk(2.0, 5.0, [1.0, 1.0], [0.0, 0.0]);
    let (table, _) = read_pk1d(&source(vec![bad, good]), 1.0, None).unwrap().unwrap();
    assert_eq!(table.len(), 2);
}

#[test]
fn test_concat_drops_partial_optional_columns() {
    let with_miss = chunk(2.0, 5.0, [1.0, 1.0], [0.0, 0.0]).with_pk_noise_miss(Array1::ones(2));
    let mut without_miss = chunk(2.5, 5.0, [1.0, 1.0], [0.0, 0.0]);
    without_miss.header.chunk_id = None;

    let a = Pk1dTable::from_chunks(&[with_miss]).unwrap();
    assert!(a.column(Quantity::PkNorawMiss).is_some());
    let b = Pk1dTable::from_chunks(&[without_miss]).unwrap();

    let table = Pk1dTable::concat(vec![a, b]).unwrap();
    assert_eq!(table.len(), 4);
    assert!(table.column(Quantity::PkNoiseMiss).is_none());
    assert!(table.sub_forest_id().is_none());
    assert_eq!(table.forest_z().to_vec(), vec![2.0, 2.0, 2.5, 2.5]);
    assert_eq!(table.number_of_los(), 1);
}

#[test]
fn test_velocity_units_conversion() {
    let (mut table, _) = read_pk1d(&source(vec![chunk(2.0, 5.0, [3.0, 5.0], [1.0, 1.0])]), 1.0, None)
        .unwrap()
        .unwrap();
    let delta2_before = table.column(Quantity::Delta2).unwrap().clone();
    table.convert_to_velocity_units();

    let factor = LYA_WAVELENGTH * 3.0 / SPEED_LIGHT;
    assert!((table.k()[0] - 0.1 * factor).abs() < 1e-15);
    assert!((table.pk()[0] - 1.0 / factor).abs() < 1e-9);
    assert!(table.column(Quantity::PkNoiseMiss).is_none());
    // Neither the resolution correction nor Delta2 change
    assert_eq!(table.column(Quantity::CorReso).unwrap().to_vec(), vec![2.0, 2.0]);
    assert_eq!(table.column(Quantity::Delta2).unwrap(), &delta2_before);
}
