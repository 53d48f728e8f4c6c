/// Rest-frame wavelength of the Lyman-alpha transition, in Angstrom.
pub const LYA_WAVELENGTH: f64 = 1215.67;

/// Speed of light, in km/s.
pub const SPEED_LIGHT: f64 = 299_792.458;

/// A chunk is discarded when, below the last k edge, its noise power exceeds
/// its raw power by more than this factor.
pub const NOISE_OUTLIER_FACTOR: f64 = 1.0e6;

/// SNR range over which the dispersion of a quantity is fitted against SNR.
/// SNR bins have unit width between these two values.
pub const MEANPK_FITRANGE_SNR: [f64; 2] = [1.0, 10.0];

/// SNR values are clamped from below to this value before evaluating the fitted variance.
pub const MIN_FIT_SNR: f64 = 1.01;

/// Above this SNR, `simple_snr` weights are frozen at `(SIMPLE_SNR_LIMIT - 1)^2`.
pub const SIMPLE_SNR_LIMIT: f64 = 4.0;

pub const DEFAULT_NUMBER_BOOTSTRAP: usize = 50;

/// Absolute tolerance on the spacing of redshift bin centers when redshift weights are used.
pub const Z_SPACING_TOLERANCE: f64 = 1.0e-3;

/// Redshift bin centers are rounded to this many decimals.
pub const BIN_CENTER_DECIMALS: i32 = 5;

lazy_static! {
    /// Redshift-dependent mean SNR cut used for the eBOSS analysis.
    pub static ref EBOSS_SNR_CUT: Vec<f64> = {
        let mut cut = vec![4.1, 3.9, 3.6, 3.2, 2.9, 2.6, 2.2];
        cut.extend([2.0; 14]);
        cut
    };

    /// Redshifts associated to each entry of `EBOSS_SNR_CUT` (2.2, 2.4, ..., 6.2).
    pub static ref EBOSS_SNR_CUT_REDSHIFTS: Vec<f64> = crate::utils::arange(2.2, 6.4, 0.2)
        .into_iter()
        .map(|z| crate::utils::round_to(z, BIN_CENTER_DECIMALS))
        .collect();
}

#[test]
fn test_eboss_tables_are_aligned() {
    assert_eq!(EBOSS_SNR_CUT.len(), 21);
    assert_eq!(EBOSS_SNR_CUT_REDSHIFTS.len(), EBOSS_SNR_CUT.len());
    assert_eq!(EBOSS_SNR_CUT_REDSHIFTS[0], 2.2);
    assert_eq!(EBOSS_SNR_CUT_REDSHIFTS[20], 6.2);
}
