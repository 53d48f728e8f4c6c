pub mod balancer;
pub mod io;
pub mod loader;

/// Evenly spaced values in the half-open interval `[start, stop)`, following
/// the usual `arange` convention: `ceil((stop - start) / step)` values.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    // Deal with empty and degenerate ranges
    if !(step > 0.0) || !(stop > start) {
        return vec![];
    }

    let num = ((stop - start) / step).ceil() as usize;
    (0..num).map(|i| start + i as f64 * step).collect()
}

/// Rounds `x` to the given number of decimals.
pub fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (x * scale).round() / scale
}

/// Given a table of values, find the index of the entry closest to `x`.
/// Ties go to the first entry. Returns `None` for an empty table.
pub fn nearest_index(table: &[f64], x: f64) -> Option<usize> {
    table
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (index, &value)| {
            let distance = (value - x).abs();
            match best {
                Some((_, best_distance)) if best_distance <= distance => best,
                _ => Some((index, distance)),
            }
        })
        .map(|(index, _)| index)
}

/// True if every value is finite and larger than the previous one.
pub fn is_strictly_increasing(values: &[f64]) -> bool {
    values.iter().all(|x| x.is_finite()) && values.windows(2).all(|pair| pair[0] < pair[1])
}

/// Formats a float the way C's `%.5e` does, e.g. `1.50000e+00`.
pub fn scientific(x: f64) -> String {
    if !x.is_finite() {
        return format!("{x}").to_lowercase();
    }

    // Rust gives `1.50000e0`; split off the exponent and pad it to two digits
    let formatted = format!("{x:.5e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

#[test]
fn test_arange_excludes_stop() {
    let values = arange(0.0, 1.0, 0.25);
    assert_eq!(values, vec![0.0, 0.25, 0.5, 0.75]);
}

#[test]
fn test_arange_partial_last_step() {
    let values = arange(2.1, 6.5, 0.2);
    assert_eq!(values.len(), 22);
    assert_eq!(round_to(*values.last().unwrap(), 5), 6.3);
}

#[test]
fn test_arange_empty() {
    assert!(arange(1.0, 1.0, 0.1).is_empty());
    assert!(arange(1.0, 2.0, 0.0).is_empty());
    assert!(arange(2.0, 1.0, 0.1).is_empty());
}

#[test]
fn test_round_to_five_decimals() {
    assert_eq!(round_to(2.3000000000000003, 5), 2.3);
    assert_eq!(round_to(1.234567, 5), 1.23457);
}

#[test]
fn test_nearest_index() {
    let table = [2.2, 2.4, 2.6];
    assert_eq!(nearest_index(&table, 2.0), Some(0));
    assert_eq!(nearest_index(&table, 2.45), Some(1));
    assert_eq!(nearest_index(&table, 9.0), Some(2));
    assert_eq!(nearest_index(&[], 9.0), None);
}

#[test]
fn test_nearest_index_tie_goes_to_first() {
    let table = [1.0, 3.0];
    assert_eq!(nearest_index(&table, 2.0), Some(0));
}

#[test]
fn test_strictly_increasing() {
    assert!(is_strictly_increasing(&[0.0, 1.0, 2.0]));
    assert!(!is_strictly_increasing(&[0.0, 1.0, 1.0]));
    assert!(!is_strictly_increasing(&[0.0, f64::NAN]));
}

#[test]
fn test_scientific_matches_printf() {
    assert_eq!(scientific(1.5), "1.50000e+00");
    assert_eq!(scientific(0.00123), "1.23000e-03");
    assert_eq!(scientific(-250.0), "-2.50000e+02");
    assert_eq!(scientific(f64::NAN), "nan");
}
