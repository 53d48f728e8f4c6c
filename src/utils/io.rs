use crate::error::ConfigError;
use crate::utils::scientific;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Fails if `path` exists and may not be overwritten.
pub fn ensure_writable(path: &Path, overwrite: bool) -> Result<(), ConfigError> {
    if !overwrite && path.exists() {
        return Err(ConfigError::OutputExists(path.to_path_buf()));
    }
    Ok(())
}

fn create(path: &Path, overwrite: bool) -> Result<BufWriter<File>> {
    ensure_writable(path, overwrite)?;
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Serializes `value` to `path` with bincode.
pub fn write_bincode<T: Serialize>(path: &Path, value: &T, overwrite: bool) -> Result<()> {
    let mut writer = create(path, overwrite)?;
    bincode::serialize_into(&mut writer, value)
        .with_context(|| format!("failed to serialize into {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("failed to deserialize {}", path.display()))
}

/// Writes a whitespace separated table of floats in `%.5e` format, preceded by
/// `header` lines prefixed with `# `.
pub fn write_text_table(path: &Path, header: &[String], rows: &[Vec<f64>], overwrite: bool) -> Result<()> {
    let mut writer = create(path, overwrite)?;
    for line in header {
        writeln!(writer, "# {line}")?;
    }
    for row in rows {
        let line: Vec<String> = row.iter().map(|&x| scientific(x)).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

#[test]
fn test_bincode_round_trip_and_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.bin");
    let value = (vec![1.0_f64, f64::NAN], String::from("Pk"));

    write_bincode(&path, &value, false).unwrap();
    let read: (Vec<f64>, String) = read_bincode(&path).unwrap();
    assert_eq!(read.0[0], 1.0);
    assert!(read.0[1].is_nan());
    assert_eq!(read.1, "Pk");

    // Existing output is kept unless overwriting is allowed
    let error = write_bincode(&path, &value, false).unwrap_err();
    assert_eq!(
        error.downcast_ref::<ConfigError>(),
        Some(&ConfigError::OutputExists(path.clone()))
    );
    write_bincode(&path, &(vec![2.0_f64], String::new()), true).unwrap();
    let read: (Vec<f64>, String) = read_bincode(&path).unwrap();
    assert_eq!(read.0, vec![2.0]);
}

#[test]
fn test_text_table_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snrfit.txt");
    let header = vec![String::from("z k a b")];
    write_text_table(&path, &header, &[vec![2.2, 0.015, f64::NAN]], false).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "# z k a b\n2.20000e+00 1.50000e-02 nan\n");
}
