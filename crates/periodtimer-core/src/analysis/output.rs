//! Plain-text output tables
//!
//! Series are written as `index value` lines and spectra as
//! `frequency magnitude` lines. Floats use Rust's shortest round-trip
//! formatting, so identical results always give identical bytes.

use super::spectrum::SpectrumBin;
use super::AnalysisError;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub fn write_series<W: Write>(writer: &mut W, series: &[f64]) -> io::Result<()> {
    for (index, value) in series.iter().enumerate() {
        writeln!(writer, "{} {}", index, value)?;
    }
    Ok(())
}

pub fn write_spectrum<W: Write>(writer: &mut W, bins: &[SpectrumBin]) -> io::Result<()> {
    for bin in bins {
        writeln!(writer, "{} {}", bin.frequency, bin.magnitude)?;
    }
    Ok(())
}

/// Create `path` and fill it; a failed write removes the partial file
fn write_file<F>(path: &Path, fill: F) -> Result<(), AnalysisError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let attempt = || -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        fill(&mut writer)?;
        writer.flush()
    };
    attempt().map_err(|e| {
        let _ = std::fs::remove_file(path);
        AnalysisError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })
}

/// Write a stage's series, or pass its error through without touching `path`
pub fn write_series_file(
    path: &Path,
    result: &Result<Vec<f64>, AnalysisError>,
) -> Result<usize, AnalysisError> {
    let series = result.as_ref().map_err(Clone::clone)?;
    write_file(path, |w| write_series(w, series))?;
    Ok(series.len())
}

/// Write a stage's spectrum, or pass its error through without touching `path`
pub fn write_spectrum_file(
    path: &Path,
    result: &Result<Vec<SpectrumBin>, AnalysisError>,
) -> Result<usize, AnalysisError> {
    let bins = result.as_ref().map_err(Clone::clone)?;
    write_file(path, |w| write_spectrum(w, bins))?;
    Ok(bins.len())
}
