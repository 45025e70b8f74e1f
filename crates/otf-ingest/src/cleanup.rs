//! Conversion of raw integrator output into the published `.xy` format
//!
//! The integrator writes a block of `#` comment lines followed by
//! whitespace-separated columns in scientific notation. Published files carry
//! a single `X\tY[\tE]` header row and tab-delimited fixed-point values with
//! eight decimals.

use crate::error::{IngestError, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Column names of published profiles: radial, intensity, sigma
pub const CANONICAL_COLUMNS: [&str; 3] = ["X", "Y", "E"];

/// Parsed integrator profile
#[derive(Debug, Clone, PartialEq)]
pub struct XyTable {
    rows: Vec<Vec<f64>>,
    width: usize,
}

impl XyTable {
    /// Parse raw integrator text, dropping exactly `header_lines` lines
    ///
    /// `source` is only used to label errors.
    pub fn parse_raw(source: &Path, text: &str, header_lines: usize) -> Result<Self> {
        let total_lines = text.lines().count();
        if total_lines < header_lines {
            return Err(IngestError::malformed(
                source,
                format!("expected {} header lines, file has {} lines", header_lines, total_lines),
            ));
        }

        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut width = 0;

        for (idx, line) in text.lines().enumerate().skip(header_lines) {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let row = line
                .split_whitespace()
                .map(|token| {
                    token.parse::<f64>().map_err(|_| {
                        IngestError::malformed(
                            source,
                            format!("line {}: cannot parse '{}' as a number", line_no, token),
                        )
                    })
                })
                .collect::<Result<Vec<f64>>>()?;

            if rows.is_empty() {
                if !(2..=3).contains(&row.len()) {
                    return Err(IngestError::malformed(
                        source,
                        format!("line {}: expected 2 or 3 columns, found {}", line_no, row.len()),
                    ));
                }
                width = row.len();
            } else if row.len() != width {
                return Err(IngestError::malformed(
                    source,
                    format!("line {}: expected {} columns, found {}", line_no, width, row.len()),
                ));
            }

            rows.push(row);
        }

        if rows.is_empty() {
            return Err(IngestError::malformed(source, "no data rows after the header"));
        }

        Ok(Self { rows, width })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_sigma(&self) -> bool {
        self.width == 3
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn columns(&self) -> &'static [&'static str] {
        &CANONICAL_COLUMNS[..self.width]
    }

    /// Write the canonical tab-delimited form
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);

        out.write_record(self.columns())?;
        for row in &self.rows {
            out.write_record(row.iter().map(|value| format!("{:.8}", value)))?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Write `dest` through a temporary file in the same directory
///
/// The temporary file is removed if `write` fails, so `dest` is either left
/// untouched or replaced by complete content.
pub(crate) fn persist_atomically<F>(dest: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".otf-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(dest).map_err(|e| IngestError::persist(dest, e))?;
    Ok(())
}

/// Convert a raw integrator file into a published profile at `dest`
///
/// Returns the number of data rows written.
pub fn rewrite_raw(raw: &Path, dest: &Path, header_lines: usize) -> Result<usize> {
    let text = std::fs::read_to_string(raw)?;
    let table = XyTable::parse_raw(raw, &text, header_lines)?;
    persist_atomically(dest, |file| table.write_tsv(file))?;
    Ok(table.len())
}

/// Check that `path` holds a complete published profile
pub fn validate_output(path: &Path) -> bool {
    match check_output(path) {
        Ok(()) => true,
        Err(reason) => {
            debug!(path = %path.display(), %reason, "Existing output does not validate");
            false
        },
    }
}

fn check_output(path: &Path) -> std::result::Result<(), String> {
    if !path.is_file() {
        return Err("missing".to_string());
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| e.to_string())?;

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let width = headers.len();
    if !(2..=3).contains(&width)
        || headers
            .iter()
            .zip(CANONICAL_COLUMNS.iter())
            .any(|(found, expected)| found != *expected)
    {
        return Err(format!("unexpected header row {:?}", headers));
    }

    let mut rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        if record.len() != width {
            return Err(format!("row {} has {} columns", rows + 1, record.len()));
        }
        for field in record.iter() {
            field
                .parse::<f64>()
                .map_err(|_| format!("row {}: '{}' is not a number", rows + 1, field))?;
        }
        rows += 1;
    }

    if rows == 0 {
        return Err("no data rows".to_string());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn raw_text(header_lines: usize, rows: &[&str]) -> String {
        let mut text = String::new();
        for i in 0..header_lines {
            text.push_str(&format!("# header line {}\n", i));
        }
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text
    }

    fn source() -> PathBuf {
        PathBuf::from("frame_0001.raw")
    }

    #[test]
    fn test_header_is_replaced_and_precision_fixed() {
        let text = raw_text(
            23,
            &[
                "  1.0000000000e+00  2.5000000000e+02",
                "  1.5000000000e+00  1.2345678912e+02",
                "  2.0000000000e+00  0.0000000000e+00",
            ],
        );
        let table = XyTable::parse_raw(&source(), &text, 23).unwrap();
        assert_eq!(table.len(), 3);
        assert!(!table.has_sigma());

        let mut out = Vec::new();
        table.write_tsv(&mut out).unwrap();
        let written = String::from_utf8(out).unwrap();

        assert_eq!(
            written,
            "X\tY\n\
             1.00000000\t250.00000000\n\
             1.50000000\t123.45678912\n\
             2.00000000\t0.00000000\n"
        );
    }

    #[test]
    fn test_sigma_column_is_named_e() {
        let text = raw_text(2, &["1.0 2.0 0.5", "2.0 4.0 0.25"]);
        let table = XyTable::parse_raw(&source(), &text, 2).unwrap();
        assert!(table.has_sigma());
        assert_eq!(table.columns(), &["X", "Y", "E"]);

        let mut out = Vec::new();
        table.write_tsv(&mut out).unwrap();
        let written = String::from_utf8(out).unwrap();
        assert!(written.starts_with("X\tY\tE\n1.00000000\t2.00000000\t0.50000000\n"));
    }

    #[test]
    fn test_wrong_header_count_names_the_line() {
        let text = raw_text(23, &["1.0 2.0"]);
        let err = XyTable::parse_raw(&source(), &text, 22).unwrap_err();
        match err {
            IngestError::MalformedOutput { reason, .. } => assert!(reason.contains("line 23")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_short_file_and_empty_body_are_rejected() {
        assert!(XyTable::parse_raw(&source(), "# only\n", 23).is_err());
        assert!(XyTable::parse_raw(&source(), &raw_text(3, &[]), 3).is_err());
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let text = raw_text(1, &["1.0 2.0", "2.0 3.0 4.0"]);
        assert!(XyTable::parse_raw(&source(), &text, 1).is_err());

        let text = raw_text(1, &["1.0"]);
        assert!(XyTable::parse_raw(&source(), &text, 1).is_err());
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let text = raw_text(1, &["1.0 2.0", "", "   ", "3.0 4.0"]);
        let table = XyTable::parse_raw(&source(), &text, 1).unwrap();
        assert_eq!(table.rows(), &[vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_rewrite_raw_produces_valid_output() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("frame.raw");
        let dest = dir.path().join("frame.xy");
        std::fs::write(&raw, raw_text(23, &["1.0 10.0", "2.0 20.0"])).unwrap();

        let rows = rewrite_raw(&raw, &dest, 23).unwrap();
        assert_eq!(rows, 2);
        assert!(validate_output(&dest));
    }

    #[test]
    fn test_failed_rewrite_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("frame.raw");
        let dest = dir.path().join("frame.xy");
        std::fs::write(&raw, "# truncated\n").unwrap();

        assert!(rewrite_raw(&raw, &dest, 23).is_err());
        assert!(!dest.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_validate_output_rejects_incomplete_files() {
        let dir = tempfile::tempdir().unwrap();

        assert!(!validate_output(&dir.path().join("missing.xy")));

        let header_only = dir.path().join("header_only.xy");
        std::fs::write(&header_only, "X\tY\n").unwrap();
        assert!(!validate_output(&header_only));

        let raw_style = dir.path().join("raw_style.xy");
        std::fs::write(&raw_style, "# 2th_deg I\n1.0 2.0\n").unwrap();
        assert!(!validate_output(&raw_style));

        let truncated = dir.path().join("truncated.xy");
        std::fs::write(&truncated, "X\tY\n1.00000000\t2.00000000\n3.000").unwrap();
        assert!(!validate_output(&truncated));

        let good = dir.path().join("good.xy");
        std::fs::write(&good, "X\tY\tE\n1.00000000\t2.00000000\t0.10000000\n").unwrap();
        assert!(validate_output(&good));
    }
}
