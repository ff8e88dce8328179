//! Tab separated chain files.
//!
//! Every line of a chain file is one accepted point:
//! `multiplicity, -log_likelihood, varying..., derived...`. The same format
//! is read back when a chain is restarted.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use thiserror::Error;

/// One output line: a point and the number of steps the chain stayed there.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRecord {
    pub multiplicity: u64,
    pub neg_loglike: f64,
    /// Varying then derived parameter values, in internal units.
    pub values: Vec<f64>,
}

/// Destination of the accepted points of a chain.
pub trait ChainWriter {
    fn write_record(&mut self, record: &ChainRecord) -> io::Result<()>;

    /// Push buffered records to durable storage.
    fn flush(&mut self) -> io::Result<()>;

    /// Remove the chain a restarted run started from, once the new chain
    /// supersedes it.
    fn discard_restart(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Writes records as tab separated text.
pub struct TextChainWriter<W: Write = BufWriter<File>> {
    writer: W,
    precision: usize,
}

impl TextChainWriter<BufWriter<File>> {
    /// Create (or truncate) the chain file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> TextChainWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            precision: 6,
        }
    }

    /// Number of digits after the decimal point. Default is 6.
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn format(&self, record: &ChainRecord) -> String {
        let prec = self.precision;
        let values = record
            .values
            .iter()
            .map(|val| format!("{val:.prec$e}"))
            .join("\t");
        if values.is_empty() {
            format!("{}\t{:.prec$e}", record.multiplicity, record.neg_loglike)
        } else {
            format!(
                "{}\t{:.prec$e}\t{values}",
                record.multiplicity, record.neg_loglike
            )
        }
    }
}

impl<W: Write> ChainWriter for TextChainWriter<W> {
    fn write_record(&mut self, record: &ChainRecord) -> io::Result<()> {
        let line = self.format(record);
        writeln!(self.writer, "{line}")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Keeps records in memory.
///
/// Restart files handed to [`ChainWriter::discard_restart`] are only
/// remembered, never deleted.
#[derive(Debug, Default, Clone)]
pub struct MemoryWriter {
    pub records: Vec<ChainRecord>,
    pub flushes: usize,
    pub discarded: Vec<PathBuf>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all multiplicities written so far.
    pub fn total_multiplicity(&self) -> u64 {
        self.records.iter().map(|r| r.multiplicity).sum()
    }
}

impl ChainWriter for MemoryWriter {
    fn write_record(&mut self, record: &ChainRecord) -> io::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn discard_restart(&mut self, path: &Path) -> io::Result<()> {
        self.discarded.push(path.to_path_buf());
        Ok(())
    }
}

impl<T: ChainWriter + ?Sized> ChainWriter for &mut T {
    fn write_record(&mut self, record: &ChainRecord) -> io::Result<()> {
        (**self).write_record(record)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn discard_restart(&mut self, path: &Path) -> io::Result<()> {
        (**self).discard_restart(path)
    }
}

#[derive(Error, Debug)]
pub enum RestartError {
    #[error("failed to read restart chain {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("restart chain contains no records")]
    Empty,
    #[error("restart record has {found} fields, expected at least {expected}")]
    TooShort { expected: usize, found: usize },
    #[error("field {field} of the restart record is not a number: `{token}`")]
    Parse { field: usize, token: String },
}

/// The varying parameter values of a chain line.
///
/// Fields are tab separated: multiplicity, -log_likelihood, then the values
/// in the order of the varying parameters. Trailing fields (derived
/// parameters) are ignored.
pub fn parse_restart_line(line: &str, num_varying: usize) -> Result<Vec<f64>, RestartError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    let expected = num_varying + 2;
    if fields.len() < expected {
        return Err(RestartError::TooShort {
            expected,
            found: fields.len(),
        });
    }
    fields[2..expected]
        .iter()
        .enumerate()
        .map(|(i, token)| {
            token.trim().parse().map_err(|_| RestartError::Parse {
                field: i + 2,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Read the last accepted point of an existing chain file.
pub fn read_restart_point<P: AsRef<Path>>(
    path: P,
    num_varying: usize,
) -> Result<Vec<f64>, RestartError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| RestartError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let last = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .ok_or(RestartError::Empty)?;
    parse_restart_line(last, num_varying)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn restart_uses_values_after_multiplicity_and_loglike() {
        let values = parse_restart_line("3\t12.4\t0.022\t0.96", 2).unwrap();
        assert_eq!(values, vec![0.022, 0.96]);

        let values = parse_restart_line("3\t12.4\t0.022\t0.96\t67.3\n", 2).unwrap();
        assert_eq!(values, vec![0.022, 0.96]);
    }

    #[test]
    fn restart_errors() {
        assert!(matches!(
            parse_restart_line("3\t12.4\t0.022", 2),
            Err(RestartError::TooShort {
                expected: 4,
                found: 3
            })
        ));
        assert!(matches!(
            parse_restart_line("3\t12.4\tabc\t0.96", 2),
            Err(RestartError::Parse { field: 2, .. })
        ));
    }

    #[test]
    fn restart_reads_last_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chain.txt");
        fs::write(&path, "1\t10.0\t0.021\t0.95\n3\t12.4\t0.022\t0.96\n\n")?;
        assert_eq!(read_restart_point(&path, 2)?, vec![0.022, 0.96]);

        fs::write(&path, "\n")?;
        assert!(matches!(
            read_restart_point(&path, 2),
            Err(RestartError::Empty)
        ));
        Ok(())
    }

    #[test]
    fn text_writer_round_trips_through_restart() -> anyhow::Result<()> {
        let mut writer = TextChainWriter::new(Vec::new()).with_precision(4);
        writer.write_record(&ChainRecord {
            multiplicity: 2,
            neg_loglike: 12.5,
            values: vec![0.0225, -1.5],
        })?;
        writer.flush()?;
        let text = String::from_utf8(writer.into_inner())?;
        assert_eq!(text, "2\t1.2500e1\t2.2500e-2\t-1.5000e0\n");
        assert_eq!(parse_restart_line(text.trim_end(), 2)?, vec![0.0225, -1.5]);
        Ok(())
    }

    #[test]
    fn file_writer_discards_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let old = dir.path().join("old.txt");
        fs::write(&old, "1\t1.0\t0.5\n")?;
        let mut writer = TextChainWriter::create(dir.path().join("new.txt"))?;
        writer.discard_restart(&old)?;
        assert!(!old.exists());
        Ok(())
    }
}
