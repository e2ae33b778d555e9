use crate::errors::ConfigError;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub type TsvReader = csv::Reader<Box<dyn Read>>;

pub fn check_input_file(path: &str) -> Result<(), ConfigError> {
    if Path::new(path).is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingInput(path.to_string()))
    }
}

// The directory an output file (or output prefix) will be written to must exist.
pub fn check_output_dir(path: &str) -> Result<(), ConfigError> {
    let dir = match Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => return Ok(()),
    };
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::MissingOutputDir(dir.display().to_string()))
    }
}

pub fn warn_if_exists(path: &str) {
    if Path::new(path).exists() {
        warn!("{} exists and will be overwritten", path);
    }
}

/// Open a tab-delimited file with a header line. Gzip (including bgzip, which
/// is a series of gzip members) is detected from the `.gz` suffix.
pub fn open_tsv_reader(path: &str) -> anyhow::Result<TsvReader> {
    check_input_file(path)?;
    let file = BufReader::new(File::open(path)?);
    let input: Box<dyn Read> = if path.ends_with(".gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .quoting(false)
        .from_reader(input))
}

// Case-insensitive mapping from column names to indices, resolved once per file.
#[derive(Clone, Debug)]
pub struct Schema {
    file: String,
    header: Vec<String>,
    lowered: Vec<String>,
}

impl Schema {
    pub fn from_reader(rdr: &mut TsvReader, file: &str) -> anyhow::Result<Schema> {
        let header: Vec<String> = rdr.headers()?.iter().map(|x| x.to_string()).collect();
        Ok(Schema::new(file, header))
    }

    pub fn new(file: &str, header: Vec<String>) -> Schema {
        let lowered = header.iter().map(|x| x.trim().to_lowercase()).collect();
        Schema {
            file: file.to_string(),
            header,
            lowered,
        }
    }

    pub fn optional(&self, column: &str) -> Option<usize> {
        let column = column.to_lowercase();
        self.lowered.iter().position(|x| *x == column)
    }

    pub fn require(&self, column: &str) -> Result<usize, ConfigError> {
        self.optional(column).ok_or_else(|| ConfigError::MissingColumn {
            column: column.to_string(),
            file: self.file.clone(),
            header: self.header.join(","),
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }
}

pub fn parse_field<T>(record: &csv::StringRecord, col: usize, name: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = record
        .get(col)
        .ok_or_else(|| anyhow::anyhow!("Row is missing column '{}': {:?}", name, record))?;
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Unable to parse '{}' in column '{}': {}", value, name, e))
}

pub enum OutputSink {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutputSink::Plain(w) => w.write(buf),
            OutputSink::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutputSink::Plain(w) => w.flush(),
            OutputSink::Gz(w) => w.flush(),
        }
    }
}

impl OutputSink {
    pub fn create(path: &str) -> anyhow::Result<OutputSink> {
        let file = BufWriter::new(File::create(path)?);
        if path.ends_with(".gz") {
            Ok(OutputSink::Gz(GzEncoder::new(file, Compression::default())))
        } else {
            Ok(OutputSink::Plain(file))
        }
    }

    pub fn finish(self) -> std::io::Result<()> {
        match self {
            OutputSink::Plain(mut w) => w.flush(),
            OutputSink::Gz(w) => w.finish()?.flush(),
        }
    }
}

pub struct TsvWriter {
    inner: csv::Writer<OutputSink>,
}

impl TsvWriter {
    pub fn create(path: &str) -> anyhow::Result<TsvWriter> {
        let sink = OutputSink::create(path)?;
        let inner = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(sink);
        Ok(TsvWriter { inner })
    }

    pub fn write_record<I, T>(&mut self, record: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.inner.write_record(record)?;
        Ok(())
    }

    pub fn finish(self) -> anyhow::Result<()> {
        let sink = self.inner.into_inner().map_err(|e| e.into_error())?;
        sink.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_case_insensitive() {
        let schema = Schema::new(
            "input.tsv",
            vec!["X".to_string(), "Y".to_string(), "Gene".to_string()],
        );
        assert_eq!(schema.require("x").unwrap(), 0);
        assert_eq!(schema.require("GENE").unwrap(), 2);
        assert!(schema.optional("count").is_none());
        match schema.require("count") {
            Err(ConfigError::MissingColumn { column, .. }) => assert_eq!(column, "count"),
            _ => panic!("expected a missing column error"),
        }
    }

    #[test]
    fn test_gz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.tsv.gz");
        let path = path.to_str().unwrap();

        let mut writer = TsvWriter::create(path).unwrap();
        writer.write_record(["unit", "gene", "count"]).unwrap();
        writer.write_record(["u1", "A", "3"]).unwrap();
        writer.finish().unwrap();

        let mut rdr = open_tsv_reader(path).unwrap();
        let schema = Schema::from_reader(&mut rdr, path).unwrap();
        let count_col = schema.require("Count").unwrap();
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        let count: u32 = parse_field(&records[0], count_col, "count").unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_missing_output_dir() {
        assert!(check_output_dir("no/such/dir/out.tsv").is_err());
        assert!(check_output_dir("out.tsv").is_ok());
    }
}
