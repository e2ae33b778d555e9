use crate::boundary::PreparedBoundary;
use crate::tsv::{open_tsv_reader, parse_field, Schema, TsvWriter};

use log::info;
use std::collections::HashSet;

/// Keeps the rows of a molecule table whose (scaled) coordinates fall inside
/// a boundary, streaming the input in fixed size chunks.
pub struct RegionFilter<'a> {
    pub boundary: &'a PreparedBoundary,
    pub mu_scale: f64,
    pub features: Option<&'a HashSet<String>>,
    pub chunk_size: usize,
}

impl<'a> RegionFilter<'a> {
    // Returns the number of rows written. The output file is only created once
    // there is a non-empty chunk to write, and the header goes with that chunk.
    pub fn filter_file(&self, input: &str, output: &str) -> anyhow::Result<usize> {
        let mut rdr = open_tsv_reader(input)?;
        let schema = Schema::from_reader(&mut rdr, input)?;
        let x_col = schema.require("X")?;
        let y_col = schema.require("Y")?;
        let gene_col = match self.features {
            Some(_) => Some(schema.require("gene")?),
            None => None,
        };

        let mut writer: Option<TsvWriter> = None;
        let mut chunk: Vec<csv::StringRecord> = Vec::with_capacity(self.chunk_size);
        let mut nwritten = 0;
        let mut record = csv::StringRecord::new();
        let mut eof = false;

        while !eof {
            chunk.clear();
            while chunk.len() < self.chunk_size {
                if !rdr.read_record(&mut record)? {
                    eof = true;
                    break;
                }

                if let (Some(features), Some(gene_col)) = (self.features, gene_col) {
                    if !record.get(gene_col).is_some_and(|g| features.contains(g)) {
                        continue;
                    }
                }

                let x: f64 = parse_field(&record, x_col, "X")?;
                let y: f64 = parse_field(&record, y_col, "Y")?;
                if self.boundary.contains(x / self.mu_scale, y / self.mu_scale) {
                    chunk.push(record.clone());
                }
            }

            if chunk.is_empty() {
                continue;
            }

            if writer.is_none() {
                let mut w = TsvWriter::create(output)?;
                w.write_record(schema.header())?;
                writer = Some(w);
            }
            if let Some(w) = writer.as_mut() {
                for row in &chunk {
                    w.write_record(row)?;
                }
            }
            nwritten += chunk.len();
            info!("Output {} rows ...", chunk.len());
        }

        if let Some(w) = writer {
            w.finish()?;
        }

        Ok(nwritten)
    }
}
