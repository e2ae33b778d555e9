use crate::countmat::CountMatrix;
use crate::density::median;
use crate::tsv::{open_tsv_reader, parse_field, Schema, TsvReader};
use crate::vocabulary::FeatureVocabulary;

use log::{debug, info};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug)]
pub struct UnitLoaderConfig {
    pub unit_key: String,
    pub feature_key: String,
    // counts that form the minibatch matrix and decide `min_ct_per_unit`
    pub count_key: String,
    // a second count column carried along as a parallel matrix
    pub heldout_key: Option<String>,
    pub unit_attrs: Vec<String>,
    // units whose ids share this many leading characters form a group; 0 puts
    // everything in one group
    pub batch_id_prefix: usize,
    pub min_ct_per_unit: f64,
    pub minibatch_size: usize,
}

/// A block of units ready for a model update or a transform.
#[derive(Clone, Debug)]
pub struct Minibatch {
    pub batch_id: String,
    pub unit_ids: Vec<String>,
    pub attrs: Vec<Vec<String>>,
    pub counts: CountMatrix,
    pub heldout: Option<CountMatrix>,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.unit_ids.len()
    }

    // Totals of the count column per unit.
    pub fn totals(&self) -> Vec<f64> {
        self.counts.row_sums()
    }
}

struct Row {
    unit: String,
    feature: u32,
    count: f64,
    heldout: f64,
    attrs: Vec<String>,
}

struct UnitAccumulator {
    id: String,
    attrs: Vec<String>,
    total: f64,
    counts: Vec<(u32, f64)>,
    heldout: Vec<(u32, f64)>,
}

// Units of one batch id group, in the order they were first seen.
#[derive(Default)]
struct Group {
    index: HashMap<String, usize>,
    units: Vec<UnitAccumulator>,
}

impl Group {
    fn add(&mut self, row: Row) {
        let i = match self.index.get(&row.unit) {
            Some(&i) => i,
            None => {
                let i = self.units.len();
                self.index.insert(row.unit.clone(), i);
                self.units.push(UnitAccumulator {
                    id: row.unit,
                    attrs: row.attrs,
                    total: 0.0,
                    counts: Vec::new(),
                    heldout: Vec::new(),
                });
                i
            }
        };
        let unit = &mut self.units[i];
        unit.total += row.count;
        unit.counts.push((row.feature, row.count));
        unit.heldout.push((row.feature, row.heldout));
    }
}

/// Streams a (unit, feature, count) table sorted by batch id and turns each
/// batch id group into minibatches of at most `minibatch_size` units.
pub struct UnitLoader<'a> {
    rdr: TsvReader,
    vocab: &'a FeatureVocabulary,
    config: UnitLoaderConfig,
    unit_col: usize,
    feature_col: usize,
    count_col: usize,
    heldout_col: Option<usize>,
    attr_cols: Vec<usize>,
    record: csv::StringRecord,
    lookahead: Option<Row>,
    pending: VecDeque<Minibatch>,
    exhausted: bool,
    ngroups: usize,
    // no group is started once this many have been read
    group_limit: Option<usize>,
}

impl<'a> UnitLoader<'a> {
    pub fn open(path: &str, vocab: &'a FeatureVocabulary, config: &UnitLoaderConfig) -> anyhow::Result<UnitLoader<'a>> {
        let mut rdr = open_tsv_reader(path)?;
        let schema = Schema::from_reader(&mut rdr, path)?;
        let unit_col = schema.require(&config.unit_key)?;
        let feature_col = schema.require(&config.feature_key)?;
        let count_col = schema.require(&config.count_key)?;
        let heldout_col = match &config.heldout_key {
            Some(key) if !key.eq_ignore_ascii_case(&config.count_key) => Some(schema.require(key)?),
            _ => None,
        };
        let attr_cols = config
            .unit_attrs
            .iter()
            .map(|attr| schema.require(attr))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UnitLoader {
            rdr,
            vocab,
            config: config.clone(),
            unit_col,
            feature_col,
            count_col,
            heldout_col,
            attr_cols,
            record: csv::StringRecord::new(),
            lookahead: None,
            pending: VecDeque::new(),
            exhausted: false,
            ngroups: 0,
            group_limit: None,
        })
    }

    /// Stop after `limit` batch id groups, counting groups that yield no
    /// minibatch because all their units were too small.
    pub fn with_group_limit(mut self, limit: usize) -> UnitLoader<'a> {
        self.group_limit = Some(limit);
        self
    }

    /// Number of batch id groups read so far.
    pub fn ngroups(&self) -> usize {
        self.ngroups
    }

    pub fn reached_group_limit(&self) -> bool {
        self.group_limit.is_some_and(|limit| self.ngroups >= limit)
    }

    pub fn next_batch(&mut self) -> anyhow::Result<Option<Minibatch>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Some(batch));
            }
            if (self.exhausted && self.lookahead.is_none()) || self.reached_group_limit() {
                return Ok(None);
            }
            self.read_group()?;
        }
    }

    fn batch_id(&self, unit: &str) -> String {
        if self.config.batch_id_prefix == 0 {
            String::new()
        } else {
            unit.chars().take(self.config.batch_id_prefix).collect()
        }
    }

    // Next row with a known feature, or None at the end of input.
    fn read_row(&mut self) -> anyhow::Result<Option<Row>> {
        while self.rdr.read_record(&mut self.record)? {
            let record = &self.record;
            let feature = match record.get(self.feature_col).and_then(|f| self.vocab.get(f)) {
                Some(feature) => feature,
                None => continue,
            };
            let unit = record
                .get(self.unit_col)
                .ok_or_else(|| anyhow::anyhow!("Row is missing column '{}': {:?}", self.config.unit_key, record))?
                .to_string();
            let count: f64 = parse_field(record, self.count_col, &self.config.count_key)?;
            let heldout = match self.heldout_col {
                Some(col) => parse_field(record, col, "held-out count")?,
                None => count,
            };
            let attrs = self
                .attr_cols
                .iter()
                .map(|&col| record.get(col).unwrap_or("").to_string())
                .collect();
            return Ok(Some(Row {
                unit,
                feature,
                count,
                heldout,
                attrs,
            }));
        }
        self.exhausted = true;
        Ok(None)
    }

    fn read_group(&mut self) -> anyhow::Result<()> {
        let first = match self.lookahead.take() {
            Some(row) => row,
            None => match self.read_row()? {
                Some(row) => row,
                None => return Ok(()),
            },
        };

        let batch_id = self.batch_id(&first.unit);
        let mut group = Group::default();
        group.add(first);
        while let Some(row) = self.read_row()? {
            if self.batch_id(&row.unit) != batch_id {
                self.lookahead = Some(row);
                break;
            }
            group.add(row);
        }

        self.ngroups += 1;
        debug!("Read group '{}' with {} units", batch_id, group.units.len());
        self.flush(batch_id, group);
        Ok(())
    }

    fn flush(&mut self, batch_id: String, group: Group) {
        let ncols = self.vocab.len();
        let min_ct = self.config.min_ct_per_unit;
        let units: Vec<UnitAccumulator> = group.units.into_iter().filter(|u| u.total >= min_ct).collect();
        if units.is_empty() {
            return;
        }

        let with_heldout = self.heldout_col.is_some();
        let size = self.config.minibatch_size.max(1);
        let mut units = units.into_iter().peekable();
        while units.peek().is_some() {
            let mut batch = Minibatch {
                batch_id: batch_id.clone(),
                unit_ids: Vec::with_capacity(size),
                attrs: Vec::with_capacity(size),
                counts: CountMatrix::new(ncols),
                heldout: if with_heldout { Some(CountMatrix::new(ncols)) } else { None },
            };
            let mut totals = Vec::with_capacity(size);
            for unit in units.by_ref().take(size) {
                totals.push(unit.total);
                batch.unit_ids.push(unit.id);
                batch.attrs.push(unit.attrs);
                batch.counts.push_row(unit.counts);
                if let Some(heldout) = batch.heldout.as_mut() {
                    heldout.push_row(unit.heldout);
                }
            }
            info!(
                "Made DGE {}, median/mean count: {:.1}/{:.1}",
                totals.len(),
                median(&totals),
                totals.iter().sum::<f64>() / totals.len() as f64
            );
            self.pending.push_back(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsv::TsvWriter;
    use std::collections::HashMap;

    fn write_table(path: &str, rows: &[(&str, &str, u32, u32)]) {
        let mut w = TsvWriter::create(path).unwrap();
        w.write_record(["random_index", "gene", "Count", "Count_spliced", "x"]).unwrap();
        for (unit, gene, count, spliced) in rows {
            w.write_record([
                unit.to_string(),
                gene.to_string(),
                count.to_string(),
                spliced.to_string(),
                format!("{}.5", unit.len()),
            ])
            .unwrap();
        }
        w.finish().unwrap();
    }

    fn config(min_ct: f64, minibatch_size: usize, prefix: usize) -> UnitLoaderConfig {
        UnitLoaderConfig {
            unit_key: "random_index".to_string(),
            feature_key: "gene".to_string(),
            count_key: "count".to_string(),
            heldout_key: None,
            unit_attrs: vec![],
            batch_id_prefix: prefix,
            min_ct_per_unit: min_ct,
            minibatch_size,
        }
    }

    fn drain(loader: &mut UnitLoader) -> Vec<Minibatch> {
        let mut batches = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_low_count_unit_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.tsv.gz");
        let path = path.to_str().unwrap();
        write_table(path, &[("u1", "A", 20, 0), ("u2", "A", 15, 0), ("u1", "B", 5, 0)]);

        let vocab = FeatureVocabulary::from_names(["A", "B"]);
        let mut loader = UnitLoader::open(path, &vocab, &config(20.0, 512, 0)).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].unit_ids, vec!["u1"]);
        assert_eq!(batches[0].totals(), vec![25.0]);
        assert_eq!(loader.ngroups(), 1);
    }

    #[test]
    fn test_counts_conserved_across_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.tsv");
        let path = path.to_str().unwrap();

        let mut rows = Vec::new();
        let units = ["aa1", "aa2", "aa3", "ab1", "ab2", "ba1"];
        let genes = ["A", "B", "C", "Z"];
        for (i, unit) in units.iter().enumerate() {
            for (j, gene) in genes.iter().enumerate() {
                rows.push((*unit, *gene, (i + j + 1) as u32, 0));
            }
        }
        // non-adjacent rows of the same unit within a group
        rows.insert(20, ("aa1", "A", 100, 0));
        write_table(path, &rows);

        let vocab = FeatureVocabulary::from_names(["A", "B", "C"]);
        let mut loader = UnitLoader::open(path, &vocab, &config(7.0, 2, 1)).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(loader.ngroups(), 2);

        let mut expected: HashMap<&str, f64> = HashMap::new();
        for (unit, gene, count, _) in &rows {
            if *gene != "Z" {
                *expected.entry(*unit).or_insert(0.0) += *count as f64;
            }
        }
        expected.retain(|_, total| *total >= 7.0);

        let mut observed: HashMap<String, f64> = HashMap::new();
        for batch in &batches {
            assert!(batch.len() <= 2);
            for (unit, total) in batch.unit_ids.iter().zip(batch.totals()) {
                assert!(observed.insert(unit.clone(), total).is_none());
            }
        }
        assert_eq!(observed.len(), expected.len());
        for (unit, total) in expected {
            assert_eq!(observed[unit], total);
        }

        // the first group "a" has 5 units, split 2 + 2 + 1
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
        assert_eq!(batches[0].unit_ids, vec!["aa1", "aa2"]);
        assert_eq!(batches[3].batch_id, "b");
    }

    #[test]
    fn test_group_limit_counts_groups_without_units() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.tsv");
        let path = path.to_str().unwrap();
        write_table(
            path,
            &[("a1", "A", 2, 0), ("b1", "A", 30, 0), ("b2", "A", 30, 0), ("c1", "A", 30, 0)],
        );

        let vocab = FeatureVocabulary::from_names(["A"]);
        let mut loader = UnitLoader::open(path, &vocab, &config(10.0, 10, 1))
            .unwrap()
            .with_group_limit(1);
        assert!(loader.next_batch().unwrap().is_none());
        assert_eq!(loader.ngroups(), 1);
        assert!(loader.reached_group_limit());

        let mut loader = UnitLoader::open(path, &vocab, &config(10.0, 10, 1))
            .unwrap()
            .with_group_limit(2);
        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].unit_ids, vec!["b1", "b2"]);
        assert_eq!(loader.ngroups(), 2);
    }

    #[test]
    fn test_heldout_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.tsv");
        let path = path.to_str().unwrap();
        write_table(path, &[("u1", "A", 3, 1), ("u1", "B", 4, 2), ("u22", "B", 9, 9)]);

        let vocab = FeatureVocabulary::from_names(["A", "B"]);
        let mut cfg = config(1.0, 10, 0);
        cfg.heldout_key = Some("count_spliced".to_string());
        cfg.unit_attrs = vec!["X".to_string()];
        let mut loader = UnitLoader::open(path, &vocab, &cfg).unwrap();
        let batch = loader.next_batch().unwrap().unwrap();
        assert!(loader.next_batch().unwrap().is_none());

        assert_eq!(batch.totals(), vec![7.0, 9.0]);
        assert_eq!(batch.heldout.as_ref().unwrap().row_sums(), vec![3.0, 9.0]);
        assert_eq!(batch.attrs, vec![vec!["2.5".to_string()], vec!["3.5".to_string()]]);
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.tsv");
        let path = path.to_str().unwrap();
        write_table(path, &[("u1", "A", 3, 1)]);

        let vocab = FeatureVocabulary::from_names(["A"]);
        let mut cfg = config(1.0, 10, 0);
        cfg.unit_key = "cell_id".to_string();
        assert!(UnitLoader::open(path, &vocab, &cfg).is_err());
    }
}
