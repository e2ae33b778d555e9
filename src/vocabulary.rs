use crate::errors::ConfigError;
use crate::tsv::{open_tsv_reader, parse_field, Schema};

use log::info;
use std::collections::HashMap;

/// Ordered set of features used as the columns of every count matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVocabulary {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl FeatureVocabulary {
    // Duplicates after the first occurrence are ignored.
    pub fn from_names<I, S>(names: I) -> FeatureVocabulary
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = FeatureVocabulary {
            names: Vec::new(),
            index: HashMap::new(),
        };
        for name in names {
            let name = name.into();
            if !vocab.index.contains_key(&name) {
                vocab.index.insert(name.clone(), vocab.names.len() as u32);
                vocab.names.push(name);
            }
        }
        vocab
    }

    /// Read a per-feature count table, keep features with at least `min_count`
    /// in the `count_key` column and order them by decreasing count.
    pub fn from_feature_file(
        path: &str,
        feature_key: &str,
        count_key: &str,
        min_count: f64,
    ) -> anyhow::Result<FeatureVocabulary> {
        let mut rdr = open_tsv_reader(path)?;
        let schema = Schema::from_reader(&mut rdr, path)?;
        let feature_col = schema.require(feature_key)?;
        let count_col = schema.require(count_key)?;

        let mut features: Vec<(String, f64)> = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let count: f64 = parse_field(&record, count_col, count_key)?;
            if count < min_count {
                continue;
            }
            let name = record
                .get(feature_col)
                .ok_or_else(|| anyhow::anyhow!("Row is missing column '{}': {:?}", feature_key, record))?;
            features.push((name.to_string(), count));
        }

        // stable, so ties keep file order
        features.sort_by(|a, b| b.1.total_cmp(&a.1));
        let vocab = FeatureVocabulary::from_names(features.into_iter().map(|(name, _)| name));

        if vocab.is_empty() {
            return Err(ConfigError::EmptyVocabulary(format!(
                "no feature in '{}' has at least {} counts",
                path, min_count
            ))
            .into());
        }

        info!("Read {} features from {}", vocab.len(), path);
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
