use super::variational::VariationalParams;
use super::TopicModel;
use crate::errors::ConfigError;
use crate::tsv::{open_tsv_reader, parse_field, TsvWriter};
use crate::vocabulary::FeatureVocabulary;

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct ModelFile {
    vocabulary: Vec<String>,
    // one row per topic
    components: Vec<Vec<f64>>,
    n_updates: usize,
    params: VariationalParams,
    metadata: BTreeMap<String, String>,
}

pub fn write_model_json(path: &str, model: &TopicModel) -> anyhow::Result<()> {
    let file = ModelFile {
        vocabulary: model.vocabulary.clone(),
        components: model.components().rows().into_iter().map(|row| row.to_vec()).collect(),
        n_updates: model.n_updates,
        params: model.params,
        metadata: model.metadata.clone(),
    };
    let mut output = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut output, &file)?;
    output.flush()?;
    Ok(())
}

pub fn read_model_json(path: &str) -> anyhow::Result<TopicModel> {
    let file: ModelFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    let ntopics = file.components.len();
    let nfeatures = file.vocabulary.len();
    if ntopics == 0 || file.components.iter().any(|row| row.len() != nfeatures) {
        return Err(ConfigError::MissingModel(path.to_string()).into());
    }

    let lambda = Array2::from_shape_vec((ntopics, nfeatures), file.components.concat())?;
    let mut model = TopicModel::new(file.vocabulary, lambda, file.params);
    model.n_updates = file.n_updates;
    model.metadata = file.metadata;
    Ok(model)
}

/// Feature by topic table, one row per feature.
pub fn write_model_matrix(path: &str, model: &TopicModel, feature_key: &str) -> anyhow::Result<()> {
    let mut writer = TsvWriter::create(path)?;
    let mut header = vec![feature_key.to_string()];
    header.extend((0..model.ntopics()).map(|k| k.to_string()));
    writer.write_record(&header)?;

    for (name, column) in model.vocabulary.iter().zip(model.components().columns()) {
        let mut row = vec![name.clone()];
        row.extend(column.iter().map(|x| format!("{:.4e}", x)));
        writer.write_record(&row)?;
    }
    writer.finish()
}

// Rows of a feature by factor table: (feature, values), plus the factor count.
fn read_feature_table(path: &str) -> anyhow::Result<(usize, Vec<(String, Vec<f64>)>)> {
    let mut rdr = open_tsv_reader(path)?;
    let nfactors = rdr.headers()?.len().saturating_sub(1);
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let name = record.get(0).unwrap_or("").to_string();
        let values = (1..=nfactors)
            .map(|k| parse_field(&record, k, "factor"))
            .collect::<anyhow::Result<Vec<f64>>>()?;
        rows.push((name, values));
    }
    Ok((nfactors, rows))
}

pub fn read_model_matrix(path: &str) -> anyhow::Result<TopicModel> {
    let (ntopics, rows) = read_feature_table(path)?;
    if ntopics == 0 || rows.is_empty() {
        return Err(ConfigError::MissingModel(path.to_string()).into());
    }

    let mut lambda = Array2::zeros((ntopics, rows.len()));
    let mut vocabulary = Vec::with_capacity(rows.len());
    for (j, (name, values)) in rows.into_iter().enumerate() {
        for (k, x) in values.into_iter().enumerate() {
            lambda[[k, j]] = x;
        }
        vocabulary.push(name);
    }
    Ok(TopicModel::new(vocabulary, lambda, VariationalParams::new(ntopics)))
}

/// Load a model saved either as JSON or as a feature by topic table.
pub fn read_model(path: &str) -> anyhow::Result<TopicModel> {
    if !Path::new(path).is_file() {
        return Err(ConfigError::MissingModel(path.to_string()).into());
    }
    let model = if path.ends_with(".json") {
        read_model_json(path)?
    } else if path.ends_with(".tsv") || path.ends_with(".tsv.gz") {
        read_model_matrix(path)?
    } else {
        return Err(ConfigError::MissingModel(path.to_string()).into());
    };
    info!(
        "Read model with {} topics and {} features from {}",
        model.ntopics(),
        model.nfeatures(),
        path
    );
    Ok(model)
}

/// Feature by factor pseudo-counts aligned to a vocabulary, as [factors, features].
/// Features outside the vocabulary are ignored.
pub fn read_prior(path: &str, vocab: &FeatureVocabulary, ntopics: usize) -> anyhow::Result<Array2<f64>> {
    let (nfactors, rows) = read_feature_table(path)?;
    if nfactors != ntopics {
        return Err(ConfigError::PriorFactorMismatch {
            file: path.to_string(),
            found: nfactors,
            expected: ntopics,
        }
        .into());
    }

    let mut prior = Array2::zeros((ntopics, vocab.len()));
    let mut nmatched = 0;
    for (name, values) in rows {
        if let Some(j) = vocab.get(&name) {
            for (k, x) in values.into_iter().enumerate() {
                prior[[k, j as usize]] += x;
            }
            nmatched += 1;
        }
    }
    info!("Read prior for {} of {} features from {}", nmatched, vocab.len(), path);
    Ok(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::countmat::CountMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn model() -> TopicModel {
        let λ = array![[3.2, 0.1, 1.0 / 3.0], [0.05, 7.5, 2.0]];
        let vocabulary = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let mut model = TopicModel::new(vocabulary, λ, VariationalParams::new(2));
        model.n_updates = 12;
        model.metadata.insert("mode".to_string(), "online".to_string());
        model
    }

    #[test]
    fn test_json_round_trip_transform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.model.json");
        let path = path.to_str().unwrap();

        let model = model();
        write_model_json(path, &model).unwrap();
        let reloaded = read_model(path).unwrap();
        assert_eq!(reloaded.vocabulary, model.vocabulary);
        assert_eq!(reloaded.n_updates, 12);
        assert_eq!(reloaded.metadata["mode"], "online");

        let counts = CountMatrix::from_rows(vec![vec![(0, 4.0), (2, 1.0)], vec![(1, 9.0)]], 3);
        let θ = model.transform(&counts);
        let θ2 = reloaded.transform(&counts);
        assert_abs_diff_eq!(θ, θ2, epsilon = 1e-6);
    }

    #[test]
    fn test_model_matrix_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.model_matrix.tsv.gz");
        let path = path.to_str().unwrap();

        let model = model();
        write_model_matrix(path, &model, "gene").unwrap();
        let reloaded = read_model(path).unwrap();
        assert_eq!(reloaded.vocabulary, model.vocabulary);
        assert_abs_diff_eq!(reloaded.components(), model.components(), epsilon = 1e-3);
    }

    #[test]
    fn test_prior_alignment_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prior.tsv");
        let path = path.to_str().unwrap();

        let mut w = TsvWriter::create(path).unwrap();
        w.write_record(["gene", "f0", "f1"]).unwrap();
        w.write_record(["B", "1", "2"]).unwrap();
        w.write_record(["Z", "5", "5"]).unwrap();
        w.finish().unwrap();

        let vocab = FeatureVocabulary::from_names(["A", "B"]);
        let prior = read_prior(path, &vocab, 2).unwrap();
        assert_eq!(prior, array![[0.0, 1.0], [0.0, 2.0]]);

        match read_prior(path, &vocab, 3).map_err(|e| e.downcast::<ConfigError>()) {
            Err(Ok(ConfigError::PriorFactorMismatch { found, expected, .. })) => {
                assert_eq!((found, expected), (2, 3));
            }
            _ => panic!("expected a factor count mismatch"),
        }
    }

    #[test]
    fn test_missing_model() {
        assert!(read_model("no/such/model.json").is_err());
    }
}
