use crate::lda::TopicModel;
use crate::tsv::{warn_if_exists, TsvWriter};
use crate::unitloader::{UnitLoader, UnitLoaderConfig};
use crate::vocabulary::FeatureVocabulary;

use itertools::izip;
use log::{debug, info};
use ndarray::Array2;

#[derive(Clone, Debug)]
pub struct ReportConfig {
    pub input: String,
    // output prefix
    pub output: String,
    pub loader: UnitLoaderConfig,
    // stop once the first batch id group is reported
    pub report_first_group: bool,
}

impl ReportConfig {
    pub fn fit_result_path(&self) -> String {
        format!("{}.fit_result.tsv.gz", self.output)
    }

    pub fn posterior_count_path(&self) -> String {
        format!("{}.posterior.count.tsv.gz", self.output)
    }
}

pub struct PosteriorSummary {
    pub nunits: usize,
    // [topics, features] expected counts
    pub posterior: Array2<f64>,
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (k, &x)| if x > max { (k, x) } else { (best, max) })
        .0
}

/// Apply a model to every unit of the input and write per unit topic
/// proportions and the topic by feature posterior counts.
pub fn report_posterior(model: &TopicModel, config: &ReportConfig) -> anyhow::Result<PosteriorSummary> {
    let vocab = FeatureVocabulary::from_names(model.vocabulary.iter().cloned());
    let mut loader = UnitLoader::open(&config.input, &vocab, &config.loader)?;
    if config.report_first_group {
        loader = loader.with_group_limit(1);
    }
    let ntopics = model.ntopics();

    let fit_result_path = config.fit_result_path();
    warn_if_exists(&fit_result_path);
    let mut writer: Option<TsvWriter> = None;
    let mut posterior = Array2::<f64>::zeros((ntopics, vocab.len()));
    let mut nunits = 0;

    while let Some(batch) = loader.next_batch()? {
        let θ = model.transform(&batch.counts);
        let counts = batch.heldout.as_ref().unwrap_or(&batch.counts);
        posterior += &counts.weighted_column_sums(θ.view());

        if writer.is_none() {
            let mut w = TsvWriter::create(&fit_result_path)?;
            let mut header = vec!["unit".to_string(), config.loader.count_key.clone()];
            header.extend(config.loader.unit_attrs.iter().cloned());
            header.extend(["topK".to_string(), "topP".to_string()]);
            header.extend((0..ntopics).map(|k| k.to_string()));
            w.write_record(&header)?;
            writer = Some(w);
        }

        if let Some(w) = writer.as_mut() {
            let totals = batch.totals();
            for (unit, total, attrs, θ_i) in izip!(&batch.unit_ids, &totals, &batch.attrs, θ.rows()) {
                let θ_i = θ_i.to_vec();
                let top = argmax(&θ_i);
                let mut row = vec![unit.clone(), format!("{}", total)];
                row.extend(attrs.iter().cloned());
                row.push(top.to_string());
                row.push(format!("{:.4e}", θ_i[top]));
                row.extend(θ_i.iter().map(|x| format!("{:.4e}", x)));
                w.write_record(&row)?;
            }
        }

        nunits += batch.len();
        debug!("Reported {} units ({} in total)", batch.len(), nunits);
    }

    if let Some(w) = writer {
        w.finish()?;
    }

    let posterior_path = config.posterior_count_path();
    warn_if_exists(&posterior_path);
    let mut w = TsvWriter::create(&posterior_path)?;
    let mut header = vec![config.loader.feature_key.clone()];
    header.extend((0..ntopics).map(|k| k.to_string()));
    w.write_record(&header)?;
    for (name, column) in vocab.names().iter().zip(posterior.columns()) {
        let mut row = vec![name.clone()];
        row.extend(column.iter().map(|x| format!("{:.2}", x)));
        w.write_record(&row)?;
    }
    w.finish()?;

    info!("Wrote {} and {}", fit_result_path, posterior_path);
    Ok(PosteriorSummary { nunits, posterior })
}
