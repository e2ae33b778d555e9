use crate::errors::ConfigError;
use crate::lda::modelio::{read_model, read_prior, write_model_json, write_model_matrix};
use crate::lda::{OnlineLda, OnlineSchedule, PriorSeededLda, TopicModel, TopicUpdater};
use crate::posterior::{report_posterior, PosteriorSummary, ReportConfig};
use crate::tsv::{check_input_file, check_output_dir, warn_if_exists};
use crate::unitloader::{UnitLoader, UnitLoaderConfig};
use crate::vocabulary::FeatureVocabulary;

use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

#[derive(Args, Debug, Clone)]
pub struct LdaArgs {
    #[arg(long, help = "Tab-delimited (unit, feature, count) file, sorted by unit id prefix")]
    input: String,

    #[arg(long, help = "Output prefix")]
    output: String,

    #[arg(long, default_value = "random_index")]
    unit_label: String,

    #[arg(long, num_args = 1.., help = "Unit level columns copied to the per unit output")]
    unit_attr: Vec<String>,

    #[arg(long, help = "Feature table with per feature total counts, defines the vocabulary")]
    feature: Option<String>,

    #[arg(long, default_value = "gene")]
    feature_label: String,

    #[arg(long, default_value = "Count", help = "Count column to report")]
    key: String,

    #[arg(long, help = "Count column to train on (default: --key)")]
    train_on: Option<String>,

    #[arg(long, default_value_t = 10)]
    n_factor: usize,

    #[arg(long, default_value_t = 512)]
    minibatch_size: usize,

    #[arg(long, default_value_t = 1.0)]
    min_ct_per_feature: f64,

    #[arg(long, default_value_t = 20.0)]
    min_ct_per_unit: f64,

    #[arg(long, default_value_t = 1)]
    thread: usize,

    #[arg(long, default_value_t = 1, help = "Number of passes over the input")]
    epoch: usize,

    #[arg(
        long,
        default_value_t = -1,
        allow_hyphen_values = true,
        help = "Units sharing this many leading characters form one group (<= 0: one group)"
    )]
    epoch_id_length: i64,

    #[arg(long, help = "Stop training after this many unit groups, counted across passes")]
    max_batch_groups: Option<usize>,

    #[arg(long, help = "Existing model (.json or feature by topic .tsv/.tsv.gz) to use instead of training")]
    use_model: Option<String>,

    #[arg(long, help = "Feature by factor table of pseudo-counts to seed the topics")]
    prior: Option<String>,

    #[arg(long, default_value_t = 9.0)]
    tau: f64,

    #[arg(long, default_value_t = 0.7)]
    kappa: f64,

    #[arg(long = "N", default_value_t = 1e4, help = "Assumed total number of units")]
    total_samples: f64,

    #[arg(long, help = "Stop reporting after the first unit group")]
    report_first_group: bool,

    #[arg(long, help = "Retrain even if a model with the output prefix exists")]
    overwrite: bool,

    #[arg(long, help = "Log per minibatch likelihood instead of a progress bar")]
    verbose: bool,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct TransformArgs {
    #[arg(long)]
    input: String,

    #[arg(long, help = "Output prefix")]
    output: String,

    #[arg(long, help = "Model (.json or feature by topic .tsv/.tsv.gz)")]
    model: String,

    #[arg(long, default_value = "random_index")]
    unit_label: String,

    #[arg(long, num_args = 1..)]
    unit_attr: Vec<String>,

    #[arg(long, default_value = "gene")]
    feature_label: String,

    #[arg(long, default_value = "Count")]
    key: String,

    #[arg(long, help = "Count column to accumulate posterior counts from (default: --key)")]
    train_on: Option<String>,

    #[arg(long, default_value_t = 512)]
    minibatch_size: usize,

    #[arg(long, default_value_t = 20.0)]
    min_ct_per_unit: f64,

    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    epoch_id_length: i64,

    #[arg(long)]
    report_first_group: bool,

    #[arg(long, default_value_t = 1)]
    thread: usize,
}

#[derive(Clone, Debug)]
pub struct LdaConfig {
    pub input: String,
    pub output: String,
    pub feature: Option<String>,
    pub feature_key: String,
    pub count_key: String,
    pub use_model: Option<String>,
    pub prior: Option<String>,
    pub ntopics: usize,
    pub min_ct_per_feature: f64,
    pub schedule: OnlineSchedule,
    // units are read with the training counts
    pub train_loader: UnitLoaderConfig,
    pub epochs: usize,
    pub max_batch_groups: Option<usize>,
    pub report: ReportConfig,
    pub threads: usize,
    pub overwrite: bool,
    pub verbose: bool,
    pub seed: Option<u64>,
}

fn batch_id_prefix(epoch_id_length: i64) -> usize {
    epoch_id_length.max(0) as usize
}

fn positive(arg: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidArgument {
            arg,
            reason: "must be at least 1".to_string(),
        })
    } else {
        Ok(())
    }
}

// The reporting pass reads the `key` counts and carries `train_on` along when
// it names another column.
fn report_config(
    input: &str,
    output: &str,
    loader: &UnitLoaderConfig,
    key: &str,
    train_on: &str,
    report_first_group: bool,
) -> ReportConfig {
    ReportConfig {
        input: input.to_string(),
        output: output.to_string(),
        loader: UnitLoaderConfig {
            count_key: key.to_string(),
            heldout_key: if train_on.eq_ignore_ascii_case(key) {
                None
            } else {
                Some(train_on.to_string())
            },
            ..loader.clone()
        },
        report_first_group,
    }
}

impl LdaConfig {
    pub fn from_args(args: &LdaArgs) -> Result<LdaConfig, ConfigError> {
        check_input_file(&args.input)?;
        check_output_dir(&args.output)?;
        positive("n-factor", args.n_factor)?;
        positive("minibatch-size", args.minibatch_size)?;
        positive("epoch", args.epoch)?;
        positive("thread", args.thread)?;
        if let Some(max) = args.max_batch_groups {
            positive("max-batch-groups", max)?;
        }
        if let Some(prior) = &args.prior {
            check_input_file(prior)?;
        }

        let train_on = args.train_on.clone().unwrap_or_else(|| args.key.clone());
        let train_loader = UnitLoaderConfig {
            unit_key: args.unit_label.clone(),
            feature_key: args.feature_label.clone(),
            count_key: train_on.clone(),
            heldout_key: None,
            unit_attrs: args.unit_attr.clone(),
            batch_id_prefix: batch_id_prefix(args.epoch_id_length),
            min_ct_per_unit: args.min_ct_per_unit,
            minibatch_size: args.minibatch_size,
        };
        let report = report_config(
            &args.input,
            &args.output,
            &train_loader,
            &args.key,
            &train_on,
            args.report_first_group,
        );

        Ok(LdaConfig {
            input: args.input.clone(),
            output: args.output.clone(),
            feature: args.feature.clone(),
            feature_key: args.feature_label.clone(),
            count_key: args.key.clone(),
            use_model: args.use_model.clone(),
            prior: args.prior.clone(),
            ntopics: args.n_factor,
            min_ct_per_feature: args.min_ct_per_feature,
            schedule: OnlineSchedule {
                tau: args.tau,
                kappa: args.kappa,
                total_samples: args.total_samples,
                minibatch_size: args.minibatch_size,
            },
            train_loader: UnitLoaderConfig {
                unit_attrs: Vec::new(),
                ..train_loader
            },
            epochs: args.epoch,
            max_batch_groups: args.max_batch_groups,
            report,
            threads: args.thread,
            overwrite: args.overwrite,
            verbose: args.verbose,
            seed: args.seed,
        })
    }

    pub fn model_json_path(&self) -> String {
        format!("{}.model.json", self.output)
    }

    pub fn model_matrix_path(&self) -> String {
        format!("{}.model_matrix.tsv.gz", self.output)
    }
}

// A model named by --use-model, or one left by a previous run with the same
// output prefix unless --overwrite is set.
fn existing_model_path(config: &LdaConfig) -> Result<Option<String>, ConfigError> {
    if let Some(path) = &config.use_model {
        if !Path::new(path).is_file() {
            return Err(ConfigError::MissingModel(path.clone()));
        }
        return Ok(Some(path.clone()));
    }
    if config.overwrite {
        return Ok(None);
    }
    for path in [config.model_json_path(), config.model_matrix_path()] {
        if Path::new(&path).is_file() {
            warn!("Using existing model {}, set --overwrite to retrain", path);
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn read_vocabulary(config: &LdaConfig) -> anyhow::Result<FeatureVocabulary> {
    match &config.feature {
        Some(path) if Path::new(path).is_file() => FeatureVocabulary::from_feature_file(
            path,
            &config.feature_key,
            &config.count_key,
            config.min_ct_per_feature,
        ),
        Some(path) => Err(ConfigError::EmptyVocabulary(format!("feature file '{}' not found", path)).into()),
        None => Err(ConfigError::EmptyVocabulary("--feature is required to train a new model".to_string()).into()),
    }
}

/// Stream the input through the model for the configured number of passes,
/// or until `max_batch_groups` unit groups have been used.
pub fn train_model(config: &LdaConfig, vocab: &FeatureVocabulary) -> anyhow::Result<TopicModel> {
    let vocabulary = vocab.names().to_vec();
    let mut updater: Box<dyn TopicUpdater> = match &config.prior {
        Some(path) => {
            let prior = read_prior(path, vocab, config.ntopics)?;
            Box::new(PriorSeededLda::new(vocabulary, prior, config.schedule))
        }
        None => {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            Box::new(OnlineLda::new(vocabulary, config.ntopics, config.schedule, &mut rng)?)
        }
    };

    let pb = ProgressBar::new(config.epochs as u64);
    if config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut ngroups = 0;
    let mut nbatches = 0;
    let mut nunits = 0;
    for epoch in 0..config.epochs {
        let mut loader = UnitLoader::open(&config.input, vocab, &config.train_loader)?;
        if let Some(max_groups) = config.max_batch_groups {
            loader = loader.with_group_limit(max_groups - ngroups);
        }
        while let Some(batch) = loader.next_batch()? {
            let ll = updater.update(&batch.counts);
            nbatches += 1;
            nunits += batch.len();
            if config.verbose {
                info!(
                    "Epoch {}, minibatch {} of group '{}' ({} units): per-token log likelihood {:.4}",
                    epoch,
                    nbatches,
                    batch.batch_id,
                    batch.len(),
                    ll
                );
            }
        }
        ngroups += loader.ngroups();
        pb.inc(1);
        if loader.reached_group_limit() {
            info!("Stopping after {} unit groups", ngroups);
            break;
        }
    }
    pb.finish_and_clear();

    info!(
        "Trained on {} minibatches ({} units, {} unit groups), {} updates",
        nbatches,
        nunits,
        ngroups,
        updater.model().n_updates
    );

    let mut model = updater.finish();
    let mode = if config.prior.is_some() { "prior" } else { "online" };
    for (key, value) in [
        ("mode", mode.to_string()),
        ("n_factor", config.ntopics.to_string()),
        ("tau", config.schedule.tau.to_string()),
        ("kappa", config.schedule.kappa.to_string()),
        ("total_samples", config.schedule.total_samples.to_string()),
        ("train_on", config.train_loader.count_key.clone()),
        ("input", config.input.clone()),
    ] {
        model.metadata.insert(key.to_string(), value);
    }
    Ok(model)
}

fn log_summary(summary: &PosteriorSummary) {
    info!(
        "Reported {} units carrying {:.1} posterior counts",
        summary.nunits,
        summary.posterior.sum()
    );
}

fn lda(config: &LdaConfig) -> anyhow::Result<TopicModel> {
    let model = match existing_model_path(config)? {
        Some(path) => read_model(&path)?,
        None => {
            let vocab = read_vocabulary(config)?;
            let model = train_model(config, &vocab)?;

            let json_path = config.model_json_path();
            let matrix_path = config.model_matrix_path();
            warn_if_exists(&json_path);
            warn_if_exists(&matrix_path);
            write_model_json(&json_path, &model)?;
            write_model_matrix(&matrix_path, &model, &config.feature_key)?;
            info!("Wrote model to {} and {}", json_path, matrix_path);
            model
        }
    };

    let summary = report_posterior(&model, &config.report)?;
    log_summary(&summary);
    Ok(model)
}

pub fn run_lda(args: &LdaArgs) -> anyhow::Result<()> {
    let config = LdaConfig::from_args(args)?;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(config.threads).build()?;
    pool.install(|| lda(&config))?;
    Ok(())
}

pub fn run_transform(args: &TransformArgs) -> anyhow::Result<()> {
    check_input_file(&args.input)?;
    check_output_dir(&args.output)?;
    positive("minibatch-size", args.minibatch_size)?;
    positive("thread", args.thread)?;

    let train_on = args.train_on.clone().unwrap_or_else(|| args.key.clone());
    let loader = UnitLoaderConfig {
        unit_key: args.unit_label.clone(),
        feature_key: args.feature_label.clone(),
        count_key: args.key.clone(),
        heldout_key: None,
        unit_attrs: args.unit_attr.clone(),
        batch_id_prefix: batch_id_prefix(args.epoch_id_length),
        min_ct_per_unit: args.min_ct_per_unit,
        minibatch_size: args.minibatch_size,
    };
    let report = report_config(
        &args.input,
        &args.output,
        &loader,
        &args.key,
        &train_on,
        args.report_first_group,
    );

    let model = read_model(&args.model)?;
    let pool = rayon::ThreadPoolBuilder::new().num_threads(args.thread).build()?;
    let summary = pool.install(|| report_posterior(&model, &report))?;
    log_summary(&summary);
    Ok(())
}
