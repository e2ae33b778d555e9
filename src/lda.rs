pub mod modelio;
pub mod variational;

use crate::countmat::CountMatrix;
use variational::{e_step, exp_dirichlet_expectation_rows, infer_gamma, normalize_rows, per_token_log_likelihood, VariationalParams};

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use std::collections::BTreeMap;

/// Topic-feature parameters with their vocabulary.
#[derive(Clone, Debug)]
pub struct TopicModel {
    pub vocabulary: Vec<String>,
    // [topics, features] variational dirichlet parameters
    lambda: Array2<f64>,
    // exp(E[log beta]), kept in step with lambda
    exp_elog_beta: Array2<f64>,
    pub n_updates: usize,
    pub params: VariationalParams,
    pub metadata: BTreeMap<String, String>,
}

impl TopicModel {
    pub fn new(vocabulary: Vec<String>, lambda: Array2<f64>, params: VariationalParams) -> TopicModel {
        assert_eq!(vocabulary.len(), lambda.ncols());
        let exp_elog_beta = exp_dirichlet_expectation_rows(&lambda);
        TopicModel {
            vocabulary,
            lambda,
            exp_elog_beta,
            n_updates: 0,
            params,
            metadata: BTreeMap::new(),
        }
    }

    pub fn ntopics(&self) -> usize {
        self.lambda.nrows()
    }

    pub fn nfeatures(&self) -> usize {
        self.lambda.ncols()
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.lambda
    }

    fn set_components(&mut self, lambda: Array2<f64>) {
        self.exp_elog_beta = exp_dirichlet_expectation_rows(&lambda);
        self.lambda = lambda;
    }

    pub fn topic_weights(&self) -> Array1<f64> {
        self.lambda.sum_axis(Axis(1))
    }

    /// Per unit topic proportions, rows summing to one.
    pub fn transform(&self, counts: &CountMatrix) -> Array2<f64> {
        normalize_rows(infer_gamma(counts, &self.exp_elog_beta, &self.params))
    }

    /// Sort topics by decreasing total weight.
    pub fn reorder_topics(&mut self) {
        let weights = self.topic_weights();
        let mut order: Vec<usize> = (0..self.ntopics()).collect();
        order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
        self.lambda = self.lambda.select(Axis(0), &order);
        self.exp_elog_beta = self.exp_elog_beta.select(Axis(0), &order);
    }

    // One stochastic variational step. Returns the per-token log likelihood
    // of the batch under the parameters before the step.
    fn online_step(&mut self, batch: &CountMatrix, schedule: &OnlineSchedule) -> f64 {
        if batch.nrows() == 0 {
            return 0.0;
        }
        let estep = e_step(batch, &self.exp_elog_beta, &self.params);
        let ll = per_token_log_likelihood(batch, &estep.gamma, &self.lambda);

        let t = (self.n_updates + 1) as f64;
        let weight = (schedule.tau + t).powf(-schedule.kappa).min(1.0);
        let doc_ratio = schedule.total_samples / batch.nrows() as f64;
        let target = estep.sstats * doc_ratio + self.params.eta;
        let lambda = &self.lambda * (1.0 - weight) + target * weight;
        self.set_components(lambda);
        self.n_updates += 1;

        debug!("Update {} with weight {:.4}, per-token log likelihood {:.4}", self.n_updates, weight, ll);
        ll
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OnlineSchedule {
    // learning rate (tau + t)^(-kappa)
    pub tau: f64,
    pub kappa: f64,
    // number of units the data set is assumed to hold
    pub total_samples: f64,
    pub minibatch_size: usize,
}

/// Row ranges splitting `n` rows into blocks of `size`. With
/// `merge_remainder` a final block shorter than `size` is folded into the
/// one before it.
pub fn block_bounds(n: usize, size: usize, merge_remainder: bool) -> Vec<(usize, usize)> {
    let size = size.max(1);
    let mut bounds = Vec::new();
    let mut from = 0;
    while from < n {
        let mut to = (from + size).min(n);
        if merge_remainder && n - to < size {
            to = n;
        }
        bounds.push((from, to));
        from = to;
    }
    bounds
}

pub trait TopicUpdater {
    /// Update the model with one minibatch, returning a per-token log
    /// likelihood estimate.
    fn update(&mut self, batch: &CountMatrix) -> f64;

    fn model(&self) -> &TopicModel;

    fn finish(self: Box<Self>) -> TopicModel;
}

fn update_in_blocks(model: &mut TopicModel, batch: &CountMatrix, schedule: &OnlineSchedule, merge_remainder: bool) -> f64 {
    let mut ll = 0.0;
    let mut ntokens = 0.0;
    for (from, to) in block_bounds(batch.nrows(), schedule.minibatch_size, merge_remainder) {
        let block = batch.slice_rows(from, to);
        let n = block.sum();
        ll += model.online_step(&block, schedule) * n;
        ntokens += n;
    }
    if ntokens > 0.0 {
        ll / ntokens
    } else {
        0.0
    }
}

/// Online LDA from randomly initialised topics.
pub struct OnlineLda {
    model: TopicModel,
    schedule: OnlineSchedule,
}

impl OnlineLda {
    pub fn new<R: Rng>(
        vocabulary: Vec<String>,
        ntopics: usize,
        schedule: OnlineSchedule,
        rng: &mut R,
    ) -> anyhow::Result<OnlineLda> {
        let init = Gamma::<f64>::new(100.0, 1.0 / 100.0)?;
        let lambda = Array2::from_shape_simple_fn((ntopics, vocabulary.len()), || init.sample(rng));
        let model = TopicModel::new(vocabulary, lambda, VariationalParams::new(ntopics));
        Ok(OnlineLda { model, schedule })
    }
}

impl TopicUpdater for OnlineLda {
    fn update(&mut self, batch: &CountMatrix) -> f64 {
        update_in_blocks(&mut self.model, batch, &self.schedule, false)
    }

    fn model(&self) -> &TopicModel {
        &self.model
    }

    fn finish(self: Box<Self>) -> TopicModel {
        let mut model = self.model;
        model.reorder_topics();
        model
    }
}

/// Online LDA seeded with pseudo-counts from known topic profiles. Topic
/// order follows the prior and is kept.
pub struct PriorSeededLda {
    model: TopicModel,
    schedule: OnlineSchedule,
}

impl PriorSeededLda {
    // `prior` is [topics, features] aligned with `vocabulary`.
    pub fn new(vocabulary: Vec<String>, prior: Array2<f64>, schedule: OnlineSchedule) -> PriorSeededLda {
        let ntopics = prior.nrows();
        info!(
            "Prior magnitude per topic: {}",
            prior
                .sum_axis(Axis(1))
                .iter()
                .map(|x| format!("{:.1}", x))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let model = TopicModel::new(vocabulary, prior + 0.5, VariationalParams::new(ntopics));
        PriorSeededLda { model, schedule }
    }
}

impl TopicUpdater for PriorSeededLda {
    fn update(&mut self, batch: &CountMatrix) -> f64 {
        update_in_blocks(&mut self.model, batch, &self.schedule, true)
    }

    fn model(&self) -> &TopicModel {
        &self.model
    }

    fn finish(self: Box<Self>) -> TopicModel {
        self.model
    }
}
