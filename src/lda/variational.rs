use crate::countmat::CountMatrix;

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use special::Gamma;

// Added to the per-token normalizer so empty topic mass never divides by zero.
const EPS: f64 = 1e-100;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariationalParams {
    // dirichlet prior on per-unit topic proportions
    pub alpha: f64,
    // dirichlet prior on per-topic feature distributions
    pub eta: f64,
    pub max_doc_update_iter: usize,
    pub mean_change_tol: f64,
}

impl VariationalParams {
    pub fn new(ntopics: usize) -> VariationalParams {
        let prior = 1.0 / ntopics as f64;
        VariationalParams {
            alpha: prior,
            eta: prior,
            max_doc_update_iter: 100,
            mean_change_tol: 1e-3,
        }
    }
}

/// E[log x] for x ~ Dirichlet(α).
pub fn dirichlet_expectation(params: ArrayView1<f64>) -> Array1<f64> {
    let ψ_sum = params.sum().digamma();
    params.mapv(|x| x.digamma() - ψ_sum)
}

/// Row-wise E[log x] for a matrix of dirichlet parameters.
pub fn dirichlet_expectation_rows(λ: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(λ.raw_dim());
    Zip::from(out.rows_mut()).and(λ.rows()).for_each(|mut o, l| {
        o.assign(&dirichlet_expectation(l));
    });
    out
}

pub fn exp_dirichlet_expectation_rows(λ: &Array2<f64>) -> Array2<f64> {
    dirichlet_expectation_rows(λ).mapv_into(f64::exp)
}

pub struct EStep {
    // [units, topics] variational dirichlet parameters
    pub gamma: Array2<f64>,
    // [topics, features] expected counts, scaled by exp(E[log beta])
    pub sstats: Array2<f64>,
}

// Coordinate ascent on one unit's topic proportions. Returns gamma_d and
// exp(E[log theta_d]).
fn update_unit(
    ids: &[u32],
    cnts: &[f64],
    exp_elog_beta: &Array2<f64>,
    params: &VariationalParams,
) -> (Array1<f64>, Array1<f64>) {
    let k = exp_elog_beta.nrows();
    let mut gamma_d = Array1::<f64>::ones(k);
    let mut exp_elog_theta_d = dirichlet_expectation(gamma_d.view()).mapv_into(f64::exp);
    if ids.is_empty() {
        return (Array1::from_elem(k, params.alpha), exp_elog_theta_d);
    }

    let cols: Vec<usize> = ids.iter().map(|&j| j as usize).collect();
    let beta_d = exp_elog_beta.select(Axis(1), &cols);
    let cnts = ArrayView1::from(cnts);

    for _ in 0..params.max_doc_update_iter {
        let last = gamma_d.clone();
        let norm_phi = exp_elog_theta_d.dot(&beta_d) + EPS;
        gamma_d = &exp_elog_theta_d * &beta_d.dot(&(&cnts / &norm_phi)) + params.alpha;
        exp_elog_theta_d = dirichlet_expectation(gamma_d.view()).mapv_into(f64::exp);

        let mean_change = (&gamma_d - &last).mapv(f64::abs).mean().unwrap_or(0.0);
        if mean_change < params.mean_change_tol {
            break;
        }
    }

    (gamma_d, exp_elog_theta_d)
}

fn update_units(
    counts: &CountMatrix,
    exp_elog_beta: &Array2<f64>,
    params: &VariationalParams,
) -> (Array2<f64>, Vec<Array1<f64>>) {
    assert_eq!(exp_elog_beta.ncols(), counts.ncols());
    let results: Vec<(Array1<f64>, Array1<f64>)> = (0..counts.nrows())
        .into_par_iter()
        .map(|i| {
            let (ids, cnts) = counts.row(i);
            update_unit(ids, cnts, exp_elog_beta, params)
        })
        .collect();

    let mut gamma = Array2::zeros((counts.nrows(), exp_elog_beta.nrows()));
    let mut exp_elog_theta = Vec::with_capacity(results.len());
    for (mut row, (gamma_d, exp_elog_theta_d)) in gamma.rows_mut().into_iter().zip(results) {
        row.assign(&gamma_d);
        exp_elog_theta.push(exp_elog_theta_d);
    }
    (gamma, exp_elog_theta)
}

/// Topic proportion parameters only, parallel over units.
pub fn infer_gamma(counts: &CountMatrix, exp_elog_beta: &Array2<f64>, params: &VariationalParams) -> Array2<f64> {
    update_units(counts, exp_elog_beta, params).0
}

/// Variational E-step with the sufficient statistics for a topic update.
pub fn e_step(counts: &CountMatrix, exp_elog_beta: &Array2<f64>, params: &VariationalParams) -> EStep {
    let (gamma, exp_elog_theta) = update_units(counts, exp_elog_beta, params);

    let mut sstats = Array2::<f64>::zeros(exp_elog_beta.raw_dim());
    for (i, exp_elog_theta_d) in exp_elog_theta.iter().enumerate() {
        let (ids, cnts) = counts.row(i);
        for (&j, &x) in ids.iter().zip(cnts) {
            let norm_phi = exp_elog_theta_d.dot(&exp_elog_beta.column(j as usize)) + EPS;
            sstats
                .column_mut(j as usize)
                .scaled_add(x / norm_phi, exp_elog_theta_d);
        }
    }
    sstats *= exp_elog_beta;

    EStep { gamma, sstats }
}

// Normalize rows to sum to one.
pub fn normalize_rows(mut x: Array2<f64>) -> Array2<f64> {
    for mut row in x.rows_mut() {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        }
    }
    x
}

/// Mean per-token log likelihood of the counts under point estimates of the
/// topic proportions and topic distributions.
pub fn per_token_log_likelihood(counts: &CountMatrix, gamma: &Array2<f64>, λ: &Array2<f64>) -> f64 {
    let θ = normalize_rows(gamma.clone());
    let β = normalize_rows(λ.clone());
    let mut ll = 0.0;
    for i in 0..counts.nrows() {
        let (ids, cnts) = counts.row(i);
        let θ_i = θ.row(i);
        for (&j, &x) in ids.iter().zip(cnts) {
            ll += x * (θ_i.dot(&β.column(j as usize)) + EPS).ln();
        }
    }
    let ntokens = counts.sum();
    if ntokens > 0.0 {
        ll / ntokens
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_dirichlet_expectation_uniform() {
        // E[log x_i] for Dirichlet(1, 1) is ψ(1) - ψ(2) = -1
        let e = dirichlet_expectation(array![1.0, 1.0].view());
        assert_relative_eq!(e[0], -1.0, epsilon = 1e-10);
        assert_relative_eq!(e[1], -1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_e_step_separates_topics() {
        // topic 0 only emits feature 0, topic 1 only feature 1
        let λ = array![[100.0, 0.01], [0.01, 100.0]];
        let exp_elog_beta = exp_dirichlet_expectation_rows(&λ);
        let counts = CountMatrix::from_rows(vec![vec![(0, 20.0)], vec![(1, 20.0)], vec![]], 2);
        let params = VariationalParams::new(2);
        let estep = e_step(&counts, &exp_elog_beta, &params);

        assert!(estep.gamma[[0, 0]] > 19.0 && estep.gamma[[0, 1]] < 1.0);
        assert!(estep.gamma[[1, 1]] > 19.0 && estep.gamma[[1, 0]] < 1.0);
        assert_eq!(estep.gamma.row(2), array![0.5, 0.5]);

        let sstats = estep.sstats;
        assert_relative_eq!(sstats.sum(), 40.0, epsilon = 1e-6);
        assert!(sstats[[0, 0]] > 19.0 && sstats[[1, 1]] > 19.0);
    }

    #[test]
    fn test_per_token_log_likelihood() {
        let counts = CountMatrix::from_rows(vec![vec![(0, 2.0), (1, 2.0)]], 2);
        let gamma = array![[1.0, 1.0]];
        let λ = array![[1.0, 1.0], [1.0, 1.0]];
        assert_relative_eq!(per_token_log_likelihood(&counts, &gamma, &λ), 0.5_f64.ln(), epsilon = 1e-12);
    }
}
