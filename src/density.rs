use crate::errors::ConfigError;

use log::{info, warn};
use rand::Rng;

const LN_SQRT_TWO_PI: f64 = 0.918_938_533_204_672_8;

// EM settings, matching the usual defaults for a small 1-D mixture.
const MAX_ITER: usize = 100;
const TOL: f64 = 1e-3;
const REG_COVAR: f64 = 1e-6;

fn normal_logpdf(μ: f64, σ2: f64, x: f64) -> f64 {
    -LN_SQRT_TWO_PI - 0.5 * σ2.ln() - (x - μ).powi(2) / (2.0 * σ2)
}

fn logsumexp2(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Linear interpolated quantile of already sorted values.
fn sorted_quantile(sorted: &[f64], p: f64) -> f64 {
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    sorted_quantile(&sorted, 0.5)
}

// Two component univariate gaussian mixture fit by EM.
#[derive(Clone, Debug)]
pub struct GaussianMixture1D {
    pub weights: [f64; 2],
    pub means: [f64; 2],
    pub variances: [f64; 2],
}

impl GaussianMixture1D {
    pub fn fit(values: &[f64]) -> Result<GaussianMixture1D, ConfigError> {
        if values.len() < 2 {
            return Err(ConfigError::TooFewCells(values.len()));
        }

        let n = values.len() as f64;
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));

        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n + REG_COVAR;

        let mut gmm = GaussianMixture1D {
            weights: [0.5, 0.5],
            means: [sorted_quantile(&sorted, 0.25), sorted_quantile(&sorted, 0.75)],
            variances: [var, var],
        };

        let mut resp = vec![0.0; values.len()];
        let mut prev_ll = f64::NEG_INFINITY;
        for _ in 0..MAX_ITER {
            // E-step: responsibility of the first component
            let mut ll = 0.0;
            for (r, &x) in resp.iter_mut().zip(values) {
                let lp0 = gmm.weights[0].ln() + normal_logpdf(gmm.means[0], gmm.variances[0], x);
                let lp1 = gmm.weights[1].ln() + normal_logpdf(gmm.means[1], gmm.variances[1], x);
                let lse = logsumexp2(lp0, lp1);
                *r = (lp0 - lse).exp();
                ll += lse;
            }
            ll /= n;

            // M-step
            let nk0 = resp.iter().sum::<f64>() + 10.0 * f64::EPSILON;
            let nk1 = resp.iter().map(|r| 1.0 - r).sum::<f64>() + 10.0 * f64::EPSILON;
            let μ0 = resp.iter().zip(values).map(|(r, x)| r * x).sum::<f64>() / nk0;
            let μ1 = resp.iter().zip(values).map(|(r, x)| (1.0 - r) * x).sum::<f64>() / nk1;
            let σ2_0 = resp
                .iter()
                .zip(values)
                .map(|(r, x)| r * (x - μ0).powi(2))
                .sum::<f64>()
                / nk0
                + REG_COVAR;
            let σ2_1 = resp
                .iter()
                .zip(values)
                .map(|(r, x)| (1.0 - r) * (x - μ1).powi(2))
                .sum::<f64>()
                / nk1
                + REG_COVAR;

            gmm.weights = [nk0 / (nk0 + nk1), nk1 / (nk0 + nk1)];
            gmm.means = [μ0, μ1];
            gmm.variances = [σ2_0, σ2_1];

            if (ll - prev_ll).abs() < TOL {
                break;
            }
            prev_ll = ll;
        }

        Ok(gmm)
    }

    pub fn predict(&self, x: f64) -> usize {
        let lp0 = self.weights[0].ln() + normal_logpdf(self.means[0], self.variances[0], x);
        let lp1 = self.weights[1].ln() + normal_logpdf(self.means[1], self.variances[1], x);
        if lp1 > lp0 {
            1
        } else {
            0
        }
    }

    pub fn upper_component(&self) -> usize {
        if self.means[1] > self.means[0] {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityThresholds {
    pub strict: f64,
    pub lenient: f64,
}

#[derive(Clone, Debug)]
pub struct DensityClassifierConfig {
    // fit on a random subset of at most this many cells
    pub max_npts_to_fit_model: usize,
    // lower bound for the strict (dense tissue) threshold
    pub min_density_dense: f64,
    pub hard_threshold: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct DensityClassification {
    pub tissue: Vec<bool>,
    pub tissue_mean: f64,
    pub background_mean: f64,
    pub tissue_min: f64,
    pub tissue_median: f64,
    pub thresholds: DensityThresholds,
}

/// Split cell densities (molecules per square micron) into tissue and
/// background with a two component mixture on log10 density, and derive the
/// strict and lenient thresholds from the tissue cluster.
pub fn classify_density<R: Rng>(
    densities: &[f64],
    config: &DensityClassifierConfig,
    rng: &mut R,
) -> anyhow::Result<DensityClassification> {
    let logd: Vec<f64> = densities.iter().map(|d| d.log10()).collect();

    let gmm = if logd.len() > config.max_npts_to_fit_model {
        let subset: Vec<f64> = rand::seq::index::sample(rng, logd.len(), config.max_npts_to_fit_model)
            .into_iter()
            .map(|i| logd[i])
            .collect();
        GaussianMixture1D::fit(&subset)?
    } else {
        GaussianMixture1D::fit(&logd)?
    };

    let upper = gmm.upper_component();
    let tissue: Vec<bool> = logd.iter().map(|&x| gmm.predict(x) == upper).collect();
    let tissue_densities: Vec<f64> = densities
        .iter()
        .zip(&tissue)
        .filter_map(|(&d, &t)| if t { Some(d) } else { None })
        .collect();

    if tissue_densities.is_empty() {
        return Err(ConfigError::TooFewCells(0).into());
    }

    let tissue_min = tissue_densities.iter().cloned().fold(f64::INFINITY, f64::min);
    let tissue_median = median(&tissue_densities);
    let tissue_mean = 10_f64.powf(gmm.means[upper]);
    let background_mean = 10_f64.powf(gmm.means[1 - upper]);

    let lenient = lenient_threshold(tissue_min, tissue_median);
    let strict = match config.hard_threshold {
        Some(hard_threshold) => hard_threshold,
        None => {
            if tissue_median < config.min_density_dense {
                warn!(
                    "Identified density cutoff is lower than --min-abs-mol-density-squm-dense, will use {} instead",
                    config.min_density_dense
                );
                config.min_density_dense
            } else {
                tissue_median
            }
        }
    };

    info!(
        "Strict density cutoff {:.3}, lenient density cutoff {:.3}",
        strict, lenient
    );

    Ok(DensityClassification {
        tissue,
        tissue_mean,
        background_mean,
        tissue_min,
        tissue_median,
        thresholds: DensityThresholds { strict, lenient },
    })
}

pub fn lenient_threshold(tissue_min: f64, tissue_median: f64) -> f64 {
    0.75 * tissue_min + 0.25 * tissue_median
}
