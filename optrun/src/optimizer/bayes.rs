use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::experiment::Parameter;
use crate::trial::Configuration;

use super::Optimizer;

const CANDIDATES_PER_STEP: usize = 256;
const LENGTH_SCALE: f64 = 0.2;
const KAPPA: f64 = 2.0;

/// Sequential model-based search.
///
/// The first `n_init` configurations are sampled uniformly. Each of the
/// following `n_iter` configurations is the random candidate minimising a
/// kernel-regression estimate of the score minus an exploration bonus that
/// grows with the distance to already observed points. Exactly
/// `n_init + n_iter` configurations are suggested.
pub struct BayesianSearch {
    parameters: Vec<Parameter>,
    n_init: u32,
    n_iter: u32,
    suggested: u32,
    observations: Vec<(Vec<f64>, f64)>,
    rng: StdRng,
}

impl std::fmt::Debug for BayesianSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BayesianSearch")
            .field("parameters", &self.parameters.len())
            .field("n_init", &self.n_init)
            .field("n_iter", &self.n_iter)
            .field("suggested", &self.suggested)
            .field("observations", &self.observations.len())
            .finish()
    }
}

impl BayesianSearch {
    pub fn new(parameters: Vec<Parameter>, n_init: u32, n_iter: u32) -> Self {
        Self::with_rng(parameters, n_init, n_iter, StdRng::from_entropy())
    }

    pub fn with_seed(parameters: Vec<Parameter>, n_init: u32, n_iter: u32, seed: u64) -> Self {
        Self::with_rng(parameters, n_init, n_iter, StdRng::seed_from_u64(seed))
    }

    fn with_rng(parameters: Vec<Parameter>, n_init: u32, n_iter: u32, rng: StdRng) -> Self {
        Self {
            parameters,
            n_init,
            n_iter,
            suggested: 0,
            observations: Vec::new(),
            rng,
        }
    }

    fn random_unit_point(&mut self) -> Vec<f64> {
        (0..self.parameters.len())
            .map(|_| self.rng.gen::<f64>())
            .collect()
    }

    fn to_configuration(&self, unit: &[f64]) -> Configuration {
        self.parameters
            .iter()
            .zip(unit)
            .map(|(param, u)| {
                let value = if param.is_fixed() {
                    param.minimum
                } else {
                    (param.minimum + (param.maximum - param.minimum) * u).min(param.maximum)
                };
                (param.name.clone(), value)
            })
            .collect()
    }

    fn to_unit(&self, configuration: &Configuration) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|param| {
                let value = configuration.get(&param.name).unwrap_or(param.minimum);
                if param.is_fixed() {
                    0.0
                } else {
                    (value - param.minimum) / (param.maximum - param.minimum)
                }
            })
            .collect()
    }

    fn acquisition(&self, point: &[f64], mean_score: f64, spread: f64) -> f64 {
        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        let mut nearest = f64::INFINITY;
        for (observed, score) in &self.observations {
            let d2: f64 = observed
                .iter()
                .zip(point)
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            nearest = nearest.min(d2.sqrt());
            let w = (-d2 / (2.0 * LENGTH_SCALE * LENGTH_SCALE)).exp();
            weight_sum += w;
            weighted += w * score;
        }
        let estimate = if weight_sum > 1e-12 {
            weighted / weight_sum
        } else {
            mean_score
        };
        estimate - KAPPA * spread * nearest
    }

    fn propose(&mut self) -> Vec<f64> {
        if self.observations.is_empty() {
            return self.random_unit_point();
        }
        let n = self.observations.len() as f64;
        let mean = self.observations.iter().map(|(_, s)| s).sum::<f64>() / n;
        let variance = self
            .observations
            .iter()
            .map(|(_, s)| (s - mean).powi(2))
            .sum::<f64>()
            / n;
        let spread = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        let mut best: Option<(f64, Vec<f64>)> = None;
        for _ in 0..CANDIDATES_PER_STEP {
            let candidate = self.random_unit_point();
            let value = self.acquisition(&candidate, mean, spread);
            if best.as_ref().map_or(true, |(b, _)| value < *b) {
                best = Some((value, candidate));
            }
        }
        best.map(|(_, point)| point)
            .unwrap_or_else(|| self.random_unit_point())
    }
}

impl Optimizer for BayesianSearch {
    fn name(&self) -> &'static str {
        "bayesopt"
    }

    fn suggest(&mut self) -> Option<Configuration> {
        if self.suggested >= self.n_init.saturating_add(self.n_iter) {
            return None;
        }
        let unit = if self.suggested < self.n_init {
            self.random_unit_point()
        } else {
            self.propose()
        };
        self.suggested += 1;
        Some(self.to_configuration(&unit))
    }

    fn observe(&mut self, configuration: &Configuration, score: f64) {
        if score.is_finite() {
            let unit = self.to_unit(configuration);
            self.observations.push((unit, score));
        }
    }
}
