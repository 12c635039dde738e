//! Optimizer selection and the built-in search strategies.
//!
//! Run requests name an optimizer by `type` plus integer settings. Parsing is
//! strict: counts must be positive JSON integers, so `"3"` or `3.5` are
//! rejected instead of being coerced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OrchestratorError;
use crate::experiment::Parameter;
use crate::trial::Configuration;

mod bayes;
mod grid;

pub use bayes::BayesianSearch;
pub use grid::GridSearch;

/// Upper bound on the number of configurations a grid may enumerate.
pub const MAX_GRID_POINTS: u64 = 100_000;

const DEFAULT_N_INIT: u32 = 2;
const DEFAULT_N_ITER: u32 = 2;

/// Serializable optimizer selection carried with a run assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OptimizerSpec {
    #[serde(rename = "bayesopt")]
    Bayesian { n_init: u32, n_iter: u32 },
    #[serde(rename = "grid")]
    Grid { num_configs_per_param: u32 },
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        OptimizerSpec::Bayesian {
            n_init: DEFAULT_N_INIT,
            n_iter: DEFAULT_N_ITER,
        }
    }
}

impl OptimizerSpec {
    /// Parse the `optimizer` block of a run request.
    ///
    /// An absent block or JSON `null` selects the default Bayesian optimizer.
    pub fn from_request(raw: Option<&Value>) -> Result<Self, OrchestratorError> {
        let raw = match raw {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(raw) => raw,
        };
        let obj = raw
            .as_object()
            .ok_or_else(|| OrchestratorError::invalid("optimizer must be a JSON object"))?;

        let kind = match obj.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => {
                return Err(OrchestratorError::invalid(format!(
                    "optimizer.type must be a string, got {other}"
                )))
            }
            None => return Err(OrchestratorError::invalid("optimizer.type is required")),
        };

        match kind {
            "bayesopt" => Ok(OptimizerSpec::Bayesian {
                n_init: positive_count(obj, "n_init")?,
                n_iter: positive_count(obj, "n_iter")?,
            }),
            "grid" => Ok(OptimizerSpec::Grid {
                num_configs_per_param: positive_count(obj, "num_configs_per_param")?,
            }),
            other => Err(OrchestratorError::invalid(format!(
                "unknown optimizer type '{other}' (expected 'bayesopt' or 'grid')"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerSpec::Bayesian { .. } => "bayesopt",
            OptimizerSpec::Grid { .. } => "grid",
        }
    }

    /// Number of configurations a run with this optimizer evaluates.
    ///
    /// Saturates at `u64::MAX` for absurdly large grids.
    pub fn planned_evaluations(&self, parameters: &[Parameter]) -> u64 {
        match self {
            OptimizerSpec::Bayesian { n_init, n_iter } => u64::from(*n_init) + u64::from(*n_iter),
            OptimizerSpec::Grid {
                num_configs_per_param,
            } => parameters.iter().fold(1u64, |acc, param| {
                let axis = if param.is_fixed() {
                    1
                } else {
                    u64::from(*num_configs_per_param)
                };
                acc.saturating_mul(axis)
            }),
        }
    }

    /// Check the selection against the experiment it will run on.
    pub fn validate_for(&self, parameters: &[Parameter]) -> Result<(), OrchestratorError> {
        if let OptimizerSpec::Grid { .. } = self {
            let points = self.planned_evaluations(parameters);
            if points > MAX_GRID_POINTS {
                return Err(OrchestratorError::invalid(format!(
                    "grid would enumerate {points} configurations (limit {MAX_GRID_POINTS})"
                )));
            }
        }
        Ok(())
    }

    pub fn build(&self, parameters: &[Parameter]) -> Box<dyn Optimizer> {
        match self {
            OptimizerSpec::Bayesian { n_init, n_iter } => {
                Box::new(BayesianSearch::new(parameters.to_vec(), *n_init, *n_iter))
            }
            OptimizerSpec::Grid {
                num_configs_per_param,
            } => Box::new(GridSearch::new(parameters, *num_configs_per_param)),
        }
    }
}

fn positive_count(obj: &Map<String, Value>, field: &str) -> Result<u32, OrchestratorError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(OrchestratorError::invalid(format!(
            "optimizer.{field} is required"
        ))),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Err(OrchestratorError::invalid(format!(
                "optimizer.{field} must be positive"
            ))),
            Some(v) => u32::try_from(v).map_err(|_| {
                OrchestratorError::invalid(format!("optimizer.{field} is too large: {v}"))
            }),
            None => Err(OrchestratorError::invalid(format!(
                "optimizer.{field} must be a positive integer, got {n}"
            ))),
        },
        Some(other) => Err(OrchestratorError::invalid(format!(
            "optimizer.{field} must be a positive integer, got {other}"
        ))),
    }
}

/// Strategy proposing configurations and consuming their scores.
///
/// `suggest` returns `None` once the strategy's evaluation budget is spent.
/// Lower scores are better.
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    fn suggest(&mut self) -> Option<Configuration>;

    fn observe(&mut self, configuration: &Configuration, score: f64);
}
