use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiment::ExperimentId;

/// Value chosen for a single parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: f64,
}

/// One point in an experiment's parameter space, in parameter order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(pub Vec<ParameterValue>);

impl Configuration {
    pub fn new(values: Vec<ParameterValue>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.iter().find(|v| v.name == name).map(|v| v.value)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().map(|v| v.value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for Configuration {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| ParameterValue { name, value })
                .collect(),
        )
    }
}

/// A scored evaluation of one configuration. Lower scores are better.
///
/// Trials are append-only; `trial_id` is assigned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<i64>,
    pub experiment_id: ExperimentId,
    pub configuration: Configuration,
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(experiment_id: ExperimentId, configuration: Configuration, score: f64) -> Self {
        Self {
            trial_id: None,
            experiment_id,
            configuration,
            score,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_lookup_by_name() {
        let config: Configuration = vec![("a".to_string(), 0.5), ("b".to_string(), 3.0)]
            .into_iter()
            .collect();
        assert_eq!(config.get("b"), Some(3.0));
        assert_eq!(config.get("c"), None);
        assert_eq!(config.values().collect::<Vec<_>>(), vec![0.5, 3.0]);
    }

    #[test]
    fn unassigned_trial_id_is_omitted_from_json() {
        let trial = Trial::new(ExperimentId::new(), Configuration::default(), 1.25);
        let json = serde_json::to_value(&trial).unwrap();
        assert!(json.get("trial_id").is_none());
        assert_eq!(json["configuration"], serde_json::json!([]));
    }
}
