use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Version of the [`ExperimentSnapshot`] layout handed to workers.
pub const SNAPSHOT_SCHEMA_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExperimentId(pub Uuid);

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExperimentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Bounds for one tunable parameter of an experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub minimum: f64,
    pub maximum: f64,
}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        minimum: f64,
        maximum: f64,
    ) -> Result<Self, OrchestratorError> {
        let param = Self {
            name: name.into(),
            minimum,
            maximum,
        };
        param.validate()?;
        Ok(param)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::invalid("parameter name must not be empty"));
        }
        if !self.minimum.is_finite() || !self.maximum.is_finite() {
            return Err(OrchestratorError::invalid(format!(
                "parameter '{}' bounds must be finite numbers",
                self.name
            )));
        }
        if self.minimum > self.maximum {
            return Err(OrchestratorError::invalid(format!(
                "parameter '{}' has minimum {} greater than maximum {}",
                self.name, self.minimum, self.maximum
            )));
        }
        Ok(())
    }

    /// True when the bounds collapse to a single value.
    pub fn is_fixed(&self) -> bool {
        self.minimum == self.maximum
    }
}

/// Where the experiment's command is executed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Compute {
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_threads: Option<u32>,
    },
    Cloud {
        provider: String,
        instance_type: String,
        region: String,
    },
}

impl Default for Compute {
    fn default() -> Self {
        Compute::Local { max_threads: None }
    }
}

/// Request body for creating (or fetching) an experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub tool_name: String,
    pub parameters: Vec<Parameter>,
    pub command_template_string: String,
    #[serde(default)]
    pub compute: Compute,
}

impl ExperimentSpec {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.tool_name.trim().is_empty() {
            return Err(OrchestratorError::invalid("tool_name must not be empty"));
        }
        if self.command_template_string.trim().is_empty() {
            return Err(OrchestratorError::invalid(
                "command_template_string must not be empty",
            ));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            param.validate()?;
            if !seen.insert(param.name.as_str()) {
                return Err(OrchestratorError::invalid(format!(
                    "duplicate parameter name '{}'",
                    param.name
                )));
            }
        }
        Ok(())
    }

    /// Key under which two specs describe the same experiment.
    ///
    /// Parameters are compared in declaration order; compute is not part of
    /// the identity.
    pub fn identity_key(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|p| format!("{}[{},{}]", p.name, p.minimum, p.maximum))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "{}|{}|{}",
            self.tool_name, params, self.command_template_string
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub tool_name: String,
    pub parameters: Vec<Parameter>,
    pub command_template_string: String,
    pub compute: Compute,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn from_spec(id: ExperimentId, spec: ExperimentSpec) -> Self {
        Self {
            id,
            tool_name: spec.tool_name,
            parameters: spec.parameters,
            command_template_string: spec.command_template_string,
            compute: spec.compute,
            created_at: Utc::now(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn snapshot(&self) -> ExperimentSnapshot {
        ExperimentSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            experiment: self.clone(),
        }
    }
}

/// Read-only copy of an experiment passed across the worker boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub schema_version: u16,
    pub experiment: Experiment,
}

impl ExperimentSnapshot {
    pub fn check_version(&self) -> anyhow::Result<()> {
        if self.schema_version != SNAPSHOT_SCHEMA_VERSION {
            anyhow::bail!(
                "unsupported experiment snapshot schema version {} (expected {})",
                self.schema_version,
                SNAPSHOT_SCHEMA_VERSION
            );
        }
        Ok(())
    }

    pub fn id(&self) -> ExperimentId {
        self.experiment.id
    }
}
