use std::sync::Arc;

use optrun::*;

/// Single parameter `a` in `[0, 1]`, the smallest experiment worth running.
pub fn single_param_spec(tool_name: &str) -> ExperimentSpec {
    spec_with_params(tool_name, &[("a", 0.0, 1.0)])
}

/// Spec whose template references every parameter as `--name ${name}`.
pub fn spec_with_params(tool_name: &str, params: &[(&str, f64, f64)]) -> ExperimentSpec {
    let parameters = params
        .iter()
        .map(|(name, min, max)| Parameter {
            name: (*name).to_string(),
            minimum: *min,
            maximum: *max,
        })
        .collect();
    let args = params
        .iter()
        .map(|(name, _, _)| format!("--{name} ${{{name}}}"))
        .collect::<Vec<_>>()
        .join(" ");
    ExperimentSpec {
        tool_name: tool_name.to_string(),
        parameters,
        command_template_string: format!("{tool_name} {args}"),
        compute: Compute::default(),
    }
}

/// A store holding one experiment created from `spec`.
pub async fn seeded_store(spec: ExperimentSpec) -> (Arc<InMemoryExperimentStore>, Experiment) {
    let store = Arc::new(InMemoryExperimentStore::new());
    let (experiment, _) = store
        .get_or_create_experiment(spec)
        .await
        .expect("in-memory store accepts valid specs");
    (store, experiment)
}

pub fn assignment(experiment: &Experiment, optimizer: OptimizerSpec) -> RunAssignment {
    RunAssignment::new(RunId::new(), experiment.snapshot(), optimizer)
}
