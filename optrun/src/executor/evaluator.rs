use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::experiment::{Compute, ExperimentSnapshot};
use crate::trial::Configuration;

use super::TrialEvaluator;

/// Longest tail of stderr carried into an error message.
const STDERR_TAIL: usize = 512;

/// Runs the experiment's command template through a shell and scores each
/// configuration by the command's wall-clock runtime in seconds.
#[derive(Clone, Debug)]
pub struct CommandEvaluator {
    shell: String,
    timeout: Option<Duration>,
}

impl Default for CommandEvaluator {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: None,
        }
    }
}

impl CommandEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill a trial's command once it has run for `timeout`. No timeout is
    /// applied by default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl TrialEvaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        snapshot: &ExperimentSnapshot,
        configuration: &Configuration,
    ) -> anyhow::Result<f64> {
        if let Compute::Cloud { provider, .. } = &snapshot.experiment.compute {
            anyhow::bail!("compute provider '{provider}' is not reachable from a local command evaluator");
        }
        let command_line = render_command(&snapshot.experiment.command_template_string, configuration)?;
        tracing::debug!(command = %command_line, "evaluating configuration");

        let mut command = tokio::process::Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output)
                .await
                .map_err(|_| anyhow::anyhow!("command `{command_line}` timed out after {limit:?}"))??,
            None => output.await?,
        };
        let elapsed = started.elapsed().as_secs_f64();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
                Some((cut, _)) => &stderr[cut..],
                None => stderr,
            };
            anyhow::bail!("command `{command_line}` exited with {}: {tail}", output.status);
        }
        Ok(elapsed)
    }
}

/// Substitute configuration values into a command template.
///
/// `${name}` and `$name` are replaced by the parameter's value and `$$` by a
/// literal `$`. A `$` followed by anything else is kept as is. Referencing a
/// parameter that is not in the configuration is an error.
pub fn render_command(template: &str, configuration: &Configuration) -> anyhow::Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            rendered.push(c);
            continue;
        }
        let name = match chars.peek() {
            Some('$') => {
                chars.next();
                rendered.push('$');
                continue;
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => anyhow::bail!("unterminated placeholder '${{{name}' in command template"),
                    }
                }
                name
            }
            Some(ch) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some(&ch) = chars.peek() {
                    if !(ch.is_ascii_alphanumeric() || ch == '_') {
                        break;
                    }
                    name.push(ch);
                    chars.next();
                }
                name
            }
            _ => {
                rendered.push('$');
                continue;
            }
        };
        let value = configuration
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("command template references unknown parameter '{name}'"))?;
        rendered.push_str(&format_value(value));
    }
    Ok(rendered)
}

/// Integral values are written without a fractional part so templates like
/// `sleep ${n}` receive `sleep 2`, not `sleep 2.0`.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{Experiment, ExperimentId, ExperimentSpec, Parameter};

    fn config(pairs: &[(&str, f64)]) -> Configuration {
        pairs.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn snapshot(template: &str) -> ExperimentSnapshot {
        let spec = ExperimentSpec {
            tool_name: "shell".into(),
            parameters: vec![Parameter::new("a", 0.0, 10.0).unwrap()],
            command_template_string: template.into(),
            compute: Compute::default(),
        };
        Experiment::from_spec(ExperimentId::new(), spec).snapshot()
    }

    #[test]
    fn both_placeholder_forms_are_substituted() {
        let c = config(&[("a", 2.0), ("b_1", 0.5)]);
        assert_eq!(
            render_command("run --a=${a} --b $b_1 done", &c).unwrap(),
            "run --a=2 --b 0.5 done"
        );
    }

    #[test]
    fn dollar_escapes_and_stray_dollars_are_literal() {
        let c = config(&[("a", 1.0)]);
        assert_eq!(render_command("echo $$HOME $ ${a}$", &c).unwrap(), "echo $HOME $ 1$");
    }

    #[test]
    fn unknown_or_unterminated_placeholders_are_errors() {
        let c = config(&[("a", 1.0)]);
        let err = render_command("run ${missing}", &c).unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(render_command("run ${a", &c).is_err());
        assert!(render_command("run $zz", &c).is_err());
    }

    #[test]
    fn fractional_values_keep_their_precision() {
        assert_eq!(format_value(3.0), "3");
        assert_eq!(format_value(-4.0), "-4");
        assert_eq!(format_value(0.125), "0.125");
    }

    #[tokio::test]
    async fn successful_command_is_scored_by_runtime() {
        let evaluator = CommandEvaluator::new();
        let score = evaluator
            .evaluate(&snapshot("test ${a} -eq 3"), &config(&[("a", 3.0)]))
            .await
            .unwrap();
        assert!(score >= 0.0);
    }

    #[tokio::test]
    async fn failing_command_is_an_error_with_stderr() {
        let evaluator = CommandEvaluator::new();
        let err = evaluator
            .evaluate(&snapshot("echo boom-${a} >&2; exit 3"), &config(&[("a", 1.0)]))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom-1"), "{message}");
    }

    #[tokio::test]
    async fn timeout_stops_a_slow_command() {
        let evaluator = CommandEvaluator::new().with_timeout(Duration::from_millis(100));
        let err = evaluator
            .evaluate(&snapshot("sleep ${a}"), &config(&[("a", 5.0)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cloud_experiments_are_rejected() {
        let mut snap = snapshot("true");
        snap.experiment.compute = Compute::Cloud {
            provider: "aws".into(),
            instance_type: "c5.large".into(),
            region: "us-east-1".into(),
        };
        let err = CommandEvaluator::new()
            .evaluate(&snap, &config(&[("a", 1.0)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("aws"));
    }
}
