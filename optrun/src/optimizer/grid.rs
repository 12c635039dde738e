use crate::experiment::Parameter;
use crate::trial::Configuration;

use super::Optimizer;

/// Exhaustive search over evenly spaced values of every parameter.
///
/// Each axis includes both bounds. The last parameter varies fastest.
#[derive(Debug, Clone)]
pub struct GridSearch {
    axes: Vec<(String, Vec<f64>)>,
    total: u64,
    next: u64,
}

impl GridSearch {
    pub fn new(parameters: &[Parameter], num_configs_per_param: u32) -> Self {
        let axes: Vec<(String, Vec<f64>)> = parameters
            .iter()
            .map(|param| (param.name.clone(), axis(param, num_configs_per_param)))
            .collect();
        let total = axes
            .iter()
            .fold(1u64, |acc, (_, values)| acc.saturating_mul(values.len() as u64));
        Self {
            axes,
            total,
            next: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn decode(&self, mut index: u64) -> Configuration {
        let mut values = vec![0.0; self.axes.len()];
        for (slot, (_, axis)) in values.iter_mut().zip(&self.axes).rev() {
            let radix = axis.len() as u64;
            *slot = axis[(index % radix) as usize];
            index /= radix;
        }
        self.axes
            .iter()
            .zip(values)
            .map(|((name, _), value)| (name.clone(), value))
            .collect()
    }
}

fn axis(param: &Parameter, n: u32) -> Vec<f64> {
    if param.is_fixed() || n <= 1 {
        return vec![param.minimum];
    }
    let span = param.maximum - param.minimum;
    let steps = f64::from(n - 1);
    (0..n)
        .map(|i| {
            if i == n - 1 {
                param.maximum
            } else {
                param.minimum + span * f64::from(i) / steps
            }
        })
        .collect()
}

impl Optimizer for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn suggest(&mut self) -> Option<Configuration> {
        if self.next >= self.total {
            return None;
        }
        let config = self.decode(self.next);
        self.next += 1;
        Some(config)
    }

    fn observe(&mut self, _configuration: &Configuration, _score: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_inclusive_axes_last_parameter_fastest() {
        let params = vec![
            Parameter::new("a", 0.0, 1.0).unwrap(),
            Parameter::new("b", 10.0, 20.0).unwrap(),
        ];
        let mut grid = GridSearch::new(&params, 3);
        assert_eq!(grid.total(), 9);

        let mut seen = Vec::new();
        while let Some(config) = grid.suggest() {
            seen.push((config.get("a").unwrap(), config.get("b").unwrap()));
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[0], (0.0, 10.0));
        assert_eq!(seen[1], (0.0, 15.0));
        assert_eq!(seen[2], (0.0, 20.0));
        assert_eq!(seen[3], (0.5, 10.0));
        assert_eq!(seen[8], (1.0, 20.0));
    }

    #[test]
    fn no_parameters_yields_single_empty_configuration() {
        let mut grid = GridSearch::new(&[], 5);
        assert_eq!(grid.suggest(), Some(Configuration::default()));
        assert_eq!(grid.suggest(), None);
    }
}
