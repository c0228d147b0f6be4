use std::fmt;

use crate::gradient::GradientProvider;
use crate::likelihood::EvaluationError;
use crate::provider::{Numerical, NumericalSettings};

/// Analytic and finite-difference gradients at one position.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheck {
    pub analytic: Vec<f64>,
    pub numeric: Vec<f64>,
    pub tolerance: f64,
}

impl GradientCheck {
    pub fn run<P: GradientProvider>(
        provider: &P,
        position: &[f64],
        settings: NumericalSettings,
    ) -> Result<Self, EvaluationError> {
        let mut analytic = vec![0.; provider.dim()];
        provider.logp(position, &mut analytic)?;
        let numerical = Numerical::new(provider, settings);
        let mut numeric = vec![0.; provider.dim()];
        numerical.logp(position, &mut numeric)?;
        let check = Self {
            analytic,
            numeric,
            tolerance: settings.tolerance,
        };
        if !check.agrees() {
            log::warn!("gradient check failed at {:?}", check.mismatches());
        }
        Ok(check)
    }

    /// Run the check at the provider's current position.
    pub fn at_position<P: GradientProvider>(
        provider: &P,
        settings: NumericalSettings,
    ) -> Result<Self, EvaluationError> {
        Self::run(provider, &provider.position(), settings)
    }

    pub fn max_abs_error(&self) -> f64 {
        self.analytic
            .iter()
            .zip(&self.numeric)
            .map(|(a, n)| (a - n).abs())
            .fold(0., f64::max)
    }

    /// Coordinates with `|analytic − numeric| > tolerance · max(1, |numeric|)`.
    pub fn mismatches(&self) -> Vec<usize> {
        self.analytic
            .iter()
            .zip(&self.numeric)
            .enumerate()
            .filter(|(_, (a, n))| !((*a - *n).abs() <= self.tolerance * n.abs().max(1.)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn agrees(&self) -> bool {
        self.analytic.len() == self.numeric.len() && self.mismatches().is_empty()
    }
}

fn write_vector(f: &mut fmt::Formatter<'_>, values: &[f64]) -> fmt::Result {
    write!(f, "[")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{value:.6e}")?;
    }
    write!(f, "]")
}

impl fmt::Display for GradientCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "analytic: ")?;
        write_vector(f, &self.analytic)?;
        writeln!(f)?;
        write!(f, "numeric : ")?;
        write_vector(f, &self.numeric)?;
        writeln!(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::test::Quadratic;

    #[test]
    fn report_lists_both_vectors() {
        let provider = Quadratic {
            center: vec![1., -1.],
            weights: vec![1., 3.],
        };
        let check = GradientCheck::at_position(&provider, NumericalSettings::default()).unwrap();
        assert!(check.agrees());
        assert!(check.max_abs_error() < 1e-6);
        let report = check.to_string();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("analytic: ["));
        assert!(lines[1].starts_with("numeric : ["));
    }

    #[test]
    fn detects_mismatch() {
        let check = GradientCheck {
            analytic: vec![1., 2.],
            numeric: vec![1., 2.5],
            tolerance: 1e-4,
        };
        assert_eq!(check.mismatches(), vec![1]);
        assert!(!check.agrees());
    }
}
