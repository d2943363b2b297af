//! Single parameter damped least squares
//!
//! All the retrievals fit one scalar (a water vapor ratio or a sky coupling
//! multiplier) to a set of measurements. The fitter is a Levenberg-Marquardt
//! iteration with a forward-difference derivative: the normal equation terms
//! are accumulated at the current parameter, a damped step is proposed, and
//! the damping grows tenfold for as long as the proposal makes the chi-square
//! worse.

use log::{trace, warn};

use crate::error::SkyError;

/// Bound on the number of damping increases for a single step. Once the
/// damping is this large the step is vanishingly small and the proposal is
/// accepted as is.
const MAX_DAMPING_INCREASES: usize = 30;

/// Chi-square change below which a worse proposal is still accepted.
const CHI_SQUARE_SLACK: f64 = 0.001;

/// Constants of the fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitSettings {
    /// Maximum number of (outer) iterations
    pub max_iterations: usize,
    /// Parameter increment for the numeric derivative
    pub step: f64,
    /// Initial damping factor
    pub initial_damping: f64,
    /// Convergence threshold on the change of the fit sigma between two
    /// iterations
    pub tolerance: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            step: 0.02,
            initial_damping: 0.001,
            tolerance: 0.01,
        }
    }
}

impl FitSettings {
    /// Same settings with a different convergence threshold.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }
}

/// A one-parameter model fitted to measurements.
pub(crate) trait FitProblem {
    /// The measured values the model is fitted to.
    fn measured(&self) -> &[f64];

    /// Evaluate the model at `parameter`, writing one value per measurement
    /// into `out`.
    fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError>;

    /// Restrict a proposed parameter. By default a negative proposal is
    /// replaced by 90% of the current value.
    fn bound(&self, proposal: f64, current: f64) -> f64 {
        if proposal < 0.0 {
            0.9 * current
        } else {
            proposal
        }
    }

    /// Number of degrees of freedom the sum of squared residuals is divided
    /// by.
    fn chi_square_divisor(&self) -> f64 {
        let n = self.measured().len();
        if n > 1 {
            (n - 1) as f64
        } else {
            1.0
        }
    }
}

/// Result of a converged fit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FitOutcome {
    /// Fitted parameter
    pub parameter: f64,
    /// Square root of the final chi-square
    pub sigma: f64,
    /// Formal error of the parameter, relative to the parameter scale
    pub parameter_error: f64,
    /// Model values at the fitted parameter
    pub fitted: Vec<f64>,
    /// Number of iterations used
    pub iterations: usize,
}

fn chi_square<P: FitProblem + ?Sized>(problem: &P, model: &[f64]) -> f64 {
    let sum: f64 = problem
        .measured()
        .iter()
        .zip(model)
        .map(|(m, f)| (m - f).powi(2))
        .sum();
    sum / problem.chi_square_divisor()
}

/// Fit the problem's parameter starting from `initial`.
///
/// The fit converges when the fit sigma changes by less than the tolerance
/// between two iterations. Running out of iterations gives
/// [`SkyError::NotConverged`] with the last accepted parameter and sigma. A
/// model whose derivative vanishes at a trial parameter cannot be fitted and
/// gives [`SkyError::InvalidInput`].
pub(crate) fn fit<P: FitProblem + ?Sized>(
    problem: &P,
    initial: f64,
    settings: &FitSettings,
) -> Result<FitOutcome, SkyError> {
    let measured = problem.measured();
    let n = measured.len();
    if n == 0 {
        return Err(SkyError::InvalidInput("nothing to fit"));
    }

    let mut current = vec![0.0; n];
    let mut stepped = vec![0.0; n];
    let mut trial = vec![0.0; n];

    let mut parameter = initial;
    let mut damping = settings.initial_damping;
    let mut sigma = f64::NAN;

    for iteration in 1..=settings.max_iterations {
        problem.model(parameter, &mut current)?;
        problem.model(parameter + settings.step, &mut stepped)?;

        let (beta, alpha) = measured.iter().zip(current.iter().zip(&stepped)).fold(
            (0.0, 0.0),
            |(beta, alpha), (m, (f1, f2))| {
                let deriv = (f2 - f1) / settings.step;
                (beta + (m - f1) * deriv, alpha + deriv * deriv)
            },
        );
        if !(alpha > 0.0) {
            return Err(SkyError::InvalidInput(
                "model does not depend on the fitted parameter",
            ));
        }
        let chi_square_current = chi_square(problem, &current);

        // Grow the damping while the proposal makes things worse, without
        // re-deriving
        let mut scale = 1.0 / (1.0 + damping);
        let mut proposal = problem.bound(parameter + beta * scale / alpha, parameter);
        problem.model(proposal, &mut trial)?;
        let mut chi_square_trial = chi_square(problem, &trial);
        for _ in 0..MAX_DAMPING_INCREASES {
            if (chi_square_current - chi_square_trial).abs() <= CHI_SQUARE_SLACK
                || chi_square_current >= chi_square_trial
            {
                break;
            }
            damping *= 10.0;
            scale = 1.0 / (1.0 + damping);
            proposal = problem.bound(parameter + beta * scale / alpha, parameter);
            problem.model(proposal, &mut trial)?;
            chi_square_trial = chi_square(problem, &trial);
        }

        damping /= 10.0;
        parameter = proposal;
        sigma = chi_square_trial.sqrt();
        let parameter_error = (scale / alpha).sqrt() * sigma * parameter;
        trace!(
            "iteration {iteration}: parameter {parameter:.6}, sigma {sigma:.6}, damping {damping:.1e}"
        );

        if (chi_square_current.sqrt() - sigma).abs() < settings.tolerance {
            return Ok(FitOutcome {
                parameter,
                sigma,
                parameter_error,
                fitted: trial,
                iterations: iteration,
            });
        }
    }

    warn!(
        "fit did not converge after {} iterations (parameter {parameter}, sigma {sigma})",
        settings.max_iterations
    );
    Err(SkyError::NotConverged {
        iterations: settings.max_iterations,
        parameter,
        sigma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Exponential decay `exp(-p x)` sampled at fixed abscissas.
    struct Decay {
        x: Vec<f64>,
        measured: Vec<f64>,
    }

    impl Decay {
        fn new(rate: f64) -> Self {
            let x: Vec<f64> = (0..10).map(|i| 0.2 * i as f64).collect();
            let measured = x.iter().map(|x| f64::exp(-rate * x)).collect();
            Self { x, measured }
        }
    }

    impl FitProblem for Decay {
        fn measured(&self) -> &[f64] {
            &self.measured
        }

        fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
            for (o, x) in out.iter_mut().zip(&self.x) {
                *o = f64::exp(-parameter * x);
            }
            Ok(())
        }
    }

    #[test]
    fn exact_start_converges_immediately() {
        let problem = Decay::new(1.0);
        let outcome = fit(&problem, 1.0, &FitSettings::default()).unwrap();
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.parameter, 1.0);
        assert_eq!(outcome.sigma, 0.0);
        assert_eq!(outcome.fitted, problem.measured);
    }

    #[test]
    fn recovers_rate() {
        let problem = Decay::new(0.7);
        let settings = FitSettings::default().with_tolerance(1e-6);
        let outcome = fit(&problem, 1.0, &settings).unwrap();
        assert_relative_eq!(outcome.parameter, 0.7, max_relative = 1e-3);
        assert!(outcome.sigma < 1e-3);
        assert!(outcome.iterations > 1);
    }

    #[test]
    fn flat_model_is_rejected() {
        struct Flat(Vec<f64>);
        impl FitProblem for Flat {
            fn measured(&self) -> &[f64] {
                &self.0
            }
            fn model(&self, _: f64, out: &mut [f64]) -> Result<(), SkyError> {
                out.fill(3.0);
                Ok(())
            }
        }

        let result = fit(&Flat(vec![1.0, 2.0]), 1.0, &FitSettings::default());
        assert!(matches!(result, Err(SkyError::InvalidInput(_))));
    }

    #[test]
    fn runs_out_of_iterations() {
        let problem = Decay::new(0.3);
        let settings = FitSettings {
            max_iterations: 1,
            tolerance: 1e-12,
            ..Default::default()
        };
        let error = fit(&problem, 2.0, &settings).unwrap_err();
        assert!(error.is_not_converged());
        match error {
            SkyError::NotConverged {
                iterations,
                parameter,
                ..
            } => {
                assert_eq!(iterations, 1);
                // The single accepted step still moves towards the answer
                assert!(parameter < 2.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn damping_growth_is_bounded() {
        use std::cell::Cell;

        /// Fits well at 0, looks better at 0.02 and is bad everywhere else,
        /// so no damped step ever improves the chi-square.
        struct Spike {
            evaluations: Cell<usize>,
        }
        impl FitProblem for Spike {
            fn measured(&self) -> &[f64] {
                &[0.0]
            }
            fn model(&self, parameter: f64, out: &mut [f64]) -> Result<(), SkyError> {
                self.evaluations.set(self.evaluations.get() + 1);
                out[0] = if parameter == 0.0 {
                    1.0
                } else if parameter == 0.02 {
                    0.0
                } else {
                    10.0
                };
                Ok(())
            }
        }

        let problem = Spike {
            evaluations: Cell::new(0),
        };
        let settings = FitSettings {
            max_iterations: 1,
            ..Default::default()
        };
        let error = fit(&problem, 0.0, &settings).unwrap_err();
        // Current, stepped, first proposal, then one per damping increase
        assert_eq!(problem.evaluations.get(), 3 + MAX_DAMPING_INCREASES);
        match error {
            SkyError::NotConverged {
                parameter, sigma, ..
            } => {
                // The last, heavily damped, proposal is accepted
                assert!(parameter > 0.0 && parameter < 1e-20);
                assert_eq!(sigma, 10.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn negative_proposals_are_pulled_back() {
        let problem = Decay::new(1.0);
        assert_relative_eq!(problem.bound(-0.3, 0.5), 0.45);
        assert_eq!(problem.bound(0.2, 0.5), 0.2);
        assert_eq!(problem.chi_square_divisor(), 9.0);
    }
}
