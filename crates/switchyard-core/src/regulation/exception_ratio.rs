use super::{Decision, EvaluationInput, RegulationError, Regulator};
use crate::{config::RegulationConfig, stat::WindowCounts, types::RegulationState};

/// Regulates endpoints whose exception ratio reaches the configured threshold.
pub struct ExceptionRatioRegulator {
    config: RegulationConfig,
}

impl ExceptionRatioRegulator {
    pub const ALIAS: &'static str = "exception_ratio";

    #[must_use]
    pub fn new(config: RegulationConfig) -> Self {
        Self { config }
    }

    fn check(counts: WindowCounts) -> Result<(), RegulationError> {
        if counts.exceptions > counts.invocations {
            return Err(RegulationError::InconsistentCounts {
                invocations: counts.invocations,
                exceptions: counts.exceptions,
            });
        }
        Ok(())
    }
}

impl Regulator for ExceptionRatioRegulator {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn evaluate(&self, input: &EvaluationInput) -> Result<Decision, RegulationError> {
        Self::check(input.window)?;
        Self::check(input.probe)?;
        let threshold = self.config.regulation_threshold;

        let decision = match input.state {
            RegulationState::Normal => {
                let sampled = input.window.invocations >= self.config.min_sample_threshold;
                if sampled && input.window.exception_ratio() >= threshold {
                    Decision::Regulate
                } else {
                    Decision::Keep
                }
            }
            RegulationState::Regulated => {
                if input.since_transition >= input.current_degrade {
                    Decision::BeginRecovery
                } else {
                    Decision::Keep
                }
            }
            RegulationState::Recovering => {
                let probed = input.probe.invocations >= self.config.recovery_min_samples();
                let ratio = input.probe.exception_ratio();
                if probed && ratio >= threshold {
                    Decision::Escalate
                } else if input.since_transition >= self.config.recovery_window() && ratio < threshold {
                    Decision::Restore
                } else {
                    Decision::Keep
                }
            }
        };
        Ok(decision)
    }
}
