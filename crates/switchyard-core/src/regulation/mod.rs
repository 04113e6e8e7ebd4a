//! Exception-ratio fault tolerance.
//!
//! Every window the [`RegulationLoop`] rotates each endpoint's [`InvocationStat`] and feeds the
//! retired counts to a [`Regulator`], a pure decision function over one endpoint. Decisions move
//! the endpoint between three states:
//!
//! ```text
//!            ratio >= threshold                degrade elapsed
//!   NORMAL ----------------------> REGULATED -------------------> RECOVERING
//!     ^                               ^                               |
//!     |                               +----- probe ratio >= thr ------+
//!     +------------------ probe ratio < thr after recovery window ----+
//! ```
//!
//! Each escalation multiplies the degrade duration by the configured factor. The loop applies
//! guards on top of the regulator: it never removes the last selectable endpoint of a consumer
//! and never exceeds the configured cap on regulated endpoints.
//!
//! [`InvocationStat`]: crate::stat::InvocationStat

mod control;
mod exception_ratio;

pub use control::{EndpointRegulation, RegulatedConsumer, RegulationLoop, TickSummary};
pub use exception_ratio::ExceptionRatioRegulator;

use crate::{stat::WindowCounts, types::RegulationState};
use std::time::Duration;
use thiserror::Error;

/// What the regulator observed for one endpoint this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationInput {
    pub state: RegulationState,
    /// Counts of the window that was just rotated out.
    pub window: WindowCounts,
    /// Counts accumulated since the endpoint entered `Recovering`. Empty in other states.
    pub probe: WindowCounts,
    /// Time since the endpoint entered its current state.
    pub since_transition: Duration,
    /// How long the endpoint stays regulated before probing.
    pub current_degrade: Duration,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    /// `Normal` to `Regulated`.
    Regulate,
    /// `Regulated` to `Recovering`.
    BeginRecovery,
    /// `Recovering` to `Normal`.
    Restore,
    /// `Recovering` back to `Regulated` with a longer degrade duration.
    Escalate,
}

impl Decision {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Regulate => "regulate",
            Self::BeginRecovery => "begin_recovery",
            Self::Restore => "restore",
            Self::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegulationError {
    #[error("window reports {exceptions} exceptions for {invocations} invocations")]
    InconsistentCounts { invocations: u64, exceptions: u64 },

    #[error("endpoint {endpoint} of consumer {consumer} is {state} without regulation bookkeeping")]
    MissingBookkeeping { consumer: String, endpoint: String, state: &'static str },

    #[error("regulator {alias} failed: {reason}")]
    Regulator { alias: &'static str, reason: String },
}

/// Decides the next state of one endpoint.
pub trait Regulator: Send + Sync {
    fn alias(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns an error if the input cannot be evaluated. The loop logs it and leaves the
    /// endpoint unchanged for this tick.
    fn evaluate(&self, input: &EvaluationInput) -> Result<Decision, RegulationError>;
}
