use std::{fmt, time::Duration};
use thiserror::Error;

/// Sub-classification of faults raised by the transport collaborator.
///
/// Kept separate from [`RpcError::Remote`] so a codec or protocol fault is never mistaken for
/// an error the callee reported on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameworkErrorKind {
    /// Payload could not be encoded or decoded.
    Codec,
    /// Malformed frame, unexpected message type, version mismatch.
    Protocol,
    /// Anything raised inside the dispatch engine itself (panicked task, dropped completion).
    Internal,
}

impl FrameworkErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codec => "codec",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FrameworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error category used for retry, statistics and callback dispatch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Route,
    Connection,
    Remote,
    Framework,
    Timeout,
    Filter,
    Context,
    Shutdown,
}

/// Errors surfaced by an outbound call.
///
/// The type is `Clone` because a single outcome may be observed by several parties: the caller
/// holding a shared [`ResponseFuture`](crate::invoker::ResponseFuture), async-response filters
/// and the statistics recorder.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RpcError {
    /// No endpoint survived routing and regulation filtering.
    #[error("No available endpoint for {service}: {reason}")]
    Route { service: String, reason: String },

    /// Dial or liveness failure against a specific endpoint.
    #[error("Connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    /// Business-level error reported by the callee. Passed through to the caller untouched.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// Protocol, codec or internal fault, tagged with its kind.
    #[error("Framework error ({kind}): {message}")]
    Framework { kind: FrameworkErrorKind, message: String },

    /// The caller stopped waiting. The remote call itself is not cancelled.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// A filter short-circuited the chain.
    #[error("Rejected by filter {filter}: {reason}")]
    FilterRejected { filter: String, reason: String },

    /// `CallContext` had no pending future to hand out.
    #[error("No pending future in call context")]
    NoPendingFuture,

    /// The dispatch runtime has been shut down.
    #[error("Dispatch runtime is shutting down")]
    ShuttingDown,
}

impl RpcError {
    #[must_use]
    pub fn connection(endpoint: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Connection { endpoint: endpoint.to_string(), message: message.into() }
    }

    #[must_use]
    pub fn framework(kind: FrameworkErrorKind, message: impl Into<String>) -> Self {
        Self::Framework { kind, message: message.into() }
    }

    #[must_use]
    pub fn route(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Route { service: service.into(), reason: reason.into() }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Route { .. } => ErrorKind::Route,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Framework { .. } => ErrorKind::Framework,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::FilterRejected { .. } => ErrorKind::Filter,
            Self::NoPendingFuture => ErrorKind::Context,
            Self::ShuttingDown => ErrorKind::Shutdown,
        }
    }

    /// Returns `true` if another candidate may be tried within the retry budget.
    ///
    /// Only connection failures qualify. Route failures are final by construction and every
    /// other kind means the request may already have reached the callee.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if the error was reported by the callee rather than the framework.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Returns `true` if this outcome should count as an exception in invocation statistics.
    ///
    /// Timeouts always count. Remote errors count only when the consumer opts in. Errors raised
    /// before an endpoint was chosen never count against one.
    #[must_use]
    pub fn counts_as_failure(&self, remote_is_failure: bool) -> bool {
        match self {
            Self::Connection { .. } | Self::Framework { .. } | Self::Timeout(_) => true,
            Self::Remote { .. } => remote_is_failure,
            Self::Route { .. } |
            Self::FilterRejected { .. } |
            Self::NoPendingFuture |
            Self::ShuttingDown => false,
        }
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route { .. } => "route",
            Self::Connection { .. } => "connection",
            Self::Remote { .. } => "remote",
            Self::Framework { kind, .. } => match kind {
                FrameworkErrorKind::Codec => "framework_codec",
                FrameworkErrorKind::Protocol => "framework_protocol",
                FrameworkErrorKind::Internal => "framework_internal",
            },
            Self::Timeout(_) => "timeout",
            Self::FilterRejected { .. } => "filter_rejected",
            Self::NoPendingFuture => "no_pending_future",
            Self::ShuttingDown => "shutting_down",
        }
    }
}
