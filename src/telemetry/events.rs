use crate::key::ClientKey;
use crate::rate_limit::{Decision, RejectCause};
use std::fmt;
use std::time::Duration;

/// Admission events emitted by [`AdmissionService`](crate::AdmissionService).
///
/// One event per request, after the chain has decided. Events can be collected, aggregated, or
/// forwarded to external systems through a [`TelemetrySink`](super::TelemetrySink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The request passed every stage and was forwarded.
    Admitted {
        /// Client the request was accounted to
        client: ClientKey,
        /// Smallest number of permits left across stages
        remaining: u32,
    },
    /// The request was answered with 429.
    Rejected {
        /// Client the request was accounted to
        client: ClientKey,
        /// Which gate rejected
        cause: RejectCause,
        /// Advertised wait before retrying
        retry_after: Duration,
    },
}

impl AdmissionEvent {
    /// Event describing `decision` for `client`.
    pub fn from_decision(client: ClientKey, decision: &Decision) -> Self {
        match decision {
            Decision::Admit { remaining } => Self::Admitted { client, remaining: *remaining },
            Decision::Reject(rejection) => Self::Rejected {
                client,
                cause: rejection.cause,
                retry_after: rejection.retry_after,
            },
        }
    }

    pub fn client(&self) -> &ClientKey {
        match self {
            Self::Admitted { client, .. } | Self::Rejected { client, .. } => client,
        }
    }

    /// `"admitted"` or `"rejected"`.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Rejection cause label, `"none"` for admissions.
    pub fn cause_label(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "none",
            Self::Rejected { cause, .. } => cause.as_str(),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { client, remaining } => {
                write!(f, "Admitted(client={}, remaining={})", client, remaining)
            }
            AdmissionEvent::Rejected { client, cause, retry_after } => {
                write!(
                    f,
                    "Rejected(client={}, cause={}, retry_after={:?})",
                    client, cause, retry_after
                )
            }
        }
    }
}
