//! Error types for volume migration
//!
//! Errors fall in two groups. [`Error::Resolution`] and [`Error::Configuration`]
//! happen before any strategy starts and abort the run. Every other variant is
//! raised inside a strategy attempt; the engine records it, cleans up, and
//! moves on to the next strategy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for volmigrate operations
#[derive(Debug, Error)]
pub enum Error {
    /// A volume could not be located or is in an unusable state
    #[error("resolution error for {volume}: {message}")]
    Resolution {
        /// `namespace/name` of the claim
        volume: String,
        /// Description of what's wrong
        message: String,
    },

    /// Invalid options (unknown strategy, unsupported key algorithm)
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// SSH key pair generation failed
    #[error("key generation error [{algorithm}]: {message}")]
    KeyGeneration {
        /// Requested algorithm
        algorithm: String,
        /// Description of what failed
        message: String,
    },

    /// Creating an access-control object failed
    #[error("provisioning error [{step}]: {message}")]
    Provisioning {
        /// Sub-step that failed (e.g. "service-account", "role")
        step: String,
        /// Description of what failed
        message: String,
    },

    /// The API server rejected an object
    #[error("failed to create {kind} {name}: {message}")]
    Creation {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// A wait exceeded its deadline
    #[error("timed out after {}s waiting for {what}", .timeout.as_secs())]
    Timeout {
        /// What was being waited on
        what: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Observing an object failed
    #[error("failed to observe {kind} {name}: {message}")]
    Watch {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// A network exposure could not be provided
    #[error("exposure error [{mode}]: {message}")]
    Exposure {
        /// Requested exposure mode
        mode: String,
        /// Description of what failed
        message: String,
    },

    /// The workload itself reported failure
    #[error("workload {workload} failed: {message}")]
    StrategyExecution {
        /// Kind and name of the failed workload
        workload: String,
        /// Failure detail reported by the workload
        message: String,
    },

    /// The transfer tool failed on every attempt
    #[error("transfer failed after {attempts} attempts")]
    TransferExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// No strategy succeeded
    #[error("all strategies exhausted:{}", DisplayOutcomes(.outcomes))]
    AllStrategiesExhausted {
        /// Per-strategy outcomes, in the order they were considered
        outcomes: Vec<StrategyOutcome>,
    },
}

/// What happened to one candidate strategy that did not succeed
#[derive(Debug)]
pub struct StrategyOutcome {
    /// Strategy name
    pub strategy: String,
    /// Why it did not succeed
    pub failure: AttemptFailure,
}

/// Reason a candidate strategy did not succeed
#[derive(Debug)]
pub enum AttemptFailure {
    /// The strategy does not apply to the volumes' topology
    Skipped,
    /// The strategy ran and failed
    Failed(Box<Error>),
}

impl fmt::Display for StrategyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            AttemptFailure::Skipped => write!(f, "{}: skipped: not applicable", self.strategy),
            AttemptFailure::Failed(e) => write!(f, "{}: {}", self.strategy, e),
        }
    }
}

struct DisplayOutcomes<'a>(&'a [StrategyOutcome]);

impl fmt::Display for DisplayOutcomes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in self.0 {
            write!(f, "\n  - {}", outcome)?;
        }
        Ok(())
    }
}

impl Error {
    /// Create a resolution error for a `namespace/name` claim
    pub fn resolution(volume: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            volume: volume.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a key generation error
    pub fn key_generation(algorithm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::KeyGeneration {
            algorithm: algorithm.into(),
            message: msg.into(),
        }
    }

    /// Create a provisioning error for the sub-step that failed
    pub fn provisioning(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a creation error
    pub fn creation(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Creation {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Create a watch error
    pub fn watch(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an exposure error
    pub fn exposure(mode: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exposure {
            mode: mode.into(),
            message: msg.into(),
        }
    }

    /// Create a strategy execution error for a failed workload
    pub fn strategy_execution(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StrategyExecution {
            workload: workload.into(),
            message: msg.into(),
        }
    }

    /// Whether this error aborts the whole run instead of moving to the next strategy
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Resolution { .. } | Error::Configuration { .. })
    }
}

/// Whether a kube error is an HTTP 404
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an HTTP 409 "already exists"
pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether retrying the same request could succeed.
///
/// The API server answering 4xx (other than 429) is a verdict, not a hiccup.
pub(crate) fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_abort_before_any_attempt() {
        assert!(Error::resolution("default/data", "not found").is_fatal());
        assert!(Error::configuration("unknown strategy: foo").is_fatal());

        assert!(!Error::timeout("pod volmigrate-svc-sshd-abc", Duration::from_secs(60)).is_fatal());
        assert!(!Error::provisioning("role", "forbidden").is_fatal());
        assert!(!Error::strategy_execution(
            "Job default/volmigrate-svc-rsync-abc",
            "BackoffLimitExceeded"
        )
        .is_fatal());
        assert!(!Error::exposure("LoadBalancer", "no ingress").is_fatal());
    }

    #[test]
    fn timeout_reports_whole_seconds() {
        let err = Error::timeout("job volmigrate-mnt2-rsync-x", Duration::from_millis(90_500));
        assert_eq!(
            err.to_string(),
            "timed out after 90s waiting for job volmigrate-mnt2-rsync-x"
        );
    }

    #[test]
    fn aggregate_lists_every_outcome_in_order() {
        let err = Error::AllStrategiesExhausted {
            outcomes: vec![
                StrategyOutcome {
                    strategy: "mnt2".to_string(),
                    failure: AttemptFailure::Skipped,
                },
                StrategyOutcome {
                    strategy: "svc".to_string(),
                    failure: AttemptFailure::Failed(Box::new(Error::strategy_execution(
                        "Job default/volmigrate-svc-rsync-abc",
                        "rsync exited 12",
                    ))),
                },
            ],
        };

        let msg = err.to_string();
        let skipped = msg.find("mnt2: skipped: not applicable").unwrap();
        let failed = msg
            .find("svc: workload Job default/volmigrate-svc-rsync-abc failed: rsync exited 12")
            .unwrap();
        assert!(skipped < failed);
    }

    #[test]
    fn kube_status_helpers_match_codes() {
        let conflict = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(is_already_exists(&conflict));
        assert!(!is_not_found(&conflict));
        assert!(!is_transient(&conflict));

        let unavailable = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: leader changed".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        });
        assert!(is_transient(&unavailable));
    }
}
