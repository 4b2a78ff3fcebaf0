//! Deadline arithmetic.
//!
//! Deadlines are absolute epoch milliseconds. Along a call chain a deadline
//! never grows: the next hop gets `min(inherited, now + own_timeout)`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProtoError;
use crate::settings;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Computes the absolute deadline for an outgoing call.
///
/// - inherited and own: the earlier of `inherited` and `now + own`
/// - inherited only: `inherited`
/// - own only: `now + own`
/// - neither: `now + default`, or [`ProtoError::MissingSetting`] when no
///   default response timeout is configured
pub fn compute_deadline(
    inherited: Option<u64>,
    own: Option<Duration>,
    default: Option<Duration>,
) -> Result<u64, ProtoError> {
    let now = now_ms();
    match (inherited, own) {
        (Some(inherited), Some(own)) => Ok(inherited.min(now.saturating_add(millis(own)))),
        (Some(inherited), None) => Ok(inherited),
        (None, Some(own)) => Ok(now.saturating_add(millis(own))),
        (None, None) => default
            .map(|d| now.saturating_add(millis(d)))
            .ok_or_else(|| ProtoError::MissingSetting(settings::DEFAULT_RESPONSE_TIMEOUT.into())),
    }
}

/// Returns true once `expired` is at or before the current time.
#[must_use]
pub fn is_expired(expired: u64) -> bool {
    expired <= now_ms()
}

/// Time left until `expired`, or `None` when it has already passed.
#[must_use]
pub fn remaining(expired: u64) -> Option<Duration> {
    let now = now_ms();
    (expired > now).then(|| Duration::from_millis(expired - now))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Deadline policy with the process-wide default response timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlinePolicy {
    default_timeout: Option<Duration>,
}

impl DeadlinePolicy {
    /// Creates a policy with an explicit default timeout.
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout: Some(default_timeout),
        }
    }

    /// Creates a policy with no default; calls without any timeout fail.
    #[must_use]
    pub const fn without_default() -> Self {
        Self {
            default_timeout: None,
        }
    }

    /// Loads the default from `DEFAULT_RESPONSE_TIMEOUT`.
    pub fn from_env() -> Result<Self, ProtoError> {
        Ok(Self {
            default_timeout: settings::default_response_timeout_ms()?.map(Duration::from_millis),
        })
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Fails when no default is configured.
    pub fn require_default(&self) -> Result<Duration, ProtoError> {
        self.default_timeout
            .ok_or_else(|| ProtoError::MissingSetting(settings::DEFAULT_RESPONSE_TIMEOUT.into()))
    }

    /// See [`compute_deadline`].
    pub fn deadline(&self, inherited: Option<u64>, own: Option<Duration>) -> Result<u64, ProtoError> {
        compute_deadline(inherited, own, self.default_timeout)
    }
}
