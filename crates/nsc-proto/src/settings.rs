//! Environment setting lookup.

use std::str::FromStr;

use crate::error::ProtoError;

/// Environment variable holding the default response timeout in milliseconds.
pub const DEFAULT_RESPONSE_TIMEOUT: &str = "DEFAULT_RESPONSE_TIMEOUT";

/// Historical spelling of [`DEFAULT_RESPONSE_TIMEOUT`], still honoured.
pub const DEFAULT_RESPONSE_TIMEOUT_LEGACY: &str = "DEFAULT_REPONSE_TIMEOUT";

/// Endpoint of the tracing agent.
pub const OTEL_AGENT: &str = "OTEL_AGENT";

/// Deployment environment; `local` disables the orchestration probe.
pub const ENVIRONMENT: &str = "ENVIRONMENT";

/// Reads an optional environment setting. Empty values count as absent.
#[must_use]
pub fn setting_from_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Reads a required environment setting.
pub fn required_setting(name: &str) -> Result<String, ProtoError> {
    setting_from_env(name).ok_or_else(|| ProtoError::MissingSetting(name.to_string()))
}

/// Reads and parses an optional environment setting.
pub fn parsed_setting<T>(name: &str) -> Result<Option<T>, ProtoError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    setting_from_env(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ProtoError::InvalidSetting {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

/// Reads the default response timeout, accepting either spelling.
pub fn default_response_timeout_ms() -> Result<Option<u64>, ProtoError> {
    match parsed_setting::<u64>(DEFAULT_RESPONSE_TIMEOUT)? {
        Some(ms) => Ok(Some(ms)),
        None => parsed_setting::<u64>(DEFAULT_RESPONSE_TIMEOUT_LEGACY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_setting_is_an_error() {
        let err = required_setting("NSC_PROTO_TEST_SURELY_UNSET").unwrap_err();
        assert!(matches!(err, ProtoError::MissingSetting(name) if name == "NSC_PROTO_TEST_SURELY_UNSET"));
    }

    #[test]
    fn unparsable_setting_is_reported() {
        std::env::set_var("NSC_PROTO_TEST_BAD_NUMBER", "soon");
        let err = parsed_setting::<u64>("NSC_PROTO_TEST_BAD_NUMBER").unwrap_err();
        assert!(matches!(err, ProtoError::InvalidSetting { .. }));
    }

    #[test]
    fn empty_setting_is_absent() {
        std::env::set_var("NSC_PROTO_TEST_EMPTY", "");
        assert_eq!(setting_from_env("NSC_PROTO_TEST_EMPTY"), None);
    }
}
