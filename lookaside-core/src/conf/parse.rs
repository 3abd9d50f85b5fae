use crate::balancer::ChildPolicyRegistry;
use crate::conf::error::ConfigError;
use crate::conf::types::{RawPolicyConfig, RlsConfig};
use crate::conf::validate::validate_config;
use std::sync::Arc;
use std::time::Duration;

/// Parses and validates a policy config from its JSON form.
///
/// The registry is needed up front so the selected child policy config can
/// be validated synchronously, before any target exists.
pub fn parse_config(
    json: &serde_json::Value,
    registry: &ChildPolicyRegistry,
) -> Result<Arc<RlsConfig>, ConfigError> {
    let raw: RawPolicyConfig = serde_json::from_value(json.clone())?;
    validate_config(raw, registry).map(Arc::new)
}

/// Parses a JSON duration string of the form `"10s"` or `"0.25s"`.
pub(crate) fn parse_duration(value: &str, field: &str) -> Result<Duration, ConfigError> {
    let seconds = value
        .strip_suffix('s')
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| ConfigError::field(field, format!("invalid duration \"{value}\"")))?;
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_whole_and_fractional_seconds() {
        assert_eq!(parse_duration("10s", "f").unwrap(), Duration::from_secs(10));
        assert_eq!(
            parse_duration("0.25s", "f").unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn durations_reject_garbage() {
        for bad in ["10", "s", "-1s", "10m", ""] {
            assert!(parse_duration(bad, "f").is_err(), "accepted {bad:?}");
        }
    }
}
