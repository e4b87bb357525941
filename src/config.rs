//! Session configuration.
//!
//! Defaults are usable as-is; [`SessionConfig::from_env`] lets deployments
//! tune the free-list depth and invocation limits without code changes.

use std::env;

use tracing::debug;

use crate::error::SessionError;

/// Environment variable overriding [`SessionConfig::free_list_depth`].
pub const ENV_FREE_LIST_DEPTH: &str = "STRATA_FREE_LIST_DEPTH";
/// Environment variable overriding [`SessionConfig::max_invoke_depth`]. Empty or `none` disables the cap.
pub const ENV_MAX_INVOKE_DEPTH: &str = "STRATA_MAX_INVOKE_DEPTH";
/// Environment variable overriding [`SessionConfig::record_trace`].
pub const ENV_RECORD_TRACE: &str = "STRATA_RECORD_TRACE";

/// Default number of cached buffers kept per free-list key.
pub const DEFAULT_FREE_LIST_DEPTH: usize = 5;

/// Tunables shared by the memory manager and the session executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bounded depth of each per-key free list. Zero disables caching.
    pub free_list_depth: usize,
    /// Optional cap on nested sub-graph invocations. `None` leaves recursion
    /// to the composing application.
    pub max_invoke_depth: Option<usize>,
    /// Whether executed operations are recorded in the result trace.
    pub record_trace: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            free_list_depth: DEFAULT_FREE_LIST_DEPTH,
            max_invoke_depth: None,
            record_trace: true,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SessionError> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SessionError::Config(format!(
            "{}: expected a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, SessionError> {
    value.trim().parse::<usize>().map_err(|_| {
        SessionError::Config(format!(
            "{}: expected a non-negative integer, got '{}'",
            key, value
        ))
    })
}

impl SessionConfig {
    /// Build a config from defaults overridden by `STRATA_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SessionError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_FREE_LIST_DEPTH).filter(|v| !v.trim().is_empty()) {
            config.free_list_depth = parse_usize(ENV_FREE_LIST_DEPTH, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_INVOKE_DEPTH).filter(|v| !v.trim().is_empty()) {
            config.max_invoke_depth = if value.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_usize(ENV_MAX_INVOKE_DEPTH, &value)?)
            };
        }
        if let Some(value) = lookup(ENV_RECORD_TRACE).filter(|v| !v.trim().is_empty()) {
            config.record_trace = parse_bool(ENV_RECORD_TRACE, &value)?;
        }

        debug!(?config, "Loaded session config");
        Ok(config)
    }

    /// Builder-style override of the free-list depth.
    pub fn with_free_list_depth(mut self, depth: usize) -> Self {
        self.free_list_depth = depth;
        self
    }

    /// Builder-style override of the invocation depth cap.
    pub fn with_max_invoke_depth(mut self, depth: Option<usize>) -> Self {
        self.max_invoke_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.free_list_depth, 5);
        assert_eq!(config.max_invoke_depth, None);
        assert!(config.record_trace);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            (ENV_FREE_LIST_DEPTH, "2"),
            (ENV_MAX_INVOKE_DEPTH, "16"),
            (ENV_RECORD_TRACE, "off"),
        ]))
        .unwrap();
        assert_eq!(config.free_list_depth, 2);
        assert_eq!(config.max_invoke_depth, Some(16));
        assert!(!config.record_trace);
    }

    #[test]
    fn test_blank_and_none_values() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            (ENV_FREE_LIST_DEPTH, "  "),
            (ENV_MAX_INVOKE_DEPTH, "none"),
        ]))
        .unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_invalid_depth_is_config_error() {
        let err = SessionConfig::from_lookup(lookup_from(&[(ENV_FREE_LIST_DEPTH, "-1")])).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(err.to_string().contains(ENV_FREE_LIST_DEPTH));
    }

    #[test]
    fn test_invalid_bool_is_config_error() {
        let err = SessionConfig::from_lookup(lookup_from(&[(ENV_RECORD_TRACE, "maybe")])).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_builder_overrides() {
        let config = SessionConfig::default()
            .with_free_list_depth(0)
            .with_max_invoke_depth(Some(3));
        assert_eq!(config.free_list_depth, 0);
        assert_eq!(config.max_invoke_depth, Some(3));
    }
}
