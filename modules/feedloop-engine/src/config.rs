use std::env;
use std::fmt::Display;
use std::str::FromStr;

use tracing::info;
use typed_builder::TypedBuilder;

use crate::error::{LoopError, Result};

/// Broadcast buffer per gear when nothing else is configured.
pub const DEFAULT_GEAR_CAPACITY: usize = 1024;

/// Engine tuning knobs, loaded from environment variables.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    /// Events buffered per gear listener before the oldest are dropped.
    #[builder(default = DEFAULT_GEAR_CAPACITY)]
    pub gear_capacity: usize,
    /// OS thread-name prefix for dedicated execution contexts.
    #[builder(default = String::from("feedloop"), setter(into))]
    pub context_thread_prefix: String,
    /// Timer period for the demo counter loop.
    #[builder(default = 250)]
    pub demo_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineConfig {
    /// Load configuration from environment variables. Unset variables fall
    /// back to their defaults; malformed ones are rejected.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let gear_capacity = parsed(&lookup, "FEEDLOOP_GEAR_CAPACITY", defaults.gear_capacity)?;
        if gear_capacity == 0 {
            return Err(LoopError::Config {
                key: "FEEDLOOP_GEAR_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            gear_capacity,
            context_thread_prefix: lookup("FEEDLOOP_THREAD_PREFIX")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.context_thread_prefix),
            demo_tick_ms: parsed(&lookup, "FEEDLOOP_DEMO_TICK_MS", defaults.demo_tick_ms)?,
        })
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!(
            gear_capacity = self.gear_capacity,
            context_thread_prefix = self.context_thread_prefix.as_str(),
            demo_tick_ms = self.demo_tick_ms,
            "Engine configuration"
        );
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key).filter(|s| !s.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| LoopError::Config {
            key: key.to_string(),
            message: e.to_string(),
        }),
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
    fn missing_values_use_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.gear_capacity, DEFAULT_GEAR_CAPACITY);
        assert_eq!(config.context_thread_prefix, "feedloop");
        assert_eq!(config.demo_tick_ms, 250);
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("FEEDLOOP_GEAR_CAPACITY", "16"),
            ("FEEDLOOP_THREAD_PREFIX", "worker"),
            ("FEEDLOOP_DEMO_TICK_MS", " 40 "),
        ]))
        .unwrap();
        assert_eq!(config.gear_capacity, 16);
        assert_eq!(config.context_thread_prefix, "worker");
        assert_eq!(config.demo_tick_ms, 40);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("FEEDLOOP_DEMO_TICK_MS", "soon")]))
            .unwrap_err();
        match err {
            LoopError::Config { key, .. } => assert_eq!(key, "FEEDLOOP_DEMO_TICK_MS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_gear_capacity_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("FEEDLOOP_GEAR_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(err, LoopError::Config { .. }));
    }

    #[test]
    fn builder_overrides_single_field() {
        let config = EngineConfig::builder().gear_capacity(8).build();
        assert_eq!(config.gear_capacity, 8);
        assert_eq!(config.context_thread_prefix, "feedloop");
    }
}
