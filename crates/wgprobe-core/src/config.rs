//! Environment-driven configuration.
//!
//! Read once at startup. Tests go through [`ProbeConfig::from_lookup`] so they
//! never touch the process environment.

use tracing::warn;

pub const PERF_ENABLED_ENV: &str = "PERF_ENABLED";
pub const CSV_ENV: &str = "CSV";
pub const VARIABLE_GROUP_SIZE_ENV: &str = "USE_VARIABLE_GROUP_SIZE";

/// Fixed path of the CSV report, relative to the working directory.
pub const STATS_CSV_PATH: &str = "stats.csv";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Counter acquisition on. Off means one unmeasured dispatch.
    pub perf_enabled: bool,
    /// Append reports to [`STATS_CSV_PATH`] instead of printing text.
    pub csv: bool,
    /// Legacy backend: supply the work-group size at dispatch time.
    pub variable_group_size: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            perf_enabled: true,
            csv: false,
            variable_group_size: false,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |name: &str, default: bool| match lookup(name) {
            None => default,
            Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                warn!(variable = name, value = %raw, "unrecognised flag value, treating as off");
                false
            }),
        };
        Self {
            perf_enabled: flag(PERF_ENABLED_ENV, defaults.perf_enabled),
            csv: flag(CSV_ENV, defaults.csv),
            variable_group_size: flag(VARIABLE_GROUP_SIZE_ENV, defaults.variable_group_size),
        }
    }

    /// CSV only applies when there is something to report.
    pub fn csv_report(&self) -> bool {
        self.perf_enabled && self.csv
    }
}

/// Interpret a flag value. Integers count as on when positive.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "" | "0" | "false" | "no" | "off" => Some(false),
        "1" | "true" | "yes" | "on" => Some(true),
        other => other.parse::<i64>().ok().map(|n| n > 0),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ProbeConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProbeConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_measure_and_print_text() {
        let config = config_from(&[]);
        assert_eq!(config, ProbeConfig::default());
        assert!(config.perf_enabled);
        assert!(!config.csv_report());
    }

    #[test]
    fn perf_can_be_disabled() {
        for value in ["0", "false", "OFF", "no", ""] {
            let config = config_from(&[(PERF_ENABLED_ENV, value)]);
            assert!(!config.perf_enabled, "value {value:?} should disable");
        }
    }

    #[test]
    fn positive_integers_enable() {
        let config = config_from(&[(CSV_ENV, "2"), (VARIABLE_GROUP_SIZE_ENV, "yes")]);
        assert!(config.csv);
        assert!(config.variable_group_size);
        assert_eq!(parse_flag("-1"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn csv_is_ignored_without_measurement() {
        let config = config_from(&[(PERF_ENABLED_ENV, "0"), (CSV_ENV, "1")]);
        assert!(config.csv);
        assert!(!config.csv_report());
    }
}
