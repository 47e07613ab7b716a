//! Configuration management.
//!
//! Configuration is owned by the deployment: a TOML file provides the base,
//! environment variables override it, and builder methods cover tests and
//! embedding services.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default | Description |
//! |----------|------|---------|-------------|
//! | `ALERTGATE_RESERVATION_TTL_SECS` | u64 | `30` | Reservation lifetime |
//! | `ALERTGATE_CACHE_TTL_SECS` | u64 | `30` | Local cache entry lifetime |
//! | `ALERTGATE_CACHE_CAPACITY` | usize | `10000` | Local cache size |
//! | `ALERTGATE_DEDUP_WINDOW_SECS` | u64 | `300` | Default dedup window |
//! | `ALERTGATE_LOCK_TIMEOUT_MS` | u64 | `5000` | Lock acquisition deadline |
//! | `ALERTGATE_SEVERITIES` | list | `critical,warning,info` | Accepted severities |
//! | `ALERTGATE_DEDUP_WINDOW_<SEV>_SECS` | u64 | unset | Per-severity window |
//! | `ALERTGATE_RATE_LIMIT_<SEV>` | `N/SECS` | unset | Per-severity rate limit |

use crate::models::{DedupKey, MAX_FINGERPRINT_BYTES};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_SEVERITIES: [&str; 3] = ["critical", "warning", "info"];

/// Fixed-window rate limit for one severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum sends per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Creates a rate limit of `limit` sends per `window`.
    #[must_use]
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Parses the `N/SECS` form, e.g. `5/60`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is malformed or the window
    /// is zero.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("rate limit '{value}' is not N/SECS"));
        let (limit, secs) = value.trim().split_once('/').ok_or_else(invalid)?;
        let limit: u32 = limit.trim().parse().map_err(|_| invalid())?;
        let secs: u64 = secs.trim().parse().map_err(|_| invalid())?;
        if secs == 0 {
            return Err(invalid());
        }
        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

/// Per-severity overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityPolicy {
    /// Dedup window; falls back to [`DedupConfig::default_dedup_window`].
    pub dedup_window: Option<Duration>,
    /// Rate limit; `None` means unlimited.
    pub rate_limit: Option<RateLimitPolicy>,
}

/// Configuration for the deduplication coordinator.
///
/// # Example
///
/// ```rust
/// use alertgate::DedupConfig;
/// use std::time::Duration;
///
/// let config = DedupConfig::default()
///     .with_dedup_window("critical", Duration::from_secs(60))
///     .with_rate_limit("info", 5, Duration::from_secs(60));
///
/// assert_eq!(config.dedup_window("critical"), Duration::from_secs(60));
/// assert_eq!(config.dedup_window("warning"), Duration::from_secs(300));
/// assert!(config.rate_limit("critical").is_none());
/// assert!(config.validate_key("svc-cpu-high", "critical").is_ok());
/// assert!(config.validate_key("svc-cpu-high", "fatal").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Lifetime of a reservation before it expires unresolved.
    pub reservation_ttl: Duration,
    /// Lifetime of a local cache entry.
    pub cache_ttl: Duration,
    /// Maximum local cache entries.
    pub cache_capacity: usize,
    /// Dedup window for severities without an override.
    pub default_dedup_window: Duration,
    /// Deadline for acquiring the per-key lock.
    pub lock_timeout: Duration,
    /// Accepted severities and their policies.
    pub severities: BTreeMap<String, SeverityPolicy>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 10_000,
            default_dedup_window: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(5),
            severities: DEFAULT_SEVERITIES
                .iter()
                .map(|s| ((*s).to_string(), SeverityPolicy::default()))
                .collect(),
        }
    }
}

impl DedupConfig {
    /// Creates a configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Malformed values are logged and ignored so that one bad variable does
    /// not take the coordinator down.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secs) = parse_var::<u64>(&lookup, "ALERTGATE_RESERVATION_TTL_SECS") {
            self.reservation_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ALERTGATE_CACHE_TTL_SECS") {
            self.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "ALERTGATE_CACHE_CAPACITY") {
            self.cache_capacity = capacity.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ALERTGATE_DEDUP_WINDOW_SECS") {
            self.default_dedup_window = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "ALERTGATE_LOCK_TIMEOUT_MS") {
            self.lock_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(list) = lookup("ALERTGATE_SEVERITIES") {
            let names: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !names.is_empty() {
                let mut severities = BTreeMap::new();
                for name in names {
                    let policy = self.severities.get(&name).copied().unwrap_or_default();
                    severities.insert(name, policy);
                }
                self.severities = severities;
            }
        }

        for (name, policy) in &mut self.severities {
            let upper = name.to_uppercase();
            if let Some(secs) =
                parse_var::<u64>(&lookup, &format!("ALERTGATE_DEDUP_WINDOW_{upper}_SECS"))
            {
                policy.dedup_window = Some(Duration::from_secs(secs));
            }
            let var = format!("ALERTGATE_RATE_LIMIT_{upper}");
            if let Some(value) = lookup(&var) {
                match RateLimitPolicy::parse(&value) {
                    Ok(limit) => policy.rate_limit = Some(limit),
                    Err(e) => tracing::warn!(variable = %var, error = %e, "Ignoring rate limit"),
                }
            }
        }

        self
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_config_file(file)
    }

    /// Loads configuration from the platform config directory, then applies
    /// environment overrides.
    ///
    /// Looks for `alertgate/config.toml` under the platform config dir and
    /// falls back to defaults if it is missing or unreadable.
    #[must_use]
    pub fn load_default() -> Self {
        let base = directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("alertgate").join("config.toml"))
            .filter(|path| path.exists())
            .and_then(|path| match Self::load_from_file(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring config file");
                    None
                },
            });
        base.unwrap_or_default().with_env_overrides()
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = file.reservation_ttl_secs {
            config.reservation_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = file.cache_ttl_secs {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = file.cache_capacity {
            config.cache_capacity = capacity.max(1);
        }
        if let Some(secs) = file.dedup_window_secs {
            config.default_dedup_window = Duration::from_secs(secs);
        }
        if let Some(ms) = file.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(severities) = file.severities {
            config.severities.clear();
            for (name, section) in severities {
                let rate_limit = section
                    .rate_limit
                    .as_deref()
                    .map(RateLimitPolicy::parse)
                    .transpose()?;
                config.severities.insert(
                    name.to_lowercase(),
                    SeverityPolicy {
                        dedup_window: section.dedup_window_secs.map(Duration::from_secs),
                        rate_limit,
                    },
                );
            }
        }

        Ok(config)
    }

    /// Sets the reservation TTL.
    #[must_use]
    pub const fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Sets the local cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the lock acquisition deadline.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the default dedup window.
    #[must_use]
    pub const fn with_default_dedup_window(mut self, window: Duration) -> Self {
        self.default_dedup_window = window;
        self
    }

    /// Sets the dedup window for `severity`, adding the severity if needed.
    #[must_use]
    pub fn with_dedup_window(mut self, severity: &str, window: Duration) -> Self {
        self.severities
            .entry(severity.to_lowercase())
            .or_default()
            .dedup_window = Some(window);
        self
    }

    /// Sets the rate limit for `severity`, adding the severity if needed.
    #[must_use]
    pub fn with_rate_limit(mut self, severity: &str, limit: u32, window: Duration) -> Self {
        self.severities
            .entry(severity.to_lowercase())
            .or_default()
            .rate_limit = Some(RateLimitPolicy::new(limit, window));
        self
    }

    /// Returns the dedup window for `severity`.
    #[must_use]
    pub fn dedup_window(&self, severity: &str) -> Duration {
        self.severities
            .get(severity)
            .and_then(|policy| policy.dedup_window)
            .unwrap_or(self.default_dedup_window)
    }

    /// Returns the rate limit for `severity`, if any.
    #[must_use]
    pub fn rate_limit(&self, severity: &str) -> Option<RateLimitPolicy> {
        self.severities
            .get(severity)
            .and_then(|policy| policy.rate_limit)
    }

    /// Validates caller input and builds the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty or oversized fingerprint
    /// or a severity outside the configured set.
    pub fn validate_key(&self, fingerprint: &str, severity: &str) -> Result<DedupKey> {
        if fingerprint.is_empty() {
            return Err(Error::InvalidInput("fingerprint is empty".to_string()));
        }
        if fingerprint.len() > MAX_FINGERPRINT_BYTES {
            return Err(Error::InvalidInput(format!(
                "fingerprint is {} bytes, limit is {MAX_FINGERPRINT_BYTES}",
                fingerprint.len()
            )));
        }
        if !self.severities.contains_key(severity) {
            return Err(Error::InvalidInput(format!(
                "unknown severity '{severity}'"
            )));
        }
        Ok(DedupKey::new(fingerprint, severity))
    }
}

/// Converts a configured duration to a `chrono` duration, saturating.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = %name, value = %value, "Ignoring malformed variable");
            None
        },
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Reservation TTL in seconds.
    pub reservation_ttl_secs: Option<u64>,
    /// Local cache TTL in seconds.
    pub cache_ttl_secs: Option<u64>,
    /// Local cache capacity.
    pub cache_capacity: Option<usize>,
    /// Default dedup window in seconds.
    pub dedup_window_secs: Option<u64>,
    /// Lock deadline in milliseconds.
    pub lock_timeout_ms: Option<u64>,
    /// Severity table; replaces the default set when present.
    pub severities: Option<BTreeMap<String, ConfigFileSeverity>>,
}

/// Severity section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileSeverity {
    /// Dedup window in seconds.
    pub dedup_window_secs: Option<u64>,
    /// Rate limit in `N/SECS` form.
    pub rate_limit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.reservation_ttl, Duration::from_secs(30));
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.default_dedup_window, Duration::from_secs(300));
        assert_eq!(
            config.severities.keys().collect::<Vec<_>>(),
            vec!["critical", "info", "warning"]
        );
        assert!(config.rate_limit("critical").is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = DedupConfig::default().with_overrides_from(lookup(&[
            ("ALERTGATE_RESERVATION_TTL_SECS", "45"),
            ("ALERTGATE_DEDUP_WINDOW_SECS", "120"),
            ("ALERTGATE_SEVERITIES", "critical, page"),
            ("ALERTGATE_DEDUP_WINDOW_PAGE_SECS", "10"),
            ("ALERTGATE_RATE_LIMIT_CRITICAL", "5/60"),
            ("ALERTGATE_LOCK_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(config.reservation_ttl, Duration::from_secs(45));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.dedup_window("critical"), Duration::from_secs(120));
        assert_eq!(config.dedup_window("page"), Duration::from_secs(10));
        assert_eq!(
            config.rate_limit("critical"),
            Some(RateLimitPolicy::new(5, Duration::from_secs(60)))
        );
        assert!(config.validate_key("fp", "info").is_err());
        assert!(config.validate_key("fp", "page").is_ok());
    }

    #[test]
    fn test_malformed_env_is_ignored() {
        let config = DedupConfig::default().with_overrides_from(lookup(&[
            ("ALERTGATE_RESERVATION_TTL_SECS", "soon"),
            ("ALERTGATE_RATE_LIMIT_INFO", "lots"),
        ]));
        assert_eq!(config.reservation_ttl, Duration::from_secs(30));
        assert!(config.rate_limit("info").is_none());
    }

    #[test_case("5/60", Some((5, 60)))]
    #[test_case(" 10 / 1 ", Some((10, 1)))]
    #[test_case("0/30", Some((0, 30)))]
    #[test_case("5/0", None)]
    #[test_case("5", None)]
    #[test_case("x/60", None)]
    fn test_rate_limit_parse(input: &str, expected: Option<(u32, u64)>) {
        let parsed = RateLimitPolicy::parse(input).ok();
        assert_eq!(
            parsed,
            expected.map(|(n, s)| RateLimitPolicy::new(n, Duration::from_secs(s)))
        );
    }

    #[test]
    fn test_from_toml() {
        let config = DedupConfig::from_toml(
            r#"
            reservation_ttl_secs = 20
            dedup_window_secs = 600

            [severities.critical]
            dedup_window_secs = 60

            [severities.info]
            rate_limit = "5/60"
            "#,
        )
        .unwrap();

        assert_eq!(config.reservation_ttl, Duration::from_secs(20));
        assert_eq!(config.dedup_window("critical"), Duration::from_secs(60));
        assert_eq!(config.dedup_window("info"), Duration::from_secs(600));
        assert_eq!(config.rate_limit("info").map(|r| r.limit), Some(5));
        assert!(config.validate_key("fp", "warning").is_err());
    }

    #[test]
    fn test_from_toml_rejects_bad_rate_limit() {
        let result = DedupConfig::from_toml(
            r#"
            [severities.info]
            rate_limit = "often"
            "#,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "cache_capacity = 42\n").unwrap();
        let config = DedupConfig::load_from_file(&path).unwrap();
        assert_eq!(config.cache_capacity, 42);

        let missing = DedupConfig::load_from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::OperationFailed { .. })));
    }

    #[test]
    fn test_validate_key() {
        let config = DedupConfig::default();
        assert!(matches!(
            config.validate_key("", "critical"),
            Err(Error::InvalidInput(_))
        ));
        let long = "f".repeat(MAX_FINGERPRINT_BYTES + 1);
        assert!(config.validate_key(&long, "critical").is_err());
        let max = "f".repeat(MAX_FINGERPRINT_BYTES);
        assert!(config.validate_key(&max, "critical").is_ok());
        assert!(config.validate_key("fp", "CRITICAL").is_err());
    }

    #[test]
    fn test_chrono_duration_saturates() {
        assert_eq!(
            chrono_duration(Duration::from_secs(60)),
            chrono::Duration::seconds(60)
        );
        assert!(chrono_duration(Duration::MAX) > chrono::Duration::days(365));
    }
}
