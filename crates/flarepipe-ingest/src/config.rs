//! Pipeline configuration
//!
//! Built once at start from environment variables (a `.env` file is loaded
//! by the binary first) and passed by reference from then on.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use flarepipe_common::env;

use crate::error::ConfigError;

pub const DEFAULT_DNS_DOMAINS: &[&str] = &[
    "google.com",
    "github.com",
    "cloudflare.com",
    "amazon.com",
    "microsoft.com",
];

/// Largest page the NVD API will serve
pub const NVD_MAX_PAGE_SIZE: u64 = 2000;

/// Ten years
pub const MAX_LOOKBACK_HOURS: u64 = 87_600;

/// Document store connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/flarepipe".to_string(),
            max_connections: 2,
            connect_timeout_secs: 5,
        }
    }
}

/// HTTP and retry behaviour shared by all sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Attempts per request, including the first
    pub retry_attempts: u32,
    /// Delay before the second attempt, in seconds; doubles after that
    pub retry_delay_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            retry_attempts: 3,
            retry_delay_secs: 2,
            user_agent: format!("flarepipe/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub url: String,
    pub rate_interval_ms: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://1.1.1.1/cdn-cgi/trace".to_string(),
            rate_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    pub enabled: bool,
    pub url: String,
    /// One query per domain, in order
    pub domains: Vec<String>,
    /// Record type sent as the `type` parameter (A, AAAA, MX, ...)
    pub record_type: String,
    pub rate_interval_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://cloudflare-dns.com/dns-query".to_string(),
            domains: DEFAULT_DNS_DOMAINS.iter().map(|d| d.to_string()).collect(),
            record_type: "A".to_string(),
            rate_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedConfig {
    pub enabled: bool,
    pub url: String,
    pub iterations: u32,
    /// Payload size requested via `bytes`; upstream default when unset
    pub download_bytes: Option<u64>,
    pub rate_interval_ms: u64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://speed.cloudflare.com/__down".to_string(),
            iterations: 3,
            download_bytes: None,
            rate_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvdConfig {
    pub enabled: bool,
    pub url: String,
    pub api_key: Option<String>,
    /// Start of the last-modified window; `lookback_hours` before the end when unset
    pub last_mod_start: Option<DateTime<Utc>>,
    /// End of the last-modified window; run start when unset
    pub last_mod_end: Option<DateTime<Utc>>,
    pub lookback_hours: u64,
    pub page_size: u64,
    pub max_pages: u32,
    pub rate_interval_ms: u64,
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
            api_key: None,
            last_mod_start: None,
            last_mod_end: None,
            lookback_hours: 24,
            page_size: NVD_MAX_PAGE_SIZE,
            max_pages: 50,
            rate_interval_ms: 6000,
        }
    }
}

/// Complete static configuration of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub trace: TraceConfig,
    pub dns: DnsConfig,
    pub speed: SpeedConfig,
    pub nvd: NvdConfig,
}

/// Accept RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC)
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
        .ok_or_else(|| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))
}

fn timestamp_var(name: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
    match env::var(name)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .map_err(|reason| ConfigError::Invalid(format!("{name}: {reason}"))),
        None => Ok(None),
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables, then validate it
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            database: DatabaseConfig {
                url: env::string_or("DATABASE_URL", &defaults.database.url)?,
                max_connections: env::parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
                connect_timeout_secs: env::parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    defaults.database.connect_timeout_secs,
                )?,
            },
            http: HttpConfig {
                request_timeout_secs: env::parse_or(
                    "REQUEST_TIMEOUT",
                    defaults.http.request_timeout_secs,
                )?,
                retry_attempts: env::parse_or("RETRY_ATTEMPTS", defaults.http.retry_attempts)?,
                retry_delay_secs: env::parse_or("RETRY_DELAY", defaults.http.retry_delay_secs)?,
                user_agent: env::string_or("HTTP_USER_AGENT", &defaults.http.user_agent)?,
            },
            trace: TraceConfig {
                enabled: env::bool_or("INCLUDE_TRACE", defaults.trace.enabled)?,
                url: env::string_or("CLOUDFLARE_TRACE_URL", &defaults.trace.url)?,
                rate_interval_ms: env::parse_or(
                    "TRACE_RATE_INTERVAL_MS",
                    defaults.trace.rate_interval_ms,
                )?,
            },
            dns: DnsConfig {
                enabled: env::bool_or("INCLUDE_DNS", defaults.dns.enabled)?,
                url: env::string_or("CLOUDFLARE_DOH_URL", &defaults.dns.url)?,
                domains: env::list_or("DNS_DOMAINS", DEFAULT_DNS_DOMAINS)?,
                record_type: env::string_or("DNS_RECORD_TYPE", &defaults.dns.record_type)?,
                rate_interval_ms: env::parse_or(
                    "DNS_RATE_INTERVAL_MS",
                    defaults.dns.rate_interval_ms,
                )?,
            },
            speed: SpeedConfig {
                enabled: env::bool_or("INCLUDE_SPEED", defaults.speed.enabled)?,
                url: env::string_or("CLOUDFLARE_SPEED_URL", &defaults.speed.url)?,
                iterations: env::parse_or("SPEED_ITERATIONS", defaults.speed.iterations)?,
                download_bytes: env::parse_opt("SPEED_DOWNLOAD_BYTES")?,
                rate_interval_ms: env::parse_or(
                    "SPEED_RATE_INTERVAL_MS",
                    defaults.speed.rate_interval_ms,
                )?,
            },
            nvd: NvdConfig {
                enabled: env::bool_or("INCLUDE_NVD", defaults.nvd.enabled)?,
                url: env::string_or("NVD_CVE_URL", &defaults.nvd.url)?,
                api_key: env::var("NVD_API_KEY")?,
                last_mod_start: timestamp_var("NVD_LAST_MOD_START")?,
                last_mod_end: timestamp_var("NVD_LAST_MOD_END")?,
                lookback_hours: env::parse_or("NVD_LOOKBACK_HOURS", defaults.nvd.lookback_hours)?,
                page_size: env::parse_or("NVD_PAGE_SIZE", defaults.nvd.page_size)?,
                max_pages: env::parse_or("NVD_MAX_PAGES", defaults.nvd.max_pages)?,
                rate_interval_ms: env::parse_or(
                    "NVD_RATE_INTERVAL_MS",
                    defaults.nvd.rate_interval_ms,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could succeed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |message: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(message.to_string())) };

        if self.database.max_connections == 0 {
            return invalid("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        if self.http.request_timeout_secs == 0 {
            return invalid("REQUEST_TIMEOUT must be greater than 0");
        }
        if self.http.retry_attempts == 0 {
            return invalid("RETRY_ATTEMPTS must be at least 1");
        }
        if !self.any_enabled() {
            return invalid("at least one source must be enabled");
        }

        for (name, enabled, url) in [
            ("CLOUDFLARE_TRACE_URL", self.trace.enabled, &self.trace.url),
            ("CLOUDFLARE_DOH_URL", self.dns.enabled, &self.dns.url),
            ("CLOUDFLARE_SPEED_URL", self.speed.enabled, &self.speed.url),
            ("NVD_CVE_URL", self.nvd.enabled, &self.nvd.url),
        ] {
            if enabled && reqwest::Url::parse(url).is_err() {
                return Err(ConfigError::Invalid(format!("{name} is not a valid URL: {url}")));
            }
        }

        if self.dns.enabled && self.dns.domains.is_empty() {
            return invalid("DNS_DOMAINS must list at least one domain");
        }
        if self.speed.enabled && self.speed.iterations == 0 {
            return invalid("SPEED_ITERATIONS must be greater than 0");
        }
        if self.nvd.enabled {
            if self.nvd.page_size == 0 || self.nvd.page_size > NVD_MAX_PAGE_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "NVD_PAGE_SIZE must be between 1 and {NVD_MAX_PAGE_SIZE}"
                )));
            }
            if self.nvd.lookback_hours == 0 || self.nvd.lookback_hours > MAX_LOOKBACK_HOURS {
                return Err(ConfigError::Invalid(format!(
                    "NVD_LOOKBACK_HOURS must be between 1 and {MAX_LOOKBACK_HOURS}"
                )));
            }
            if self.nvd.max_pages == 0 {
                return invalid("NVD_MAX_PAGES must be greater than 0");
            }
            match (self.nvd.last_mod_start, self.nvd.last_mod_end) {
                (Some(start), Some(end)) if start >= end => {
                    return invalid("NVD_LAST_MOD_START must be before NVD_LAST_MOD_END");
                },
                (Some(start), None) if start >= Utc::now() => {
                    return invalid("NVD_LAST_MOD_START must be in the past when NVD_LAST_MOD_END is unset");
                },
                _ => {},
            }
        }

        Ok(())
    }

    pub fn any_enabled(&self) -> bool {
        self.trace.enabled || self.dns.enabled || self.speed.enabled || self.nvd.enabled
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.http.retry_delay_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "RETRY_ATTEMPTS",
        "INCLUDE_TRACE",
        "INCLUDE_DNS",
        "INCLUDE_SPEED",
        "INCLUDE_NVD",
        "DNS_DOMAINS",
        "SPEED_ITERATIONS",
        "NVD_LAST_MOD_START",
        "NVD_LAST_MOD_END",
        "NVD_PAGE_SIZE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dns.domains.len(), 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert!(!config.nvd.enabled);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://db.internal/etl");
        std::env::set_var("RETRY_ATTEMPTS", "5");
        std::env::set_var("INCLUDE_SPEED", "false");
        std::env::set_var("DNS_DOMAINS", "example.com, example.org");
        std::env::set_var("NVD_LAST_MOD_START", "2024-03-01");

        let config = PipelineConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.database.url, "postgresql://db.internal/etl");
        assert_eq!(config.http.retry_attempts, 5);
        assert!(!config.speed.enabled);
        assert_eq!(config.dns.domains, vec!["example.com", "example.org"]);
        assert_eq!(
            config.nvd.last_mod_start,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        std::env::set_var("SPEED_ITERATIONS", "many");
        assert!(PipelineConfig::from_env().is_err());
        clear_env();

        std::env::set_var("NVD_LAST_MOD_START", "last tuesday");
        assert!(PipelineConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_nothing_enabled() {
        let mut config = PipelineConfig::default();
        config.trace.enabled = false;
        config.dns.enabled = false;
        config.speed.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_nvd_window_and_page_size() {
        let mut config = PipelineConfig::default();
        config.nvd.enabled = true;
        config.nvd.page_size = 5000;
        assert!(config.validate().is_err());

        config.nvd.page_size = 100;
        config.nvd.last_mod_start = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        config.nvd.last_mod_end = Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        assert!(config.validate().is_err());

        config.nvd.last_mod_end = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_future_start_without_end() {
        let mut config = PipelineConfig::default();
        config.nvd.enabled = true;
        config.nvd.last_mod_start = Some(Utc::now() + chrono::Duration::days(1));
        assert!(config.validate().is_err());

        config.nvd.last_mod_end = Some(Utc::now() + chrono::Duration::days(2));
        assert!(config.validate().is_ok());

        config.nvd.last_mod_start = Some(Utc::now() - chrono::Duration::days(1));
        config.nvd.last_mod_end = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = PipelineConfig::default();
        config.trace.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp("2024-01-02T03:04:05+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 1, 4, 5).unwrap()
        );
        assert!(parse_timestamp("02/01/2024").is_err());
    }
}
