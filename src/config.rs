use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::storage::Entitlement;

const DEFAULT_API_BASE: &str = "https://queue.fal.run";
const DEFAULT_GENERATION_MODEL: &str = "fal-ai/flux-pro/kontext";
const DEFAULT_ENHANCEMENT_MODEL: &str = "fal-ai/clarity-upscaler";
const DEFAULT_BUCKET: &str = "generated-images";

/// Bounds for the re-encoded source image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePrepConfig {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality factor in `0.0..=1.0`.
    pub quality: f32,
}

impl Default for ImagePrepConfig {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
            quality: 0.8,
        }
    }
}

/// Cadence and progress range of a poll loop.
///
/// The wait before attempt `n` (1-based) is `base + step * (n - 1)`, capped
/// at `cap`. The loop gives up after `max_attempts` status checks.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub base_interval: Duration,
    pub step: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub progress_floor: u8,
    pub progress_ceiling: u8,
}

impl PollSchedule {
    pub fn generation() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            step: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_attempts: 60,
            progress_floor: 10,
            progress_ceiling: 90,
        }
    }

    pub fn enhancement() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            step: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            max_attempts: 24,
            progress_floor: 10,
            progress_ceiling: 95,
        }
    }

    pub fn interval(&self, attempt: u32) -> Duration {
        let grown = self.base_interval + self.step * attempt.saturating_sub(1);
        grown.min(self.max_interval)
    }

    /// Sum of all waits when every attempt is used.
    pub fn worst_case_wait(&self) -> Duration {
        (1..=self.max_attempts).map(|attempt| self.interval(attempt)).sum()
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn submission() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        }
    }

    pub fn status_check() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Remote model addressed under the queue base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEndpoint {
    pub model: String,
    pub schedule: PollSchedule,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_base: String,
    pub generation: JobEndpoint,
    pub enhancement: JobEndpoint,
    pub image: ImagePrepConfig,
    pub submit_retry: RetryPolicy,
    pub status_retry: RetryPolicy,
    pub request_timeout: Duration,
    pub auto_save: bool,
    pub storage_bucket: String,
    /// Runs without a user id skip quota and persistence; off unless set
    pub allow_anonymous: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            generation: JobEndpoint {
                model: DEFAULT_GENERATION_MODEL.to_string(),
                schedule: PollSchedule::generation(),
            },
            enhancement: JobEndpoint {
                model: DEFAULT_ENHANCEMENT_MODEL.to_string(),
                schedule: PollSchedule::enhancement(),
            },
            image: ImagePrepConfig::default(),
            submit_retry: RetryPolicy::submission(),
            status_retry: RetryPolicy::status_check(),
            request_timeout: Duration::from_secs(30),
            auto_save: true,
            storage_bucket: DEFAULT_BUCKET.to_string(),
            allow_anonymous: false,
        }
    }
}

/// Plan written to the entitlement records at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanGrant {
    pub user_id: String,
    pub entitlement: Entitlement,
}

impl PlanGrant {
    /// Reads `PLAN_GRANT_USER`, `PLAN_GRANT_PRODUCT` and the optional RFC 3339
    /// `PLAN_GRANT_EXPIRES_AT`. An unparseable expiry drops the grant.
    fn from_env() -> Option<Self> {
        Self::parse(
            env_string("PLAN_GRANT_USER"),
            env_string("PLAN_GRANT_PRODUCT"),
            env_string("PLAN_GRANT_EXPIRES_AT"),
        )
    }

    fn parse(
        user_id: Option<String>,
        product_id: Option<String>,
        expires_at: Option<String>,
    ) -> Option<Self> {
        let expires_at = match expires_at {
            Some(raw) => Some(DateTime::parse_from_rfc3339(&raw).ok()?.with_timezone(&Utc)),
            None => None,
        };
        Some(Self {
            user_id: user_id?,
            entitlement: Entitlement {
                product_id: product_id?,
                expires_at,
            },
        })
    }
}

/// Process-level settings for the MCP server binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub secret_key: Option<String>,
    pub storage_dir: PathBuf,
    pub storage_base_url: String,
    pub api_key: Option<String>,
    pub log_level: String,
    pub plan_grant: Option<PlanGrant>,
    pub pipeline: PipelineConfig,
}

impl Settings {
    pub fn from_env() -> Self {
        let port = env_parse("MCP_PORT").unwrap_or(3000);
        let bind_address = format!("0.0.0.0:{port}");
        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            api_base: env_string("GENERATION_API_BASE").unwrap_or(defaults.api_base),
            generation: JobEndpoint {
                model: env_string("GENERATION_MODEL").unwrap_or(defaults.generation.model),
                ..defaults.generation
            },
            enhancement: JobEndpoint {
                model: env_string("ENHANCEMENT_MODEL").unwrap_or(defaults.enhancement.model),
                ..defaults.enhancement
            },
            image: ImagePrepConfig {
                max_width: env_dimension("IMAGE_MAX_WIDTH").unwrap_or(defaults.image.max_width),
                max_height: env_dimension("IMAGE_MAX_HEIGHT").unwrap_or(defaults.image.max_height),
                quality: env_parse::<f32>("IMAGE_QUALITY")
                    .map(|value| value.clamp(0.05, 1.0))
                    .unwrap_or(defaults.image.quality),
            },
            request_timeout: env_parse("REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            auto_save: env_parse("AUTO_SAVE").unwrap_or(defaults.auto_save),
            storage_bucket: env_string("STORAGE_BUCKET").unwrap_or(defaults.storage_bucket),
            allow_anonymous: env_parse("ALLOW_ANONYMOUS").unwrap_or(defaults.allow_anonymous),
            ..defaults
        };

        Self {
            port,
            secret_key: env_string("SECRET_KEY"),
            storage_dir: resolve_storage_dir(),
            storage_base_url: resolve_storage_base_url(&bind_address),
            api_key: env_string("GENERATION_API_KEY"),
            log_level: env_string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            plan_grant: PlanGrant::from_env(),
            pipeline,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Route prefix, optionally hidden behind the secret key.
    pub fn route(&self, path: &str) -> String {
        match self.secret_key.as_deref() {
            Some(secret) => format!("/{secret}{path}"),
            None => path.to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

fn env_dimension(key: &str) -> Option<u32> {
    env_string(key).and_then(|value| parse_dimension(&value))
}

/// A pixel bound; zero is rejected so resizing always has room for one pixel.
fn parse_dimension(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|value| *value >= 1)
}

fn resolve_storage_dir() -> PathBuf {
    if let Some(dir) = env_string("STORAGE_DIR") {
        return PathBuf::from(dir);
    }
    let mut base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("scene-gen-rmcp");
    base
}

fn resolve_storage_base_url(bind_address: &str) -> String {
    if let Some(storage_url) = env_string("STORAGE_URL") {
        return format!("{}/storage", storage_url.trim_end_matches('/'));
    }
    let domain = env_string("DOMAIN").unwrap_or_else(|| bind_address.to_string());
    format!("{}/storage", normalize_base_url(&domain))
}

/// Ensures a single http(s) scheme and no trailing slash.
pub fn normalize_base_url(raw: &str) -> String {
    let mut rest = raw.trim().trim_end_matches('/');
    let mut scheme = None;
    loop {
        if let Some(stripped) = rest.strip_prefix("https://") {
            scheme = Some("https");
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("http://") {
            // the innermost scheme wins, as it is the one the user typed
            scheme = Some("http");
            rest = stripped;
        } else {
            break;
        }
    }
    format!("{}://{}", scheme.unwrap_or("http"), rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_schedule_grows_to_cap() {
        let schedule = PollSchedule::generation();
        assert_eq!(schedule.interval(1), Duration::from_secs(2));
        assert_eq!(schedule.interval(2), Duration::from_millis(2500));
        assert_eq!(schedule.interval(7), Duration::from_secs(5));
        assert_eq!(schedule.interval(60), Duration::from_secs(5));
    }

    #[test]
    fn test_schedules_stay_near_five_minutes() {
        for schedule in [PollSchedule::generation(), PollSchedule::enhancement()] {
            let total = schedule.worst_case_wait();
            assert!(total >= Duration::from_secs(240), "{total:?}");
            assert!(total <= Duration::from_secs(330), "{total:?}");
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::submission();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(8), Duration::from_secs(4));
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.image.max_width, 1024);
        assert_eq!(config.image.max_height, 1024);
        assert!((config.image.quality - 0.8).abs() < f32::EPSILON);
        assert!(config.auto_save);
        assert!(!config.allow_anonymous);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.generation.schedule.max_attempts, 60);
    }

    #[test]
    fn test_dimension_bounds_must_be_positive() {
        assert_eq!(parse_dimension("800"), Some(800));
        assert_eq!(parse_dimension(" 1 "), Some(1));
        assert_eq!(parse_dimension("0"), None);
        assert_eq!(parse_dimension("-5"), None);
        assert_eq!(parse_dimension("wide"), None);
    }

    #[test]
    fn test_plan_grant_parsing() {
        let grant = PlanGrant::parse(
            Some("alice".into()),
            Some("pro_monthly".into()),
            Some("2026-11-01T00:00:00Z".into()),
        )
        .unwrap();
        assert_eq!(grant.user_id, "alice");
        assert_eq!(grant.entitlement.product_id, "pro_monthly");
        assert_eq!(
            grant.entitlement.expires_at.unwrap().to_rfc3339(),
            "2026-11-01T00:00:00+00:00"
        );

        assert!(PlanGrant::parse(Some("alice".into()), Some("pro_yearly".into()), None)
            .is_some_and(|grant| grant.entitlement.expires_at.is_none()));
        assert_eq!(PlanGrant::parse(Some("alice".into()), None, None), None);
        assert_eq!(
            PlanGrant::parse(Some("alice".into()), Some("pro".into()), Some("soon".into())),
            None
        );
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("example.com/"), "http://example.com");
        assert_eq!(normalize_base_url("https://example.com"), "https://example.com");
        assert_eq!(
            normalize_base_url("http://https://example.com"),
            "https://example.com"
        );
        assert_eq!(
            normalize_base_url("https://http://example.com"),
            "http://example.com"
        );
    }
}
