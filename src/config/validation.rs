use crate::config::types::{
    BackoffConfig, CircuitBreakerConfig, Config, ExecutorConfig, FetchConfig, HealthConfig,
    PacingConfig, SourceConfig, StalenessConfig, StorageConfig,
};
use crate::ConfigError;
use url::Url;

/// Upper bound for the fan-out limit
const MAX_CONCURRENCY: usize = 64;

/// Upper bound for lightweight attempts per target
const MAX_LIGHTWEIGHT_ATTEMPTS: u32 = 20;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_source_config(&config.source)?;
    validate_fetch_config(&config.fetch)?;
    validate_pacing_config(&config.pacing)?;
    validate_backoff_config(&config.backoff)?;
    validate_circuit_breaker_config(&config.circuit_breaker)?;
    validate_staleness_config(&config.staleness)?;
    validate_executor_config(&config.executor)?;
    validate_health_config(&config.health)?;
    validate_storage_config(&config.storage)?;
    Ok(())
}

/// Validates the source description
fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    if !config.detail_url_template.contains("{id}") {
        return Err(ConfigError::Validation(format!(
            "detail-url-template must contain an {{id}} placeholder, got '{}'",
            config.detail_url_template
        )));
    }

    validate_http_url(&config.detail_url("sample"))?;

    if config.task_kind.trim().is_empty() {
        return Err(ConfigError::Validation(
            "task-kind cannot be empty".to_string(),
        ));
    }

    if config.scraper_type.trim().is_empty() {
        return Err(ConfigError::Validation(
            "scraper-type cannot be empty".to_string(),
        ));
    }

    if let Some(blank) = config.identifiers.iter().position(|id| id.trim().is_empty()) {
        return Err(ConfigError::Validation(format!(
            "identifiers[{}] cannot be empty",
            blank
        )));
    }

    if let Some(field) = &config.terminal_field {
        if field.is_empty() {
            return Err(ConfigError::Validation(
                "terminal-field cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validates fetch chain settings
fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.max_lightweight_attempts < 1 || config.max_lightweight_attempts > MAX_LIGHTWEIGHT_ATTEMPTS {
        return Err(ConfigError::Validation(format!(
            "max-lightweight-attempts must be between 1 and {}, got {}",
            MAX_LIGHTWEIGHT_ATTEMPTS, config.max_lightweight_attempts
        )));
    }

    if config.request_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-ms must be > 0".to_string(),
        ));
    }

    if config.browser_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "browser-timeout-ms must be > 0".to_string(),
        ));
    }

    if config.accept_language.iter().any(|value| value.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "accept-language entries cannot be empty".to_string(),
        ));
    }

    if let Some(referer) = &config.referer {
        validate_http_url(referer)?;
    }

    if let Some(origin) = &config.origin {
        validate_http_url(origin)?;
    }

    Ok(())
}

/// Validates inter-request pacing
fn validate_pacing_config(config: &PacingConfig) -> Result<(), ConfigError> {
    if config.min_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "pacing min-delay-ms ({}) must be <= max-delay-ms ({})",
            config.min_delay_ms, config.max_delay_ms
        )));
    }

    validate_jitter("pacing", config.jitter_pct)
}

/// Validates backoff settings
fn validate_backoff_config(config: &BackoffConfig) -> Result<(), ConfigError> {
    validate_jitter("backoff", config.jitter_pct)
}

/// Validates the circuit breaker
fn validate_circuit_breaker_config(config: &CircuitBreakerConfig) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }

    if config.threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit-breaker threshold must be >= 1".to_string(),
        ));
    }

    if config.window_ms == 0 {
        return Err(ConfigError::Validation(
            "circuit-breaker window-ms must be > 0".to_string(),
        ));
    }

    if config.rate_limit_threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit-breaker rate-limit-threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates staleness windows
fn validate_staleness_config(config: &StalenessConfig) -> Result<(), ConfigError> {
    if config.freshness_window_minutes < 0 {
        return Err(ConfigError::Validation(format!(
            "freshness-window-minutes must be >= 0, got {}",
            config.freshness_window_minutes
        )));
    }

    if config.stale_cooldown_minutes < 0 {
        return Err(ConfigError::Validation(format!(
            "stale-cooldown-minutes must be >= 0, got {}",
            config.stale_cooldown_minutes
        )));
    }

    Ok(())
}

/// Validates the fan-out executor
fn validate_executor_config(config: &ExecutorConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.concurrency
        )));
    }

    if config.run_deadline_secs == Some(0) {
        return Err(ConfigError::Validation(
            "run-deadline-secs must be > 0 when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates health settings
fn validate_health_config(config: &HealthConfig) -> Result<(), ConfigError> {
    if config.alert_window < 1 {
        return Err(ConfigError::Validation(
            "alert-window must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates the store location
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_jitter(section: &str, jitter_pct: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&jitter_pct) {
        return Err(ConfigError::Validation(format!(
            "{} jitter-pct must be between 0.0 and 1.0, got {}",
            section, jitter_pct
        )));
    }

    Ok(())
}

/// Checks that a URL parses and uses http(s)
fn validate_http_url(value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", value, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "{}: scheme must be http or https",
            value
        )));
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl(format!("{}: missing host", value)));
    }

    Ok(())
}
