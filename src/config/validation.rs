use crate::config::types::{Config, OutputConfig, RefineConfig, RunConfig, SeedConfig, TransportConfig};
use crate::ConfigError;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_run_config(&config.run)?;
    validate_seed_config(&config.seed)?;
    validate_output_config(&config.output)?;
    validate_transport_config(&config.transport, &config.seed)?;
    validate_refine_config(&config.refine)?;
    Ok(())
}

/// Validates scheduling and failure-budget settings
fn validate_run_config(config: &RunConfig) -> Result<(), ConfigError> {
    if config.label.trim().is_empty() {
        return Err(ConfigError::Validation("label cannot be empty".to_string()));
    }

    if config.tick_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "tick_interval_ms must be >= 1".to_string(),
        ));
    }

    if Duration::try_from_secs_f64(config.back_off_minutes * 60.0).is_err() {
        return Err(ConfigError::Validation(format!(
            "back_off_minutes must be a non-negative, representable number, got {}",
            config.back_off_minutes
        )));
    }

    if config
        .tick_interval()
        .checked_mul(config.sleep_intervals_after_fail)
        .is_none()
    {
        return Err(ConfigError::Validation(format!(
            "sleep_intervals_after_fail ({}) times tick_interval_ms ({}) is out of range",
            config.sleep_intervals_after_fail, config.tick_interval_ms
        )));
    }

    if config.max_record_fail_count < 1 {
        return Err(ConfigError::Validation(format!(
            "max_record_fail_count must be >= 1, got {}",
            config.max_record_fail_count
        )));
    }

    if config.max_fail_count < 1 {
        return Err(ConfigError::Validation(format!(
            "max_fail_count must be >= 1, got {}",
            config.max_fail_count
        )));
    }

    if let Some(end) = config.end {
        if end < config.start {
            return Err(ConfigError::Validation(format!(
                "end ({}) cannot be smaller than start ({})",
                end, config.start
            )));
        }
    }

    Ok(())
}

/// Validates the seed source declaration
fn validate_seed_config(config: &SeedConfig) -> Result<(), ConfigError> {
    if config.path.is_empty() {
        return Err(ConfigError::Validation(
            "seed path cannot be empty".to_string(),
        ));
    }

    if config.line_terminator.is_empty() {
        return Err(ConfigError::Validation(
            "line_terminator cannot be empty".to_string(),
        ));
    }

    if matches!(config.separator.as_deref(), Some("")) {
        return Err(ConfigError::Validation(
            "separator cannot be empty".to_string(),
        ));
    }

    if config.columns.is_empty() {
        return Err(ConfigError::Validation(
            "at least one seed column must be declared".to_string(),
        ));
    }

    if config.key_columns.is_empty() {
        return Err(ConfigError::Validation(
            "at least one key column must be declared".to_string(),
        ));
    }

    for key in &config.key_columns {
        if !config.columns.contains_key(key) {
            return Err(ConfigError::Validation(format!(
                "key column '{}' is not a declared seed column",
                key
            )));
        }
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.response_log_path.is_empty() {
        return Err(ConfigError::Validation(
            "response_log_path cannot be empty".to_string(),
        ));
    }

    if config.refined_path.is_empty() {
        return Err(ConfigError::Validation(
            "refined_path cannot be empty".to_string(),
        ));
    }

    if config.response_log_path == config.refined_path {
        return Err(ConfigError::Validation(
            "response_log_path and refined_path must differ".to_string(),
        ));
    }

    Ok(())
}

/// Validates the HTTP transport settings against the declared seed columns
fn validate_transport_config(
    config: &TransportConfig,
    seed: &SeedConfig,
) -> Result<(), ConfigError> {
    let placeholders = template_placeholders(&config.url_template)?;
    for name in &placeholders {
        if !seed.columns.contains_key(name) {
            return Err(ConfigError::Validation(format!(
                "url_template placeholder '{{{}}}' is not a declared seed column",
                name
            )));
        }
    }

    // Every placeholder gets a harmless value so the rest of the template can be checked
    let mut sample = config.url_template.clone();
    for name in &placeholders {
        sample = sample.replace(&format!("{{{}}}", name), "x");
    }
    let url = Url::parse(&sample)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid url_template: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "url_template must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if !matches!(config.method.to_ascii_uppercase().as_str(), "GET" | "POST") {
        return Err(ConfigError::Validation(format!(
            "method must be GET or POST, got '{}'",
            config.method
        )));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates the derived output columns
fn validate_refine_config(config: &RefineConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for field in &config.fields {
        if field.name.is_empty() {
            return Err(ConfigError::Validation(
                "refine field name cannot be empty".to_string(),
            ));
        }

        if !seen.insert(field.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "refine field '{}' is declared twice",
                field.name
            )));
        }

        if !field.pointer.is_empty() && !field.pointer.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "refine pointer '{}' must be empty or start with '/'",
                field.pointer
            )));
        }
    }

    Ok(())
}

/// Extracts the `{name}` placeholders of a URL template
pub(crate) fn template_placeholders(template: &str) -> Result<Vec<String>, ConfigError> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ConfigError::Validation(format!("unclosed placeholder in '{}'", template))
        })?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            return Err(ConfigError::Validation(format!(
                "malformed placeholder in '{}'",
                template
            )));
        }
        names.push(name.to_string());
        rest = &after[close + 1..];
    }

    Ok(names)
}
