use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_endpoint(config)?;
    validate_chat(config)?;
    validate_storage(config)?;
    validate_log_level(config)?;
    validate_features(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Check that `base_url` is an absolute http(s) URL.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when the URL is malformed.
pub fn validate_base_url(base_url: &str) -> Result<(), ConfigError> {
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(validation_err(
            "endpoint.base_url must start with http:// or https://",
        ));
    }
    url::Url::parse(base_url).map_err(|err| {
        validation_err(format!("endpoint.base_url is not a valid URL: {err}"))
    })?;
    Ok(())
}

fn validate_endpoint(config: &AppConfig) -> Result<(), ConfigError> {
    let endpoint = &config.endpoint;
    validate_base_url(&endpoint.base_url)?;
    if endpoint.api_key.chars().any(char::is_control) {
        return Err(validation_err(
            "endpoint.api_key must not contain control characters",
        ));
    }
    if endpoint.timeout_secs == 0 {
        return Err(validation_err("endpoint.timeout_secs must be greater than 0"));
    }
    if endpoint.connect_timeout_secs == 0 {
        return Err(validation_err(
            "endpoint.connect_timeout_secs must be greater than 0",
        ));
    }
    if endpoint.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "endpoint.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_chat(config: &AppConfig) -> Result<(), ConfigError> {
    let chat = &config.chat;
    if chat.max_tokens == 0 {
        return Err(validation_err("chat.max_tokens must be greater than 0"));
    }
    if chat.max_tool_rounds == 0 {
        return Err(validation_err("chat.max_tool_rounds must be greater than 0"));
    }
    if chat.title_min_messages == 0 {
        return Err(validation_err(
            "chat.title_min_messages must be greater than 0",
        ));
    }
    if chat.title_max_tokens == 0 {
        return Err(validation_err("chat.title_max_tokens must be greater than 0"));
    }
    Ok(())
}

fn validate_storage(config: &AppConfig) -> Result<(), ConfigError> {
    if config.storage.dir.trim().is_empty() {
        return Err(validation_err("storage.dir cannot be empty"));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_features(config: &AppConfig) -> Result<(), ConfigError> {
    if config.features.capability_poll_interval_secs == 0 {
        return Err(validation_err(
            "features.capability_poll_interval_secs must be greater than 0",
        ));
    }
    Ok(())
}
