//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ceiling > 0, cool-down > 0, buffer bounds)
//! - Check that addresses parse and TLS paths are present
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{IpAddr, SocketAddr};

use crate::config::schema::ServerConfig;

/// Largest single read snapshot we allow (one maximal TLS record is 16 KiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_ip.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_ip",
            format!("'{}' is not an IP address", config.server.bind_ip),
        ));
    }
    if config.server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be greater than 0"));
    }
    if config.server.connection_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "server.connection_timeout_secs",
            "must be greater than 0",
        ));
    }
    if config.server.read_buffer_size == 0 || config.server.read_buffer_size > MAX_READ_BUFFER_SIZE {
        errors.push(ValidationError::new(
            "server.read_buffer_size",
            format!("must be between 1 and {}", MAX_READ_BUFFER_SIZE),
        ));
    }

    if config.tls.cert_path.trim().is_empty() {
        errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
    }
    if config.tls.key_path.trim().is_empty() {
        errors.push(ValidationError::new("tls.key_path", "must not be empty"));
    }
    if config.tls.require_client_cert && config.tls.client_ca_path.is_none() {
        errors.push(ValidationError::new(
            "tls.require_client_cert",
            "requires tls.client_ca_path",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.server.bind_ip = "localhost".into();
        config.server.max_connections = 0;
        config.server.connection_timeout_secs = 0;
        config.tls.key_path = String::new();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "server.bind_ip",
                "server.max_connections",
                "server.connection_timeout_secs",
                "tls.key_path",
            ]
        );
    }

    #[test]
    fn client_cert_requirement_needs_a_ca() {
        let mut config = ServerConfig::default();
        config.tls.require_client_cert = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "tls.require_client_cert");
    }
}
