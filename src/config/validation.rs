//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity within the semaphore limit, timeouts > 0)
//! - Check that addresses parse as socket addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::net::admission::MAX_CAPACITY;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("listener.max_concurrent must be greater than zero")]
    ZeroConcurrency,

    #[error("listener.max_concurrent {0} exceeds the supported maximum of {max}", max = MAX_CAPACITY)]
    ConcurrencyTooLarge(usize),

    #[error("resolvers.nameservers entry `{0}` is not an ip:port address")]
    Nameserver(String),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
}

/// Check a configuration, collecting every violation.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.max_concurrent == 0 {
        errors.push(ValidationError::ZeroConcurrency);
    } else if config.listener.max_concurrent > MAX_CAPACITY {
        errors.push(ValidationError::ConcurrencyTooLarge(
            config.listener.max_concurrent,
        ));
    }

    for ns in &config.resolvers.nameservers {
        if ns.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::Nameserver(ns.clone()));
        }
    }

    let timeouts = [
        ("connect_ms", config.timeouts.connect_ms),
        ("request_ms", config.timeouts.request_ms),
        ("drain_ms", config.timeouts.drain_ms),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
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
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_violation() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = ":13002".into();
        config.listener.max_concurrent = 0;
        config.resolvers.nameservers = vec!["8.8.8.8:53".into(), "dns.google".into()];
        config.timeouts.connect_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::BindAddress(":13002".into()),
                ValidationError::ZeroConcurrency,
                ValidationError::Nameserver("dns.google".into()),
                ValidationError::ZeroTimeout("connect_ms"),
            ]
        );
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = ProxyConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::MetricsAddress("nope".into())])
        );
    }

    #[test]
    fn capacity_beyond_semaphore_limit_is_rejected() {
        let mut config = ProxyConfig::default();
        config.listener.max_concurrent = MAX_CAPACITY;
        assert!(validate_config(&config).is_ok());

        config.listener.max_concurrent = usize::MAX;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::ConcurrencyTooLarge(usize::MAX)])
        );
    }
}
