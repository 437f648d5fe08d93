//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level` when set.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}

fn parse_filter(level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", level, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("debug").is_ok());
        assert!(parse_filter("info,bridge=trace").is_ok());
        assert!(matches!(parse_filter("bridge=loud"), Err(Error::Config(_))));
    }

    #[test]
    fn test_setup_logging_rejects_invalid_level() {
        // RUST_LOG would take precedence over the bad level
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = setup_logging("bridge=loud").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("bridge=loud"));
    }
}
