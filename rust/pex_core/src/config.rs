//! Resolver configuration and JSON parsing helpers.

use serde::Deserialize;
use thiserror::Error;

/// How much of the resolution cache a write invalidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationMode {
    /// Any write invalidates every cached result.
    #[default]
    Coarse,
    /// A write invalidates only results whose traversal consulted the
    /// written subject.
    PerSubject,
}

/// Configuration surface consumed by the resolver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResolverConfig {
    /// Permission namespace separator; `*` and `?` never cross it.
    pub separator: char,
    /// Report inheritance cycles as errors instead of deduplicating them.
    pub cycle_detection: bool,
    pub invalidation: InvalidationMode,
    /// Upper bound on cached results; 0 disables the bound.
    pub max_cache_entries: usize,
    /// Active values of the `server-tag` context, added to every query.
    pub server_tags: Vec<String>,
    /// Traverse `default:<collection>` then `default:default` after the
    /// regular ancestors.
    pub fallback_subjects: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            separator: '.',
            cycle_detection: true,
            invalidation: InvalidationMode::Coarse,
            max_cache_entries: 100_000,
            server_tags: Vec::new(),
            fallback_subjects: false,
        }
    }
}

/// Configuration rejected at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid separator {0:?}: glob metacharacters cannot separate permissions")]
    InvalidSeparator(char),
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if crate::glob::is_meta(self.separator) {
            return Err(ConfigError::InvalidSeparator(self.separator));
        }
        Ok(())
    }
}

/// Parse and validate a resolver config from a JSON string.
pub fn parse_resolver_config(json: &str) -> Result<ResolverConfig, ConfigError> {
    let config: ResolverConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = parse_resolver_config("{}").unwrap();
        assert_eq!(config.separator, '.');
        assert!(config.cycle_detection);
        assert_eq!(config.invalidation, InvalidationMode::Coarse);
        assert!(!config.fallback_subjects);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "separator": "/",
            "cycle-detection": false,
            "invalidation": "per-subject",
            "max-cache-entries": 10,
            "server-tags": ["lobby", "eu"],
            "fallback-subjects": true
        }"#;
        let config = parse_resolver_config(json).unwrap();
        assert_eq!(config.separator, '/');
        assert!(!config.cycle_detection);
        assert_eq!(config.invalidation, InvalidationMode::PerSubject);
        assert_eq!(config.max_cache_entries, 10);
        assert_eq!(config.server_tags, vec!["lobby", "eu"]);
        assert!(config.fallback_subjects);
    }

    #[test]
    fn metacharacter_separator_rejected() {
        let err = parse_resolver_config(r#"{"separator":"*"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSeparator('*')));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            parse_resolver_config("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
