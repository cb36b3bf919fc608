//! Session configuration

use crate::error::{CommitError, Result};
use serde::{Deserialize, Serialize};

/// Settings of one save session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Branch the session commits to
    pub branch: String,
    /// Base of fork branch names; the session branch when unset
    pub fork_name_base: Option<String>,
    /// Suffix appended to the fork name base
    pub fork_suffix: String,
    /// Attribute of the active node used to name it in fork notices
    pub active_attribute: String,
    /// Default tracing filter when `RUST_LOG` is not set
    pub log_filter: String,
}

impl SessionConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With branch
    #[inline]
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// With fork name base
    #[inline]
    #[must_use]
    pub fn with_fork_name_base(mut self, base: impl Into<String>) -> Self {
        self.fork_name_base = Some(base.into());
        self
    }

    /// With fork suffix
    #[inline]
    #[must_use]
    pub fn with_fork_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.fork_suffix = suffix.into();
        self
    }

    /// With active attribute
    #[inline]
    #[must_use]
    pub fn with_active_attribute(mut self, name: impl Into<String>) -> Self {
        self.active_attribute = name.into();
        self
    }

    /// With log filter
    #[inline]
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Base fork names are derived from
    #[must_use]
    pub fn fork_base(&self) -> &str {
        self.fork_name_base.as_deref().unwrap_or(&self.branch)
    }

    /// Parse and validate configuration from TOML
    ///
    /// # Errors
    /// Returns [`CommitError::Config`] for malformed or invalid settings.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| CommitError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings
    ///
    /// # Errors
    /// Returns [`CommitError::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.branch.trim().is_empty() {
            return Err(CommitError::config("branch must not be empty"));
        }
        if self.fork_suffix.is_empty() {
            return Err(CommitError::config("fork_suffix must not be empty"));
        }
        if self.fork_base().trim().is_empty() {
            return Err(CommitError::config("fork_name_base must not be empty"));
        }
        if self.active_attribute.is_empty() {
            return Err(CommitError::config("active_attribute must not be empty"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            branch: "master".to_string(),
            fork_name_base: None,
            fork_suffix: "_fork".to_string(),
            active_attribute: "name".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.branch, "master");
        assert_eq!(config.fork_base(), "master");
        assert_eq!(config.fork_suffix, "_fork");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = SessionConfig::new()
            .with_branch("dev")
            .with_fork_name_base("nightly run")
            .with_active_attribute("label");
        assert_eq!(config.fork_base(), "nightly run");
        assert_eq!(config.active_attribute, "label");
    }

    #[test]
    fn parses_partial_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            branch = "experiments"
            log_filter = "tpc_commit=debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.branch, "experiments");
        assert_eq!(config.fork_suffix, "_fork");
        assert_eq!(config.log_filter, "tpc_commit=debug");
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(matches!(
            SessionConfig::from_toml_str(r#"branch = """#),
            Err(CommitError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("branch = 3"),
            Err(CommitError::Config(_))
        ));
        assert!(SessionConfig::new().with_fork_suffix("").validate().is_err());
    }
}
