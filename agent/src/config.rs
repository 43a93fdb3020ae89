//! Loads the small TOML configuration this agent needs: whether to install
//! the LPC interceptor at all, how long to give calibration, and the log
//! level to run at.

use serde::Deserialize;
use shared::errors::ConfigError;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// `log`/`flexi_logger` filter string, e.g. `"agent=info"`.
    pub log_level: String,
    /// Whether to install the LPC interceptor on attach at all. Useful for
    /// loading this agent into a process purely to exercise the binary
    /// patcher.
    pub install_lpc_interceptor: bool,
    /// Seconds to wait for each calibration phase before giving up.
    pub calibration_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "agent=info".to_string(),
            install_lpc_interceptor: true,
            calibration_timeout_secs: 2,
        }
    }
}

impl AgentConfig {
    /// Loads and validates configuration from a TOML file. Falls back to
    /// `Default` if `path` does not exist, since this agent is meant to run
    /// attached to an arbitrary host process without requiring an operator
    /// to stage a config file first.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: AgentConfig = toml::from_str(&s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.calibration_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "calibration_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_secs(self.calibration_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = AgentConfig::load(Path::new("no-such-file.toml")).unwrap();
        assert!(cfg.install_lpc_interceptor);
    }

    #[test]
    fn rejects_zero_calibration_timeout() {
        let toml = r#"
            log_level = "agent=debug"
            install_lpc_interceptor = true
            calibration_timeout_secs = 0
        "#;
        let cfg: AgentConfig = toml::from_str(toml).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }
}
