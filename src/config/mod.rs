use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Health-wait descriptor attached to a service.
///
/// Unknown tags are rejected here, at the config boundary, by the serde
/// tag dispatch; the supervision core only ever sees these three variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthWait {
    /// A successful launch alone counts as healthy.
    #[default]
    None,
    /// Healthy once a TCP connect to 127.0.0.1:port succeeds.
    Port {
        port: u16,
        #[serde(default = "default_health_timeout")]
        timeout_secs: u64,
    },
    /// Healthy once a GET to the URL returns a status below 400.
    Http {
        url: String,
        #[serde(default = "default_health_timeout")]
        timeout_secs: u64,
    },
}

/// One supervised service, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name (unique identifier within the group)
    pub name: String,

    /// Command to run; the first element is the executable
    pub command: Vec<String>,

    /// Working directory for the service
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Health-wait descriptor evaluated after launch
    #[serde(default)]
    pub health: HealthWait,

    /// Whether to automatically restart after a failure or exit
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,

    /// Maximum number of automatic restarts; negative means unlimited
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i32,

    /// Initial restart delay in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,

    /// Multiplicative growth factor applied per restart attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Files that must exist under the working directory before launch
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
}

// Default value functions for serde
fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

fn default_auto_restart() -> bool {
    true
}

fn default_max_restarts() -> i32 {
    10
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_health_timeout() -> u64 {
    60
}

impl ServiceSpec {
    /// Validate a single service entry.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WardenError::InvalidConfig(
                "service name cannot be empty".to_string(),
            ));
        }

        if self.command.is_empty() || self.command[0].is_empty() {
            return Err(WardenError::InvalidConfig(format!(
                "service '{}' has an empty command",
                self.name
            )));
        }

        if self.backoff_base_secs <= 0.0 {
            return Err(WardenError::InvalidConfig(format!(
                "service '{}': backoff_base_secs must be positive",
                self.name
            )));
        }

        if self.backoff_multiplier <= 0.0 {
            return Err(WardenError::InvalidConfig(format!(
                "service '{}': backoff_multiplier must be positive",
                self.name
            )));
        }

        Ok(())
    }
}

/// Top-level supervisor configuration: the ordered service list plus the
/// delay inserted between sequential starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds to wait between sequential service starts
    #[serde(default)]
    pub start_interval_secs: u64,

    /// Services in startup order
    pub services: Vec<ServiceSpec>,
}

impl SupervisorConfig {
    /// Load a supervisor configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config: SupervisorConfig = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the whole configuration: per-service checks plus global
    /// name uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(WardenError::InvalidConfig(
                "no services defined".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.services {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(WardenError::InvalidConfig(format!(
                    "duplicate service name: '{}'",
                    spec.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: vec!["/bin/sleep".to_string(), "10".to_string()],
            cwd: default_cwd(),
            health: HealthWait::None,
            auto_restart: true,
            max_restarts: 10,
            backoff_base_secs: 1.0,
            backoff_multiplier: 2.0,
            required_files: vec![],
        }
    }

    #[test]
    fn test_parse_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("services.toml");
        fs::write(
            &path,
            r#"
start_interval_secs = 2

[[services]]
name = "web"
command = ["/usr/bin/python3", "-m", "http.server", "8080"]
cwd = "/tmp"
health = { type = "port", port = 8080, timeout_secs = 30 }
max_restarts = 3

[[services]]
name = "worker"
command = ["/bin/sleep", "infinity"]
auto_restart = false
"#,
        )
        .unwrap();

        let config = SupervisorConfig::from_file(&path).unwrap();
        assert_eq!(config.start_interval_secs, 2);
        assert_eq!(config.services.len(), 2);

        let web = &config.services[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.command[0], "/usr/bin/python3");
        assert_eq!(
            web.health,
            HealthWait::Port {
                port: 8080,
                timeout_secs: 30
            }
        );
        assert_eq!(web.max_restarts, 3);
        assert!(web.auto_restart);

        let worker = &config.services[1];
        assert_eq!(worker.health, HealthWait::None);
        assert!(!worker.auto_restart);
    }

    #[test]
    fn test_parse_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("services.json");
        fs::write(
            &path,
            r#"{
                "services": [
                    {
                        "name": "api",
                        "command": ["/usr/local/bin/api"],
                        "health": { "type": "http", "url": "http://127.0.0.1:9000/healthz" }
                    }
                ]
            }"#,
        )
        .unwrap();

        let config = SupervisorConfig::from_file(&path).unwrap();
        assert_eq!(config.start_interval_secs, 0);
        assert_eq!(config.services.len(), 1);
        assert_eq!(
            config.services[0].health,
            HealthWait::Http {
                url: "http://127.0.0.1:9000/healthz".to_string(),
                timeout_secs: 60
            }
        );
    }

    #[test]
    fn test_defaults_applied() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("services.toml");
        fs::write(
            &path,
            r#"
[[services]]
name = "minimal"
command = ["/bin/true"]
"#,
        )
        .unwrap();

        let config = SupervisorConfig::from_file(&path).unwrap();
        let svc = &config.services[0];
        assert_eq!(svc.cwd, PathBuf::from("."));
        assert_eq!(svc.health, HealthWait::None);
        assert!(svc.auto_restart);
        assert_eq!(svc.max_restarts, 10);
        assert_eq!(svc.backoff_base_secs, 1.0);
        assert_eq!(svc.backoff_multiplier, 2.0);
        assert!(svc.required_files.is_empty());
    }

    #[test]
    fn test_unknown_health_tag_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("services.toml");
        fs::write(
            &path,
            r#"
[[services]]
name = "bad"
command = ["/bin/true"]
health = { type = "script", path = "/bin/check" }
"#,
        )
        .unwrap();

        let result = SupervisorConfig::from_file(&path);
        assert!(matches!(result, Err(WardenError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = SupervisorConfig {
            start_interval_secs: 0,
            services: vec![spec("web"), spec("web")],
        };

        let result = config.validate();
        match result {
            Err(WardenError::InvalidConfig(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut bad = spec("web");
        bad.command = vec![];
        let config = SupervisorConfig {
            start_interval_secs: 0,
            services: vec![bad],
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_service_list_rejected() {
        let config = SupervisorConfig {
            start_interval_secs: 0,
            services: vec![],
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nonpositive_backoff_rejected() {
        let mut bad = spec("web");
        bad.backoff_base_secs = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = spec("web");
        bad.backoff_multiplier = -1.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("services.yaml");
        fs::write(&path, "services: []").unwrap();

        let result = SupervisorConfig::from_file(&path);
        assert!(matches!(result, Err(WardenError::InvalidConfig(_))));
    }
}
