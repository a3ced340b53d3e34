// replsync/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::simulated::SimulationScript;

pub const DEFAULT_AGENT_PROGRAM: &str = "replmerg";
pub const DEFAULT_OUTPUT_VERBOSE_LEVEL: u8 = 1;
pub const MAX_OUTPUT_VERBOSE_LEVEL: u8 = 4;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSecurityOptions {
    pub publisher_security_mode: Option<String>,
    pub publisher_login: Option<String>,
    pub publisher_password: Option<String>,
    pub distributor_security_mode: Option<String>,
    pub distributor_login: Option<String>,
    pub distributor_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonAgentConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub check_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub subscriber: Option<String>,
    pub subscription_database: Option<String>,
    pub publisher: Option<String>,
    pub publication_database: Option<String>,
    pub publication: Option<String>,
    pub distributor: Option<String>,
    pub security: Option<JsonSecurityOptions>,
    pub output_verbose_level: Option<u8>,
    pub output_log_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub agent: Option<JsonAgentConfig>,
    pub simulation: Option<SimulationScript>,
}

// Application's internal configuration structs
#[derive(Clone, PartialEq, Eq)]
pub enum SecurityMode {
    Integrated,
    Standard { login: String, password: String },
}

impl fmt::Debug for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::Integrated => write!(f, "Integrated"),
            SecurityMode::Standard { login, .. } => {
                write!(f, "Standard {{ login: {:?}, password: \"***\" }}", login)
            }
        }
    }
}

impl SecurityMode {
    /// Numeric flag understood by the merge agent command line.
    pub fn agent_flag(&self) -> &'static str {
        match self {
            SecurityMode::Integrated => "1",
            SecurityMode::Standard { .. } => "0",
        }
    }
}

/// Connection and publication parameters for one pull subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub subscriber: String,
    pub subscription_db: String,
    pub publisher: String,
    pub publication_db: String,
    pub publication: String,
    pub distributor: String,
    pub publisher_security: SecurityMode,
    pub distributor_security: SecurityMode,
    pub output_verbose_level: u8,
    pub output_log_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl SyncConfig {
    /// `[subscription db] - [publisher] - [publication db]`
    pub fn subscription_label(&self) -> String {
        format!(
            "[{}] - [{}] - [{}]",
            self.subscription_db, self.publisher, self.publication_db
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub program: String,
    pub extra_args: Vec<String>,
    pub check_args: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            program: DEFAULT_AGENT_PROGRAM.to_string(),
            extra_args: Vec::new(),
            check_args: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent_config: AgentConfig,
    pub simulation: Option<SimulationScript>,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        let agent_config = match raw_json_config.agent.as_ref() {
            Some(agent_raw) => AgentConfig {
                program: agent_raw
                    .program
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_AGENT_PROGRAM.to_string()),
                extra_args: agent_raw.extra_args.clone(),
                check_args: agent_raw.check_args.clone().filter(|args| !args.is_empty()),
            },
            None => AgentConfig::default(),
        };

        Ok(AppConfig {
            agent_config,
            simulation: raw_json_config.simulation.clone(),
            raw_json_config,
        })
    }
}

pub fn load_sync_config_from_json(raw_config: &RawJsonConfig) -> Result<SyncConfig> {
    let subscriber = required_field(&raw_config.subscriber, "subscriber")?;
    let subscription_db = required_field(&raw_config.subscription_database, "subscription_database")?;
    let publisher = required_field(&raw_config.publisher, "publisher")?;
    let publication_db = required_field(&raw_config.publication_database, "publication_database")?;
    let publication = required_field(&raw_config.publication, "publication")?;

    // The publisher doubles as its own distributor unless told otherwise.
    let distributor = raw_config
        .distributor
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| publisher.clone());

    let (publisher_security, distributor_security) = match raw_config.security.as_ref() {
        Some(security) => (
            parse_security_mode(
                security.publisher_security_mode.as_deref(),
                &security.publisher_login,
                &security.publisher_password,
                "publisher",
            )?,
            parse_security_mode(
                security.distributor_security_mode.as_deref(),
                &security.distributor_login,
                &security.distributor_password,
                "distributor",
            )?,
        ),
        None => (SecurityMode::Integrated, SecurityMode::Integrated),
    };

    let output_verbose_level = raw_config
        .output_verbose_level
        .unwrap_or(DEFAULT_OUTPUT_VERBOSE_LEVEL);
    if output_verbose_level > MAX_OUTPUT_VERBOSE_LEVEL {
        return Err(anyhow::anyhow!(
            "output_verbose_level must be between 0 and {} in config.json, got {}",
            MAX_OUTPUT_VERBOSE_LEVEL,
            output_verbose_level
        ));
    }

    let timeout = match raw_config.timeout_secs {
        Some(0) => {
            return Err(anyhow::anyhow!(
                "timeout_secs must be greater than zero in config.json (omit it to wait indefinitely)."
            ));
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    Ok(SyncConfig {
        subscriber,
        subscription_db,
        publisher,
        publication_db,
        publication,
        distributor,
        publisher_security,
        distributor_security,
        output_verbose_level,
        output_log_path: raw_config
            .output_log_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty()),
        timeout,
    })
}

fn required_field(value: &Option<String>, name: &str) -> Result<String> {
    let value = value
        .as_ref()
        .with_context(|| format!("{} must be set in config.json", name))?;
    if value.trim().is_empty() {
        return Err(anyhow::anyhow!("{} cannot be empty in config.json.", name));
    }
    Ok(value.clone())
}

fn parse_security_mode(
    mode: Option<&str>,
    login: &Option<String>,
    password: &Option<String>,
    role: &str,
) -> Result<SecurityMode> {
    match mode.map(|m| m.trim().to_ascii_lowercase()).as_deref() {
        None | Some("integrated") | Some("windows") => Ok(SecurityMode::Integrated),
        Some("standard") | Some("sql") => {
            let login = login
                .as_ref()
                .filter(|s| !s.is_empty())
                .with_context(|| format!("{}_login must be set when {} security mode is standard", role, role))?;
            Ok(SecurityMode::Standard {
                login: login.clone(),
                password: password.clone().unwrap_or_default(),
            })
        }
        Some(other) => Err(anyhow::anyhow!(
            "Unknown {}_security_mode '{}': expected 'integrated' or 'standard'",
            role,
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("fixture should deserialize")
    }

    fn minimal() -> serde_json::Value {
        json!({
            "subscriber": "PACIFIC\\SQLEXPRESS",
            "subscription_database": "TestDB1",
            "publisher": "WS2008R2_1",
            "publication_database": "AdventureWorksLT",
            "publication": "TestMergePub1"
        })
    }

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = load_sync_config_from_json(&raw(minimal()))?;

        assert_eq!(config.subscriber, "PACIFIC\\SQLEXPRESS");
        assert_eq!(config.distributor, "WS2008R2_1");
        assert_eq!(config.publisher_security, SecurityMode::Integrated);
        assert_eq!(config.distributor_security, SecurityMode::Integrated);
        assert_eq!(config.output_verbose_level, DEFAULT_OUTPUT_VERBOSE_LEVEL);
        assert_eq!(config.output_log_path, None);
        assert_eq!(config.timeout, None);
        Ok(())
    }

    #[test]
    fn test_subscription_label() -> anyhow::Result<()> {
        let config = load_sync_config_from_json(&raw(minimal()))?;
        assert_eq!(
            config.subscription_label(),
            "[TestDB1] - [WS2008R2_1] - [AdventureWorksLT]"
        );
        Ok(())
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let mut value = minimal();
        value.as_object_mut().unwrap().remove("publication");
        let err = load_sync_config_from_json(&raw(value)).unwrap_err();
        assert!(err.to_string().contains("publication must be set"));
    }

    #[test]
    fn test_blank_required_field_is_rejected() {
        let mut value = minimal();
        value["subscriber"] = json!("   ");
        let err = load_sync_config_from_json(&raw(value)).unwrap_err();
        assert!(err.to_string().contains("subscriber cannot be empty"));
    }

    #[test]
    fn test_standard_security_requires_login() {
        let mut value = minimal();
        value["security"] = json!({ "publisher_security_mode": "standard" });
        let err = load_sync_config_from_json(&raw(value)).unwrap_err();
        assert!(err.to_string().contains("publisher_login"));
    }

    #[test]
    fn test_standard_security_with_login() -> anyhow::Result<()> {
        let mut value = minimal();
        value["security"] = json!({
            "publisher_security_mode": "standard",
            "publisher_login": "repl",
            "publisher_password": "s3cret",
            "distributor_security_mode": "integrated"
        });
        let config = load_sync_config_from_json(&raw(value))?;

        assert_eq!(
            config.publisher_security,
            SecurityMode::Standard {
                login: "repl".to_string(),
                password: "s3cret".to_string()
            }
        );
        assert_eq!(config.distributor_security, SecurityMode::Integrated);
        assert!(!format!("{:?}", config).contains("s3cret"));
        Ok(())
    }

    #[test]
    fn test_unknown_security_mode_is_rejected() {
        let mut value = minimal();
        value["security"] = json!({ "distributor_security_mode": "kerberos" });
        assert!(load_sync_config_from_json(&raw(value)).is_err());
    }

    #[test]
    fn test_verbose_level_out_of_range() {
        let mut value = minimal();
        value["output_verbose_level"] = json!(5);
        let err = load_sync_config_from_json(&raw(value)).unwrap_err();
        assert!(err.to_string().contains("output_verbose_level"));
    }

    #[test]
    fn test_timeout_and_log_path() -> anyhow::Result<()> {
        let mut value = minimal();
        value["timeout_secs"] = json!(90);
        value["output_verbose_level"] = json!(4);
        value["output_log_path"] = json!("C:\\TEMP\\mergeagent.log");
        let config = load_sync_config_from_json(&raw(value))?;

        assert_eq!(config.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.output_verbose_level, 4);
        assert_eq!(
            config.output_log_path,
            Some(PathBuf::from("C:\\TEMP\\mergeagent.log"))
        );
        Ok(())
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut value = minimal();
        value["timeout_secs"] = json!(0);
        assert!(load_sync_config_from_json(&raw(value)).is_err());
    }

    #[test]
    fn test_load_from_json_file_with_agent_section() -> anyhow::Result<()> {
        let mut value = minimal();
        value["agent"] = json!({
            "program": "/opt/mssql/bin/replmerg",
            "extra_args": ["-QueryTimeout", "600"],
            "check_args": []
        });
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{}", value)?;

        let app_config = AppConfig::load_from_json(file.path())?;
        assert_eq!(app_config.agent_config.program, "/opt/mssql/bin/replmerg");
        assert_eq!(app_config.agent_config.extra_args, vec!["-QueryTimeout", "600"]);
        assert_eq!(app_config.agent_config.check_args, None);
        assert!(app_config.simulation.is_none());

        let sync_config = load_sync_config_from_json(&app_config.raw_json_config)?;
        assert_eq!(sync_config.publication, "TestMergePub1");
        Ok(())
    }

    #[test]
    fn test_load_from_json_defaults_agent_program() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{}", minimal())?;

        let app_config = AppConfig::load_from_json(file.path())?;
        assert_eq!(app_config.agent_config, AgentConfig::default());
        Ok(())
    }

    #[test]
    fn test_load_from_json_reports_parse_errors() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{{ not json")?;

        let err = AppConfig::load_from_json(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
        Ok(())
    }
}
