//! Spawner configuration model
//!
//! Deployment-level settings shared by every user session. The CLI layers files and
//! environment variables into this structure; the core only defines and validates it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// How pipeline parameters reach Nextflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamsMode {
    /// Serialise parameters to a JSON file passed with `-params-file`
    #[default]
    File,
    /// Pass every parameter as `--name value`
    Flags,
}

/// Whether a user's backend runs under that user's own uid and gid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserSwitching {
    /// Switch when the spawner itself runs as root
    #[default]
    Auto,
    Always,
    Never,
}

/// Timing of the process lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// A process exiting within this window counts as a launch failure
    pub launch_grace_ms: u64,
    /// How long a process may stay `Starting` before it is terminated
    pub start_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    /// Allowed drift between a recorded start time and the OS process start time
    pub start_time_tolerance_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            launch_grace_ms: 500,
            start_timeout_secs: 120,
            stop_timeout_secs: 30,
            probe_timeout_ms: 500,
            start_time_tolerance_secs: 5,
        }
    }
}

impl LifecycleSettings {
    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn start_time_tolerance(&self) -> Duration {
        Duration::from_secs(self.start_time_tolerance_secs)
    }
}

/// Backend output logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLoggingConfig {
    pub enabled: bool,
    pub log_directory: Option<PathBuf>,
}

/// Deployment configuration of the Nextflow spawner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Pipeline repository, e.g. `https://github.com/nf-core/rnaseq`
    pub workflow_url: String,
    pub workflow_revision: String,
    /// `{username}` is replaced by the hub user name
    pub home_dir_template: String,
    /// Defaults to `$NXF_HOME`, then `<home>/.nextflow`
    pub nxf_home: Option<PathBuf>,
    /// nf-weblog endpoint
    pub log_endpoint: Option<String>,
    pub nxf_profile: Option<String>,
    /// Address for pipeline notifications, passed as the `EMAIL` parameter
    pub notification_email: Option<String>,
    /// URL path the proxy serves the backend under
    pub default_url: String,
    /// Schema document; when unset the pulled pipeline's `nextflow_schema.json` is used
    pub schema_path: Option<PathBuf>,
    pub executable: String,
    pub listen_host: String,
    /// Pipeline parameter that receives the allocated port
    pub port_param: String,
    pub params_mode: ParamsMode,
    /// Fields passed as environment variables instead of pipeline parameters
    pub env_bindings: BTreeMap<String, String>,
    pub user_switching: UserSwitching,
    pub lifecycle: LifecycleSettings,
    pub output_logging: OutputLoggingConfig,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            workflow_url: String::new(),
            workflow_revision: "main".to_string(),
            home_dir_template: "/home/{username}".to_string(),
            nxf_home: None,
            log_endpoint: None,
            nxf_profile: None,
            notification_email: None,
            default_url: "/nextflow".to_string(),
            schema_path: None,
            executable: "nextflow".to_string(),
            listen_host: "127.0.0.1".to_string(),
            port_param: "PORT".to_string(),
            params_mode: ParamsMode::File,
            env_bindings: BTreeMap::new(),
            user_switching: UserSwitching::Auto,
            lifecycle: LifecycleSettings::default(),
            output_logging: OutputLoggingConfig::default(),
        }
    }
}

impl SpawnerConfig {
    /// Create a configuration for a pipeline with every other setting at its default
    pub fn for_workflow<S: Into<String>>(workflow_url: S) -> Self {
        Self {
            workflow_url: workflow_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow_url.trim().is_empty() {
            return Err(Error::configuration("workflow_url must be set"));
        }
        if self.workflow_revision.trim().is_empty() {
            return Err(Error::configuration("workflow_revision cannot be empty"));
        }
        if !self.home_dir_template.contains("{username}") {
            return Err(Error::configuration(
                "home_dir_template must contain '{username}'",
            ));
        }
        if !self.default_url.starts_with('/') {
            return Err(Error::configuration("default_url must start with '/'"));
        }
        if self.executable.trim().is_empty() {
            return Err(Error::configuration("executable cannot be empty"));
        }
        if !is_identifier(&self.port_param) {
            return Err(Error::configuration(format!(
                "port_param '{}' is not a valid parameter name",
                self.port_param
            )));
        }
        for (field, var) in &self.env_bindings {
            if !is_identifier(var) {
                return Err(Error::configuration(format!(
                    "env binding for '{}' names an invalid variable '{}'",
                    field, var
                )));
            }
        }
        if let Some(email) = &self.notification_email {
            if !email.contains('@') || email.chars().any(char::is_whitespace) {
                return Err(Error::configuration(format!(
                    "notification_email '{}' is not an email address",
                    email
                )));
            }
        }
        if self.lifecycle.stop_timeout_secs == 0 {
            return Err(Error::configuration("lifecycle.stop_timeout_secs must be positive"));
        }
        if self.lifecycle.probe_timeout_ms == 0 {
            return Err(Error::configuration("lifecycle.probe_timeout_ms must be positive"));
        }
        if self.output_logging.enabled && self.output_logging.log_directory.is_none() {
            return Err(Error::configuration(
                "output_logging.log_directory is required when output logging is enabled",
            ));
        }
        Ok(())
    }

    /// Home directory of a hub user
    pub fn home_dir(&self, username: &str) -> PathBuf {
        PathBuf::from(self.home_dir_template.replace("{username}", username))
    }

    /// Where Nextflow keeps its assets for a user
    pub fn nxf_home(&self, home_dir: &Path) -> PathBuf {
        if let Some(configured) = &self.nxf_home {
            return configured.clone();
        }
        match std::env::var_os("NXF_HOME") {
            Some(env) if !env.is_empty() => PathBuf::from(env),
            _ => home_dir.join(".nextflow"),
        }
    }

    /// Directory the pipeline is launched from: `<home>/<repository name>`
    pub fn launch_dir(&self, home_dir: &Path) -> PathBuf {
        home_dir.join(repository_name(&self.workflow_url))
    }
}

/// Last path segment of a repository URL, without a `.git` suffix
pub fn repository_name(workflow_url: &str) -> &str {
    let last = workflow_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(workflow_url);
    last.strip_suffix(".git").unwrap_or(last)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = SpawnerConfig::default();
        assert_eq!(config.workflow_revision, "main");
        assert_eq!(config.default_url, "/nextflow");
        assert_eq!(config.params_mode, ParamsMode::File);
        assert_eq!(config.lifecycle.start_timeout(), Duration::from_secs(120));
        assert_eq!(config.lifecycle.stop_timeout(), Duration::from_secs(30));
        assert!(!config.output_logging.enabled);
        assert_eq!(config.user_switching, UserSwitching::Auto);
        assert!(config.notification_email.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(SpawnerConfig::default().validate().is_err());

        let config = SpawnerConfig::for_workflow("https://github.com/nf-core/demo");
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.home_dir_template = "/home/alice".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.port_param = "--port".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.env_bindings.insert("genome".to_string(), "1GENOME".to_string());
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.notification_email = Some("not an address".to_string());
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.output_logging.enabled = true;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let config = SpawnerConfig::for_workflow("https://github.com/nf-core/rnaseq.git");
        let home = config.home_dir("alice");
        assert_eq!(home, PathBuf::from("/home/alice"));
        assert_eq!(config.launch_dir(&home), PathBuf::from("/home/alice/rnaseq"));
    }

    #[test]
    #[serial]
    fn test_nxf_home_resolution() {
        let home = PathBuf::from("/home/alice");
        let mut config = SpawnerConfig::for_workflow("nf-core/demo");

        std::env::remove_var("NXF_HOME");
        assert_eq!(config.nxf_home(&home), PathBuf::from("/home/alice/.nextflow"));

        std::env::set_var("NXF_HOME", "/shared/nextflow");
        assert_eq!(config.nxf_home(&home), PathBuf::from("/shared/nextflow"));
        std::env::remove_var("NXF_HOME");

        config.nxf_home = Some(PathBuf::from("/opt/nxf"));
        assert_eq!(config.nxf_home(&home), PathBuf::from("/opt/nxf"));
    }

    #[test]
    fn test_repository_name() {
        assert_eq!(repository_name("https://github.com/nf-core/rnaseq"), "rnaseq");
        assert_eq!(repository_name("https://github.com/nf-core/rnaseq/"), "rnaseq");
        assert_eq!(repository_name("nf-core/demo.git"), "demo");
        assert_eq!(repository_name("hello"), "hello");
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SpawnerConfig = serde_json::from_str(
            r#"{
                "workflow_url": "nf-core/demo",
                "params_mode": "flags",
                "lifecycle": {"stop_timeout_secs": 5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.params_mode, ParamsMode::Flags);
        assert_eq!(config.lifecycle.stop_timeout_secs, 5);
        assert_eq!(config.lifecycle.launch_grace_ms, 500);
        assert_eq!(config.executable, "nextflow");
    }
}
