//! Hub-facing Nextflow spawner
//!
//! Ties schema, validator, command builder, lifecycle manager and proxy resolver
//! together behind the operations a notebook hub calls per user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::{check_username, hand_over, identity_for, UserIdentity};
use crate::command::{allocate_port, ArgumentTable, CommandBuilder, EnvironmentContext};
use crate::config::SpawnerConfig;
use crate::form::{render_options_form, FormDescription};
use crate::lifecycle::{LifecycleManager, PersistedState, ProcessRecord, ProcessState, Session};
use crate::options::LaunchOptions;
use crate::proxy::{resolve, Resolution};
use crate::schema::{schema_asset_path, OptionsSchema};
use crate::validator::{check_paths, validate};
use crate::{Error, Result};

/// Spawner for one configured pipeline, serving many users
pub struct NextflowSpawner {
    config: SpawnerConfig,
    schema: Arc<OptionsSchema>,
    builder: CommandBuilder,
    lifecycle: LifecycleManager,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl NextflowSpawner {
    pub fn new(config: SpawnerConfig, schema: OptionsSchema) -> Result<Self> {
        config.validate()?;
        if schema.field(&config.port_param).is_some() {
            return Err(Error::configuration(format!(
                "port parameter '{}' clashes with a schema field",
                config.port_param
            )));
        }

        let table = ArgumentTable::from_schema(&schema, &config.env_bindings)?;
        let builder = CommandBuilder::new(&config, table);
        let lifecycle =
            LifecycleManager::new(config.lifecycle.clone(), config.output_logging.clone());

        info!(
            "Nextflow spawner for {} ({} fields, revision {})",
            config.workflow_url,
            schema.len(),
            config.workflow_revision
        );

        Ok(Self {
            config,
            schema: Arc::new(schema),
            builder,
            lifecycle,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Build a spawner, loading the schema from `schema_path` or the pulled pipeline assets
    pub fn from_config(config: SpawnerConfig) -> Result<Self> {
        config.validate()?;
        let path = match (&config.schema_path, &config.nxf_home) {
            (Some(path), _) => path.clone(),
            (None, Some(nxf_home)) => schema_asset_path(nxf_home, &config.workflow_url),
            (None, None) => {
                return Err(Error::configuration(
                    "schema_path or nxf_home is required to locate the pipeline schema",
                ))
            }
        };
        let schema = OptionsSchema::load(&path)?;
        Self::new(config, schema)
    }

    /// Replace the lifecycle manager, e.g. to install a different readiness probe
    pub fn with_lifecycle(mut self, lifecycle: LifecycleManager) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    pub fn schema(&self) -> &OptionsSchema {
        self.schema.as_ref()
    }

    /// Session of `user`, created on first use
    pub async fn session(&self, user: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(user) {
            return session.clone();
        }
        self.sessions
            .write()
            .await
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(Session::new(user)))
            .clone()
    }

    pub fn options_form(&self) -> FormDescription {
        render_options_form(&self.schema)
    }

    /// Validate form input and check paths that must exist
    pub fn validate_options(&self, raw: &HashMap<String, String>) -> Result<LaunchOptions> {
        let options = validate(&self.schema, raw)?;
        check_paths(&self.schema, &options)?;
        Ok(options)
    }

    /// [`NextflowSpawner::validate_options`] with the filesystem checks off the runtime
    async fn checked_options(&self, raw: &HashMap<String, String>) -> Result<LaunchOptions> {
        let options = validate(&self.schema, raw)?;
        let schema = self.schema.clone();
        tokio::task::spawn_blocking(move || -> Result<LaunchOptions> {
            check_paths(&schema, &options)?;
            Ok(options)
        })
        .await
        .map_err(|e| Error::Internal(format!("path check panicked: {}", e)))?
    }

    pub fn environment_for(&self, user: &str, port: u16) -> EnvironmentContext {
        EnvironmentContext::for_user(&self.config, user, port)
    }

    /// Validate `raw_options` and launch the pipeline for the session's user
    pub async fn start(
        &self,
        session: &Session,
        raw_options: &HashMap<String, String>,
    ) -> Result<ProcessRecord> {
        check_username(session.user())?;
        if let Some(record) = session.active_record().await {
            debug!("{} already has process {}", session.user(), record.id);
            return Ok(record);
        }

        let options = self.checked_options(raw_options).await?;
        let identity = identity_for(self.config.user_switching, session.user())?;
        let port = allocate_port(&self.config.listen_host)?;
        let context = self
            .environment_for(session.user(), port)
            .with_identity(identity);

        prepare_launch_dir(&context.launch_dir, identity).await?;

        let invocation = self.builder.build(&options, &context)?;
        self.lifecycle.start(session, &invocation).await
    }

    pub async fn poll(&self, session: &Session) -> Result<ProcessState> {
        self.lifecycle.poll(session).await
    }

    pub async fn stop(&self, session: &Session) -> Result<()> {
        self.lifecycle.stop(session).await.map(|_| ())
    }

    pub async fn get_state(&self, session: &Session) -> Result<Option<PersistedState>> {
        self.lifecycle.get_state(session).await
    }

    pub async fn load_state(
        &self,
        session: &Session,
        state: &PersistedState,
    ) -> Result<ProcessRecord> {
        self.lifecycle.load_state(session, state).await
    }

    pub async fn resolve(&self, session: &Session) -> Resolution {
        match session.record().await {
            Some(record) => resolve(&record),
            None => Resolution::NotReady {
                state: ProcessState::NotStarted,
            },
        }
    }

    /// Stop every session this spawner knows about
    pub async fn shutdown_all(&self) -> Result<()> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        info!("Shutting down {} sessions", sessions.len());

        for session in sessions {
            if let Err(e) = self.lifecycle.stop(&session).await {
                warn!("Failed to stop session {}: {}", session.user(), e);
            }
        }
        Ok(())
    }
}

/// Create the launch directory if needed and give a new one to the backend's user
async fn prepare_launch_dir(path: &Path, identity: Option<UserIdentity>) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        Error::launch(
            format!("cannot create launch directory {}: {}", path.display(), e),
            None,
        )
    })?;
    hand_over(path, identity)?;
    debug!("Created launch directory {}", path.display());
    Ok(())
}

/// Run `nextflow pull` for `user` and return the path of the pipeline schema.
///
/// Fails with a configuration error when the pipeline cannot be pulled or ships no
/// `nextflow_schema.json`.
pub async fn pull_workflow(config: &SpawnerConfig, user: &str) -> Result<PathBuf> {
    check_username(user)?;
    let identity = identity_for(config.user_switching, user)?;
    let home_dir = config.home_dir(user);
    let nxf_home = config.nxf_home(&home_dir);

    info!(
        "Pulling {} (revision {}) into {}",
        config.workflow_url,
        config.workflow_revision,
        nxf_home.display()
    );
    let mut command = Command::new(&config.executable);
    command
        .args([
            "pull",
            config.workflow_url.as_str(),
            "-r",
            config.workflow_revision.as_str(),
        ])
        .current_dir(&home_dir)
        .env("NXF_HOME", &nxf_home);
    #[cfg(unix)]
    if let Some(identity) = identity {
        command.uid(identity.uid).gid(identity.gid);
    }
    let output = command
        .output()
        .await
        .map_err(|e| Error::launch(format!("failed to run {}: {}", config.executable, e), None))?;

    if !output.status.success() {
        debug!("pull stderr: {}", String::from_utf8_lossy(&output.stderr));
        return Err(Error::configuration(format!(
            "{} does not seem to exist",
            config.workflow_url
        )));
    }

    let schema_path = schema_asset_path(&nxf_home, &config.workflow_url);
    let is_file = tokio::fs::metadata(&schema_path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(Error::configuration(format!(
            "{} does not seem to provide a nextflow_schema.json",
            config.workflow_url
        )));
    }
    Ok(schema_path)
}
