//! Subcommand implementations
//!
//! Every command prints one JSON document on stdout. Lifecycle commands restore the
//! user's saved state first and write it back afterwards, holding the user's lock
//! throughout.

use clap::{Args, Subcommand};
use nextflow_spawner_core::schema::schema_asset_path;
use nextflow_spawner_core::{
    ignite, proxy, pull_workflow, LifecycleManager, NextflowSpawner, OptionsSchema,
    PersistedState, Session,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::state_store::StateStore;
use crate::{Error, Result};

/// Allowance on top of the lifecycle timeouts when waiting for a user's lock
const LOCK_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the options form derived from the pipeline schema
    Form(UserArgs),
    /// Validate options without launching anything
    Validate(OptionArgs),
    /// Validate options and launch the pipeline
    Start(OptionArgs),
    /// Check liveness and readiness of a user's pipeline
    Poll(UserArgs),
    /// Stop a user's pipeline
    Stop(UserArgs),
    /// Print a user's saved process record
    Status(UserArgs),
    /// Print where the proxy should route a user's traffic
    Resolve(UserArgs),
    /// Print the server-proxy command built from the NXF_USER_* environment
    Ignite,
    /// Pull the pipeline for a user and locate its schema
    Pull(UserArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    /// Hub user name
    #[arg(long)]
    pub user: String,
}

#[derive(Debug, Args)]
pub struct OptionArgs {
    #[command(flatten)]
    pub user: UserArgs,

    /// Form value as NAME=VALUE, may be repeated
    #[arg(long = "option", short = 'o', value_parser = parse_option)]
    pub options: Vec<(String, String)>,
}

fn parse_option(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    if name.is_empty() {
        return Err(format!("empty option name in '{}'", raw));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Run `command` and return its JSON output
pub async fn run(command: Command, config: &Config) -> Result<serde_json::Value> {
    let store = StateStore::new(config.state_dir.clone());

    match command {
        Command::Form(args) => {
            let spawner = spawner_for(config, &args.user)?;
            to_json(&spawner.options_form())
        }
        Command::Validate(args) => {
            let spawner = spawner_for(config, &args.user.user)?;
            let options = spawner.validate_options(&raw_options(&args.options))?;
            Ok(serde_json::Value::Object(options.to_json_object()))
        }
        Command::Start(args) => {
            let user = &args.user.user;
            let spawner = spawner_for(config, user)?;
            let _lock = store.lock(user, lock_timeout(config)).await?;
            let session = spawner.session(user).await;
            if let Some(state) = store.load(user).await? {
                spawner.load_state(&session, &state).await?;
            }

            let started = spawner.start(&session, &raw_options(&args.options)).await;
            persist(&store, &session, spawner.get_state(&session).await?).await?;
            let record = started?;
            info!("Started {} for {} (pid {:?})", record.id, user, record.pid);
            to_json(&record)
        }
        Command::Poll(args) => {
            let _lock = store.lock(&args.user, lock_timeout(config)).await?;
            let (manager, session) = restore(config, &store, &args.user).await?;
            let state = manager.poll(&session).await?;
            persist(&store, &session, manager.get_state(&session).await?).await?;
            Ok(json!({ "user": args.user, "state": state }))
        }
        Command::Stop(args) => {
            let _lock = store.lock(&args.user, lock_timeout(config)).await?;
            let (manager, session) = restore(config, &store, &args.user).await?;
            let record = manager.stop(&session).await?;
            persist(&store, &session, manager.get_state(&session).await?).await?;
            to_json(&record)
        }
        Command::Status(args) => {
            let _lock = store.lock(&args.user, lock_timeout(config)).await?;
            let (manager, session) = restore(config, &store, &args.user).await?;
            persist(&store, &session, manager.get_state(&session).await?).await?;
            to_json(&session.record().await)
        }
        Command::Resolve(args) => {
            let _lock = store.lock(&args.user, lock_timeout(config)).await?;
            let (_, session) = restore(config, &store, &args.user).await?;
            let resolution = match session.record().await {
                Some(record) => proxy::resolve(&record),
                None => proxy::Resolution::NotReady {
                    state: nextflow_spawner_core::ProcessState::NotStarted,
                },
            };
            to_json(&resolution)
        }
        Command::Ignite => to_json(&ignite()?),
        Command::Pull(args) => {
            let path = pull_workflow(&config.spawner, &args.user).await?;
            let schema = OptionsSchema::load(&path)?;
            Ok(json!({ "schema": path, "fields": schema.len() }))
        }
    }
}

/// Build the spawner, reading the schema from config or the user's pulled assets
fn spawner_for(config: &Config, user: &str) -> Result<NextflowSpawner> {
    let spawner_config = &config.spawner;
    let schema_path = match &spawner_config.schema_path {
        Some(path) => path.clone(),
        None => {
            let home = spawner_config.home_dir(user);
            schema_asset_path(&spawner_config.nxf_home(&home), &spawner_config.workflow_url)
        }
    };
    debug!("Using schema {}", schema_path.display());
    let schema = OptionsSchema::load(&schema_path)?;
    Ok(NextflowSpawner::new(spawner_config.clone(), schema)?)
}

/// Lifecycle manager plus the user's session with saved state re-attached
async fn restore(
    config: &Config,
    store: &StateStore,
    user: &str,
) -> Result<(LifecycleManager, Session)> {
    let manager = LifecycleManager::new(
        config.spawner.lifecycle.clone(),
        config.spawner.output_logging.clone(),
    );
    let session = Session::new(user);
    match store.load(user).await? {
        Some(state) => {
            manager.load_state(&session, &state).await?;
        }
        None => debug!("No saved state for {}", user),
    }
    Ok((manager, session))
}

/// Write the session's state back, if it has any
async fn persist(
    store: &StateStore,
    session: &Session,
    state: Option<PersistedState>,
) -> Result<()> {
    if let Some(state) = state {
        store.save(session.user(), &state).await?;
    }
    Ok(())
}

/// Longest a command waits for another command on the same user
fn lock_timeout(config: &Config) -> Duration {
    let lifecycle = &config.spawner.lifecycle;
    lifecycle.stop_timeout() + lifecycle.launch_grace() + LOCK_SLACK
}

fn raw_options(pairs: &[(String, String)]) -> HashMap<String, String> {
    pairs.iter().cloned().collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("input=/data/a.csv").unwrap(),
            ("input".to_string(), "/data/a.csv".to_string())
        );
        assert_eq!(
            parse_option("args=--x=1").unwrap(),
            ("args".to_string(), "--x=1".to_string())
        );
        assert_eq!(parse_option("empty=").unwrap().1, "");
        assert!(parse_option("novalue").is_err());
        assert!(parse_option("=x").is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_commands_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state_dir = dir.path().to_path_buf();
        config.spawner.workflow_url = "nf-core/demo".to_string();

        let user = || UserArgs {
            user: "alice".to_string(),
        };

        let polled = run(Command::Poll(user()), &config).await.unwrap();
        assert_eq!(polled["state"], "not_started");

        let status = run(Command::Status(user()), &config).await.unwrap();
        assert!(status.is_null());

        let resolved = run(Command::Resolve(user()), &config).await.unwrap();
        assert_eq!(resolved["status"], "not_ready");
        assert_eq!(resolved["state"], "not_started");

        let stopped = run(Command::Stop(user()), &config).await.unwrap();
        assert!(stopped.is_null());
    }

    #[tokio::test]
    async fn test_status_marks_dead_process_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state_dir = dir.path().to_path_buf();
        config.spawner.workflow_url = "nf-core/demo".to_string();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let store = StateStore::new(dir.path().to_path_buf());
        let state = PersistedState::from_json_str(&format!(
            r#"{{"pid": {}, "port": 4000, "state": "running", "executable": "true"}}"#,
            pid
        ))
        .unwrap();
        store.save("alice", &state).await.unwrap();

        let status = run(
            Command::Status(UserArgs {
                user: "alice".to_string(),
            }),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(status["state"], "failed");
        assert_eq!(status["failure"], "stale_state");

        // The failed record is written back
        let saved = store.load("alice").await.unwrap().unwrap();
        assert_eq!(saved.get("state"), Some(&json!("failed")));
    }
}
