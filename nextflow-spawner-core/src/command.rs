//! Command building
//!
//! Turns validated [`LaunchOptions`] plus a user's [`EnvironmentContext`] into the
//! concrete [`Invocation`] of the Nextflow launcher. Building is pure: the params file is
//! returned as a path plus contents and written by the lifecycle manager just before launch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use tracing::debug;

use crate::account::UserIdentity;
use crate::config::{ParamsMode, SpawnerConfig};
use crate::options::LaunchOptions;
use crate::schema::OptionsSchema;
use crate::{Error, Result};

/// Environment variables the builder always sets itself
const RESERVED_ENV: &[&str] = &[
    "HOME",
    "USER",
    "NXF_HOME",
    "NXF_USER_WORKFLOW",
    "NXF_USER_REVISION",
    "NXF_USER_PARAMS",
    "NXF_USER_ENDPOINT",
    "NXF_USER_PROFILE",
    "NXF_USER_EMAIL",
];

/// Pipeline parameter that receives the notification address
const EMAIL_PARAM: &str = "EMAIL";

/// Ask the OS for a free port on `host`.
///
/// The port is released again before returning, so the backend can bind it.
pub fn allocate_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))
        .map_err(|e| Error::launch(format!("cannot allocate a port on {}: {}", host, e), None))?;
    let port = listener.local_addr()?.port();
    debug!("Allocated port {} on {}", port, host);
    Ok(port)
}

/// Per-user facts the invocation depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub username: String,
    pub home_dir: PathBuf,
    pub nxf_home: PathBuf,
    pub launch_dir: PathBuf,
    pub listen_host: String,
    pub port: u16,
    /// Account the backend runs as, `None` for the spawner's own
    pub identity: Option<UserIdentity>,
}

impl EnvironmentContext {
    /// Derive the context of `username` from the deployment configuration
    pub fn for_user(config: &SpawnerConfig, username: &str, port: u16) -> Self {
        let home_dir = config.home_dir(username);
        Self {
            username: username.to_string(),
            nxf_home: config.nxf_home(&home_dir),
            launch_dir: config.launch_dir(&home_dir),
            home_dir,
            listen_host: config.listen_host.clone(),
            port,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<UserIdentity>) -> Self {
        self.identity = identity;
        self
    }
}

/// How one option reaches the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// Pipeline parameter
    Param,
    /// Environment variable
    Env(String),
}

/// Fixed option -> argument table, built once per spawner from its schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentTable {
    bindings: BTreeMap<String, Binding>,
}

impl ArgumentTable {
    /// Bind every schema field as a pipeline parameter, except those in `env_bindings`
    pub fn from_schema(
        schema: &OptionsSchema,
        env_bindings: &BTreeMap<String, String>,
    ) -> Result<Self> {
        for (field, var) in env_bindings {
            if schema.field(field).is_none() {
                return Err(Error::configuration(format!(
                    "env binding names unknown field '{}'",
                    field
                )));
            }
            if RESERVED_ENV.contains(&var.as_str()) {
                return Err(Error::configuration(format!(
                    "field '{}' cannot be bound to reserved variable {}",
                    field, var
                )));
            }
        }

        let bindings = schema
            .fields()
            .iter()
            .map(|f| {
                let binding = match env_bindings.get(&f.name) {
                    Some(var) => Binding::Env(var.clone()),
                    None => Binding::Param,
                };
                (f.name.clone(), binding)
            })
            .collect();

        Ok(Self { bindings })
    }

    pub fn binding(&self, field: &str) -> Option<&Binding> {
        self.bindings.get(field)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Where the backend will listen once running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parameters file to write before launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Concrete process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub params_file: Option<ParamsFile>,
    pub endpoint: ListenEndpoint,
    #[serde(default)]
    pub identity: Option<UserIdentity>,
}

impl Invocation {
    /// Bare invocation of `executable` listening on `endpoint`, run from `cwd`
    pub fn new<S: Into<String>>(executable: S, cwd: PathBuf, endpoint: ListenEndpoint) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd,
            params_file: None,
            endpoint,
            identity: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Shell-like rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds the Nextflow launcher invocation
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    executable: String,
    workflow_url: String,
    workflow_revision: String,
    nxf_profile: Option<String>,
    log_endpoint: Option<String>,
    notification_email: Option<String>,
    port_param: String,
    listen_path: String,
    params_mode: ParamsMode,
    table: ArgumentTable,
}

impl CommandBuilder {
    pub fn new(config: &SpawnerConfig, table: ArgumentTable) -> Self {
        Self {
            executable: config.executable.clone(),
            workflow_url: config.workflow_url.clone(),
            workflow_revision: config.workflow_revision.clone(),
            nxf_profile: config.nxf_profile.clone(),
            log_endpoint: config.log_endpoint.clone(),
            notification_email: config.notification_email.clone(),
            port_param: config.port_param.clone(),
            listen_path: config.default_url.clone(),
            params_mode: config.params_mode,
            table,
        }
    }

    pub fn table(&self) -> &ArgumentTable {
        &self.table
    }

    /// Map options and context to an invocation.
    ///
    /// An option missing from the argument table means schema and table are out of sync,
    /// which is reported as [`Error::Internal`].
    pub fn build(
        &self,
        options: &LaunchOptions,
        context: &EnvironmentContext,
    ) -> Result<Invocation> {
        let mut params = serde_json::Map::new();
        let mut param_flags = Vec::new();
        let mut bound_env = BTreeMap::new();

        for (name, value) in options.iter() {
            let binding = self.table.binding(name).ok_or_else(|| {
                Error::Internal(format!("option '{}' has no entry in the argument table", name))
            })?;
            if value.is_null() {
                continue;
            }
            match binding {
                Binding::Param => match self.params_mode {
                    ParamsMode::File => {
                        params.insert(name.clone(), value.to_json());
                    }
                    ParamsMode::Flags => {
                        param_flags.push(format!("--{}", name));
                        param_flags.push(value.to_string());
                    }
                },
                Binding::Env(var) => {
                    bound_env.insert(var.clone(), value.to_string());
                }
            }
        }

        if let Some(email) = &self.notification_email {
            match self.params_mode {
                ParamsMode::File => {
                    params.insert(EMAIL_PARAM.to_string(), Value::String(email.clone()));
                }
                ParamsMode::Flags => {
                    param_flags.push(format!("--{}", EMAIL_PARAM));
                    param_flags.push(email.clone());
                }
            }
        }

        let mut args = vec![
            "run".to_string(),
            self.workflow_url.clone(),
            "-r".to_string(),
            self.workflow_revision.clone(),
            "-resume".to_string(),
        ];
        if let Some(profile) = &self.nxf_profile {
            args.extend(["-profile".to_string(), profile.clone()]);
        }
        if let Some(endpoint) = &self.log_endpoint {
            args.extend(["-with-weblog".to_string(), endpoint.clone()]);
        }

        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), context.home_dir.display().to_string());
        env.insert("USER".to_string(), context.username.clone());
        env.insert("NXF_HOME".to_string(), context.nxf_home.display().to_string());
        env.insert("NXF_USER_WORKFLOW".to_string(), self.workflow_url.clone());
        env.insert("NXF_USER_REVISION".to_string(), self.workflow_revision.clone());
        if let Some(endpoint) = &self.log_endpoint {
            env.insert("NXF_USER_ENDPOINT".to_string(), endpoint.clone());
        }
        if let Some(profile) = &self.nxf_profile {
            env.insert("NXF_USER_PROFILE".to_string(), profile.clone());
        }
        if let Some(email) = &self.notification_email {
            env.insert("NXF_USER_EMAIL".to_string(), email.clone());
        }

        let params_file = match self.params_mode {
            ParamsMode::File => {
                let file = params_file(&context.nxf_home, Value::Object(params))?;
                let path = file.path.display().to_string();
                args.extend(["-params-file".to_string(), path.clone()]);
                env.insert("NXF_USER_PARAMS".to_string(), path);
                Some(file)
            }
            ParamsMode::Flags => {
                args.extend(param_flags);
                None
            }
        };

        args.push(format!("--{}", self.port_param));
        args.push(context.port.to_string());

        env.extend(bound_env);

        Ok(Invocation {
            executable: self.executable.clone(),
            args,
            env,
            cwd: context.launch_dir.clone(),
            params_file,
            endpoint: ListenEndpoint {
                host: context.listen_host.clone(),
                port: context.port,
                path: self.listen_path.clone(),
            },
            identity: context.identity,
        })
    }
}

/// Content-addressed params file: `<nxf_home>/nextflowspawner_<sha1>.json`
fn params_file(nxf_home: &std::path::Path, params: Value) -> Result<ParamsFile> {
    let contents = serde_json::to_string(&params)?;
    let digest = Sha1::digest(contents.as_bytes());
    Ok(ParamsFile {
        path: nxf_home.join(format!("nextflowspawner_{:x}.json", digest)),
        contents,
    })
}
