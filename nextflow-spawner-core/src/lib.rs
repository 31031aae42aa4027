//! Core of the Nextflow spawner for notebook hubs
//!
//! This crate turns a pipeline's parameter schema into an options form, validates what a
//! user submits, builds the Nextflow launcher invocation and supervises the resulting
//! backend process until a reverse proxy can route traffic to it.
//!
//! # Architecture
//!
//! ```text
//! OptionsSchema --> render_options_form --> FormDescription (hub)
//!       |
//!       v
//! validate + check_paths --> LaunchOptions
//!       |
//!       v
//! CommandBuilder --> Invocation
//!       |
//!       v
//! LifecycleManager (per Session) --> ProcessRecord --> resolve --> ProxyDescriptor
//! ```
//!
//! [`NextflowSpawner`] wires these together for many users.

pub mod account;
pub mod command;
pub mod config;
pub mod error;
pub mod form;
pub mod lifecycle;
pub mod options;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod spawner;
pub mod validator;

pub use account::{check_username, UserIdentity};
pub use command::{
    allocate_port, ArgumentTable, Binding, CommandBuilder, EnvironmentContext, Invocation,
};
pub use config::{
    LifecycleSettings, OutputLoggingConfig, ParamsMode, SpawnerConfig, UserSwitching,
};
pub use error::{Error, Result, ValidationError, ValidationErrors};
pub use form::{render_options_form, FormDescription};
pub use lifecycle::{
    FailureKind, LifecycleManager, PersistedState, ProcessRecord, ProcessState, Session,
};
pub use options::{LaunchOptions, OptionValue};
pub use proxy::{ignite, resolve, ProxyCommand, ProxyDescriptor, Resolution};
pub use schema::{FieldDescriptor, FieldKind, OptionsSchema};
pub use spawner::{pull_workflow, NextflowSpawner};
pub use validator::{check_paths, validate};
