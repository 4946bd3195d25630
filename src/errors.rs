//! Typed error hierarchy for the stagehand orchestrator.
//!
//! One enum per subsystem:
//! - `ConfigError`: pipeline configuration loading and compilation
//! - `DiscoveryError`: the external "next workable stages" query
//! - `LockError`: persisted per-stage lock markers
//! - `WorktreeError`: isolated workspace pool
//! - `SessionError`: agent session spawning and input delivery
//! - `OrchestratorError`: tick loop failures other than per-stage contention
//!
//! Validation findings are not errors; they are reported as data by
//! `crate::validation`.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading or compiling a pipeline configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Phase '{phase}' declares both skill and resolver; exactly one is required")]
    AmbiguousAutomation { phase: String },

    #[error("Phase '{phase}' declares neither skill nor resolver; exactly one is required")]
    MissingAutomation { phase: String },

    #[error("Entry phase '{0}' does not name a declared phase")]
    UnknownEntryPhase(String),

    #[error("Pipeline declares no phases")]
    NoPhases,

    #[error("Pipeline declares phases but no entry_phase")]
    MissingEntryPhase,

    #[error("Invalid value for default '{key}': {message}")]
    InvalidDefault { key: String, message: String },
}

/// Errors from registering or invoking resolvers.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Resolver '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Resolver '{name}' timed out after {timeout:?}")]
    TimedOut {
        name: String,
        timeout: std::time::Duration,
    },

    #[error("Resolver '{0}' was cancelled")]
    Cancelled(String),

    #[error("Resolver '{name}' failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the external discovery query.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to run discovery command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery command exited with code {code:?}: {stderr}")]
    QueryFailed { code: Option<i32>, stderr: String },

    #[error("Discovery command produced malformed output: {0}")]
    MalformedOutput(#[source] serde_json::Error),
}

/// Errors from the stage lock table.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Stage {stage_id} is locked by another orchestrator ({owner})")]
    HeldByOther { stage_id: String, owner: String },

    #[error("Lock marker for stage {stage_id} is unreadable: {message}")]
    CorruptMarker { stage_id: String, message: String },

    #[error("Lock I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the worktree pool.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Worktree pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },

    #[error("Worktree index {0} is not held")]
    IndexNotHeld(usize),

    #[error("Isolation strategy unusable for {repo}: {message}")]
    IsolationUnavailable { repo: PathBuf, message: String },

    #[error("git {operation} failed: {stderr}")]
    GitFailed { operation: String, stderr: String },

    #[error("Invalid branch name for a worktree: {0:?}")]
    InvalidBranch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from agent session management.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to spawn agent process for stage {stage_id}: {source}")]
    SpawnFailed {
        stage_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage {0} already has a live session")]
    AlreadyRunning(String),

    #[error("No live session for stage {0}")]
    NotFound(String),

    #[error("Failed to write to session stdin for stage {stage_id}: {source}")]
    InputFailed {
        stage_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown approval request {0}")]
    UnknownRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the orchestrator loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("Stage store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
