pub mod code_host;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod locker;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod resolvers;
pub mod session;
pub mod skills;
pub mod store;
pub mod validation;
pub mod worktree;
