//! Module hosting: access control, stake-weighted rate limiting, the
//! signed-call server and the background runtimes that keep a node in the
//! mesh.

mod access;
mod config;
mod error;
mod module;
mod runtime;
mod runtime_util;
mod server;
mod stake;

pub use access::{
    AccessConfig, AccessController, AccessDecision, QuotaState, RatePolicy, USAGE_KEY,
};
pub use config::{AccessSection, NodeFileConfig, NodeSection, StakeSection, SyncSection};
pub use error::NodeError;
pub use module::{
    CallArgs, Handler, HandlerFn, Module, ModuleBuilder, ModuleDescriptor, ADMIN_FUNCTIONS,
    BUILTIN_FUNCTIONS, FUNCTIONS_FUNCTION, HISTORY_FUNCTION, INFO_FUNCTION, NAMESPACE_FUNCTION,
    RM_HISTORY_FUNCTION,
};
pub use runtime::{spawn_namespace_sync, PeriodicRuntime, RuntimeSnapshot};
pub use server::{AuditRecord, ModuleServer, ServerConfig, ServerHandle};
pub use stake::{StakeOracle, StakeSnapshot, StakeSync, StakeSyncConfig, StaticStakeOracle};

#[cfg(test)]
mod tests;
