use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use modmesh_proto::{MeshError, Payload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

pub const INFO_FUNCTION: &str = "info";
pub const FUNCTIONS_FUNCTION: &str = "functions";
pub const NAMESPACE_FUNCTION: &str = modmesh_net::NAMESPACE_FUNCTION;

pub const HISTORY_FUNCTION: &str = "history";
pub const RM_HISTORY_FUNCTION: &str = "rm_history";

/// Functions every server answers even when the module does not define them.
pub const BUILTIN_FUNCTIONS: [&str; 3] = [INFO_FUNCTION, FUNCTIONS_FUNCTION, NAMESPACE_FUNCTION];

/// Built-ins left out of the default whitelist; only admins reach them
/// unless a module lists them explicitly.
pub const ADMIN_FUNCTIONS: [&str; 2] = [HISTORY_FUNCTION, RM_HISTORY_FUNCTION];

/// Decoded arguments of one call plus the verified caller address.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    pub caller: String,
    pub args: Vec<Payload>,
    pub kwargs: BTreeMap<String, Payload>,
}

impl CallArgs {
    pub fn arg(&self, index: usize) -> Result<&Payload, MeshError> {
        self.args.get(index).ok_or_else(|| MeshError::Decode {
            reason: format!("missing positional argument {}", index),
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&Payload> {
        self.kwargs.get(name)
    }

    /// Positional argument parsed from a structured record.
    pub fn record_arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, MeshError> {
        self.arg(index)?.parse_record()
    }

    /// Keyword argument by name, falling back to a positional index.
    pub fn record_param<T: DeserializeOwned>(
        &self,
        name: &str,
        index: usize,
    ) -> Result<T, MeshError> {
        match self.kwarg(name) {
            Some(value) => value.parse_record(),
            None => self.record_arg(index),
        }
    }
}

pub type HandlerFn = Arc<dyn Fn(&CallArgs) -> Result<Payload, MeshError> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    /// Returned as-is, without invoking anything.
    Value(Payload),
    Callable(HandlerFn),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Handler::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

/// What `info` reports about a served module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub address: String,
    pub key_address: String,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

/// A named table of callable functions with its access lists.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    functions: BTreeMap<String, Handler>,
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
}

impl Module {
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self, function: &str) -> Option<&Handler> {
        self.functions.get(function)
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.blacklist
    }

    pub fn is_whitelisted(&self, function: &str) -> bool {
        self.whitelist.contains(function)
    }

    pub fn is_blacklisted(&self, function: &str) -> bool {
        self.blacklist.contains(function)
    }

    pub fn descriptor(&self, address: &str, key_address: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            name: self.name.clone(),
            address: address.to_string(),
            key_address: key_address.to_string(),
            whitelist: self.whitelist.iter().cloned().collect(),
            blacklist: self.blacklist.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    name: String,
    functions: BTreeMap<String, Handler>,
    whitelist: Option<BTreeSet<String>>,
    blacklist: BTreeSet<String>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
            whitelist: None,
            blacklist: BTreeSet::new(),
        }
    }

    pub fn function(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&CallArgs) -> Result<Payload, MeshError> + Send + Sync + 'static,
    ) -> Self {
        self.functions
            .insert(name.into(), Handler::Callable(Arc::new(handler)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: Payload) -> Self {
        self.functions.insert(name.into(), Handler::Value(value));
        self
    }

    /// Replaces the default whitelist (every public function).
    pub fn whitelist<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(functions.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist
            .extend(functions.into_iter().map(Into::into));
        self
    }

    /// The whitelist always includes the built-in functions; without an
    /// explicit list it also includes every function not starting with `_`
    /// and not named like an admin built-in.
    pub fn build(self) -> Result<Module, NodeError> {
        if self.name.trim().is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "module name cannot be empty".to_string(),
            });
        }
        if let Some(name) = self.functions.keys().find(|name| name.trim().is_empty()) {
            return Err(NodeError::InvalidConfig {
                reason: format!("function name {:?} cannot be empty", name),
            });
        }
        let mut whitelist = match self.whitelist {
            Some(whitelist) => whitelist,
            None => self
                .functions
                .keys()
                .filter(|name| !name.starts_with('_'))
                .filter(|name| !ADMIN_FUNCTIONS.contains(&name.as_str()))
                .cloned()
                .collect(),
        };
        whitelist.extend(BUILTIN_FUNCTIONS.iter().map(|name| name.to_string()));
        Ok(Module {
            name: self.name,
            functions: self.functions,
            whitelist,
            blacklist: self.blacklist,
        })
    }
}
