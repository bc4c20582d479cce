use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use modmesh_proto::{
    now_unix_ms, CallEnvelope, CallResponse, CodecRegistry, Identity, MeshError, Payload,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::fanout::scatter_gather;
use crate::namespace::{is_address_literal, NamespaceStore};
use crate::transport::Transport;

pub type Kwargs = BTreeMap<String, Payload>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub call_timeout: Duration,
    pub max_fanout: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_fanout: 8,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Result<Self, MeshError> {
        if timeout.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "call_timeout must be positive".to_string(),
            });
        }
        self.call_timeout = timeout;
        Ok(self)
    }

    pub fn with_max_fanout(mut self, max_fanout: usize) -> Result<Self, MeshError> {
        if max_fanout == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "max_fanout must be positive".to_string(),
            });
        }
        self.max_fanout = max_fanout;
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    /// Address the response must be signed by.
    pub expected_responder: Option<String>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expected_responder(mut self, address: impl Into<String>) -> Self {
        self.expected_responder = Some(address.into());
        self
    }
}

/// Signs calls with the local identity and sends them to named modules.
#[derive(Clone)]
pub struct ModuleClient {
    identity: Arc<Identity>,
    codecs: Arc<CodecRegistry>,
    transport: Arc<dyn Transport>,
    namespace: Option<Arc<NamespaceStore>>,
    config: ClientConfig,
}

impl std::fmt::Debug for ModuleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleClient")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModuleClient {
    pub fn new(
        identity: Arc<Identity>,
        codecs: Arc<CodecRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            identity,
            codecs,
            transport,
            namespace: None,
            config: ClientConfig::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: Arc<NamespaceStore>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn resolve(&self, target: &str) -> Result<String, MeshError> {
        match &self.namespace {
            Some(namespace) => namespace.resolve(target),
            None if is_address_literal(target) => Ok(target.to_string()),
            None => Err(MeshError::NotFound {
                name: target.to_string(),
            }),
        }
    }

    pub fn call(
        &self,
        target: &str,
        function: &str,
        args: &[Payload],
        kwargs: &Kwargs,
    ) -> Result<Payload, MeshError> {
        self.call_with(target, function, args, kwargs, &CallOptions::default())
    }

    pub fn call_with(
        &self,
        target: &str,
        function: &str,
        args: &[Payload],
        kwargs: &Kwargs,
        options: &CallOptions,
    ) -> Result<Payload, MeshError> {
        let address = self.resolve(target)?;
        let timeout = options.timeout.unwrap_or(self.config.call_timeout);
        let envelope = CallEnvelope::signed(
            &self.identity,
            &self.codecs,
            function,
            args,
            kwargs,
            now_unix_ms(),
        )?;
        let response_bytes = self
            .transport
            .request(&address, &envelope.to_bytes()?, timeout)?;
        let response = CallResponse::from_bytes(&response_bytes)?;
        response.verify()?;
        if let Some(expected) = options.expected_responder.as_deref() {
            if response.responder_address != expected {
                return Err(MeshError::Authentication {
                    reason: format!(
                        "response signed by {} but expected {}",
                        response.responder_address, expected
                    ),
                });
            }
        }
        debug!(
            target = target,
            address = address.as_str(),
            function = function,
            responder = response.responder_address.as_str(),
            "module call answered"
        );
        response.into_result(&self.codecs)
    }

    /// Calls `function` and parses a structured-record result into `T`.
    pub fn call_json<T: DeserializeOwned>(
        &self,
        target: &str,
        function: &str,
        args: &[Payload],
        kwargs: &Kwargs,
    ) -> Result<T, MeshError> {
        self.call(target, function, args, kwargs)?.parse_record()
    }

    /// Sends the same call to every target concurrently. Each target gets its
    /// own outcome; one failure never aborts the others.
    pub fn call_many(
        &self,
        targets: &[String],
        function: &str,
        args: &[Payload],
        kwargs: &Kwargs,
        options: &CallOptions,
    ) -> Vec<(String, Result<Payload, MeshError>)> {
        let outcomes = scatter_gather(targets, self.config.max_fanout, |target| {
            self.call_with(target, function, args, kwargs, options)
        });
        targets
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(target, outcome)| {
                let outcome = outcome.unwrap_or_else(|reason| {
                    Err(MeshError::Transport {
                        address: target.clone(),
                        reason: format!("call panicked: {}", reason),
                    })
                });
                (target, outcome)
            })
            .collect()
    }
}
