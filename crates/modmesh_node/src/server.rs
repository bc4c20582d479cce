use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use modmesh_net::{read_frame, write_frame, NamespaceScope, NamespaceStore};
use modmesh_proto::{
    get_json, now_unix_ms, put_json, BlobStore, CallEnvelope, CallResponse, CodecRegistry,
    EncodedValue, ErrorCode, ErrorResponse, Identity, MeshError, Payload, ResponseBody,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::AccessController;
use crate::error::NodeError;
use crate::module::{
    CallArgs, Handler, Module, FUNCTIONS_FUNCTION, HISTORY_FUNCTION, INFO_FUNCTION,
    NAMESPACE_FUNCTION, RM_HISTORY_FUNCTION,
};
use crate::runtime_util::lock;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(200);
const BUSY_READ_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_BUSY_REJECTIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    /// Address registered in the namespace; defaults to the bound address.
    pub advertise: Option<String>,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_request_staleness: Duration,
    /// Longest a connection may hold a worker without a frame arriving,
    /// before its first request and between requests.
    pub frame_timeout: Duration,
    /// Socket read/write timeout while a frame is in flight.
    pub idle_timeout: Duration,
    pub audit_history: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:0".to_string(),
            advertise: None,
            worker_count: 8,
            queue_capacity: 64,
            max_request_staleness: Duration::from_secs(60),
            frame_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            audit_history: false,
        }
    }
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>) -> Result<Self, NodeError> {
        let bind = bind.into();
        if bind.trim().is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "bind address cannot be empty".to_string(),
            });
        }
        Ok(Self {
            bind,
            ..Self::default()
        })
    }

    pub fn with_advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }

    pub fn with_workers(
        mut self,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Result<Self, NodeError> {
        if worker_count == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "worker_count must be positive".to_string(),
            });
        }
        if queue_capacity == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "queue_capacity must be positive".to_string(),
            });
        }
        self.worker_count = worker_count;
        self.queue_capacity = queue_capacity;
        Ok(self)
    }

    pub fn with_max_request_staleness(mut self, staleness: Duration) -> Result<Self, NodeError> {
        if staleness.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: "max_request_staleness must be positive".to_string(),
            });
        }
        self.max_request_staleness = staleness;
        Ok(self)
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Result<Self, NodeError> {
        if timeout.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: "frame_timeout must be positive".to_string(),
            });
        }
        self.frame_timeout = timeout;
        Ok(self)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Result<Self, NodeError> {
        if timeout.is_zero() {
            return Err(NodeError::InvalidConfig {
                reason: "idle_timeout must be positive".to_string(),
            });
        }
        self.idle_timeout = timeout;
        Ok(self)
    }

    pub fn with_audit_history(mut self, enabled: bool) -> Self {
        self.audit_history = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub module: String,
    pub function: String,
    pub caller: String,
    pub timestamp_ms: i64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answers signed calls against one module's function table.
pub struct ModuleServer {
    module: Arc<Module>,
    identity: Arc<Identity>,
    codecs: Arc<CodecRegistry>,
    access: Arc<AccessController>,
    namespace: Arc<NamespaceStore>,
    history: Option<Arc<dyn BlobStore>>,
    config: ServerConfig,
    advertised: Mutex<Option<String>>,
    audit_seq: AtomicU64,
}

impl std::fmt::Debug for ModuleServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleServer")
            .field("module", &self.module.name())
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModuleServer {
    pub fn new(
        module: Module,
        identity: Arc<Identity>,
        access: Arc<AccessController>,
        namespace: Arc<NamespaceStore>,
        config: ServerConfig,
    ) -> Self {
        access.add_local_address(identity.address());
        Self {
            module: Arc::new(module),
            identity,
            codecs: Arc::new(CodecRegistry::default()),
            access,
            namespace,
            history: None,
            config,
            advertised: Mutex::new(None),
            audit_seq: AtomicU64::new(0),
        }
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Store for audit records; only written when `audit_history` is on.
    pub fn with_history_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn access(&self) -> &Arc<AccessController> {
        &self.access
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handles one request frame and returns the signed response frame.
    /// Every gate failure, and any panic on the request path, is answered
    /// with an error body; `Err` means the response itself could not be
    /// produced.
    pub fn handle_request_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, MeshError> {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.process(bytes, now_unix_ms())));
        let body = match outcome {
            Ok(Ok(value)) => ResponseBody::Result(value),
            Ok(Err(err)) => ResponseBody::Error(err.to_response()),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(
                    module = self.module.name(),
                    reason = reason.as_str(),
                    "request handling panicked"
                );
                ResponseBody::Error(ErrorResponse::from_code(
                    ErrorCode::ErrInternal,
                    format!("request handling panicked: {}", reason),
                ))
            }
        };
        CallResponse::signed(&self.identity, body, now_unix_ms())?.to_bytes()
    }

    fn process(&self, bytes: &[u8], now_ms: i64) -> Result<EncodedValue, MeshError> {
        let envelope = CallEnvelope::from_bytes(bytes)?;
        self.check_staleness(envelope.timestamp_ms, now_ms)?;
        envelope.verify()?;

        let decision = self.access.verify(
            &envelope.caller_address,
            &envelope.function,
            &self.module,
            now_ms,
        );
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_default();
            debug!(
                caller = envelope.caller_address.as_str(),
                function = envelope.function.as_str(),
                reason = reason.as_str(),
                "call denied"
            );
            return Err(MeshError::Authorization { reason });
        }

        let result = self
            .dispatch(&envelope)
            .and_then(|payload| self.codecs.encode(&payload));
        if let Err(err) = &result {
            warn!(
                module = self.module.name(),
                function = envelope.function.as_str(),
                error = %err,
                "dispatch failed"
            );
        }
        self.audit(&envelope, now_ms, &result);
        result
    }

    /// Rejects timestamps further than `max_request_staleness` from `now_ms`
    /// in either direction.
    fn check_staleness(&self, timestamp_ms: i64, now_ms: i64) -> Result<(), MeshError> {
        let max_staleness_ms =
            i64::try_from(self.config.max_request_staleness.as_millis()).unwrap_or(i64::MAX);
        let age_ms = now_ms.saturating_sub(timestamp_ms);
        if age_ms.saturating_abs() > max_staleness_ms {
            return Err(MeshError::StaleRequest {
                age_ms,
                max_staleness_ms,
            });
        }
        Ok(())
    }

    fn dispatch(&self, envelope: &CallEnvelope) -> Result<Payload, MeshError> {
        let function = envelope.function.as_str();
        let dispatch_error = |reason: String| MeshError::Dispatch {
            function: function.to_string(),
            reason,
        };
        let Some(handler) = self.module.handler(function) else {
            return self.builtin(function).ok_or_else(|| {
                dispatch_error(format!(
                    "module {} has no function {}",
                    self.module.name(),
                    function
                ))
            })?;
        };
        let handler = match handler {
            Handler::Value(value) => return Ok(value.clone()),
            Handler::Callable(handler) => Arc::clone(handler),
        };
        // Argument decoding runs inside the unwind boundary with the handler;
        // the outer `Result` carries decode failures, the inner one the
        // handler's own.
        let outcome = panic::catch_unwind(AssertUnwindSafe(
            || -> Result<Result<Payload, MeshError>, MeshError> {
                let call = CallArgs {
                    caller: envelope.caller_address.clone(),
                    args: self.codecs.decode_args(&envelope.args)?,
                    kwargs: self.codecs.decode_kwargs(&envelope.kwargs)?,
                };
                Ok(handler(&call))
            },
        ));
        match outcome {
            Ok(Err(decode)) => Err(decode),
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(MeshError::Dispatch { reason, .. }))) => Err(dispatch_error(reason)),
            Ok(Ok(Err(err))) => Err(dispatch_error(err.to_string())),
            Err(panic) => Err(dispatch_error(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn builtin(&self, function: &str) -> Option<Result<Payload, MeshError>> {
        match function {
            INFO_FUNCTION => Some(Payload::record(
                &self
                    .module
                    .descriptor(&self.advertised_address(), self.identity.address()),
            )),
            FUNCTIONS_FUNCTION => Some(Payload::record(&self.module.whitelist())),
            NAMESPACE_FUNCTION => Some(
                self.namespace
                    .list(NamespaceScope::Local)
                    .and_then(|names| Payload::record(&names)),
            ),
            HISTORY_FUNCTION => Some(self.history().and_then(|records| Payload::record(&records))),
            RM_HISTORY_FUNCTION => Some(
                self.clear_history()
                    .and_then(|removed| Payload::record(&removed)),
            ),
            _ => None,
        }
    }

    fn history_prefix(&self) -> String {
        format!("history/{}/", sanitize_key_segment(self.module.name()))
    }

    /// Audit records of this module, oldest first.
    pub fn history(&self) -> Result<Vec<AuditRecord>, MeshError> {
        let Some(store) = self.history.as_ref() else {
            return Ok(Vec::new());
        };
        let mut keys = store.keys(&self.history_prefix())?;
        keys.sort();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = get_json::<AuditRecord>(store.as_ref(), &key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Removes every audit record of this module and returns how many
    /// were removed.
    pub fn clear_history(&self) -> Result<usize, MeshError> {
        let Some(store) = self.history.as_ref() else {
            return Ok(0);
        };
        let mut removed = 0;
        for key in store.keys(&self.history_prefix())? {
            if store.remove(&key)? {
                removed += 1;
            }
        }
        info!(module = self.module.name(), removed, "audit history cleared");
        Ok(removed)
    }

    fn audit(&self, envelope: &CallEnvelope, now_ms: i64, result: &Result<EncodedValue, MeshError>) {
        if !self.config.audit_history {
            return;
        }
        let Some(store) = self.history.as_ref() else {
            return;
        };
        let record = AuditRecord {
            module: self.module.name().to_string(),
            function: envelope.function.clone(),
            caller: envelope.caller_address.clone(),
            timestamp_ms: now_ms,
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        let seq = self.audit_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{}{}_{:06}_{}",
            self.history_prefix(),
            now_ms,
            seq,
            sanitize_key_segment(&envelope.caller_address)
        );
        if let Err(err) = put_json(store.as_ref(), &key, &record) {
            warn!(key = key.as_str(), error = %err, "audit record write failed");
        }
    }

    fn advertised_address(&self) -> String {
        lock(&self.advertised).clone().unwrap_or_default()
    }

    /// Binds, registers `name -> address` in the local namespace and starts
    /// the accept thread plus worker pool.
    pub fn serve(self) -> Result<ServerHandle, NodeError> {
        let listener = TcpListener::bind(&self.config.bind).map_err(|err| NodeError::Bind {
            address: self.config.bind.clone(),
            reason: err.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|err| NodeError::Bind {
            address: self.config.bind.clone(),
            reason: err.to_string(),
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|err| NodeError::Bind {
                address: local_addr.to_string(),
                reason: err.to_string(),
            })?;
        let advertised = self
            .config
            .advertise
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        self.namespace.register(self.module.name(), &advertised)?;
        *lock(&self.advertised) = Some(advertised.clone());

        let name = self.module.name().to_string();
        let server = Arc::new(self);
        let running = Arc::new(AtomicBool::new(true));
        let (queue_tx, queue_rx) = mpsc::sync_channel::<TcpStream>(server.config.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handle = ServerHandle {
            name: name.clone(),
            local_addr,
            advertised: advertised.clone(),
            running: Arc::clone(&running),
            server: Arc::clone(&server),
            accept: None,
            workers: Vec::new(),
        };

        for index in 0..server.config.worker_count {
            let worker_server = Arc::clone(&server);
            let worker_rx = Arc::clone(&queue_rx);
            let worker_running = Arc::clone(&running);
            let worker = thread::Builder::new()
                .name(format!("modmesh-{}-worker-{}", name, index))
                .spawn(move || worker_loop(&worker_server, &worker_rx, &worker_running))
                .map_err(|err| NodeError::ThreadSpawnFailed {
                    reason: err.to_string(),
                });
            match worker {
                Ok(worker) => handle.workers.push(worker),
                Err(err) => {
                    drop(queue_tx);
                    let _ = handle.stop();
                    return Err(err);
                }
            }
        }

        let accept_server = Arc::clone(&server);
        let accept_running = Arc::clone(&running);
        let accept = thread::Builder::new()
            .name(format!("modmesh-{}-accept", name))
            .spawn(move || accept_loop(&accept_server, listener, &accept_running, queue_tx))
            .map_err(|err| NodeError::ThreadSpawnFailed {
                reason: err.to_string(),
            });
        match accept {
            Ok(accept) => handle.accept = Some(accept),
            Err(err) => {
                let _ = handle.stop();
                return Err(err);
            }
        }

        info!(
            module = name.as_str(),
            bind = %local_addr,
            advertised = advertised.as_str(),
            key_address = server.identity.address(),
            workers = server.config.worker_count,
            "module server started"
        );
        Ok(handle)
    }

    fn busy_response(&self) -> Result<Vec<u8>, MeshError> {
        let error = MeshError::Busy {
            reason: "request queue is full".to_string(),
        };
        CallResponse::signed(
            &self.identity,
            ResponseBody::Error(error.to_response()),
            now_unix_ms(),
        )?
        .to_bytes()
    }
}

fn accept_loop(
    server: &Arc<ModuleServer>,
    listener: TcpListener,
    running: &AtomicBool,
    queue: SyncSender<TcpStream>,
) {
    let rejections = Arc::new(AtomicUsize::new(0));
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    debug!(peer = %peer, error = %err, "dropping connection");
                    continue;
                }
                match queue.try_send(stream) {
                    Ok(()) => {}
                    Err(TrySendError::Full(stream)) => {
                        debug!(peer = %peer, "worker queue full; answering busy");
                        reject_busy(server, stream, &rejections);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Answers a connection the worker pool has no room for on a detached
/// thread, so the accept loop never waits on the caller. At most
/// `MAX_BUSY_REJECTIONS` run at once; beyond that the socket is dropped.
fn reject_busy(server: &Arc<ModuleServer>, stream: TcpStream, rejections: &Arc<AtomicUsize>) {
    if rejections.fetch_add(1, Ordering::SeqCst) >= MAX_BUSY_REJECTIONS {
        rejections.fetch_sub(1, Ordering::SeqCst);
        return;
    }
    let server = Arc::clone(server);
    let in_flight = Arc::clone(rejections);
    let spawned = thread::Builder::new()
        .name("modmesh-busy".to_string())
        .spawn(move || {
            write_busy(&server, stream);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    if let Err(err) = spawned {
        rejections.fetch_sub(1, Ordering::SeqCst);
        warn!(error = %err, "busy rejection thread failed to start");
    }
}

/// Writes the busy answer first, then drains the pending request so
/// closing the socket does not reset the connection before the caller
/// reads the answer.
fn write_busy(server: &ModuleServer, mut stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(BUSY_READ_TIMEOUT));
    let _ = stream.set_write_timeout(Some(BUSY_READ_TIMEOUT));
    match server.busy_response() {
        Ok(response) => {
            let _ = write_frame(&mut stream, &response);
            let _ = stream.shutdown(Shutdown::Write);
            let _ = read_frame(&mut stream);
        }
        Err(err) => warn!(error = %err, "busy response failed"),
    }
}

/// Serves queued connections until the queue closes. A panic while serving
/// one connection drops that connection and keeps the worker alive.
fn worker_loop(server: &ModuleServer, queue: &Mutex<Receiver<TcpStream>>, running: &AtomicBool) {
    loop {
        let next = lock(queue).recv();
        match next {
            Ok(stream) => {
                let served = panic::catch_unwind(AssertUnwindSafe(|| {
                    serve_connection(server, stream, running)
                }));
                match served {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!(error = %err, "connection closed with error"),
                    Err(panic) => warn!(
                        module = server.module.name(),
                        reason = panic_message(panic.as_ref()).as_str(),
                        "connection handling panicked"
                    ),
                }
            }
            Err(_) => break,
        }
    }
}

/// Waits up to `frame_timeout` for the next frame, in short slices so a
/// stopping server is not held up by idle connections.
fn wait_for_frame(
    stream: &TcpStream,
    frame_timeout: Duration,
    running: &AtomicBool,
) -> io::Result<bool> {
    let idle_since = Instant::now();
    stream.set_read_timeout(Some(CONNECTION_POLL_INTERVAL.min(frame_timeout)))?;
    let mut pending = [0_u8; 1];
    loop {
        if !running.load(Ordering::SeqCst) || idle_since.elapsed() >= frame_timeout {
            return Ok(false);
        }
        match stream.peek(&mut pending) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Answers frames on one connection until the peer closes, goes idle, or
/// the server stops.
fn serve_connection(
    server: &ModuleServer,
    mut stream: TcpStream,
    running: &AtomicBool,
) -> io::Result<()> {
    stream.set_write_timeout(Some(server.config.idle_timeout))?;
    loop {
        if !wait_for_frame(&stream, server.config.frame_timeout, running)? {
            return Ok(());
        }
        stream.set_read_timeout(Some(server.config.idle_timeout))?;
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        match server.handle_request_bytes(&frame) {
            Ok(response) => write_frame(&mut stream, &response)?,
            Err(err) => {
                warn!(error = %err, "response encoding failed");
                return Ok(());
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

fn sanitize_key_segment(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// A running server. Stopping (or dropping) deregisters the module name
/// and joins every thread.
pub struct ServerHandle {
    name: String,
    local_addr: SocketAddr,
    advertised: String,
    running: Arc<AtomicBool>,
    server: Arc<ModuleServer>,
    accept: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("advertised", &self.advertised)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertised_address(&self) -> &str {
        &self.advertised
    }

    /// Every address that reaches this server: the advertised one, the
    /// bound one and, for a wildcard bind, the loopback forms.
    pub fn self_addresses(&self) -> Vec<String> {
        let port = self.local_addr.port();
        let mut addresses = BTreeSet::from([self.advertised.clone(), self.local_addr.to_string()]);
        if self.local_addr.ip().is_unspecified() {
            addresses.insert(format!("127.0.0.1:{}", port));
            addresses.insert(format!("localhost:{}", port));
            addresses.insert(format!("[::1]:{}", port));
        }
        addresses.into_iter().collect()
    }

    pub fn server(&self) -> &Arc<ModuleServer> {
        &self.server
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) -> Result<(), NodeError> {
        if !self.running.swap(false, Ordering::SeqCst) && self.accept.is_none() {
            return Err(NodeError::NotRunning {
                name: self.name.clone(),
            });
        }
        let mut join_failed = false;
        if let Some(accept) = self.accept.take() {
            join_failed |= accept.join().is_err();
        }
        for worker in self.workers.drain(..) {
            join_failed |= worker.join().is_err();
        }
        self.server.namespace.deregister(&self.name)?;
        info!(module = self.name.as_str(), "module server stopped");
        if join_failed {
            return Err(NodeError::ThreadJoinFailed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) || self.accept.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessConfig;
    use modmesh_proto::InMemoryBlobStore;
    use serde_json::json;

    fn server_with(config: ServerConfig) -> (ModuleServer, Arc<InMemoryBlobStore>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let module = Module::builder("calc")
            .function("add", |call: &CallArgs| {
                let a: i64 = call.record_param("a", 0)?;
                let b: i64 = call.record_param("b", 1)?;
                Ok(Payload::Record(json!(a + b)))
            })
            .function("explode", |_: &CallArgs| -> Result<Payload, MeshError> {
                panic!("kaboom")
            })
            .value("version", Payload::Record(json!("1.2.0")))
            .build()
            .expect("module");
        let server = ModuleServer::new(
            module,
            Arc::new(Identity::from_seed([9; 32])),
            Arc::new(AccessController::new(
                AccessConfig::new().with_rates(100, 100, 1000).expect("rates"),
            )),
            Arc::new(NamespaceStore::new(blobs.clone())),
            config,
        )
        .with_history_store(blobs.clone());
        (server, blobs)
    }

    fn call(
        server: &ModuleServer,
        caller: &Identity,
        function: &str,
        args: &[Payload],
        ts: i64,
    ) -> Result<Payload, MeshError> {
        let codecs = CodecRegistry::default();
        let envelope =
            CallEnvelope::signed(caller, &codecs, function, args, &BTreeMap::new(), ts)
                .expect("envelope");
        let response_bytes = server
            .handle_request_bytes(&envelope.to_bytes().expect("encode"))
            .expect("response");
        let response = CallResponse::from_bytes(&response_bytes).expect("decode response");
        response.verify().expect("response signature");
        assert_eq!(response.responder_address, server.identity().address());
        response.into_result(&codecs)
    }

    #[test]
    fn dispatches_callables_values_and_builtins() {
        let (server, _) = server_with(ServerConfig::default());
        let caller = Identity::from_seed([1; 32]);
        let now = now_unix_ms();
        let args = [Payload::Record(json!(2)), Payload::Record(json!(3))];
        assert_eq!(
            call(&server, &caller, "add", &args, now),
            Ok(Payload::Record(json!(5)))
        );
        let functions: Vec<String> = call(&server, &caller, "functions", &[], now)
            .expect("functions")
            .parse_record()
            .expect("list");
        assert!(functions.contains(&"add".to_string()));
        assert!(functions.contains(&"info".to_string()));
        assert_eq!(
            call(&server, &caller, "version", &[], now),
            Ok(Payload::Record(json!("1.2.0")))
        );
    }

    #[test]
    fn stale_and_future_requests_are_rejected() {
        let (server, _) = server_with(ServerConfig::default());
        let caller = Identity::from_seed([1; 32]);
        let now = now_unix_ms();
        let stale = call(&server, &caller, "version", &[], now - 61_000).expect_err("stale");
        match stale {
            MeshError::StaleRequest {
                age_ms,
                max_staleness_ms,
            } => {
                assert!(age_ms >= 61_000, "{age_ms}");
                assert_eq!(max_staleness_ms, 60_000);
            }
            other => panic!("expected stale request, got {other:?}"),
        }
        assert!(call(&server, &caller, "version", &[], now + 61_000).is_err());
        assert!(call(&server, &caller, "version", &[], now - 30_000).is_ok());
    }

    #[test]
    fn handler_panic_becomes_dispatch_error() {
        let (server, _) = server_with(ServerConfig::default());
        let caller = Identity::from_seed([1; 32]);
        let err = call(&server, &caller, "explode", &[], now_unix_ms()).expect_err("panic");
        match err {
            MeshError::Dispatch { reason, .. } => assert!(reason.contains("kaboom"), "{reason}"),
            other => panic!("expected dispatch error, got {other:?}"),
        }
    }

    #[test]
    fn missing_argument_is_a_dispatch_error() {
        let (server, _) = server_with(ServerConfig::default());
        let caller = Identity::from_seed([1; 32]);
        let err = call(&server, &caller, "add", &[Payload::Record(json!(1))], now_unix_ms())
            .expect_err("missing arg");
        assert!(matches!(err, MeshError::Dispatch { .. }));
    }

    #[test]
    fn garbage_frame_gets_signed_decode_error() {
        let (server, _) = server_with(ServerConfig::default());
        let bytes = server.handle_request_bytes(b"\x00\x01garbage").expect("response");
        let response = CallResponse::from_bytes(&bytes).expect("decode");
        response.verify().expect("signed");
        assert!(matches!(
            response.into_result(&CodecRegistry::default()),
            Err(MeshError::Decode { .. })
        ));
    }

    #[test]
    fn audit_history_records_each_dispatched_call() {
        let (server, blobs) = server_with(ServerConfig::default().with_audit_history(true));
        let caller = Identity::from_seed([1; 32]);
        call(&server, &caller, "version", &[], now_unix_ms()).expect("call");
        let _ = call(&server, &caller, "explode", &[], now_unix_ms());
        let keys = blobs.keys("history/calc/").expect("keys");
        assert_eq!(keys.len(), 2);
        let records: Vec<AuditRecord> = keys
            .iter()
            .map(|key| {
                modmesh_proto::get_json::<AuditRecord>(blobs.as_ref(), key)
                    .expect("read")
                    .expect("present")
            })
            .collect();
        assert!(records.iter().any(|record| record.ok && record.function == "version"));
        assert!(records.iter().any(|record| !record.ok && record.function == "explode"));
        assert!(records.iter().all(|record| record.caller == caller.address()));
    }

    /// Tensor frame whose header declares shape `[u64::MAX, 2]` and no data.
    fn overflowing_tensor() -> EncodedValue {
        let mut header = vec![0xa3];
        for (key, value) in [("dtype", "uint8"), ("wire_dtype", "uint8")] {
            header.push(0x60 + key.len() as u8);
            header.extend_from_slice(key.as_bytes());
            header.push(0x60 + value.len() as u8);
            header.extend_from_slice(value.as_bytes());
        }
        header.push(0x65);
        header.extend_from_slice(b"shape");
        header.extend_from_slice(&[0x82, 0x1b]);
        header.extend_from_slice(&u64::MAX.to_be_bytes());
        header.push(0x02);
        let mut data = (header.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&header);
        EncodedValue {
            tag: "tensor".to_string(),
            data,
        }
    }

    #[test]
    fn overflowing_tensor_argument_gets_signed_decode_error() {
        let (server, _) = server_with(ServerConfig::default());
        let caller = Identity::from_seed([1; 32]);
        let codecs = CodecRegistry::default();
        let mut envelope =
            CallEnvelope::signed(&caller, &codecs, "add", &[], &BTreeMap::new(), now_unix_ms())
                .expect("envelope");
        envelope.args = vec![overflowing_tensor()];
        envelope.signature_hex = caller.sign(&envelope.signing_bytes().expect("signing bytes"));

        let bytes = server
            .handle_request_bytes(&envelope.to_bytes().expect("encode"))
            .expect("response");
        let response = CallResponse::from_bytes(&bytes).expect("decode");
        response.verify().expect("signed");
        assert!(matches!(
            response.into_result(&codecs),
            Err(MeshError::Decode { .. })
        ));
        assert_eq!(
            call(&server, &caller, "version", &[], now_unix_ms()),
            Ok(Payload::Record(json!("1.2.0")))
        );
    }

    struct ExplodingTensorCodec;

    impl modmesh_proto::Codec for ExplodingTensorCodec {
        fn tag(&self) -> &'static str {
            "tensor"
        }

        fn encode(&self, _payload: &Payload) -> Result<Vec<u8>, MeshError> {
            panic!("tensor codec exploded")
        }

        fn decode(&self, _bytes: &[u8]) -> Result<Payload, MeshError> {
            Err(MeshError::Decode {
                reason: "unused".to_string(),
            })
        }
    }

    #[test]
    fn panic_outside_the_handler_becomes_internal_error() {
        let module = Module::builder("calc")
            .function("tensor", |_: &CallArgs| {
                Ok(Payload::Tensor(modmesh_proto::Tensor::new(
                    vec![1],
                    modmesh_proto::TensorData::Uint8(vec![1]),
                )?))
            })
            .build()
            .expect("module");
        let mut codecs = CodecRegistry::default();
        codecs.register(Arc::new(ExplodingTensorCodec));
        let server = ModuleServer::new(
            module,
            Arc::new(Identity::from_seed([9; 32])),
            Arc::new(AccessController::new(AccessConfig::default())),
            Arc::new(NamespaceStore::new(Arc::new(InMemoryBlobStore::new()))),
            ServerConfig::default(),
        )
        .with_codecs(Arc::new(codecs));
        let caller = Identity::from_seed([1; 32]);
        match call(&server, &caller, "tensor", &[], now_unix_ms()) {
            Err(MeshError::Remote {
                code: ErrorCode::ErrInternal,
                message,
            }) => assert!(message.contains("tensor codec exploded"), "{message}"),
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[test]
    fn history_builtins_are_admin_only() {
        let (server, _) = server_with(ServerConfig::default().with_audit_history(true));
        let admin = Identity::from_seed([2; 32]);
        let outsider = Identity::from_seed([3; 32]);
        server.access().add_admin(admin.address());
        let now = now_unix_ms();

        match call(&server, &outsider, HISTORY_FUNCTION, &[], now) {
            Err(MeshError::Authorization { reason }) => {
                assert_eq!(reason, "Function history not in whitelist")
            }
            other => panic!("expected whitelist denial, got {other:?}"),
        }

        call(&server, &admin, "version", &[], now).expect("version");
        let records: Vec<AuditRecord> = call(&server, &admin, HISTORY_FUNCTION, &[], now)
            .expect("history")
            .parse_record()
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].function, "version");

        let removed: usize = call(&server, &admin, RM_HISTORY_FUNCTION, &[], now)
            .expect("rm_history")
            .parse_record()
            .expect("count");
        assert_eq!(removed, 2);
        let left = server.history().expect("history");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].function, RM_HISTORY_FUNCTION);
        assert_eq!(server.clear_history().expect("clear"), 1);
    }

    #[test]
    fn config_builders_validate() {
        assert!(ServerConfig::new("").is_err());
        assert!(ServerConfig::default().with_workers(0, 1).is_err());
        assert!(ServerConfig::default().with_workers(1, 0).is_err());
        assert!(ServerConfig::default()
            .with_max_request_staleness(Duration::ZERO)
            .is_err());
        assert!(ServerConfig::default()
            .with_frame_timeout(Duration::ZERO)
            .is_err());
    }
}
