use super::*;
use modmesh_net::{
    read_frame, Kwargs, ModuleClient, NamespaceStore, NamespaceSync, NamespaceSyncConfig,
    PeerRegistry, TcpTransport, Transport,
};
use modmesh_proto::{
    now_unix_ms, BlobStore, CallEnvelope, CallResponse, Codec, CodecRegistry, ErrorCode,
    Identity, InMemoryBlobStore, MeshError, Payload, Tensor, TensorData,
};
use serde_json::json;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

struct TestNode {
    handle: ServerHandle,
    namespace: Arc<NamespaceStore>,
    blobs: Arc<InMemoryBlobStore>,
}

fn calc_module(name: &str) -> Module {
    Module::builder(name)
        .function("add", |call: &CallArgs| {
            let a: i64 = call.record_param("a", 0)?;
            let b: i64 = call.record_param("b", 1)?;
            Ok(Payload::Record(json!(a + b)))
        })
        .function("ping", |_: &CallArgs| Ok(Payload::Record(json!("pong"))))
        .function("secret", |_: &CallArgs| Ok(Payload::Record(json!("classified"))))
        .blacklist(["secret"])
        .build()
        .expect("module")
}

fn start_node(module: Module, seed: u8, access: AccessConfig, config: ServerConfig) -> TestNode {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let namespace = Arc::new(NamespaceStore::new(blobs.clone()));
    let server = ModuleServer::new(
        module,
        Arc::new(Identity::from_seed([seed; 32])),
        Arc::new(AccessController::new(access)),
        Arc::clone(&namespace),
        config,
    );
    let handle = server.serve().expect("serve");
    TestNode {
        handle,
        namespace,
        blobs,
    }
}

fn loopback_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0")
        .expect("config")
        .with_idle_timeout(Duration::from_secs(5))
        .expect("idle timeout")
}

fn client_for(seed: u8, namespace: Option<Arc<NamespaceStore>>) -> ModuleClient {
    let client = ModuleClient::new(
        Arc::new(Identity::from_seed([seed; 32])),
        Arc::new(CodecRegistry::default()),
        Arc::new(TcpTransport::new()),
    );
    match namespace {
        Some(namespace) => client.with_namespace(namespace),
        None => client,
    }
}

#[test]
fn tcp_round_trip_registers_and_deregisters_module_name() {
    let mut node = start_node(calc_module("calc"), 7, AccessConfig::default(), loopback_config());
    let address = node.handle.local_addr().to_string();
    assert_eq!(node.namespace.resolve("calc").expect("resolve"), address);

    let client = client_for(1, Some(Arc::clone(&node.namespace)));
    let sum: i64 = client
        .call_json(
            "calc",
            "add",
            &[Payload::Record(json!(20)), Payload::Record(json!(22))],
            &Kwargs::new(),
        )
        .expect("add");
    assert_eq!(sum, 42);

    let mut kwargs = Kwargs::new();
    kwargs.insert("a".to_string(), Payload::Record(json!(1)));
    kwargs.insert("b".to_string(), Payload::Record(json!(2)));
    let sum: i64 = client
        .call_json(&address, "add", &[], &kwargs)
        .expect("add by address");
    assert_eq!(sum, 3);

    node.handle.stop().expect("stop");
    assert!(matches!(
        node.namespace.resolve("calc"),
        Err(MeshError::NotFound { .. })
    ));
    assert!(!node.blobs.keys("namespace/").expect("keys").is_empty());
}

#[test]
fn tampered_envelope_is_rejected_with_authentication_error() {
    let node = start_node(calc_module("calc"), 7, AccessConfig::default(), loopback_config());
    let caller = Identity::from_seed([1; 32]);
    let codecs = CodecRegistry::default();
    let mut envelope = CallEnvelope::signed(
        &caller,
        &codecs,
        "ping",
        &[],
        &Kwargs::new(),
        now_unix_ms(),
    )
    .expect("envelope");
    envelope.function = "add".to_string();

    let response_bytes = TcpTransport::new()
        .request(
            &node.handle.local_addr().to_string(),
            &envelope.to_bytes().expect("encode"),
            Duration::from_secs(5),
        )
        .expect("response");
    let response = CallResponse::from_bytes(&response_bytes).expect("decode");
    response.verify().expect("response is signed");
    assert!(matches!(
        response.into_result(&codecs),
        Err(MeshError::Authentication { .. })
    ));
}

#[test]
fn concurrent_calls_from_one_caller_share_a_single_window() {
    let access = Arc::new(AccessController::new(AccessConfig::default()));
    let module = Arc::new(calc_module("calc"));
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let allowed = Arc::new(AtomicUsize::new(0));
    let now = 1_000_000;

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let access = Arc::clone(&access);
            let module = Arc::clone(&module);
            let barrier = Arc::clone(&barrier);
            let allowed = Arc::clone(&allowed);
            thread::spawn(move || {
                barrier.wait();
                if access.verify("caller-a", "ping", &module, now).allowed {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }

    assert_eq!(allowed.load(Ordering::SeqCst), 2);
    let quota = access.quota("caller-a", "ping", now);
    assert_eq!(quota.count, threads as u64);
    assert_eq!(quota.remaining(), 0);
}

#[test]
fn rate_limit_and_stake_apply_over_the_wire() {
    let node = start_node(calc_module("calc"), 7, AccessConfig::default(), loopback_config());
    let client = client_for(2, Some(Arc::clone(&node.namespace)));
    let caller = client.identity().address().to_string();

    for _ in 0..2 {
        client
            .call("calc", "ping", &[], &Kwargs::new())
            .expect("within base rate");
    }
    match client.call("calc", "ping", &[], &Kwargs::new()) {
        Err(MeshError::Authorization { reason }) => {
            assert_eq!(reason, "Rate limit exceeded: 3 > limit 2")
        }
        other => panic!("expected rate limit denial, got {other:?}"),
    }

    let access = Arc::clone(node.handle.server().access());
    let oracle = Arc::new(StaticStakeOracle::new().with_stake(caller.as_str(), 1_000));
    StakeSync::new(oracle, Arc::clone(&access), StakeSyncConfig::default())
        .refresh_once()
        .expect("refresh");
    assert_eq!(access.quota(&caller, "ping", now_unix_ms()).rate_limit, 12);
    client
        .call("calc", "ping", &[], &Kwargs::new())
        .expect("stake raised the limit");
}

#[test]
fn admin_bypasses_blacklist_while_others_are_denied() {
    let admin = Identity::from_seed([3; 32]);
    let node = start_node(
        calc_module("calc"),
        7,
        AccessConfig::default().with_admins([admin.address()]),
        loopback_config(),
    );

    let outsider = client_for(4, Some(Arc::clone(&node.namespace)));
    match outsider.call("calc", "secret", &[], &Kwargs::new()) {
        Err(MeshError::Authorization { reason }) => {
            assert_eq!(reason, "Function secret is blacklisted")
        }
        other => panic!("expected blacklist denial, got {other:?}"),
    }
    match outsider.call("calc", "_internal", &[], &Kwargs::new()) {
        Err(MeshError::Authorization { reason }) => {
            assert_eq!(reason, "Function _internal is private")
        }
        other => panic!("expected private denial, got {other:?}"),
    }

    let insider = client_for(3, Some(Arc::clone(&node.namespace)));
    assert_eq!(
        insider.call("calc", "secret", &[], &Kwargs::new()),
        Ok(Payload::Record(json!("classified")))
    );
}

#[test]
fn namespace_sync_discovers_modules_on_remote_servers() {
    let alpha = start_node(calc_module("alpha"), 7, AccessConfig::default(), loopback_config());
    let beta = start_node(calc_module("beta"), 8, AccessConfig::default(), loopback_config());
    let beta_address = beta.handle.local_addr().to_string();

    let client = client_for(7, Some(Arc::clone(&alpha.namespace)));
    let peers = Arc::new(PeerRegistry::load(alpha.blobs.clone()).expect("peers"));
    let sync = NamespaceSync::new(
        client.clone(),
        Arc::clone(&alpha.namespace),
        Arc::clone(&peers),
        NamespaceSyncConfig::new()
            .with_call_timeout(Duration::from_secs(2))
            .expect("timeout")
            .with_boot_peers(vec![
                beta_address.clone(),
                alpha.handle.local_addr().to_string(),
            ]),
    )
    .with_self_address(alpha.handle.advertised_address());

    let report = sync.sync_once().expect("sync");
    assert_eq!(report.reached, vec![beta_address.clone()]);
    assert!(report.failed.is_empty());
    assert_eq!(report.global_size, 2);
    assert_eq!(alpha.namespace.resolve("beta").expect("resolve"), beta_address);
    assert_eq!(
        client.call("beta", "ping", &[], &Kwargs::new()),
        Ok(Payload::Record(json!("pong")))
    );
    assert!(peers.get(&beta_address).expect("peer").last_sync_ms.is_some());
}

fn sync_between(
    alpha: &TestNode,
    beta: &TestNode,
    interval: Duration,
) -> NamespaceSync {
    NamespaceSync::new(
        client_for(7, Some(Arc::clone(&alpha.namespace))),
        Arc::clone(&alpha.namespace),
        Arc::new(PeerRegistry::load(alpha.blobs.clone()).expect("peers")),
        NamespaceSyncConfig::new()
            .with_interval(interval)
            .expect("interval")
            .with_boot_peers(vec![beta.handle.local_addr().to_string()]),
    )
}

#[test]
fn namespace_sync_runtime_runs_first_round_before_returning() {
    let alpha = start_node(calc_module("alpha"), 7, AccessConfig::default(), loopback_config());
    let beta = start_node(calc_module("beta"), 8, AccessConfig::default(), loopback_config());
    let sync = sync_between(&alpha, &beta, Duration::from_secs(60));
    let mut runtime = spawn_namespace_sync(sync).expect("spawn");
    assert_eq!(
        alpha.namespace.resolve("beta").expect("resolved by the first round"),
        beta.handle.local_addr().to_string()
    );
    assert_eq!(runtime.snapshot().tick_count, 0);
    runtime.stop().expect("stop");
}

#[test]
fn namespace_sync_runtime_ticks_in_background() {
    let alpha = start_node(calc_module("alpha"), 7, AccessConfig::default(), loopback_config());
    let beta = start_node(calc_module("beta"), 8, AccessConfig::default(), loopback_config());
    let sync = sync_between(&alpha, &beta, Duration::from_millis(50));
    let mut runtime = spawn_namespace_sync(sync).expect("spawn");
    for _ in 0..100 {
        if runtime.snapshot().tick_count >= 1 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    runtime.stop().expect("stop");
    assert!(runtime.snapshot().tick_count >= 1);
    assert!(!runtime.is_running());
}

#[test]
fn wildcard_bound_node_skips_itself_under_loopback_address() {
    let config = ServerConfig::new("0.0.0.0:0")
        .expect("config")
        .with_idle_timeout(Duration::from_secs(5))
        .expect("idle timeout");
    let node = start_node(calc_module("solo"), 7, AccessConfig::default(), config);
    let port = node.handle.local_addr().port();
    let loopback = format!("127.0.0.1:{}", port);
    assert!(node.handle.self_addresses().contains(&loopback));

    let sync = NamespaceSync::new(
        client_for(7, Some(Arc::clone(&node.namespace))),
        Arc::clone(&node.namespace),
        Arc::new(PeerRegistry::load(node.blobs.clone()).expect("peers")),
        NamespaceSyncConfig::new().with_boot_peers(vec![loopback]),
    )
    .with_self_addresses(node.handle.self_addresses());
    let report = sync.sync_once().expect("sync");
    assert!(report.reached.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(report.global_size, 1);
}

#[test]
fn full_queue_is_answered_with_busy_before_the_request_is_read() {
    let config = loopback_config()
        .with_workers(1, 1)
        .expect("workers")
        .with_frame_timeout(Duration::from_secs(5))
        .expect("frame timeout");
    let mut node = start_node(calc_module("calc"), 7, AccessConfig::default(), config);
    let address = node.handle.local_addr().to_string();

    let held = TcpStream::connect(&address).expect("first connection");
    thread::sleep(Duration::from_millis(200));
    let queued = TcpStream::connect(&address).expect("second connection");
    thread::sleep(Duration::from_millis(200));

    let mut silent = TcpStream::connect(&address).expect("silent connection");
    silent
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let frame = read_frame(&mut silent)
        .expect("read busy answer")
        .expect("busy frame");
    let response = CallResponse::from_bytes(&frame).expect("decode");
    response.verify().expect("signed");
    assert!(matches!(
        response.into_result(&CodecRegistry::default()),
        Err(MeshError::Busy { .. })
    ));

    let client = client_for(5, None);
    assert!(matches!(
        client.call(&address, "ping", &[], &Kwargs::new()),
        Err(MeshError::Busy { .. })
    ));

    drop(held);
    drop(queued);
    drop(silent);
    node.handle.stop().expect("stop");
}

#[test]
fn idle_connections_do_not_starve_callers() {
    let config = loopback_config()
        .with_workers(2, 4)
        .expect("workers")
        .with_frame_timeout(Duration::from_millis(200))
        .expect("frame timeout");
    let node = start_node(calc_module("calc"), 7, AccessConfig::default(), config);
    let address = node.handle.local_addr().to_string();

    let idle: Vec<TcpStream> = (0..4)
        .map(|_| TcpStream::connect(&address).expect("idle connection"))
        .collect();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let client = client_for(5, None);
    assert_eq!(
        client.call(&address, "ping", &[], &Kwargs::new()),
        Ok(Payload::Record(json!("pong")))
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    drop(idle);
}

struct ExplodingTensorCodec;

impl Codec for ExplodingTensorCodec {
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
fn worker_survives_a_panicking_request() {
    let module = Module::builder("calc")
        .function("tensor", |_: &CallArgs| {
            Ok(Payload::Tensor(Tensor::new(
                vec![1],
                TensorData::Uint8(vec![1]),
            )?))
        })
        .function("ping", |_: &CallArgs| Ok(Payload::Record(json!("pong"))))
        .build()
        .expect("module");
    let mut codecs = CodecRegistry::default();
    codecs.register(Arc::new(ExplodingTensorCodec));
    let server = ModuleServer::new(
        module,
        Arc::new(Identity::from_seed([7; 32])),
        Arc::new(AccessController::new(
            AccessConfig::new().with_rates(100, 100, 1000).expect("rates"),
        )),
        Arc::new(NamespaceStore::new(Arc::new(InMemoryBlobStore::new()))),
        loopback_config().with_workers(1, 4).expect("workers"),
    )
    .with_codecs(Arc::new(codecs));
    let mut handle = server.serve().expect("serve");
    let address = handle.local_addr().to_string();

    let client = client_for(5, None);
    match client.call(&address, "tensor", &[], &Kwargs::new()) {
        Err(MeshError::Remote {
            code: ErrorCode::ErrInternal,
            message,
        }) => assert!(message.contains("tensor codec exploded"), "{message}"),
        other => panic!("expected internal error, got {other:?}"),
    }
    assert_eq!(
        client.call(&address, "ping", &[], &Kwargs::new()),
        Ok(Payload::Record(json!("pong")))
    );
    handle.stop().expect("stop");
}

/// Blob store whose writes can be switched to fail.
#[derive(Default)]
struct FlakyBlobStore {
    inner: InMemoryBlobStore,
    fail_writes: AtomicBool,
}

impl FlakyBlobStore {
    fn check(&self, key: &str) -> Result<(), MeshError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Storage {
                key: key.to_string(),
                reason: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

impl BlobStore for FlakyBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MeshError> {
        self.check(key)?;
        self.inner.put(key, bytes)
    }

    fn remove(&self, key: &str) -> Result<bool, MeshError> {
        self.check(key)?;
        self.inner.remove(key)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, MeshError> {
        self.inner.keys(prefix)
    }
}

fn server_on(store: Arc<FlakyBlobStore>) -> ModuleServer {
    ModuleServer::new(
        calc_module("calc"),
        Arc::new(Identity::from_seed([7; 32])),
        Arc::new(AccessController::new(AccessConfig::default())),
        Arc::new(NamespaceStore::new(store)),
        loopback_config(),
    )
}

#[test]
fn namespace_write_failures_surface_as_storage_errors() {
    let store = Arc::new(FlakyBlobStore::default());
    store.fail_writes.store(true, Ordering::SeqCst);
    match server_on(Arc::clone(&store)).serve() {
        Err(NodeError::Mesh(MeshError::Storage { key, .. })) => {
            assert_eq!(key, "namespace/local")
        }
        other => panic!("expected storage error on register, got {other:?}"),
    }

    store.fail_writes.store(false, Ordering::SeqCst);
    let mut handle = server_on(Arc::clone(&store)).serve().expect("serve");
    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        handle.stop(),
        Err(NodeError::Mesh(MeshError::Storage { .. }))
    ));
    assert!(!handle.is_running());
}
