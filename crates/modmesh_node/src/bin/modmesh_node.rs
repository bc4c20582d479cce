use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use modmesh_net::{
    Kwargs, ModuleClient, NamespaceStore, NamespaceSync, PeerRegistry, TcpTransport,
};
use modmesh_node::{
    spawn_namespace_sync, AccessController, CallArgs, Module, ModuleServer, NodeFileConfig,
    StakeSync, StaticStakeOracle,
};
use modmesh_proto::{now_unix_ms, BlobStore, CodecRegistry, FileBlobStore, Identity, Payload};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Options {
    config: PathBuf,
    name: Option<String>,
    bind: Option<String>,
    root: Option<PathBuf>,
    peers: Vec<String>,
    run_for: Option<Duration>,
    call: Option<CallRequest>,
}

#[derive(Debug)]
struct CallRequest {
    target: String,
    function: String,
    args: Vec<Value>,
}

fn usage() -> &'static str {
    "Usage: modmesh_node [--config <path>] [--name <module>] [--bind <host:port>] \\
  [--root <dir>] [--peer <host:port>]... [--run-for-secs <n>]
       modmesh_node [--config <path>] --call <target> --function <name> [--arg <json>]..."
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn parse_args() -> Result<Options, String> {
    let mut config = PathBuf::from("modmesh_node.toml");
    let mut name = None;
    let mut bind = None;
    let mut root = None;
    let mut peers = Vec::new();
    let mut run_for = None;
    let mut call_target = None;
    let mut call_function = None;
    let mut call_args = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = PathBuf::from(next_value(&mut args, "--config")?),
            "--name" => name = Some(next_value(&mut args, "--name")?),
            "--bind" => bind = Some(next_value(&mut args, "--bind")?),
            "--root" => root = Some(PathBuf::from(next_value(&mut args, "--root")?)),
            "--peer" => peers.push(next_value(&mut args, "--peer")?),
            "--run-for-secs" => {
                let value = next_value(&mut args, "--run-for-secs")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid --run-for-secs: {value}"))?;
                run_for = Some(Duration::from_secs(secs));
            }
            "--call" => call_target = Some(next_value(&mut args, "--call")?),
            "--function" => call_function = Some(next_value(&mut args, "--function")?),
            "--arg" => {
                let value = next_value(&mut args, "--arg")?;
                let parsed: Value = serde_json::from_str(&value)
                    .unwrap_or_else(|_| Value::String(value.clone()));
                call_args.push(parsed);
            }
            "-h" | "--help" => return Err(usage().to_string()),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let call = match (call_target, call_function) {
        (Some(target), Some(function)) => Some(CallRequest {
            target,
            function,
            args: call_args,
        }),
        (Some(_), None) => return Err("--call requires --function".to_string()),
        (None, Some(_)) => return Err("--function requires --call".to_string()),
        (None, None) => None,
    };

    Ok(Options {
        config,
        name,
        bind,
        root,
        peers,
        run_for,
        call,
    })
}

fn demo_module(name: &str) -> Result<Module, String> {
    Module::builder(name)
        .function("echo", |call: &CallArgs| Ok(call.arg(0)?.clone()))
        .function("ping", |_: &CallArgs| Ok(Payload::Record(Value::from("pong"))))
        .function("time", |_: &CallArgs| {
            Ok(Payload::Record(Value::from(now_unix_ms())))
        })
        .function("whoami", |call: &CallArgs| {
            Ok(Payload::Record(Value::from(call.caller.clone())))
        })
        .build()
        .map_err(|err| err.to_string())
}

fn run() -> Result<(), String> {
    let options = parse_args()?;
    let mut file_config = NodeFileConfig::load(&options.config).map_err(|err| err.to_string())?;
    if let Some(name) = options.name {
        file_config.node.name = name;
    }
    if let Some(bind) = options.bind {
        file_config.node.bind = bind;
    }
    if let Some(root) = options.root {
        file_config.node.root = root;
    }
    file_config.sync.peers.extend(options.peers);

    let identity =
        Arc::new(Identity::load_or_create(&options.config).map_err(|err| err.to_string())?);
    let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&file_config.node.root));
    let namespace = Arc::new(NamespaceStore::new(Arc::clone(&store)));
    let codecs = Arc::new(CodecRegistry::default());
    let client = ModuleClient::new(
        Arc::clone(&identity),
        Arc::clone(&codecs),
        Arc::new(TcpTransport::new()),
    )
    .with_namespace(Arc::clone(&namespace));

    if let Some(call) = options.call {
        let args: Vec<Payload> = call.args.into_iter().map(Payload::Record).collect();
        let result = client
            .call(&call.target, &call.function, &args, &Kwargs::new())
            .map_err(|err| err.to_string())?;
        match result {
            Payload::Record(value) => println!("{value}"),
            other => println!("{other:?}"),
        }
        return Ok(());
    }

    let access = Arc::new(
        AccessController::new(file_config.access_config().map_err(|err| err.to_string())?)
            .with_store(Arc::clone(&store))
            .map_err(|err| err.to_string())?,
    );
    let server = ModuleServer::new(
        demo_module(&file_config.node.name)?,
        Arc::clone(&identity),
        Arc::clone(&access),
        Arc::clone(&namespace),
        file_config.server_config().map_err(|err| err.to_string())?,
    )
    .with_codecs(Arc::clone(&codecs))
    .with_history_store(Arc::clone(&store));
    let mut handle = server.serve().map_err(|err| err.to_string())?;

    let peers = Arc::new(PeerRegistry::load(Arc::clone(&store)).map_err(|err| err.to_string())?);
    let sync = NamespaceSync::new(
        client,
        Arc::clone(&namespace),
        peers,
        file_config.sync_config().map_err(|err| err.to_string())?,
    )
    .with_self_addresses(handle.self_addresses());
    let mut namespace_runtime = spawn_namespace_sync(sync).map_err(|err| err.to_string())?;

    let oracle = Arc::new(StaticStakeOracle::from_balances(
        file_config.stake.balances.clone(),
    ));
    let stake_sync = StakeSync::new(
        oracle,
        Arc::clone(&access),
        file_config
            .stake_sync_config()
            .map_err(|err| err.to_string())?,
    );
    if let Err(err) = stake_sync.refresh_once() {
        tracing::warn!(error = %err, "initial stake refresh failed");
    }
    let mut stake_runtime = stake_sync.spawn().map_err(|err| err.to_string())?;

    info!(
        module = handle.name(),
        address = handle.advertised_address(),
        key_address = identity.address(),
        "node ready"
    );

    match options.run_for {
        Some(duration) => thread::sleep(duration),
        None => loop {
            thread::park();
        },
    }

    stake_runtime.stop().map_err(|err| err.to_string())?;
    namespace_runtime.stop().map_err(|err| err.to_string())?;
    access.save_usage().map_err(|err| err.to_string())?;
    handle.stop().map_err(|err| err.to_string())?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("modmesh_node failed: {err}");
        std::process::exit(2);
    }
}
