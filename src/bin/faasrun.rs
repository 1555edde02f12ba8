//! faasrun - polyglot FaaS host CLI
//!
//! ## Usage
//!
//! ```sh
//! faasrun upload <manifestPath>
//! faasrun serve [--port N]
//! faasrun list
//! ```
//!
//! `upload` resolves a JSONC manifest into a function asset and persists it
//! under `.faas/functions/`, printing the (possibly minted) id. `serve`
//! starts the HTTP dispatcher. `list` prints the stored functions.
//!
//! Exit code 0 on success, non-zero on argument or I/O failure. Progress
//! goes to stdout, errors to stderr.

use faasrun::assets::{AssetStore, parse_manifest, resolve_manifest};
use faasrun::blocklist::EgressFilter;
use faasrun::config::Config;
use faasrun::engine::{EngineRegistry, Invoker};
use faasrun::netproxy::VirtualNetwork;
use faasrun::resources::ResourceStore;
use faasrun::web::{AppState, serve};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug)]
enum Command {
    Upload { manifest: PathBuf },
    Serve { port: Option<u16> },
    List,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "upload" => {
            if args.len() < 3 {
                return Err("upload requires <manifestPath>".to_string());
            }
            Ok(Command::Upload {
                manifest: PathBuf::from(&args[2]),
            })
        }
        "serve" => {
            let mut port = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--port" | "-p" => {
                        if i + 1 < args.len() {
                            port = Some(
                                args[i + 1]
                                    .parse::<u16>()
                                    .map_err(|_| format!("invalid port: {}", args[i + 1]))?,
                            );
                            i += 2;
                        } else {
                            return Err("--port requires a number".to_string());
                        }
                    }
                    other => return Err(format!("unknown serve option: {other}")),
                }
            }
            Ok(Command::Serve { port })
        }
        "list" => Ok(Command::List),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command: {other}")),
    }
}

fn print_help() {
    println!("faasrun - polyglot FaaS host");
    println!();
    println!("Usage:");
    println!("  faasrun upload <manifestPath>   upload a function manifest");
    println!("  faasrun serve [--port N]        start the HTTP dispatcher (default 8080)");
    println!("  faasrun list                    list stored functions");
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("faasrun=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_upload(manifest_path: &PathBuf) -> Result<(), String> {
    let text = std::fs::read_to_string(manifest_path)
        .map_err(|e| format!("cannot read {}: {e}", manifest_path.display()))?;
    let manifest = parse_manifest(&text).map_err(|e| e.to_string())?;

    // sourceFile references resolve against the manifest's own directory.
    let base = manifest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let asset = resolve_manifest(&base, &manifest).map_err(|e| e.to_string())?;

    let config = Config::from_env();
    let store = AssetStore::new(config.functions_dir()).map_err(|e| e.to_string())?;
    store.save(&asset).map_err(|e| e.to_string())?;

    println!("uploaded function {}", asset.id);
    Ok(())
}

fn run_list() -> Result<(), String> {
    let config = Config::from_env();
    let store = AssetStore::new(config.functions_dir()).map_err(|e| e.to_string())?;
    let assets = store.list().map_err(|e| e.to_string())?;

    if assets.is_empty() {
        println!("no functions stored");
        return Ok(());
    }
    for asset in assets {
        println!(
            "{}  {}  {}{}",
            asset.id,
            asset.language_id,
            asset.function_name,
            if asset.js_eval_as_module {
                "  (module)"
            } else {
                ""
            }
        );
    }
    Ok(())
}

async fn run_serve(port: Option<u16>) -> Result<(), String> {
    let mut config = Config::from_env();
    if let Some(port) = port {
        config.port = port;
    }

    let filter = EgressFilter::new(config.blocklist_file.clone());
    Arc::clone(&filter).install_global();
    let _reloader = Arc::clone(&filter).spawn_reloader(config.reload_interval);

    let network = Arc::new(VirtualNetwork::new(Arc::clone(&filter)));

    // Engine backends are linked in by embedding builds; the stock binary
    // serves the management surface and dispatches to whatever is registered.
    let registry = Arc::new(EngineRegistry::new());
    let invoker = Arc::new(Invoker::new(registry, network));

    let state = AppState {
        assets: Arc::new(AssetStore::new(config.functions_dir()).map_err(|e| e.to_string())?),
        resources: Arc::new(ResourceStore::new(config.resources_dir()).map_err(|e| e.to_string())?),
        invoker,
        manifest_root: PathBuf::from("."),
    };

    println!("faasrun serving on port {}", config.port);
    serve(state, config.port).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();

    let command = match parse_args() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            print_help();
            return ExitCode::from(2);
        }
    };

    let outcome = match command {
        Command::Upload { manifest } => run_upload(&manifest),
        Command::List => run_list(),
        Command::Serve { port } => run_serve(port).await,
        Command::Help => {
            print_help();
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
