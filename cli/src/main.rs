//! chainkeys CLI — inspect and manage the mirrored staking-module state.
//!
//! Usage:
//! ```bash
//! chainkeys info
//! chainkeys status --db sqlite:./keys.db --config ./chainkeys.json
//! chainkeys clear  --db postgres://localhost/keys --json
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use chainkeys_core::config::SyncConfig;
use chainkeys_core::store::SyncStore;
use chainkeys_core::strategy::StrategyRegistry;
use chainkeys_storage::InMemoryStorage;

use logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    init_tracing(&LogConfig {
        level: parse_flag(rest, "--log-level").unwrap_or_else(|| "info".into()),
        json: has_flag(rest, "--json"),
        ..Default::default()
    });

    let result = match args[1].as_str() {
        "info" => cmd_info(rest),
        "status" => cmd_status(rest).await,
        "clear" => cmd_clear(rest).await,
        "version" | "--version" | "-V" => {
            println!("chainkeys {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainkeys {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe mirror of staking-module operators and signing keys\n");
    println!("USAGE:");
    println!("    chainkeys <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    info     Show the effective synchronizer configuration");
    println!("    status   Print the stored checkpoint and module nonces as JSON");
    println!("    clear    Delete every mirrored row");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("FLAGS:");
    println!("    --db <URL>           sqlite:<path>, postgres://... or memory  [status, clear]");
    println!("    --config <PATH>      JSON synchronizer configuration (defaults apply to missing fields)");
    println!("    --json               Emit logs as JSON");
    println!("    --log-level <LEVEL>  trace | debug | info | warn | error (default: info)");
}

fn cmd_info(args: &[String]) -> Result<(), String> {
    let cfg = load_config(args)?;
    let registry = StrategyRegistry::with_defaults();
    println!("ChainKeys v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chain: {}", cfg.chain);
    println!("  Poll interval: {}ms", cfg.poll_interval_ms);
    println!("  Key batch size: {} keys/call", cfg.key_batch_size);
    println!("  Batch concurrency: {}", cfg.batch_concurrency);
    println!("  Max block gap: {} blocks", cfg.max_block_gap);
    println!("  Reorg walk depth: {} blocks", cfg.max_reorg_depth);
    println!("  Watchdog timeout: {}s", cfg.watchdog_timeout_ms / 1_000);
    println!("  Rows per statement: {}", cfg.max_rows_per_statement);
    println!("  Cursor idle timeout: {}ms", cfg.cursor_idle_timeout_ms);
    println!("  Module types: {}", registry.module_types().join(", "));
    println!("  Storage backends: memory, SQLite (feature: sqlite), PostgreSQL (feature: postgres)");
    Ok(())
}

/// `--config <path>` parsed as JSON, or the defaults.
fn load_config(args: &[String]) -> Result<SyncConfig, String> {
    let cfg: SyncConfig = match parse_flag(args, "--config") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))?
        }
        None => SyncConfig::default(),
    };
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

async fn cmd_status(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--db").ok_or("--db is required")?;
    let store = open_store(&url, &load_config(args)?).await?;
    let report = status_report(store.as_ref()).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
    );
    Ok(())
}

async fn cmd_clear(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--db").ok_or("--db is required")?;
    let store = open_store(&url, &load_config(args)?).await?;
    store.clear().await.map_err(|e| e.to_string())?;
    tracing::info!(db = %redact(&url), "mirror cleared");
    println!("Cleared all mirrored state.");
    Ok(())
}

async fn status_report(store: &dyn SyncStore) -> Result<serde_json::Value, String> {
    let el_meta = store.el_meta().await.map_err(|e| e.to_string())?;
    let modules = store.staking_modules().await.map_err(|e| e.to_string())?;
    let consensus = store.consensus_meta().await.map_err(|e| e.to_string())?;

    let modules: Vec<serde_json::Value> = modules
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "address": m.staking_module_address,
                "type": m.module_type,
                "nonce": m.nonce,
                "status": m.status.as_str(),
            })
        })
        .collect();

    Ok(serde_json::json!({
        "el_meta": el_meta,
        "modules": modules,
        "consensus_meta": consensus,
    }))
}

async fn open_store(url: &str, cfg: &SyncConfig) -> Result<Arc<dyn SyncStore>, String> {
    if url == "memory" {
        return Ok(Arc::new(InMemoryStorage::new()));
    }
    if url.starts_with("sqlite:") {
        return open_sqlite(url, cfg).await;
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return open_postgres(url, cfg).await;
    }
    Err(format!("unsupported database URL: {}", redact(url)))
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(url: &str, cfg: &SyncConfig) -> Result<Arc<dyn SyncStore>, String> {
    let store = chainkeys_storage::sqlite::SqliteStorage::open(url)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(store.with_config(cfg)))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_url: &str, _cfg: &SyncConfig) -> Result<Arc<dyn SyncStore>, String> {
    Err("SQLite support not compiled in (enable feature: sqlite)".into())
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: &str, cfg: &SyncConfig) -> Result<Arc<dyn SyncStore>, String> {
    use chainkeys_storage::postgres::{PostgresOptions, PostgresStorage};

    let store = PostgresStorage::connect_with_options(url, PostgresOptions::from_config(cfg))
        .await
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: &str, _cfg: &SyncConfig) -> Result<Arc<dyn SyncStore>, String> {
    Err("PostgreSQL support not compiled in (enable feature: postgres)".into())
}

/// Strip credentials from a database URL before it is printed.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
