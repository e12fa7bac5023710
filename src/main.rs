mod cli;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use burrow::config;
use burrow::config::writer::write_private;
use burrow::config::model::{
    AppConfig, Credentials, MIN_LOCAL_PORT, TunnelConfig, TunnelDefinition,
};
use burrow::events::TunnelEvent;
use burrow::keys::{self, KeyAlgorithm};
use burrow::manager::TunnelManager;
use burrow::tunnel::Tunnel;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let cfg_override = cli.config.as_deref();

    match cli.command {
        Commands::Up { names, json } => cmd_up(cfg_override, &names, json).await?,
        Commands::List => cmd_list(cfg_override)?,
        Commands::Check => cmd_check(cfg_override)?,
        Commands::Init { force } => cmd_init(cfg_override, force)?,
        Commands::Keygen {
            algorithm,
            bits,
            output,
        } => cmd_keygen(algorithm, bits, output.as_deref())?,
        Commands::ImportKey {
            file,
            passphrase_env,
        } => cmd_import_key(&file, passphrase_env.as_deref())?,
    }

    Ok(())
}

/// Logs go to stderr so `up --json` keeps stdout machine-readable.
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("burrow=info"))
        .context("Invalid RUST_LOG filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Create and connect the configured tunnels, then supervise until Ctrl+C.
async fn cmd_up(cfg_override: Option<&str>, names: &[String], json: bool) -> Result<()> {
    let app_config = config::load_with_override(cfg_override).context("Failed to load config")?;

    let selected = select_tunnels(&app_config.tunnels, names)?;
    if selected.is_empty() {
        bail!("No tunnels configured. Run `burrow init` to write a starter config.");
    }

    let manager = TunnelManager::from_settings(app_config.settings.clone());
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event, json),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    manager.start();

    let mut ids = Vec::with_capacity(selected.len());
    for def in selected {
        match manager.create(def.name.clone(), def.config.clone()).await {
            Ok(tunnel) => ids.push(tunnel.id),
            Err(e) => eprintln!("Skipping tunnel '{}': {e}", def.name),
        }
    }

    let results = join_all(ids.iter().map(|id| manager.connect(*id))).await;
    let connected = results.iter().filter(|r| r.is_ok()).count();
    eprintln!(
        "{connected}/{} tunnel(s) connected. Press Ctrl+C to stop.",
        ids.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    eprintln!("\nShutting down tunnels...");
    manager.shutdown().await;
    printer.abort();

    let stats = manager.stats().await;
    eprintln!(
        "Transferred {} bytes over {} connection(s), {} error(s).",
        stats.total_bytes_transferred, stats.total_connections, stats.connection_errors
    );
    Ok(())
}

fn select_tunnels<'a>(
    tunnels: &'a [TunnelDefinition],
    names: &[String],
) -> Result<Vec<&'a TunnelDefinition>> {
    if names.is_empty() {
        return Ok(tunnels.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            tunnels
                .iter()
                .find(|t| &t.name == name)
                .with_context(|| format!("No tunnel named '{name}' in config"))
        })
        .collect()
}

fn print_event(event: &TunnelEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        }
        return;
    }

    match event {
        TunnelEvent::TunnelCreated { tunnel } => {
            println!("created   {:<20} {}", tunnel.name, forward_label(tunnel));
        }
        TunnelEvent::TunnelStatusChanged { tunnel } => {
            let detail = tunnel.last_error.as_deref().unwrap_or("");
            println!("{:<9} {:<20} {detail}", tunnel.status.to_string(), tunnel.name);
        }
        TunnelEvent::TunnelDeleted { id } => println!("deleted   {id}"),
        TunnelEvent::StatsUpdated { stats } => {
            println!(
                "stats     {}/{} active, {} bytes, {:.1} ms avg latency, {} error(s)",
                stats.active_tunnels,
                stats.total_tunnels,
                stats.total_bytes_transferred,
                stats.average_latency_ms,
                stats.connection_errors
            );
        }
    }
}

fn forward_label(tunnel: &Tunnel) -> String {
    format!(
        "{} -> {}:{}",
        tunnel.local_address(),
        tunnel.config.remote_host,
        tunnel.config.remote_port
    )
}

/// Format a tunnel definition row for the list table.
fn format_tunnel_row(def: &TunnelDefinition) -> String {
    let c = &def.config;
    let local = c
        .local_port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "auto".into());
    format!(
        "  {:<20} {:<30} {:<12} {:>6} -> {}:{}",
        def.name,
        format!("{}:{}", c.host, c.port),
        c.effective_user(),
        local,
        c.remote_host,
        c.remote_port
    )
}

fn cmd_list(cfg_override: Option<&str>) -> Result<()> {
    let app_config = config::load_with_override(cfg_override).context("Failed to load config")?;

    if app_config.tunnels.is_empty() {
        println!("No tunnels configured.");
        return Ok(());
    }

    println!(
        "  {:<20} {:<30} {:<12} {:>6}    {}",
        "NAME", "SSH HOST", "USER", "LOCAL", "TARGET"
    );
    for def in &app_config.tunnels {
        println!("{}", format_tunnel_row(def));
    }
    Ok(())
}

fn cmd_check(cfg_override: Option<&str>) -> Result<()> {
    let app_config = config::load_with_override(cfg_override).context("Failed to load config")?;
    let port_base = app_config.settings.port_base.max(MIN_LOCAL_PORT);

    let mut failures = 0;
    for def in &app_config.tunnels {
        let mut config = def.config.clone();
        // Unset ports are allocated at `up` time.
        config.local_port.get_or_insert(port_base);

        match config.validate() {
            Ok(()) => println!("ok    {}", def.name),
            Err(e) => {
                failures += 1;
                println!("FAIL  {}: {e}", def.name);
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} tunnel(s) failed validation", app_config.tunnels.len());
    }
    println!("{} tunnel(s) valid.", app_config.tunnels.len());
    Ok(())
}

fn starter_config() -> AppConfig {
    AppConfig {
        settings: Default::default(),
        tunnels: vec![TunnelDefinition {
            name: "postgres".into(),
            config: TunnelConfig {
                host: "bastion.example.com".into(),
                port: 22,
                username: None,
                credentials: Credentials {
                    identity_file: Some("~/.ssh/id_ed25519".into()),
                    ..Credentials::default()
                },
                local_port: Some(5433),
                remote_host: "localhost".into(),
                remote_port: 5432,
                keep_alive: true,
                connect_timeout_secs: burrow::config::model::DEFAULT_CONNECT_TIMEOUT_SECS,
            },
        }],
    }
}

fn cmd_init(cfg_override: Option<&str>, force: bool) -> Result<()> {
    let path = config::resolve_config_path(cfg_override);
    if path.exists() && !force {
        bail!(
            "Config already exists: {}\nUse --force to overwrite it.",
            path.display()
        );
    }
    config::save_to(&starter_config(), &path).context("Failed to write config")?;
    println!("Wrote starter config to {}", path.display());
    Ok(())
}

fn cmd_keygen(algorithm: KeyAlgorithm, bits: Option<usize>, output: Option<&str>) -> Result<()> {
    let pair = keys::generate(algorithm, bits)?;

    let Some(output) = output else {
        print!("{}", pair.private_key.as_str());
        println!("{}", pair.public_key);
        eprintln!("Fingerprint: {}", pair.fingerprint);
        return Ok(());
    };

    let private_path = shellexpand::tilde(output).to_string();
    let public_path = format!("{private_path}.pub");
    if Path::new(&private_path).exists() {
        bail!("Refusing to overwrite existing key: {private_path}");
    }

    write_private(Path::new(&private_path), pair.private_key.as_bytes())
        .with_context(|| format!("Failed to write private key: {private_path}"))?;
    fs::write(&public_path, format!("{}\n", pair.public_key))
        .with_context(|| format!("Failed to write public key: {public_path}"))?;

    println!("Private key: {private_path}");
    println!("Public key:  {public_path}");
    println!("Fingerprint: {}", pair.fingerprint);
    Ok(())
}

fn cmd_import_key(file: &str, passphrase_env: Option<&str>) -> Result<()> {
    let path = shellexpand::tilde(file).to_string();
    let content = Zeroizing::new(
        fs::read_to_string(&path).with_context(|| format!("Failed to read key file: {path}"))?,
    );

    let passphrase = match passphrase_env {
        Some(var) => Some(Zeroizing::new(std::env::var(var).with_context(|| {
            format!("Environment variable {var} is not set")
        })?)),
        None => None,
    };

    let imported = keys::import_private_key(&content, passphrase.as_ref().map(|p| p.as_str()))?;

    println!("Type:        {}", imported.algorithm);
    println!("Fingerprint: {}", imported.fingerprint);
    println!("Encrypted:   {}", if imported.encrypted { "yes" } else { "no" });
    if let Some(public_key) = &imported.public_key {
        println!("Public key:  {public_key}");
    }
    Ok(())
}
