use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use climate_tools::{LoggingSurface, ToolsConfig};
use foundation::{LayerId, SystemClock, ViewId};
use layers::climate::{ADVANCED_3D, VIEW_CLIMATE, climate_catalog};
use layers::{HttpLayerFetcher, Reconciler, ReconcilerConfig, ReconcilerDeps};
use resilience::{HttpFetcher, HttpHealthProbe, Resilience};
use session::{FileStorage, SessionMemory, SessionMemoryConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Session and layer tooling for the climate dashboard")]
struct Args {
    /// Data service base URL (default: CLIMATE_API_BASE or http://127.0.0.1:5000)
    #[arg(long)]
    api_base: Option<String>,

    /// Directory holding the session file (default: CLIMATE_SESSION_DIR)
    #[arg(long)]
    session_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or edit the saved session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Probe the data service health endpoint once
    Health,

    /// List catalog layers with their expanded data URLs
    Layers,

    /// Run the reconciler headlessly and log layer status
    Watch {
        /// View to reconcile
        #[arg(long, default_value = VIEW_CLIMATE)]
        view: String,

        /// Layers to enable on top of the restored session (repeatable)
        #[arg(long = "layer")]
        layers: Vec<String>,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,

        /// Report the advanced 3D renderer capability
        #[arg(long)]
        advanced_3d: bool,

        /// Seconds between status reports
        #[arg(long, default_value_t = 10)]
        report_every: u64,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// Print the current session record
    Show,

    /// Write the session snapshot to a file (or stdout)
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replace the session with a snapshot file, migrating older schemas
    Import { path: PathBuf },

    /// Reset the session to defaults
    Clear,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = real_main().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<(), String> {
    let args = Args::parse();
    let mut config = ToolsConfig::from_env();
    if let Some(api_base) = args.api_base {
        config.api_base = api_base;
    }
    if let Some(dir) = args.session_dir {
        config.session_dir = dir;
    }

    match args.command {
        Command::Session { action } => cmd_session(&config, action),
        Command::Health => cmd_health(&config).await,
        Command::Layers => cmd_layers(&config),
        Command::Watch {
            view,
            layers,
            seconds,
            advanced_3d,
            report_every,
        } => {
            cmd_watch(
                &config,
                ViewId::new(view),
                layers,
                seconds.map(Duration::from_secs),
                advanced_3d,
                Duration::from_secs(report_every.max(1)),
            )
            .await
        }
    }
}

fn open_session(config: &ToolsConfig) -> Result<SessionMemory, String> {
    fs::create_dir_all(&config.session_dir)
        .map_err(|e| format!("create {}: {e}", config.session_dir.display()))?;
    let storage = Arc::new(FileStorage::new(&config.session_dir));
    Ok(SessionMemory::new(storage, SessionMemoryConfig::default()))
}

fn cmd_session(config: &ToolsConfig, action: SessionAction) -> Result<(), String> {
    let session = open_session(config)?;
    match action {
        SessionAction::Show => {
            let record = session.read();
            let text = serde_json::to_string_pretty(&record).map_err(|e| e.to_string())?;
            println!("{text}");
        }
        SessionAction::Export { out } => {
            let text = session.export_snapshot().map_err(|e| e.to_string())?;
            match out {
                Some(path) => {
                    fs::write(&path, text).map_err(|e| format!("write {}: {e}", path.display()))?;
                    println!("exported session to {}", path.display());
                }
                None => println!("{text}"),
            }
        }
        SessionAction::Import { path } => {
            let text = fs::read_to_string(&path).map_err(|e| format!("read {}: {e}", path.display()))?;
            let record = session.import_snapshot(&text).map_err(|e| e.to_string())?;
            println!(
                "imported {} layer states, {} viewports",
                record.layer_states.len(),
                record.viewport_by_view.len()
            );
        }
        SessionAction::Clear => {
            session.clear();
            println!("session cleared");
        }
    }
    if session.is_memory_only() {
        return Err(format!(
            "session storage under {} is not writable",
            config.session_dir.display()
        ));
    }
    Ok(())
}

async fn cmd_health(config: &ToolsConfig) -> Result<(), String> {
    let resilience = build_resilience(config)?;
    let Some(monitor) = resilience.health_monitor() else {
        return Err("health monitor not configured".to_string());
    };
    let status = monitor.check_now().await;
    let text = serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?;
    println!("{text}");
    if !status.reachable {
        return Err(format!("{} is {}", config.api_base, status.as_str()));
    }
    Ok(())
}

fn cmd_layers(config: &ToolsConfig) -> Result<(), String> {
    let catalog = climate_catalog().map_err(|e| e.to_string())?;
    let vars = config.template_vars();
    for def in catalog.iter() {
        let url = match &def.data_source {
            Some(template) => layers::template::expand(template, &vars).map_err(|e| e.to_string())?,
            None => "(dataset supplied by caller)".to_string(),
        };
        let views: Vec<&str> = def.visible_in_views.iter().map(ViewId::as_str).collect();
        let views = if views.is_empty() {
            "all".to_string()
        } else {
            views.join(",")
        };
        println!("{:<24} {:<16} {:<28} {url}", def.id.as_str(), views, def.title);
    }
    Ok(())
}

fn build_resilience(config: &ToolsConfig) -> Result<Resilience, String> {
    let http = HttpFetcher::new(config.request_timeout).map_err(|e| e.to_string())?;
    let probe = HttpHealthProbe::for_api_base(http, &config.api_base);
    Ok(Resilience::new(config.resilience()).with_health_probe(Arc::new(probe)))
}

async fn cmd_watch(
    config: &ToolsConfig,
    view: ViewId,
    enable: Vec<String>,
    run_for: Option<Duration>,
    advanced_3d: bool,
    report_every: Duration,
) -> Result<(), String> {
    let resilience = Arc::new(build_resilience(config)?);
    let session = open_session(config)?;
    let capabilities: Vec<&str> = if advanced_3d { vec![ADVANCED_3D] } else { Vec::new() };
    let surface = Arc::new(LoggingSurface::new(capabilities));
    let http = HttpFetcher::new(config.request_timeout).map_err(|e| e.to_string())?;

    let reconciler = Reconciler::new(
        climate_catalog().map_err(|e| e.to_string())?,
        ReconcilerConfig {
            template_vars: config.template_vars(),
            ..ReconcilerConfig::default()
        },
        ReconcilerDeps {
            surface: surface.clone(),
            fetcher: Arc::new(HttpLayerFetcher::new(http)),
            resilience: resilience.clone(),
            session: session.clone(),
            clock: Arc::new(SystemClock),
        },
    )
    .map_err(|e| e.to_string())?;

    let cancel = CancellationToken::new();
    let health = resilience.start_health_monitor(cancel.clone());

    for layer in &enable {
        reconciler
            .set_enabled(&view, &LayerId::new(layer.as_str()), true)
            .map_err(|e| e.to_string())?;
    }
    let summary = reconciler.reconcile(&view).await;
    tracing::info!(
        view = %view,
        added = summary.added,
        removed = summary.removed,
        "Initial reconcile complete"
    );

    let stop = async {
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);
    let mut ticker = tokio::time::interval(report_every);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => report(&reconciler, &resilience),
        }
    }

    cancel.cancel();
    if let Some(task) = health {
        let _ = task.await;
    }
    session.force_flush();
    tracing::info!(primitives = surface.live().len(), "Watch stopped");
    Ok(())
}

fn report(reconciler: &Reconciler, resilience: &Resilience) {
    let health = resilience.health_status();
    tracing::info!(
        health = health.as_str(),
        latency_ms = health.latency_ms,
        "Data service"
    );
    for id in reconciler.catalog().ids() {
        let Some(desired) = reconciler.desired_state(id) else {
            continue;
        };
        if !desired.enabled {
            continue;
        }
        let Ok(report) = reconciler.status(id) else {
            continue;
        };
        tracing::info!(
            layer = %id,
            status = report.status.as_str(),
            degraded = report.degraded,
            version = report.data_version.as_ref().map(|v| v.short()),
            circuit = report.circuit.as_ref().map(|c| c.state.display_status()),
            error = report.last_error.as_deref(),
            "Layer status"
        );
    }
}
