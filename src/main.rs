use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use relay_core::TextGenerator;
use relay_engine::{EngineConfig, SessionRegistry};
use relay_llm::{EchoGenerator, UpstreamConfig, UpstreamGenerator};
use relay_server::{RequestDefaults, ServerConfig};
use relay_settings::{GeneratorKind, RelaySettings};
use relay_store::{EventReplica, SqliteReplica};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Resumable streaming chat-completions relay.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.relay/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Mirror events to the SQLite replica.
    #[arg(long)]
    persist: bool,

    #[arg(long)]
    db_path: Option<PathBuf>,

    /// `echo` or `upstream`.
    #[arg(long)]
    generator: Option<GeneratorKind>,

    #[arg(long)]
    upstream_url: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.persist {
            settings.persistence.enabled = true;
        }
        if let Some(path) = &self.db_path {
            settings.persistence.db_path = path.clone();
        }
        if let Some(kind) = self.generator {
            settings.generator.kind = kind;
        }
        if let Some(url) = &self.upstream_url {
            settings.generator.upstream_url = Some(url.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path),
        None => relay_settings::load_settings(),
    }
    .context("loading settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    let telemetry = TelemetryConfig::from_strings(&settings.logging.level, &settings.logging.format)
        .context("logging settings")?;
    let _telemetry = init_telemetry(telemetry).context("initializing logging")?;

    info!(
        port = settings.server.port,
        generator = ?settings.generator.kind,
        persistence = settings.persistence.enabled,
        "starting relay"
    );

    let replica = open_replica(&settings);
    let generator = build_generator(&settings)?;
    let engine = EngineConfig {
        buffer_capacity: settings.sessions.buffer_capacity,
        session_ttl: settings.sessions.ttl(),
        idle_cancel_after: settings.sessions.idle_cancel(),
        max_sessions: settings.sessions.max_sessions,
        ..EngineConfig::default()
    };
    let registry = Arc::new(SessionRegistry::new(engine, generator, replica));
    registry.spawn_gc(settings.sessions.gc_interval());

    let server = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        keep_alive: Duration::from_secs(settings.server.keep_alive_secs.max(1)),
        request_timeout: Duration::from_secs(settings.server.request_timeout_secs.max(1)),
        defaults: RequestDefaults {
            max_tokens: settings.generator.default_max_tokens,
            temperature: settings.generator.default_temperature,
        },
    };
    let handle = relay_server::start(server, Arc::clone(&registry))
        .await
        .context("starting HTTP server")?;
    info!(addr = %handle.addr, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    info!("shutting down");
    registry.shutdown().await;
    handle.shutdown().await;
    Ok(())
}

/// Open the replica if enabled. Failure leaves the relay running in memory only.
fn open_replica(settings: &RelaySettings) -> Option<Arc<dyn EventReplica>> {
    if !settings.persistence.enabled {
        return None;
    }
    let path = &settings.persistence.db_path;
    match SqliteReplica::open(path) {
        Ok(replica) => {
            info!(path = %path.display(), "session replica opened");
            Some(Arc::new(replica))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session replica unavailable, continuing in memory only");
            None
        }
    }
}

fn build_generator(settings: &RelaySettings) -> Result<Arc<dyn TextGenerator>> {
    let gen = &settings.generator;
    match gen.kind {
        GeneratorKind::Echo => Ok(Arc::new(EchoGenerator::new(
            gen.model.clone(),
            Duration::from_millis(gen.fragment_delay_ms),
        ))),
        GeneratorKind::Upstream => {
            let url = gen
                .upstream_url
                .clone()
                .context("generator.upstreamUrl is required for the upstream generator")?;
            let mut config = UpstreamConfig::new(url, gen.model.clone());
            if let Some(key) = &gen.api_key {
                config = config.with_api_key(key.clone());
            }
            let upstream = UpstreamGenerator::new(config).context("building upstream generator")?;
            info!(endpoint = upstream.endpoint(), "upstream generator configured");
            Ok(Arc::new(upstream))
        }
    }
}
