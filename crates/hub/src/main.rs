use clap::Parser;
use mcphub::dispatch::RequestDispatcher;
use mcphub::http::{HttpState, router};
use mcphub::oauth::OAuthCoordinator;
use mcphub::registry::UpstreamRegistry;
use mcphub::sessions::SessionManager;
use mcphub::settings::SettingsStore;
use mcphub::vector::{InMemoryVectorStore, ToolIndex};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments for the hub.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcphub")]
#[command(version, about = "MCPHub: one streaming endpoint for many MCP servers")]
struct CliArgs {
    /// Path to the settings file (or a directory containing
    /// mcp_settings.json).
    #[arg(short = 'c', long = "settings", env = "MCPHUB_SETTING_PATH")]
    settings: Option<PathBuf>,

    /// HTTP bind port.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Base path prefix for the session endpoints (e.g. `/hub`).
    #[arg(long = "base-path", env = "BASE_PATH", default_value = "")]
    base_path: String,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCPHUB_LOG", default_value = "info")]
    log_level: String,
}

enum RunError {
    /// Fatal configuration error at startup.
    Config(String),
    /// Port bind failure.
    Bind(String),
    /// Everything else.
    Serve(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting MCPHub v{VERSION}");
    match run(args).await {
        Ok(()) => {
            tracing::info!("MCPHub shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(RunError::Config(message)) => {
            tracing::error!(error = %message, "fatal configuration error");
            ExitCode::from(1)
        }
        Err(RunError::Bind(message)) => {
            tracing::error!(error = %message, "failed to bind");
            ExitCode::from(2)
        }
        Err(RunError::Serve(message)) => {
            tracing::error!(error = %message, "server error");
            ExitCode::from(1)
        }
    }
}

async fn run(args: CliArgs) -> Result<(), RunError> {
    let base_path = normalize_base_path(&args.base_path);

    let store = Arc::new(
        SettingsStore::open(args.settings.as_deref())
            .await
            .map_err(|e| RunError::Config(e.to_string()))?,
    );
    warn_on_open_data_plane(&store.current());

    // Redirects stay disabled on upstream/OAuth traffic; endpoints are
    // expected to be configured with their final URL.
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| RunError::Serve(format!("build HTTP client: {e}")))?;

    let ct = CancellationToken::new();
    let (events, _keep_events_open) = tokio::sync::broadcast::channel(256);

    let redirect_uri = format!("http://localhost:{}{}/oauth/callback", args.port, base_path);
    let oauth = Arc::new(OAuthCoordinator::new(store.clone(), http.clone(), redirect_uri));

    let index = Arc::new(ToolIndex::new(Arc::new(InMemoryVectorStore::default())));
    let registry = UpstreamRegistry::new(
        store.clone(),
        oauth.clone(),
        index.clone(),
        events.clone(),
        http.clone(),
        ct.clone(),
    );
    registry.start().await;

    let sessions = Arc::new(SessionManager::new(ct.clone()));
    sessions.spawn_idle_reaper();

    let dispatcher = Arc::new(RequestDispatcher::new(
        store.clone(),
        registry.clone(),
        index,
    ));

    let state = Arc::new(HttpState {
        store,
        sessions,
        dispatcher,
        registry,
        oauth,
        events,
        base_path,
        start_time: Instant::now(),
        shutdown: ct.clone(),
    });

    let app = router(state);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| RunError::Bind(format!("bind '{bind_addr}': {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| RunError::Bind(e.to_string()))?;
    tracing::info!("MCPHub listening on {bound}");

    spawn_shutdown_watcher(ct.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await
        .map_err(|e| RunError::Serve(e.to_string()))
}

/// Auth-posture guardrail at startup.
fn warn_on_open_data_plane(settings: &mcphub::settings::Settings) {
    let routing = &settings.system_config.routing;
    if routing.skip_auth {
        tracing::warn!(
            "skipAuth is enabled: the data plane is UNAUTHENTICATED. Do not expose the bind address publicly."
        );
    } else if routing.enable_bearer_auth && routing.bearer_auth_key.is_empty() {
        tracing::warn!(
            "enableBearerAuth is set but bearerAuthKey is empty; every session open will be rejected"
        );
    } else if !routing.enable_bearer_auth {
        tracing::warn!(
            "bearer auth is disabled; session endpoints trust the outer auth layer. Do not expose the bind address publicly."
        );
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

/// Initialize logging: pretty output on a TTY (or in development), JSON
/// otherwise.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let development = std::env::var("NODE_ENV")
        .map(|v| v.eq_ignore_ascii_case("development"))
        .unwrap_or(false);
    let is_tty = atty::is(atty::Stream::Stdout);

    if is_tty || development {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
