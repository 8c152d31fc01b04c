mod agent;
mod api;
mod bridge;
mod config;
mod crm;
mod http;
mod initiator;
mod notify;
mod schedule;
mod store;
#[cfg(test)]
mod testutil;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use chrono_tz::Tz;
use tower_http::trace::TraceLayer;

use agent::client::AgentClient;
use config::Config;
use crm::CrmClient;
use notify::Notifier;
use store::Database;
use twilio::client::TwilioClient;

/// Shared application state accessible from all handlers and the scheduler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Parsed once at startup from `queue.timezone`.
    pub tz: Tz,
    pub db: Database,
    pub twilio: Arc<TwilioClient>,
    pub agent: Arc<AgentClient>,
    pub crm: Arc<CrmClient>,
    pub notifier: Arc<Notifier>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outdial=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let tz = match schedule::clock::parse_zone(&config.queue.timezone) {
        Ok(tz) => tz,
        Err(e) => {
            eprintln!("Invalid queue.timezone: {e}");
            std::process::exit(1);
        }
    };

    let db = match Database::open(&config.db.path).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database at {}: {e}", config.db.path);
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.db.path,
        timezone = %config.queue.timezone,
        "Starting outdial"
    );

    // Build shared state
    let state = AppState {
        tz,
        db,
        twilio: Arc::new(TwilioClient::new(&config.twilio)),
        agent: Arc::new(AgentClient::new(&config.agent)),
        crm: Arc::new(CrmClient::new(&config.crm)),
        notifier: Arc::new(Notifier::new(&config.notifier.webhook_url)),
        config: config.clone(),
    };

    // The queue scheduler runs for the life of the process.
    tokio::spawn(schedule::worker::run(state.clone()));

    // Build router
    let outgoing = Router::new()
        .route("/outbound-call", post(api::outbound::handle_outbound_call))
        .route("/call-status", post(twilio::status::handle_status))
        .route("/outbound-call-twiml", any(twilio::webhook::handle_twiml))
        // Twilio media stream (WebSocket)
        .route(
            "/outbound-media-stream",
            get(twilio::media::handle_media_upgrade),
        );

    let app = Router::new()
        .nest(&config.server.route_prefix, outgoing)
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

async fn health() -> &'static str {
    "ok"
}
