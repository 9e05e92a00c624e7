mod config;

use std::sync::Arc;

use anyhow::{Context, bail};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::AppState;
use parley_db::Database;
use parley_gateway::auth::TokenVerifier;
use parley_gateway::connection;
use parley_gateway::Dispatcher;
use parley_types::models::{Role, UserId};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let verifier = TokenVerifier::new(&config.jwt_secret);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config, verifier).await,
        Some("token") => print_token(&verifier, &args[1..]),
        Some(other) => bail!("unknown command {other:?}, expected `serve` or `token`"),
    }
}

async fn serve(config: Config, verifier: TokenVerifier) -> anyhow::Result<()> {
    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let dispatcher = Dispatcher::new(Arc::new(db), config.relay.clone());

    let state = AppState {
        dispatcher,
        verifier,
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(parley_api::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.verifier)
    })
}

/// `parley token <user_id> <initiator|responder> [hours]`: mint a token for local testing.
fn print_token(verifier: &TokenVerifier, args: &[String]) -> anyhow::Result<()> {
    let [user_id, role, rest @ ..] = args else {
        bail!("usage: parley token <user_id> <initiator|responder> [hours]");
    };
    let user_id = UserId::new(user_id.as_str())?;
    let role: Role = role.parse().map_err(anyhow::Error::msg)?;
    let hours: i64 = match rest.first() {
        Some(raw) => raw.parse().context("hours must be an integer")?,
        None => 24,
    };

    let token = verifier.issue(&user_id, role, chrono::Duration::hours(hours))?;
    println!("{token}");
    Ok(())
}
