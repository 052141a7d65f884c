use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use playsync_server::{AppError, AppState, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cors(config: &Settings) -> Cors {
    if !config.cors.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors_config = if config.cors.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_methods(vec!["GET"])
            .allowed_headers(vec!["Content-Type"])
    };

    cors_config.max_age(config.cors.max_age as usize)
}

#[actix_web::main]
async fn main() -> playsync_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!("Configuration loaded successfully");

    let state = AppState::new(config.clone());

    // Relay listener runs next to the HTTP server
    let relay_listener = state.relay.bind().await?;
    let relay_task = tokio::spawn(state.relay.clone().serve(relay_listener));

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting HTTP server at {}:{}", config.server.host, config.server.port);

    let workers = config.server.workers.max(1) as usize;
    let data = web::Data::new(state.clone());
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&config))
            .app_data(data.clone())
            .configure(playsync_server::configure)
    })
    .listen(listener)?
    .workers(workers)
    .run()
    .await?;

    // HTTP server stopped (signal), take the relay down with it
    state.shutdown();
    relay_task
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
