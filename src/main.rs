use clap::Parser;
use relayscope::api::build_router;
use relayscope::hub::DebugHub;
use relayscope::kv::{KvStore, UpstashKv};
use relayscope::logging::{init_tracing, setup_panic_hook};
use relayscope::{AppState, Args};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _guard = init_tracing(&args.log_dir);
    setup_panic_hook();

    let client = match args.build_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let kv: Option<Arc<dyn KvStore>> = match args.kv_credentials() {
        Some((url, token)) => {
            tracing::info!(url, "External store configured");
            Some(Arc::new(UpstashKv::new(client.clone(), url, token)) as Arc<dyn KvStore>)
        }
        None => {
            tracing::info!("No external store configured; logs stay in memory");
            None
        }
    };

    let hub = DebugHub::bootstrap(args.initial_state(), args.log_store_config(), kv).await;
    let initial = hub.control.get_state();
    tracing::info!(
        debug = initial.enabled,
        target = %initial.target_url,
        always_capture = args.always_capture,
        follow_redirects = args.follow_redirects,
        "Proxy state initialized"
    );

    let addr = format!("{}:{}", args.host, args.port);
    let app = build_router(AppState::new(hub, client, args));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("relayscope listening on {} (dashboard at /debug)", addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    });

    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
