use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use fanout_bus::{Bus, LocalBus};
use verso_gateway::{
    cli::{run_publish, Cli, Commands},
    config::Config,
    redis_bus::RedisBus,
    ws::{router, FanoutState},
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Publish {
        url,
        thread,
        kind,
        entity,
        payload,
    }) = cli.command
    {
        if let Err(err) = run_publish(url, thread, kind, entity, payload).await {
            error!("publish failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!("starting verso gateway on port {}", config.port);

    let bus: Arc<dyn Bus> = match &config.redis_url {
        Some(redis_url) => match RedisBus::new(redis_url).await {
            Ok(bus) => {
                info!("redis fanout bus connected: {}", redis_url);
                Arc::new(bus)
            }
            Err(err) => {
                error!("failed to connect to redis: {}", err);
                std::process::exit(1);
            }
        },
        None => {
            warn!("REDIS_URL not set; events fan out within this process only");
            Arc::new(LocalBus::new())
        }
    };

    let state = FanoutState::new(bus, &config);
    let app = router(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("verso gateway listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("failed to start server");
}
