#[tokio::main]
async fn main() {
    use silver_telegram_scheduler::{
        NatsRunCache, NullBrowserSessionFactory, NullNotifier, PostgresRunRepository, Scheduler,
        SchedulerConfig as RunnerSchedulerConfig,
    };
    use silver_telegram_server::app::{self, AppState};
    use silver_telegram_server::config::ServerConfig;
    use silver_telegram_workflow::{ActionRegistry, BroadcastRegistry, NullStorageService};
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("loaded configuration");

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let repository = Arc::new(PostgresRunRepository::new(db_pool));
    let broadcast = Arc::new(BroadcastRegistry::new());

    tracing::info!("connecting to NATS");
    let cache = Arc::new(
        NatsRunCache::connect(&config.nats_url)
            .await
            .expect("failed to connect to NATS"),
    );

    let scheduler = Arc::new(Scheduler::new(
        RunnerSchedulerConfig {
            max_concurrent_runs: config.scheduler.max_concurrent_runs,
            poll_interval: Duration::from_secs(config.scheduler.poll_interval_seconds),
        },
        repository.clone(),
        cache.clone(),
        Arc::new(ActionRegistry::new()),
        broadcast.clone(),
        Arc::new(NullNotifier),
        Arc::new(NullBrowserSessionFactory),
        Arc::new(NullStorageService),
    ));

    let shutdown = CancellationToken::new();
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let app_state = AppState {
        scheduler,
        repository,
        cache,
        broadcast,
        max_concurrent_runs: config.scheduler.max_concurrent_runs,
    };
    let router = app::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .expect("server error");

    let _ = scheduler_handle.await;
}
