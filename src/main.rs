use tokio::net::TcpListener;
use tracing::info;

use sentryd::config::Config;
use sentryd::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let json_logs = std::env::var("LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("starting sentryd");

    let config = Config::from_env()?;
    let context = AppContext::build(config).await?;
    let (worker_pool, _watcher) = context.spawn_background_tasks()?;

    let addr = format!("{}:{}", context.config.server.host, context.config.server.port);
    let app = sentryd::http::build_router(context);

    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "sentryd listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    worker_pool.shutdown().await;
    Ok(())
}
