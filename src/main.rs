use roomchat::{AppState, Config, Groups, app, db};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url).await?;
    db::init_schema(&db_pool).await?;

    let groups = match config.redis_url.as_deref() {
        Some(url) => {
            info!("fan-out backed by redis at {url}");
            Groups::redis(url).await?
        }
        None => Groups::local(),
    };

    let state = AppState {
        db_pool,
        groups,
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
