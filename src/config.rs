use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    /// When set, group fan-out rides redis pub/sub so multiple server
    /// processes share one broadcast plane.
    pub redis_url: Option<String>,
    /// Anonymous connections on the chat path are allowed unless this is on;
    /// the notification path always requires an authenticated identity.
    pub chat_requires_auth: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            database_url: dotenv::var("DATABASE_URL").context("DATABASE_URL is not set")?,
            jwt_secret: dotenv::var("JWT_SECRET").context("JWT_SECRET is not set")?,
            redis_url: dotenv::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            chat_requires_auth: dotenv::var("CHAT_REQUIRES_AUTH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }
}
