use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorization_url: String,
    pub api_base_url: String,
    pub webhook_secret: String,
    pub redis_url: Option<String>,
    pub http_timeout: Duration,
    pub session_ttl: Duration,
    pub rate_limit_per_minute: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_open_duration: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let client_secret =
            std::env::var("HUBSPOT_CLIENT_SECRET").context("HUBSPOT_CLIENT_SECRET is required")?;

        let config = Self {
            port: env_or("PORT", "4000").parse().context("Invalid PORT")?,

            client_id: std::env::var("HUBSPOT_CLIENT_ID").context("HUBSPOT_CLIENT_ID is required")?,

            // v3 webhook signatures are computed with the app secret unless overridden
            webhook_secret: std::env::var("HUBSPOT_WEBHOOK_SECRET")
                .unwrap_or_else(|_| client_secret.clone()),

            client_secret,

            redirect_uri: std::env::var("HUBSPOT_REDIRECT_URI")
                .context("HUBSPOT_REDIRECT_URI is required")?,

            authorization_url: env_or(
                "HUBSPOT_AUTHORIZATION_URL",
                "https://app.hubspot.com/oauth/authorize",
            ),

            api_base_url: env_or("HUBSPOT_API_BASE_URL", "https://api.hubapi.com")
                .trim_end_matches('/')
                .to_string(),

            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            http_timeout: Duration::from_secs(
                env_or("HTTP_TIMEOUT_SECS", "10")
                    .parse()
                    .context("Invalid HTTP_TIMEOUT_SECS")?,
            ),

            session_ttl: Duration::from_secs(
                env_or("SESSION_TTL_SECS", "28800")
                    .parse()
                    .context("Invalid SESSION_TTL_SECS")?,
            ),

            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", "100")
                .parse()
                .context("Invalid RATE_LIMIT_PER_MINUTE")?,

            circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", "5")
                .parse()
                .context("Invalid CIRCUIT_FAILURE_THRESHOLD")?,

            circuit_open_duration: Duration::from_secs(
                env_or("CIRCUIT_OPEN_SECS", "30")
                    .parse()
                    .context("Invalid CIRCUIT_OPEN_SECS")?,
            ),
        };

        url::Url::parse(&config.authorization_url).context("Invalid HUBSPOT_AUTHORIZATION_URL")?;
        url::Url::parse(&config.api_base_url).context("Invalid HUBSPOT_API_BASE_URL")?;

        Ok(config)
    }

    pub fn server_address(&self) -> SocketAddr {
        ([0, 0, 0, 0], self.port).into()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
impl Config {
    /// Configuration pointing every provider URL at `base_url` (a mock server).
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            port: 0,
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            redirect_uri: "http://localhost:4000/auth/callback".to_string(),
            authorization_url: format!("{}/oauth/authorize", base_url),
            api_base_url: base_url.trim_end_matches('/').to_string(),
            webhook_secret: "webhook-secret".to_string(),
            redis_url: None,
            http_timeout: Duration::from_secs(5),
            session_ttl: Duration::from_secs(3600),
            rate_limit_per_minute: 1000,
            circuit_failure_threshold: 5,
            circuit_open_duration: Duration::from_secs(30),
        }
    }
}
