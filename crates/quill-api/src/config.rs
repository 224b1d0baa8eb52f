//! API configuration.

use std::time::Duration;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second
    pub rate_limit_rps: u32,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size
    pub max_body_size: usize,
    /// SQLite database URL
    pub database_url: String,
    /// HS256 secret for verifying bearer tokens
    pub jwt_secret: String,
    /// Path prefixes the quota gate never blocks
    pub exempt_path_prefixes: Vec<String>,
    /// Where over-quota requests are redirected
    pub limit_reached_path: String,
    /// Environment (development/production)
    pub environment: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 10,
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            database_url: "sqlite://quill.db".to_string(),
            jwt_secret: String::new(),
            exempt_path_prefixes: default_exempt_prefixes(),
            limit_reached_path: "/limit-reached".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Endpoints a blocked user still needs to reach: quota visibility,
/// alert management, buying more tokens, and the block page itself.
fn default_exempt_prefixes() -> Vec<String> {
    [
        "/api/quota",
        "/api/alerts",
        "/api/purchases",
        "/limit-reached",
        "/health",
        "/healthz",
        "/ready",
        "/metrics",
        "/static",
        "/media",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8000),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["*".to_string()]),
            rate_limit_rps: std::env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            request_timeout: Duration::from_secs(
                std::env::var("REQUEST_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://quill.db".to_string()),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_default(),
            exempt_path_prefixes: std::env::var("QUOTA_EXEMPT_PREFIXES")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| default_exempt_prefixes()),
            limit_reached_path: std::env::var("LIMIT_REACHED_PATH")
                .unwrap_or_else(|_| "/limit-reached".to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }

    /// Whether the quota gate skips this request path.
    pub fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}
