use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scheduling_api_url: String,
    pub scheduling_push_url: String,
    pub scheduling_auth_token: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            scheduling_api_url: env::var("SCHEDULING_API_URL")
                .unwrap_or_else(|_| {
                    warn!("SCHEDULING_API_URL not set, using empty value");
                    String::new()
                }),
            scheduling_push_url: env::var("SCHEDULING_PUSH_URL")
                .unwrap_or_else(|_| {
                    warn!("SCHEDULING_PUSH_URL not set, using empty value");
                    String::new()
                }),
            scheduling_auth_token: env::var("SCHEDULING_AUTH_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("SCHEDULING_AUTH_TOKEN not set, using empty value");
                    String::new()
                }),
        };

        if !config.is_configured() {
            warn!("Scheduling subsystem not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.scheduling_api_url.is_empty()
            && !self.scheduling_push_url.is_empty()
    }
}
