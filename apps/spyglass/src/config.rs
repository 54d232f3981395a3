use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared-secret connect token; `None` leaves the gate open.
    pub ws_token: Option<String>,
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env::var("SPYGLASS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SPYGLASS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9001),
            ws_token: env::var("SPYGLASS_WS_TOKEN").ok().filter(|t| !t.is_empty()),
            sweep_interval_seconds: env::var("SPYGLASS_SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            ws_token: None,
            sweep_interval_seconds: 30,
        }
    }
}
