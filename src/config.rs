use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_url: String,
    pub lock_vars: bool,
    pub save_debounce_ms: u64,
    pub save_prefix: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("CLOUDVARS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9080),
            storage_url: env::var("CLOUDVARS_STORAGE")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            lock_vars: env::var("LOCK_VARS")
                .map(|value| matches_truthy(&value))
                .unwrap_or(false),
            save_debounce_ms: env::var("SAVE_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            save_prefix: env::var("CLOUDVARS_PREFIX")
                .unwrap_or_else(|_| "cloud-vars/".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9080,
            storage_url: "redis://localhost:6379".to_string(),
            lock_vars: false,
            save_debounce_ms: 1_000,
            save_prefix: "cloud-vars/".to_string(),
        }
    }
}

fn matches_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
