use std::env;
use std::fmt::Display;
use std::str::FromStr;

use log::warn;

/// Runtime settings, all environment-driven. Anything unset or unparsable
/// falls back to the default and logs a warning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket listener binds to.
    pub port: u16,
    /// When set, CORS is restricted to this origin; otherwise any origin.
    pub allowed_origin: Option<String>,
    /// How many messages a chat history query returns.
    pub history_window: usize,
    /// Maximum records retained per high-volume room (the main lobby).
    pub history_retain: usize,
    /// Directory served as the UI shell.
    pub static_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 2052,
            allowed_origin: None,
            history_window: 25,
            history_retain: 200,
            static_dir: "public".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            port: parsed_var("TQ_PORT", defaults.port),
            allowed_origin: env::var("TQ_ALLOWED_ORIGIN")
                .ok()
                .filter(|origin| !origin.is_empty()),
            history_window: parsed_var("TQ_HISTORY_WINDOW", defaults.history_window),
            history_retain: parsed_var("TQ_HISTORY_RETAIN", defaults.history_retain),
            static_dir: env::var("TQ_STATIC_DIR").unwrap_or(defaults.static_dir),
        }
    }
}

fn parsed_var<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid {key}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}
