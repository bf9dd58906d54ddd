//! Worker configuration, loaded entirely from the environment (spec.md §6).
//!
//! Mirrors the original `app/core/config.py`: a handful of required values,
//! one optional value with a default, and a couple of derived URLs computed
//! once at load time rather than re-assembled on every use.

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Settings {
    pub ari_host: String,
    pub ari_port: String,
    pub ari_app: String,
    pub ari_user: String,
    pub ari_pass: String,
    pub database_url: String,
}

impl Settings {
    pub fn ari_base(&self) -> String {
        format!("http://{}:{}/ari", self.ari_host, self.ari_port)
    }

    pub fn ws_url(&self) -> String {
        format!(
            "ws://{}:{}/ari/events?app={}&api_key={}:{}",
            self.ari_host, self.ari_port, self.ari_app, self.ari_user, self.ari_pass
        )
    }
}

/// Load and validate [`Settings`] from the process environment.
///
/// `.env` (if present) is loaded first via `dotenvy` so local development
/// doesn't require exporting every variable by hand. Missing required values
/// are collected into a single [`ConfigError`] instead of failing on the
/// first one, so an operator sees the whole list in one run.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let ari_host = std::env::var("ARI_HOST").unwrap_or_default();
    let ari_port = std::env::var("ARI_PORT").unwrap_or_else(|_| "8088".to_string());
    let ari_app = std::env::var("ARI_APP").unwrap_or_default();
    let ari_user = std::env::var("ARI_USER").unwrap_or_default();
    let ari_pass = std::env::var("ARI_PASS").unwrap_or_default();
    let database_url = std::env::var("DATABASE_URL").unwrap_or_default();

    let missing: Vec<&str> = [
        ("ARI_HOST", &ari_host),
        ("ARI_APP", &ari_app),
        ("ARI_USER", &ari_user),
        ("ARI_PASS", &ari_pass),
        ("DATABASE_URL", &database_url),
    ]
    .into_iter()
    .filter(|(_, v)| v.is_empty())
    .map(|(name, _)| name)
    .collect();

    if !missing.is_empty() {
        return Err(ConfigError(missing.join(", ")));
    }

    Ok(Settings {
        ari_host,
        ari_port,
        ari_app,
        ari_user,
        ari_pass,
        database_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            ari_host: "asterisk".into(),
            ari_port: "8088".into(),
            ari_app: "pbx_ari".into(),
            ari_user: "ari_user".into(),
            ari_pass: "ari_pass".into(),
            database_url: "postgres://localhost/pbx".into(),
        }
    }

    #[test]
    fn builds_expected_base_url() {
        assert_eq!(settings().ari_base(), "http://asterisk:8088/ari");
    }

    #[test]
    fn builds_expected_ws_url() {
        assert_eq!(
            settings().ws_url(),
            "ws://asterisk:8088/ari/events?app=pbx_ari&api_key=ari_user:ari_pass"
        );
    }
}
