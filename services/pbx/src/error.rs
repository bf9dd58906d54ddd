//! Error kinds the worker distinguishes between, following the taxonomy in
//! spec.md §7: transient external failures, the REST client's own protocol
//! violations, persistence failures, and fatal config errors.

/// Errors surfaced by the ARI REST client.
///
/// A 404 on a delete is not an error at all — see
/// [`crate::ari::client::AriClient`] — so this type only ever represents a
/// genuine transient failure (network, non-2xx/404 status) or a protocol
/// violation (a 2xx response missing the `id` field it promised).
#[derive(Debug, thiserror::Error)]
pub enum AriError {
    #[error("ari client not started")]
    NotStarted,

    #[error("ari request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ari returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("ari response missing expected field `{field}`")]
    MissingField { field: &'static str },
}

/// Errors surfaced by the call recorder's Postgres transactions.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("persistence error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Raised once at startup when required configuration is absent.
#[derive(Debug, thiserror::Error)]
#[error("missing required configuration: {0}")]
pub struct ConfigError(pub String);
