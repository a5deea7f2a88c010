use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("tls setup failed: {0}")]
    Tls(&'static str),

    #[error("xmpp protocol violation: {0}")]
    Protocol(String),

    #[error("sasl authentication rejected: {0}")]
    AuthRejected(String),

    #[error("malformed json in gcm stanza: {0}")]
    Json(#[from] serde_json::Error),
}
