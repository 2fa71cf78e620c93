//! Error kinds shared by every component. Connection-level code matches on
//! these; `main.rs` just lets `anyhow` wrap them for display.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed client request: {0}")]
    ClientProtocol(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("failed to connect upstream {host}:{port}: {source}")]
    UpstreamConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve {0}")]
    ResolutionFailed(String),

    #[error("failed to mint certificate for {host}: {source}")]
    CertMintFailed {
        host: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("failed to load mock rules: {0}")]
    MockLoadFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
