/// Failure building a transport-backed element source.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}
