use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("local server refused the connection")]
    Connect(#[source] reqwest::Error),
    #[error("local server timed out")]
    Timeout,
    #[error("failed to read local server response body")]
    Body(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("edge rejected registration: {0}")]
    Rejected(String),
    #[error("failed to reach edge at {url}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}
