#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gateway returned status {status} for {url}: {body}")]
    BadStatus {
        url: String,
        status: u16,
        body: String,
    },
    #[error("gateway response from {url} was not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gateway refused spawn: {reason}")]
    SpawnRefused { reason: String },
}
