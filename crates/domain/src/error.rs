/// Shared error type used across all RLM crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("RLM is disabled")]
    Disabled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("budget: {0}")]
    Budget(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("adapter: {0}")]
    Adapter(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the engine should retry this error with backoff.
    ///
    /// Adapters may surface provider rate limits either as the dedicated
    /// variant or as a generic adapter error carrying the provider text.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::Adapter(msg) | Error::Other(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("rate limit") || msg.contains("429")
            }
            _ => false,
        }
    }

    /// True when a non-streaming adapter call should permanently fall back
    /// to the streaming adapter for the remainder of the loop.
    pub fn is_unsupported(&self) -> bool {
        match self {
            Error::Unsupported(_) => true,
            Error::Adapter(msg) | Error::Other(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("unsupported")
                    || msg.contains("not supported")
                    || msg.contains("not implemented")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection() {
        assert!(Error::RateLimited("slow down".into()).is_rate_limited());
        assert!(Error::Adapter("HTTP 429 Too Many Requests".into()).is_rate_limited());
        assert!(!Error::Disabled.is_rate_limited());
    }

    #[test]
    fn unsupported_detection() {
        assert!(Error::Unsupported("complete".into()).is_unsupported());
        assert!(Error::Adapter("completion not supported by provider".into()).is_unsupported());
        assert!(Error::Adapter("non-streaming mode not implemented".into()).is_unsupported());
        assert!(!Error::Cancelled.is_unsupported());
    }
}
