use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned no bars")]
    Empty,

    #[error("unknown symbol: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Worth another attempt: network trouble, timeouts, throttling,
    /// empty payloads and server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::RateLimited
            | ProviderError::Empty => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::NotFound(_) | ProviderError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Empty.is_transient());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!ProviderError::Http { status: 403, body: String::new() }.is_transient());
        assert!(!ProviderError::NotFound("ZZZZ".into()).is_transient());
    }
}
