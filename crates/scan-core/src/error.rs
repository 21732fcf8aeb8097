use thiserror::Error;

/// Failure to obtain bars for a symbol from the market-data provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Network errors, timeouts or empty responses that outlasted the retry budget
    #[error("data unavailable for {symbol}: {message}")]
    Transient { symbol: String, message: String },

    /// Unknown or delisted symbol; never retried
    #[error("no such symbol {symbol}: {message}")]
    Permanent { symbol: String, message: String },
}

impl DataError {
    pub fn symbol(&self) -> &str {
        match self {
            DataError::Transient { symbol, .. } | DataError::Permanent { symbol, .. } => symbol,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DataError::Transient { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown timeframe: {0}")]
pub struct ParseTimeframeError(pub String);
