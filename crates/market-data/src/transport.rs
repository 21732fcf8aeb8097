use async_trait::async_trait;
use polygon_client::{AggregatesQuery, PolygonClient, ProviderError, RawRow};

/// Source of raw aggregate rows. Implemented by the Polygon client; tests
/// substitute scripted transports.
#[async_trait]
pub trait AggregatesTransport: Send + Sync {
    async fn fetch_rows(&self, query: &AggregatesQuery) -> Result<Vec<RawRow>, ProviderError>;
}

#[async_trait]
impl AggregatesTransport for PolygonClient {
    async fn fetch_rows(&self, query: &AggregatesQuery) -> Result<Vec<RawRow>, ProviderError> {
        self.get_aggregates(query).await
    }
}
