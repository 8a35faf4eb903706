//! [`ChainSource`] backed by a live Mina node.

use async_trait::async_trait;

use chainmirror_core::{
    BestChain, ChainSource, EnvelopeStream, GraphqlConfig, MirrorError, SyncStatus,
};

use crate::client::GraphqlClient;
use crate::queries;
use crate::subscription;

/// A Mina node reached over its GraphQL endpoint: queries over HTTP, the
/// block subscription over WebSocket.
pub struct MinaGraphqlSource {
    client: GraphqlClient,
    ws_url: String,
    subscription: String,
}

impl MinaGraphqlSource {
    pub fn new(client: GraphqlClient, ws_url: impl Into<String>) -> Self {
        Self {
            client,
            ws_url: ws_url.into(),
            subscription: queries::new_block_subscription(),
        }
    }

    pub fn from_config(config: &GraphqlConfig) -> Result<Self, MirrorError> {
        let client = GraphqlClient::new(config.http_url(), config.request_timeout())?;
        Ok(Self::new(client, config.ws_url()))
    }

    pub fn http_url(&self) -> &str {
        self.client.url()
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

#[async_trait]
impl ChainSource for MinaGraphqlSource {
    async fn subscribe(&self) -> Result<EnvelopeStream, MirrorError> {
        subscription::subscribe(&self.ws_url, &self.subscription).await
    }

    async fn best_chain(&self, window: u32) -> Result<BestChain, MirrorError> {
        let data = self.client.query(&queries::best_chain_query(window)).await?;
        let chain = queries::parse_best_chain(&data)?;
        tracing::debug!(
            heights = chain.len(),
            floor = ?chain.floor(),
            tip = ?chain.tip(),
            "best chain fetched"
        );
        Ok(chain)
    }

    async fn sync_status(&self) -> Result<SyncStatus, MirrorError> {
        let data = self.client.query(queries::SYNC_STATUS_QUERY).await?;
        queries::parse_sync_status(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_config() {
        let config = GraphqlConfig {
            host: "mina.local".into(),
            port: 8304,
            ..GraphqlConfig::default()
        };
        let source = MinaGraphqlSource::from_config(&config).unwrap();
        assert_eq!(source.http_url(), "http://mina.local:8304/graphql");
        assert_eq!(source.ws_url(), "ws://mina.local:8304/graphql");
    }

    #[tokio::test]
    async fn unreachable_node_fails_transiently() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = GraphqlConfig {
            host: "127.0.0.1".into(),
            port,
            request_timeout_secs: 2,
            ..GraphqlConfig::default()
        };
        let source = MinaGraphqlSource::from_config(&config).unwrap();
        let err = source.sync_status().await.unwrap_err();
        assert!(err.is_transient());
    }
}
