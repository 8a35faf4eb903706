//! GraphQL-over-HTTP query client backed by `reqwest`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use chainmirror_core::MirrorError;

/// Posts GraphQL queries to the node's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

impl GraphqlClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, MirrorError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MirrorError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run `query` and return its `data` object.
    ///
    /// Transport failures, non-2xx answers and GraphQL `errors` all surface as
    /// [`MirrorError::Source`].
    pub async fn query(&self, query: &str) -> Result<Value, MirrorError> {
        tracing::trace!(url = %self.url, query, "graphql query");
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| MirrorError::Source(format!("{}: {e}", self.url)))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(MirrorError::Source(format!("HTTP {status}: {body}")));
        }

        let body = resp
            .json::<GraphqlResponse>()
            .await
            .map_err(|e| MirrorError::Source(format!("undecodable graphql answer: {e}")))?;
        into_data(body)
    }
}

fn into_data(body: GraphqlResponse) -> Result<Value, MirrorError> {
    if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
        let joined = errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(MirrorError::Source(format!("graphql: {joined}")));
    }
    body.data
        .filter(|d| !d.is_null())
        .ok_or_else(|| MirrorError::Source("graphql answer without data".into()))
}
