//! Token sources — application callbacks and the HTTP endpoint fallback.
//!
//! Tokens come from the application: either an async callback (the usual
//! path) or a plain HTTPS endpoint the client POSTs to when no callback is
//! supplied. An empty token from either source means "not authorized".

use futures_util::future::BoxFuture;

use crate::error::ClientError;

/// Asynchronous source of connection tokens.
pub trait ConnectionTokenProvider: Send + Sync {
    fn connection_token(&self) -> BoxFuture<'static, Result<String, ClientError>>;
}

/// Asynchronous source of per-channel subscription tokens.
pub trait SubscriptionTokenProvider: Send + Sync {
    fn subscription_token(&self, channel: &str) -> BoxFuture<'static, Result<String, ClientError>>;
}

impl<F> ConnectionTokenProvider for F
where
    F: Fn() -> BoxFuture<'static, Result<String, ClientError>> + Send + Sync,
{
    fn connection_token(&self) -> BoxFuture<'static, Result<String, ClientError>> {
        (self)()
    }
}

impl<F> SubscriptionTokenProvider for F
where
    F: Fn(&str) -> BoxFuture<'static, Result<String, ClientError>> + Send + Sync,
{
    fn subscription_token(&self, channel: &str) -> BoxFuture<'static, Result<String, ClientError>> {
        (self)(channel)
    }
}

/// An HTTPS endpoint returning `{"token": "..."}`, used when the
/// application configures a URL instead of a callback.
///
/// Requests are plain POSTs; for subscription tokens the channel is sent
/// in the JSON body. Dropping the returned future aborts the request, so
/// a session transition that invalidates a pending fetch cancels it.
#[cfg(feature = "http")]
pub struct TokenEndpoint {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl TokenEndpoint {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string(), client: reqwest::Client::new() }
    }

    async fn fetch(client: reqwest::Client, url: String, body: serde_json::Value) -> Result<String, ClientError> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let resp = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Token(format!("token endpoint request: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClientError::Token(format!(
                "token endpoint returned status {}",
                resp.status()
            )));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Token(format!("token endpoint body: {e}")))?;
        Ok(parsed.token)
    }
}

#[cfg(feature = "http")]
impl ConnectionTokenProvider for TokenEndpoint {
    fn connection_token(&self) -> BoxFuture<'static, Result<String, ClientError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        Box::pin(Self::fetch(client, url, serde_json::json!({})))
    }
}

#[cfg(feature = "http")]
impl SubscriptionTokenProvider for TokenEndpoint {
    fn subscription_token(&self, channel: &str) -> BoxFuture<'static, Result<String, ClientError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = serde_json::json!({ "channel": channel });
        Box::pin(Self::fetch(client, url, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_closure_provider() {
        let provider: Arc<dyn ConnectionTokenProvider> =
            Arc::new(|| -> BoxFuture<'static, Result<String, ClientError>> {
                Box::pin(async { Ok("tok".to_string()) })
            });
        assert_eq!(provider.connection_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_failing_provider_maps_to_token_error() {
        let provider: Arc<dyn ConnectionTokenProvider> =
            Arc::new(|| -> BoxFuture<'static, Result<String, ClientError>> {
                Box::pin(async { Err(ClientError::Token("backend down".into())) })
            });
        let err = provider.connection_token().await.unwrap_err();
        assert!(matches!(err, ClientError::Token(_)));
    }
}
