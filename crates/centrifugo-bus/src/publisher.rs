//! HTTP side of the bus: the application server relays published bodies
//! into Centrifugo channels and issues connection tokens.

use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// JSON-over-HTTP client for the application server
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPublisher {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Full URL for a server path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST a JSON body; non-2xx responses are errors
    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        debug!("POST {} ok", url);
        Ok(())
    }

    /// Fetch a connection token for a client id
    pub async fn fetch_token(&self, client_id: &str) -> Result<String> {
        let token = self
            .client
            .get(self.url("/centrifugo-token"))
            .query(&[("clientId", client_id)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(token.trim().to_string())
    }
}
