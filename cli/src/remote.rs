use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use stride_core::models::Document;
use stride_core::store::RemoteStore;

use crate::server::{CreatedResponse, ErrorResponse};

/// [`RemoteStore`] backed by a `stride serve` document server.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("stride-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn user_url(&self, user_id: &str) -> String {
        format!(
            "{}/api/users/{}",
            self.base_url,
            percent_encode_component(user_id)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Turn a non-success response into an error carrying the server's message.
async fn check(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    bail!("{action} failed ({status}): {message}")
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get_user_document(&self, user_id: &str) -> Result<Option<Document>> {
        let response = self
            .request(Method::GET, &self.user_url(user_id))
            .send()
            .await
            .context("Failed to reach sync server")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "Fetching user document").await?;
        let doc = response
            .json()
            .await
            .context("Failed to parse user document")?;
        Ok(Some(doc))
    }

    async fn set_user_document(&self, user_id: &str, doc: Document, merge: bool) -> Result<()> {
        let response = self
            .request(Method::PUT, &self.user_url(user_id))
            .query(&[("merge", merge)])
            .json(&doc)
            .send()
            .await
            .context("Failed to reach sync server")?;
        check(response, "Writing user document").await?;
        Ok(())
    }

    async fn create_child_document(
        &self,
        user_id: &str,
        collection: &str,
        doc: Document,
    ) -> Result<String> {
        let url = format!(
            "{}/{}",
            self.user_url(user_id),
            percent_encode_component(collection)
        );
        let response = self
            .request(Method::POST, &url)
            .json(&doc)
            .send()
            .await
            .context("Failed to reach sync server")?;
        let response = check(response, &format!("Creating {collection} document")).await?;
        let created: CreatedResponse = response
            .json()
            .await
            .context("Failed to parse create response")?;
        Ok(created.id)
    }
}

/// Percent-encode a string for use as a single URL path segment.
fn percent_encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => {
                out.push('%');
                out.push(HEX_CHARS[(b >> 4) as usize] as char);
                out.push(HEX_CHARS[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

const HEX_CHARS: [u8; 16] = *b"0123456789ABCDEF";
