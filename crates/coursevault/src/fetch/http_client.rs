//! Streaming HTTP downloads carrying the session's cookies.
//!
//! Not a browser: plain GETs with a Chrome user agent and the cookies the
//! browsing session holds for the target host.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderValue, COOKIE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::error::RetrievalError;
use crate::renderer::StoredCookie;

/// What a finished download reported.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: u64,
    /// Final URL after redirects.
    pub final_url: String,
}

/// HTTP client for direct file fetches.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Create a client with a standard Chrome user agent.
    pub fn new(timeout_ms: u64) -> Self {
        let ua = "Mozilla/5.0 (X11; Linux x86_64) \
                  AppleWebKit/537.36 (KHTML, like Gecko) \
                  Chrome/131.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(ua)
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Stream `url` into `sink`. Non-2xx responses are errors.
    pub async fn download<W>(
        &self,
        url: &str,
        cookies: &[StoredCookie],
        sink: &mut W,
    ) -> Result<Download, RetrievalError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let parsed = Url::parse(url).map_err(|e| RetrievalError::Transport(e.to_string()))?;
        let mut request = self.client.get(parsed.clone());
        if let Some(header) = cookie_header(&parsed, cookies) {
            request = request.header(COOKIE, header);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RetrievalError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let final_url = response.url().to_string();

        let mut bytes = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RetrievalError::Transport(e.to_string()))?;
            sink.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        sink.flush().await?;

        Ok(Download { bytes, final_url })
    }
}

/// `Cookie` header value for the cookies that apply to `url`.
fn cookie_header(url: &Url, cookies: &[StoredCookie]) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let https = url.scheme() == "https";
    let pairs: Vec<String> = cookies
        .iter()
        .filter(|c| c.matches_host(host))
        .filter(|c| url.path().starts_with(&c.path))
        .filter(|c| https || !c.secure)
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    HeaderValue::from_str(&pairs.join("; ")).ok()
}
