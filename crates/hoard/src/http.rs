use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt};
use packrat_core::DownloadFailure;
use std::time::Duration;

/// Status line, the headers the queue cares about, and a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn AsyncRead + Unpin + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// One GET, no redirect following. Errors are already classified.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadFailure>;
}

/// Production transport over `surf`.
pub struct SurfTransport {
    client: surf::Client,
}

impl SurfTransport {
    pub fn new() -> Self {
        Self {
            client: surf::Client::new(),
        }
    }
}

impl Default for SurfTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for SurfTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadFailure> {
        let response = self
            .client
            .get(url)
            .await
            .map_err(|e| DownloadFailure::classify(&e.to_string()))?;

        let status: u16 = response.status().into();
        let location = response
            .header("Location")
            .map(|values| values.last().as_str().to_string());
        let content_length = response.len().map(|n| n as u64);

        Ok(HttpResponse {
            status,
            location,
            content_length,
            body: Box::new(response),
        })
    }
}

/// Issues a GET and re-issues it for every `3xx` + `Location`, up to `max_redirects` hops.
///
/// Returns the final URL alongside the response. Each hop is bounded by `timeout`.
pub async fn get_following_redirects(
    transport: &dyn HttpTransport,
    url: &str,
    max_redirects: u8,
    timeout: Duration,
) -> Result<(String, HttpResponse), DownloadFailure> {
    let mut current = url.to_string();
    let mut hops = 0u8;

    loop {
        let response = async_std::future::timeout(timeout, transport.get(&current))
            .await
            .map_err(|_| DownloadFailure::Timeout)??;

        if response.is_redirect() {
            if let Some(location) = response.location.as_deref() {
                if hops >= max_redirects {
                    return Err(DownloadFailure::TooManyRedirects);
                }
                let next = resolve_location(&current, location)?;
                log::debug!("Redirect {} -> {}", current, next);
                current = next;
                hops += 1;
                continue;
            }
        }

        return Ok((current, response));
    }
}

/// Fetches a small text document (manifests), following redirects.
pub async fn fetch_text(
    transport: &dyn HttpTransport,
    url: &str,
    max_redirects: u8,
    timeout: Duration,
    max_bytes: u64,
) -> Result<String, DownloadFailure> {
    let (_, response) = get_following_redirects(transport, url, max_redirects, timeout).await?;
    if !response.is_success() {
        return Err(DownloadFailure::HttpStatus(response.status));
    }
    if response.content_length.is_some_and(|len| len > max_bytes) {
        return Err(DownloadFailure::BodyTooLarge);
    }

    let mut body = Vec::new();
    let mut limited = response.body.take(max_bytes + 1);
    async_std::future::timeout(timeout, limited.read_to_end(&mut body))
        .await
        .map_err(|_| DownloadFailure::Timeout)?
        .map_err(|e| DownloadFailure::classify(&e.to_string()))?;
    if body.len() as u64 > max_bytes {
        return Err(DownloadFailure::BodyTooLarge);
    }
    String::from_utf8(body)
        .map_err(|e| DownloadFailure::Unknown(format!("body is not UTF-8: {}", e)))
}

// Absolute locations are used as-is; relative ones are joined onto the current URL.
fn resolve_location(current: &str, location: &str) -> Result<String, DownloadFailure> {
    if let Ok(url) = surf::Url::parse(location) {
        return Ok(url.to_string());
    }
    surf::Url::parse(current)
        .and_then(|base| base.join(location))
        .map(|url| url.to_string())
        .map_err(|_| DownloadFailure::Unknown(format!("invalid redirect location '{}'", location)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_locations_join_onto_the_current_url() {
        assert_eq!(
            resolve_location("https://cdn.example/packs/a/manifest.json", "../b/manifest.json")
                .unwrap(),
            "https://cdn.example/packs/b/manifest.json"
        );
        assert_eq!(
            resolve_location("https://cdn.example/x", "https://mirror.example/y").unwrap(),
            "https://mirror.example/y"
        );
    }
}
