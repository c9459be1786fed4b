//! Turns image references (URL, data URI, bare Base64) into decoded rasters.
//!
//! URL references cost exactly one outbound GET bounded by the caller's timeout.
//! Base64 references never touch the network. Either way the bytes are decoded
//! into a [`DecodedImage`] before they leave this module.

use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::{SliderError, SliderResult};
use crate::raster::DecodedImage;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const MAX_REDIRECTS: usize = 5;

/// Standard alphabet, padding optional on input.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    Url(String),
    /// `data:<mime>;base64,<payload>`; holds the payload only.
    DataUri(String),
    Base64(String),
}

impl ImageReference {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            ImageReference::Url(raw.to_string())
        } else if raw.starts_with("data:") {
            let payload = raw.split_once(',').map_or(raw, |(_, data)| data);
            ImageReference::DataUri(payload.to_string())
        } else {
            ImageReference::Base64(raw.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageReference::Url(_) => "url",
            ImageReference::DataUri(_) => "data-uri",
            ImageReference::Base64(_) => "base64",
        }
    }
}

/// Decodes a Base64 payload, ignoring embedded whitespace and missing padding.
pub fn decode_base64(payload: &str) -> SliderResult<Vec<u8>> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(SliderError::Decode("payload is empty".into()));
    }
    LENIENT_BASE64
        .decode(compact.as_bytes())
        .map_err(|e| SliderError::Decode(e.to_string()))
}

/// Strips query and fragment so signed URLs never reach the logs.
pub(crate) fn redact_url_for_log(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.chars().take(64).collect(),
    }
}

pub struct ImageLoader {
    client: reqwest::Client,
    max_bytes: u64,
    png_fix: bool,
}

impl ImageLoader {
    pub fn new(config: &ResolverConfig) -> SliderResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| SliderError::Internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            max_bytes: config.max_image_bytes,
            png_fix: config.png_fix,
        })
    }

    /// Resolves `reference` into pixels. `timeout` bounds the whole fetch,
    /// connection through last body byte.
    pub async fn load(&self, reference: &ImageReference, timeout: Duration) -> SliderResult<DecodedImage> {
        let bytes = match reference {
            ImageReference::Url(url) => self.fetch(url, timeout).await?,
            ImageReference::DataUri(payload) | ImageReference::Base64(payload) => {
                let bytes = decode_base64(payload)?;
                debug!(kind = reference.kind(), bytes = bytes.len(), "decoded base64 image");
                bytes
            }
        };
        if bytes.len() as u64 > self.max_bytes {
            return Err(SliderError::Decode(format!(
                "image is {} bytes, limit is {}",
                bytes.len(),
                self.max_bytes
            )));
        }
        DecodedImage::from_bytes(&bytes, self.png_fix)
    }

    /// One GET; any 2xx body is accepted, everything else is a fetch failure.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> SliderResult<Vec<u8>> {
        let shown = redact_url_for_log(url);
        info!(url = %shown, ?timeout, "fetching image");

        match tokio::time::timeout(timeout, self.fetch_inner(url, &shown, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(url = %shown, ?timeout, "image fetch timed out");
                Err(SliderError::FetchTimeout { url: shown, timeout })
            }
        }
    }

    async fn fetch_inner(&self, url: &str, shown: &str, timeout: Duration) -> SliderResult<Vec<u8>> {
        let parsed = reqwest::Url::parse(url).map_err(|e| SliderError::Fetch {
            url: shown.to_string(),
            reason: format!("invalid url: {e}"),
        })?;

        let response = self
            .client
            .get(parsed)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "image/avif,image/webp,image/apng,image/*,*/*;q=0.8")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, shown, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SliderError::Fetch {
                url: shown.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(self.oversize(shown, len));
            }
        }

        // Content-Length is optional; the running total is what enforces the cap.
        let mut response = response;
        let mut body = Vec::new();
        let mut total: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| map_reqwest_error(e, shown, timeout))? {
            total = total.saturating_add(chunk.len() as u64);
            if total > self.max_bytes {
                return Err(self.oversize(shown, total));
            }
            body.extend_from_slice(&chunk);
        }
        info!(url = %shown, bytes = body.len(), "image fetched");
        Ok(body)
    }

    fn oversize(&self, shown: &str, len: u64) -> SliderError {
        warn!(url = %shown, bytes = len, limit = self.max_bytes, "image body over size limit");
        SliderError::Fetch {
            url: shown.to_string(),
            reason: format!("body of at least {len} bytes exceeds limit of {}", self.max_bytes),
        }
    }
}

fn map_reqwest_error(e: reqwest::Error, shown: &str, timeout: Duration) -> SliderError {
    if e.is_timeout() {
        SliderError::FetchTimeout { url: shown.to_string(), timeout }
    } else if e.is_connect() {
        SliderError::Fetch { url: shown.to_string(), reason: format!("connect failed: {e}") }
    } else {
        SliderError::Fetch { url: shown.to_string(), reason: e.to_string() }
    }
}
