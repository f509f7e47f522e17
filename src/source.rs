//! Content sources the engine pulls byte ranges from.
//!
//! A [`Source`] must deliver exactly the requested number of bytes for
//! every range except the final, shorter one that runs to end-of-file;
//! anything else is a source-read failure that aborts the whole fetch
//! batch.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tracing::debug;

/// Async ranged-read contract for transfer sources.
pub trait Source: Send + Sync + 'static {
    /// Total size of the content in bytes.
    fn size(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Read exactly `length` bytes starting at `offset`.  The final
    /// range of the content may come back shorter only because it runs
    /// to end-of-file.
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;
}

// ── HTTP source ─────────────────────────────────────────────────────

/// Source backed by an HTTP URL supporting ranged GETs.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Source for HttpSource {
    fn size(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            // HEAD first; some origins omit Content-Length there, in which
            // case a one-byte ranged GET exposes the total via Content-Range.
            let resp = self
                .client
                .head(&self.url)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("HEAD request failed: {e}"))?;

            if resp.status().is_success() {
                if let Some(len) = resp.content_length() {
                    if len > 0 {
                        return Ok(len);
                    }
                }
            }

            let resp = self
                .client
                .get(&self.url)
                .header("Range", "bytes=0-0")
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("ranged GET for size failed: {e}"))?;

            let content_range = resp
                .headers()
                .get("Content-Range")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow::anyhow!("source did not report its size"))?;

            parse_content_range_total(content_range)
                .ok_or_else(|| anyhow::anyhow!("malformed Content-Range: {content_range}"))
        })
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let range = format!("bytes={}-{}", offset, offset + length - 1);

            let resp = self
                .client
                .get(&self.url)
                .header("Range", &range)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("ranged GET failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                return Err(anyhow::anyhow!(
                    "source returned {status} for range {range}"
                ));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("failed to read range body: {e}"))?;

            if body.len() as u64 != length {
                return Err(anyhow::anyhow!(
                    "short read: wanted {} bytes at offset {}, got {}",
                    length,
                    offset,
                    body.len()
                ));
            }

            debug!("fetched {} bytes at offset {}", length, offset);
            Ok(body)
        })
    }
}

/// Extract the total length from a `Content-Range: bytes a-b/total` value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

// ── Memory source ───────────────────────────────────────────────────

/// In-memory source.  Useful for small payloads already materialized in
/// the process, and as the engine test vehicle.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl Source for MemorySource {
    fn size(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move { Ok(self.data.len() as u64) })
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let start = offset as usize;
            let end = start
                .checked_add(length as usize)
                .filter(|&end| end <= self.data.len())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "range [{}, {}) out of bounds for {}-byte source",
                        offset,
                        offset + length,
                        self.data.len()
                    )
                })?;
            Ok(self.data.slice(start..end))
        })
    }
}
