//! HTTP range source over an Azure blob URL.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::TryStreamExt;
use md5::{Digest, Md5};
use reqwest::{Client, Method, Response, StatusCode};
use std::io::Cursor;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use super::{RangeReader, RangeSource};
use crate::auth::Credential;
use crate::error::{ErrorCode, SyncError, SyncResult};
use crate::models::{merge_ranges, IndexRange};
use crate::xml::PageList;

/// Largest range for which the service returns a transactional MD5.
pub const MAX_MD5_RANGE: u64 = 4 * 1024 * 1024;

/// A blob addressed by URL plus credential.
///
/// Holds only connection parameters and the properties read at connect time,
/// so one handle serves every transfer worker.
#[derive(Debug, Clone)]
pub struct BlobHandle {
    client: Client,
    url: Url,
    credential: Credential,
    length: u64,
    page_blob: bool,
    verify_md5: bool,
}

impl BlobHandle {
    /// Reads the blob properties and returns a handle bound to them.
    pub async fn connect(url: &str, credential: Credential) -> SyncResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            SyncError::with_message(ErrorCode::InvalidInput, format!("invalid blob URL {url:?}: {e}"))
        })?;
        let mut handle = Self {
            client: Client::new(),
            url,
            credential,
            length: 0,
            page_blob: false,
            verify_md5: false,
        };

        let response = handle.send(Method::HEAD, None, &[]).await?;
        let headers = response.headers();
        handle.length = headers
            .get("x-ms-blob-content-length")
            .or_else(|| headers.get(reqwest::header::CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                SyncError::with_message(ErrorCode::Remote, "blob properties carry no length")
            })?;
        handle.page_blob = headers
            .get("x-ms-blob-type")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |t| t.eq_ignore_ascii_case("PageBlob"));

        debug!(
            "connected to {} ({} bytes, page blob: {})",
            handle.url.path(),
            handle.length,
            handle.page_blob
        );
        Ok(handle)
    }

    /// Requests and checks a Content-MD5 for every range up to 4 MiB.
    pub fn with_md5_verification(mut self, verify: bool) -> Self {
        self.verify_md5 = verify;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_page_blob(&self) -> bool {
        self.page_blob
    }

    async fn send(
        &self,
        method: Method,
        query: Option<&str>,
        headers: &[(&'static str, String)],
    ) -> SyncResult<Response> {
        let mut url = self.url.clone();
        if let Some(query) = query {
            url.set_query(Some(query));
        }
        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        let mut request = builder.build()?;
        self.credential.authorize(&mut request)?;

        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let code = response
                .headers()
                .get("x-ms-error-code")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(SyncError::with_message(
                ErrorCode::Remote,
                format!("{} returned {status} {code}", self.url.path()),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl RangeSource for BlobHandle {
    fn length(&self) -> u64 {
        self.length
    }

    async fn ranges(&self) -> SyncResult<Vec<IndexRange>> {
        if !self.page_blob {
            return Ok(if self.length == 0 {
                Vec::new()
            } else {
                vec![IndexRange::new(0, self.length)]
            });
        }

        let mut ranges = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let query = match &marker {
                Some(m) => format!(
                    "comp=pagelist&marker={}",
                    percent_encoding::utf8_percent_encode(m, percent_encoding::NON_ALPHANUMERIC)
                ),
                None => "comp=pagelist".to_string(),
            };
            let body = self.send(Method::GET, Some(&query), &[]).await?.text().await?;
            let page = PageList::parse(&body)?;
            ranges.extend(page.ranges);
            match page.next_marker {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => break,
            }
        }
        Ok(merge_ranges(ranges))
    }

    async fn open_range(&self, range: IndexRange) -> SyncResult<RangeReader> {
        let mut headers = vec![(
            "x-ms-range",
            format!("bytes={}-{}", range.start_index, range.last_index()),
        )];
        let verify = self.verify_md5 && range.length <= MAX_MD5_RANGE;
        if verify {
            headers.push(("x-ms-range-get-content-md5", "true".to_string()));
        }

        let response = self
            .send(Method::GET, None, &headers)
            .await
            .map_err(|e| SyncError::transfer(format!("range {range}: {}", e.message)))?;
        if response.status() != StatusCode::PARTIAL_CONTENT && response.status() != StatusCode::OK
        {
            return Err(SyncError::transfer(format!(
                "range {range}: unexpected status {}",
                response.status()
            )));
        }

        if !verify {
            let stream = response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            return Ok(Box::new(StreamReader::new(Box::pin(stream))));
        }

        let expected = response
            .headers()
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        if let Some(expected) = expected {
            let actual = BASE64.encode(Md5::digest(&body));
            if actual != expected {
                return Err(SyncError::transfer(format!(
                    "range {range}: Content-MD5 {expected} does not match {actual}"
                )));
            }
        }
        Ok(Box::new(Cursor::new(body)))
    }
}
