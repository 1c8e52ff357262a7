//! SharedKey and SAS authorization for blob requests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Request;
use sha2::Sha256;
use std::fmt;

use crate::error::{ErrorCode, SyncError, SyncResult};

type HmacSha256 = Hmac<Sha256>;

/// Service version sent with every request.
pub const API_VERSION: &str = "2021-10-04";

/// Credential attached to requests against a blob URL.
#[derive(Clone)]
pub enum Credential {
    /// Public blob, no authorization.
    Anonymous,
    /// Account name and base64 account key; requests are signed with SharedKey.
    SharedKey { account: String, key: String },
    /// Shared access signature query string (with or without a leading `?`).
    Sas(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys and signatures never reach logs.
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
            Credential::Sas(_) => f.write_str("Sas(..)"),
        }
    }
}

impl Credential {
    /// Adds the date and version headers, then authorizes the request.
    pub fn authorize(&self, request: &mut Request) -> SyncResult<()> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let headers = request.headers_mut();
        headers.insert("x-ms-date", header_value(&date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        match self {
            Credential::Anonymous => Ok(()),
            Credential::Sas(token) => {
                let token = token.trim_start_matches('?');
                let url = request.url_mut();
                let query = match url.query() {
                    Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                    _ => token.to_string(),
                };
                url.set_query(Some(&query));
                Ok(())
            }
            Credential::SharedKey { account, key } => {
                let string_to_sign = build_string_to_sign(request, account);
                let signature = compute_signature(&string_to_sign, key)?;
                request.headers_mut().insert(
                    AUTHORIZATION,
                    header_value(&format!("SharedKey {account}:{signature}"))?,
                );
                Ok(())
            }
        }
    }
}

fn header_value(value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        SyncError::with_message(ErrorCode::InvalidInput, format!("invalid header value {value:?}"))
    })
}

/// Builds the string-to-sign for SharedKey authentication.
pub fn build_string_to_sign(request: &Request, account: &str) -> String {
    let headers = request.headers();
    let mut parts = Vec::new();

    // VERB
    parts.push(request.method().as_str().to_uppercase());

    // Content headers (must be in this exact order)
    for header in [
        "content-encoding",
        "content-language",
        "content-length",
        "content-md5",
        "content-type",
    ] {
        let value = header_str(headers, header);
        // Content-Length is empty when zero
        let value = if header == "content-length" && value == "0" {
            ""
        } else {
            value
        };
        parts.push(value.to_string());
    }

    // Date is empty because x-ms-date is always sent
    parts.push(String::new());

    for header in [
        "if-modified-since",
        "if-match",
        "if-none-match",
        "if-unmodified-since",
        "range",
    ] {
        parts.push(header_str(headers, header).to_string());
    }

    format!(
        "{}\n{}{}",
        parts.join("\n"),
        build_canonicalized_headers(headers),
        build_canonicalized_resource(request, account)
    )
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// x-ms-* headers, sorted, one `name:value\n` line each.
fn build_canonicalized_headers(headers: &HeaderMap) -> String {
    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("");
            (
                name.as_str().to_lowercase(),
                value.split_whitespace().collect::<Vec<_>>().join(" "),
            )
        })
        .collect();
    ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut result = String::new();
    for (name, value) in ms_headers {
        result.push_str(&name);
        result.push(':');
        result.push_str(&value);
        result.push('\n');
    }
    result
}

/// `/{account}{path}` followed by sorted, decoded query parameters.
fn build_canonicalized_resource(request: &Request, account: &str) -> String {
    let url = request.url();
    let mut resource = format!("/{}{}", account, url.path());

    let mut params: Vec<(String, &str)> = url
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_lowercase(), value)
        })
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in params {
        resource.push('\n');
        resource.push_str(&key);
        resource.push(':');
        // URL-decode the value
        resource.push_str(&percent_encoding::percent_decode_str(value).decode_utf8_lossy());
    }
    resource
}

/// Computes HMAC-SHA256 signature.
fn compute_signature(string_to_sign: &str, account_key: &str) -> SyncResult<String> {
    let key_bytes = BASE64.decode(account_key).map_err(|_| {
        SyncError::with_message(ErrorCode::InvalidInput, "Invalid account key encoding")
    })?;

    let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|_| {
        SyncError::with_message(ErrorCode::InvalidInput, "Failed to create HMAC")
    })?;

    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}
