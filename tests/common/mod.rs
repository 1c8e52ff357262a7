//! Common test utilities.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Response, StatusCode, Uri},
    routing::get,
    Router,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use vhdsync_rs::IndexRange;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
pub const SECTOR: u64 = 512;

pub const ACCOUNT: &str = "devstoreaccount1";
pub const ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Deterministic non-zero bytes seeded by `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64) % 255) as u8 + 1)
        .collect()
}

// ---------------------------------------------------------------------------
// VHD fixtures
// ---------------------------------------------------------------------------

fn checksum(raw: &[u8], field: usize) -> u32 {
    let sum = raw
        .iter()
        .enumerate()
        .filter(|(i, _)| !(field..field + 4).contains(i))
        .fold(0u32, |acc, (_, &b)| acc.wrapping_add(b as u32));
    !sum
}

/// Builds a footer record. `id` fills all 16 bytes of the unique id.
pub fn footer(disk_type: u32, size: u64, data_offset: u64, id: u8) -> [u8; 512] {
    let mut raw = [0u8; 512];
    raw[0..8].copy_from_slice(b"conectix");
    raw[8..12].copy_from_slice(&2u32.to_be_bytes());
    raw[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    raw[16..24].copy_from_slice(&data_offset.to_be_bytes());
    raw[24..28].copy_from_slice(&86_400u32.to_be_bytes());
    raw[28..32].copy_from_slice(b"test");
    raw[32..36].copy_from_slice(&0x000A_0000u32.to_be_bytes());
    raw[36..40].copy_from_slice(b"Wi2k");
    raw[40..48].copy_from_slice(&size.to_be_bytes());
    raw[48..56].copy_from_slice(&size.to_be_bytes());
    raw[56..58].copy_from_slice(&((size / SECTOR / 63 / 16).min(65535) as u16).to_be_bytes());
    raw[58] = 16;
    raw[59] = 63;
    raw[60..64].copy_from_slice(&disk_type.to_be_bytes());
    raw[68..84].copy_from_slice(&[id; 16]);
    let sum = checksum(&raw, 64);
    raw[64..68].copy_from_slice(&sum.to_be_bytes());
    raw
}

/// Writes a fixed image: `data` followed by its footer.
pub fn write_fixed(path: &Path, data: &[u8], id: u8) {
    let mut out = data.to_vec();
    out.extend_from_slice(&footer(2, data.len() as u64, u64::MAX, id));
    std::fs::write(path, out).unwrap();
}

struct Block {
    bitmap: Vec<u8>,
    data: Vec<u8>,
}

struct ParentRef {
    id: u8,
    name: String,
    absolute: Option<String>,
    relative: Option<String>,
}

/// Builder for dynamic and differencing images.
pub struct SparseImage {
    size: u64,
    block_size: u32,
    id: u8,
    blocks: BTreeMap<usize, Block>,
    parent: Option<ParentRef>,
    corrupt_footer: bool,
}

impl SparseImage {
    pub fn dynamic(size: u64, block_size: u32, id: u8) -> Self {
        Self {
            size,
            block_size,
            id,
            blocks: BTreeMap::new(),
            parent: None,
            corrupt_footer: false,
        }
    }

    /// A differencing image whose locators point at `parent`.
    pub fn differencing(size: u64, block_size: u32, id: u8, parent: &Path, parent_id: u8) -> Self {
        let name = parent
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            parent: Some(ParentRef {
                id: parent_id,
                absolute: Some(parent.display().to_string()),
                relative: Some(format!(".\\{name}")),
                name,
            }),
            ..Self::dynamic(size, block_size, id)
        }
    }

    pub fn without_absolute_locator(mut self) -> Self {
        if let Some(parent) = &mut self.parent {
            parent.absolute = None;
        }
        self
    }

    pub fn with_parent_id(mut self, id: u8) -> Self {
        if let Some(parent) = &mut self.parent {
            parent.id = id;
        }
        self
    }

    pub fn with_corrupt_footer_checksum(mut self) -> Self {
        self.corrupt_footer = true;
        self
    }

    fn bitmap_size(&self) -> usize {
        let sectors = self.block_size as u64 / SECTOR;
        (sectors.div_ceil(8).div_ceil(SECTOR) * SECTOR) as usize
    }

    /// Writes sector-aligned `bytes` at `offset`, marking the touched sectors.
    pub fn write_at(mut self, offset: u64, bytes: &[u8]) -> Self {
        assert_eq!(offset % SECTOR, 0);
        assert_eq!(bytes.len() as u64 % SECTOR, 0);
        let block_size = self.block_size as u64;
        let bitmap_size = self.bitmap_size();

        let mut done = 0u64;
        while done < bytes.len() as u64 {
            let position = offset + done;
            let index = (position / block_size) as usize;
            let within = position % block_size;
            let chunk = (block_size - within).min(bytes.len() as u64 - done);

            let block = self.blocks.entry(index).or_insert_with(|| Block {
                bitmap: vec![0u8; bitmap_size],
                data: vec![0u8; block_size as usize],
            });
            block.data[within as usize..(within + chunk) as usize]
                .copy_from_slice(&bytes[done as usize..(done + chunk) as usize]);
            for sector in within / SECTOR..(within + chunk) / SECTOR {
                block.bitmap[(sector / 8) as usize] |= 0x80 >> (sector % 8);
            }
            done += chunk;
        }
        self
    }

    pub fn write(&self, path: &Path) {
        let entries = self.size.div_ceil(self.block_size as u64) as u32;
        let table_offset = 1536u64;
        let table_size = (entries as u64 * 4).div_ceil(SECTOR) * SECTOR;
        let mut cursor = table_offset + table_size;

        let mut locators: Vec<(&'static [u8; 4], Vec<u8>, u64)> = Vec::new();
        if let Some(parent) = &self.parent {
            let mut add = |code: &'static [u8; 4], text: &str| {
                let data: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                let offset = cursor;
                cursor += (data.len() as u64).div_ceil(SECTOR).max(1) * SECTOR;
                locators.push((code, data, offset));
            };
            if let Some(relative) = &parent.relative {
                add(b"W2ru", relative);
            }
            if let Some(absolute) = &parent.absolute {
                add(b"W2ku", absolute);
            }
        }

        let mut header = [0u8; 1024];
        header[0..8].copy_from_slice(b"cxsparse");
        header[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        header[16..24].copy_from_slice(&table_offset.to_be_bytes());
        header[24..28].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        header[28..32].copy_from_slice(&entries.to_be_bytes());
        header[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        if let Some(parent) = &self.parent {
            header[40..56].copy_from_slice(&[parent.id; 16]);
            for (i, unit) in parent.name.encode_utf16().enumerate() {
                header[64 + i * 2..66 + i * 2].copy_from_slice(&unit.to_be_bytes());
            }
        }
        for (i, (code, data, offset)) in locators.iter().enumerate() {
            let base = 576 + i * 24;
            header[base..base + 4].copy_from_slice(*code);
            header[base + 4..base + 8].copy_from_slice(&1u32.to_be_bytes());
            header[base + 8..base + 12].copy_from_slice(&(data.len() as u32).to_be_bytes());
            header[base + 16..base + 24].copy_from_slice(&offset.to_be_bytes());
        }
        let sum = checksum(&header, 36);
        header[36..40].copy_from_slice(&sum.to_be_bytes());

        let disk_type = if self.parent.is_some() { 4 } else { 3 };
        let mut foot = footer(disk_type, self.size, 512, self.id);
        if self.corrupt_footer {
            foot[64] ^= 0xFF;
        }

        let mut out = vec![0u8; cursor as usize];
        out[0..512].copy_from_slice(&foot);
        out[512..1536].copy_from_slice(&header);
        for (_, data, offset) in &locators {
            out[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        }

        let mut bat = vec![u32::MAX; entries as usize];
        for (index, block) in &self.blocks {
            bat[*index] = (out.len() as u64 / SECTOR) as u32;
            out.extend_from_slice(&block.bitmap);
            out.extend_from_slice(&block.data);
        }
        for (i, entry) in bat.iter().enumerate() {
            let at = table_offset as usize + i * 4;
            out[at..at + 4].copy_from_slice(&entry.to_be_bytes());
        }

        out.extend_from_slice(&foot);
        std::fs::write(path, out).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Mock page blob service
// ---------------------------------------------------------------------------

/// How the mock service authorizes requests.
#[derive(Clone, Debug)]
pub enum MockAuth {
    SharedKey,
    Sas(String),
}

#[derive(Clone)]
struct MockState {
    data: Arc<Vec<u8>>,
    ranges: Arc<Vec<IndexRange>>,
    page_blob: bool,
    list_batch: usize,
    fail_starts: Arc<Vec<u64>>,
    auth: MockAuth,
    range_requests: Arc<AtomicUsize>,
    list_requests: Arc<AtomicUsize>,
}

/// Builder for [`MockBlobServer`].
pub struct MockBlobBuilder {
    state: MockState,
}

impl MockBlobBuilder {
    /// Page ranges reported by Get Page Ranges.
    pub fn ranges(mut self, ranges: Vec<IndexRange>) -> Self {
        self.state.ranges = Arc::new(ranges);
        self
    }

    /// Serves the data as a block blob.
    pub fn block_blob(mut self) -> Self {
        self.state.page_blob = false;
        self
    }

    /// Page ranges per Get Page Ranges response; a marker covers the rest.
    pub fn list_batch(mut self, batch: usize) -> Self {
        self.state.list_batch = batch.max(1);
        self
    }

    /// Fails range reads that start at any of `starts` with a 500.
    pub fn fail_ranges_at(mut self, starts: Vec<u64>) -> Self {
        self.state.fail_starts = Arc::new(starts);
        self
    }

    pub fn auth(mut self, auth: MockAuth) -> Self {
        self.state.auth = auth;
        self
    }

    pub async fn start(self) -> MockBlobServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = self.state;

        let app = Router::new()
            .route("/:account/:container/*blob", get(handle).head(handle))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockBlobServer {
            base_url: format!("http://127.0.0.1:{}", port),
            range_requests: state.range_requests,
            list_requests: state.list_requests,
        }
    }
}

/// Mock page blob endpoint serving one blob at any container/blob path.
pub struct MockBlobServer {
    pub base_url: String,
    range_requests: Arc<AtomicUsize>,
    list_requests: Arc<AtomicUsize>,
}

impl MockBlobServer {
    pub fn builder(data: Vec<u8>) -> MockBlobBuilder {
        let length = data.len() as u64;
        MockBlobBuilder {
            state: MockState {
                data: Arc::new(data),
                ranges: Arc::new(if length == 0 {
                    Vec::new()
                } else {
                    vec![IndexRange::new(0, length)]
                }),
                page_blob: true,
                list_batch: usize::MAX,
                fail_starts: Arc::new(Vec::new()),
                auth: MockAuth::SharedKey,
                range_requests: Arc::new(AtomicUsize::new(0)),
                list_requests: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Returns the URL for a blob.
    pub fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, ACCOUNT, container, blob)
    }

    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn list_requests(&self) -> usize {
        self.list_requests.load(Ordering::SeqCst)
    }
}

fn error_response(status: StatusCode, code: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("x-ms-error-code", code)
        .body(Body::empty())
        .unwrap()
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response<Body> {
    let query: Vec<(String, String)> = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let param = |name: &str| query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

    let authorized = match &state.auth {
        MockAuth::SharedKey => verify_shared_key(&method, &uri, &headers, &query),
        MockAuth::Sas(sig) => param("sig").as_deref() == Some(sig.as_str()),
    };
    if !authorized || !headers.contains_key("x-ms-version") {
        return error_response(StatusCode::FORBIDDEN, "AuthenticationFailed");
    }

    let blob_type = if state.page_blob { "PageBlob" } else { "BlockBlob" };
    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header("x-ms-blob-content-length", state.data.len().to_string())
            .header("x-ms-blob-type", blob_type)
            .body(Body::empty())
            .unwrap();
    }

    if param("comp").as_deref() == Some("pagelist") {
        if !state.page_blob {
            return error_response(StatusCode::BAD_REQUEST, "InvalidBlobType");
        }
        state.list_requests.fetch_add(1, Ordering::SeqCst);
        let skip: usize = param("marker").and_then(|m| m.parse().ok()).unwrap_or(0);
        let end = skip.saturating_add(state.list_batch).min(state.ranges.len());

        let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><PageList>"#);
        for range in &state.ranges[skip..end] {
            xml.push_str(&format!(
                "<PageRange><Start>{}</Start><End>{}</End></PageRange>",
                range.start_index,
                range.last_index()
            ));
        }
        if end < state.ranges.len() {
            xml.push_str(&format!("<NextMarker>{end}</NextMarker>"));
        }
        xml.push_str("</PageList>");
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/xml")
            .body(Body::from(xml))
            .unwrap();
    }

    state.range_requests.fetch_add(1, Ordering::SeqCst);
    let Some((start, end)) = headers
        .get("x-ms-range")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<u64>().ok()?, e.parse::<u64>().ok()?)))
    else {
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(state.data.as_ref().clone()))
            .unwrap();
    };

    if state.fail_starts.contains(&start) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
    }
    if end < start || end >= state.data.len() as u64 {
        return error_response(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange");
    }
    let body = state.data[start as usize..=end as usize].to_vec();
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header("x-ms-blob-type", blob_type)
        .body(Body::from(body))
        .unwrap()
}

/// Recomputes the SharedKey signature of a request.
fn verify_shared_key(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> bool {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(signature) = auth.strip_prefix(&format!("SharedKey {ACCOUNT}:")) else {
        return false;
    };

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let content_length = match header("content-length").as_str() {
        "0" => String::new(),
        other => other.to_string(),
    };

    // Build canonicalized headers
    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(k, _)| k.as_str().starts_with("x-ms-"))
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    ms_headers.sort();
    let canonicalized_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    // Build canonicalized resource
    let mut params: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    params.sort();
    let mut canonicalized_resource = format!("/{}{}", ACCOUNT, uri.path());
    for (k, v) in params {
        canonicalized_resource.push_str(&format!("\n{}:{}", k, v));
    }

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n\n{}\n{}\n{}\n{}\n{}\n{}{}",
        method.as_str(),
        header("content-encoding"),
        header("content-language"),
        content_length,
        header("content-md5"),
        header("content-type"),
        header("if-modified-since"),
        header("if-match"),
        header("if-none-match"),
        header("if-unmodified-since"),
        header("range"),
        canonicalized_headers,
        canonicalized_resource
    );

    let key_bytes = BASE64.decode(ACCOUNT_KEY).unwrap();
    let mut mac = HmacSha256::new_from_slice(&key_bytes).unwrap();
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes()) == signature
}
