//! In-process stand-ins for the Blob REST API and the S3 API, served over
//! loopback HTTP with axum so the real clients run unmodified against them.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub const BLOB_ACCOUNT: &str = "devstoreaccount1";
pub const BLOB_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
pub const BLOB_CONTAINER: &str = "backups";
pub const S3_BUCKET: &str = "backup-bucket";

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Parse the request target into its raw path and decoded query pairs
fn split_uri(uri: &Uri) -> (String, BTreeMap<String, Vec<String>>) {
    let url = Url::parse(&format!("http://fake{}", uri)).unwrap();
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        query.entry(name.into_owned()).or_default().push(value.into_owned());
    }
    (url.path().to_string(), query)
}

fn first<'a>(query: &'a BTreeMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    query.get(name).and_then(|values| values.first()).map(String::as_str)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

pub fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap()
}

fn xml_values<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        values.push(&after[..end]);
        rest = &after[end + close.len()..];
    }
    values
}

// ---------------------------------------------------------------------------
// Blob service

#[derive(Default)]
struct BlobState {
    containers: Vec<String>,
    blobs: HashMap<String, Vec<u8>>,
    staged: HashMap<(String, String), Vec<u8>>,
    ops: Vec<String>,
}

/// Blob service for one account, checking every Shared Key signature.
#[derive(Clone, Default)]
pub struct FakeBlob {
    state: Arc<Mutex<BlobState>>,
}

impl FakeBlob {
    /// Start serving; returns the connection string pointing at it
    pub async fn start(&self) -> String {
        let app = Router::new()
            .fallback(blob_handler)
            .layer(DefaultBodyLimit::disable())
            .with_state(self.clone());
        let addr = serve(app).await;
        format!(
            "DefaultEndpointsProtocol=http;AccountName={};AccountKey={};BlobEndpoint=http://{}/{}",
            BLOB_ACCOUNT, BLOB_ACCOUNT_KEY, addr, BLOB_ACCOUNT
        )
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blobs.get(key).cloned()
    }

    pub fn put_blob(&self, key: &str, content: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().blobs.insert(key.to_string(), content.into());
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.iter().any(|c| c == name)
    }

    /// Operation names in arrival order, e.g. `PutBlock`
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| o.as_str() == op).count()
    }

    pub fn staged_blocks(&self) -> usize {
        self.state.lock().unwrap().staged.len()
    }
}

fn expected_signature(method: &Method, path: &str, query: &BTreeMap<String, Vec<String>>, headers: &HeaderMap) -> String {
    let length = match header(headers, "content-length") {
        "0" => "",
        other => other,
    };

    let mut lines = vec![
        method.as_str(),
        header(headers, "content-encoding"),
        header(headers, "content-language"),
        length,
        header(headers, "content-md5"),
        header(headers, "content-type"),
        header(headers, "date"),
        header(headers, "if-modified-since"),
        header(headers, "if-match"),
        header(headers, "if-none-match"),
        header(headers, "if-unmodified-since"),
        header(headers, "range"),
    ]
    .join("\n");
    lines.push('\n');

    let mut ms: Vec<(&str, &str)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("").trim()))
        .collect();
    ms.sort();
    for (name, value) in ms {
        lines.push_str(&format!("{}:{}\n", name, value));
    }

    lines.push_str(&format!("/{}{}", BLOB_ACCOUNT, path));
    for (name, values) in query {
        let mut values = values.clone();
        values.sort();
        lines.push_str(&format!("\n{}:{}", name.to_ascii_lowercase(), values.join(",")));
    }

    let key = STANDARD.decode(BLOB_ACCOUNT_KEY).unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
    mac.update(lines.as_bytes());
    format!("SharedKey {}:{}", BLOB_ACCOUNT, STANDARD.encode(mac.finalize().into_bytes()))
}

async fn blob_handler(
    State(fake): State<FakeBlob>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (path, query) = split_uri(&uri);

    if header(&headers, "authorization") != expected_signature(&method, &path, &query, &headers) {
        return (StatusCode::FORBIDDEN, "AuthenticationFailed").into_response();
    }

    // /{account}/{container}[/{blob}]
    let rest = path.trim_start_matches('/').splitn(3, '/').collect::<Vec<_>>();
    let container = rest.get(1).copied().unwrap_or("").to_string();
    let key = rest.get(2).map(|k| percent_decode(k)).unwrap_or_default();

    let mut state = fake.state.lock().unwrap();

    if first(&query, "restype") == Some("container") && method == Method::PUT {
        state.ops.push("CreateContainer".to_string());
        if state.containers.contains(&container) {
            return StatusCode::CONFLICT.into_response();
        }
        state.containers.push(container);
        return StatusCode::CREATED.into_response();
    }

    if !state.containers.contains(&container) {
        return (StatusCode::NOT_FOUND, "ContainerNotFound").into_response();
    }

    match (method.as_str(), first(&query, "comp")) {
        ("PUT", Some("block")) => {
            let Some(id) = first(&query, "blockid") else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            state.ops.push("PutBlock".to_string());
            state.staged.insert((key, id.to_string()), body.to_vec());
            StatusCode::CREATED.into_response()
        }
        ("PUT", Some("blocklist")) => {
            state.ops.push("PutBlockList".to_string());
            let xml = String::from_utf8_lossy(&body).into_owned();
            let mut content = Vec::new();
            for id in xml_values(&xml, "Latest") {
                match state.staged.remove(&(key.clone(), id.to_string())) {
                    Some(block) => content.extend_from_slice(&block),
                    None => return (StatusCode::BAD_REQUEST, "InvalidBlockList").into_response(),
                }
            }
            state.staged.retain(|(blob, _), _| blob != &key);
            state.blobs.insert(key, content);
            StatusCode::CREATED.into_response()
        }
        ("PUT", None) => {
            if header(&headers, "x-ms-blob-type") != "BlockBlob" {
                return (StatusCode::BAD_REQUEST, "MissingRequiredHeader").into_response();
            }
            state.ops.push("PutBlob".to_string());
            state.staged.retain(|(blob, _), _| blob != &key);
            state.blobs.insert(key, body.to_vec());
            StatusCode::CREATED.into_response()
        }
        ("GET", None) => {
            state.ops.push("GetBlob".to_string());
            match state.blobs.get(&key) {
                Some(content) => (StatusCode::OK, content.clone()).into_response(),
                None => (StatusCode::NOT_FOUND, "BlobNotFound").into_response(),
            }
        }
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

// ---------------------------------------------------------------------------
// S3

#[derive(Default)]
struct S3State {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, BTreeMap<i32, Vec<u8>>>,
    next_upload: usize,
    aborted: Vec<String>,
    fail_part: Option<i32>,
    ops: Vec<String>,
}

/// Path-style S3 endpoint holding one bucket
#[derive(Clone, Default)]
pub struct FakeS3 {
    state: Arc<Mutex<S3State>>,
}

impl FakeS3 {
    /// Start serving; returns the endpoint URL
    pub async fn start(&self) -> String {
        let app = Router::new()
            .fallback(s3_handler)
            .layer(DefaultBodyLimit::disable())
            .with_state(self.clone());
        format!("http://{}", serve(app).await)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn put_object(&self, key: &str, content: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().objects.insert(key.to_string(), content.into());
    }

    /// Reject the given part number of any multipart upload
    pub fn fail_part(&self, part_number: i32) {
        self.state.lock().unwrap().fail_part = Some(part_number);
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| o.as_str() == op).count()
    }
}

/// Strip `aws-chunked` framing (`{hex len}[;ext]\r\n{data}\r\n ... 0\r\n{trailers}`)
fn decode_aws_chunked(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(offset) = body[pos..].windows(2).position(|w| w == b"\r\n") {
        let line = std::str::from_utf8(&body[pos..pos + offset]).unwrap();
        let size = usize::from_str_radix(line.split(';').next().unwrap().trim(), 16).unwrap();
        pos += offset + 2;
        if size == 0 {
            break;
        }
        out.extend_from_slice(&body[pos..pos + size]);
        pos += size + 2;
    }
    out
}

fn object_body(headers: &HeaderMap, body: &Bytes) -> Vec<u8> {
    if header(headers, "content-encoding").contains("aws-chunked") || headers.contains_key("x-amz-decoded-content-length") {
        decode_aws_chunked(body)
    } else {
        body.to_vec()
    }
}

fn s3_xml(status: StatusCode, xml: String) -> Response {
    (status, [("content-type", "application/xml")], xml).into_response()
}

fn s3_error(status: StatusCode, code: &str) -> Response {
    s3_xml(
        status,
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>{}</Code><Message>{}</Message><RequestId>fake</RequestId></Error>"#,
            code, code
        ),
    )
}

fn etag(n: usize) -> [(&'static str, String); 1] {
    [("etag", format!("\"etag-{}\"", n))]
}

async fn s3_handler(
    State(fake): State<FakeS3>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (path, query) = split_uri(&uri);

    // /{bucket}/{key}
    let Some((bucket, raw_key)) = path.trim_start_matches('/').split_once('/') else {
        return s3_error(StatusCode::BAD_REQUEST, "InvalidRequest");
    };
    if bucket != S3_BUCKET {
        return s3_error(StatusCode::NOT_FOUND, "NoSuchBucket");
    }
    let key = percent_decode(raw_key);

    let mut state = fake.state.lock().unwrap();

    match method.as_str() {
        "HEAD" => {
            state.ops.push("HeadObject".to_string());
            if state.objects.contains_key(&key) {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        "PUT" if headers.contains_key("x-amz-copy-source") => {
            state.ops.push("CopyObject".to_string());
            let source = percent_decode(header(&headers, "x-amz-copy-source"));
            let source_key = source
                .trim_start_matches('/')
                .strip_prefix(&format!("{}/", S3_BUCKET))
                .unwrap_or("")
                .to_string();
            let Some(content) = state.objects.get(&source_key).cloned() else {
                return s3_error(StatusCode::NOT_FOUND, "NoSuchKey");
            };
            state.objects.insert(key, content);
            s3_xml(
                StatusCode::OK,
                r#"<?xml version="1.0" encoding="UTF-8"?><CopyObjectResult><ETag>"etag-copy"</ETag><LastModified>2026-10-19T00:00:00.000Z</LastModified></CopyObjectResult>"#
                    .to_string(),
            )
        }
        "PUT" if query.contains_key("partNumber") => {
            state.ops.push("UploadPart".to_string());
            let part_number: i32 = first(&query, "partNumber").unwrap_or("0").parse().unwrap_or(0);
            let upload_id = first(&query, "uploadId").unwrap_or("").to_string();
            if state.fail_part == Some(part_number) {
                return s3_error(StatusCode::BAD_REQUEST, "InvalidRequest");
            }
            let content = object_body(&headers, &body);
            let Some(parts) = state.uploads.get_mut(&upload_id) else {
                return s3_error(StatusCode::NOT_FOUND, "NoSuchUpload");
            };
            parts.insert(part_number, content);
            (StatusCode::OK, etag(part_number as usize)).into_response()
        }
        "PUT" => {
            state.ops.push("PutObject".to_string());
            let content = object_body(&headers, &body);
            state.objects.insert(key, content);
            (StatusCode::OK, etag(0)).into_response()
        }
        "POST" if query.contains_key("uploads") => {
            state.ops.push("CreateMultipartUpload".to_string());
            state.next_upload += 1;
            let upload_id = format!("upload-{}", state.next_upload);
            state.uploads.insert(upload_id.clone(), BTreeMap::new());
            s3_xml(
                StatusCode::OK,
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8"?><InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>"#,
                    S3_BUCKET, key, upload_id
                ),
            )
        }
        "POST" if query.contains_key("uploadId") => {
            state.ops.push("CompleteMultipartUpload".to_string());
            let upload_id = first(&query, "uploadId").unwrap_or("").to_string();
            let Some(parts) = state.uploads.remove(&upload_id) else {
                return s3_error(StatusCode::NOT_FOUND, "NoSuchUpload");
            };
            let listed = String::from_utf8_lossy(&body).into_owned();
            if xml_values(&listed, "PartNumber").len() != parts.len() {
                return s3_error(StatusCode::BAD_REQUEST, "InvalidPart");
            }
            let content: Vec<u8> = parts.into_values().flatten().collect();
            state.objects.insert(key.clone(), content);
            s3_xml(
                StatusCode::OK,
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8"?><CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><ETag>"etag-complete"</ETag></CompleteMultipartUploadResult>"#,
                    S3_BUCKET, key
                ),
            )
        }
        "DELETE" if query.contains_key("uploadId") => {
            state.ops.push("AbortMultipartUpload".to_string());
            let upload_id = first(&query, "uploadId").unwrap_or("").to_string();
            state.uploads.remove(&upload_id);
            state.aborted.push(upload_id);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => s3_error(StatusCode::NOT_IMPLEMENTED, "NotImplemented"),
    }
}
