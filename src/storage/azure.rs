//! Azure Blob Storage adapter.
//!
//! Talks to the Azure Blob REST API with `reqwest`.  Each call parses its own
//! connection string, so one adapter serves any number of storage accounts.
//!
//! Upload strategy:
//!   buffer  -> Put Blob (single request, `Content-MD5` attached)
//!   stream  -> Put Block per `block_size` chunk, then Put Block List; a
//!              stream that ends inside its first block goes out as Put Blob
//!
//! Block IDs: `base64("{upload uuid}-{index:06}")`, so every ID of one
//! upload has the same length, as Azure requires.
//!
//! Presigned URLs are service SAS tokens (`sp=w`, `sr=b`) signed with the
//! account key.

use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

use super::adapter::{
    content_type_or_default, encode_component, encode_path, require_target, AdapterFuture,
    CloudAdapter, Operation,
};
use crate::types::{
    AzureCredentials, ByteStream, CloudProvider, PresignOptions, PresignedUrl, ResolvedOptions,
    UploadData, UploadOptions, UploadResult,
};

/// Azure REST API version used for all requests and SAS tokens.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Block size for staged stream uploads (4 MiB).
const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Azurite well-known development account.
const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

type HmacSha256 = Hmac<Sha256>;

// -- Connection strings ---------------------------------------------------------

/// A storage account as described by a connection string.
#[derive(Clone)]
pub struct StorageAccount {
    pub name: String,
    /// Decoded account key (Shared Key auth and SAS signing).
    key: Option<Vec<u8>>,
    /// Blob service endpoint without trailing slash.
    pub blob_endpoint: String,
    /// SAS token without leading `?` (SAS auth).
    sas_token: Option<String>,
}

impl std::fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("blob_endpoint", &self.blob_endpoint)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StorageAccount {
    /// Parse an Azure Storage connection string.
    ///
    /// Understands `AccountName`, `AccountKey`, `DefaultEndpointsProtocol`,
    /// `EndpointSuffix`, `BlobEndpoint`, `SharedAccessSignature` and
    /// `UseDevelopmentStorage=true`.
    pub fn from_connection_string(conn_str: &str) -> anyhow::Result<Self> {
        let mut name = None;
        let mut key = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;
        let mut sas_token = None;

        for part in conn_str.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((k, v)) = part.split_once('=') else {
                return Err(anyhow::anyhow!(
                    "Malformed Azure connection string segment: {part}"
                ));
            };
            match k.to_ascii_lowercase().as_str() {
                "usedevelopmentstorage" if v.eq_ignore_ascii_case("true") => {
                    return Self::development_storage();
                }
                "accountname" => name = Some(v.to_string()),
                "accountkey" => {
                    let bytes = BASE64_STANDARD.decode(v).map_err(|e| {
                        anyhow::anyhow!("Invalid AccountKey in connection string: {e}")
                    })?;
                    key = Some(bytes);
                }
                "defaultendpointsprotocol" => protocol = v.to_string(),
                "endpointsuffix" => suffix = v.to_string(),
                "blobendpoint" => blob_endpoint = Some(v.trim_end_matches('/').to_string()),
                "sharedaccesssignature" => {
                    sas_token = Some(v.trim_start_matches('?').to_string())
                }
                _ => {}
            }
        }

        let blob_endpoint = match (blob_endpoint, name.as_deref()) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("{protocol}://{account}.blob.{suffix}"),
            (None, None) => {
                return Err(anyhow::anyhow!(
                    "Azure connection string needs AccountName or BlobEndpoint"
                ))
            }
        };
        let url = reqwest::Url::parse(&blob_endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid Azure blob endpoint {blob_endpoint}: {e}"))?;

        if key.is_none() && sas_token.is_none() {
            return Err(anyhow::anyhow!(
                "Azure connection string has neither AccountKey nor SharedAccessSignature"
            ));
        }

        let name = match name {
            Some(name) => name,
            None if key.is_some() => {
                return Err(anyhow::anyhow!(
                    "Azure connection string has AccountKey but no AccountName"
                ))
            }
            // SAS-only: the account name is only used for logging.
            None => url
                .host_str()
                .and_then(|h| h.split('.').next())
                .unwrap_or_default()
                .to_string(),
        };

        Ok(Self {
            name,
            key,
            blob_endpoint,
            sas_token,
        })
    }

    fn development_storage() -> anyhow::Result<Self> {
        Ok(Self {
            name: DEV_ACCOUNT_NAME.to_string(),
            key: Some(
                BASE64_STANDARD
                    .decode(DEV_ACCOUNT_KEY)
                    .map_err(|e| anyhow::anyhow!("Invalid development account key: {e}"))?,
            ),
            blob_endpoint: DEV_BLOB_ENDPOINT.to_string(),
            sas_token: None,
        })
    }

    fn container_url(&self, container: &str) -> String {
        format!("{}/{}", self.blob_endpoint, encode_component(container))
    }

    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{}/{}", self.container_url(container), encode_path(blob))
    }
}

// -- Signing --------------------------------------------------------------------

/// HMAC-SHA256 a string with the account key, base64-encoded.
fn sign(key: &[u8], string_to_sign: &str) -> anyhow::Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Shared Key string-to-sign.
///
/// ```text
/// VERB\n
/// Content-Encoding\n
/// Content-Language\n
/// Content-Length\n
/// Content-MD5\n
/// Content-Type\n
/// Date\n
/// If-Modified-Since\n
/// If-Match\n
/// If-None-Match\n
/// If-Unmodified-Since\n
/// Range\n
/// CanonicalizedHeaders\n
/// CanonicalizedResource
/// ```
///
/// `ms_headers` must be lowercase and sorted; `query` is sorted here.
fn shared_key_string_to_sign(
    method: &str,
    content_length: usize,
    content_md5: &str,
    content_type: &str,
    ms_headers: &[(String, String)],
    resource_path: &str,
    query: &[(&str, String)],
) -> String {
    // Content-Length is empty for zero-length bodies.
    let content_length = match content_length {
        0 => String::new(),
        len => len.to_string(),
    };

    let canonicalized_headers = ms_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut canonicalized_resource = resource_path.to_string();
    let mut sorted = query.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in &sorted {
        canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
    }

    format!(
        "{method}\n\n\n{content_length}\n{content_md5}\n{content_type}\n\n\n\n\n\n\n{canonicalized_headers}\n{canonicalized_resource}"
    )
}

/// Fields of a write-only service SAS for one blob.
struct BlobSas<'a> {
    account: &'a str,
    container: &'a str,
    blob: &'a str,
    start: String,
    expiry: String,
    content_type: Option<&'a str>,
}

impl BlobSas<'_> {
    const PERMISSIONS: &'static str = "w";
    const RESOURCE: &'static str = "b";

    /// Service SAS string-to-sign for API versions 2020-12-06 and later.
    fn string_to_sign(&self) -> String {
        let canonicalized_resource =
            format!("/blob/{}/{}/{}", self.account, self.container, self.blob);
        [
            Self::PERMISSIONS,
            &self.start,
            &self.expiry,
            &canonicalized_resource,
            "", // signed identifier
            "", // signed IP
            "", // signed protocol
            AZURE_API_VERSION,
            Self::RESOURCE,
            "", // snapshot time
            "", // encryption scope
            "", // rscc
            "", // rscd
            "", // rsce
            "", // rscl
            self.content_type.unwrap_or_default(),
        ]
        .join("\n")
    }

    fn query(&self, signature: &str) -> String {
        let mut params = vec![
            ("sv", AZURE_API_VERSION),
            ("st", self.start.as_str()),
            ("se", self.expiry.as_str()),
            ("sr", Self::RESOURCE),
            ("sp", Self::PERMISSIONS),
        ];
        if let Some(ct) = self.content_type {
            params.push(("rsct", ct));
        }
        params.push(("sig", signature));
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Build a SAS URL allowing writes to `container/blob` until
/// `now + expires_in`.
pub fn blob_sas_url(
    account: &StorageAccount,
    container: &str,
    blob: &str,
    content_type: Option<&str>,
    expires_in: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let key = account.key.as_deref().ok_or_else(|| {
        anyhow::anyhow!("Azure presigned URLs need an AccountKey in the connection string")
    })?;

    let expiry = i64::try_from(expires_in)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| anyhow::anyhow!("Azure SAS expiry out of range: {expires_in}"))?;

    let sas = BlobSas {
        account: &account.name,
        container,
        blob,
        start: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        expiry: expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        content_type,
    };
    let signature = sign(key, &sas.string_to_sign())?;

    Ok(format!(
        "{}?{}",
        account.blob_url(container, blob),
        sas.query(&signature)
    ))
}

// -- XML bodies -----------------------------------------------------------------

/// Put Block List request body.
#[derive(Debug, Serialize)]
#[serde(rename = "BlockList")]
struct BlockList<'a> {
    #[serde(rename = "Latest")]
    latest: &'a [String],
}

fn block_list_xml(block_ids: &[String]) -> anyhow::Result<String> {
    let body = quick_xml::se::to_string(&BlockList { latest: block_ids })
        .map_err(|e| anyhow::anyhow!("Failed to serialize block list: {e}"))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>{body}"))
}

/// `<Error><Code>..</Code><Message>..</Message></Error>`
#[derive(Debug, Default, Deserialize)]
struct AzureErrorBody {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

fn parse_error_body(body: &str) -> AzureErrorBody {
    quick_xml::de::from_str(body.trim_start_matches('\u{feff}')).unwrap_or_default()
}

fn block_id(upload_id: &str, index: usize) -> String {
    BASE64_STANDARD.encode(format!("{upload_id}-{index:06}"))
}

fn content_md5(data: &[u8]) -> String {
    BASE64_STANDARD.encode(Md5::digest(data))
}

// -- Adapter --------------------------------------------------------------------

/// Where a blob call goes.
struct BlobLocation<'a> {
    account: &'a StorageAccount,
    container: &'a str,
    blob: &'a str,
}

/// One Blob REST request before auth is applied.
struct BlobRequest<'a> {
    method: Method,
    /// `None` addresses the container itself.
    blob: Option<&'a str>,
    query: Vec<(&'static str, String)>,
    ms_headers: Vec<(&'static str, String)>,
    content_type: Option<&'a str>,
    content_md5: Option<String>,
    body: Bytes,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, blob: Option<&'a str>) -> Self {
        Self {
            method,
            blob,
            query: Vec::new(),
            ms_headers: Vec::new(),
            content_type: None,
            content_md5: None,
            body: Bytes::new(),
        }
    }
}

/// Adapter that writes to Azure Blob Storage.
pub struct AzureAdapter {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// Chunk size for staged stream uploads.
    block_size: usize,
}

impl AzureAdapter {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!("Azure Blob adapter created");

        Ok(Self {
            client,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Map an Azure HTTP error to an anyhow error with context.
    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        let parsed = parse_error_body(body);
        match parsed.code {
            Some(code) => anyhow::anyhow!(
                "Azure {}: HTTP {} {} - {}",
                context,
                status,
                code,
                parsed.message.unwrap_or_default().trim()
            ),
            None => anyhow::anyhow!("Azure {context}: HTTP {status} - {body}"),
        }
    }

    /// Send a request to the container (or one of its blobs), authorized
    /// with Shared Key or the connection string's SAS token.
    async fn send(
        &self,
        account: &StorageAccount,
        container: &str,
        request: BlobRequest<'_>,
    ) -> anyhow::Result<reqwest::Response> {
        let base = match request.blob {
            Some(blob) => account.blob_url(container, blob),
            None => account.container_url(container),
        };
        let mut query = request
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(v)))
            .collect::<Vec<_>>();
        if let (None, Some(sas)) = (&account.key, &account.sas_token) {
            query.push(sas.clone());
        }
        let url_str = if query.is_empty() {
            base
        } else {
            format!("{}?{}", base, query.join("&"))
        };
        let url = reqwest::Url::parse(&url_str)
            .map_err(|e| anyhow::anyhow!("Invalid Azure URL {url_str}: {e}"))?;

        let date = Self::rfc1123_date();
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        ms_headers.extend(
            request
                .ms_headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone())),
        );
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut req = self.client.request(request.method.clone(), url.clone());
        for (k, v) in &ms_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(ct) = request.content_type {
            req = req.header("Content-Type", ct);
        }
        if let Some(ref md5) = request.content_md5 {
            req = req.header("Content-MD5", md5.as_str());
        }

        if let Some(ref key) = account.key {
            let resource_path = format!("/{}{}", account.name, url.path());
            let string_to_sign = shared_key_string_to_sign(
                request.method.as_str(),
                request.body.len(),
                request.content_md5.as_deref().unwrap_or_default(),
                request.content_type.unwrap_or_default(),
                &ms_headers,
                &resource_path,
                &request.query,
            );
            let signature = sign(key, &string_to_sign)?;
            req = req.header(
                "Authorization",
                format!("SharedKey {}:{}", account.name, signature),
            );
        }

        req.body(request.body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure request failed: {e}"))
    }

    async fn check(resp: reqwest::Response, context: &str) -> anyhow::Result<()> {
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::map_azure_error(context, status, &body))
    }

    /// Create the container unless it already exists.
    async fn ensure_container(&self, account: &StorageAccount, container: &str) -> anyhow::Result<()> {
        let mut request = BlobRequest::new(Method::PUT, None);
        request.query.push(("restype", "container".to_string()));

        let resp = self.send(account, container, request).await?;
        let status = resp.status();
        if status.is_success() {
            debug!("Azure created container: account={} container={}", account.name, container);
            return Ok(());
        }

        let header_code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        let code = header_code.or_else(|| parse_error_body(&body).code);

        if status == StatusCode::CONFLICT && code.as_deref() == Some("ContainerAlreadyExists") {
            return Ok(());
        }
        Err(Self::map_azure_error("create_container", status, &body))
    }

    /// Upload a blob in one request (Put Blob).
    async fn put_blob(
        &self,
        location: &BlobLocation<'_>,
        data: Bytes,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let mut request = BlobRequest::new(Method::PUT, Some(location.blob));
        request.ms_headers = vec![
            ("x-ms-blob-type", "BlockBlob".to_string()),
            ("x-ms-blob-content-type", content_type.to_string()),
        ];
        request.content_type = Some(content_type);
        request.content_md5 = Some(content_md5(&data));
        request.body = data;

        let resp = self.send(location.account, location.container, request).await?;
        Self::check(resp, "put_blob").await
    }

    /// Stage one block (Put Block).
    async fn put_block(
        &self,
        location: &BlobLocation<'_>,
        block_id: &str,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let mut request = BlobRequest::new(Method::PUT, Some(location.blob));
        request.query = vec![
            ("comp", "block".to_string()),
            ("blockid", block_id.to_string()),
        ];
        request.content_md5 = Some(content_md5(&data));
        request.body = data;

        let resp = self.send(location.account, location.container, request).await?;
        Self::check(resp, "put_block").await
    }

    /// Commit staged blocks (Put Block List).
    async fn put_block_list(
        &self,
        location: &BlobLocation<'_>,
        block_ids: &[String],
        content_type: &str,
    ) -> anyhow::Result<()> {
        let mut request = BlobRequest::new(Method::PUT, Some(location.blob));
        request.query = vec![("comp", "blocklist".to_string())];
        request.ms_headers = vec![("x-ms-blob-content-type", content_type.to_string())];
        request.content_type = Some("application/xml");
        request.body = Bytes::from(block_list_xml(block_ids)?);

        let resp = self.send(location.account, location.container, request).await?;
        Self::check(resp, "put_block_list").await
    }

    /// Stage a stream as fixed-size blocks and commit them.
    async fn upload_stream(
        &self,
        location: &BlobLocation<'_>,
        mut stream: ByteStream,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let mut buf = BytesMut::new();
        let mut block_ids = Vec::new();

        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read upload stream: {e}"))?
        {
            buf.extend_from_slice(&chunk);
            while buf.len() >= self.block_size {
                let block = buf.split_to(self.block_size).freeze();
                let id = block_id(&upload_id, block_ids.len());
                self.put_block(location, &id, block).await?;
                block_ids.push(id);
            }
        }

        if block_ids.is_empty() {
            return self.put_blob(location, buf.freeze(), content_type).await;
        }
        if !buf.is_empty() {
            let id = block_id(&upload_id, block_ids.len());
            self.put_block(location, &id, buf.freeze()).await?;
            block_ids.push(id);
        }

        debug!(
            "Azure put_block_list: container={} blob={} blocks={}",
            location.container,
            location.blob,
            block_ids.len()
        );
        self.put_block_list(location, &block_ids, content_type).await
    }

    async fn upload(
        &self,
        data: UploadData,
        options: ResolvedOptions<UploadOptions>,
    ) -> anyhow::Result<UploadResult> {
        let target = require_target::<AzureCredentials, _>(&options, Operation::Upload)?;
        let account = StorageAccount::from_connection_string(&target.credentials.connection_string)?;
        let key = options.key();
        let content_type = content_type_or_default(options.mime_type());

        self.ensure_container(&account, target.bucket).await?;

        let location = BlobLocation {
            account: &account,
            container: target.bucket,
            blob: key,
        };

        debug!(
            "Azure upload: account={} container={} blob={} content_type={}",
            account.name, target.bucket, key, content_type
        );

        match data {
            UploadData::Bytes(bytes) => self.put_blob(&location, bytes, content_type).await?,
            UploadData::Stream(stream) => {
                self.upload_stream(&location, stream, content_type).await?
            }
        }

        Ok(UploadResult {
            url: account.blob_url(target.bucket, key),
            key: key.to_string(),
            bucket: Some(target.bucket.to_string()),
            provider: CloudProvider::Azure,
        })
    }

    async fn presign(
        &self,
        options: ResolvedOptions<PresignOptions>,
    ) -> anyhow::Result<PresignedUrl> {
        let target = require_target::<AzureCredentials, _>(&options, Operation::Presign)?;
        let account = StorageAccount::from_connection_string(&target.credentials.connection_string)?;
        let expires_in = options.options.expires_in_or_default();

        self.ensure_container(&account, target.bucket).await?;

        debug!(
            "Azure presign: account={} container={} blob={} expires_in={}",
            account.name,
            target.bucket,
            options.key(),
            expires_in
        );

        let url = blob_sas_url(
            &account,
            target.bucket,
            options.key(),
            options.mime_type(),
            expires_in,
            Utc::now(),
        )?;

        Ok(PresignedUrl::new(url))
    }
}

impl CloudAdapter for AzureAdapter {
    fn upload_file(
        &self,
        data: UploadData,
        options: ResolvedOptions<UploadOptions>,
    ) -> AdapterFuture<'_, UploadResult> {
        Box::pin(self.upload(data, options))
    }

    fn generate_presigned_url(
        &self,
        options: ResolvedOptions<PresignOptions>,
    ) -> AdapterFuture<'_, PresignedUrl> {
        Box::pin(self.presign(options))
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;

    const TEST_KEY: &str = "dGVzdC1hY2NvdW50LWtleS1mb3ItdXBsb2FkLWtpdA==";

    fn conn_str(server: &mockito::Server) -> String {
        format!(
            "DefaultEndpointsProtocol=http;AccountName=testaccount;AccountKey={TEST_KEY};BlobEndpoint={}/testaccount;",
            server.url()
        )
    }

    fn upload_opts(connection_string: String) -> ResolvedOptions<UploadOptions> {
        ResolvedOptions {
            provider: CloudProvider::Azure,
            credentials: AzureCredentials::new(connection_string).into(),
            options: UploadOptions::new("a.txt")
                .bucket("test-container")
                .mime_type("text/plain"),
        }
    }

    fn adapter_with_block_size(block_size: usize) -> AzureAdapter {
        let mut adapter = AzureAdapter::new().unwrap();
        adapter.block_size = block_size;
        adapter
    }

    async fn mock_container_created(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("PUT", "/testaccount/test-container")
            .match_query(Matcher::UrlEncoded("restype".into(), "container".into()))
            .with_status(201)
            .create_async()
            .await
    }

    // -- Connection string parsing -------------------------------------------

    #[test]
    fn test_parse_standard_connection_string() {
        let account = StorageAccount::from_connection_string(&format!(
            "DefaultEndpointsProtocol=https;AccountName=myaccount;AccountKey={TEST_KEY};EndpointSuffix=core.windows.net"
        ))
        .unwrap();
        assert_eq!(account.name, "myaccount");
        assert_eq!(account.blob_endpoint, "https://myaccount.blob.core.windows.net");
        assert!(account.key.is_some());
        assert!(account.sas_token.is_none());
    }

    #[test]
    fn test_parse_sovereign_cloud_suffix() {
        let account = StorageAccount::from_connection_string(&format!(
            "AccountName=cn;AccountKey={TEST_KEY};EndpointSuffix=core.chinacloudapi.cn"
        ))
        .unwrap();
        assert_eq!(account.blob_endpoint, "https://cn.blob.core.chinacloudapi.cn");
    }

    #[test]
    fn test_parse_blob_endpoint_override() {
        let account = StorageAccount::from_connection_string(&format!(
            "AccountName=a;AccountKey={TEST_KEY};BlobEndpoint=http://localhost:10000/a/"
        ))
        .unwrap();
        assert_eq!(account.blob_endpoint, "http://localhost:10000/a");
        assert_eq!(account.blob_url("c", "dir/x y.txt"), "http://localhost:10000/a/c/dir/x%20y.txt");
    }

    #[test]
    fn test_parse_development_storage() {
        let account =
            StorageAccount::from_connection_string("UseDevelopmentStorage=true").unwrap();
        assert_eq!(account.name, DEV_ACCOUNT_NAME);
        assert_eq!(account.blob_endpoint, DEV_BLOB_ENDPOINT);
        assert!(account.key.is_some());
    }

    #[test]
    fn test_parse_sas_only() {
        let account = StorageAccount::from_connection_string(
            "BlobEndpoint=https://sasacct.blob.core.windows.net;SharedAccessSignature=?sv=2023-11-03&sig=abc",
        )
        .unwrap();
        assert_eq!(account.name, "sasacct");
        assert_eq!(account.sas_token.as_deref(), Some("sv=2023-11-03&sig=abc"));
        assert!(account.key.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_secret() {
        let err = StorageAccount::from_connection_string("AccountName=a").unwrap_err();
        assert!(err.to_string().contains("neither AccountKey nor SharedAccessSignature"));
    }

    #[test]
    fn test_parse_rejects_bad_key() {
        let err =
            StorageAccount::from_connection_string("AccountName=a;AccountKey=***").unwrap_err();
        assert!(err.to_string().contains("Invalid AccountKey"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StorageAccount::from_connection_string("not a connection string").is_err());
        assert!(StorageAccount::from_connection_string(&format!("AccountKey={TEST_KEY}")).is_err());
    }

    #[test]
    fn test_account_debug_redacts_secrets() {
        let account = StorageAccount::from_connection_string(&format!(
            "AccountName=a;AccountKey={TEST_KEY}"
        ))
        .unwrap();
        let out = format!("{account:?}");
        assert!(out.contains("<redacted>"));
        assert!(!out.contains(TEST_KEY));
    }

    // -- Signing -------------------------------------------------------------

    #[test]
    fn test_shared_key_string_to_sign() {
        let headers = vec![
            ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
            ("x-ms-date".to_string(), "Mon, 01 Jan 2026 00:00:00 GMT".to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        let sts = shared_key_string_to_sign(
            "PUT",
            5,
            "XUFAKrxLKna5cZ2REBfFkg==",
            "text/plain",
            &headers,
            "/acct/acct/c/a.txt",
            &[],
        );
        assert_eq!(
            sts,
            "PUT\n\n\n5\nXUFAKrxLKna5cZ2REBfFkg==\ntext/plain\n\n\n\n\n\n\n\
             x-ms-blob-type:BlockBlob\n\
             x-ms-date:Mon, 01 Jan 2026 00:00:00 GMT\n\
             x-ms-version:2023-11-03\n\
             /acct/acct/c/a.txt"
        );
    }

    #[test]
    fn test_shared_key_string_to_sign_sorts_query() {
        let sts = shared_key_string_to_sign(
            "PUT",
            0,
            "",
            "",
            &[],
            "/acct/c",
            &[("restype", "container".to_string()), ("comp", "acl".to_string())],
        );
        assert!(sts.starts_with("PUT\n\n\n\n\n\n"));
        assert!(sts.ends_with("/acct/c\ncomp:acl\nrestype:container"));
    }

    #[test]
    fn test_content_md5() {
        assert_eq!(content_md5(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_block_ids_have_equal_length() {
        let a = block_id("0123456789abcdef0123456789abcdef", 0);
        let b = block_id("0123456789abcdef0123456789abcdef", 123_456);
        assert_eq!(a.len(), b.len());
        assert_eq!(
            BASE64_STANDARD.decode(&a).unwrap(),
            b"0123456789abcdef0123456789abcdef-000000"
        );
    }

    #[test]
    fn test_block_list_xml() {
        let xml = block_list_xml(&["QQ==".to_string(), "Qg==".to_string()]).unwrap();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList><Latest>QQ==</Latest><Latest>Qg==</Latest></BlockList>"
        );
    }

    #[test]
    fn test_parse_error_body() {
        let body = "\u{feff}<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>AuthenticationFailed</Code><Message>Server failed to authenticate the request.</Message></Error>";
        let parsed = parse_error_body(body);
        assert_eq!(parsed.code.as_deref(), Some("AuthenticationFailed"));

        let err = AzureAdapter::map_azure_error("put_blob", StatusCode::FORBIDDEN, body);
        assert_eq!(
            err.to_string(),
            "Azure put_blob: HTTP 403 Forbidden AuthenticationFailed - Server failed to authenticate the request."
        );
    }

    #[test]
    fn test_map_error_without_xml() {
        let err = AzureAdapter::map_azure_error("put_blob", StatusCode::BAD_GATEWAY, "upstream");
        assert_eq!(err.to_string(), "Azure put_blob: HTTP 502 Bad Gateway - upstream");
    }

    #[test]
    fn test_blob_sas_url() {
        let account = StorageAccount::from_connection_string(&format!(
            "AccountName=acct;AccountKey={TEST_KEY}"
        ))
        .unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let url = blob_sas_url(&account, "media", "dir/a.png", Some("image/png"), 600, now).unwrap();

        assert!(url.starts_with("https://acct.blob.core.windows.net/media/dir/a.png?"));
        assert!(url.contains("sv=2023-11-03"));
        assert!(url.contains("st=2026-01-02T03%3A04%3A05Z"));
        assert!(url.contains("se=2026-01-02T03%3A14%3A05Z"));
        assert!(url.contains("sr=b&sp=w"));
        assert!(url.contains("rsct=image%2Fpng"));

        let sas = BlobSas {
            account: "acct",
            container: "media",
            blob: "dir/a.png",
            start: "2026-01-02T03:04:05Z".to_string(),
            expiry: "2026-01-02T03:14:05Z".to_string(),
            content_type: Some("image/png"),
        };
        let sts = sas.string_to_sign();
        assert_eq!(sts.lines().count(), 16);
        assert!(sts.starts_with("w\n2026-01-02T03:04:05Z\n2026-01-02T03:14:05Z\n/blob/acct/media/dir/a.png\n"));
        assert!(sts.ends_with("\nimage/png"));

        let expected_sig = sign(&BASE64_STANDARD.decode(TEST_KEY).unwrap(), &sts).unwrap();
        assert!(url.ends_with(&format!("sig={}", encode_component(&expected_sig))));
    }

    #[test]
    fn test_blob_sas_url_requires_account_key() {
        let account = StorageAccount::from_connection_string(
            "BlobEndpoint=https://a.blob.core.windows.net;SharedAccessSignature=sv=x&sig=y",
        )
        .unwrap();
        let err = blob_sas_url(&account, "c", "b", None, 60, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("need an AccountKey"));
    }

    // -- HTTP ----------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_buffer() {
        let mut server = mockito::Server::new_async().await;
        let container = mock_container_created(&mut server).await;
        let blob = server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .match_header("x-ms-blob-type", "BlockBlob")
            .match_header("x-ms-blob-content-type", "text/plain")
            .match_header("content-md5", "XUFAKrxLKna5cZ2REBfFkg==")
            .match_header("x-ms-version", AZURE_API_VERSION)
            .match_header(
                "authorization",
                Matcher::Regex("^SharedKey testaccount:".to_string()),
            )
            .match_body("hello")
            .with_status(201)
            .create_async()
            .await;

        let conn = conn_str(&server);
        let result = AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("hello"), upload_opts(conn))
            .await
            .unwrap();

        container.assert_async().await;
        blob.assert_async().await;
        assert_eq!(
            result,
            UploadResult {
                url: format!("{}/testaccount/test-container/a.txt", server.url()),
                key: "a.txt".to_string(),
                bucket: Some("test-container".to_string()),
                provider: CloudProvider::Azure,
            }
        );
    }

    #[tokio::test]
    async fn test_upload_accepts_existing_container() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/testaccount/test-container")
            .match_query(Matcher::UrlEncoded("restype".into(), "container".into()))
            .with_status(409)
            .with_header("x-ms-error-code", "ContainerAlreadyExists")
            .with_body(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>ContainerAlreadyExists</Code><Message>The specified container already exists.</Message></Error>",
            )
            .create_async()
            .await;
        let blob = server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .with_status(201)
            .create_async()
            .await;

        let conn = conn_str(&server);
        AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("x"), upload_opts(conn))
            .await
            .unwrap();
        blob.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_fails_on_other_container_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/testaccount/test-container")
            .match_query(Matcher::Any)
            .with_status(409)
            .with_body(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>ContainerBeingDeleted</Code><Message>The specified container is being deleted.</Message></Error>",
            )
            .create_async()
            .await;

        let conn = conn_str(&server);
        let err = AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("x"), upload_opts(conn))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Azure create_container: HTTP 409 Conflict ContainerBeingDeleted - The specified container is being deleted."
        );
    }

    #[tokio::test]
    async fn test_upload_stream_in_blocks() {
        let mut server = mockito::Server::new_async().await;
        mock_container_created(&mut server).await;
        let blocks = server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("comp".into(), "block".into()),
                Matcher::Regex("blockid=".to_string()),
            ]))
            .with_status(201)
            .expect(3)
            .create_async()
            .await;
        let commit = server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .match_query(Matcher::UrlEncoded("comp".into(), "blocklist".into()))
            .match_header("x-ms-blob-content-type", "text/plain")
            .match_body(Matcher::Regex(
                "^<\\?xml[^>]*\\?><BlockList>(<Latest>[A-Za-z0-9+/=]+</Latest>){3}</BlockList>$"
                    .to_string(),
            ))
            .with_status(201)
            .create_async()
            .await;

        // 10 bytes in 4-byte blocks: 4 + 4 + 2.
        let chunks = vec![
            Ok(Bytes::from("abc")),
            Ok(Bytes::from("defgh")),
            Ok(Bytes::from("ij")),
        ];
        let conn = conn_str(&server);
        adapter_with_block_size(4)
            .upload_file(
                UploadData::from_stream(futures::stream::iter(chunks)),
                upload_opts(conn),
            )
            .await
            .unwrap();

        blocks.assert_async().await;
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_small_stream_as_single_blob() {
        let mut server = mockito::Server::new_async().await;
        mock_container_created(&mut server).await;
        let blob = server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .match_header("x-ms-blob-type", "BlockBlob")
            .match_body("hello")
            .with_status(201)
            .create_async()
            .await;

        let chunks = vec![Ok(Bytes::from("hel")), Ok(Bytes::from("lo"))];
        let conn = conn_str(&server);
        adapter_with_block_size(1024)
            .upload_file(
                UploadData::from_stream(futures::stream::iter(chunks)),
                upload_opts(conn),
            )
            .await
            .unwrap();
        blob.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_with_sas_connection_string() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/sas/test-container")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("restype".into(), "container".into()),
                Matcher::UrlEncoded("sig".into(), "abc".into()),
            ]))
            .match_header("authorization", Matcher::Missing)
            .with_status(201)
            .create_async()
            .await;
        let blob = server
            .mock("PUT", "/sas/test-container/a.txt")
            .match_query(Matcher::UrlEncoded("sig".into(), "abc".into()))
            .match_header("authorization", Matcher::Missing)
            .with_status(201)
            .create_async()
            .await;

        let conn = format!(
            "BlobEndpoint={}/sas;SharedAccessSignature=sv=2023-11-03&sp=cw&sig=abc",
            server.url()
        );
        let result = AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("x"), upload_opts(conn))
            .await
            .unwrap();

        blob.assert_async().await;
        assert!(!result.url.contains("sig="));
    }

    #[tokio::test]
    async fn test_upload_surfaces_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        mock_container_created(&mut server).await;
        server
            .mock("PUT", "/testaccount/test-container/a.txt")
            .with_status(403)
            .with_body(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>AuthenticationFailed</Code><Message>Signature mismatch</Message></Error>",
            )
            .create_async()
            .await;

        let conn = conn_str(&server);
        let err = AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("x"), upload_opts(conn))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Azure put_blob: HTTP 403 Forbidden AuthenticationFailed - Signature mismatch"
        );
    }

    #[tokio::test]
    async fn test_presign_creates_container_and_signs() {
        let mut server = mockito::Server::new_async().await;
        let container = mock_container_created(&mut server).await;

        let conn = conn_str(&server);
        let presigned = AzureAdapter::new()
            .unwrap()
            .generate_presigned_url(ResolvedOptions {
                provider: CloudProvider::Azure,
                credentials: AzureCredentials::new(conn).into(),
                options: PresignOptions::new("a.txt")
                    .bucket("test-container")
                    .mime_type("text/plain")
                    .expires_in(900),
            })
            .await
            .unwrap();

        container.assert_async().await;
        assert!(presigned
            .url
            .starts_with(&format!("{}/testaccount/test-container/a.txt?sv=", server.url())));
        assert!(presigned.url.contains("sr=b&sp=w"));
        assert!(presigned.url.contains("rsct=text%2Fplain"));
        assert!(presigned.url.contains("&sig="));
    }

    #[tokio::test]
    async fn test_presign_rejects_foreign_credentials() {
        let err = AzureAdapter::new()
            .unwrap()
            .generate_presigned_url(ResolvedOptions {
                provider: CloudProvider::Azure,
                credentials: crate::types::GcpCredentials::default().into(),
                options: PresignOptions::new("a.txt").bucket("c"),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Azure bucket and valid Azure credentials are required for Azure presigned URL."
        );
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_connection_string() {
        let err = AzureAdapter::new()
            .unwrap()
            .upload_file(UploadData::from("x"), upload_opts(String::new()))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Azure bucket and valid Azure credentials are required for Azure Blob upload."
        );
    }
}
