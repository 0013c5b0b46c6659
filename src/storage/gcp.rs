//! Google Cloud Storage adapter.
//!
//! Talks to the GCS JSON API with `reqwest`.  Uploads are single media
//! uploads fed from a byte stream.  Presigned URLs are V4 signed URLs,
//! signed locally with a service account key when one is available and
//! through the IAM Credentials `signBlob` API for the metadata server's
//! default service account otherwise.
//!
//! Result URL: `https://storage.googleapis.com/{bucket}/{key}`
//!
//! Credentials come from the call's key file when one is given, otherwise
//! from Application Default Credentials (ADC):
//!   - `GOOGLE_APPLICATION_CREDENTIALS` environment variable (key file)
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - GCE metadata server (when running on Google Cloud)

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::adapter::{
    content_type_or_default, encode_component, encode_path, require_target, AdapterFuture,
    CloudAdapter, Operation,
};
use crate::types::{
    CloudProvider, GcpCredentials, PresignOptions, PresignedUrl, ResolvedOptions, UploadData,
    UploadOptions, UploadResult,
};

/// Public GCS host, used for result URLs and as the signed-URL host.
const GCS_HOST: &str = "storage.googleapis.com";

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// OAuth2 scope needed to write objects.
const GCS_WRITE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// GCE metadata server base URL.
const METADATA_BASE: &str = "http://metadata.google.internal";

/// IAM Credentials API base URL.
const IAM_CREDENTIALS_BASE: &str = "https://iamcredentials.googleapis.com";

/// Upper bound on how long a token is cached, whatever the server claims.
const MAX_TOKEN_CACHE_SECS: u64 = 86_400;

/// V4 signed URLs may live at most 7 days.
const MAX_SIGNED_URL_EXPIRES: u64 = 604_800;

/// Environment variable naming a GCS emulator (e.g. fake-gcs-server).
const EMULATOR_HOST_ENV: &str = "STORAGE_EMULATOR_HOST";

// -- Key file types -------------------------------------------------------------

/// A JSON credentials file, discriminated by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeyFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUserKey),
}

/// The parts of a service account key this adapter uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct AuthorizedUserKey {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

/// JWT claims for the OAuth2 JWT bearer grant.
#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize)]
struct SignBlobRequest {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

fn default_expires_in() -> u64 {
    3600
}

// -- Token management ---------------------------------------------------------

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Where an access token comes from; also the token cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TokenSource {
    KeyFile(String),
    ApplicationDefault,
    MetadataServer,
}

/// Adapter that writes to Google Cloud Storage.
pub struct GcpAdapter {
    /// HTTP client for GCS JSON API and OAuth2 calls.
    client: reqwest::Client,
    /// JSON API base URL (overridable for emulators and tests).
    api_base: String,
    /// Metadata server base URL.
    metadata_base: String,
    /// IAM Credentials API base URL, used for `signBlob`.
    iam_base: String,
    /// Skip auth for calls without a key file (emulator mode).
    anonymous: bool,
    /// Access tokens per credential source.
    token_cache: Mutex<HashMap<TokenSource, CachedToken>>,
}

impl GcpAdapter {
    /// Create an adapter against the public GCS endpoint, or against
    /// `STORAGE_EMULATOR_HOST` when that variable is set.
    pub fn new() -> anyhow::Result<Self> {
        match std::env::var(EMULATOR_HOST_ENV) {
            Ok(host) if !host.is_empty() => {
                info!("GCS adapter using emulator at {}", host);
                let mut adapter = Self::with_endpoint(host)?;
                adapter.anonymous = true;
                Ok(adapter)
            }
            _ => Self::with_endpoint(GCS_API_BASE),
        }
    }

    /// Create an adapter against a custom JSON API base URL.
    pub fn with_endpoint(api_base: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let api_base = api_base.into().trim_end_matches('/').to_string();
        info!("GCS adapter created: endpoint={}", api_base);

        Ok(Self {
            client,
            api_base,
            metadata_base: METADATA_BASE.to_string(),
            iam_base: IAM_CREDENTIALS_BASE.to_string(),
            anonymous: false,
            token_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Use a different metadata server base URL.
    pub fn with_metadata_endpoint(mut self, base: impl Into<String>) -> Self {
        self.metadata_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a different IAM Credentials API base URL.
    pub fn with_iam_endpoint(mut self, base: impl Into<String>) -> Self {
        self.iam_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Public object URL for a bucket/key.
    pub fn object_url(bucket: &str, key: &str) -> String {
        format!("https://{GCS_HOST}/{bucket}/{key}")
    }

    fn token_source(credentials: &GcpCredentials) -> TokenSource {
        match credentials.key_file_path {
            Some(ref path) => TokenSource::KeyFile(path.clone()),
            None => TokenSource::ApplicationDefault,
        }
    }

    /// Get an OAuth2 access token for `source`.
    ///
    /// Returns a cached token if it hasn't expired (with 60s safety margin).
    async fn get_access_token(&self, source: &TokenSource) -> anyhow::Result<String> {
        {
            let cache = self
                .token_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(source) {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = match source {
            TokenSource::KeyFile(path) => self.token_from_key_file(path).await?,
            TokenSource::ApplicationDefault => self.token_from_adc().await?,
            TokenSource::MetadataServer => self.token_from_metadata_server().await?,
        };

        let lifetime = expires_in.saturating_sub(60).min(MAX_TOKEN_CACHE_SECS);
        match Instant::now().checked_add(Duration::from_secs(lifetime)) {
            Some(expiry) => {
                self.token_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        source.clone(),
                        CachedToken {
                            access_token: token.clone(),
                            expiry,
                        },
                    );
            }
            None => warn!("GCS token expiry out of range, not caching"),
        }

        Ok(token)
    }

    /// Resolve a token through the ADC chain.
    async fn token_from_adc(&self) -> anyhow::Result<(String, u64)> {
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.token_from_key_file(&path).await;
        }

        let adc_path = application_default_credentials_path();
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            return self.token_from_key_file(&adc_path).await;
        }

        self.token_from_metadata_server().await
    }

    async fn token_from_key_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        match read_key_file(path).await? {
            KeyFile::ServiceAccount(key) => self.token_from_service_account(&key).await,
            KeyFile::AuthorizedUser(key) => self.token_from_refresh(&key).await,
        }
    }

    /// JWT bearer grant: sign an RS256 assertion with the service account key.
    async fn token_from_service_account(
        &self,
        key: &ServiceAccountKey,
    ) -> anyhow::Result<(String, u64)> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: GCS_WRITE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid private_key in service account key: {e}"))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign service account JWT: {e}"))?;

        debug!("GCS token request: jwt-bearer for {}", key.client_email);

        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token request failed: {e}"))?;

        Self::parse_token_response(resp).await
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(&self, key: &AuthorizedUserKey) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .post(DEFAULT_TOKEN_URI)
            .form(&[
                ("client_id", key.client_id.as_str()),
                ("client_secret", key.client_secret.as_str()),
                ("refresh_token", key.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token refresh request failed: {e}"))?;

        Self::parse_token_response(resp).await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.metadata_base
        );
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Metadata server request failed: {e}. Pass a key file, set \
                     GOOGLE_APPLICATION_CREDENTIALS, or run \
                     'gcloud auth application-default login'."
                )
            })?;

        Self::parse_token_response(resp).await
    }

    /// Email of the metadata server's default service account.
    async fn metadata_service_account_email(&self) -> anyhow::Result<String> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/email",
            self.metadata_base
        );
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "GCS presigned URLs need a service account key file or a metadata \
                     server; metadata request failed: {e}"
                )
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Metadata server email request failed ({status}): {body}"
            ));
        }

        let email = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Malformed metadata server response: {e}"))?;
        Ok(email.trim().to_string())
    }

    /// Sign `payload` as `email` with the IAM Credentials `signBlob` API.
    async fn sign_blob(&self, email: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let token = self.get_access_token(&TokenSource::MetadataServer).await?;
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:signBlob",
            self.iam_base, email
        );

        debug!("GCS signBlob as {}", email);

        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&SignBlobRequest {
                payload: BASE64_STANDARD.encode(payload),
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("signBlob request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("signBlob", status, &body));
        }

        let signed: SignBlobResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Malformed signBlob response: {e}"))?;
        BASE64_STANDARD
            .decode(signed.signed_blob)
            .map_err(|e| anyhow::anyhow!("Malformed signBlob signature: {e}"))
    }

    /// V4 signed URL for the metadata server's service account, signed
    /// remotely.
    async fn signed_url_via_iam(
        &self,
        bucket: &str,
        object: &str,
        content_type: Option<&str>,
        expires_in: u64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        check_signed_url_expiry(expires_in)?;

        let email = self.metadata_service_account_email().await?;
        let request = signing_request(&email, bucket, object, content_type, expires_in, now);
        let signature = self
            .sign_blob(&email, string_to_sign(&request).as_bytes())
            .await?;

        Ok(assemble_signed_url(&request, &signature))
    }

    async fn parse_token_response(resp: reqwest::Response) -> anyhow::Result<(String, u64)> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Token request failed ({status}): {body}"));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Malformed token response: {e}"))?;
        Ok((token.access_token, token.expires_in))
    }

    /// Map a GCS HTTP error to an anyhow error with context.
    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
            if let Some(err) = err_resp.error {
                return anyhow::anyhow!(
                    "GCS {}: {} (code {})",
                    context,
                    err.message.unwrap_or_default(),
                    err.code.unwrap_or(status.as_u16())
                );
            }
        }
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    async fn upload(
        &self,
        data: UploadData,
        options: ResolvedOptions<UploadOptions>,
    ) -> anyhow::Result<UploadResult> {
        let target = require_target::<GcpCredentials, _>(&options, Operation::Upload)?;
        let key = options.key();
        let content_type = content_type_or_default(options.mime_type());

        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.api_base,
            encode_component(target.bucket),
            encode_component(key)
        );

        let mut req = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(data.into_stream()));

        let source = Self::token_source(target.credentials);
        if !(self.anonymous && source == TokenSource::ApplicationDefault) {
            let token = self.get_access_token(&source).await?;
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        debug!(
            "GCS upload: bucket={} key={} content_type={}",
            target.bucket, key, content_type
        );

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("upload", status, &body));
        }

        Ok(UploadResult {
            url: Self::object_url(target.bucket, key),
            key: key.to_string(),
            bucket: Some(target.bucket.to_string()),
            provider: CloudProvider::Gcp,
        })
    }

    async fn presign(
        &self,
        options: ResolvedOptions<PresignOptions>,
    ) -> anyhow::Result<PresignedUrl> {
        let target = require_target::<GcpCredentials, _>(&options, Operation::Presign)?;
        let expires_in = options.options.expires_in_or_default();

        debug!(
            "GCS presign: bucket={} key={} expires_in={}",
            target.bucket,
            options.key(),
            expires_in
        );

        let key_path = match target.credentials.key_file_path {
            Some(ref path) => path.clone(),
            None => match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
                Ok(path) => path,
                Err(_) => {
                    let url = self
                        .signed_url_via_iam(
                            target.bucket,
                            options.key(),
                            options.mime_type(),
                            expires_in,
                            Utc::now(),
                        )
                        .await?;
                    return Ok(PresignedUrl::new(url));
                }
            },
        };

        let service_account = match read_key_file(&key_path).await? {
            KeyFile::ServiceAccount(key) => key,
            KeyFile::AuthorizedUser(_) => {
                warn!("GCS presign requested with user credentials from {}", key_path);
                return Err(anyhow::anyhow!(
                    "GCS presigned URLs need a service account key, {key_path} holds user credentials"
                ));
            }
        };

        let url = signed_url(
            &service_account,
            target.bucket,
            options.key(),
            options.mime_type(),
            expires_in,
            Utc::now(),
        )?;

        Ok(PresignedUrl::new(url))
    }
}

impl CloudAdapter for GcpAdapter {
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

/// Get the path to gcloud application-default credentials.
fn application_default_credentials_path() -> String {
    if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

async fn read_key_file(path: &str) -> anyhow::Result<KeyFile> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read GCP key file {path}: {e}"))?;
    serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse GCP key file {path}: {e}"))
}

// -- V4 signing -----------------------------------------------------------------

/// The query parameters and canonical request of a V4 signed PUT.
struct SigningRequest {
    datetime: String,
    scope: String,
    canonical_uri: String,
    canonical_query: String,
    canonical_request: String,
}

fn signing_request(
    client_email: &str,
    bucket: &str,
    object: &str,
    content_type: Option<&str>,
    expires_in: u64,
    now: DateTime<Utc>,
) -> SigningRequest {
    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/auto/storage/goog4_request");

    let (canonical_headers, signed_headers) = match content_type {
        Some(ct) => (
            format!("content-type:{ct}\nhost:{GCS_HOST}\n"),
            "content-type;host",
        ),
        None => (format!("host:{GCS_HOST}\n"), "host"),
    };

    // Parameter names are already in lexicographic order.
    let params = [
        ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
        ("X-Goog-Credential", format!("{client_email}/{scope}")),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", expires_in.to_string()),
        ("X-Goog-SignedHeaders", signed_headers.to_string()),
    ];
    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_uri = format!("/{}/{}", bucket, encode_path(object));
    let canonical_request = format!(
        "PUT\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\nUNSIGNED-PAYLOAD"
    );

    SigningRequest {
        datetime,
        scope,
        canonical_uri,
        canonical_query,
        canonical_request,
    }
}

fn check_signed_url_expiry(expires_in: u64) -> anyhow::Result<()> {
    if expires_in == 0 || expires_in > MAX_SIGNED_URL_EXPIRES {
        return Err(anyhow::anyhow!(
            "GCS signed URL expiry must be between 1 and {MAX_SIGNED_URL_EXPIRES} seconds, got {expires_in}"
        ));
    }
    Ok(())
}

fn assemble_signed_url(request: &SigningRequest, signature: &[u8]) -> String {
    format!(
        "https://{}{}?{}&X-Goog-Signature={}",
        GCS_HOST,
        request.canonical_uri,
        request.canonical_query,
        hex::encode(signature)
    )
}

fn string_to_sign(request: &SigningRequest) -> String {
    format!(
        "GOOG4-RSA-SHA256\n{}\n{}\n{}",
        request.datetime,
        request.scope,
        hex::encode(Sha256::digest(request.canonical_request.as_bytes()))
    )
}

/// Build a V4 signed URL allowing a single PUT of `bucket/object`.
pub fn signed_url(
    key: &ServiceAccountKey,
    bucket: &str,
    object: &str,
    content_type: Option<&str>,
    expires_in: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    check_signed_url_expiry(expires_in)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key)
        .map_err(|e| anyhow::anyhow!("Invalid private_key in service account key: {e}"))?;

    let request = signing_request(
        &key.client_email,
        bucket,
        object,
        content_type,
        expires_in,
        now,
    );
    let digest = Sha256::digest(string_to_sign(&request).as_bytes());
    let signature = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| anyhow::anyhow!("Failed to sign GCS URL: {e}"))?;

    Ok(assemble_signed_url(&request, &signature))
}

// -- Tests -------------------------------------------------------------------
