//! Value types shared by the upload manager and the cloud adapters.
//!
//! Credentials are a tagged union keyed by [`CloudProvider`]; options and
//! results are plain per-call data with no behavior beyond accessors.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures::Stream;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Presigned URL lifetime used when a caller does not pass one (1 hour).
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

/// The cloud object stores this crate can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Gcp,
    Azure,
}

impl CloudProvider {
    /// Lowercase wire name (`aws`, `gcp`, `azure`).
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Azure => "azure",
        }
    }

    /// Human-facing name used in adapter error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "AWS",
            CloudProvider::Gcp => "GCP",
            CloudProvider::Azure => "Azure",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(CloudProvider::Aws),
            "gcp" => Ok(CloudProvider::Gcp),
            "azure" => Ok(CloudProvider::Azure),
            other => Err(AppError::UnsupportedProvider {
                name: other.to_string(),
            }),
        }
    }
}

/// Static AWS credentials plus the region they are scoped to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AwsCredentials {
    #[garde(length(min = 1))]
    pub access_key_id: String,
    #[garde(length(min = 1))]
    pub secret_access_key: String,
    #[garde(length(min = 1))]
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack). Forces path-style
    /// addressing when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub endpoint_url: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
            endpoint_url: None,
        }
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// Google Cloud Storage credentials.
///
/// With neither field set the adapter falls back to Application Default
/// Credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GcpCredentials {
    /// Path to a service account (or `authorized_user`) JSON key file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub key_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub project_id: Option<String>,
}

/// Azure Blob Storage credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AzureCredentials {
    #[garde(length(min = 1))]
    pub connection_string: String,
}

impl AzureCredentials {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

/// Provider-tagged credentials.
///
/// Serialized with an inline `provider` tag, e.g.
/// `{ provider: aws, access_key_id: ..., secret_access_key: ..., region: ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Credentials {
    Aws(AwsCredentials),
    Gcp(GcpCredentials),
    Azure(AzureCredentials),
}

impl Credentials {
    /// The provider these credentials belong to.
    pub fn provider(&self) -> CloudProvider {
        match self {
            Credentials::Aws(_) => CloudProvider::Aws,
            Credentials::Gcp(_) => CloudProvider::Gcp,
            Credentials::Azure(_) => CloudProvider::Azure,
        }
    }
}

impl From<AwsCredentials> for Credentials {
    fn from(c: AwsCredentials) -> Self {
        Credentials::Aws(c)
    }
}

impl From<GcpCredentials> for Credentials {
    fn from(c: GcpCredentials) -> Self {
        Credentials::Gcp(c)
    }
}

impl From<AzureCredentials> for Credentials {
    fn from(c: AzureCredentials) -> Self {
        Credentials::Azure(c)
    }
}

/// Process-wide defaults held by an [`UploadManager`](crate::UploadManager).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalUploadConfig {
    #[serde(default)]
    pub default_provider: Option<CloudProvider>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl GlobalUploadConfig {
    /// A config whose default provider is the credentials' own provider.
    pub fn new(credentials: impl Into<Credentials>) -> Self {
        let credentials = credentials.into();
        Self {
            default_provider: Some(credentials.provider()),
            credentials: Some(credentials),
        }
    }
}

/// Per-call upload request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Destination object path.
    pub key: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub provider: Option<CloudProvider>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Reject empty payloads with "File is required".
    #[serde(default)]
    pub is_required: bool,
}

impl UploadOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn provider(mut self, provider: CloudProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn credentials(mut self, credentials: impl Into<Credentials>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn required(mut self, is_required: bool) -> Self {
        self.is_required = is_required;
        self
    }
}

/// Per-call presigned URL request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignOptions {
    pub key: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub provider: Option<CloudProvider>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Lifetime in seconds; [`DEFAULT_EXPIRES_IN`] when unset.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl PresignOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn provider(mut self, provider: CloudProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn credentials(mut self, credentials: impl Into<Credentials>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn expires_in(mut self, seconds: u64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    /// Effective lifetime in seconds.
    pub fn expires_in_or_default(&self) -> u64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)
    }
}

/// Fields every request type carries, so the resolver can be written once.
pub trait RequestOptions {
    fn key(&self) -> &str;
    fn bucket(&self) -> Option<&str>;
    fn mime_type(&self) -> Option<&str>;
    fn provider(&self) -> Option<CloudProvider>;
    fn credentials(&self) -> Option<&Credentials>;
}

impl RequestOptions for UploadOptions {
    fn key(&self) -> &str {
        &self.key
    }
    fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }
    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
    fn provider(&self) -> Option<CloudProvider> {
        self.provider
    }
    fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

impl RequestOptions for PresignOptions {
    fn key(&self) -> &str {
        &self.key
    }
    fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }
    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
    fn provider(&self) -> Option<CloudProvider> {
        self.provider
    }
    fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

/// Options after resolution: provider and credentials are present and agree.
#[derive(Debug, Clone)]
pub struct ResolvedOptions<T> {
    pub provider: CloudProvider,
    pub credentials: Credentials,
    pub options: T,
}

impl<T: RequestOptions> ResolvedOptions<T> {
    pub fn key(&self) -> &str {
        self.options.key()
    }

    pub fn bucket(&self) -> Option<&str> {
        self.options.bucket()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.options.mime_type()
    }
}

/// Byte stream accepted as an upload body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Upload payload: an in-memory buffer or a readable byte stream.
pub enum UploadData {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl UploadData {
    /// Wrap any `Send` byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        UploadData::Stream(Box::pin(stream))
    }

    /// True for a zero-length buffer. Streams are never considered empty
    /// since their length is unknown until consumed.
    pub fn is_empty(&self) -> bool {
        matches!(self, UploadData::Bytes(b) if b.is_empty())
    }

    /// Length when known up front.
    pub fn len_hint(&self) -> Option<usize> {
        match self {
            UploadData::Bytes(b) => Some(b.len()),
            UploadData::Stream(_) => None,
        }
    }

    /// The payload as a stream; a buffer becomes a single chunk.
    pub fn into_stream(self) -> ByteStream {
        match self {
            UploadData::Bytes(b) => {
                Box::pin(futures::stream::once(async move { Ok::<_, std::io::Error>(b) }))
            }
            UploadData::Stream(s) => s,
        }
    }
}

impl fmt::Debug for UploadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadData::Bytes(b) => write!(f, "UploadData::Bytes({} bytes)", b.len()),
            UploadData::Stream(_) => f.write_str("UploadData::Stream(..)"),
        }
    }
}

impl From<Bytes> for UploadData {
    fn from(b: Bytes) -> Self {
        UploadData::Bytes(b)
    }
}

impl From<Vec<u8>> for UploadData {
    fn from(v: Vec<u8>) -> Self {
        UploadData::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for UploadData {
    fn from(s: &'static [u8]) -> Self {
        UploadData::Bytes(Bytes::from_static(s))
    }
}

impl From<&'static str> for UploadData {
    fn from(s: &'static str) -> Self {
        UploadData::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// Description of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub key: String,
    pub bucket: Option<String>,
    pub provider: CloudProvider,
}

/// A time-limited write URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    /// Extra form fields for POST-policy style uploads; unused by the
    /// built-in adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}

impl PresignedUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fields: None,
        }
    }
}
