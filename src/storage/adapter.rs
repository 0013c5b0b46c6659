//! Cloud adapter capability trait.
//!
//! Every provider backend implements [`CloudAdapter`].  The manager hands
//! adapters fully resolved options, but each adapter re-checks bucket and
//! credentials itself with [`require_target`] before doing any I/O.

use std::future::Future;
use std::pin::Pin;

use garde::Validate;

use crate::types::{
    CloudProvider, Credentials, PresignOptions, PresignedUrl, RequestOptions, ResolvedOptions,
    UploadData, UploadOptions, UploadResult,
};

/// Boxed future returned by adapter operations.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Async upload/presign contract shared by the AWS, GCP and Azure adapters.
pub trait CloudAdapter: Send + Sync + 'static {
    /// Write `data` to `bucket/key`, returning where it landed.
    fn upload_file(
        &self,
        data: UploadData,
        options: ResolvedOptions<UploadOptions>,
    ) -> AdapterFuture<'_, UploadResult>;

    /// Produce a time-limited write URL for `bucket/key`.
    fn generate_presigned_url(
        &self,
        options: ResolvedOptions<PresignOptions>,
    ) -> AdapterFuture<'_, PresignedUrl>;
}

/// Operation name used in guard error messages.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Upload,
    Presign,
}

/// Target of an adapter call once the guard has passed.
pub(crate) struct Target<'a, C> {
    pub bucket: &'a str,
    pub credentials: &'a C,
}

/// Credentials of one provider, extractable from the tagged enum.
pub(crate) trait ProviderCredentials: Validate<Context = ()> + Sized {
    const PROVIDER: CloudProvider;

    fn extract(credentials: &Credentials) -> Option<&Self>;
}

impl ProviderCredentials for crate::types::AwsCredentials {
    const PROVIDER: CloudProvider = CloudProvider::Aws;

    fn extract(credentials: &Credentials) -> Option<&Self> {
        match credentials {
            Credentials::Aws(c) => Some(c),
            _ => None,
        }
    }
}

impl ProviderCredentials for crate::types::GcpCredentials {
    const PROVIDER: CloudProvider = CloudProvider::Gcp;

    fn extract(credentials: &Credentials) -> Option<&Self> {
        match credentials {
            Credentials::Gcp(c) => Some(c),
            _ => None,
        }
    }
}

impl ProviderCredentials for crate::types::AzureCredentials {
    const PROVIDER: CloudProvider = CloudProvider::Azure;

    fn extract(credentials: &Credentials) -> Option<&Self> {
        match credentials {
            Credentials::Azure(c) => Some(c),
            _ => None,
        }
    }
}

/// Check that the call names a bucket and carries valid credentials for
/// the adapter's own provider.
pub(crate) fn require_target<'a, C, T>(
    options: &'a ResolvedOptions<T>,
    operation: Operation,
) -> anyhow::Result<Target<'a, C>>
where
    C: ProviderCredentials,
    T: RequestOptions,
{
    let bucket = options.bucket().filter(|b| !b.is_empty());
    let credentials = C::extract(&options.credentials).filter(|c| c.validate().is_ok());

    match (bucket, credentials) {
        (Some(bucket), Some(credentials)) if options.provider == C::PROVIDER => {
            Ok(Target {
                bucket,
                credentials,
            })
        }
        _ => Err(guard_error(C::PROVIDER, operation)),
    }
}

fn guard_error(provider: CloudProvider, operation: Operation) -> anyhow::Error {
    let name = provider.display_name();
    let what = match (provider, operation) {
        (CloudProvider::Aws, Operation::Upload) => "AWS upload",
        (CloudProvider::Aws, Operation::Presign) => "AWS presigned URL",
        (CloudProvider::Gcp, Operation::Upload) => "Google Cloud Storage upload",
        (CloudProvider::Gcp, Operation::Presign) => "Google Cloud Storage presigned URL",
        (CloudProvider::Azure, Operation::Upload) => "Azure Blob upload",
        (CloudProvider::Azure, Operation::Presign) => "Azure presigned URL",
    };
    let bucket = match provider {
        CloudProvider::Aws => "AWS S3",
        _ => name,
    };
    anyhow::anyhow!("{bucket} bucket and valid {name} credentials are required for {what}.")
}

/// Everything except RFC 3986 unreserved characters.
pub(crate) const UNRESERVED: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// As [`UNRESERVED`], but leaves `/` alone for object paths.
pub(crate) const PATH_SEGMENT: percent_encoding::AsciiSet = UNRESERVED.remove(b'/');

pub(crate) fn encode_component(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, &UNRESERVED).to_string()
}

pub(crate) fn encode_path(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, &PATH_SEGMENT).to_string()
}

/// `application/octet-stream` unless the caller gave a type.
pub(crate) fn content_type_or_default(mime_type: Option<&str>) -> &str {
    mime_type.unwrap_or("application/octet-stream")
}
