//! AWS S3 adapter.
//!
//! Builds a region-scoped S3 client from the call's static credentials and
//! issues a single `PutObject` per upload.  Presigned URLs are `PutObject`
//! requests signed locally with SigV4 query parameters.
//!
//! Result URL: `https://{bucket}.s3.{region}.amazonaws.com/{key}`

use std::time::Duration;

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tracing::{debug, info};

use super::adapter::{require_target, AdapterFuture, CloudAdapter, Operation};
use crate::types::{
    AwsCredentials, ByteStream, CloudProvider, PresignOptions, PresignedUrl, ResolvedOptions,
    UploadData, UploadOptions, UploadResult,
};

/// Name reported by the static credentials provider.
const CREDENTIALS_SOURCE: &str = "upload-kit";

/// Adapter that writes to AWS S3 (or an S3-compatible endpoint).
#[derive(Debug, Default)]
pub struct AwsAdapter;

impl AwsAdapter {
    pub fn new() -> Self {
        info!("AWS S3 adapter created");
        Self
    }

    /// Build an S3 client for one set of credentials.
    ///
    /// Explicit credentials are injected as a static provider; no other
    /// source of the default chain is consulted for them.
    async fn client(credentials: &AwsCredentials) -> Client {
        let static_creds = aws_sdk_s3::config::Credentials::new(
            &credentials.access_key_id,
            &credentials.secret_access_key,
            None, // session_token
            None, // expiry
            CREDENTIALS_SOURCE,
        );

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(credentials.region.clone()))
            .credentials_provider(static_creds);

        if let Some(ref endpoint) = credentials.endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(credentials.endpoint_url.is_some())
            .build();

        Client::from_conf(s3_config)
    }

    /// Public object URL for a bucket/key in a region.
    pub fn object_url(bucket: &str, region: &str, key: &str) -> String {
        format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
    }

    /// Wrap an AWS SDK error with context. The SDK error stays in the chain
    /// so callers can downcast it and inspect the service error code.
    fn map_sdk_error<E>(context: &str, err: E) -> anyhow::Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = format!("AWS S3 {context}: {}", DisplayErrorContext(&err));
        anyhow::Error::new(err).context(message)
    }

    async fn upload(
        &self,
        data: UploadData,
        options: ResolvedOptions<UploadOptions>,
    ) -> anyhow::Result<UploadResult> {
        let target = require_target::<AwsCredentials, _>(&options, Operation::Upload)?;
        let key = options.key();

        let body = match data {
            UploadData::Bytes(bytes) => bytes,
            UploadData::Stream(stream) => collect_stream(stream).await?,
        };

        let client = Self::client(target.credentials).await;

        debug!(
            "AWS put_object: bucket={} key={} bytes={}",
            target.bucket,
            key,
            body.len()
        );

        client
            .put_object()
            .bucket(target.bucket)
            .key(key)
            .body(S3ByteStream::from(body))
            .set_content_type(options.mime_type().map(str::to_string))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("put_object", e))?;

        Ok(UploadResult {
            url: Self::object_url(target.bucket, &target.credentials.region, key),
            key: key.to_string(),
            bucket: Some(target.bucket.to_string()),
            provider: CloudProvider::Aws,
        })
    }

    async fn presign(
        &self,
        options: ResolvedOptions<PresignOptions>,
    ) -> anyhow::Result<PresignedUrl> {
        let target = require_target::<AwsCredentials, _>(&options, Operation::Presign)?;
        let expires_in = options.options.expires_in_or_default();

        let presigning = PresigningConfig::expires_in(Duration::from_secs(expires_in))
            .map_err(|e| Self::map_sdk_error("presigning config", e))?;

        let client = Self::client(target.credentials).await;

        debug!(
            "AWS presign put_object: bucket={} key={} expires_in={}",
            target.bucket,
            options.key(),
            expires_in
        );

        let request = client
            .put_object()
            .bucket(target.bucket)
            .key(options.key())
            .set_content_type(options.mime_type().map(str::to_string))
            .presigned(presigning)
            .await
            .map_err(|e| Self::map_sdk_error("presign put_object", e))?;

        Ok(PresignedUrl::new(request.uri().to_string()))
    }
}

impl CloudAdapter for AwsAdapter {
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

/// Drain a byte stream into one buffer; `PutObject` needs a known length.
async fn collect_stream(stream: ByteStream) -> anyhow::Result<Bytes> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read upload stream: {e}"))?;
    Ok(buf.freeze())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
    use aws_sdk_s3::operation::put_object::PutObjectError;
    use crate::types::{Credentials, GcpCredentials};

    fn creds(region: &str) -> AwsCredentials {
        AwsCredentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG", region)
    }

    fn upload_opts(credentials: Credentials, bucket: Option<&str>) -> ResolvedOptions<UploadOptions> {
        let mut options = UploadOptions::new("a.txt").mime_type("text/plain");
        options.bucket = bucket.map(str::to_string);
        ResolvedOptions {
            provider: CloudProvider::Aws,
            credentials,
            options,
        }
    }

    fn presign_opts(expires_in: Option<u64>) -> ResolvedOptions<PresignOptions> {
        let mut options = PresignOptions::new("photos/cat.png")
            .bucket("media-bucket")
            .mime_type("image/png");
        options.expires_in = expires_in;
        ResolvedOptions {
            provider: CloudProvider::Aws,
            credentials: creds("us-east-1").into(),
            options,
        }
    }

    #[test]
    fn test_object_url() {
        assert_eq!(
            AwsAdapter::object_url("b", "us-east-1", "a.txt"),
            "https://b.s3.us-east-1.amazonaws.com/a.txt"
        );
    }

    #[test]
    fn test_object_url_nested_key() {
        assert_eq!(
            AwsAdapter::object_url("media", "ap-south-1", "users/42/avatar.jpg"),
            "https://media.s3.ap-south-1.amazonaws.com/users/42/avatar.jpg"
        );
    }

    #[tokio::test]
    async fn test_collect_stream_concatenates_chunks() {
        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let body = collect_stream(stream).await.unwrap();
        assert_eq!(body, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_collect_stream_propagates_error() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from("partial")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let err = collect_stream(stream).await.unwrap_err();
        assert!(err.to_string().contains("gone"));
    }

    #[tokio::test]
    async fn test_upload_rejects_missing_bucket() {
        let adapter = AwsAdapter::new();
        let err = adapter
            .upload_file(UploadData::from("x"), upload_opts(creds("us-east-1").into(), None))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "AWS S3 bucket and valid AWS credentials are required for AWS upload."
        );
    }

    #[tokio::test]
    async fn test_upload_rejects_foreign_credentials() {
        let adapter = AwsAdapter::new();
        let err = adapter
            .upload_file(
                UploadData::from("x"),
                upload_opts(GcpCredentials::default().into(), Some("b")),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("valid AWS credentials"));
    }

    #[tokio::test]
    async fn test_presign_binds_expiry() {
        let adapter = AwsAdapter::new();
        let presigned = adapter
            .generate_presigned_url(presign_opts(Some(120)))
            .await
            .unwrap();

        assert!(presigned
            .url
            .starts_with("https://media-bucket.s3.us-east-1.amazonaws.com/photos/cat.png?"));
        assert!(presigned.url.contains("X-Amz-Expires=120"));
        assert!(presigned.url.contains("X-Amz-Credential=AKIDEXAMPLE%2F"));
        assert!(presigned.url.contains("X-Amz-Signature="));
        assert!(presigned.fields.is_none());
    }

    #[tokio::test]
    async fn test_presign_default_expiry() {
        let adapter = AwsAdapter::new();
        let presigned = adapter
            .generate_presigned_url(presign_opts(None))
            .await
            .unwrap();
        assert!(presigned.url.contains("X-Amz-Expires=3600"));
    }

    #[tokio::test]
    async fn test_presign_rejects_expiry_over_a_week() {
        let adapter = AwsAdapter::new();
        let err = adapter
            .generate_presigned_url(presign_opts(Some(8 * 24 * 3600)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("presigning config"));
    }

    #[tokio::test]
    async fn test_upload_to_s3_compatible_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/test-bucket/a.txt")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("ETag", "\"5d41402abc4b2a76b9719d911017c592\"")
            .create_async()
            .await;

        let mut credentials = creds("us-east-1");
        credentials.endpoint_url = Some(server.url());

        let adapter = AwsAdapter::new();
        let result = adapter
            .upload_file(
                UploadData::from("hello"),
                upload_opts(credentials.into(), Some("test-bucket")),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            result,
            UploadResult {
                url: "https://test-bucket.s3.us-east-1.amazonaws.com/a.txt".to_string(),
                key: "a.txt".to_string(),
                bucket: Some("test-bucket".to_string()),
                provider: CloudProvider::Aws,
            }
        );
    }

    #[tokio::test]
    async fn test_upload_surfaces_access_denied() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/test-bucket/a.txt")
            .match_query(mockito::Matcher::Any)
            .with_status(403)
            .with_header("content-type", "application/xml")
            .with_body(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
            )
            .create_async()
            .await;

        let mut credentials = creds("us-east-1");
        credentials.endpoint_url = Some(server.url());

        let err = AwsAdapter::new()
            .upload_file(
                UploadData::from("hello"),
                upload_opts(credentials.into(), Some("test-bucket")),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("AWS S3 put_object"));
        assert!(err.to_string().contains("AccessDenied"));

        let sdk_err = err
            .downcast_ref::<SdkError<PutObjectError>>()
            .expect("SDK error kept in the chain");
        let code = sdk_err.as_service_error().and_then(|e| e.code());
        assert_eq!(code, Some("AccessDenied"));
    }

    #[tokio::test]
    async fn test_presigning_config_error_is_kept() {
        let err = AwsAdapter::new()
            .generate_presigned_url(presign_opts(Some(8 * 24 * 3600)))
            .await
            .unwrap_err();
        assert!(err
            .downcast_ref::<aws_sdk_s3::presigning::PresigningConfigError>()
            .is_some());
    }
}
