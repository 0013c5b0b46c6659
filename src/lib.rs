//! upload-kit library -- one upload/presign API over AWS S3, Google Cloud
//! Storage and Azure Blob Storage.
//!
//! [`UploadManager`] resolves each call's provider and credentials against
//! process-wide defaults, then hands the call to a cached per-provider
//! [`CloudAdapter`](storage::adapter::CloudAdapter).

pub mod config;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod storage;
pub mod types;

pub use errors::{AppError, AppResult, ErrorKind};
pub use manager::{AdapterFactory, DefaultAdapterFactory, UploadManager};
pub use storage::adapter::CloudAdapter;
pub use types::{
    AwsCredentials, AzureCredentials, ByteStream, CloudProvider, Credentials, GcpCredentials,
    GlobalUploadConfig, PresignOptions, PresignedUrl, ResolvedOptions, UploadData,
    UploadOptions, UploadResult, DEFAULT_EXPIRES_IN,
};
