//! Upload manager: resolves per-call options against the global defaults
//! and dispatches to a cached per-provider adapter.
//!
//! Resolution order for every call:
//!   1. provider: call option, else global default, else error
//!   2. credentials: call option, else global credentials, else error
//!   3. the credentials' provider tag must equal the resolved provider
//!
//! Nothing is constructed and no network is touched until all three pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::metrics::{record_bytes_uploaded, record_operation, OP_PRESIGN, OP_UPLOAD};
use crate::storage::adapter::CloudAdapter;
use crate::storage::aws::AwsAdapter;
use crate::storage::azure::AzureAdapter;
use crate::storage::gcp::GcpAdapter;
use crate::types::{
    CloudProvider, GlobalUploadConfig, PresignOptions, PresignedUrl, RequestOptions,
    ResolvedOptions, UploadData, UploadOptions, UploadResult,
};

/// Builds the adapter for a provider on first use.
pub trait AdapterFactory: Send + Sync + 'static {
    fn create(&self, provider: CloudProvider) -> anyhow::Result<Arc<dyn CloudAdapter>>;
}

/// Factory for the built-in AWS, GCP and Azure adapters.
#[derive(Debug, Default)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, provider: CloudProvider) -> anyhow::Result<Arc<dyn CloudAdapter>> {
        let adapter: Arc<dyn CloudAdapter> = match provider {
            CloudProvider::Aws => Arc::new(AwsAdapter::new()),
            CloudProvider::Gcp => Arc::new(GcpAdapter::new()?),
            CloudProvider::Azure => Arc::new(AzureAdapter::new()?),
        };
        Ok(adapter)
    }
}

/// Entry point for uploads and presigned URLs.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct UploadManager {
    /// Defaults applied when a call leaves provider or credentials out.
    global: RwLock<GlobalUploadConfig>,
    /// One adapter per provider, created on first use.
    adapters: Mutex<HashMap<CloudProvider, Arc<dyn CloudAdapter>>>,
    factory: Box<dyn AdapterFactory>,
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadManager {
    /// A manager using the built-in adapters and no global defaults.
    pub fn new() -> Self {
        Self::with_factory(DefaultAdapterFactory)
    }

    /// A manager whose adapters come from `factory`.
    pub fn with_factory(factory: impl AdapterFactory) -> Self {
        Self {
            global: RwLock::new(GlobalUploadConfig::default()),
            adapters: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Replace the global defaults. Cached adapters are kept.
    pub fn configure(&self, config: GlobalUploadConfig) {
        debug!(
            "Upload manager configured: default_provider={:?} credentials={:?}",
            config.default_provider,
            config.credentials.as_ref().map(|c| c.provider())
        );
        *self.global.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Snapshot of the current global defaults.
    pub fn global_config(&self) -> GlobalUploadConfig {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Upload `data` to the resolved provider.
    ///
    /// With `is_required` set, an empty buffer is rejected before any
    /// resolution happens.
    pub async fn upload_file(
        &self,
        data: UploadData,
        options: UploadOptions,
    ) -> AppResult<UploadResult> {
        if options.is_required && data.is_empty() {
            return Err(AppError::FileRequired);
        }

        let resolved = self.resolve(options)?;
        let provider = resolved.provider;
        let adapter = self.adapter(provider)?;
        let len = data.len_hint();

        let result = adapter.upload_file(data, resolved).await;

        record_operation(OP_UPLOAD, provider, &result);
        if let (Ok(_), Some(len)) = (&result, len) {
            record_bytes_uploaded(provider, len);
        }
        result.map_err(AppError::from)
    }

    /// Produce a time-limited write URL from the resolved provider.
    pub async fn generate_presigned_url(&self, options: PresignOptions) -> AppResult<PresignedUrl> {
        let resolved = self.resolve(options)?;
        let provider = resolved.provider;
        let adapter = self.adapter(provider)?;

        let result = adapter.generate_presigned_url(resolved).await;

        record_operation(OP_PRESIGN, provider, &result);
        result.map_err(AppError::from)
    }

    /// Fill in provider and credentials from the global defaults and check
    /// that they agree.
    fn resolve<T: RequestOptions>(&self, options: T) -> AppResult<ResolvedOptions<T>> {
        let global = self.global_config();

        let provider = options
            .provider()
            .or(global.default_provider)
            .ok_or(AppError::ProviderNotSpecified)?;

        let credentials = options
            .credentials()
            .cloned()
            .or(global.credentials)
            .ok_or(AppError::CredentialsNotSpecified { provider })?;

        if credentials.provider() != provider {
            return Err(AppError::MismatchedCredentials {
                credentials: credentials.provider(),
                resolved: provider,
            });
        }

        debug!(
            "Resolved options: provider={} bucket={:?} key={}",
            provider,
            options.bucket(),
            options.key()
        );

        Ok(ResolvedOptions {
            provider,
            credentials,
            options,
        })
    }

    /// Cached adapter for `provider`, built under the cache lock so each
    /// provider's adapter is constructed at most once.
    fn adapter(&self, provider: CloudProvider) -> AppResult<Arc<dyn CloudAdapter>> {
        let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(adapter) = adapters.get(&provider) {
            return Ok(Arc::clone(adapter));
        }

        debug!("Creating {} adapter", provider);
        let adapter = self.factory.create(provider)?;
        adapters.insert(provider, Arc::clone(&adapter));
        Ok(adapter)
    }
}

// -- Tests --------------------------------------------------------------------
