//! Cloud storage adapters.
//!
//! The [`adapter::CloudAdapter`] trait abstracts over where uploaded bytes
//! land.  Implementations talk to AWS S3, Google Cloud Storage and Azure
//! Blob Storage.

pub mod adapter;
pub mod aws;
pub mod azure;
pub mod gcp;
