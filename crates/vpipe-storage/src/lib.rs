//! Storage gateway for transcoding inputs and outputs.
//!
//! This crate provides:
//! - An S3-compatible client with multipart upload for large files
//! - The [`StorageGateway`] trait used by the worker
//! - A local-directory gateway for when no object store is configured

pub mod client;
pub mod error;
pub mod gateway;

pub use client::{S3Client, S3Config};
pub use error::{StorageError, StorageResult};
pub use gateway::{
    content_type_for, gateway_from_env, join_key, LocalGateway, S3Gateway, StorageGateway, UploadedObject,
};
