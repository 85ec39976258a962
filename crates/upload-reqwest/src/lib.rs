//! Reqwest HTTP backend for the filestore upload engine.
//!
//! This crate provides an [`rusty_filestore_upload::UploadService`]
//! implementation over HTTP: form-encoded calls against the multipart API
//! plus direct PUTs to the pre-signed storage destinations it issues.
//!
//! # Example
//!
//! ```ignore
//! use rusty_filestore_upload::{UploadRequest, Uploader};
//! use rusty_filestore_upload_reqwest::ReqwestUploadService;
//!
//! let service = ReqwestUploadService::new("https://upload.example.com")?;
//! let uploader = Uploader::new(service, "API_KEY");
//! let link = uploader
//!     .upload_file("movie.mp4", UploadRequest::new("movie.mp4", "video/mp4"))
//!     .await?;
//! ```

mod client;
mod error;

pub use client::ReqwestUploadService;
pub use error::HttpError;
