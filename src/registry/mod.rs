//! Container registries: reference parsing, authentication, image push and pull

pub mod auth;
pub mod blob;
pub mod client;
pub mod reference;
pub mod uploader;

pub use auth::{AccessScope, Credentials, RegistryAuth};
pub use blob::LayerCompression;
pub use client::{RegistryClient, RegistryClientBuilder};
pub use reference::ImageReference;
pub use uploader::{ImageDestination, RegistryUploader};
