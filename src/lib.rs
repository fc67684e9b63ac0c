//! Disk Image Importer Library
//!
//! Streams a virtual-machine disk image from a source into a container
//! registry as a single-layer OCI image, while computing checksums,
//! detecting the image format and reporting progress in the same pass.

pub mod cli;
pub mod digest;
pub mod error;
pub mod gate;
pub mod image;
pub mod importer;
pub mod logging;
pub mod monitoring;
pub mod registry;
pub mod source;

pub use error::{ImportError, Result};
pub use importer::{ImportOrchestrator, ImportRequest, ImportResult, RetryShell};
