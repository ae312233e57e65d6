//! rollcall-extract — Face extraction and image annotation.
//!
//! Runs an external detector/embedder as a child process and exposes it as a
//! [`rollcall_core::EmbeddingProvider`], and draws recognition boxes on images.

pub mod annotate;
pub mod extractor;

pub use annotate::{annotate_file, FaceMark};
pub use extractor::{CommandExtractor, ExtractError, ExtractorConfig};
