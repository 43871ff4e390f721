//! FLV container reading
//!
//! [`FlvTagReader`] turns an HTTP-FLV byte stream into [`FlvTag`]s, tolerating
//! arbitrary chunking and streams joined without the file header.

pub mod error;
pub mod framing;
pub mod header;
pub mod reader;
pub mod tag;

pub use error::FlvError;
pub use header::FlvHeader;
pub use reader::FlvTagReader;
pub use tag::{FlvTag, FlvTagType};
