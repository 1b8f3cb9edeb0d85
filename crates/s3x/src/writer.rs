//! 📝 The write side: a buffered writer and the short-lived tasks that ship its parts.

pub(crate) mod multipart_writer;
pub(crate) mod part_uploader;

pub use multipart_writer::{BufferedMultipartWriter, WriterParams};
