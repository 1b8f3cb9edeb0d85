//! 🫁 Codecs: squishing and unsquishing the byte stream around the chunked core.
//!
//! The reader and writer never look inside the bytes. This module sits next to them:
//! it sniffs an object's first bytes to tell gzip from zlib from plain, and it wraps
//! `flate2`'s push-style (`Write`) encoders and decoders behind one small enum each,
//! so the transfers can feed whatever chunk just arrived and drain what came out.
//!
//! 🧠 Knowledge graph:
//! - `CompressionType` is what `Transport::check_compression_type` returns.
//! - `Decompressor<Vec<u8>>` is used by downloads, `Compressor<Vec<u8>>` by uploads.
//! - "Deflate" here means zlib-framed deflate (RFC 1950), which is what a `0x78`
//!   first byte announces. Raw deflate has no magic and is indistinguishable from noise.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder};
use serde::Serialize;

/// 🔍 How many leading bytes we need to tell the formats apart.
pub const MAGIC_BYTES_NUM: u64 = 2;

/// 📦 What the object's first bytes say about its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    Plain,
    Gzip,
    Deflate,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let the_name = match self {
            CompressionType::Plain => "plain",
            CompressionType::Gzip => "gzip",
            CompressionType::Deflate => "deflate",
        };
        f.write_str(the_name)
    }
}

/// 🔍 Classifies an object from its leading bytes. Anything shorter than
/// [`MAGIC_BYTES_NUM`] is plain; there is nothing to decompress in one byte.
pub fn sniff_compression(prefix: &[u8]) -> CompressionType {
    match prefix {
        [0x1f, 0x8b, ..] => CompressionType::Gzip,
        // -- zlib with a 32K window and no preset dictionary: one FLG byte per compression level
        [0x78, 0x01 | 0x5e | 0x9c | 0xda, ..] => CompressionType::Deflate,
        _ => CompressionType::Plain,
    }
}

/// 🫁 Push-style decompressor. Write compressed bytes in, read plain bytes out of the inner writer.
pub enum Decompressor<W: Write> {
    Plain(W),
    Gzip(GzDecoder<W>),
    Deflate(ZlibDecoder<W>),
}

impl<W: Write> Decompressor<W> {
    pub fn new(kind: CompressionType, inner: W) -> Self {
        match kind {
            CompressionType::Plain => Decompressor::Plain(inner),
            CompressionType::Gzip => Decompressor::Gzip(GzDecoder::new(inner)),
            CompressionType::Deflate => Decompressor::Deflate(ZlibDecoder::new(inner)),
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Decompressor::Plain(inner) => inner.write_all(bytes),
            Decompressor::Gzip(decoder) => decoder.write_all(bytes),
            Decompressor::Deflate(decoder) => decoder.write_all(bytes),
        }
    }

    /// The inner writer, holding whatever has been decoded so far.
    pub fn get_mut(&mut self) -> &mut W {
        match self {
            Decompressor::Plain(inner) => inner,
            Decompressor::Gzip(decoder) => decoder.get_mut(),
            Decompressor::Deflate(decoder) => decoder.get_mut(),
        }
    }

    /// Flushes the decoder's tail and hands back the inner writer.
    /// A truncated stream fails here, not earlier.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Decompressor::Plain(inner) => Ok(inner),
            Decompressor::Gzip(decoder) => decoder.finish(),
            Decompressor::Deflate(decoder) => decoder.finish(),
        }
    }
}

/// 🗜️ Push-style compressor for uploads. Only gzip is offered on the way out.
pub enum Compressor<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(gzip: bool, inner: W) -> Self {
        if gzip {
            Compressor::Gzip(GzEncoder::new(inner, Compression::default()))
        } else {
            Compressor::Plain(inner)
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Compressor::Plain(inner) => inner.write_all(bytes),
            Compressor::Gzip(encoder) => encoder.write_all(bytes),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            Compressor::Plain(inner) => inner,
            Compressor::Gzip(encoder) => encoder.get_mut(),
        }
    }

    /// Writes the gzip trailer and hands back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Plain(inner) => Ok(inner),
            Compressor::Gzip(encoder) => encoder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;

    #[test]
    fn the_one_where_magic_bytes_give_the_game_away() {
        assert_eq!(sniff_compression(&[0x1f, 0x8b, 0x08]), CompressionType::Gzip);
        assert_eq!(sniff_compression(&[0x78, 0x9c]), CompressionType::Deflate);
        assert_eq!(sniff_compression(&[0x78, 0x01]), CompressionType::Deflate);
        assert_eq!(sniff_compression(&[0x78, 0xda]), CompressionType::Deflate);
        // -- 'x' followed by a space is just text that happens to start with x
        assert_eq!(sniff_compression(b"x marks the spot"), CompressionType::Plain);
        assert_eq!(sniff_compression(b"id,name\n"), CompressionType::Plain);
        assert_eq!(sniff_compression(&[0x1f]), CompressionType::Plain);
        assert_eq!(sniff_compression(&[]), CompressionType::Plain);
    }

    #[test]
    fn the_one_where_text_starting_with_x_is_not_mistaken_for_zlib() {
        // -- 0x78 0x20 passes the zlib header checksum but sets the preset-dictionary bit
        assert_eq!(sniff_compression(b"x "), CompressionType::Plain);
        assert_eq!(sniff_compression(b"x y z\n"), CompressionType::Plain);
        // -- 0x78 0xbb also checks out mod 31, and nothing we can inflate writes it
        assert_eq!(sniff_compression(&[0x78, 0xbb]), CompressionType::Plain);
    }

    #[test]
    fn the_one_where_gzip_survives_being_fed_in_crumbs() {
        let the_original: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();

        let mut compressor = Compressor::new(true, Vec::new());
        for crumb in the_original.chunks(777) {
            compressor.write_all(crumb).expect("💀 gzip refused a crumb");
        }
        let the_squished = compressor.finish().expect("💀 gzip trailer refused");
        assert_eq!(sniff_compression(&the_squished), CompressionType::Gzip);

        let mut decompressor = Decompressor::new(CompressionType::Gzip, Vec::new());
        let mut the_restored = Vec::new();
        for crumb in the_squished.chunks(13) {
            decompressor.write_all(crumb).expect("💀 gunzip choked");
            the_restored.append(decompressor.get_mut());
        }
        the_restored.extend(decompressor.finish().expect("💀 gunzip tail"));
        assert_eq!(the_restored, the_original);
    }

    #[test]
    fn the_one_where_zlib_streams_decode_as_deflate() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"hello deflate world").expect("💀 zlib write");
        let the_squished = encoder.finish().expect("💀 zlib finish");
        assert_eq!(sniff_compression(&the_squished), CompressionType::Deflate);

        let mut decompressor = Decompressor::new(CompressionType::Deflate, Vec::new());
        decompressor.write_all(&the_squished).expect("💀 inflate");
        assert_eq!(decompressor.finish().expect("💀 inflate tail"), b"hello deflate world");
    }

    #[test]
    fn the_one_where_a_truncated_gzip_is_caught_at_the_finish_line() {
        let mut compressor = Compressor::new(true, Vec::new());
        compressor.write_all(&[42u8; 4096]).expect("💀 gzip write");
        let mut the_squished = compressor.finish().expect("💀 gzip finish");
        the_squished.truncate(the_squished.len() / 2);

        let mut decompressor = Decompressor::new(CompressionType::Gzip, Vec::new());
        let _ = decompressor.write_all(&the_squished);
        assert!(decompressor.finish().is_err());
    }
}
