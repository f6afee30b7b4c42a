//! Transparent gzip decompression of capture files.

use std::io::{self, Read};

use flate2::read::GzDecoder;

/// Detected compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    /// Gzip (.gz)
    Gzip,
}

impl Compression {
    /// Detect compression format from magic bytes.
    pub fn detect(data: &[u8]) -> Self {
        match data {
            [0x1f, 0x8b, ..] => Compression::Gzip,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
        }
    }
}

/// Pass-through or decompressing reader, selected by [`Compression`].
pub enum DecompressReader<R: Read> {
    None(R),
    Gzip(GzDecoder<R>),
}

impl<R: Read> DecompressReader<R> {
    pub fn new(source: R, compression: Compression) -> Self {
        match compression {
            Compression::None => DecompressReader::None(source),
            Compression::Gzip => DecompressReader::Gzip(GzDecoder::new(source)),
        }
    }

    pub fn compression(&self) -> Compression {
        match self {
            DecompressReader::None(_) => Compression::None,
            DecompressReader::Gzip(_) => Compression::Gzip,
        }
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::None(r) => r.read(buf),
            DecompressReader::Gzip(r) => r.read(buf),
        }
    }
}
