//! pcap / pcapng reading over any `Read` source.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use super::decompress::{Compression, DecompressReader};
use crate::error::{CaptureError, Error, Result};

/// Buffer size for pcap_parser readers (256KB).
const BUFFER_SIZE: usize = 262144;

/// Container format of a capture file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Classic pcap, either byte order, micro- or nanosecond timestamps
    Legacy,
    PcapNg,
}

impl CaptureFormat {
    /// Detect the format from the first four (decompressed) bytes.
    pub fn detect(data: &[u8]) -> Result<Self> {
        let Some(magic) = data.get(..4) else {
            return Err(invalid("file too short for a capture header"));
        };
        let magic = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);
        match magic {
            0xa1b2c3d4 | 0xd4c3b2a1 | 0xa1b23c4d | 0x4d3cb2a1 => Ok(CaptureFormat::Legacy),
            0x0a0d0d0a => Ok(CaptureFormat::PcapNg),
            _ => Err(invalid(format!("unknown capture magic: 0x{:08x}", magic))),
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::Capture(CaptureError::InvalidFormat {
        reason: reason.into(),
    })
}

/// One captured frame, borrowed from the reader's buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    pub frame_number: u64,
    pub timestamp_us: i64,
    pub link_type: u32,
    pub data: &'a [u8],
}

type Stream<R> = BufReader<DecompressReader<BufReader<R>>>;

enum ReaderInner<R: Read> {
    Legacy(LegacyPcapReader<Stream<R>>),
    Ng(PcapNGReader<Stream<R>>),
}

/// Reader for pcap and pcapng captures, gzip-compressed or not.
///
/// Frames are handed to a callback with data borrowed from the parser's
/// buffer, so nothing is copied between the file and the engine.
pub struct CaptureReader<R: Read> {
    inner: ReaderInner<R>,
    compression: Compression,
    format: CaptureFormat,
    frame_number: u64,
    link_type: u32,
    nanosecond: bool,
}

impl CaptureReader<File> {
    /// Open a capture file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| {
            Error::Capture(CaptureError::FileNotFound {
                path: path.display().to_string(),
            })
        })?;
        Self::new(file)
    }
}

impl<R: Read> CaptureReader<R> {
    /// Wrap a byte source, detecting compression and container format.
    pub fn new(source: R) -> Result<Self> {
        let mut source = BufReader::new(source);
        let compression = Compression::detect(source.fill_buf()?);

        let mut stream = BufReader::with_capacity(
            BUFFER_SIZE,
            DecompressReader::new(source, compression),
        );
        let format = CaptureFormat::detect(stream.fill_buf()?)?;

        let inner = match format {
            CaptureFormat::Legacy => ReaderInner::Legacy(
                LegacyPcapReader::new(BUFFER_SIZE, stream)
                    .map_err(|e| invalid(format!("failed to parse pcap header: {}", e)))?,
            ),
            CaptureFormat::PcapNg => ReaderInner::Ng(
                PcapNGReader::new(BUFFER_SIZE, stream)
                    .map_err(|e| invalid(format!("failed to parse pcapng header: {}", e)))?,
            ),
        };
        tracing::debug!(%compression, ?format, "capture opened");

        Ok(Self {
            inner,
            compression,
            format,
            frame_number: 0,
            link_type: 1, // Ethernet until a header says otherwise
            nanosecond: false,
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Link type of the most recent interface header (1 = Ethernet).
    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    /// Frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Feed every remaining frame to `f`, stopping at the first error it
    /// returns. A capture cut off mid-record ends the loop with a warning.
    ///
    /// Returns the number of frames processed.
    pub fn process_packets<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(PacketRef<'_>) -> Result<()>,
    {
        let start = self.frame_number;
        match &mut self.inner {
            ReaderInner::Legacy(reader) => loop {
                match reader.next() {
                    Ok((offset, block)) => {
                        match block {
                            PcapBlockOwned::LegacyHeader(header) => {
                                self.link_type = header.network.0 as u32;
                                self.nanosecond = header.is_nanosecond_precision();
                            }
                            PcapBlockOwned::Legacy(packet) => {
                                self.frame_number += 1;
                                let fraction = if self.nanosecond {
                                    packet.ts_usec as i64 / 1000
                                } else {
                                    packet.ts_usec as i64
                                };
                                f(PacketRef {
                                    frame_number: self.frame_number,
                                    timestamp_us: packet.ts_sec as i64 * 1_000_000 + fraction,
                                    link_type: self.link_type,
                                    data: packet.data,
                                })?;
                            }
                            _ => {}
                        }
                        reader.consume(offset);
                    }
                    Err(PcapError::Eof) => break,
                    Err(PcapError::UnexpectedEof) => {
                        tracing::warn!(frame = self.frame_number, "capture truncated mid-record");
                        break;
                    }
                    Err(PcapError::Incomplete(_)) => {
                        reader
                            .refill()
                            .map_err(|e| invalid(format!("pcap refill error: {}", e)))?;
                    }
                    Err(e) => return Err(invalid(format!("pcap parse error: {}", e))),
                }
            },
            ReaderInner::Ng(reader) => loop {
                match reader.next() {
                    Ok((offset, block)) => {
                        use pcap_parser::pcapng::Block;

                        if let PcapBlockOwned::NG(block) = block {
                            match block {
                                Block::InterfaceDescription(idb) => {
                                    self.link_type = idb.linktype.0 as u32;
                                }
                                Block::EnhancedPacket(epb) => {
                                    self.frame_number += 1;
                                    // Default interface resolution: microseconds
                                    let ts = ((epb.ts_high as i64) << 32) | (epb.ts_low as i64);
                                    f(PacketRef {
                                        frame_number: self.frame_number,
                                        timestamp_us: ts,
                                        link_type: self.link_type,
                                        data: epb.data,
                                    })?;
                                }
                                Block::SimplePacket(spb) => {
                                    self.frame_number += 1;
                                    f(PacketRef {
                                        frame_number: self.frame_number,
                                        timestamp_us: 0,
                                        link_type: self.link_type,
                                        data: spb.data,
                                    })?;
                                }
                                _ => {}
                            }
                        }
                        reader.consume(offset);
                    }
                    Err(PcapError::Eof) => break,
                    Err(PcapError::UnexpectedEof) => {
                        tracing::warn!(frame = self.frame_number, "capture truncated mid-block");
                        break;
                    }
                    Err(PcapError::Incomplete(_)) => {
                        reader
                            .refill()
                            .map_err(|e| invalid(format!("pcapng refill error: {}", e)))?;
                    }
                    Err(e) => return Err(invalid(format!("pcapng parse error: {}", e))),
                }
            },
        }
        Ok(self.frame_number - start)
    }
}
