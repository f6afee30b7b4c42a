//! Bounds-checked cursor over a reassembly buffer.
//!
//! Every fixed-size read checks the remaining length first and reports
//! [`ReadError::Incomplete`] instead of indexing past the end, so decoders
//! can use `?` and turn a short buffer into "wait for more data".

/// Why a read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Not enough bytes yet.
    Incomplete,
    /// The bytes cannot belong to this protocol.
    Corrupt(&'static str),
}

pub type ReadResult<T> = Result<T, ReadError>;

#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos` (clamped to the end).
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos: pos.min(data.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail with `Incomplete` unless `n` more bytes are available.
    #[inline]
    pub fn need(&self, n: usize) -> ReadResult<()> {
        if self.remaining() < n {
            Err(ReadError::Incomplete)
        } else {
            Ok(())
        }
    }

    pub fn peek_u8(&self) -> ReadResult<u8> {
        self.need(1)?;
        Ok(self.data[self.pos])
    }

    pub fn u8(&mut self) -> ReadResult<u8> {
        let v = self.peek_u8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> ReadResult<&'a [u8]> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> ReadResult<()> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u16_le(&mut self) -> ReadResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u16_be(&mut self) -> ReadResult<u16> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn i16_be(&mut self) -> ReadResult<i16> {
        self.array().map(i16::from_be_bytes)
    }

    pub fn u24_le(&mut self) -> ReadResult<u32> {
        let b: [u8; 3] = self.array()?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32_le(&mut self) -> ReadResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u32_be(&mut self) -> ReadResult<u32> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn i32_be(&mut self) -> ReadResult<i32> {
        self.array().map(i32::from_be_bytes)
    }

    pub fn u64_le(&mut self) -> ReadResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64_be(&mut self) -> ReadResult<i64> {
        self.array().map(i64::from_be_bytes)
    }

    pub fn f64_be(&mut self) -> ReadResult<f64> {
        self.array().map(|b| f64::from_bits(u64::from_be_bytes(b)))
    }

    /// NUL-terminated string, without the terminator.
    pub fn cstring(&mut self) -> ReadResult<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ReadError::Incomplete)?;
        self.pos += nul + 1;
        Ok(&rest[..nul])
    }

    /// Line terminated by CRLF, without the terminator.
    pub fn line(&mut self) -> ReadResult<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = find_crlf(rest).ok_or(ReadError::Incomplete)?;
        self.pos += end + 2;
        Ok(&rest[..end])
    }
}

/// Position of the first `\r\n` in `data`.
pub fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
