//! Bounds-checked little-endian reader over a byte slice.
//!
//! Every read returns [`BinlogError::Decode`] with the failing offset
//! instead of panicking, so a truncated or hostile packet can never take
//! the process down.

use crate::error::BinlogError;

#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], BinlogError> {
        if n > self.remaining() {
            return Err(BinlogError::decode(
                self.pos,
                format!("need {n} bytes, {} left", self.remaining()),
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BinlogError> {
        self.bytes(n).map(|_| ())
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn u8(&mut self) -> Result<u8, BinlogError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, BinlogError> {
        Ok(self.u8()? as i8)
    }

    pub fn u16_le(&mut self) -> Result<u16, BinlogError> {
        Ok(self.uint_le(2)? as u16)
    }

    pub fn u24_le(&mut self) -> Result<u32, BinlogError> {
        Ok(self.uint_le(3)? as u32)
    }

    pub fn u32_le(&mut self) -> Result<u32, BinlogError> {
        Ok(self.uint_le(4)? as u32)
    }

    pub fn u48_le(&mut self) -> Result<u64, BinlogError> {
        self.uint_le(6)
    }

    pub fn u64_le(&mut self) -> Result<u64, BinlogError> {
        self.uint_le(8)
    }

    /// Unsigned little-endian integer of `n` (<= 8) bytes.
    pub fn uint_le(&mut self, n: usize) -> Result<u64, BinlogError> {
        let bytes = self.bytes(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Unsigned big-endian integer of `n` (<= 8) bytes.
    pub fn uint_be(&mut self, n: usize) -> Result<u64, BinlogError> {
        let bytes = self.bytes(n)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn f32_le(&mut self) -> Result<f32, BinlogError> {
        Ok(f32::from_bits(self.u32_le()?))
    }

    pub fn f64_le(&mut self) -> Result<f64, BinlogError> {
        Ok(f64::from_bits(self.u64_le()?))
    }

    /// Binlog packed integer (1, 3, 4 or 9 bytes). Also the client
    /// protocol's length-encoded integer, except that `0xFB` is rejected.
    pub fn packed_int(&mut self) -> Result<u64, BinlogError> {
        let at = self.pos;
        match self.u8()? {
            first @ 0..=250 => Ok(u64::from(first)),
            252 => self.uint_le(2),
            253 => self.uint_le(3),
            254 => self.uint_le(8),
            other => Err(BinlogError::decode(
                at,
                format!("invalid packed integer prefix 0x{other:02X}"),
            )),
        }
    }

    /// Length as `usize`, rejecting values larger than what is left.
    pub fn packed_len(&mut self) -> Result<usize, BinlogError> {
        let at = self.pos;
        let len = self.packed_int()?;
        if len > self.remaining() as u64 {
            return Err(BinlogError::decode(
                at,
                format!("length {len} exceeds remaining {}", self.remaining()),
            ));
        }
        Ok(len as usize)
    }

    /// NUL-terminated string; the terminator is consumed.
    pub fn nul_str(&mut self) -> Result<String, BinlogError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| BinlogError::decode(self.pos, "missing NUL terminator"))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    /// `n` bytes as a lossy UTF-8 string.
    pub fn str_n(&mut self, n: usize) -> Result<String, BinlogError> {
        Ok(String::from_utf8_lossy(self.bytes(n)?).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn reads_little_endian_widths() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.u16_le().unwrap(), 0x0201);
        assert_eq!(c.u24_le().unwrap(), 0x050403);
        assert_eq!(c.remaining(), 3);
        assert!(c.u32_le().is_err());
    }

    #[test]
    fn big_endian_read() {
        let mut c = ByteCursor::new(&[0x80, 0x00, 0x01]);
        assert_eq!(c.uint_be(3).unwrap(), 0x800001);
    }

    #[test]
    fn packed_int_forms() {
        assert_eq!(ByteCursor::new(&[250]).packed_int().unwrap(), 250);
        assert_eq!(ByteCursor::new(&[252, 0x34, 0x12]).packed_int().unwrap(), 0x1234);
        assert_eq!(
            ByteCursor::new(&[253, 0x01, 0x00, 0x01]).packed_int().unwrap(),
            0x010001
        );
        assert!(ByteCursor::new(&[251]).packed_int().is_err());
        assert!(ByteCursor::new(&[254, 1, 2]).packed_int().is_err());
    }

    #[test]
    fn packed_len_rejects_overrun() {
        let mut c = ByteCursor::new(&[5, b'a', b'b']);
        assert!(c.packed_len().is_err());
    }

    #[test]
    fn nul_str_consumes_terminator() {
        let mut c = ByteCursor::new(b"shop\0rest");
        assert_eq!(c.nul_str().unwrap(), "shop");
        assert_eq!(c.rest(), b"rest");
        assert!(ByteCursor::new(b"no-terminator").nul_str().is_err());
    }

    #[test]
    fn error_reports_offset() {
        let mut c = ByteCursor::new(&[1, 2]);
        c.u8().unwrap();
        match c.u32_le() {
            Err(BinlogError::Decode { offset, .. }) => assert_eq!(offset, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn arbitrary_input_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut c = ByteCursor::new(&data);
            let _ = c.packed_int();
            let _ = c.nul_str();
            let _ = c.packed_len();
            let _ = c.u64_le();
            let _ = c.bytes(7);
        }
    }
}
