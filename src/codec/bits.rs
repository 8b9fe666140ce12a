//! MSB-first bit packing.
//!
//! Packet headers are described as ordered lists of fixed-width fields.
//! `BitWriter` appends fields most-significant bit first and rejects values
//! wider than their declared width; `BitReader` consumes them in the same
//! order and reports truncation or non-zero reserved bits.

use crate::common::FormatError;

/// Declares a wire opcode enum with checked raw conversions.
///
/// `from_raw` fails with `FormatError::UnknownOpcode` naming the protocol
/// and field, so decoders never fall through on an unrecognised value.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($proto:expr, $field:literal) {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the raw wire encoding.
            pub fn to_raw(self) -> u64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            /// Decodes a raw wire value.
            pub fn from_raw(raw: u64) -> Result<Self, $crate::common::FormatError> {
                match raw {
                    $(v if v == $value => Ok($name::$variant),)+
                    _ => Err($crate::common::FormatError::UnknownOpcode {
                        protocol: $proto,
                        field: $field,
                        value: raw,
                    }),
                }
            }
        }
    };
}

pub(crate) use wire_enum;

/// Appends fixed-width fields to a byte buffer, MSB first.
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` as a `width`-bit field.
    ///
    /// # Arguments
    ///
    /// * `field` - Field name reported on overflow
    /// * `width` - Declared width in bits (1..=64)
    /// * `value` - Field value; must fit in `width` bits
    pub fn put(&mut self, field: &'static str, width: u32, value: u64) -> Result<(), FormatError> {
        if width < 64 && value >> width != 0 {
            return Err(FormatError::FieldOverflow {
                field,
                width,
                value,
            });
        }
        for i in (0..width).rev() {
            let byte_idx = self.bit_len / 8;
            if byte_idx == self.buf.len() {
                self.buf.push(0);
            }
            if (value >> i) & 1 == 1 {
                self.buf[byte_idx] |= 0x80 >> (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
        Ok(())
    }

    /// Appends a single-bit flag.
    pub fn put_flag(&mut self, field: &'static str, flag: bool) -> Result<(), FormatError> {
        self.put(field, 1, flag as u64)
    }

    /// Appends `width` zero bits.
    pub fn reserved(&mut self, width: u32) {
        for _ in 0..width {
            if self.bit_len / 8 == self.buf.len() {
                self.buf.push(0);
            }
            self.bit_len += 1;
        }
    }

    /// Appends raw bytes. The writer must be byte aligned.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.bit_len % 8, 0, "put_bytes on unaligned writer");
        self.buf.extend_from_slice(bytes);
        self.bit_len += bytes.len() * 8;
    }

    /// Returns the number of whole bytes written so far.
    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }

    /// Consumes the writer and returns the packed bytes.
    pub fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.bit_len % 8, 0, "header is not byte aligned");
        self.buf
    }
}

/// Consumes fixed-width fields from a byte slice, MSB first.
#[derive(Debug)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// Reads a `width`-bit field.
    pub fn take(&mut self, width: u32) -> Result<u64, FormatError> {
        let end = self.bit_pos + width as usize;
        if end > self.buf.len() * 8 {
            return Err(FormatError::Truncated {
                needed: end.div_ceil(8),
                available: self.buf.len(),
            });
        }
        let mut value = 0u64;
        for _ in 0..width {
            let byte = self.buf[self.bit_pos / 8];
            let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
            value = (value << 1) | bit as u64;
            self.bit_pos += 1;
        }
        Ok(value)
    }

    /// Reads a single-bit flag.
    pub fn take_flag(&mut self) -> Result<bool, FormatError> {
        Ok(self.take(1)? == 1)
    }

    /// Reads a reserved field and requires it to be zero.
    pub fn reserved(&mut self, field: &'static str, width: u32) -> Result<(), FormatError> {
        let value = self.take(width)?;
        if value != 0 {
            return Err(FormatError::ReservedNonZero { field, value });
        }
        Ok(())
    }

    /// Reads `len` raw bytes. The reader must be byte aligned.
    pub fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        debug_assert_eq!(self.bit_pos % 8, 0, "take_bytes on unaligned reader");
        let start = self.bit_pos / 8;
        let end = start + len;
        if end > self.buf.len() {
            return Err(FormatError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        self.bit_pos = end * 8;
        Ok(&self.buf[start..end])
    }

    /// Returns the number of unread whole bytes.
    pub fn remaining_bytes(&self) -> usize {
        self.buf.len() - self.bit_pos.div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_pack_msb_first() {
        let mut w = BitWriter::new();
        w.put("a", 4, 0xa).unwrap();
        w.put("b", 12, 0x123).unwrap();
        assert_eq!(w.finish(), vec![0xa1, 0x23]);
    }

    #[test]
    fn test_overflow_names_field() {
        let mut w = BitWriter::new();
        let err = w.put("tag", 10, 0x400).unwrap_err();
        assert_eq!(
            err,
            FormatError::FieldOverflow {
                field: "tag",
                width: 10,
                value: 0x400
            }
        );
    }

    #[test]
    fn test_reader_detects_reserved_bits() {
        let mut r = BitReader::new(&[0x0f]);
        assert_eq!(r.take(4).unwrap(), 0);
        assert!(matches!(
            r.reserved("rsvd", 4),
            Err(FormatError::ReservedNonZero { field: "rsvd", .. })
        ));
    }

    #[test]
    fn test_reader_truncation() {
        let mut r = BitReader::new(&[0xff]);
        assert!(matches!(r.take(9), Err(FormatError::Truncated { .. })));
    }
}
