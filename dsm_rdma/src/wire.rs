//! Transaction trailer encoding.
//!
//! Every message carries a 48-bit trailer `copyset:16 | version:16 | txid:16`,
//! laid out little-endian. It is split across two places:
//!
//! ```text
//! immediate data (32 bits):  copyset | version << 16
//! data segment:              [payload ...][txid: u16 LE]
//! ```
//!
//! so a message of `len` payload bytes occupies `len + TAIL_SIZE` bytes of
//! the registered send buffer, and the receiver finds the txid at
//! `byte_len - TAIL_SIZE`.

use std::fmt;

/// Total trailer size in bytes.
pub const TRAILER_SIZE: usize = 6;

/// Trailer bytes appended after the payload.
pub const TAIL_SIZE: usize = TRAILER_SIZE - IMM_SIZE;

/// Trailer bytes carried in the immediate-data field.
pub const IMM_SIZE: usize = 4;

/// Transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub u16);

impl TxId {
    /// Wildcard: "any pending message" on receive, "no particular target"
    /// on send.
    pub const ANY: TxId = TxId(u16::MAX);

    #[inline]
    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// Whether a receiver waiting for `self` accepts a message tagged `got`.
    ///
    /// A message tagged with the wildcard only satisfies a wildcard receive.
    #[inline]
    pub fn accepts(self, got: TxId) -> bool {
        self.is_any() || self == got
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("TxId(ANY)")
        } else {
            write!(f, "TxId({:#06x})", self.0)
        }
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Per-message transaction metadata.
///
/// `copyset` and `version` are opaque to the transport; the DSM layer uses
/// them for page invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub copyset: u16,
    pub version: u16,
    pub txid: TxId,
}

impl Default for Trailer {
    fn default() -> Self {
        Self {
            copyset: 0,
            version: 0,
            txid: TxId::ANY,
        }
    }
}

impl Trailer {
    pub fn new(copyset: u16, version: u16, txid: TxId) -> Self {
        Self {
            copyset,
            version,
            txid,
        }
    }

    /// First 32 bits of the trailer, for the immediate-data field.
    #[inline]
    pub fn imm(&self) -> u32 {
        self.copyset as u32 | (self.version as u32) << 16
    }

    /// Last 16 bits of the trailer, appended after the payload.
    #[inline]
    pub fn tail(&self) -> [u8; TAIL_SIZE] {
        self.txid.0.to_le_bytes()
    }

    /// Reassemble a trailer from its two halves.
    #[inline]
    pub fn decode(imm: u32, tail: [u8; TAIL_SIZE]) -> Self {
        Self {
            copyset: imm as u16,
            version: (imm >> 16) as u16,
            txid: TxId(u16::from_le_bytes(tail)),
        }
    }

    /// The full 6-byte little-endian trailer.
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[..IMM_SIZE].copy_from_slice(&self.imm().to_le_bytes());
        out[IMM_SIZE..].copy_from_slice(&self.tail());
        out
    }
}

/// Write `payload` followed by the trailer tail into `buf`.
///
/// Returns the number of bytes the data segment occupies, or `None` if
/// `buf` is too short.
#[inline]
pub fn encode_message(buf: &mut [u8], payload: &[u8], trailer: &Trailer) -> Option<usize> {
    let total = payload.len() + TAIL_SIZE;
    if buf.len() < total {
        return None;
    }
    buf[..payload.len()].copy_from_slice(payload);
    buf[payload.len()..total].copy_from_slice(&trailer.tail());
    Some(total)
}

/// Split a received data segment of `byte_len` bytes into payload length
/// and trailer.
///
/// Returns `None` if the segment is shorter than the tail or longer than
/// `buf`.
#[inline]
pub fn decode_message(buf: &[u8], byte_len: usize, imm: u32) -> Option<(usize, Trailer)> {
    let payload_len = byte_len.checked_sub(TAIL_SIZE)?;
    let tail = buf.get(payload_len..byte_len)?;
    let tail = [tail[0], tail[1]];
    Some((payload_len, Trailer::decode(imm, tail)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_is_all_ones() {
        assert_eq!(TxId::ANY.0, 0xFFFF);
        assert!(TxId::ANY.is_any());
        assert!(!TxId(0xFF).is_any());
    }

    #[test]
    fn test_accepts() {
        assert!(TxId::ANY.accepts(TxId(3)));
        assert!(TxId::ANY.accepts(TxId::ANY));
        assert!(TxId(3).accepts(TxId(3)));
        assert!(!TxId(3).accepts(TxId(4)));
        assert!(!TxId(3).accepts(TxId::ANY));
    }

    #[test]
    fn test_imm_layout() {
        let trailer = Trailer::new(0x1234, 0xABCD, TxId(7));
        assert_eq!(trailer.imm(), 0xABCD_1234);
        assert_eq!(trailer.tail(), [7, 0]);
        assert_eq!(trailer.to_bytes(), [0x34, 0x12, 0xCD, 0xAB, 7, 0]);
    }

    #[test]
    fn test_encode_message_appends_tail() {
        let mut buf = [0u8; 8];
        let trailer = Trailer::new(1, 2, TxId(0x0102));
        let len = encode_message(&mut buf, &[0xDE, 0xAD, 0xBE, 0xEF], &trailer).unwrap();
        assert_eq!(len, 6);
        assert_eq!(&buf[..6], &[0xDE, 0xAD, 0xBE, 0xEF, 0x02, 0x01]);
    }

    #[test]
    fn test_encode_message_too_long() {
        let mut buf = [0u8; 5];
        assert!(encode_message(&mut buf, &[0u8; 4], &Trailer::default()).is_none());
        assert!(encode_message(&mut buf, &[0u8; 3], &Trailer::default()).is_some());
    }

    #[test]
    fn test_decode_message_rejects_short_segment() {
        let buf = [0u8; 16];
        assert!(decode_message(&buf, 1, 0).is_none());
        assert!(decode_message(&buf, 17, 0).is_none());
        let (len, trailer) = decode_message(&buf, 2, 0).unwrap();
        assert_eq!(len, 0);
        assert_eq!(trailer.txid, TxId(0));
    }

    proptest! {
        /// The split encoding is exactly the little-endian 48-bit trailer.
        #[test]
        fn prop_split_matches_le_bytes(copyset: u16, version: u16, txid: u16) {
            let trailer = Trailer::new(copyset, version, TxId(txid));
            let bytes = trailer.to_bytes();
            let wide = copyset as u64 | (version as u64) << 16 | (txid as u64) << 32;
            prop_assert_eq!(&bytes[..], &wide.to_le_bytes()[..TRAILER_SIZE]);
        }

        #[test]
        fn prop_message_survives_buffer(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            copyset: u16,
            version: u16,
            txid: u16,
        ) {
            let trailer = Trailer::new(copyset, version, TxId(txid));
            let mut buf = [0u8; 66];
            let len = encode_message(&mut buf, &payload, &trailer).unwrap();
            let (payload_len, decoded) = decode_message(&buf, len, trailer.imm()).unwrap();
            prop_assert_eq!(payload_len, payload.len());
            prop_assert_eq!(&buf[..payload_len], &payload[..]);
            prop_assert_eq!(decoded, trailer);
        }
    }
}
