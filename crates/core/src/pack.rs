//! Compact variable-width encoding shared by every on-disk record.
//!
//! Unsigned integers are written little-endian in base 128: seven payload bits
//! per byte, with the top bit set on every byte except the last. The final
//! field of a record may instead use [`pack_uint_last`], which drops the
//! continuation bits and relies on the record length to find the end.
//!
//! Decoders take a `&mut &[u8]` cursor and advance it past what they consume.
//! They return `None` on truncation or overflow, leaving the cursor in an
//! unspecified position; callers turn that into a format error.

/// Append `value` as a base-128 varint.
pub fn pack_uint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a base-128 varint.
pub fn unpack_uint(cursor: &mut &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = cursor.split_first()?;
        *cursor = rest;
        let payload = u64::from(byte & 0x7f);
        if shift == 63 && payload > 1 {
            return None;
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

/// Decode a varint which must fit in a `u32`.
pub fn unpack_u32(cursor: &mut &[u8]) -> Option<u32> {
    unpack_uint(cursor).and_then(|v| u32::try_from(v).ok())
}

/// Append `value` as the last field of a record: minimal little-endian bytes,
/// no terminator. Zero encodes as no bytes at all.
pub fn pack_uint_last(buf: &mut Vec<u8>, mut value: u64) {
    while value != 0 {
        buf.push(value as u8);
        value >>= 8;
    }
}

/// Decode a value written by [`pack_uint_last`], consuming the whole cursor.
pub fn unpack_uint_last(cursor: &mut &[u8]) -> Option<u64> {
    if cursor.len() > 8 {
        return None;
    }
    let value = cursor
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    *cursor = &[];
    Some(value)
}

/// Append a length-prefixed byte string.
pub fn pack_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    pack_uint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Decode a length-prefixed byte string.
pub fn unpack_string(cursor: &mut &[u8]) -> Option<Vec<u8>> {
    let len = usize::try_from(unpack_uint(cursor)?).ok()?;
    if len > cursor.len() {
        return None;
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Some(head.to_vec())
}

/// Take exactly `n` raw bytes.
pub fn take_bytes<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if n > cursor.len() {
        return None;
    }
    let (head, rest) = cursor.split_at(n);
    *cursor = rest;
    Some(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_values_take_one_byte() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 0);
        pack_uint(&mut buf, 127);
        assert_eq!(buf, vec![0x00, 0x7f]);
    }

    #[test]
    fn test_multibyte_layout_is_little_endian() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 300);
        // 300 = 0b10_0101100 -> low 7 bits first with continuation
        assert_eq!(buf, vec![0xac, 0x02]);
    }

    #[test]
    fn test_truncated_varint_fails() {
        let mut cursor: &[u8] = &[0x80, 0x80];
        assert_eq!(unpack_uint(&mut cursor), None);
    }

    #[test]
    fn test_overlong_varint_fails() {
        let mut cursor: &[u8] = &[0xff; 11];
        assert_eq!(unpack_uint(&mut cursor), None);
    }

    #[test]
    fn test_u64_max_roundtrip() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(unpack_uint(&mut buf.as_slice()), Some(u64::MAX));
    }

    #[test]
    fn test_unpack_u32_rejects_wide_values() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, u64::from(u32::MAX) + 1);
        assert_eq!(unpack_u32(&mut buf.as_slice()), None);
    }

    #[test]
    fn test_uint_last_zero_is_empty() {
        let mut buf = Vec::new();
        pack_uint_last(&mut buf, 0);
        assert!(buf.is_empty());
        assert_eq!(unpack_uint_last(&mut buf.as_slice()), Some(0));
    }

    #[test]
    fn test_string_length_overrun_fails() {
        let mut buf = Vec::new();
        pack_uint(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        assert_eq!(unpack_string(&mut buf.as_slice()), None);
    }

    proptest! {
        #[test]
        fn prop_uint_sequence_decodes_in_order(values in proptest::collection::vec(any::<u64>(), 0..16)) {
            let mut buf = Vec::new();
            for &v in &values {
                pack_uint(&mut buf, v);
            }
            let mut cursor = buf.as_slice();
            for &v in &values {
                prop_assert_eq!(unpack_uint(&mut cursor), Some(v));
            }
            prop_assert!(cursor.is_empty());
        }

        #[test]
        fn prop_uint_last_consumes_rest(v in any::<u64>()) {
            let mut buf = Vec::new();
            pack_uint_last(&mut buf, v);
            let mut cursor = buf.as_slice();
            prop_assert_eq!(unpack_uint_last(&mut cursor), Some(v));
            prop_assert!(cursor.is_empty());
        }
    }
}
