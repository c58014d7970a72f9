//! Wire framing for a stored value: an 8-byte big-endian Lamport timestamp
//! prefix followed by the raw value bytes. Every local store keeps values
//! framed this way so a node can compare timestamps without separately
//! tracking them alongside the bytes it persists.

const TIMESTAMP_LEN: usize = 8;

/// Prefixes `value` with `timestamp` encoded as 8 bytes, big-endian.
pub fn encode(timestamp: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN + value.len());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Splits a framed value back into its timestamp and value. Returns
/// `None` if `bytes` is shorter than the timestamp prefix.
pub fn decode(bytes: &[u8]) -> Option<(u64, Vec<u8>)> {
    if bytes.len() < TIMESTAMP_LEN {
        return None;
    }
    let (ts_bytes, value) = bytes.split_at(TIMESTAMP_LEN);
    let mut buf = [0u8; TIMESTAMP_LEN];
    buf.copy_from_slice(ts_bytes);
    Some((u64::from_be_bytes(buf), value.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_was_encoded() {
        let framed = encode(7, b"hello");
        assert_eq!(decode(&framed), Some((7, b"hello".to_vec())));
    }

    #[test]
    fn empty_value_is_valid() {
        let framed = encode(1, b"");
        assert_eq!(decode(&framed), Some((1, Vec::new())));
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(decode(&[0, 0, 0]), None);
    }

    #[test]
    fn preserves_timestamp_ordering() {
        let a = encode(1, b"x");
        let b = encode(2, b"x");
        assert!(decode(&a).unwrap().0 < decode(&b).unwrap().0);
    }
}
