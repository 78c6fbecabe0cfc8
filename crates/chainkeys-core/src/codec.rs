//! Packed key codec.
//!
//! Signing-key calls return two concatenated hex blobs (`0x` + N fixed-width
//! records, no delimiters): one of 48-byte public keys and one of 96-byte
//! deposit signatures. This module splits them back into records and pairs
//! them with the per-key used flags.

use crate::error::{Result, SyncError};
use crate::types::{Key, PackedKeys};

/// Width of a BLS public key in bytes.
pub const PUBKEY_LENGTH: usize = 48;
/// Width of a deposit signature in bytes.
pub const SIGNATURE_LENGTH: usize = 96;

/// Split a packed hex blob into `width`-byte records, in order.
///
/// Records are returned lower-case and `0x`-prefixed. `"0x"` yields an empty
/// list.
pub fn split_hex(blob: &str, width: usize) -> Result<Vec<String>> {
    if width == 0 {
        return Err(SyncError::InvalidArgument(
            "record width must be positive".into(),
        ));
    }
    let digits = blob.strip_prefix("0x").ok_or_else(|| {
        SyncError::Decode(format!("packed blob of length {} has no 0x prefix", blob.len()))
    })?;

    let bytes = hex::decode(digits).map_err(|e| SyncError::Decode(format!("packed blob: {e}")))?;
    if bytes.len() % width != 0 {
        return Err(SyncError::Decode(format!(
            "packed blob of {} bytes is not a multiple of record width {width}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks(width)
        .map(|record| format!("0x{}", hex::encode(record)))
        .collect())
}

/// Concatenate fixed-width records into one packed blob.
pub fn join_hex<S: AsRef<str>>(records: &[S]) -> String {
    let mut out = String::from("0x");
    for r in records {
        let r = r.as_ref();
        out.push_str(r.strip_prefix("0x").unwrap_or(r));
    }
    out
}

/// Decode one signing-key range result into [`Key`] records.
///
/// Each record gets index `start_index + position`, so sub-ranges can be
/// decoded independently and merged by index. A length mismatch between the
/// key, signature and used arrays means the reader returned corrupt data and
/// is a [`SyncError::Decode`].
pub fn decode_packed_keys(
    module_address: &str,
    operator_index: u64,
    start_index: u64,
    packed: &PackedKeys,
) -> Result<Vec<Key>> {
    let pubkeys = split_hex(&packed.pubkeys, PUBKEY_LENGTH)?;
    let signatures = split_hex(&packed.signatures, SIGNATURE_LENGTH)?;

    if pubkeys.len() != signatures.len() || pubkeys.len() != packed.used.len() {
        return Err(SyncError::Decode(format!(
            "operator {operator_index} at {start_index}: {} keys, {} signatures, {} used flags",
            pubkeys.len(),
            signatures.len(),
            packed.used.len()
        )));
    }

    Ok(pubkeys
        .into_iter()
        .zip(signatures)
        .zip(packed.used.iter().copied())
        .enumerate()
        .map(|(i, ((key, deposit_signature), used))| Key {
            module_address: module_address.to_string(),
            operator_index,
            index: start_index + i as u64,
            key,
            deposit_signature,
            used,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(byte: u8, width: usize) -> String {
        format!("0x{}", hex::encode(vec![byte; width]))
    }

    #[test]
    fn split_roundtrip_preserves_order() {
        let records: Vec<String> = (1u8..=4).map(|b| record(b, 3)).collect();
        let blob = join_hex(&records);
        assert_eq!(split_hex(&blob, 3).unwrap(), records);
    }

    #[test]
    fn empty_blob_yields_nothing() {
        assert!(split_hex("0x", PUBKEY_LENGTH).unwrap().is_empty());
    }

    #[test]
    fn uppercase_hex_is_normalized() {
        let out = split_hex("0xABCD", 2).unwrap();
        assert_eq!(out, vec!["0xabcd".to_string()]);
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(split_hex("0xzz", 1), Err(SyncError::Decode(_))));
        assert!(matches!(split_hex("abcd", 1), Err(SyncError::Decode(_))));
    }

    #[test]
    fn rejects_zero_width() {
        assert!(matches!(split_hex("0x00", 0), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_partial_record() {
        assert!(split_hex("0xaabbcc", 2).is_err());
    }

    #[test]
    fn decode_assigns_offset_indices() {
        let packed = PackedKeys {
            pubkeys: join_hex(&[record(1, PUBKEY_LENGTH), record(2, PUBKEY_LENGTH)]),
            signatures: join_hex(&[record(3, SIGNATURE_LENGTH), record(4, SIGNATURE_LENGTH)]),
            used: vec![true, false],
        };
        let keys = decode_packed_keys("0xmodule", 7, 10, &packed).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].index, 10);
        assert_eq!(keys[1].index, 11);
        assert_eq!(keys[0].operator_index, 7);
        assert_eq!(keys[0].key, record(1, PUBKEY_LENGTH));
        assert_eq!(keys[1].deposit_signature, record(4, SIGNATURE_LENGTH));
        assert!(keys[0].used);
        assert!(!keys[1].used);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let packed = PackedKeys {
            pubkeys: join_hex(&[record(1, PUBKEY_LENGTH), record(2, PUBKEY_LENGTH)]),
            signatures: join_hex(&[record(3, SIGNATURE_LENGTH)]),
            used: vec![false, false],
        };
        let err = decode_packed_keys("0xmodule", 0, 0, &packed).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(!err.is_retryable());
    }
}
