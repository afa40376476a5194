//! Binary encoding of shape range profiles
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! u32 binding_count
//! repeated binding_count times, ascending by name:
//!     u32 name_len
//!     [u8; name_len] name (UTF-8)
//!     u32 dim_count
//!     repeated dim_count times, ascending by index:
//!         u32 dim_index
//!         i64 min
//!         i64 max
//! ```
//!
//! Identical profiles always encode to identical bytes, which is what makes
//! [`signature`] usable as part of an engine cache key.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

use crate::shape_range::{DimRange, Profile, ShapeRange};
use crate::{CoreError, Result};

/// Size of one encoded dimension entry
pub const DIM_ENTRY_SIZE: usize = 4 + 8 + 8;

/// Encode a profile
pub fn serialize(profile: &Profile) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(profile));
    // Writes into a Vec<u8> cannot fail.
    let _ = write_profile(&mut out, profile);
    out
}

fn write_profile(out: &mut Vec<u8>, profile: &Profile) -> std::io::Result<()> {
    out.write_u32::<LittleEndian>(profile.len() as u32)?;
    for (name, range) in profile.iter() {
        out.write_u32::<LittleEndian>(name.len() as u32)?;
        out.extend_from_slice(name.as_bytes());
        out.write_u32::<LittleEndian>(range.len() as u32)?;
        for (index, dim) in range.iter() {
            out.write_u32::<LittleEndian>(index as u32)?;
            out.write_i64::<LittleEndian>(dim.min)?;
            out.write_i64::<LittleEndian>(dim.max)?;
        }
    }
    Ok(())
}

/// Number of bytes [`serialize`] produces for `profile`
pub fn encoded_len(profile: &Profile) -> usize {
    4 + profile
        .iter()
        .map(|(name, range)| 4 + name.len() + 4 + range.len() * DIM_ENTRY_SIZE)
        .sum::<usize>()
}

/// Decode a profile
pub fn deserialize(bytes: &[u8]) -> Result<Profile> {
    let mut cursor = Cursor::new(bytes);
    let mut profile = Profile::new();

    let binding_count = read_u32(&mut cursor, "binding count")?;
    for _ in 0..binding_count {
        let name_len = read_u32(&mut cursor, "binding name length")? as usize;
        ensure_remaining(&cursor, name_len, "binding name")?;
        let mut name_bytes = vec![0u8; name_len];
        cursor
            .read_exact(&mut name_bytes)
            .map_err(|_| truncated("binding name"))?;
        let name = String::from_utf8(name_bytes).map_err(|_| {
            CoreError::corrupt_profile("Binding name is not valid UTF-8", "Decoding profile")
        })?;

        let dim_count = read_u32(&mut cursor, "dimension count")? as usize;
        ensure_remaining(&cursor, dim_count.saturating_mul(DIM_ENTRY_SIZE), "dimension entries")?;

        let mut range = ShapeRange::new();
        for _ in 0..dim_count {
            let index = read_u32(&mut cursor, "dimension index")? as usize;
            let min = read_i64(&mut cursor, "dimension min")?;
            let max = read_i64(&mut cursor, "dimension max")?;
            let dim = DimRange::new(min, max).ok_or_else(|| {
                CoreError::corrupt_profile(
                    format!("Binding '{}' dim {} has min {} > max {}", name, index, min, max),
                    "Decoding profile",
                )
            })?;
            if range.insert(index, dim).is_some() {
                return Err(CoreError::corrupt_profile(
                    format!("Binding '{}' repeats dim {}", name, index),
                    "Decoding profile",
                ));
            }
        }

        if profile.insert(name.clone(), range).is_some() {
            return Err(CoreError::corrupt_profile(
                format!("Binding '{}' appears twice", name),
                "Decoding profile",
            ));
        }
    }

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(CoreError::corrupt_profile(
            format!(
                "{} trailing bytes after {} declared bindings",
                bytes.len() - consumed,
                binding_count
            ),
            "Decoding profile",
        ));
    }

    Ok(profile)
}

/// Stable 64-bit signature of a profile's encoded form
pub fn signature(profile: &Profile) -> u64 {
    let digest = Sha256::digest(serialize(profile));
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

fn truncated(what: &str) -> CoreError {
    CoreError::corrupt_profile(
        format!("Profile ends before {}", what),
        "Byte length is inconsistent with the declared counts",
    )
}

fn ensure_remaining(cursor: &Cursor<&[u8]>, needed: usize, what: &str) -> Result<()> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if needed > remaining {
        return Err(truncated(what));
    }
    Ok(())
}

fn read_u32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| truncated(what))
}

fn read_i64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<i64> {
    cursor
        .read_i64::<LittleEndian>()
        .map_err(|_| truncated(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> Profile {
        let mut profile = Profile::new();
        for name in ["Z", "X", "Y"] {
            let mut range = ShapeRange::new();
            range.insert(2, DimRange { min: 2, max: 6 });
            range.insert(1, DimRange { min: 1, max: 3 });
            profile.insert(name, range);
        }
        profile
    }

    #[test]
    fn test_empty_profile() {
        let bytes = serialize(&Profile::new());
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(deserialize(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_layout() {
        let mut range = ShapeRange::new();
        range.insert(1, DimRange { min: 3, max: 3 });
        let mut profile = Profile::new();
        profile.insert("X", range);

        let bytes = serialize(&profile);
        let mut expected = vec![1, 0, 0, 0, 1, 0, 0, 0, b'X', 1, 0, 0, 0, 1, 0, 0, 0];
        expected.extend_from_slice(&3i64.to_le_bytes());
        expected.extend_from_slice(&3i64.to_le_bytes());
        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), encoded_len(&profile));
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let bytes = serialize(&sample_profile());
        // First binding must be "X" regardless of insertion order
        assert_eq!(&bytes[4..9], &[1, 0, 0, 0, b'X']);
        assert_eq!(deserialize(&bytes).unwrap(), sample_profile());
    }

    #[test]
    fn test_truncated_input() {
        let bytes = serialize(&sample_profile());
        for cut in [0, 3, 10, bytes.len() - 1] {
            let err = deserialize(&bytes[..cut]).unwrap_err();
            assert_eq!(err.code(), "PROFILE_CORRUPT", "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&sample_profile());
        bytes.push(0);
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn test_min_greater_than_max() {
        let mut bytes = vec![1, 0, 0, 0, 1, 0, 0, 0, b'X', 1, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&5i64.to_le_bytes());
        bytes.extend_from_slice(&2i64.to_le_bytes());
        let err = deserialize(&bytes).unwrap_err();
        assert!(err.is_cache_corruption());
        assert!(err.to_string().contains("min 5 > max 2"));
    }

    #[test]
    fn test_oversized_counts_do_not_allocate() {
        let bytes = [1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn test_signature() {
        let a = signature(&sample_profile());
        assert_eq!(a, signature(&sample_profile()));

        let mut wider = sample_profile();
        let mut range = ShapeRange::new();
        range.insert(1, DimRange { min: 1, max: 4 });
        wider.insert("X", range);
        assert_ne!(a, signature(&wider));
    }
}
