//! Git delta instructions.
//!
//! A delta starts with the base and result sizes as little-endian varints,
//! followed by copy (`1xxxxxxx`) and insert (`0nnnnnnn`) instructions.

use crate::{FetchError, Result};

/// A copy with a zero size field copies this many bytes.
const COPY_ZERO_SIZE: usize = 0x10000;

/// Upper bound on the up-front allocation for the result.
const MAX_PREALLOC: usize = 1 << 20;

/// Applies `delta` to `base` and returns the reconstructed object body.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(FetchError::protocol(format!(
            "delta base is {} bytes, expected {base_size}",
            base.len()
        )));
    }
    let result_size = read_size(delta, &mut pos)?;
    let mut result = Vec::with_capacity(result_size.min(MAX_PREALLOC));

    while pos < delta.len() {
        let instruction = delta[pos];
        pos += 1;

        if instruction & 0x80 == 0 {
            if instruction == 0 {
                return Err(FetchError::protocol("delta insert of zero bytes"));
            }
            let end = pos + instruction as usize;
            let data = delta
                .get(pos..end)
                .ok_or_else(|| FetchError::protocol("delta insert past end of delta"))?;
            result.extend_from_slice(data);
            pos = end;
            continue;
        }

        let mut offset = 0usize;
        for i in 0..4 {
            if instruction & (1 << i) != 0 {
                offset |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
            }
        }
        let mut size = 0usize;
        for i in 0..3 {
            if instruction & (0x10 << i) != 0 {
                size |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
            }
        }
        if size == 0 {
            size = COPY_ZERO_SIZE;
        }

        let data = offset
            .checked_add(size)
            .and_then(|end| base.get(offset..end))
            .ok_or_else(|| {
                FetchError::protocol(format!(
                    "delta copy {offset}+{size} outside base of {} bytes",
                    base.len()
                ))
            })?;
        result.extend_from_slice(data);
        if result.len() > result_size {
            break;
        }
    }

    if result.len() != result_size {
        return Err(FetchError::protocol(format!(
            "delta produced {} bytes, expected {result_size}",
            result.len()
        )));
    }
    Ok(result)
}

fn next_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data
        .get(*pos)
        .ok_or_else(|| FetchError::protocol("delta instruction past end of delta"))?;
    *pos += 1;
    Ok(byte)
}

fn read_size(data: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = next_byte(data, pos)?;
        if shift >= usize::BITS {
            return Err(FetchError::protocol("delta size overflows"));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(mut n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    fn header(base: usize, result: usize) -> Vec<u8> {
        let mut out = size(base);
        out.extend(size(result));
        out
    }

    #[test]
    fn test_copy_and_insert() {
        let base = b"hello world";
        let mut delta = header(base.len(), 13);
        // copy offset 0, size 6 -> "hello "
        delta.extend_from_slice(&[0x90, 6]);
        // insert "there"
        delta.push(5);
        delta.extend_from_slice(b"there");
        // copy offset 5, size 2 -> " w"
        delta.extend_from_slice(&[0x91, 5, 2]);

        assert_eq!(apply_delta(base, &delta).unwrap(), b"hello there w");
    }

    #[test]
    fn test_zero_size_copy_means_64k() {
        let base = vec![7u8; COPY_ZERO_SIZE];
        let mut delta = header(base.len(), COPY_ZERO_SIZE);
        delta.push(0x80);

        assert_eq!(apply_delta(&base, &delta).unwrap(), base);
    }

    #[test]
    fn test_multi_byte_sizes() {
        let base = vec![1u8; 300];
        let mut delta = header(300, 300);
        // copy offset 0, size 300 (0x012c)
        delta.extend_from_slice(&[0xb0, 0x2c, 0x01]);

        assert_eq!(apply_delta(&base, &delta).unwrap().len(), 300);
    }

    #[test]
    fn test_base_size_mismatch() {
        let delta = header(4, 0);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(FetchError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_result_size_mismatch() {
        let mut delta = header(3, 10);
        delta.extend_from_slice(&[0x90, 3]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(FetchError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let mut delta = header(3, 4);
        delta.extend_from_slice(&[0x91, 1, 4]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(FetchError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_reserved_instruction() {
        let mut delta = header(3, 0);
        delta.push(0);
        assert!(apply_delta(b"abc", &delta).is_err());
    }

    #[test]
    fn test_truncated_insert() {
        let mut delta = header(0, 5);
        delta.extend_from_slice(&[5, b'a', b'b']);
        assert!(apply_delta(b"", &delta).is_err());
    }
}
