// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! NUL-terminated strings in fixed-size shared-memory fields.

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("Value does not fit the fixed field")]
pub struct FixedStrTooLong;

/// Writes `value` NUL-terminated, clearing the rest of the field so stale
/// bytes from a previous round cannot leak into a shorter value.
pub fn write_fixed(field: &mut [u8], value: &str) -> Result<(), FixedStrTooLong> {
    let bytes = value.as_bytes();
    // One byte is reserved for the terminator.
    if bytes.len() >= field.len() {
        return Err(FixedStrTooLong);
    }
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(())
}

/// Reads up to the first NUL (or the whole field when unterminated).
pub fn read_fixed(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut field = [0u8; 32];
        write_fixed(&mut field, "/st-flow-testing").expect("write");
        assert_eq!(read_fixed(&field), "/st-flow-testing");
    }

    #[test]
    fn rejects_overflow_but_allows_exact_fit() {
        let mut field = [0u8; 8];
        assert_eq!(write_fixed(&mut field, "12345678"), Err(FixedStrTooLong));
        write_fixed(&mut field, "1234567").expect("fits with terminator");
    }

    #[test]
    fn overwrite_clears_the_tail() {
        let mut field = [0u8; 16];
        write_fixed(&mut field, "long-name-here").expect("write");
        write_fixed(&mut field, "x").expect("write");
        assert_eq!(read_fixed(&field), "x");
    }

    #[test]
    fn unterminated_field_reads_whole() {
        let field = [b'a'; 4];
        assert_eq!(read_fixed(&field), "aaaa");
    }
}
