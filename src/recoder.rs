//! The bind-argument recoder: a pure function translating a
//! wire-format argument tuple into the backend protocol's bind payload.
//!
//! Wire input: `count:i32_be` followed by `count` entries of
//! `length:i32_be | bytes` (a negative length marks a null argument, no
//! bytes follow). Backend output: a one-entry binary parameter-format
//! vector, the argument count as `i16_be`, the argument values copied
//! byte-for-byte (length prefix included), and a one-entry binary
//! result-format vector — the same envelope Postgres-derived wire protocols
//! use for `Bind`, as seen in `ariaandika-postro`'s `postgres-protocol`
//! crate and `joeydewaal-sqlx`'s message encoders.

use crate::error::EdgeError;

const MAX_ARGS: i32 = 32767;

/// Recode a wire-format bind-argument payload into the backend's bind
/// format. Fails with `EdgeError::malformed_bind_args` if the declared
/// length prefixes do not exactly consume the payload, or the argument
/// count exceeds 32767.
pub fn recode_bind_args(input: &[u8]) -> Result<Vec<u8>, EdgeError> {
    if input.len() < 4 {
        return Err(EdgeError::malformed_bind_args());
    }
    let count = i32::from_be_bytes(input[0..4].try_into().unwrap());
    if !(0..=MAX_ARGS).contains(&count) {
        return Err(EdgeError::malformed_bind_args());
    }

    let mut pos = 4usize;
    let mut args: Vec<(i32, &[u8])> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos + 4 > input.len() {
            return Err(EdgeError::malformed_bind_args());
        }
        let len = i32::from_be_bytes(input[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if len < 0 {
            args.push((len, &[]));
            continue;
        }
        let len_u = len as usize;
        if pos + len_u > input.len() {
            return Err(EdgeError::malformed_bind_args());
        }
        args.push((len, &input[pos..pos + len_u]));
        pos += len_u;
    }
    if pos != input.len() {
        return Err(EdgeError::malformed_bind_args());
    }

    let mut out = Vec::with_capacity(input.len() + 8);
    out.extend_from_slice(&1i16.to_be_bytes()); // one param format code
    out.extend_from_slice(&1i16.to_be_bytes()); // binary
    out.extend_from_slice(&(count as i16).to_be_bytes());
    for (len, bytes) in &args {
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out.extend_from_slice(&1i16.to_be_bytes()); // one result format code
    out.extend_from_slice(&1i16.to_be_bytes()); // binary

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_wire_args(values: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(values.len() as i32).to_be_bytes());
        for v in values {
            buf.extend_from_slice(&(v.len() as i32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        buf
    }

    #[test]
    fn round_trips_argument_count_and_bytes() {
        let wire = encode_wire_args(&[b"hello", b"\x00\x00\x00\x29"]);
        let out = recode_bind_args(&wire).unwrap();
        let count = i16::from_be_bytes(out[4..6].try_into().unwrap());
        assert_eq!(count, 2);

        let input_sum: usize = wire.len() - 4; // minus the leading count prefix
        let output_body = &out[6..out.len() - 4]; // minus format header/footer
        assert_eq!(output_body.len(), input_sum);
    }

    #[test]
    fn preserves_null_argument_markers() {
        let wire = encode_wire_args(&[]);
        let mut wire = wire;
        // overwrite count to 1 and append a -1 length null marker by hand
        wire[0..4].copy_from_slice(&1i32.to_be_bytes());
        wire.extend_from_slice(&(-1i32).to_be_bytes());
        let out = recode_bind_args(&wire).unwrap();
        let null_len = i32::from_be_bytes(out[6..10].try_into().unwrap());
        assert_eq!(null_len, -1);
    }

    #[test]
    fn rejects_length_prefix_mismatch() {
        let mut wire = encode_wire_args(&[b"abc"]);
        wire.truncate(wire.len() - 1); // drop the last byte of the argument
        assert!(recode_bind_args(&wire).is_err());
    }

    #[test]
    fn rejects_too_many_arguments() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_ARGS as i32) + 1).to_be_bytes());
        assert!(recode_bind_args(&wire).is_err());
    }

    #[test]
    fn rejects_truncated_count_prefix() {
        assert!(recode_bind_args(&[0, 0]).is_err());
    }
}
