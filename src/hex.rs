//! Hex codec for the quoted payloads used by `AT+USOWR`/`AT+USORD` and
//! friends: two digits per byte, high nibble first, upper-case on the way
//! out, either case accepted on the way in.

use heapless::String;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FromHexError {
    /// An invalid character was found. Valid ones are: `0...9`, `a...f`
    /// or `A...F`.
    InvalidHexCharacter,

    /// A hex string's length needs to be even, as two digits correspond to
    /// one byte.
    OddLength,

    /// The decoded payload does not fit the destination buffer.
    BufferTooSmall,
}

/// Decode a single hex char to decimal.
const fn val(c: u8) -> Result<u8, FromHexError> {
    match c {
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'0'..=b'9' => Ok(c - b'0'),
        _ => Err(FromHexError::InvalidHexCharacter),
    }
}

/// Decode a hex string into `dst`, returning the number of bytes written.
pub fn decode_to_slice(hex: &str, dst: &mut [u8]) -> Result<usize, FromHexError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(FromHexError::OddLength);
    }

    let len = hex.len() / 2;
    if len > dst.len() {
        return Err(FromHexError::BufferTooSmall);
    }

    for (i, out) in dst.iter_mut().enumerate().take(len) {
        *out = val(hex[i * 2])? << 4 | val(hex[i * 2 + 1])?;
    }
    Ok(len)
}

const UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Append `data` to `out` as upper-case hex digit pairs.
pub fn append_hex<const N: usize>(out: &mut String<N>, data: &[u8]) -> Result<(), Error> {
    for &b in data {
        out.push(UPPER[usize::from(b >> 4)] as char)
            .map_err(|_| Error::Overflow)?;
        out.push(UPPER[usize::from(b & 0x0f)] as char)
            .map_err(|_| Error::Overflow)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_cases() {
        let mut buf = [0u8; 4];
        assert_eq!(decode_to_slice("DEADbeef", &mut buf), Ok(4));
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_odd_length() {
        let mut buf = [0u8; 4];
        assert_eq!(decode_to_slice("abc", &mut buf), Err(FromHexError::OddLength));
    }

    #[test]
    fn rejects_invalid_characters() {
        let mut buf = [0u8; 4];
        assert_eq!(
            decode_to_slice("12g4", &mut buf),
            Err(FromHexError::InvalidHexCharacter)
        );
    }

    #[test]
    fn rejects_short_destination() {
        let mut buf = [0u8; 1];
        assert_eq!(
            decode_to_slice("AABB", &mut buf),
            Err(FromHexError::BufferTooSmall)
        );
    }

    #[test]
    fn encodes_upper_case() {
        let mut out: String<16> = String::new();
        append_hex(&mut out, &[0x00, 0x1a, 0xff]).unwrap();
        assert_eq!(out.as_str(), "001AFF");
    }

    #[test]
    fn round_trips_all_lengths_up_to_chunk_size() {
        // Chunk size of the socket read protocol.
        let mut payload = [0u8; 512];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }

        for len in 0..=payload.len() {
            let mut encoded: String<1024> = String::new();
            append_hex(&mut encoded, &payload[..len]).unwrap();
            assert_eq!(encoded.len(), len * 2);

            let mut decoded = [0u8; 512];
            let n = decode_to_slice(&encoded, &mut decoded).unwrap();
            assert_eq!(n, len);
            assert_eq!(&decoded[..n], &payload[..len]);
        }
    }
}
