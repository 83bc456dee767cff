//! Shared interchange-format constants for the lovejs toolchain.
//!
//! A standalone executable is a host binary with a compiled-unit payload
//! appended, followed by a fixed 16-byte trailer:
//!
//! ```text
//! [host executable] [payload bytes] [8-byte magic] [4-byte LE payload len] [4-byte reserved]
//! ```
//!
//! The engine produces and consumes the payload bytes; the packaging tool and
//! the launcher both rely on the layout below, so it lives in this crate as
//! the single source of truth.

pub const TRAILER_MAGIC: [u8; 8] = *b"LOVEJSBC";
pub const TRAILER_SIZE: usize = 16;

/// Decoded form of the 16-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub payload_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerError {
    PayloadEmpty,
    PayloadTooLarge,
}

impl std::fmt::Display for TrailerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrailerError::PayloadEmpty => f.write_str("payload must not be empty"),
            TrailerError::PayloadTooLarge => {
                write!(f, "payload exceeds {} bytes", u32::MAX)
            }
        }
    }
}

impl std::error::Error for TrailerError {}

/// Encode a trailer for a payload of `payload_len` bytes.
pub fn encode_trailer(payload_len: u32) -> [u8; TRAILER_SIZE] {
    let mut out = [0u8; TRAILER_SIZE];
    out[0..8].copy_from_slice(&TRAILER_MAGIC);
    out[8..12].copy_from_slice(&payload_len.to_le_bytes());
    // bytes 12..16 are reserved and stay zero
    out
}

/// Parse the trailing 16 bytes of `image`. Returns `None` when the image is
/// too short, the magic does not match, or the recorded length cannot fit in
/// front of the trailer.
pub fn parse_trailer(image: &[u8]) -> Option<Trailer> {
    if image.len() < TRAILER_SIZE {
        return None;
    }
    let tail = &image[image.len() - TRAILER_SIZE..];
    if tail[0..8] != TRAILER_MAGIC {
        return None;
    }
    let payload_len = u32::from_le_bytes([tail[8], tail[9], tail[10], tail[11]]);
    if payload_len == 0 {
        return None;
    }
    if payload_len as usize > image.len() - TRAILER_SIZE {
        return None;
    }
    Some(Trailer { payload_len })
}

/// Return the embedded payload of `image`, or `None` when no valid trailer is
/// present.
pub fn extract_payload(image: &[u8]) -> Option<&[u8]> {
    let trailer = parse_trailer(image)?;
    let end = image.len() - TRAILER_SIZE;
    let start = end - trailer.payload_len as usize;
    Some(&image[start..end])
}

/// Return `image` with any embedded payload and trailer removed. An image
/// without a valid trailer is returned unchanged.
pub fn strip_payload(image: &[u8]) -> &[u8] {
    match parse_trailer(image) {
        Some(trailer) => {
            let end = image.len() - TRAILER_SIZE - trailer.payload_len as usize;
            &image[..end]
        }
        None => image,
    }
}

/// Build a standalone image: `image` (with any previous payload stripped)
/// followed by `payload` and a fresh trailer.
pub fn append_payload(image: &[u8], payload: &[u8]) -> Result<Vec<u8>, TrailerError> {
    if payload.is_empty() {
        return Err(TrailerError::PayloadEmpty);
    }
    let payload_len = u32::try_from(payload.len()).map_err(|_| TrailerError::PayloadTooLarge)?;

    let base = strip_payload(image);
    let mut out = Vec::with_capacity(base.len() + payload.len() + TRAILER_SIZE);
    out.extend_from_slice(base);
    out.extend_from_slice(payload);
    out.extend_from_slice(&encode_trailer(payload_len));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_roundtrip() {
        let image = append_payload(b"exe-bytes", b"bytecode").expect("append");
        assert_eq!(
            parse_trailer(&image),
            Some(Trailer {
                payload_len: "bytecode".len() as u32
            })
        );
        assert_eq!(extract_payload(&image), Some(&b"bytecode"[..]));
        assert_eq!(strip_payload(&image), b"exe-bytes");
    }

    #[test]
    fn append_replaces_existing_payload() {
        let first = append_payload(b"exe-bytes", b"old-payload").expect("append");
        let second = append_payload(&first, b"new").expect("re-append");
        assert_eq!(extract_payload(&second), Some(&b"new"[..]));
        assert_eq!(strip_payload(&second), b"exe-bytes");
    }

    #[test]
    fn parse_rejects_bad_images() {
        assert_eq!(parse_trailer(b"short"), None);
        assert_eq!(parse_trailer(b"no trailer here, just bytes"), None);

        // Valid magic but a length larger than the bytes in front of it.
        let mut image = Vec::new();
        image.extend_from_slice(b"xy");
        image.extend_from_slice(&encode_trailer(100));
        assert_eq!(parse_trailer(&image), None);

        // Zero-length payload means "nothing embedded".
        let mut image = Vec::from(&b"exe"[..]);
        image.extend_from_slice(&encode_trailer(0));
        assert_eq!(parse_trailer(&image), None);
    }

    #[test]
    fn strip_leaves_plain_images_alone() {
        assert_eq!(strip_payload(b"plain executable"), b"plain executable");
    }

    #[test]
    fn append_rejects_empty_payload() {
        assert_eq!(
            append_payload(b"exe", b"").unwrap_err(),
            TrailerError::PayloadEmpty
        );
    }
}
