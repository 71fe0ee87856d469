//! Wire protocol of the USB recovery mode.
//!
//! Inbound interrupt packets either carry an image request
//! (`"i*m*g*r*q*"` sentinel, one type byte, NUL-padded image name) or are
//! console output from U-Boot. Outbound bulk replies are framed with an
//! 8-byte little-endian header followed by the raw file bytes.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Sentinel prefix of an inbound image request packet.
pub const IMAGE_REQUEST_MAGIC: &[u8] = b"i*m*g*r*q*";

/// Reply header: `u32` payload size followed by four zero bytes.
pub const REPLY_HEADER_SIZE: usize = 8;

/// Largest block handed to a single bulk write.
pub const BLOCK_SIZE: usize = 1024 * 1024 + 4;

/// Image types above this value request a size reply (`07_IMAGE`) for the
/// payload just sent.
pub const SIZE_REPLY_THRESHOLD: u8 = 0x79;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("reply header too short: expected {REPLY_HEADER_SIZE} bytes, got {0}")]
    TooShort(usize),
}

/// A parsed image request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub image_type: u8,
    /// Catalog lookup key, NUL-trimmed and with any `/` prefix removed.
    pub name: String,
    /// Informational path prefix the device put before the name, if any.
    pub prefix: Option<String>,
}

impl ImageRequest {
    /// Whether this request obligates the host to record the payload size
    /// in the size-reply sink for a subsequent request.
    pub fn wants_size_reply(&self) -> bool {
        self.image_type > SIZE_REPLY_THRESHOLD
    }
}

/// Classification of one inbound interrupt packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptPayload {
    Request(ImageRequest),
    Console(String),
}

/// Classify an interrupt packet. Anything without the request sentinel is
/// console output, raw bytes included.
pub fn parse_interrupt(buf: &[u8]) -> InterruptPayload {
    let Some(pos) = find_magic(buf) else {
        return InterruptPayload::Console(String::from_utf8_lossy(buf).into_owned());
    };

    let after = &buf[pos + IMAGE_REQUEST_MAGIC.len()..];
    if after.is_empty() {
        // Sentinel with no type byte; not a well-formed request.
        return InterruptPayload::Console(String::from_utf8_lossy(buf).into_owned());
    }

    let image_type = after[0];
    let name_bytes = &after[1..];
    let end = name_bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    let raw_name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

    let (prefix, name) = match raw_name.find('/') {
        Some(slash) => (
            Some(raw_name[..slash].to_string()),
            raw_name[slash + 1..].to_string(),
        ),
        None => (None, raw_name),
    };

    InterruptPayload::Request(ImageRequest {
        image_type,
        name,
        prefix,
    })
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < IMAGE_REQUEST_MAGIC.len() {
        return None;
    }
    buf.windows(IMAGE_REQUEST_MAGIC.len())
        .position(|w| w == IMAGE_REQUEST_MAGIC)
}

/// Build the 8-byte reply header for a payload of `size` bytes.
pub fn encode_reply_header(size: u32) -> [u8; REPLY_HEADER_SIZE] {
    let mut header = [0u8; REPLY_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[..4], size);
    header
}

/// Parse a reply header back into `(size, reserved)`.
pub fn parse_reply_header(buf: &[u8]) -> Result<(u32, u32), HeaderError> {
    if buf.len() < REPLY_HEADER_SIZE {
        return Err(HeaderError::TooShort(buf.len()));
    }
    Ok((
        LittleEndian::read_u32(&buf[..4]),
        LittleEndian::read_u32(&buf[4..REPLY_HEADER_SIZE]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_packet(image_type: u8, name: &str, pad_to: usize) -> Vec<u8> {
        let mut pkt = IMAGE_REQUEST_MAGIC.to_vec();
        pkt.push(image_type);
        pkt.extend_from_slice(name.as_bytes());
        while pkt.len() < pad_to {
            pkt.push(0);
        }
        pkt
    }

    #[test]
    fn header_roundtrip() {
        for size in [0u32, 1, 0x1234_5678, u32::MAX] {
            let header = encode_reply_header(size);
            assert_eq!(parse_reply_header(&header).unwrap(), (size, 0));
        }
    }

    #[test]
    fn header_too_short() {
        assert!(parse_reply_header(&[0u8; 7]).is_err());
    }

    #[test]
    fn parses_padded_request() {
        let pkt = request_packet(0x00, "gen3_uboot.bin.usb", 64);
        match parse_interrupt(&pkt) {
            InterruptPayload::Request(req) => {
                assert_eq!(req.image_type, 0x00);
                assert_eq!(req.name, "gen3_uboot.bin.usb");
                assert_eq!(req.prefix, None);
                assert!(!req.wants_size_reply());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn splits_path_prefix() {
        let pkt = request_packet(0x80, "SYNAIMG/emmc_image_list", 64);
        match parse_interrupt(&pkt) {
            InterruptPayload::Request(req) => {
                assert_eq!(req.prefix.as_deref(), Some("SYNAIMG"));
                assert_eq!(req.name, "emmc_image_list");
                assert!(req.wants_size_reply());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn size_reply_threshold_boundary() {
        let at = ImageRequest {
            image_type: SIZE_REPLY_THRESHOLD,
            name: String::new(),
            prefix: None,
        };
        let above = ImageRequest {
            image_type: SIZE_REPLY_THRESHOLD + 1,
            name: String::new(),
            prefix: None,
        };
        assert!(!at.wants_size_reply());
        assert!(above.wants_size_reply());
    }

    #[test]
    fn non_request_is_console() {
        let pkt = b"U-Boot 2019.10 (Jan 01 2025)\r\n=> ";
        match parse_interrupt(pkt) {
            InterruptPayload::Console(text) => assert!(text.contains("U-Boot")),
            other => panic!("expected console, got {other:?}"),
        }
    }

    #[test]
    fn short_packet_is_console() {
        match parse_interrupt(b"=>") {
            InterruptPayload::Console(text) => assert_eq!(text, "=>"),
            other => panic!("expected console, got {other:?}"),
        }
    }
}
