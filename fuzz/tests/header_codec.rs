//! Bolero fuzzer for the 16-byte message header.
//!
//! Properties tested:
//! - Decoding arbitrary bytes never panics
//! - A decoded header re-encodes to the same 16 bytes
//! - Decoding succeeds exactly when the declared length fits the buffer

use bolero::check;
use rpmsg_core::{decode_header, MsgHeader, HEADER_SIZE};

fn main() {
    check!().with_type::<Vec<u8>>().for_each(|bytes| {
        match decode_header(bytes) {
            Ok(header) => {
                assert_eq!(&header.encode()[..], &bytes[..HEADER_SIZE]);
                assert!(header.frame_len() <= bytes.len());
            }
            Err(_) => {
                let fits = bytes.len() >= HEADER_SIZE && {
                    let len = u16::from_le_bytes([bytes[12], bytes[13]]) as usize;
                    HEADER_SIZE + len <= bytes.len()
                };
                assert!(!fits, "rejected a well-formed header: {:?}", bytes);
            }
        }

        // Whatever the bytes say, a fresh header built from them round-trips.
        if bytes.len() >= 4 {
            let header = MsgHeader::new(
                u32::from(bytes[0]) << 8,
                u32::from(bytes[1]),
                u16::from(bytes[2]),
                u16::from(bytes[3]),
            );
            let mut frame = header.encode().to_vec();
            frame.resize(header.frame_len(), 0);
            assert_eq!(MsgHeader::decode(&frame), Ok(header));
        }
    });
}

#[cfg(test)]
mod tests {
    use rpmsg_core::{decode_header, encode_header, HEADER_SIZE};

    #[test]
    fn test_short_buffer_rejected() {
        for len in 0..HEADER_SIZE {
            assert!(decode_header(&vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn test_length_must_fit() {
        let mut frame = encode_header(1, 2, 3, 0).to_vec();
        assert!(decode_header(&frame).is_err());
        frame.extend_from_slice(&[0; 3]);
        assert_eq!(decode_header(&frame).unwrap().len, 3);
    }
}
