//! HDLC-style flag/escape framing for stream carriers (TCP, serial).

use crate::buffer::ByteWriter;
use crate::error::LatticaError;

const FRAME_FLAG: u8 = 0x7e;
const ESCAPE_BYTE: u8 = 0x7d;
const ESCAPE_MASK: u8 = 0b0010_0000;

pub struct Hdlc;

impl Hdlc {
    pub fn encode(data: &[u8], out: &mut ByteWriter) -> Result<usize, LatticaError> {
        out.write_u8(FRAME_FLAG)?;

        for &byte in data {
            match byte {
                FRAME_FLAG | ESCAPE_BYTE => {
                    out.write(&[ESCAPE_BYTE, byte ^ ESCAPE_MASK])?;
                }
                _ => {
                    out.write_u8(byte)?;
                }
            }
        }

        out.write_u8(FRAME_FLAG)?;
        Ok(out.written())
    }

    /// Locates the next complete frame in a stream buffer, returning the
    /// indices of its opening and closing flags.
    pub fn find(data: &[u8]) -> Option<(usize, usize)> {
        let mut start = None;

        for (i, &byte) in data.iter().enumerate() {
            if byte != FRAME_FLAG {
                continue;
            }
            match start {
                None => start = Some(i),
                // Adjacent flags are an empty frame; keep scanning from the
                // second flag.
                Some(open) if i == open + 1 => start = Some(i),
                Some(open) => return Some((open, i)),
            }
        }

        None
    }

    pub fn decode(frame: &[u8], out: &mut ByteWriter) -> Result<usize, LatticaError> {
        let mut started = false;
        let mut finished = false;
        let mut escape = false;

        for &byte in frame {
            if escape {
                escape = false;
                out.write_u8(byte ^ ESCAPE_MASK)?;
                continue;
            }
            match byte {
                FRAME_FLAG => {
                    if started {
                        finished = true;
                        break;
                    }
                    started = true;
                }
                ESCAPE_BYTE => escape = true,
                _ => {
                    out.write_u8(byte)?;
                }
            }
        }

        if !finished {
            return Err(LatticaError::PacketError);
        }

        Ok(out.written())
    }
}

#[cfg(test)]
mod tests {
    use super::Hdlc;
    use crate::buffer::ByteWriter;

    #[test]
    fn framing_roundtrip_with_reserved_bytes() {
        let payload = [0x01, 0x7e, 0x02, 0x7d, 0x03];

        let mut encoded = [0u8; 32];
        let mut writer = ByteWriter::new(&mut encoded);
        let encoded_len = Hdlc::encode(&payload, &mut writer).expect("encodes");

        let (start, end) = Hdlc::find(&encoded[..encoded_len]).expect("frame found");
        let mut decoded = [0u8; 32];
        let mut writer = ByteWriter::new(&mut decoded);
        let decoded_len = Hdlc::decode(&encoded[start..=end], &mut writer).expect("decodes");

        assert_eq!(&decoded[..decoded_len], &payload);
    }

    #[test]
    fn find_skips_empty_frames() {
        let stream = [0x7e, 0x7e, 0x41, 0x42, 0x7e];
        let (start, end) = Hdlc::find(&stream).expect("frame found");
        assert_eq!((start, end), (1, 4));
    }

    #[test]
    fn unterminated_frame_is_an_error() {
        let mut out = [0u8; 16];
        let mut writer = ByteWriter::new(&mut out);
        assert!(Hdlc::decode(&[0x7e, 0x41, 0x42], &mut writer).is_err());
    }
}
