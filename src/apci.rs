//! APCI (Application Protocol Control Information) framing: the 6-byte
//! header every IEC 60870-5-104 frame starts with, and the handful of
//! control-field patterns that distinguish I/S/U-frames.

use crate::error::Error;

pub const START_BYTE: u8 = 0x68;

/// Maximum number of bytes after the length byte (255 - 4 control bytes).
pub const MAX_ASDU_LEN: usize = 249;

const STARTDT_ACT: u8 = 0x07;
const STARTDT_CON: u8 = 0x0B;
const STOPDT_ACT: u8 = 0x13;
const STOPDT_CON: u8 = 0x23;
const TESTFR_ACT: u8 = 0x43;
const TESTFR_CON: u8 = 0x83;

/// A decoded APCI frame, classified by kind. `Asdu` carries only the raw
/// sequence numbers and a view into the caller's buffer for the payload;
/// `asdu.rs` interprets the payload further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Information {
        send_seq: u16,
        recv_seq: u16,
        asdu: &'a [u8],
    },
    Supervisory {
        recv_seq: u16,
    },
    StartDtAct,
    StartDtCon,
    StopDtAct,
    StopDtCon,
    TestFrAct,
    TestFrCon,
}

/// Parses one complete APCI frame from `buf`, which must contain exactly
/// `len(start)+2` bytes as indicated by the length byte (the caller's recv
/// parser is responsible for buffering until that many bytes are present).
pub fn decode(buf: &[u8]) -> Result<Frame<'_>, Error> {
    if buf.len() < 6 {
        return Err(Error::Framing("frame shorter than APCI header"));
    }
    if buf[0] != START_BYTE {
        return Err(Error::Framing("missing start byte"));
    }
    let len = buf[1] as usize;
    if buf.len() != len + 2 {
        return Err(Error::Framing("length field does not match buffer size"));
    }

    let c0 = buf[2];
    let c1 = buf[3];
    let c2 = buf[4];
    let c3 = buf[5];

    if c0 & 0x01 == 0 {
        // I-frame
        if buf.len() < 7 {
            return Err(Error::Framing("I-frame shorter than 7 bytes"));
        }
        let send_seq = (((c1 as u16) << 8) | (c0 as u16 & 0xFE)) >> 1;
        let recv_seq = (((c3 as u16) << 8) | (c2 as u16 & 0xFE)) >> 1;
        Ok(Frame::Information {
            send_seq,
            recv_seq,
            asdu: &buf[6..],
        })
    } else if c0 & 0x03 == 0x01 {
        // S-frame
        let recv_seq = (((c3 as u16) << 8) | (c2 as u16 & 0xFE)) >> 1;
        Ok(Frame::Supervisory { recv_seq })
    } else {
        match c0 {
            STARTDT_ACT => Ok(Frame::StartDtAct),
            STARTDT_CON => Ok(Frame::StartDtCon),
            STOPDT_ACT => Ok(Frame::StopDtAct),
            STOPDT_CON => Ok(Frame::StopDtCon),
            TESTFR_ACT => Ok(Frame::TestFrAct),
            TESTFR_CON => Ok(Frame::TestFrCon),
            _ => Err(Error::Framing("unrecognized U-frame control field")),
        }
    }
}

/// Encodes a U-frame or S-frame control verb into `out`, returning the
/// number of bytes written.
pub fn encode_control(out: &mut [u8; 6], c0: u8) {
    out[0] = START_BYTE;
    out[1] = 4;
    out[2] = c0;
    out[3] = 0;
    out[4] = 0;
    out[5] = 0;
}

pub fn encode_startdt_act(out: &mut [u8; 6]) {
    encode_control(out, STARTDT_ACT)
}
pub fn encode_startdt_con(out: &mut [u8; 6]) {
    encode_control(out, STARTDT_CON)
}
pub fn encode_stopdt_act(out: &mut [u8; 6]) {
    encode_control(out, STOPDT_ACT)
}
pub fn encode_stopdt_con(out: &mut [u8; 6]) {
    encode_control(out, STOPDT_CON)
}
pub fn encode_testfr_act(out: &mut [u8; 6]) {
    encode_control(out, TESTFR_ACT)
}
pub fn encode_testfr_con(out: &mut [u8; 6]) {
    encode_control(out, TESTFR_CON)
}

pub fn encode_supervisory(out: &mut [u8; 6], recv_seq: u16) {
    out[0] = START_BYTE;
    out[1] = 4;
    out[2] = 0x01;
    out[3] = 0;
    out[4] = ((recv_seq << 1) & 0xFF) as u8;
    out[5] = (recv_seq >> 7) as u8;
}

/// Encodes an I-frame header plus `asdu` into a freshly allocated buffer.
pub fn encode_information(send_seq: u16, recv_seq: u16, asdu: &[u8]) -> Result<Vec<u8>, Error> {
    if asdu.len() > MAX_ASDU_LEN {
        return Err(Error::Framing("ASDU exceeds maximum length"));
    }
    let mut out = Vec::with_capacity(6 + asdu.len());
    out.push(START_BYTE);
    out.push((4 + asdu.len()) as u8);
    out.push((send_seq << 1) as u8);
    out.push((send_seq >> 7) as u8);
    out.push((recv_seq << 1) as u8);
    out.push((recv_seq >> 7) as u8);
    out.extend_from_slice(asdu);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_startdt() {
        let mut buf = [0u8; 6];
        encode_startdt_act(&mut buf);
        assert_eq!(decode(&buf).unwrap(), Frame::StartDtAct);

        encode_startdt_con(&mut buf);
        assert_eq!(decode(&buf).unwrap(), Frame::StartDtCon);
    }

    #[test]
    fn round_trips_testfr() {
        let mut buf = [0u8; 6];
        encode_testfr_act(&mut buf);
        assert_eq!(decode(&buf).unwrap(), Frame::TestFrAct);
        encode_testfr_con(&mut buf);
        assert_eq!(decode(&buf).unwrap(), Frame::TestFrCon);
    }

    #[test]
    fn round_trips_supervisory() {
        let mut buf = [0u8; 6];
        encode_supervisory(&mut buf, 1);
        match decode(&buf).unwrap() {
            Frame::Supervisory { recv_seq } => assert_eq!(recv_seq, 1),
            other => panic!("expected Supervisory, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_information() {
        let asdu = [1u8, 2, 3, 4, 5];
        let encoded = encode_information(0, 0, &asdu).unwrap();
        match decode(&encoded).unwrap() {
            Frame::Information {
                send_seq,
                recv_seq,
                asdu: payload,
            } => {
                assert_eq!(send_seq, 0);
                assert_eq!(recv_seq, 0);
                assert_eq!(payload, &asdu);
            }
            other => panic!("expected Information, got {other:?}"),
        }
    }

    #[test]
    fn sequence_numbers_wrap_through_15_bits() {
        let asdu = [0u8; 1];
        let encoded = encode_information(32767, 100, &asdu).unwrap();
        match decode(&encoded).unwrap() {
            Frame::Information {
                send_seq, recv_seq, ..
            } => {
                assert_eq!(send_seq, 32767);
                assert_eq!(recv_seq, 100);
            }
            other => panic!("expected Information, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_start_byte() {
        let buf = [0x00, 4, 0, 0, 0, 0];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let buf = [START_BYTE, 10, 0, 0, 0, 0];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn asdu_over_max_length_rejected() {
        let asdu = [0u8; MAX_ASDU_LEN + 1];
        assert!(encode_information(0, 0, &asdu).is_err());
    }
}
