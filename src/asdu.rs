//! ASDU header field access.
//!
//! The engine parses only the fixed-size ASDU header (type identification,
//! variable structure qualifier, cause of transmission, common address); the
//! information-object payload that follows stays an opaque slice the engine
//! never interprets.

use crate::config::AppLayerParameters;
use crate::error::Error;

/// Cause-of-transmission constants the engine itself needs to read or set
/// when building standard responses. Application-level COT values beyond
/// these pass through untouched.
pub mod cot {
    pub const ACTIVATION: u8 = 6;
    pub const DEACTIVATION: u8 = 8;
    pub const ACTIVATION_CON: u8 = 7;
    pub const ACTIVATION_TERMINATION: u8 = 10;
    pub const REQUEST: u8 = 5;
    pub const SPONTANEOUS: u8 = 3;
    pub const UNKNOWN_TYPE_ID: u8 = 44;
    pub const UNKNOWN_COT: u8 = 47;
}

/// Type identifiers the engine dispatches on directly.
pub mod type_id {
    pub const C_IC_NA_1: u8 = 100;
    pub const C_CI_NA_1: u8 = 101;
    pub const C_RD_NA_1: u8 = 102;
    pub const C_CS_NA_1: u8 = 103;
    pub const C_RP_NA_1: u8 = 105;
    pub const C_CD_NA_1: u8 = 106;
}

const NEGATIVE_BIT: u8 = 0x40;
const TEST_BIT: u8 = 0x80;

/// A read-only view over an ASDU's header fields, computed against the
/// configured field widths. The information-object payload is reachable via
/// `payload()` but this type never looks inside it.
pub struct AsduView<'a> {
    buf: &'a [u8],
    params: AppLayerParameters,
}

impl<'a> AsduView<'a> {
    pub fn parse(buf: &'a [u8], params: AppLayerParameters) -> Result<Self, Error> {
        if buf.len() < params.header_len() {
            return Err(Error::Framing("ASDU shorter than configured header"));
        }
        Ok(AsduView { buf, params })
    }

    pub fn type_id(&self) -> u8 {
        self.buf[0]
    }

    pub fn vsq(&self) -> u8 {
        self.buf[1]
    }

    /// Number of information objects encoded in the VSQ field's low 7 bits.
    pub fn object_count(&self) -> u8 {
        self.vsq() & 0x7F
    }

    /// Whether the VSQ's "sequence" bit is set (objects share one base IOA).
    pub fn is_sequence(&self) -> bool {
        self.vsq() & 0x80 != 0
    }

    fn cot_offset(&self) -> usize {
        2
    }

    pub fn cot(&self) -> u8 {
        self.buf[self.cot_offset()] & 0x3F
    }

    pub fn negative(&self) -> bool {
        self.buf[self.cot_offset()] & NEGATIVE_BIT != 0
    }

    pub fn test(&self) -> bool {
        self.buf[self.cot_offset()] & TEST_BIT != 0
    }

    pub fn originator_address(&self) -> Option<u8> {
        if self.params.size_of_cot == 2 {
            Some(self.buf[self.cot_offset() + 1])
        } else {
            None
        }
    }

    fn ca_offset(&self) -> usize {
        self.cot_offset() + self.params.size_of_cot as usize
    }

    pub fn common_address(&self) -> u16 {
        let off = self.ca_offset();
        if self.params.size_of_ca == 2 {
            u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
        } else {
            self.buf[off] as u16
        }
    }

    /// The information-object payload, untouched by the engine.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.params.header_len()..]
    }

    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }
}

/// Rewrites the COT byte of an owned ASDU buffer in place, used when the
/// engine builds `UNKNOWN_TYPE_ID`/`UNKNOWN_COT`/activation-confirmation
/// responses by echoing the incoming ASDU with a new cause.
pub fn set_cot(buf: &mut [u8], cot: u8, negative: bool) -> Result<(), Error> {
    if buf.len() < 3 {
        return Err(Error::Framing("ASDU shorter than COT field"));
    }
    let test = buf[2] & TEST_BIT;
    buf[2] = (cot & 0x3F) | test | if negative { NEGATIVE_BIT } else { 0 };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AppLayerParameters {
        AppLayerParameters::default()
    }

    #[test]
    fn parses_header_fields() {
        // type_id=100, vsq=0x01, cot=0x06 (ACTIVATION), ca=0x0001 (LE), payload=[9]
        let buf = [100u8, 0x01, 0x06, 0x00, 0x01, 0x00, 9u8];
        let view = AsduView::parse(&buf, params()).unwrap();
        assert_eq!(view.type_id(), 100);
        assert_eq!(view.object_count(), 1);
        assert_eq!(view.cot(), cot::ACTIVATION);
        assert!(!view.negative());
        assert_eq!(view.common_address(), 1);
        assert_eq!(view.payload(), &[9u8]);
    }

    #[test]
    fn negative_and_test_bits_are_separate_from_cot_value() {
        let buf = [100u8, 0x01, 0x06 | 0x40 | 0x80, 0x00, 0x01, 0x00];
        let view = AsduView::parse(&buf, params()).unwrap();
        assert_eq!(view.cot(), cot::ACTIVATION);
        assert!(view.negative());
        assert!(view.test());
    }

    #[test]
    fn set_cot_preserves_test_bit_and_overwrites_negative() {
        let mut buf = [100u8, 0x01, 0x06 | 0x80, 0x00, 0x01, 0x00];
        set_cot(&mut buf, cot::UNKNOWN_TYPE_ID, true).unwrap();
        let view = AsduView::parse(&buf, params()).unwrap();
        assert_eq!(view.cot(), cot::UNKNOWN_TYPE_ID);
        assert!(view.negative());
        assert!(view.test());
    }

    #[test]
    fn rejects_undersized_buffer() {
        let buf = [100u8, 0x01];
        assert!(AsduView::parse(&buf, params()).is_err());
    }
}
