//! RADIUS packet header.
//!
//! Layout: 1-byte code, 1-byte identifier, 2-byte big-endian length (total,
//! including this header), 16-byte authenticator, then the attribute region.

use crate::{Error, Result};

pub const HEADER_LEN: usize = 20;
pub const MAX_PACKET_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    AccessRequest,
    AccessAccept,
    AccessReject,
    AccessChallenge,
    StatusServer,
    Other(u8),
}

impl From<u8> for Code {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::AccessRequest,
            2 => Self::AccessAccept,
            3 => Self::AccessReject,
            11 => Self::AccessChallenge,
            12 => Self::StatusServer,
            other => Self::Other(other),
        }
    }
}

impl From<Code> for u8 {
    fn from(value: Code) -> Self {
        match value {
            Code::AccessRequest => 1,
            Code::AccessAccept => 2,
            Code::AccessReject => 3,
            Code::AccessChallenge => 11,
            Code::StatusServer => 12,
            Code::Other(v) => v,
        }
    }
}

/// A borrowed view over a RADIUS packet buffer.
///
/// `Packet` never copies; it only reads/writes in place. Callers own the
/// underlying `Vec<u8>`/`BytesMut` and hand a slice to these accessors.
pub struct Packet;

impl Packet {
    /// Rejects a declared RADIUS length outside `HEADER_LEN..=MAX_PACKET_LEN`.
    /// Shared by [`Packet::received_len`] (whole datagram already in hand)
    /// and by stream transports, which must validate the length from a
    /// 4-byte prefix before reading the rest of the frame off the wire.
    pub fn validate_declared_length(declared: usize) -> Result<()> {
        if declared < HEADER_LEN || declared > MAX_PACKET_LEN {
            return Err(Error::InvalidLength(declared));
        }
        Ok(())
    }

    /// Reads the declared RADIUS length and checks it against the received
    /// byte count, per §4.6: reject short packets, reject an out-of-range
    /// declared length, and tolerate (silently truncate) trailing bytes
    /// beyond the declared length.
    ///
    /// Returns the validated length to truncate the buffer to.
    pub fn received_len(buf: &[u8]) -> Result<usize> {
        if buf.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        Self::validate_declared_length(declared)?;

        if buf.len() < declared {
            return Err(Error::TooShort);
        }

        Ok(declared)
    }

    pub fn code(buf: &[u8]) -> Code {
        Code::from(buf[0])
    }

    pub fn set_code(buf: &mut [u8], code: Code) {
        buf[0] = code.into();
    }

    pub fn identifier(buf: &[u8]) -> u8 {
        buf[1]
    }

    pub fn set_identifier(buf: &mut [u8], id: u8) {
        buf[1] = id;
    }

    pub fn length(buf: &[u8]) -> u16 {
        u16::from_be_bytes([buf[2], buf[3]])
    }

    pub fn set_length(buf: &mut [u8], len: u16) {
        buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn authenticator(buf: &[u8]) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(&buf[4..20]);
        out
    }

    pub fn set_authenticator(buf: &mut [u8], auth: &[u8; 16]) {
        buf[4..20].copy_from_slice(auth);
    }

    pub fn attributes(buf: &[u8]) -> &[u8] {
        &buf[HEADER_LEN..]
    }

    pub fn attributes_mut(buf: &mut [u8]) -> &mut [u8] {
        &mut buf[HEADER_LEN..]
    }

    /// Builds the minimal 20-byte header for a synthesized reply that has no
    /// attributes (e.g. a Status-Server Access-Accept).
    pub fn build_header(code: Code, id: u8, authenticator: [u8; 16]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        Self::set_code(&mut buf, code);
        Self::set_identifier(&mut buf, id);
        Self::set_length(&mut buf, HEADER_LEN as u16);
        Self::set_authenticator(&mut buf, &authenticator);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(Packet::received_len(&[0u8; 10]), Err(Error::TooShort)));
    }

    #[test]
    fn rejects_out_of_range_declared_length() {
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_length(&mut buf, 4);
        assert!(matches!(
            Packet::received_len(&buf),
            Err(Error::InvalidLength(4))
        ));
    }

    #[test]
    fn truncates_to_declared_length() {
        let mut buf = vec![0u8; HEADER_LEN + 10];
        Packet::set_length(&mut buf, HEADER_LEN as u16);
        assert_eq!(Packet::received_len(&buf).unwrap(), HEADER_LEN);
    }

    #[test]
    fn code_round_trips() {
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessReject);
        assert_eq!(Packet::code(&buf), Code::AccessReject);
    }
}
