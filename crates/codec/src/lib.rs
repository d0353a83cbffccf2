//! ## RADIUS wire format
//!
//! [RFC2865]: https://tools.ietf.org/html/rfc2865
//! [RFC2548]: https://tools.ietf.org/html/rfc2548
//!
//! A RADIUS packet is a 20-byte header (code, identifier, length,
//! authenticator) followed by a flat list of type-length-value attributes.
//! This crate walks and validates that attribute list, and carries the
//! MD5/HMAC-MD5 primitives that bind a reply to the request that provoked it
//! and re-encrypt password-bearing attributes under a different shared
//! secret as a packet moves from one RADIUS hop to the next.

pub mod attribute;
pub mod crypto;
pub mod packet;

pub use attribute::Attributes;
pub use packet::{Code, HEADER_LEN, Packet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet shorter than the 20-byte RADIUS header")]
    TooShort,
    #[error("declared RADIUS length {0} is out of the valid 20..=4096 range")]
    InvalidLength(usize),
    #[error("attribute at offset {offset} has length {length}, below the minimum of 2")]
    AttributeTooShort { offset: usize, length: u8 },
    #[error("attribute at offset {offset} runs past the end of the attribute region")]
    AttributeOverrun { offset: usize },
    #[error("vendor-specific attribute value is shorter than the 4-byte vendor id")]
    VendorIdTruncated,
    #[error("password attribute length {0} is not a multiple of 16 in 16..=128")]
    InvalidPasswordLength(usize),
    #[error("MS-MPPE key attribute value shorter than the 2-byte salt plus one 16-byte block")]
    MppeKeyTooShort,
}

pub type Result<T> = std::result::Result<T, Error>;
