//! MD5/HMAC-MD5 primitives used to bind replies to requests and re-encrypt
//! password-bearing attributes as a packet crosses from one shared secret to
//! another.
//!
//! [RFC2865]: https://tools.ietf.org/html/rfc2865
//! [RFC2548]: https://tools.ietf.org/html/rfc2548

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::attribute::MESSAGE_AUTHENTICATOR;
use crate::packet::HEADER_LEN;
use crate::{Attributes, Error, Result};

type HmacMd5 = Hmac<Md5>;

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Signs a datagram reply the proxy generates itself (e.g. a synthesized
/// Status-Server Access-Accept): writes
/// `MD5(code || id || length || 16-zero-bytes || attributes || secret)`
/// into the authenticator field.
///
/// # Test
///
/// ```
/// use radius_proxy_codec::crypto::sign_response_authenticator;
/// use radius_proxy_codec::packet::Packet;
///
/// let mut buf = Packet::build_header(radius_proxy_codec::Code::AccessAccept, 7, [0u8; 16]);
/// sign_response_authenticator(&mut buf, b"secret");
/// assert_ne!(buf[4..20], [0u8; 16]);
/// ```
pub fn sign_response_authenticator(buf: &mut [u8], secret: &[u8]) {
    let auth = md5(&[&buf[0..4], &[0u8; 16], &buf[HEADER_LEN..], secret]);
    buf[4..20].copy_from_slice(&auth);
}

/// Validates a reply's authenticator against the request authenticator that
/// provoked it: `MD5(reply_header || request_auth || reply_attributes ||
/// secret) == reply.authenticator`.
pub fn verify_reply_authenticator(reply: &[u8], request_authenticator: &[u8; 16], secret: &[u8]) -> bool {
    if reply.len() < HEADER_LEN {
        return false;
    }
    let expected = md5(&[
        &reply[0..4],
        request_authenticator,
        &reply[HEADER_LEN..],
        secret,
    ]);
    expected == reply[4..20]
}

/// Computes the HMAC-MD5 Message-Authenticator value over the whole packet
/// (header included) with the Message-Authenticator attribute's value field
/// zeroed.
///
/// `buf` is the full packet (header + attribute region) and `attrs` must
/// have been scanned from `&buf[HEADER_LEN..]`; it must already contain a
/// Message-Authenticator (80) attribute (any value, typically zeroed) — this
/// function does not insert one.
pub fn compute_message_authenticator(buf: &[u8], attrs: &Attributes, secret: &[u8]) -> Result<[u8; 16]> {
    let entry = attrs
        .iter()
        .find(|e| e.kind == MESSAGE_AUTHENTICATOR)
        .ok_or(Error::AttributeOverrun { offset: 0 })?;
    let (start, end) = (HEADER_LEN + entry.start, HEADER_LEN + entry.end);

    let mut scratch = buf.to_vec();
    scratch[start..end].fill(0);

    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(&scratch);
    Ok(mac.finalize().into_bytes().into())
}

/// Verifies an inbound packet's Message-Authenticator attribute, if present.
/// `buf` is the full packet and `attrs` must have been scanned from
/// `&buf[HEADER_LEN..]`. Returns `Ok(true)` if present and valid or absent
/// (absence is not itself a failure at this layer — callers that require
/// the attribute check presence separately via `Attributes::has`), `Ok(false)`
/// if present and invalid.
pub fn verify_message_authenticator(buf: &[u8], attrs: &Attributes, secret: &[u8]) -> Result<bool> {
    let Some(entry) = attrs.iter().find(|e| e.kind == MESSAGE_AUTHENTICATOR) else {
        return Ok(true);
    };
    let (start, end) = (HEADER_LEN + entry.start, HEADER_LEN + entry.end);

    let mut received = [0u8; 16];
    let value = &buf[start..end];
    if value.len() != 16 {
        return Ok(false);
    }
    received.copy_from_slice(value);

    let mut scratch = buf.to_vec();
    scratch[start..end].fill(0);

    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(&scratch);
    Ok(mac.verify_slice(&received).is_ok())
}

/// Verifies a Message-Authenticator after temporarily splicing a different
/// request authenticator into the reply-authenticator field — used when
/// validating an upstream reply's Message-Authenticator, which is computed
/// over the packet as the upstream sent it but must be checked against the
/// authenticator the proxy itself generated for the outbound request.
pub fn verify_message_authenticator_with_authenticator(
    buf: &[u8],
    attrs: &Attributes,
    spliced_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<bool> {
    let mut spliced = buf.to_vec();
    spliced[4..20].copy_from_slice(spliced_authenticator);
    verify_message_authenticator(&spliced, attrs, secret)
}

const BLOCK_LEN: usize = 16;

/// RFC2865 User-Password / Tunnel-Password decrypt: the `n`-th plaintext
/// block is `ciphertext_n XOR MD5(secret || chain_n)`, where `chain_1 =
/// request_authenticator` and `chain_n = ciphertext_{n-1}` for `n > 1`.
pub fn decrypt_password(ciphertext: &[u8], secret: &[u8], request_authenticator: &[u8; 16]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 || ciphertext.len() > 128 {
        return Err(Error::InvalidPasswordLength(ciphertext.len()));
    }

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut chain = *request_authenticator;
    for block in ciphertext.chunks(BLOCK_LEN) {
        let mask = md5(&[secret, &chain]);
        for (c, m) in block.iter().zip(mask.iter()) {
            out.push(c ^ m);
        }
        chain.copy_from_slice(block);
    }
    Ok(out)
}

/// RFC2865 User-Password / Tunnel-Password encrypt: the inverse of
/// [`decrypt_password`] — chains on the ciphertext it produces, not the
/// plaintext it consumes.
pub fn encrypt_password(plaintext: &[u8], secret: &[u8], request_authenticator: &[u8; 16]) -> Result<Vec<u8>> {
    if plaintext.is_empty() || plaintext.len() % BLOCK_LEN != 0 || plaintext.len() > 128 {
        return Err(Error::InvalidPasswordLength(plaintext.len()));
    }

    let mut out = Vec::with_capacity(plaintext.len());
    let mut chain = *request_authenticator;
    for block in plaintext.chunks(BLOCK_LEN) {
        let mask = md5(&[secret, &chain]);
        let mut cipher_block = [0u8; BLOCK_LEN];
        for (i, (p, m)) in block.iter().zip(mask.iter()).enumerate() {
            cipher_block[i] = p ^ m;
        }
        out.extend_from_slice(&cipher_block);
        chain = cipher_block;
    }
    Ok(out)
}

/// Re-encrypts a User-Password/Tunnel-Password value from one hop's secret
/// and authenticator to the next hop's, per §4.2/§4.8: decrypt under
/// `(from_secret, from_authenticator)`, re-encrypt under
/// `(to_secret, to_authenticator)`.
pub fn reencrypt_password(
    ciphertext: &[u8],
    from_secret: &[u8],
    from_authenticator: &[u8; 16],
    to_secret: &[u8],
    to_authenticator: &[u8; 16],
) -> Result<Vec<u8>> {
    let plain = decrypt_password(ciphertext, from_secret, from_authenticator)?;
    encrypt_password(&plain, to_secret, to_authenticator)
}

/// MS-MPPE-Send-Key / MS-MPPE-Recv-Key value layout: 2-byte salt followed by
/// ciphertext in 16-byte blocks. `b_1 = MD5(secret || authenticator ||
/// salt)`, `b_i = MD5(secret || c_{i-1})` for `i > 1`.
fn mppe_transform(value: &[u8], secret: &[u8], authenticator: &[u8; 16], decrypt: bool) -> Result<(u16, Vec<u8>)> {
    if value.len() < 2 + BLOCK_LEN {
        return Err(Error::MppeKeyTooShort);
    }
    let salt = u16::from_be_bytes([value[0], value[1]]);
    let body = &value[2..];
    if body.len() % BLOCK_LEN != 0 {
        return Err(Error::MppeKeyTooShort);
    }

    let mut out = Vec::with_capacity(body.len());
    let mut mask = md5(&[secret, authenticator, &value[0..2]]);
    for block in body.chunks(BLOCK_LEN) {
        let mut xored = [0u8; BLOCK_LEN];
        for (i, (b, m)) in block.iter().zip(mask.iter()).enumerate() {
            xored[i] = b ^ m;
        }
        out.extend_from_slice(&xored);

        // the chain always advances on ciphertext: `block` itself when
        // decrypting, the just-produced `xored` output when encrypting.
        let cipher_block: &[u8] = if decrypt { block } else { &xored };
        mask = md5(&[secret, cipher_block]);
    }
    Ok((salt, out))
}

/// Re-encrypts an MS-MPPE-Send-Key/Recv-Key value from one hop's secret and
/// authenticator to the next, keeping the original salt, per §4.2/§4.8.
pub fn reencrypt_mppe_key(
    value: &[u8],
    from_secret: &[u8],
    from_authenticator: &[u8; 16],
    to_secret: &[u8],
    to_authenticator: &[u8; 16],
) -> Result<Vec<u8>> {
    let (salt, plain) = mppe_transform(value, from_secret, from_authenticator, true)?;
    let (_, cipher) = mppe_encrypt(&plain, to_secret, to_authenticator, salt)?;
    Ok(cipher)
}

fn mppe_encrypt(plain: &[u8], secret: &[u8], authenticator: &[u8; 16], salt: u16) -> Result<(u16, Vec<u8>)> {
    if plain.len() % BLOCK_LEN != 0 {
        return Err(Error::MppeKeyTooShort);
    }
    let salt_bytes = salt.to_be_bytes();
    let mut out = Vec::with_capacity(2 + plain.len());
    out.extend_from_slice(&salt_bytes);

    let mut mask = md5(&[secret, authenticator, &salt_bytes]);
    for block in plain.chunks(BLOCK_LEN) {
        let mut cipher_block = [0u8; BLOCK_LEN];
        for (i, (p, m)) in block.iter().zip(mask.iter()).enumerate() {
            cipher_block[i] = p ^ m;
        }
        out.extend_from_slice(&cipher_block);
        mask = md5(&[secret, &cipher_block]);
    }
    Ok((salt, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips_every_valid_length() {
        let secret = b"s3cret";
        let auth = [7u8; 16];
        for len in (16..=128).step_by(16) {
            let plain: Vec<u8> = (0..len as u8).collect();
            let cipher = encrypt_password(&plain, secret, &auth).unwrap();
            let decoded = decrypt_password(&cipher, secret, &auth).unwrap();
            assert_eq!(decoded, plain, "length {len}");
        }
    }

    #[test]
    fn password_rejects_non_multiple_of_16() {
        assert!(matches!(
            encrypt_password(&[1, 2, 3], b"secret", &[0u8; 16]),
            Err(Error::InvalidPasswordLength(3))
        ));
    }

    #[test]
    fn mppe_round_trips() {
        let secret = b"radsec";
        let auth = [9u8; 16];
        let plain = vec![1u8; 32];
        let (salt, cipher) = mppe_encrypt(&plain, secret, &auth, 0x8001).unwrap();
        let mut value = salt.to_be_bytes().to_vec();
        value.extend_from_slice(&cipher);

        let (decoded_salt, decoded) = mppe_transform(&value, secret, &auth, true).unwrap();
        assert_eq!(decoded_salt, 0x8001);
        assert_eq!(decoded, plain);
    }

    #[test]
    fn reply_authenticator_round_trips() {
        let secret = b"up-secret";
        let request_auth = [3u8; 16];
        let mut reply = vec![2u8, 7, 0, 20];
        reply.extend_from_slice(&[0u8; 16]);

        let signed = md5(&[&reply[0..4], &request_auth, &reply[HEADER_LEN..], secret]);
        reply[4..20].copy_from_slice(&signed);

        assert!(verify_reply_authenticator(&reply, &request_auth, secret));
        assert!(!verify_reply_authenticator(&reply, &[0u8; 16], secret));
    }
}
