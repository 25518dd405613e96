#![allow(missing_docs)]
//! Symmetric primitives: keystream XOR, one-time authentication, and the
//! pluggable payload transform.

use poly1305::universal_hash::KeyInit;
use poly1305::{Key, Poly1305};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use subtle::ConstantTimeEq;

use crate::nonce::NONCE_SIZE;

/// Session key size; also the size of the derived one-time MAC key.
pub const KEY_SIZE: usize = 32;
/// Authentication tag size.
pub const TAG_SIZE: usize = 16;
/// Stream cipher block size; plaintext is laid out past one full block so
/// the leading keystream doubles as the per-datagram MAC key.
pub const S20BS: usize = 64;

/// XOR the Salsa20 keystream for `(key, nonce)` over `buf` in place.
pub fn xor_stream(buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) {
    let mut cipher = Salsa20::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

/// One-time Poly1305 authenticator. `key_auth` must never authenticate more
/// than one message.
pub fn mac(msg: &[u8], key_auth: &[u8; KEY_SIZE]) -> [u8; TAG_SIZE] {
    Poly1305::new(Key::from_slice(key_auth))
        .compute_unpadded(msg)
        .into()
}

/// Constant-time tag verification.
pub fn mac_verify(tag: &[u8; TAG_SIZE], msg: &[u8], key_auth: &[u8; KEY_SIZE]) -> bool {
    let computed = mac(msg, key_auth);
    computed[..].ct_eq(&tag[..]).into()
}

/// Confidentiality transform applied over the datagram payload region.
///
/// The stream-cipher transform is the default; alternative modes (an
/// all-or-nothing transform with chaffing, for deployments that must avoid
/// nominal encryption) plug in at this seam without touching the datapath.
pub trait FrameTransform: Send {
    /// Transform the outbound payload region in place.
    fn seal(&self, buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]);
    /// Invert the transform on the inbound payload region in place.
    fn open(&self, buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]);
}

/// Default transform: Salsa20 keystream XOR (an involution, so both
/// directions are the same operation).
pub struct StreamTransform;

impl FrameTransform for StreamTransform {
    fn seal(&self, buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) {
        xor_stream(buf, nonce, key);
    }

    fn open(&self, buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) {
        xor_stream(buf, nonce, key);
    }
}
