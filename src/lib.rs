#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod crypto;
pub mod error;
pub mod nonce;
pub mod peer;
pub mod replay;
pub mod shaper;
pub mod tap;
pub mod udp;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::crypto::{mac, mac_verify, xor_stream};
    use crate::nonce::{put_uvarint, uvarint, NonceCipher, Xtea, NONCE_SIZE};
    use crate::peer::max_frame_len;
    use crate::replay::{ReplayWindow, NONCE_BUCKET_SIZE};
    use crate::shaper::cpr_cycle;

    #[test]
    fn test_uvarint_encoding() {
        let mut buf = [0u8; 8];
        assert_eq!(put_uvarint(&mut buf, 1), 1);
        assert_eq!(buf[0], 0x01);

        buf.fill(0);
        assert_eq!(put_uvarint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0xAC, 0x02]);

        buf.fill(0);
        put_uvarint(&mut buf, 3);
        assert_eq!(buf, [3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_uvarint_roundtrip() {
        let mut buf = [0u8; 10];
        for value in [0u64, 1, 127, 128, 300, 16383, 1 << 20, u64::MAX / 3] {
            buf.fill(0);
            let n = put_uvarint(&mut buf, value);
            assert_eq!(uvarint(&buf[..n]), value);
            // Zero padding past the terminator must not change the decode.
            assert_eq!(uvarint(&buf), value);
        }
    }

    #[test]
    fn test_uvarint_truncated_is_zero() {
        assert_eq!(uvarint(&[0x80]), 0);
        assert_eq!(uvarint(&[]), 0);
    }

    #[test]
    fn test_xtea_reference_vector() {
        // Reference vector shared with the Go x/crypto implementation.
        let key: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ];
        let xtea = Xtea::new(&key);
        let mut block = *b"ABCDEFGH";
        xtea.encrypt_block(&mut block);
        assert_eq!(block, [0x49, 0x7D, 0xF3, 0xD0, 0x72, 0x61, 0x2C, 0xB5]);
        xtea.decrypt_block(&mut block);
        assert_eq!(&block, b"ABCDEFGH");
    }

    #[test]
    fn test_nonce_cipher_roundtrip() {
        let key = [0x42u8; 32];
        let cipher = NonceCipher::new(&key);
        let mut nonce = [0u8; NONCE_SIZE];
        put_uvarint(&mut nonce, 12345);
        let clear = nonce;
        cipher.encrypt(&mut nonce);
        assert_ne!(nonce, clear);
        cipher.decrypt(&mut nonce);
        assert_eq!(nonce, clear);
    }

    #[test]
    fn test_nonce_cipher_deterministic() {
        let key = [0x42u8; 32];
        let mut a = [7u8; NONCE_SIZE];
        let mut b = [7u8; NONCE_SIZE];
        NonceCipher::new(&key).encrypt(&mut a);
        NonceCipher::new(&key).encrypt(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_xor_stream_involution() {
        let key = [9u8; 32];
        let nonce = [1u8; NONCE_SIZE];
        let msg = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut buf = msg.clone();
        xor_stream(&mut buf, &nonce, &key);
        assert_ne!(buf, msg);
        xor_stream(&mut buf, &nonce, &key);
        assert_eq!(buf, msg);
    }

    #[test]
    fn test_mac_verify() {
        let key_auth = [0x33u8; 32];
        let msg = b"authenticated payload";
        let tag = mac(msg, &key_auth);
        assert!(mac_verify(&tag, msg, &key_auth));

        let mut tampered = msg.to_vec();
        tampered[0] ^= 1;
        assert!(!mac_verify(&tag, &tampered, &key_auth));

        let mut bad_tag = tag;
        bad_tag[15] ^= 1;
        assert!(!mac_verify(&bad_tag, msg, &key_auth));
    }

    #[test]
    fn test_replay_window() {
        let mut replay = ReplayWindow::new();
        assert!(replay.check(1));
        assert!(!replay.check(1));
        assert!(replay.check(2));
        assert!(replay.check(3));
        assert!(!replay.check(2));
    }

    #[test]
    fn test_replay_window_roll_keeps_previous_bucket() {
        let mut replay = ReplayWindow::new();
        for nonce in 1..=NONCE_BUCKET_SIZE as u64 {
            assert!(replay.check(nonce));
        }
        // The window rolled; everything accepted so far is still detected.
        for nonce in 1..=NONCE_BUCKET_SIZE as u64 {
            assert!(!replay.check(nonce));
        }
    }

    #[test]
    fn test_replay_window_forgets_after_two_rolls() {
        let mut replay = ReplayWindow::new();
        for nonce in 1..=(2 * NONCE_BUCKET_SIZE) as u64 {
            assert!(replay.check(nonce));
        }
        // Two rolls later, the oldest nonce has been evicted.
        assert!(replay.check(1));
    }

    #[test]
    fn test_cpr_cycle() {
        assert_eq!(cpr_cycle(0, 1452), Duration::ZERO);
        assert_eq!(cpr_cycle(10, 1452), Duration::from_secs(1) / 7);
        // Rates below one datagram per second clamp instead of dividing by zero.
        assert_eq!(cpr_cycle(1, 1452), Duration::from_secs(1));
    }

    #[test]
    fn test_max_frame_len() {
        assert_eq!(max_frame_len(1452), 1442);
    }
}
