//! Legacy algorithm negotiation profile
//!
//! The hosts this pool connects to are frequently ancient Dropbear or
//! OpenSSH ≤ 7.2 builds. The profile below widens the offered algorithm set
//! well past modern defaults and orders the weakest entries first, trading
//! cryptographic strength for connection success. These tunnels are egress
//! plumbing, not a security boundary.

use std::borrow::Cow;
use std::sync::OnceLock;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::Preferred;

static LEGACY: OnceLock<Preferred> = OnceLock::new();

/// Algorithm preferences for the SSH handshake, built once and shared by
/// every connection attempt.
pub fn legacy_preferred() -> &'static Preferred {
    LEGACY.get_or_init(build_legacy_preferred)
}

fn build_legacy_preferred() -> Preferred {
    Preferred {
        // nistp521 is omitted: OpenSSH 7.2-era servers abort the handshake
        // when it appears in the client's kex proposal.
        kex: Cow::Owned(vec![
            russh::kex::DH_G1_SHA1,
            russh::kex::DH_G14_SHA1,
            russh::kex::ECDH_SHA2_NISTP256,
            russh::kex::ECDH_SHA2_NISTP384,
            russh::kex::DH_G14_SHA256,
            russh::kex::CURVE25519,
        ]),
        key: Cow::Owned(vec![
            Algorithm::Dsa,
            Algorithm::Rsa { hash: None },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
            Algorithm::Ed25519,
        ]),
        cipher: Cow::Owned(vec![
            russh::cipher::AES_128_CBC,
            russh::cipher::TRIPLE_DES_CBC,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_192_CTR,
            russh::cipher::AES_256_CTR,
            russh::cipher::CHACHA20_POLY1305,
        ]),
        mac: Cow::Owned(vec![
            russh::mac::HMAC_SHA1,
            russh::mac::HMAC_SHA256,
            russh::mac::HMAC_SHA512,
        ]),
        compression: Cow::Owned(vec![
            russh::compression::NONE,
            russh::compression::ZLIB,
            russh::compression::ZLIB_LEGACY,
        ]),
    }
}
