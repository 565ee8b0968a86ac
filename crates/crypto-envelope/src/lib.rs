//! Hybrid ECDH + HKDF + AES-CBC envelope wrapped around a blob payload at
//! the store boundary.
//!
//! Integrity comes from the store's age-based chain consistency, not an
//! AEAD tag: this envelope is deliberately unauthenticated. A caller that
//! needs tamper-evidence on top of this should layer it above the store,
//! not inside this module.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand_core::OsRng;
use sha2::Sha256;

use piv_device::{Device, Pin};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Length in bytes of an uncompressed P-256 point.
const PUBLIC_KEY_LEN: usize = 65;
/// Length in bytes of the AES-CBC IV.
const IV_LEN: usize = 16;
/// Minimum wire size: an envelope shorter than this cannot even hold the
/// ephemeral public key and IV.
const MIN_WIRE_LEN: usize = PUBLIC_KEY_LEN + IV_LEN;

/// Errors surfaced by the envelope.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wire payload is too short, or PKCS7 unpadding failed. Both
    /// cases collapse to one variant rather than two, so a caller can't
    /// use the error to distinguish truncation from a bad padding byte.
    #[error("envelope is malformed or truncated")]
    CorruptEnvelope,
    /// The user PIN was rejected during the on-device ECDH.
    #[error("wrong pin, {retries_remaining} retries remaining")]
    PinError {
        /// Retries remaining as reported by the device.
        retries_remaining: u32,
    },
    /// Any other device failure encountered while performing the ECDH.
    #[error("device error during envelope unwrap: {0}")]
    Device(#[from] piv_device::Error),
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key).expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Encrypt `plaintext` for the holder of `peer_public`. `peer_public` is
/// the store's static EC public key, read once via [`Device::public_key`]
/// by the caller.
pub fn encrypt(plaintext: &[u8], peer_public: &[u8; PUBLIC_KEY_LEN]) -> Result<Vec<u8>, Error> {
    let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::CorruptEnvelope)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&peer);
    let key = derive_key(shared.raw_secret_bytes().as_slice());

    let mut iv = [0u8; IV_LEN];
    rand_core::RngCore::fill_bytes(&mut OsRng, &mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut wire = Vec::with_capacity(PUBLIC_KEY_LEN + IV_LEN + ciphertext.len());
    wire.extend_from_slice(ephemeral_public.as_bytes());
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(&ciphertext);
    Ok(wire)
}

/// Decrypt `wire` using a device-resident static private key. The static
/// private key never leaves `device`; only the 32-byte shared secret
/// crosses the boundary.
pub fn decrypt<D: Device>(wire: &[u8], device: &D, slot_id: piv_device::SlotId, pin: &Pin) -> Result<Vec<u8>, Error> {
    if wire.len() < MIN_WIRE_LEN {
        return Err(Error::CorruptEnvelope);
    }
    let mut ephemeral_public = [0u8; PUBLIC_KEY_LEN];
    ephemeral_public.copy_from_slice(&wire[..PUBLIC_KEY_LEN]);
    let iv = &wire[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + IV_LEN];
    let ciphertext = &wire[PUBLIC_KEY_LEN + IV_LEN..];

    let shared_secret = match device.ecdh(slot_id, &ephemeral_public, pin) {
        Ok(secret) => secret,
        Err(piv_device::Error::WrongPin { retries_remaining }) => {
            return Err(Error::PinError { retries_remaining })
        }
        Err(other) => return Err(Error::Device(other)),
    };
    let key = derive_key(&shared_secret);

    let mut iv_arr = [0u8; IV_LEN];
    iv_arr.copy_from_slice(iv);
    let plaintext = Aes256CbcDec::new(&key.into(), &iv_arr.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::CorruptEnvelope)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use piv_device::{AdminCredential, MockDevice, SlotId};

    fn device_with_key() -> (MockDevice, SlotId, [u8; PUBLIC_KEY_LEN]) {
        let dev = MockDevice::new(b"mgmt".to_vec(), "123456");
        let slot = SlotId(0x5F_0001);
        let public = dev.generate_key(slot);
        let encoded = public.to_encoded_point(false);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(encoded.as_bytes());
        (dev, slot, bytes)
    }

    #[test]
    fn round_trips_arbitrary_length_plaintext() {
        let (dev, slot, public) = device_with_key();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext = vec![0x5Au8; len];
            let wire = encrypt(&plaintext, &public).unwrap();
            assert!(wire.len() >= plaintext.len() + MIN_WIRE_LEN);
            assert!(wire.len() <= plaintext.len() + MIN_WIRE_LEN + 16);
            let got = decrypt(&wire, &dev, slot, &Pin::new("123456")).unwrap();
            assert_eq!(got, plaintext);
        }
    }

    #[test]
    fn short_wire_is_corrupt() {
        let (dev, slot, _) = device_with_key();
        let err = decrypt(&[0u8; 10], &dev, slot, &Pin::new("123456")).unwrap_err();
        assert!(matches!(err, Error::CorruptEnvelope));
    }

    #[test]
    fn wrong_pin_surfaces_retry_count() {
        let (dev, slot, public) = device_with_key();
        let wire = encrypt(b"secret", &public).unwrap();
        let err = decrypt(&wire, &dev, slot, &Pin::new("000000")).unwrap_err();
        assert!(matches!(err, Error::PinError { retries_remaining: 2 }));
    }

    #[test]
    fn tampered_ciphertext_is_corrupt_not_a_panic() {
        let (dev, slot, public) = device_with_key();
        let mut wire = encrypt(b"tamper me", &public).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let err = decrypt(&wire, &dev, slot, &Pin::new("123456")).unwrap_err();
        assert!(matches!(err, Error::CorruptEnvelope));
    }
}
