//! The only surface the store core consumes to talk to a token.
//!
//! Two implementations are provided: [`MockDevice`], an in-memory emulator
//! used by every test in this workspace, and — behind the `hardware`
//! feature — [`hardware::PcscDevice`], a thin PC/SC shim. Both implement the
//! same [`Device`] trait, including the partial-write window on disconnect.
//!
//! The core never learns a transport-level reader name or a stable hardware
//! serial number; it only ever holds a [`DeviceHandle`]. Mapping a reader
//! string or serial to a `DeviceHandle` is the external collaborator's job.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[cfg(feature = "hardware")]
pub mod hardware;

/// Opaque identifier for an opened device connection.
///
/// Carries no transport information; it exists so logs and error messages
/// can name *which* device without the core ever branching on reader name
/// vs. serial number.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceHandle(Arc<str>);

impl DeviceHandle {
    /// Wrap an opaque identifier chosen by the external collaborator.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device-local 3-byte slot id, distinct from [`piv_core::SlotIndex`]. The
/// core is configured with a list of valid ids and never assumes a
/// numeric relationship between consecutive ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlotId(pub u32);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

/// What [`Device::read_object`] returns for a slot that has never been
/// written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObjectBytes {
    /// The slot has never been written (or was reset by `format`).
    Empty,
    /// The last bytes written to this slot.
    Data(Vec<u8>),
}

impl ObjectBytes {
    /// Borrow the bytes, or an empty slice for [`ObjectBytes::Empty`].
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ObjectBytes::Empty => &[],
            ObjectBytes::Data(bytes) => bytes,
        }
    }
}

/// Administrative credential accepted by [`Device::write_object`] and
/// [`Device::auth_admin`]: either a static management key or PIN-unlocked
/// retrieval already performed by the external collaborator. Retrieving a
/// PIN-protected management key is out of this crate's scope.
#[derive(Clone)]
pub enum AdminCredential {
    /// Raw management key bytes (typically 24 bytes for 3DES-length keys on
    /// PIV tokens; the device implementation decides what it expects).
    ManagementKey(Vec<u8>),
    /// A credential already unlocked by a PIN elsewhere; carried opaquely.
    PreAuthorized(Vec<u8>),
}

impl AdminCredential {
    fn as_bytes(&self) -> &[u8] {
        match self {
            AdminCredential::ManagementKey(b) => b,
            AdminCredential::PreAuthorized(b) => b,
        }
    }
}

/// User PIN presented to [`Device::ecdh`].
#[derive(Clone)]
pub struct Pin(String);

impl Pin {
    /// Wrap a PIN value.
    pub fn new(pin: impl Into<String>) -> Self {
        Self(pin.into())
    }
}

/// Errors surfaced by a [`Device`] implementation, at the granularity this
/// crate can actually observe; `piv-orchestrator::Error` wraps these via
/// `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient I/O failure; the caller may retry the single operation.
    #[error("device io error (transient): {0}")]
    IoTransient(String),
    /// Fatal I/O failure (e.g. physical disconnect). Writes may be partial.
    #[error("device io error (fatal): {0}")]
    IoFatal(String),
    /// Administrative credential rejected.
    #[error("administrative authentication failed")]
    AuthFailed,
    /// User PIN rejected; the device's own retry counter was decremented.
    #[error("wrong pin, {retries_remaining} retries remaining")]
    WrongPin {
        /// Retries remaining as reported by the device.
        retries_remaining: u32,
    },
    /// No key of the expected algorithm is present in the requested slot.
    #[error("no usable key in the requested slot")]
    KeyAbsent,
}

/// The capability interface the store core consumes.
///
/// Implementations must be safe to call from a single thread performing
/// blocking I/O; this crate and its callers never spawn threads or tasks of
/// their own.
pub trait Device {
    /// An opaque identifier for this connection, for logs only.
    fn handle(&self) -> &DeviceHandle;

    /// Read the last-written bytes of `slot`, or [`ObjectBytes::Empty`] if
    /// it was never written (or was reset).
    fn read_object(&self, slot: SlotId) -> Result<ObjectBytes, Error>;

    /// Write `bytes` to `slot`. Atomic from the host's perspective: on
    /// success the slot holds exactly `bytes`; on a fatal error the slot may
    /// hold a partial write.
    fn write_object(&self, slot: SlotId, bytes: &[u8], auth: &AdminCredential) -> Result<(), Error>;

    /// The uncompressed P-256 point (65 bytes, `0x04 || x || y`) of the EC
    /// key held in `slot`.
    fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error>;

    /// Perform ECDH on-device between the static key in `slot` and
    /// `peer_public`, returning the 32-byte shared secret. The static
    /// private key never leaves the device.
    fn ecdh(&self, slot: SlotId, peer_public: &[u8; 65], pin: &Pin) -> Result<[u8; 32], Error>;

    /// Validate an administrative credential, enabling subsequent writes.
    fn auth_admin(&self, credential: &AdminCredential) -> Result<(), Error>;
}

/// Lets a single device be shared across multiple `Store` handles, e.g. to
/// reopen a fresh store against the same underlying bytes after simulating
/// an interrupted write.
impl<D: Device + ?Sized> Device for std::sync::Arc<D> {
    fn handle(&self) -> &DeviceHandle {
        (**self).handle()
    }

    fn read_object(&self, slot: SlotId) -> Result<ObjectBytes, Error> {
        (**self).read_object(slot)
    }

    fn write_object(&self, slot: SlotId, bytes: &[u8], auth: &AdminCredential) -> Result<(), Error> {
        (**self).write_object(slot, bytes, auth)
    }

    fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error> {
        (**self).public_key(slot)
    }

    fn ecdh(&self, slot: SlotId, peer_public: &[u8; 65], pin: &Pin) -> Result<[u8; 32], Error> {
        (**self).ecdh(slot, peer_public, pin)
    }

    fn auth_admin(&self, credential: &AdminCredential) -> Result<(), Error> {
        (**self).auth_admin(credential)
    }
}

struct SlotState {
    bytes: Option<Vec<u8>>,
}

/// In-memory emulator backing every test in this workspace.
///
/// Simulates the partial-write window on disconnect via a configurable
/// per-write ejection probability, so crash-consistency tests can drive the
/// same partial-write semantics a real disconnect would produce.
pub struct MockDevice {
    handle: DeviceHandle,
    slots: Mutex<HashMap<u32, SlotState>>,
    admin_key: Vec<u8>,
    ec_keys: Mutex<HashMap<u32, (SecretKey, PublicKey)>>,
    pin: String,
    pin_retries: Mutex<u32>,
    eject_probability: f64,
    rng: Mutex<StdRng>,
}

impl MockDevice {
    /// Create an emulator with the given management key and user PIN, and
    /// no ejection simulation (deterministic writes).
    pub fn new(admin_key: impl Into<Vec<u8>>, pin: impl Into<String>) -> Self {
        Self {
            handle: DeviceHandle::new("mock-device"),
            slots: Mutex::new(HashMap::new()),
            admin_key: admin_key.into(),
            ec_keys: Mutex::new(HashMap::new()),
            pin: pin.into(),
            pin_retries: Mutex::new(3),
            eject_probability: 0.0,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Set the probability (0.0..=1.0) that any given `write_object` call
    /// is interrupted by a simulated ejection, used by the interruption
    /// fuzz.
    pub fn with_eject_probability(mut self, probability: f64) -> Self {
        self.eject_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Seed the emulator's RNG for reproducible fuzz runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Provision an EC key pair in `slot`, as if the hardware had generated
    /// (or imported) one. Required before `public_key`/`ecdh` succeed.
    pub fn provision_key(&self, slot: SlotId, secret: SecretKey) {
        let public = secret.public_key();
        self.ec_keys.lock().unwrap().insert(slot.0, (secret, public));
    }

    /// Generate and provision a fresh random EC key pair in `slot`,
    /// returning its public key.
    pub fn generate_key(&self, slot: SlotId) -> PublicKey {
        let secret = {
            let mut rng = self.rng.lock().unwrap();
            SecretKey::random(&mut *rng)
        };
        let public = secret.public_key();
        self.ec_keys.lock().unwrap().insert(slot.0, (secret, public));
        public
    }

    /// Reset every slot to empty, as `format` would.
    pub fn reset(&self) {
        self.slots.lock().unwrap().clear();
    }

    fn check_admin(&self, credential: &AdminCredential) -> Result<(), Error> {
        if credential.as_bytes() == self.admin_key.as_slice() {
            Ok(())
        } else {
            Err(Error::AuthFailed)
        }
    }

    fn roll_ejection(&self) -> bool {
        if self.eject_probability <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap();
        rng.gen_bool(self.eject_probability)
    }
}

impl Device for MockDevice {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn read_object(&self, slot: SlotId) -> Result<ObjectBytes, Error> {
        let slots = self.slots.lock().unwrap();
        match slots.get(&slot.0).and_then(|s| s.bytes.clone()) {
            Some(bytes) => Ok(ObjectBytes::Data(bytes)),
            None => Ok(ObjectBytes::Empty),
        }
    }

    fn write_object(&self, slot: SlotId, bytes: &[u8], auth: &AdminCredential) -> Result<(), Error> {
        self.check_admin(auth)?;

        if self.roll_ejection() {
            // Simulate ejection mid-write: either nothing reached the slot,
            // or a truncated prefix did. Either way the call reports a
            // fatal error and the caller must reload + sanitize.
            let write_truncated = {
                let mut rng = self.rng.lock().unwrap();
                rng.gen_bool(0.5)
            };
            if write_truncated && !bytes.is_empty() {
                let mut rng = self.rng.lock().unwrap();
                let cut = rng.gen_range(0..bytes.len());
                let mut slots = self.slots.lock().unwrap();
                slots.insert(slot.0, SlotState { bytes: Some(bytes[..cut].to_vec()) });
            }
            return Err(Error::IoFatal(format!("simulated ejection during write to {slot}")));
        }

        let mut slots = self.slots.lock().unwrap();
        slots.insert(slot.0, SlotState { bytes: Some(bytes.to_vec()) });
        Ok(())
    }

    fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error> {
        let keys = self.ec_keys.lock().unwrap();
        let (_, public) = keys.get(&slot.0).ok_or(Error::KeyAbsent)?;
        let encoded = public.to_encoded_point(false);
        let mut out = [0u8; 65];
        out.copy_from_slice(encoded.as_bytes());
        Ok(out)
    }

    fn ecdh(&self, slot: SlotId, peer_public: &[u8; 65], pin: &Pin) -> Result<[u8; 32], Error> {
        if pin.0 != self.pin {
            let mut retries = self.pin_retries.lock().unwrap();
            *retries = retries.saturating_sub(1);
            return Err(Error::WrongPin { retries_remaining: *retries });
        }

        let keys = self.ec_keys.lock().unwrap();
        let (secret, _) = keys.get(&slot.0).ok_or(Error::KeyAbsent)?;

        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| Error::IoFatal("malformed peer public key".into()))?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    fn auth_admin(&self, credential: &AdminCredential) -> Result<(), Error> {
        self.check_admin(credential)
    }
}
