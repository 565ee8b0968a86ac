//! `PivStore`: the seven caller-facing operations — `format`, `store`,
//! `fetch`, `remove`, `list`, `fsck`, `public_key` — tying the Device
//! Abstraction, Object Codec, Store Model, Sanitizer and Crypto Envelope
//! crates together into one session against one device.
//!
//! This crate owns none of the on-device semantics itself; it validates
//! caller input, maps the lower crates' error taxonomies onto one surface,
//! retries a transient device read once before giving up, and wraps every
//! operation in a `tracing` span.
//!
//! ```
//! use piv_device::{AdminCredential, MockDevice, Pin, SlotId};
//! use piv_orchestrator::{Config, PivStore};
//!
//! let device = MockDevice::new(b"mgmt-key".to_vec(), "123456");
//! let slots: Vec<SlotId> = (0..8).map(|i| SlotId(0x5F_0000 + i)).collect();
//! let admin = AdminCredential::ManagementKey(b"mgmt-key".to_vec());
//!
//! let mut piv = PivStore::format(device, slots, admin, Config::new(512, 0)).unwrap();
//! piv.store("greeting", b"Hello, world!\n", false).unwrap();
//! assert_eq!(piv.fetch("greeting", &Pin::new("123456")).unwrap(), b"Hello, world!\n");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use piv_device::{AdminCredential, Device, Pin, SlotId};
use piv_store::{BlobInfo, FsckReport, Store};
use tracing::{instrument, warn};

/// Validated parameters a store is formatted with.
///
/// `object_count_in_store` is not a separate field here: it is implied by
/// the length of the `slot_ids` list [`PivStore::format`] is called with,
/// matching the Device Abstraction's model of a caller-supplied slot list
/// rather than a count resolved against some assumed numbering.
///
/// `max_object_size` bounds `object_size` at format time but is never
/// stamped into the wire format; it exists so a deployment targeting
/// different hardware can raise or lower the ceiling without this crate
/// changing, while [`piv_core::DEFAULT_MAX_OBJECT_SIZE`] remains a
/// reasonable default for the reference device.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size in bytes of every object slot, `object_size_in_store`.
    pub object_size: u16,
    /// Upper bound `object_size` is validated against.
    pub max_object_size: u16,
    /// Reference-scheme offset (`0` for none) of the device slot holding the
    /// store's static EC key, stamped into every object's common header.
    pub store_encryption_key_slot: u8,
}

impl Config {
    /// Build a config with the default `max_object_size` ceiling.
    pub fn new(object_size: u16, store_encryption_key_slot: u8) -> Self {
        Self {
            object_size,
            max_object_size: piv_core::DEFAULT_MAX_OBJECT_SIZE,
            store_encryption_key_slot,
        }
    }

    /// Override the `max_object_size` ceiling, for hardware other than the
    /// reference device.
    pub fn with_max_object_size(mut self, max_object_size: u16) -> Self {
        self.max_object_size = max_object_size;
        self
    }
}

/// Errors surfaced by [`PivStore`]'s public operations: the lower crates'
/// richer error taxonomies, collapsed onto the shapes a caller actually
/// needs to branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store has not been formatted; call [`PivStore::format`] first.
    #[error("store is not formatted")]
    NotFormatted,
    /// Every object slot already holds a live chain.
    #[error("no free object slot is available")]
    StoreFull,
    /// No live blob carries this name.
    #[error("no blob named {0:?} was found")]
    NotFound(String),
    /// A blob name was empty or longer than 255 UTF-8 bytes.
    #[error("blob name must be 1 to 255 utf-8 bytes")]
    InvalidName,
    /// The store's format-time configuration was rejected.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    /// Administrative credential (management key) rejected by the device.
    #[error("administrative authentication failed")]
    AuthError,
    /// User PIN rejected by the device during an on-device ECDH.
    #[error("wrong pin, {retries_remaining} retries remaining")]
    PinError {
        /// Retries remaining as reported by the device.
        retries_remaining: u32,
    },
    /// The crypto envelope rejected a wire payload as malformed.
    #[error("crypto error: {0}")]
    CryptoError(String),
    /// A device I/O error that was not (or could no longer be) retried.
    #[error("device io error: {0}")]
    DeviceIO(String),
}

impl From<piv_device::Error> for Error {
    fn from(err: piv_device::Error) -> Self {
        match err {
            piv_device::Error::IoTransient(msg) | piv_device::Error::IoFatal(msg) => Error::DeviceIO(msg),
            piv_device::Error::AuthFailed => Error::AuthError,
            piv_device::Error::WrongPin { retries_remaining } => Error::PinError { retries_remaining },
            piv_device::Error::KeyAbsent => Error::CryptoError("no usable key in the requested slot".into()),
        }
    }
}

impl From<piv_crypto::Error> for Error {
    fn from(err: piv_crypto::Error) -> Self {
        match err {
            piv_crypto::Error::CorruptEnvelope => Error::CryptoError("envelope is malformed or truncated".into()),
            piv_crypto::Error::PinError { retries_remaining } => Error::PinError { retries_remaining },
            piv_crypto::Error::Device(device_err) => device_err.into(),
        }
    }
}

impl From<piv_store::Error> for Error {
    fn from(err: piv_store::Error) -> Self {
        use piv_store::Error as E;
        match err {
            E::NotFormatted => Error::NotFormatted,
            E::StoreFull => Error::StoreFull,
            E::NotFound(name) => Error::NotFound(name),
            E::InvalidName => Error::InvalidName,
            E::NoEncryptionKeyConfigured => {
                Error::CryptoError("store was not formatted with an encryption key slot".into())
            }
            E::InvalidObjectCount { min, max, value } => {
                Error::InvalidConfig(format!("object_count must be in [{min}, {max}], got {value}"))
            }
            E::InvalidObjectSize { min, max, value } => {
                Error::InvalidConfig(format!("object_size must be in [{min}, {max}], got {value}"))
            }
            E::SlotCountMismatch { configured, declared } => Error::InvalidConfig(format!(
                "configured {configured} device slot ids but the store header declares {declared}"
            )),
            E::Device(device_err) => device_err.into(),
            E::Crypto(crypto_err) => crypto_err.into(),
            E::Codec(codec_err) => Error::InvalidConfig(codec_err.to_string()),
        }
    }
}

/// Does `err` describe a transient device I/O failure, anywhere in the
/// chain of wrapped errors a fetch or fsck can produce?
fn transient_message(err: &piv_store::Error) -> Option<&str> {
    match err {
        piv_store::Error::Device(piv_device::Error::IoTransient(msg)) => Some(msg),
        piv_store::Error::Crypto(piv_crypto::Error::Device(piv_device::Error::IoTransient(msg))) => Some(msg),
        _ => None,
    }
}

/// Call `op` once, and again exactly once more if the first attempt failed
/// on a transient device I/O error. Every other error, and a second
/// transient failure, surfaces immediately.
fn retry_once<T>(mut op: impl FnMut() -> Result<T, piv_store::Error>) -> Result<T, piv_store::Error> {
    let first = op();
    if let Err(ref err) = first {
        if let Some(msg) = transient_message(err) {
            warn!(error = %msg, "retrying once after a transient device io error");
            return op();
        }
    }
    first
}

/// An opened, formatted object store, ready for `store`/`fetch`/`remove`.
pub struct PivStore<D: Device> {
    store: Store<D>,
}

impl<D: Device> PivStore<D> {
    /// Format every slot in `slot_ids` on `device` to empty per `config`,
    /// and return the freshly opened store.
    ///
    /// The device's own retry counters and admin state are whatever `auth`
    /// grants; `format` does not itself authenticate — the device
    /// implementation is responsible for enforcing admin auth on writes.
    #[instrument(skip(device, auth), fields(object_count = slot_ids.len(), object_size = config.object_size))]
    pub fn format(device: D, slot_ids: Vec<SlotId>, auth: AdminCredential, config: Config) -> Result<Self, Error> {
        let store = Store::format(
            device,
            slot_ids,
            auth,
            config.object_size,
            config.max_object_size,
            config.store_encryption_key_slot,
        )?;
        Ok(Self { store })
    }

    /// Open an already-formatted store, running the sanitizer once before
    /// returning.
    #[instrument(skip(device, auth))]
    pub fn open(device: D, slot_ids: Vec<SlotId>, auth: AdminCredential) -> Result<Self, Error> {
        let store = Store::open(device, slot_ids, auth)?;
        Ok(Self { store })
    }

    /// Store `bytes` under `name`, optionally wrapped in the crypto
    /// envelope against the store's configured encryption key.
    #[instrument(skip(self, bytes), fields(name, len = bytes.len(), encrypt))]
    pub fn store(&mut self, name: &str, bytes: &[u8], encrypt: bool) -> Result<(), Error> {
        Ok(retry_once(|| self.store.store(name, bytes, encrypt))?)
    }

    /// Fetch the plaintext bytes of `name`, decrypting through the crypto
    /// envelope if the blob was stored encrypted.
    #[instrument(skip(self, pin), fields(name))]
    pub fn fetch(&mut self, name: &str, pin: &Pin) -> Result<Vec<u8>, Error> {
        Ok(retry_once(|| self.store.fetch(name, pin))?)
    }

    /// Remove `name`, freeing every chunk in its chain.
    #[instrument(skip(self), fields(name))]
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        Ok(retry_once(|| self.store.remove(name))?)
    }

    /// Every live blob currently in the store.
    #[instrument(skip(self))]
    pub fn list(&self) -> Vec<BlobInfo> {
        self.store.list()
    }

    /// Read every configured slot straight off the device with no sanitize
    /// pass applied, for diagnostics.
    #[instrument(skip(self))]
    pub fn fsck(&self) -> Result<FsckReport, Error> {
        Ok(retry_once(|| self.store.fsck())?)
    }

    /// The uncompressed P-256 public key held in `slot`, read directly from
    /// the device.
    #[instrument(skip(self))]
    pub fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error> {
        Ok(retry_once(|| self.store.public_key(slot))?)
    }
}
