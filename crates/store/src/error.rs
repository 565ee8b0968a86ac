/// Errors produced by the store core and its blob-level operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object 0 did not decode as a live store header. Call `format` first.
    #[error("store is not formatted")]
    NotFormatted,
    /// Every slot already holds a live chain; no index is free for a new
    /// head chunk.
    #[error("no free object slot is available")]
    StoreFull,
    /// No live head chunk carries this name.
    #[error("no blob named {0:?} was found")]
    NotFound(String),
    /// A caller-supplied blob name was empty or longer than 255 bytes.
    #[error("blob name must be 1 to 255 utf-8 bytes")]
    InvalidName,
    /// `store` was asked to encrypt a blob but the store has no
    /// `store_encryption_key_slot` configured.
    #[error("store was not formatted with an encryption key slot")]
    NoEncryptionKeyConfigured,
    /// `object_count_in_store` was outside `[MIN_OBJECT_COUNT,
    /// MAX_OBJECT_COUNT]`.
    #[error("object_count_in_store must be in [{min}, {max}], got {value}")]
    InvalidObjectCount {
        /// Lower bound, inclusive.
        min: u8,
        /// Upper bound, inclusive.
        max: u8,
        /// The value that was rejected.
        value: u8,
    },
    /// `object_size_in_store` was outside `[MIN_OBJECT_SIZE,
    /// configured max]`, or too small to carry a head chunk for a name of
    /// the requested length.
    #[error("object_size_in_store must be in [{min}, {max}], got {value}")]
    InvalidObjectSize {
        /// Lower bound, inclusive.
        min: u16,
        /// Upper bound, inclusive.
        max: u16,
        /// The value that was rejected.
        value: u16,
    },
    /// The number of configured device slot ids did not match
    /// `object_count_in_store` recovered from slot 0.
    #[error("configured {configured} device slot ids but the store header declares {declared}")]
    SlotCountMismatch {
        /// Number of ids the caller configured.
        configured: usize,
        /// Number object 0 declares.
        declared: u8,
    },
    /// A device I/O error, transient or fatal, propagated from the Device
    /// Abstraction.
    #[error("device error: {0}")]
    Device(#[from] piv_device::Error),
    /// The crypto envelope rejected a wire payload as malformed, or the
    /// PIN was wrong during decrypt.
    #[error("crypto error: {0}")]
    Crypto(#[from] piv_crypto::Error),
    /// The object codec rejected a value it was asked to encode (e.g. a
    /// payload that does not fit the configured object size).
    #[error("object codec error: {0}")]
    Codec(#[from] piv_codec::Error),
}
