use derive_more::{AsRef, Deref, From};
use rustc_hash::FxBuildHasher;
use std::collections::HashSet as StdHashSet;

/// Width in bytes of a [`FixedSizeKey`].
pub const KEY_LEN: usize = 4;

/// Opaque 4-byte identifier used by the key registry.
///
/// The bytes are only compared for equality; the registry never interprets
/// them. Deriving a key from a resource ID, idempotency token or request
/// fingerprint is up to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, From, AsRef, Deref)]
#[repr(transparent)]
pub struct FixedSizeKey([u8; KEY_LEN]);

impl FixedSizeKey {
    /// Builds a key from the first [`KEY_LEN`] bytes of `bytes`.
    ///
    /// Shorter inputs are zero-padded on the right, longer ones are
    /// truncated, so `b"ab"` and `b"ab\0\0"` name the same key.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut key = [0; KEY_LEN];
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; KEY_LEN] {
        self.0
    }
}

impl From<&[u8]> for FixedSizeKey {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<&[u8; KEY_LEN]> for FixedSizeKey {
    fn from(bytes: &[u8; KEY_LEN]) -> Self {
        Self(*bytes)
    }
}

impl From<u32> for FixedSizeKey {
    /// Big-endian, so numeric and byte-wise ordering agree.
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

pub(crate) type HashSet<T> = StdHashSet<T, FxBuildHasher>;
