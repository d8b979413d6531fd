//! DESFire key material, versioning and diversification
//!
//! Keys are immutable once constructed. DES keys are carried as 16-byte
//! two-half material (the single-DES case is the one where both halves agree
//! once parity bits are masked), matching what the card expects on the wire.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Cipher family of a DESFire key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyType {
    /// Single DES, stored as 16-byte repeated-half material
    #[default]
    Des,
    /// Two-key triple DES
    TripleDes,
    /// Three-key triple DES
    TripleDes3K,
    /// AES-128
    Aes,
}

impl KeyType {
    /// Canonical key material length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::Des | Self::TripleDes | Self::Aes => 16,
            Self::TripleDes3K => 24,
        }
    }

    /// Block size of the underlying cipher
    pub const fn block_size(self) -> usize {
        match self {
            Self::Aes => 16,
            _ => 8,
        }
    }

    /// Length of the random challenge used by the ISO authentication variant
    pub const fn random_len(self) -> usize {
        match self {
            Self::Des | Self::TripleDes => 8,
            Self::TripleDes3K | Self::Aes => 16,
        }
    }
}

/// A DESFire key: raw material, cipher family and version byte
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DesfireKey {
    #[zeroize(skip)]
    key_type: KeyType,
    data: Vec<u8>,
    #[zeroize(skip)]
    version: u8,
    #[zeroize(skip)]
    diversification_enabled: bool,
}

impl DesfireKey {
    /// Create a key from raw material.
    ///
    /// No length validation happens here; the material is checked at the
    /// point of use so the store can hold placeholder entries.
    pub fn new(key_type: KeyType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key_type,
            data: data.into(),
            version: 0,
            diversification_enabled: false,
        }
    }

    /// Attach a key version byte.
    ///
    /// For DES-family keys the version travels inside the parity bits of the
    /// material; for AES it is a separate byte on the wire.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Mark the key as subject to diversification
    pub fn with_diversification(mut self) -> Self {
        self.diversification_enabled = true;
        self
    }

    /// The canonical all-zero key of the requested type, used as the factory
    /// key before any key has been personalised
    pub fn default_key(key_type: KeyType) -> Self {
        Self::new(key_type, vec![0x00; key_type.key_len()])
    }

    /// Cipher family of this key
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key version byte
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Raw key material
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether diversification applies to this key
    pub const fn diversification_enabled(&self) -> bool {
        self.diversification_enabled
    }

    /// True when the key carries no usable material (absent or all zero)
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0x00)
    }

    pub(crate) fn set_key_type(&mut self, key_type: KeyType) {
        self.key_type = key_type;
    }
}

/// Derives per-card key material from a base key and a diversification input.
///
/// This is the seam for diversification schemes such as NXP AV2; the engine
/// only needs the derived bytes back.
pub trait KeyDiversifier: std::fmt::Debug {
    /// Compute the diversified material for `key` from `input`
    fn diversify(&self, key: &DesfireKey, input: &[u8]) -> Vec<u8>;
}

/// Embed a key version into the parity bits of the first 8 bytes of DES-family
/// material. The version is laid down MSB-first: bit 7 lands in the parity bit
/// of byte 0.
pub(crate) fn embed_version(material: &mut [u8], version: u8) {
    if material.len() < 8 {
        return;
    }
    for i in 0..8 {
        material[7 - i] = (material[7 - i] & 0xFE) | ((version >> i) & 0x01);
    }
}

/// Resolve the wire material for a key: diversified if requested and possible,
/// all-zero for empty keys, versioned for DES-family types.
pub(crate) fn resolve_material(
    key: &DesfireKey,
    diversifier: Option<&dyn KeyDiversifier>,
    diversify: Option<&[u8]>,
) -> Vec<u8> {
    let mut material = match (key.diversification_enabled(), diversifier, diversify) {
        (true, Some(d), Some(input)) if !input.is_empty() => d.diversify(key, input),
        _ => {
            if key.is_empty() {
                vec![0x00; key.key_type().key_len()]
            } else {
                key.data().to_vec()
            }
        }
    };

    if key.key_type() != KeyType::Aes {
        embed_version(&mut material, key.version());
    }

    material
}
