//! DESFire cryptographic session and command-authentication engine
//!
//! This crate implements the client side of the DESFire secure session
//! protocols: the mutual authentication exchanges (D40-native DES/3DES, the
//! EV1 ISO three-pass variants, and EV2 AES with a command counter), session
//! key derivation, and the MAC and encryption framing applied to every
//! subsequent card command.
//!
//! The main entry point is [`DesfireCrypto`], which a command layer drives
//! with the raw cryptograms exchanged with the card. Transport, command
//! envelopes and file services live above this crate; it only ever sees and
//! produces byte buffers.
//!
//! Everything here has to be bit-exact against real silicon: the ISO14443-A
//! CRC pair, the odd-byte MAC truncation, the EV2 session vector layout and
//! the 0x80 padding policy are all pinned down by tests.

pub mod constants;

mod auth;
mod context;
mod crypto;
mod error;
mod key;
mod keystore;
mod secure_messaging;
mod session;

pub use context::DesfireCrypto;
pub use crypto::{crc16, crc32, truncate_mac};
pub use error::{Error, Result};
pub use key::{DesfireKey, KeyDiversifier, KeyType};
pub use keystore::KeyStore;
pub use secure_messaging::{ChangeKeyRequest, SecureMessaging};
pub use session::{CryptoMethod, Session};
