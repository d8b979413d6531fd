//! Chip-session crypto context
//!
//! [`DesfireCrypto`] is the surface the command layer talks to: it owns the
//! key store, the response buffer and the current session, resolves keys for
//! the handshakes, and forwards secure messaging calls to whichever variant
//! the last authentication installed.
//!
//! The context is not thread safe; it belongs to exactly one chip session at
//! a time, the same way one card is in the field at a time.

use bytes::BytesMut;
use rand::TryRngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::auth::{Ev2Handshake, IsoHandshake, LegacyHandshake, PendingAuth};
use crate::error::{Error, Result};
use crate::key::{self, DesfireKey, KeyDiversifier, KeyType};
use crate::keystore::KeyStore;
use crate::secure_messaging::ChangeKeyRequest;
use crate::session::Session;

/// Crypto context for one DESFire chip session
#[derive(Debug, Default)]
pub struct DesfireCrypto {
    store: KeyStore,
    diversifier: Option<Box<dyn KeyDiversifier>>,
    identifier: Vec<u8>,
    current_aid: u32,
    buf: BytesMut,
    pending: Option<PendingAuth>,
    session: Option<Session>,
}

impl DesfireCrypto {
    /// Create a context with an empty key store and no session
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the context to a chip identifier and drop all stored keys
    pub fn set_crypto_context(&mut self, identifier: Vec<u8>) {
        self.identifier = identifier;
        self.clear_keys();
    }

    /// Identifier of the chip this context is bound to
    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    /// Install a key diversification scheme
    pub fn set_diversifier(&mut self, diversifier: Box<dyn KeyDiversifier>) {
        self.diversifier = Some(diversifier);
    }

    /// Switch the active application. Any session or pending handshake is
    /// invalidated; the card requires a fresh authentication afterwards.
    pub fn select_application(&mut self, aid: u32) {
        debug!(aid, "selecting application");
        self.current_aid = aid;
        self.session = None;
        self.pending = None;
    }

    /// The currently selected application
    pub const fn current_aid(&self) -> u32 {
        self.current_aid
    }

    // --- Key management -----------------------------------------------------

    /// Insert or overwrite a key in the store
    pub fn set_key(&mut self, aid: u32, keyset: u8, key_no: u8, key: DesfireKey) {
        self.store.set_key(aid, keyset, key_no, key);
    }

    /// Set keys `0..nb_keys` of one keyset to copies of `key`
    pub fn fill_keyset(&mut self, aid: u32, keyset: u8, nb_keys: u8, key: &DesfireKey) {
        self.store.fill_keyset(aid, keyset, nb_keys, key);
    }

    /// Drop every stored key
    pub fn clear_keys(&mut self) {
        self.store.clear();
    }

    /// Seed the factory default keys for a location: the single master key
    /// for the card level (AID 0), otherwise the 14 application key slots
    pub fn set_default_keys_at(&mut self, aid: u32, key_type: KeyType) {
        if aid == 0 {
            self.store
                .set_key(0, 0, 0, DesfireKey::default_key(KeyType::Des));
        } else {
            for key_no in 0..14 {
                self.store
                    .set_key(aid, 0, key_no, DesfireKey::default_key(key_type));
            }
        }
    }

    /// Populate every keyset of a freshly created application with default
    /// keys of the requested crypto method
    pub fn create_application(
        &mut self,
        aid: u32,
        nb_keysets: u8,
        nb_keys: u8,
        key_type: KeyType,
    ) {
        for keyset in 0..nb_keysets {
            self.store
                .fill_keyset(aid, keyset, nb_keys, &DesfireKey::default_key(key_type));
        }
    }

    /// Clone a keyset under a new keyset number, preserving per-key types
    pub fn duplicate_key_set(&mut self, aid: u32, src_keyset: u8, dst_keyset: u8) {
        self.store.duplicate_key_set(aid, src_keyset, dst_keyset);
    }

    /// Retag every key of a keyset with a new crypto method
    pub fn set_keyset_key_type(&mut self, aid: u32, keyset: u8, key_type: KeyType) {
        self.store.set_keyset_key_type(aid, keyset, key_type);
    }

    /// Access the underlying key store
    pub const fn key_store(&self) -> &KeyStore {
        &self.store
    }

    fn resolve_key(&self, aid: u32, keyset: u8, key_no: u8, diversify: Option<&[u8]>) -> Vec<u8> {
        let key = self.store.get(aid, keyset, key_no);
        key::resolve_material(&key, self.diversifier.as_deref(), diversify)
    }

    // --- Authentication -----------------------------------------------------

    /// First half of the D40-native authentication: consume the card's RndB
    /// cryptogram, return the RndA || RndB' cryptogram to send back
    pub fn authenticate_legacy_part1(
        &mut self,
        key_no: u8,
        diversify: Option<&[u8]>,
        enc_rnd_b: &[u8],
    ) -> Result<Vec<u8>> {
        self.session = None;
        self.pending = None;

        let auth_key = self.resolve_key(self.current_aid, 0, key_no, diversify);
        let rnd_a = random_challenge::<8>()?;
        let (pending, token) =
            LegacyHandshake::begin(self.current_aid, key_no, auth_key, enc_rnd_b, rnd_a)?;
        self.pending = Some(PendingAuth::Legacy(pending));
        Ok(token)
    }

    /// Second half of the D40-native authentication: verify the card's RndA'
    /// and commit the session
    pub fn authenticate_legacy_part2(&mut self, enc_rnd_a: &[u8]) -> Result<()> {
        match self.pending.take() {
            Some(PendingAuth::Legacy(handshake)) => {
                let session = handshake.finish(enc_rnd_a)?;
                debug!(
                    aid = session.aid(),
                    key_no = session.key_no(),
                    "authenticated (legacy)"
                );
                self.session = Some(session);
                Ok(())
            }
            other => {
                self.pending = other;
                Err(Error::InvalidArgument("no legacy authentication in progress"))
            }
        }
    }

    /// First half of the EV1 ISO authentication. The stored key's type picks
    /// the cipher and the challenge length (8 for DES/2K3DES, 16 for
    /// 3K3DES/AES).
    pub fn authenticate_iso_part1(
        &mut self,
        key_no: u8,
        diversify: Option<&[u8]>,
        enc_rnd_b: &[u8],
    ) -> Result<Vec<u8>> {
        self.session = None;
        self.pending = None;

        let key_type = self.store.get(self.current_aid, 0, key_no).key_type();
        let auth_key = self.resolve_key(self.current_aid, 0, key_no, diversify);

        let mut rnd_a = vec![0u8; key_type.random_len()];
        fill_random(&mut rnd_a)?;

        let (pending, token) = IsoHandshake::begin(
            self.current_aid,
            key_no,
            key_type,
            auth_key,
            enc_rnd_b,
            rnd_a,
        )?;
        self.pending = Some(PendingAuth::Iso(pending));
        Ok(token)
    }

    /// Second half of the EV1 ISO authentication
    pub fn authenticate_iso_part2(&mut self, enc_rnd_a: &[u8]) -> Result<()> {
        match self.pending.take() {
            Some(PendingAuth::Iso(handshake)) => {
                let session = handshake.finish(enc_rnd_a)?;
                debug!(
                    aid = session.aid(),
                    key_no = session.key_no(),
                    "authenticated (ISO)"
                );
                self.session = Some(session);
                Ok(())
            }
            other => {
                self.pending = other;
                Err(Error::InvalidArgument("no ISO authentication in progress"))
            }
        }
    }

    /// First half of AuthenticateEV2First
    pub fn authenticate_ev2_part1(
        &mut self,
        key_no: u8,
        diversify: Option<&[u8]>,
        enc_rnd_b: &[u8],
    ) -> Result<Vec<u8>> {
        self.session = None;
        self.pending = None;

        let auth_key = self.resolve_key(self.current_aid, 0, key_no, diversify);
        let rnd_a = random_challenge::<16>()?;
        let (pending, token) =
            Ev2Handshake::begin(self.current_aid, key_no, auth_key, enc_rnd_b, rnd_a)?;
        self.pending = Some(PendingAuth::Ev2(pending));
        Ok(token)
    }

    /// Second half of AuthenticateEV2First: verify TI || RndA' and commit the
    /// session with a fresh command counter
    pub fn authenticate_ev2_part2(&mut self, data: &[u8]) -> Result<()> {
        match self.pending.take() {
            Some(PendingAuth::Ev2(handshake)) => {
                let session = handshake.finish(data)?;
                debug!(
                    aid = session.aid(),
                    key_no = session.key_no(),
                    "authenticated (EV2)"
                );
                self.session = Some(session);
                Ok(())
            }
            other => {
                self.pending = other;
                Err(Error::InvalidArgument("no EV2 authentication in progress"))
            }
        }
    }

    // --- Secure messaging ---------------------------------------------------

    /// The active session, if any
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Key number of the active session
    pub fn authenticated_key_no(&self) -> Option<u8> {
        self.session.as_ref().map(Session::key_no)
    }

    /// MAC size of the active secure messaging (4 before any authentication,
    /// matching the native default)
    pub fn mac_size(&self) -> usize {
        self.session.as_ref().map_or(4, Session::mac_size)
    }

    /// Block size of the active secure messaging
    pub fn block_size(&self) -> usize {
        self.session.as_ref().map_or(8, Session::block_size)
    }

    /// EV2 command counter of the active session
    pub fn command_counter(&self) -> Option<u16> {
        self.session.as_ref().and_then(Session::command_counter)
    }

    /// EV2 transaction identifier of the active session
    pub fn transaction_identifier(&self) -> Option<[u8; 4]> {
        self.session
            .as_ref()
            .and_then(Session::transaction_identifier)
    }

    /// Append raw response bytes ahead of a verify or decrypt pass
    pub fn append_decipher_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reset the response buffer at the start of a command exchange
    pub fn init_buffer(&mut self) {
        self.buf.clear();
    }

    /// MAC for an outgoing command
    pub fn generate_mac(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(Error::NotAuthenticated)?
            .messaging_mut()
            .generate_mac(cmd, data)
    }

    /// Accumulate response bytes and, when `end` is set, check the trailing
    /// MAC over everything gathered since the last `init_buffer`. The buffer
    /// is consumed by the final call.
    pub fn verify_mac(&mut self, end: bool, data: &[u8]) -> Result<bool> {
        let session = self.session.as_mut().ok_or(Error::NotAuthenticated)?;
        self.buf.extend_from_slice(data);
        if !end {
            return Ok(true);
        }

        let buf = self.buf.split();
        session.messaging_mut().verify_mac(&buf)
    }

    /// Encrypt command data for transmission
    pub fn encrypt(&mut self, data: &[u8], param: &[u8], calc_crc: bool) -> Result<Vec<u8>> {
        self.session
            .as_mut()
            .ok_or(Error::NotAuthenticated)?
            .messaging_mut()
            .encrypt(data, param, calc_crc)
    }

    /// Decrypt the accumulated response buffer. `length` gives the expected
    /// plaintext length, or 0 to recover it from the padding.
    pub fn decrypt(&mut self, length: usize) -> Result<Vec<u8>> {
        let session = self.session.as_mut().ok_or(Error::NotAuthenticated)?;
        session.messaging_mut().decrypt(&self.buf, length)
    }

    /// Build the cryptogram for changing a key on the card.
    ///
    /// `key_no` may carry wire-level flag bits; the store lookup masks them
    /// off. A non-zero `keyset_no` routes EV2 sessions through ChangeKeyEV2.
    pub fn change_key_picc(
        &mut self,
        key_no: u8,
        keyset_no: u8,
        new_key: &DesfireKey,
        old_key_diversify: Option<&[u8]>,
        new_key_diversify: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let old_material = self.resolve_key(
            self.current_aid,
            keyset_no,
            key_no & 0x3F,
            old_key_diversify,
        );
        let new_material =
            key::resolve_material(new_key, self.diversifier.as_deref(), new_key_diversify);

        let session = self.session.as_mut().ok_or(Error::NotAuthenticated)?;
        let request = ChangeKeyRequest {
            key_no,
            keyset_no,
            old_key: &old_material,
            new_key: &new_material,
            new_key_type: new_key.key_type(),
            new_key_version: new_key.version(),
            auth_key_no: session.key_no(),
        };
        session.messaging_mut().change_key_cryptogram(&request)
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::Entropy)
}

fn random_challenge<const N: usize>() -> Result<[u8; N]> {
    let mut rnd = [0u8; N];
    fill_random(&mut rnd)?;
    Ok(rnd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, block_cipher_encrypt};
    use hex_literal::hex;

    #[test]
    fn test_messaging_requires_session() {
        let mut crypto = DesfireCrypto::new();
        assert!(matches!(
            crypto.generate_mac(0x00, b"data"),
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            crypto.encrypt(b"data", &[], true),
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(crypto.decrypt(0), Err(Error::NotAuthenticated)));
    }

    #[test]
    fn test_part2_without_part1_is_rejected() {
        let mut crypto = DesfireCrypto::new();
        assert!(matches!(
            crypto.authenticate_legacy_part2(&[0u8; 8]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            crypto.authenticate_ev2_part2(&[0u8; 32]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mismatched_part2_variant_is_rejected() {
        let mut crypto = DesfireCrypto::new();
        let key = DesfireKey::new(KeyType::Aes, vec![0u8; 16]);
        crypto.set_key(0, 0, 0, key);

        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &[0u8; 16], &[0u8; 16], &[0x42; 16]).unwrap();
        crypto.authenticate_ev2_part1(0, None, &enc_rnd_b).unwrap();

        // A legacy part 2 cannot complete an EV2 handshake.
        assert!(matches!(
            crypto.authenticate_legacy_part2(&[0u8; 8]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_select_application_drops_session_state() {
        let mut crypto = DesfireCrypto::new();
        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &[0u8; 16], &[0u8; 16], &[0x42; 16]).unwrap();
        crypto.set_key(0, 0, 0, DesfireKey::new(KeyType::Aes, vec![0u8; 16]));
        crypto.authenticate_ev2_part1(0, None, &enc_rnd_b).unwrap();

        crypto.select_application(0x0000F5);
        assert_eq!(crypto.current_aid(), 0x0000F5);
        assert!(matches!(
            crypto.authenticate_ev2_part2(&[0u8; 32]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_default_mac_and_block_size() {
        let crypto = DesfireCrypto::new();
        assert_eq!(crypto.mac_size(), 4);
        assert_eq!(crypto.block_size(), 8);
        assert_eq!(crypto.command_counter(), None);
        assert_eq!(crypto.transaction_identifier(), None);
    }

    #[test]
    fn test_set_default_keys_at() {
        let mut crypto = DesfireCrypto::new();
        crypto.set_default_keys_at(0, KeyType::Aes);
        assert_eq!(crypto.key_store().len(), 1);
        assert_eq!(crypto.key_store().get(0, 0, 0).key_type(), KeyType::Des);

        crypto.clear_keys();
        crypto.set_default_keys_at(0x0000F5, KeyType::Aes);
        assert_eq!(crypto.key_store().len(), 14);
        assert_eq!(
            crypto.key_store().get(0x0000F5, 0, 13).key_type(),
            KeyType::Aes
        );
    }

    #[test]
    fn test_create_application_fills_all_keysets() {
        let mut crypto = DesfireCrypto::new();
        crypto.create_application(0x0000F5, 2, 3, KeyType::Aes);
        assert_eq!(crypto.key_store().len(), 6);
        assert_eq!(
            crypto.key_store().get(0x0000F5, 1, 2).key_type(),
            KeyType::Aes
        );
    }

    #[test]
    fn test_set_crypto_context_clears_keys() {
        let mut crypto = DesfireCrypto::new();
        crypto.set_key(0, 0, 0, DesfireKey::new(KeyType::Aes, vec![0x11; 16]));
        crypto.set_crypto_context(hex!("04112233445566").to_vec());
        assert!(crypto.key_store().is_empty());
        assert_eq!(crypto.identifier(), hex!("04112233445566"));
    }

    #[test]
    fn test_buffer_accumulation() {
        let mut crypto = DesfireCrypto::new();
        crypto.append_decipher_data(&[0x01, 0x02]);
        crypto.append_decipher_data(&[0x03]);
        assert_eq!(crypto.buf.as_ref(), &[0x01, 0x02, 0x03]);
        crypto.init_buffer();
        assert!(crypto.buf.is_empty());
    }
}
