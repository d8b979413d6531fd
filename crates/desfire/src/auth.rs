//! Mutual authentication handshakes
//!
//! Each variant is a two-message challenge/response exchange modelled as a
//! by-value pending state: `begin` produces the response to send to the card,
//! `finish` consumes the pending state and either returns a fully built
//! [`Session`] or an error. Session state is never partially committed; a
//! failed exchange simply drops the pending value.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::sv_label;
use crate::crypto::{
    CipherKind, block_cipher_decrypt, block_cipher_encrypt, cbc_send, cmac_aes, is_triple_des,
};
use crate::error::{Error, Result};
use crate::key::KeyType;
use crate::secure_messaging::{Ev2Messaging, IsoMessaging, LegacyMessaging};
use crate::session::{CryptoMethod, Session};

/// Rotate one byte from the front to the back
fn rotate_left(data: &[u8]) -> Vec<u8> {
    let mut out = data[1..].to_vec();
    out.push(data[0]);
    out
}

/// Rotate one byte from the back to the front
fn rotate_right(data: &[u8]) -> Vec<u8> {
    let mut out = vec![data[data.len() - 1]];
    out.extend_from_slice(&data[..data.len() - 1]);
    out
}

/// Pending state of whichever handshake is in flight
#[derive(Debug)]
pub(crate) enum PendingAuth {
    Legacy(LegacyHandshake),
    Iso(IsoHandshake),
    Ev2(Ev2Handshake),
}

/// D40-native two-pass authentication (DES/2K3DES)
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub(crate) struct LegacyHandshake {
    #[zeroize(skip)]
    aid: u32,
    #[zeroize(skip)]
    key_no: u8,
    auth_key: Vec<u8>,
    rnd_a: [u8; 8],
    rnd_b: [u8; 8],
}

impl LegacyHandshake {
    /// Decrypt the card's RndB cryptogram and build the RndA || RndB'
    /// response to send back.
    pub(crate) fn begin(
        aid: u32,
        key_no: u8,
        auth_key: Vec<u8>,
        enc_rnd_b: &[u8],
        rnd_a: [u8; 8],
    ) -> Result<(Self, Vec<u8>)> {
        if enc_rnd_b.len() != 8 {
            return Err(Error::Protocol("wrong RndB cryptogram length"));
        }

        let rnd_b_vec = cbc_send(&auth_key, &[], enc_rnd_b)?;
        let mut rnd_b = [0u8; 8];
        rnd_b.copy_from_slice(&rnd_b_vec);

        let mut rnd_ab = rnd_a.to_vec();
        rnd_ab.extend_from_slice(&rotate_left(&rnd_b));
        let token = cbc_send(&auth_key, &[], &rnd_ab)?;

        let pending = Self {
            aid,
            key_no,
            auth_key,
            rnd_a,
            rnd_b,
        };
        Ok((pending, token))
    }

    /// Verify the card's RndA' and derive the session key.
    ///
    /// The session key interleaves the first halves of both challenges; for a
    /// single-DES key the same 8 bytes repeat, which is the D40-specified
    /// construction, not an accident.
    pub(crate) fn finish(self, enc_rnd_a: &[u8]) -> Result<Session> {
        if enc_rnd_a.len() != 8 {
            return Err(Error::Protocol("wrong RndA cryptogram length"));
        }

        let rnd_a2 = cbc_send(&self.auth_key, &[], enc_rnd_a)?;
        if rotate_right(&rnd_a2) != self.rnd_a {
            return Err(Error::AuthenticationFailed("RndA and RndA' do not match"));
        }

        let mut session_key = Vec::with_capacity(16);
        session_key.extend_from_slice(&self.rnd_a[..4]);
        session_key.extend_from_slice(&self.rnd_b[..4]);
        if is_triple_des(&self.auth_key) {
            session_key.extend_from_slice(&self.rnd_a[4..8]);
            session_key.extend_from_slice(&self.rnd_b[4..8]);
        } else {
            session_key.extend_from_slice(&self.rnd_a[..4]);
            session_key.extend_from_slice(&self.rnd_b[..4]);
        }

        Ok(Session::new(
            self.aid,
            self.key_no,
            CryptoMethod::Legacy,
            Box::new(LegacyMessaging::new(session_key)),
        ))
    }
}

/// EV1 three-pass authentication behind ISO framing (DES family or AES)
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub(crate) struct IsoHandshake {
    #[zeroize(skip)]
    aid: u32,
    #[zeroize(skip)]
    key_no: u8,
    #[zeroize(skip)]
    key_type: KeyType,
    auth_key: Vec<u8>,
    rnd_a: Vec<u8>,
    rnd_b: Vec<u8>,
    last_iv: Vec<u8>,
}

impl IsoHandshake {
    const fn cipher_kind(key_type: KeyType) -> CipherKind {
        match key_type {
            KeyType::Aes => CipherKind::Aes,
            _ => CipherKind::Des,
        }
    }

    /// Decrypt the card's RndB under a null IV and reply with a proper
    /// CBC-encrypted RndA || RndB', chaining the IV through the exchange.
    pub(crate) fn begin(
        aid: u32,
        key_no: u8,
        key_type: KeyType,
        auth_key: Vec<u8>,
        enc_rnd_b: &[u8],
        rnd_a: Vec<u8>,
    ) -> Result<(Self, Vec<u8>)> {
        let random_len = key_type.random_len();
        let kind = Self::cipher_kind(key_type);
        let bs = kind.block_size();

        if enc_rnd_b.len() != random_len {
            return Err(Error::Protocol("wrong RndB cryptogram length"));
        }

        let zero_iv = vec![0x00; bs];
        let rnd_b = block_cipher_decrypt(kind, &auth_key, &zero_iv, enc_rnd_b)?;
        let mut last_iv = enc_rnd_b[enc_rnd_b.len() - bs..].to_vec();

        let mut rnd_ab = rnd_a.clone();
        rnd_ab.extend_from_slice(&rotate_left(&rnd_b));
        let token = block_cipher_encrypt(kind, &auth_key, &last_iv, &rnd_ab)?;
        last_iv = token[token.len() - bs..].to_vec();

        let pending = Self {
            aid,
            key_no,
            key_type,
            auth_key,
            rnd_a,
            rnd_b,
            last_iv,
        };
        Ok((pending, token))
    }

    /// Verify the card's RndA' and derive the session key for the key type
    pub(crate) fn finish(self, enc_rnd_a: &[u8]) -> Result<Session> {
        let random_len = self.key_type.random_len();
        let kind = Self::cipher_kind(self.key_type);

        if enc_rnd_a.len() != random_len {
            return Err(Error::Protocol("wrong RndA cryptogram length"));
        }

        let rnd_a2 = block_cipher_decrypt(kind, &self.auth_key, &self.last_iv, enc_rnd_a)?;
        if rotate_right(&rnd_a2) != self.rnd_a {
            return Err(Error::AuthenticationFailed("RndA and RndA' do not match"));
        }

        let a = &self.rnd_a;
        let b = &self.rnd_b;
        let mut session_key = Vec::with_capacity(self.auth_key.len());
        match self.key_type {
            KeyType::Des | KeyType::TripleDes => {
                session_key.extend_from_slice(&a[..4]);
                session_key.extend_from_slice(&b[..4]);
                if is_triple_des(&self.auth_key) {
                    session_key.extend_from_slice(&a[4..8]);
                    session_key.extend_from_slice(&b[4..8]);
                } else {
                    session_key.extend_from_slice(&a[..4]);
                    session_key.extend_from_slice(&b[..4]);
                }
            }
            KeyType::TripleDes3K => {
                session_key.extend_from_slice(&a[..4]);
                session_key.extend_from_slice(&b[..4]);
                session_key.extend_from_slice(&a[6..10]);
                session_key.extend_from_slice(&b[6..10]);
                session_key.extend_from_slice(&a[12..16]);
                session_key.extend_from_slice(&b[12..16]);
            }
            KeyType::Aes => {
                session_key.extend_from_slice(&a[..4]);
                session_key.extend_from_slice(&b[..4]);
                session_key.extend_from_slice(&a[12..16]);
                session_key.extend_from_slice(&b[12..16]);
            }
        }

        Ok(Session::new(
            self.aid,
            self.key_no,
            CryptoMethod::Iso,
            Box::new(IsoMessaging::new(session_key, kind)),
        ))
    }
}

/// EV2 AES authentication (AuthenticateEV2First)
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Ev2Handshake {
    #[zeroize(skip)]
    aid: u32,
    #[zeroize(skip)]
    key_no: u8,
    auth_key: Vec<u8>,
    rnd_a: [u8; 16],
    rnd_b: [u8; 16],
}

impl Ev2Handshake {
    /// Decrypt the card's RndB and reply with the AES cryptogram of
    /// RndA || RndB'
    pub(crate) fn begin(
        aid: u32,
        key_no: u8,
        auth_key: Vec<u8>,
        enc_rnd_b: &[u8],
        rnd_a: [u8; 16],
    ) -> Result<(Self, Vec<u8>)> {
        if enc_rnd_b.len() != 16 {
            return Err(Error::Protocol("wrong RndB cryptogram length"));
        }

        let zero_iv = [0u8; 16];
        let rnd_b_vec = block_cipher_decrypt(CipherKind::Aes, &auth_key, &zero_iv, enc_rnd_b)?;
        let mut rnd_b = [0u8; 16];
        rnd_b.copy_from_slice(&rnd_b_vec);

        let mut rnd_ab = rnd_a.to_vec();
        rnd_ab.extend_from_slice(&rotate_left(&rnd_b));
        let token = block_cipher_encrypt(CipherKind::Aes, &auth_key, &zero_iv, &rnd_ab)?;

        let pending = Self {
            aid,
            key_no,
            auth_key,
            rnd_a,
            rnd_b,
        };
        Ok((pending, token))
    }

    /// Decrypt the card's second message, verify RndA', and derive the
    /// session key pair from SV1/SV2.
    ///
    /// The cryptogram carries TI (4) || RndA' (16) || PDcap2 (6) ||
    /// PCDcap2 (6); the capability bytes are ignored here.
    pub(crate) fn finish(self, data: &[u8]) -> Result<Session> {
        if data.len() != 32 {
            return Err(Error::Protocol("wrong authentication cryptogram length"));
        }

        let zero_iv = [0u8; 16];
        let plain = block_cipher_decrypt(CipherKind::Aes, &self.auth_key, &zero_iv, data)?;

        let mut ti = [0u8; 4];
        ti.copy_from_slice(&plain[..4]);
        let rnd_a2 = &plain[4..20];

        if rotate_right(rnd_a2) != self.rnd_a {
            return Err(Error::AuthenticationFailed(
                "RndA and RndA' do not match. The card may be invalid.",
            ));
        }

        let (sv1, sv2) = session_vectors(&self.rnd_a, &self.rnd_b);
        let session_key = cmac_aes(&self.auth_key, &sv1)?;
        let mac_session_key = cmac_aes(&self.auth_key, &sv2)?;

        Ok(Session::new(
            self.aid,
            self.key_no,
            CryptoMethod::Ev2,
            Box::new(Ev2Messaging::new(session_key, mac_session_key, ti)),
        ))
    }
}

/// Build the SV1/SV2 key-derivation vectors: a fixed label followed by an
/// XOR-fold of the two challenges
pub(crate) fn session_vectors(rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> ([u8; 32], [u8; 32]) {
    let mut body = [0u8; 26];
    body[..8].copy_from_slice(&rnd_a[..8]);
    for x in 0..6 {
        body[2 + x] ^= rnd_b[x];
    }
    body[8..18].copy_from_slice(&rnd_b[6..]);
    body[18..].copy_from_slice(&rnd_a[8..]);

    let mut sv1 = [0u8; 32];
    sv1[..6].copy_from_slice(&sv_label::SV1);
    sv1[6..].copy_from_slice(&body);

    let mut sv2 = [0u8; 32];
    sv2[..6].copy_from_slice(&sv_label::SV2);
    sv2[6..].copy_from_slice(&body);

    (sv1, sv2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, block_cipher_decrypt, block_cipher_encrypt};
    use hex_literal::hex;

    fn card_legacy_decrypt(key: &[u8], token: &[u8]) -> Vec<u8> {
        // Card-side inverse of the send chain: plain_i = E(ct_i) ^ ct_{i-1}.
        use cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
        let cipher = des::Des::new_from_slice(&key[..8]).unwrap();
        let mut plain = Vec::new();
        let mut prev = [0u8; 8];
        for chunk in token.chunks_exact(8) {
            let mut block = [0u8; 8];
            block.copy_from_slice(chunk);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= *p;
            }
            prev.copy_from_slice(chunk);
            plain.extend_from_slice(&block);
        }
        plain
    }

    fn card_legacy_encrypt_block(key: &[u8], block: &[u8; 8]) -> Vec<u8> {
        use cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
        let cipher = des::Des::new_from_slice(&key[..8]).unwrap();
        let mut out = *block;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
        out.to_vec()
    }

    #[test]
    fn test_legacy_round_trip_single_des() {
        let key = hex!("00112233445566770011223344556677");
        let rnd_a = hex!("a0a1a2a3a4a5a6a7");
        let rnd_b = hex!("b0b1b2b3b4b5b6b7");

        let enc_rnd_b = card_legacy_encrypt_block(&key, &rnd_b);
        let (pending, token) =
            LegacyHandshake::begin(0x000001, 0, key.to_vec(), &enc_rnd_b, rnd_a).unwrap();

        // Card recovers RndA || RndB' and checks its own challenge.
        let plain = card_legacy_decrypt(&key, &token);
        assert_eq!(plain[..8], rnd_a);
        assert_eq!(plain[8..], rotate_left(&rnd_b));

        // Card answers with E(RndA').
        let mut rnd_a_rot = [0u8; 8];
        rnd_a_rot.copy_from_slice(&rotate_left(&rnd_a));
        let enc_rnd_a = card_legacy_encrypt_block(&key, &rnd_a_rot);

        let session = pending.finish(&enc_rnd_a).unwrap();
        assert_eq!(session.method(), CryptoMethod::Legacy);
        assert_eq!(session.mac_size(), 4);
        assert_eq!(session.block_size(), 8);
        assert_eq!(session.aid(), 0x000001);
        assert_eq!(session.key_no(), 0);
    }

    #[test]
    fn test_legacy_session_key_layout() {
        // Single DES: the same 8 bytes repeat, per the D40 construction.
        let key = hex!("00112233445566770011223344556677");
        let rnd_a = hex!("a0a1a2a3a4a5a6a7");
        let rnd_b = hex!("b0b1b2b3b4b5b6b7");

        let enc_rnd_b = card_legacy_encrypt_block(&key, &rnd_b);
        let (pending, _token) =
            LegacyHandshake::begin(0, 0, key.to_vec(), &enc_rnd_b, rnd_a).unwrap();
        let mut rnd_a_rot = [0u8; 8];
        rnd_a_rot.copy_from_slice(&rotate_left(&rnd_a));
        let enc_rnd_a = card_legacy_encrypt_block(&key, &rnd_a_rot);
        let mut session = pending.finish(&enc_rnd_a).unwrap();

        // The session key is internal; its layout is pinned down by the MAC
        // it produces. Build the expected key by hand and compare MACs.
        let expected_key = hex!("a0a1a2a3b0b1b2b3a0a1a2a3b0b1b2b3");
        let data = b"layout probe";
        let expected_mac = crate::crypto::legacy_mac(&expected_key, data).unwrap();

        let mac = session.messaging_mut().generate_mac(0x00, data).unwrap();
        assert_eq!(mac, expected_mac);
    }

    #[test]
    fn test_legacy_rnd_a_mismatch_fails() {
        let key = hex!("00112233445566770011223344556677");
        let rnd_a = hex!("a0a1a2a3a4a5a6a7");
        let rnd_b = hex!("b0b1b2b3b4b5b6b7");

        let enc_rnd_b = card_legacy_encrypt_block(&key, &rnd_b);
        let (pending, _token) =
            LegacyHandshake::begin(0, 0, key.to_vec(), &enc_rnd_b, rnd_a).unwrap();

        // Unrotated RndA must be rejected.
        let enc_rnd_a = card_legacy_encrypt_block(&key, &rnd_a);
        assert!(matches!(
            pending.finish(&enc_rnd_a),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_iso_aes_round_trip() {
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let rnd_a = hex!("c0c1c2c3c4c5c6c7c8c9cacbcccdcecf");
        let rnd_b = hex!("d0d1d2d3d4d5d6d7d8d9dadbdcdddedf");

        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &rnd_b).unwrap();
        let (pending, token) = IsoHandshake::begin(
            0x0000F5,
            1,
            KeyType::Aes,
            key.to_vec(),
            &enc_rnd_b,
            rnd_a.to_vec(),
        )
        .unwrap();

        // Card decrypts the reply chained from its own last cryptogram block.
        let iv = &enc_rnd_b[..];
        let plain = block_cipher_decrypt(CipherKind::Aes, &key, iv, &token).unwrap();
        assert_eq!(plain[..16], rnd_a);
        assert_eq!(plain[16..], rotate_left(&rnd_b));

        // Card answers with RndA' chained from the reply's last block.
        let iv = &token[token.len() - 16..];
        let enc_rnd_a =
            block_cipher_encrypt(CipherKind::Aes, &key, iv, &rotate_left(&rnd_a)).unwrap();

        let session = pending.finish(&enc_rnd_a).unwrap();
        assert_eq!(session.method(), CryptoMethod::Iso);
        assert_eq!(session.mac_size(), 8);
        assert_eq!(session.block_size(), 16);
    }

    #[test]
    fn test_iso_aes_session_key_layout() {
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let rnd_a = hex!("c0c1c2c3c4c5c6c7c8c9cacbcccdcecf");
        let rnd_b = hex!("d0d1d2d3d4d5d6d7d8d9dadbdcdddedf");

        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &rnd_b).unwrap();
        let (pending, token) = IsoHandshake::begin(
            0,
            0,
            KeyType::Aes,
            key.to_vec(),
            &enc_rnd_b,
            rnd_a.to_vec(),
        )
        .unwrap();
        let iv = &token[token.len() - 16..];
        let enc_rnd_a =
            block_cipher_encrypt(CipherKind::Aes, &key, iv, &rotate_left(&rnd_a)).unwrap();
        let mut session = pending.finish(&enc_rnd_a).unwrap();

        // A[0..4] || B[0..4] || A[12..16] || B[12..16], probed via the MAC.
        let expected_key = hex!("c0c1c2c3d0d1d2d3cccdcecfdcdddedf");
        let data = b"layout probe";
        let expected = crate::crypto::cmac_aes(&expected_key, data).unwrap();

        let mac = session.messaging_mut().generate_mac(0x00, data).unwrap();
        assert_eq!(mac, expected[..8]);
    }

    #[test]
    fn test_ev2_an12196_vectors() {
        // AuthenticateEV2First worked example from NXP AN12196 (all-zero key).
        let key = [0u8; 16];
        let rnd_a = hex!("13c5db8a5930439fc3def9a4c675360f");
        let rnd_b = hex!("b9e2fc789b64bf237cccaa20ec7e6e48");

        let (sv1, sv2) = session_vectors(&rnd_a, &rnd_b);
        assert_eq!(sv1[..6], sv_label::SV1);
        assert_eq!(sv2[..6], sv_label::SV2);
        assert_eq!(sv1[6..], sv2[6..]);

        let session_key = cmac_aes(&key, &sv1).unwrap();
        let mac_session_key = cmac_aes(&key, &sv2).unwrap();
        assert_eq!(session_key, hex!("1309c877509e5a215007ff0ed19ca564"));
        assert_eq!(mac_session_key, hex!("4c6626f5e72ea694202139295c7a7fc7"));
    }

    #[test]
    fn test_ev2_round_trip() {
        let key = hex!("00000000000000000000000000000000");
        let rnd_a = hex!("13c5db8a5930439fc3def9a4c675360f");
        let rnd_b = hex!("b9e2fc789b64bf237cccaa20ec7e6e48");
        let ti = hex!("9d00c4df");

        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &rnd_b).unwrap();
        let (pending, token) =
            Ev2Handshake::begin(0, 0, key.to_vec(), &enc_rnd_b, rnd_a).unwrap();

        let plain = block_cipher_decrypt(CipherKind::Aes, &key, &[0u8; 16], &token).unwrap();
        assert_eq!(plain[..16], rnd_a);
        assert_eq!(plain[16..], rotate_left(&rnd_b));

        // Card: TI || RndA' || PDcap2 || PCDcap2 under a null IV.
        let mut part2 = ti.to_vec();
        part2.extend_from_slice(&rotate_left(&rnd_a));
        part2.extend_from_slice(&[0u8; 12]);
        let enc_part2 =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &part2).unwrap();

        let session = pending.finish(&enc_part2).unwrap();
        assert_eq!(session.method(), CryptoMethod::Ev2);
        assert_eq!(session.mac_size(), 8);
        assert_eq!(session.command_counter(), Some(0));
        assert_eq!(session.transaction_identifier(), Some(ti));
    }

    #[test]
    fn test_ev2_rnd_a_mismatch_is_fatal() {
        let key = [0u8; 16];
        let rnd_a = hex!("13c5db8a5930439fc3def9a4c675360f");
        let rnd_b = hex!("b9e2fc789b64bf237cccaa20ec7e6e48");

        let enc_rnd_b =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &rnd_b).unwrap();
        let (pending, _token) =
            Ev2Handshake::begin(0, 0, key.to_vec(), &enc_rnd_b, rnd_a).unwrap();

        let mut rnd_a_rot = rotate_left(&rnd_a);
        rnd_a_rot[3] ^= 0x01;
        let mut part2 = hex!("9d00c4df").to_vec();
        part2.extend_from_slice(&rnd_a_rot);
        part2.extend_from_slice(&[0u8; 12]);
        let enc_part2 =
            block_cipher_encrypt(CipherKind::Aes, &key, &[0u8; 16], &part2).unwrap();

        assert!(matches!(
            pending.finish(&enc_part2),
            Err(Error::AuthenticationFailed(_))
        ));
    }
}
