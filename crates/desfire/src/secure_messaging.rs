//! Secure messaging: MAC and encryption framing for authenticated commands
//!
//! One implementation exists per authentication variant and is selected when
//! the handshake completes. The three paths are not interchangeable: they
//! differ in IV derivation, MAC size and padding, and the EV2 path threads a
//! command counter through every MAC.

use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{SW_OPERATION_OK, ins, iv_label};
use crate::crypto::{
    CipherKind, aes_ecb_encrypt_block, block_cipher_decrypt, block_cipher_encrypt, cbc_receive,
    cbc_send, chained_cmac, cmac_aes, crc16, crc32, legacy_mac, truncate_mac,
};
use crate::error::{Error, Result};
use crate::key::KeyType;

/// Inputs for building a change-key cryptogram
#[derive(Debug)]
pub struct ChangeKeyRequest<'a> {
    /// Target key number as sent on the wire (the high bits may carry
    /// key-type flags when changing the card master key)
    pub key_no: u8,
    /// Target keyset; non-zero routes EV2 sessions through ChangeKeyEV2
    pub keyset_no: u8,
    /// Resolved (diversified, versioned) material of the key being replaced
    pub old_key: &'a [u8],
    /// Resolved material of the replacement key
    pub new_key: &'a [u8],
    /// Cipher family of the replacement key
    pub new_key_type: KeyType,
    /// Version byte of the replacement key
    pub new_key_version: u8,
    /// Key number the session was authenticated with
    pub auth_key_no: u8,
}

impl ChangeKeyRequest<'_> {
    /// Key number with the key-type flag bits masked off
    pub const fn key_no_only(&self) -> u8 {
        self.key_no & 0x3F
    }

    fn xored_material(&self) -> Vec<u8> {
        self.new_key
            .iter()
            .enumerate()
            .map(|(i, n)| n ^ self.old_key.get(i).copied().unwrap_or(0x00))
            .collect()
    }

    /// A change of the currently authenticated key within the default keyset
    /// carries the plain new key instead of the XOR cryptogram
    const fn targets_auth_key(&self) -> bool {
        self.key_no_only() == self.auth_key_no && self.keyset_no == 0
    }
}

/// Wire-level MAC and encryption for one authenticated session.
///
/// Every failure is surfaced; nothing here retries. The only state mutated on
/// a failing operation is the EV2 command counter, which advances even for a
/// rejected MAC so a retried verification never reuses a counter value.
pub trait SecureMessaging: std::fmt::Debug {
    /// MAC for an outgoing command
    fn generate_mac(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>>;

    /// Check the MAC trailing a complete response buffer
    fn verify_mac(&mut self, buf: &[u8]) -> Result<bool>;

    /// Encrypt `data` for transmission. `param` is the command header the
    /// cryptogram protects; `calc_crc` appends the per-variant CRC first.
    fn encrypt(&mut self, data: &[u8], param: &[u8], calc_crc: bool) -> Result<Vec<u8>>;

    /// Decrypt a complete response buffer. `length` gives the expected
    /// plaintext length, or 0 to recover it from the padding.
    fn decrypt(&mut self, buf: &[u8], length: usize) -> Result<Vec<u8>>;

    /// Build the cryptogram for a change-key operation
    fn change_key_cryptogram(&mut self, req: &ChangeKeyRequest<'_>) -> Result<Vec<u8>>;

    /// MAC length in bytes
    fn mac_size(&self) -> usize;

    /// Cipher block size in bytes
    fn block_size(&self) -> usize;

    /// EV2 command counter; `None` for the other variants
    fn command_counter(&self) -> Option<u16> {
        None
    }

    /// EV2 transaction identifier; `None` for the other variants
    fn transaction_identifier(&self) -> Option<[u8; 4]> {
        None
    }
}

/// D40-native framing: 4-byte CBC-MAC, DES send/receive chains, CRC16
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct LegacyMessaging {
    session_key: Vec<u8>,
}

impl LegacyMessaging {
    pub(crate) fn new(session_key: Vec<u8>) -> Self {
        Self { session_key }
    }
}

impl SecureMessaging for LegacyMessaging {
    fn generate_mac(&mut self, _cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        legacy_mac(&self.session_key, data)
    }

    fn verify_mac(&mut self, buf: &[u8]) -> Result<bool> {
        if buf.len() < 4 {
            return Err(Error::Protocol("wrong MAC buffer length"));
        }
        let (payload, mac) = buf.split_at(buf.len() - 4);
        let expected = legacy_mac(&self.session_key, payload)?;
        Ok(expected == mac)
    }

    fn encrypt(&mut self, data: &[u8], _param: &[u8], calc_crc: bool) -> Result<Vec<u8>> {
        let mut plain = data.to_vec();
        if calc_crc {
            plain.extend_from_slice(&crc16(data).to_le_bytes());
        }
        let pad = (8 - plain.len() % 8) % 8;
        plain.resize(plain.len() + pad, 0x00);

        cbc_send(&self.session_key, &[], &plain)
    }

    fn decrypt(&mut self, buf: &[u8], length: usize) -> Result<Vec<u8>> {
        let mut data = cbc_receive(&self.session_key, &[], buf)?;
        if data.is_empty() {
            return Err(Error::Protocol("empty cryptogram"));
        }

        let ll = if length == 0 {
            let mut marker = data.len() - 1;
            while marker > 0 && data[marker] == 0x00 {
                marker -= 1;
            }
            if data[marker] != 0x80 {
                return Err(Error::Integrity("Incorrect FLT result"));
            }
            if marker < 2 {
                return Err(Error::Integrity("cannot find the CRC in the deciphered data"));
            }
            marker - 2
        } else {
            if length + 2 > data.len() {
                return Err(Error::Protocol("deciphered data shorter than requested length"));
            }
            length
        };

        let crc_computed = crc16(&data[..ll]);
        let crc_received = u16::from_le_bytes([data[ll], data[ll + 1]]);
        if crc_computed != crc_received {
            return Err(Error::Integrity("CRC mismatch in the deciphered data"));
        }

        data.truncate(ll);
        Ok(data)
    }

    fn change_key_cryptogram(&mut self, req: &ChangeKeyRequest<'_>) -> Result<Vec<u8>> {
        if req.targets_auth_key() {
            let mut data = req.new_key.to_vec();
            if req.new_key_type == KeyType::Aes {
                data.push(req.new_key_version);
            }
            return self.encrypt(&data, &[], true);
        }

        let mut cryptogram = req.xored_material();
        if req.keyset_no != 0 && req.new_key_type == KeyType::Aes {
            cryptogram.push(req.new_key_version);
        }
        let crc = crc16(&cryptogram);
        cryptogram.extend_from_slice(&crc.to_le_bytes());
        cryptogram.extend_from_slice(&crc16(req.new_key).to_le_bytes());
        cryptogram.resize(24, 0x00);

        cbc_send(&self.session_key, &[], &cryptogram)
    }

    fn mac_size(&self) -> usize {
        4
    }

    fn block_size(&self) -> usize {
        8
    }
}

/// EV1 ISO framing: 8-byte chained CMAC, proper CBC with a rolling IV, CRC32
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct IsoMessaging {
    session_key: Vec<u8>,
    #[zeroize(skip)]
    cipher: CipherKind,
    last_iv: Vec<u8>,
}

impl IsoMessaging {
    pub(crate) fn new(session_key: Vec<u8>, cipher: CipherKind) -> Self {
        let last_iv = vec![0x00; cipher.block_size()];
        Self {
            session_key,
            cipher,
            last_iv,
        }
    }

    /// Chained CMAC over `data`, advancing the rolling IV. The MAC is the
    /// first 8 bytes of the final CMAC block.
    fn cmac8(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let stream = chained_cmac(&self.session_key, self.cipher, &self.last_iv, data)?;
        let bs = self.cipher.block_size();
        self.last_iv = stream[stream.len() - bs..].to_vec();

        let mac = match self.cipher {
            CipherKind::Des => stream[stream.len() - 8..].to_vec(),
            CipherKind::Aes => stream[stream.len() - 16..stream.len() - 8].to_vec(),
        };
        Ok(mac)
    }
}

impl SecureMessaging for IsoMessaging {
    fn generate_mac(&mut self, _cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.cmac8(data)
    }

    fn verify_mac(&mut self, buf: &[u8]) -> Result<bool> {
        if buf.len() < 8 {
            return Err(Error::Protocol("wrong MAC buffer length"));
        }
        let (payload, mac) = buf.split_at(buf.len() - 8);
        let mut macced = payload.to_vec();
        macced.push(SW_OPERATION_OK);
        let expected = self.cmac8(&macced)?;
        Ok(expected == mac)
    }

    fn encrypt(&mut self, data: &[u8], param: &[u8], calc_crc: bool) -> Result<Vec<u8>> {
        let mut plain = data.to_vec();
        if calc_crc {
            let mut crc_input = param.to_vec();
            crc_input.extend_from_slice(data);
            plain.extend_from_slice(&crc32(&crc_input).to_le_bytes());
        }
        let bs = self.cipher.block_size();
        let pad = (bs - plain.len() % bs) % bs;
        plain.resize(plain.len() + pad, 0x00);

        let ciphertext =
            block_cipher_encrypt(self.cipher, &self.session_key, &self.last_iv, &plain)?;
        self.last_iv = ciphertext[ciphertext.len() - bs..].to_vec();
        trace!(len = ciphertext.len(), "enciphered command data");
        Ok(ciphertext)
    }

    fn decrypt(&mut self, buf: &[u8], length: usize) -> Result<Vec<u8>> {
        if buf.is_empty() {
            return Err(Error::Protocol("empty cryptogram"));
        }
        let mut data = block_cipher_decrypt(self.cipher, &self.session_key, &self.last_iv, buf)?;
        let bs = self.cipher.block_size();
        self.last_iv = buf[buf.len() - bs..].to_vec();

        let ll = if length == 0 {
            let mut marker = data.len() - 1;
            while marker > 0 && data[marker] == 0x00 {
                marker -= 1;
            }
            if data[marker] != 0x80 {
                return Err(Error::Integrity("Incorrect FLT result"));
            }
            // Remove the marker so the padding check below only sees zeros.
            data[marker] = 0x00;
            if marker < 4 {
                return Err(Error::Integrity("cannot find the CRC in the deciphered data"));
            }
            marker - 4
        } else {
            if length + 4 > data.len() {
                return Err(Error::Protocol("deciphered data shorter than requested length"));
            }
            length
        };

        let mut crc_input = data[..ll].to_vec();
        crc_input.push(SW_OPERATION_OK);
        let crc_computed = crc32(&crc_input);
        let crc_received =
            u32::from_le_bytes([data[ll], data[ll + 1], data[ll + 2], data[ll + 3]]);
        let padding_clean = data[ll + 4..].iter().all(|&b| b == 0x00);
        if crc_computed != crc_received || !padding_clean {
            return Err(Error::Integrity("CRC or padding mismatch in the deciphered data"));
        }

        data.truncate(ll);
        Ok(data)
    }

    fn change_key_cryptogram(&mut self, req: &ChangeKeyRequest<'_>) -> Result<Vec<u8>> {
        if req.targets_auth_key() {
            let mut data = req.new_key.to_vec();
            if req.new_key_type == KeyType::Aes {
                data.push(req.new_key_version);
            }
            return self.encrypt(&data, &[ins::CHANGE_KEY, req.key_no], true);
        }

        let mut cryptogram = req.xored_material();
        // The session cipher, not the new key type, decides the version byte.
        if self.cipher == CipherKind::Aes {
            cryptogram.push(req.new_key_version);
        }

        let mut header = if req.keyset_no != 0 {
            vec![ins::CHANGE_KEY_EV2, req.keyset_no, req.key_no]
        } else {
            vec![ins::CHANGE_KEY, req.key_no]
        };
        header.extend_from_slice(&cryptogram);
        cryptogram.extend_from_slice(&crc32(&header).to_le_bytes());
        cryptogram.extend_from_slice(&crc32(req.new_key).to_le_bytes());

        let bs = self.cipher.block_size();
        let pad = (bs - cryptogram.len() % bs) % bs;
        cryptogram.resize(cryptogram.len() + pad, 0x00);

        let ciphertext =
            block_cipher_encrypt(self.cipher, &self.session_key, &self.last_iv, &cryptogram)?;
        self.last_iv = ciphertext[ciphertext.len() - bs..].to_vec();
        Ok(ciphertext)
    }

    fn mac_size(&self) -> usize {
        8
    }

    fn block_size(&self) -> usize {
        self.cipher.block_size()
    }
}

const EV2_MAC_SIZE: usize = 8;
const EV2_BLOCK_SIZE: usize = 16;

/// EV2 framing: CMAC with command counter and transaction identifier,
/// direction-labelled per-command IVs
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Ev2Messaging {
    session_key: [u8; 16],
    mac_session_key: [u8; 16],
    #[zeroize(skip)]
    ti: [u8; 4],
    #[zeroize(skip)]
    cmd_ctr: u16,
}

impl Ev2Messaging {
    pub(crate) fn new(session_key: [u8; 16], mac_session_key: [u8; 16], ti: [u8; 4]) -> Self {
        Self {
            session_key,
            mac_session_key,
            ti,
            cmd_ctr: 0,
        }
    }

    /// Per-command IV: AES-ECB of `label || TI || counter || zero padding`
    /// under the encryption session key
    fn transfer_iv(&self, command: bool) -> Result<[u8; 16]> {
        let mut block = [0u8; 16];
        let label = if command {
            iv_label::COMMAND
        } else {
            iv_label::RESPONSE
        };
        block[..2].copy_from_slice(&label);
        block[2..6].copy_from_slice(&self.ti);
        block[6..8].copy_from_slice(&self.cmd_ctr.to_le_bytes());
        aes_ecb_encrypt_block(&self.session_key, &mut block)?;
        Ok(block)
    }
}

impl SecureMessaging for Ev2Messaging {
    fn generate_mac(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(7 + data.len());
        input.push(cmd);
        input.extend_from_slice(&self.cmd_ctr.to_le_bytes());
        input.extend_from_slice(&self.ti);
        input.extend_from_slice(data);

        let full = cmac_aes(&self.mac_session_key, &input)?;
        Ok(truncate_mac(&full))
    }

    fn verify_mac(&mut self, buf: &[u8]) -> Result<bool> {
        if buf.len() < EV2_MAC_SIZE {
            return Err(Error::Protocol("MAC buffer is too small"));
        }
        let (payload, mac) = buf.split_at(buf.len() - EV2_MAC_SIZE);

        // The counter advances before the check so that a retry after a
        // failed verification never reuses a counter value.
        self.cmd_ctr = self.cmd_ctr.wrapping_add(1);

        let expected = self.generate_mac(0x00, payload)?;
        if expected != mac {
            return Err(Error::Integrity("response MAC has an unexpected value"));
        }
        Ok(true)
    }

    fn encrypt(&mut self, data: &[u8], param: &[u8], _calc_crc: bool) -> Result<Vec<u8>> {
        let iv = self.transfer_iv(true)?;

        let mut plain = data.to_vec();
        plain.push(0x80);
        while plain.len() % EV2_BLOCK_SIZE != 0 {
            plain.push(0x00);
        }

        let ciphertext =
            block_cipher_encrypt(CipherKind::Aes, &self.session_key, &iv, &plain)?;
        trace!(
            ctr = self.cmd_ctr,
            ti = %hex::encode(self.ti),
            "enciphered command data"
        );

        let cmd = param.first().copied().unwrap_or(0x00);
        let mut macced = Vec::with_capacity(param.len().saturating_sub(1) + ciphertext.len());
        if param.len() > 1 {
            macced.extend_from_slice(&param[1..]);
        }
        macced.extend_from_slice(&ciphertext);
        let mac = self.generate_mac(cmd, &macced)?;

        let mut out = ciphertext;
        out.extend_from_slice(&mac);
        Ok(out)
    }

    fn decrypt(&mut self, buf: &[u8], _length: usize) -> Result<Vec<u8>> {
        // Fail fast on a tampered response; the counter is advanced by the
        // verification whether it succeeds or not.
        self.verify_mac(buf)?;

        let encrypted = &buf[..buf.len() - EV2_MAC_SIZE];
        if encrypted.is_empty() {
            return Err(Error::Protocol("missing enciphered payload"));
        }

        let iv = self.transfer_iv(false)?;
        let mut data = block_cipher_decrypt(CipherKind::Aes, &self.session_key, &iv, encrypted)?;

        let mut marker = data.len() - 1;
        while marker > 0 && data[marker] == 0x00 {
            marker -= 1;
        }
        if data[marker] != 0x80 {
            return Err(Error::Integrity("Incorrect FLT result"));
        }
        data.truncate(marker);
        Ok(data)
    }

    fn change_key_cryptogram(&mut self, req: &ChangeKeyRequest<'_>) -> Result<Vec<u8>> {
        if req.targets_auth_key() {
            let mut data = req.new_key.to_vec();
            if req.new_key_type == KeyType::Aes {
                data.push(req.new_key_version);
            }
            return self.encrypt(&data, &[ins::CHANGE_KEY, req.key_no], true);
        }

        let mut cryptogram = req.xored_material();
        if req.new_key_type == KeyType::Aes {
            cryptogram.push(req.new_key_version);
        }
        cryptogram.extend_from_slice(&crc32(req.new_key).to_le_bytes());

        let param: Vec<u8> = if req.keyset_no != 0 {
            vec![ins::CHANGE_KEY_EV2, req.keyset_no, req.key_no]
        } else {
            vec![ins::CHANGE_KEY, req.key_no]
        };
        self.encrypt(&cryptogram, &param, true)
    }

    fn mac_size(&self) -> usize {
        EV2_MAC_SIZE
    }

    fn block_size(&self) -> usize {
        EV2_BLOCK_SIZE
    }

    fn command_counter(&self) -> Option<u16> {
        Some(self.cmd_ctr)
    }

    fn transaction_identifier(&self) -> Option<[u8; 4]> {
        Some(self.ti)
    }
}
