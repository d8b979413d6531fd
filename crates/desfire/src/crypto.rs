//! Cryptographic primitives for the DESFire session engine
//!
//! This module provides the stateless building blocks: the ISO14443-A CRC
//! pair, the D40-native DES chaining modes, plain CBC wrappers for the ISO
//! and EV2 paths, and the CMAC variants used for EV1 command MACs and EV2
//! session key derivation.

use aes::Aes128;
use cbc_mac::{CbcMac, Mac};
use cipher::{
    Block, BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit,
    KeyIvInit, generic_array::GenericArray, typenum::Unsigned,
};
use cmac::Cmac;
use crc::Crc;
use des::{Des, TdesEde2, TdesEde3};

use crate::{Error, Result};

/// CRC_A per ISO14443-3: initial register 0x6363, poly x^16+x^12+x^5+1,
/// output not inverted.
const CRC16_14443A: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_ISO_IEC_14443_3_A);

/// DESFire CRC-32: reflected CRC-32 without the final complement.
const CRC32_DESFIRE: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_JAMCRC);

/// Cipher family used by the ISO-framed secure messaging paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherKind {
    /// DES family; key length selects single, two-key or three-key operation
    Des,
    /// AES-128
    Aes,
}

impl CipherKind {
    pub(crate) const fn block_size(self) -> usize {
        match self {
            Self::Des => 8,
            Self::Aes => 16,
        }
    }
}

/// ISO14443-A CRC_A over `data`, as verified by the chip side
pub fn crc16(data: &[u8]) -> u16 {
    CRC16_14443A.checksum(data)
}

/// DESFire CRC-32 over `data`, used in EV1 cryptograms and change-key frames
pub fn crc32(data: &[u8]) -> u32 {
    CRC32_DESFIRE.checksum(data)
}

/// Keep every second byte of a full MAC, starting at index 1.
///
/// This interleaved truncation is what the card applies to CMAC output; a
/// plain left or right half would not interoperate.
pub fn truncate_mac(full: &[u8]) -> Vec<u8> {
    full.iter().skip(1).step_by(2).copied().collect()
}

/// Compare the halves of a 16-byte DES key with parity bits masked.
///
/// DES ignores parity bits, so two halves that differ only there still
/// describe single-DES operation.
pub(crate) fn is_triple_des(key: &[u8]) -> bool {
    key.len() >= 16
        && key[..8]
            .iter()
            .zip(&key[8..16])
            .any(|(a, b)| (a & 0xFE) != (b & 0xFE))
}

/// DES or two-key 3DES block primitive selected from legacy key material
enum LegacyDes {
    Single(Des),
    Triple(TdesEde2),
}

impl LegacyDes {
    fn new(key: &[u8]) -> Result<Self> {
        if key.len() < 16 {
            return Err(Error::InvalidKey("legacy DES key material must be 16 bytes"));
        }
        if is_triple_des(key) {
            let cipher = TdesEde2::new_from_slice(&key[..16])
                .map_err(|_| Error::InvalidKey("bad 3DES key length"))?;
            Ok(Self::Triple(cipher))
        } else {
            let cipher = Des::new_from_slice(&key[..8])
                .map_err(|_| Error::InvalidKey("bad DES key length"))?;
            Ok(Self::Single(cipher))
        }
    }

    fn encrypt(&self, block: &mut [u8; 8]) {
        match self {
            Self::Single(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Self::Triple(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    fn decrypt(&self, block: &mut [u8; 8]) {
        match self {
            Self::Single(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Self::Triple(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// D40-native "send" chain: XOR with the previous output, then run the DES
/// *decipher* primitive. Used both to recover RndB from the card's cryptogram
/// and to build the outgoing cryptograms. An empty `iv` means a null IV.
pub(crate) fn cbc_send(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let des = LegacyDes::new(key)?;
    if data.len() % 8 != 0 {
        return Err(Error::Protocol("legacy cryptogram is not block aligned"));
    }

    let mut chain = [0u8; 8];
    if iv.len() >= 8 {
        chain.copy_from_slice(&iv[..8]);
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(8) {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= *c;
        }
        des.decrypt(&mut block);
        chain = block;
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// D40-native "receive" chain: run the DES decipher primitive, then XOR with
/// the previous ciphertext block (the IV for the first block).
pub(crate) fn cbc_receive(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let des = LegacyDes::new(key)?;
    if data.len() % 8 != 0 {
        return Err(Error::Protocol("legacy cryptogram is not block aligned"));
    }

    let mut chain = [0u8; 8];
    if iv.len() >= 8 {
        chain.copy_from_slice(&iv[..8]);
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(8) {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        des.decrypt(&mut block);
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= *c;
        }
        chain.copy_from_slice(chunk);
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// CBC-MAC over zero-padded `data` under a null IV; the MAC is the first four
/// bytes of the final block
pub(crate) fn legacy_mac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() < 16 {
        return Err(Error::InvalidKey("legacy DES key material must be 16 bytes"));
    }

    let mut padded = data.to_vec();
    let pad = (8 - padded.len() % 8) % 8;
    padded.resize(padded.len() + pad, 0x00);

    let tag: [u8; 8] = if is_triple_des(key) {
        let mut mac = <CbcMac<TdesEde2> as Mac>::new_from_slice(&key[..16])
            .map_err(|_| Error::InvalidKey("bad 3DES key length"))?;
        mac.update(&padded);
        mac.finalize().into_bytes().into()
    } else {
        let mut mac = <CbcMac<Des> as Mac>::new_from_slice(&key[..8])
            .map_err(|_| Error::InvalidKey("bad DES key length"))?;
        mac.update(&padded);
        mac.finalize().into_bytes().into()
    };

    Ok(tag[..4].to_vec())
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let bs = C::BlockSize::USIZE;
    if data.len() % bs != 0 {
        return Err(Error::Protocol("plaintext is not block aligned"));
    }
    let mut blocks: Vec<Block<C>> = data
        .chunks_exact(bs)
        .map(|c| GenericArray::from_slice(c).clone())
        .collect();
    let mut enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKey("cipher key or IV has the wrong length"))?;
    enc.encrypt_blocks_mut(&mut blocks);
    Ok(blocks.iter().flat_map(|b| b.iter().copied()).collect())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let bs = C::BlockSize::USIZE;
    if data.len() % bs != 0 {
        return Err(Error::Protocol("ciphertext is not block aligned"));
    }
    let mut blocks: Vec<Block<C>> = data
        .chunks_exact(bs)
        .map(|c| GenericArray::from_slice(c).clone())
        .collect();
    let mut dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKey("cipher key or IV has the wrong length"))?;
    dec.decrypt_blocks_mut(&mut blocks);
    Ok(blocks.iter().flat_map(|b| b.iter().copied()).collect())
}

/// Proper CBC encryption for the ISO and EV2 paths. DES keys dispatch on
/// length: 8 bytes single, 16 two-key, 24 three-key.
pub(crate) fn block_cipher_encrypt(
    kind: CipherKind,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    match kind {
        CipherKind::Aes => cbc_encrypt::<Aes128>(key, iv, data),
        CipherKind::Des => match key.len() {
            8 => cbc_encrypt::<Des>(key, iv, data),
            16 => cbc_encrypt::<TdesEde2>(key, iv, data),
            24 => cbc_encrypt::<TdesEde3>(key, iv, data),
            _ => Err(Error::InvalidKey("DES key material must be 8, 16 or 24 bytes")),
        },
    }
}

/// Proper CBC decryption; see [`block_cipher_encrypt`] for key dispatch
pub(crate) fn block_cipher_decrypt(
    kind: CipherKind,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    match kind {
        CipherKind::Aes => cbc_decrypt::<Aes128>(key, iv, data),
        CipherKind::Des => match key.len() {
            8 => cbc_decrypt::<Des>(key, iv, data),
            16 => cbc_decrypt::<TdesEde2>(key, iv, data),
            24 => cbc_decrypt::<TdesEde3>(key, iv, data),
            _ => Err(Error::InvalidKey("DES key material must be 8, 16 or 24 bytes")),
        },
    }
}

/// One-shot CMAC-AES per NIST SP 800-38B, used for the EV2 key derivation and
/// message authentication
pub(crate) fn cmac_aes(key: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|_| Error::InvalidKey("AES-128 key material must be 16 bytes"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// AES-ECB of a single block, used to derive the EV2 per-command IV
pub(crate) fn aes_ecb_encrypt_block(key: &[u8], block: &mut [u8; 16]) -> Result<()> {
    let cipher = Aes128::new_from_slice(key)
        .map_err(|_| Error::InvalidKey("AES-128 key material must be 16 bytes"))?;
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
    Ok(())
}

/// Left-shift a buffer by one bit, folding `rb` into the last byte when the
/// input's top bit was set (SP 800-38B subkey step)
fn shift_subkey(buf: &[u8], rb: u8) -> Vec<u8> {
    let mut out = buf.to_vec();
    for i in 0..out.len() - 1 {
        out[i] = (out[i] << 1) | (out[i + 1] >> 7);
    }
    let last = out.len() - 1;
    out[last] <<= 1;
    if buf[0] & 0x80 != 0 {
        out[last] ^= rb;
    }
    out
}

/// CMAC that chains from a caller-supplied IV and returns the full ciphertext
/// stream, as the EV1 command MAC requires.
///
/// The session IV rolls forward through every MACed exchange, so the standard
/// zero-IV CMAC cannot be used directly; with a zero IV the last block of the
/// returned stream equals the standard CMAC (see tests).
pub(crate) fn chained_cmac(
    key: &[u8],
    kind: CipherKind,
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let bs = kind.block_size();
    let rb: u8 = match kind {
        CipherKind::Des => 0x1B,
        CipherKind::Aes => 0x87,
    };

    // Subkeys from the ECB encryption of a zero block.
    let zero_iv = vec![0x00; bs];
    let l = block_cipher_encrypt(kind, key, &zero_iv, &zero_iv)?;
    let k1 = shift_subkey(&l, rb);
    let k2 = shift_subkey(&k1, rb);

    let mut pad = (bs - data.len() % bs) % bs;
    if data.is_empty() {
        pad = bs;
    }

    let mut padded = data.to_vec();
    if pad > 0 {
        padded.push(0x80);
        padded.resize(data.len() + pad, 0x00);
    }

    let subkey = if pad == 0 { &k1 } else { &k2 };
    let tail = padded.len() - bs;
    for (b, k) in padded[tail..].iter_mut().zip(subkey.iter()) {
        *b ^= *k;
    }

    block_cipher_encrypt(kind, key, iv, &padded)
}
