//! Card-side reference helpers for exercising the session engine end to end.
//!
//! Everything here is computed with the raw RustCrypto primitives so the
//! tests check the engine against an independent implementation of the
//! card's half of each exchange.

#![allow(dead_code)]

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{Cmac, Mac};
use des::{Des, TdesEde2};

pub const ZERO_IV: [u8; 16] = [0u8; 16];

pub fn rotate_left(data: &[u8]) -> Vec<u8> {
    let mut out = data[1..].to_vec();
    out.push(data[0]);
    out
}

pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut blocks: Vec<_> = data
        .chunks_exact(16)
        .map(|c| *GenericArray::from_slice(c))
        .collect();
    let mut enc = cbc::Encryptor::<Aes128>::new(key.into(), iv.into());
    enc.encrypt_blocks_mut(&mut blocks);
    blocks.iter().flat_map(|b| b.iter().copied()).collect()
}

pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut blocks: Vec<_> = data
        .chunks_exact(16)
        .map(|c| *GenericArray::from_slice(c))
        .collect();
    let mut dec = cbc::Decryptor::<Aes128>::new(key.into(), iv.into());
    dec.decrypt_blocks_mut(&mut blocks);
    blocks.iter().flat_map(|b| b.iter().copied()).collect()
}

pub fn tdes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut blocks: Vec<_> = data
        .chunks_exact(8)
        .map(|c| *GenericArray::from_slice(c))
        .collect();
    let mut enc = cbc::Encryptor::<TdesEde2>::new(key.into(), iv.into());
    enc.encrypt_blocks_mut(&mut blocks);
    blocks.iter().flat_map(|b| b.iter().copied()).collect()
}

pub fn tdes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut blocks: Vec<_> = data
        .chunks_exact(8)
        .map(|c| *GenericArray::from_slice(c))
        .collect();
    let mut dec = cbc::Decryptor::<TdesEde2>::new(key.into(), iv.into());
    dec.decrypt_blocks_mut(&mut blocks);
    blocks.iter().flat_map(|b| b.iter().copied()).collect()
}

pub fn des_encrypt_block(key: &[u8; 8], block: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(key.into());
    let mut out = *block;
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

pub fn tdes_encrypt_block(key: &[u8; 16], block: &[u8; 8]) -> [u8; 8] {
    let cipher = TdesEde2::new(key.into());
    let mut out = *block;
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Card-side inverse of the D40 send chain: plain_i = E(ct_i) ^ ct_{i-1}
pub fn d40_card_decrypt(key: &[u8; 8], token: &[u8]) -> Vec<u8> {
    let cipher = Des::new(key.into());
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

/// D40 send-chain inverse under a two-key 3DES key
pub fn d40_card_decrypt_3des(key: &[u8; 16], token: &[u8]) -> Vec<u8> {
    let cipher = TdesEde2::new(key.into());
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

pub fn cmac_aes(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// EV2 session key derivation as the card computes it: CMAC over the SV1/SV2
/// label-and-fold vectors
pub fn ev2_session_keys(key: &[u8; 16], rnd_a: &[u8; 16], rnd_b: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let mut body = [0u8; 26];
    body[..8].copy_from_slice(&rnd_a[..8]);
    for x in 0..6 {
        body[2 + x] ^= rnd_b[x];
    }
    body[8..18].copy_from_slice(&rnd_b[6..]);
    body[18..].copy_from_slice(&rnd_a[8..]);

    let mut sv1 = vec![0xA5, 0x5A, 0x00, 0x01, 0x00, 0x80];
    sv1.extend_from_slice(&body);
    let mut sv2 = vec![0x5A, 0xA5, 0x00, 0x01, 0x00, 0x80];
    sv2.extend_from_slice(&body);

    (cmac_aes(key, &sv1), cmac_aes(key, &sv2))
}

/// EV2 MAC as the card computes it: CMAC of cmd || counter || TI || data,
/// odd bytes kept
pub fn ev2_mac(mac_key: &[u8; 16], cmd: u8, ctr: u16, ti: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut input = vec![cmd];
    input.extend_from_slice(&ctr.to_le_bytes());
    input.extend_from_slice(ti);
    input.extend_from_slice(data);
    let full = cmac_aes(mac_key, &input);
    full.iter().skip(1).step_by(2).copied().collect()
}

/// EV2 per-command IV as the card computes it
pub fn ev2_iv(enc_key: &[u8; 16], label: [u8; 2], ti: &[u8; 4], ctr: u16) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..2].copy_from_slice(&label);
    block[2..6].copy_from_slice(ti);
    block[6..8].copy_from_slice(&ctr.to_le_bytes());
    let cipher = Aes128::new(enc_key.into());
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    block
}

/// Pad with a 0x80 marker then zeros up to a block boundary
pub fn pad_80(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    while padded.len() % block_size != 0 {
        padded.push(0x00);
    }
    padded
}
