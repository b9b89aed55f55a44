//! SCP02 primitives for the issuer security domain, used only by the factory
//! reset fallback: session-key derivation, cryptogram calculation and the
//! retail MAC (single DES chain, 3DES final block).

use cbc_mac::{CbcMac, Mac};
use cipher::{
    BlockEncrypt, BlockEncryptMut, Iv, IvSizeUser, Key, KeyInit, KeyIvInit, KeySizeUser,
    consts::{U8, U16},
    generic_array::GenericArray,
};
use des::{Des, TdesEde3};

pub type Purpose = [u8; 2];
pub type SequenceCounter = [u8; 2];
pub type CardChallenge = [u8; 6];
pub type HostChallenge = [u8; 8];
pub type Cryptogram = [u8; 8];
pub type RetailMac = [u8; 8];

/// Derivation purpose for the session encryption key.
pub const DERIVATION_ENC: Purpose = [0x01, 0x82];
/// Derivation purpose for the session MAC key.
pub const DERIVATION_MAC: Purpose = [0x01, 0x01];

/// Cipher parameters for SCP02 (two-key 3DES, 8-byte ICV).
pub struct Scp02;

impl KeySizeUser for Scp02 {
    type KeySize = U16;
}

impl IvSizeUser for Scp02 {
    type IvSize = U8;
}

/// Derive a session key from the static card key, sequence counter and
/// purpose constant.
pub fn derive_key(card_key: &Key<Scp02>, seq: &SequenceCounter, purpose: &Purpose) -> Key<Scp02> {
    let mut blocks = [GenericArray::default(), GenericArray::default()];
    blocks[0][0..2].copy_from_slice(purpose);
    blocks[0][2..4].copy_from_slice(seq);

    let key = resize_key(card_key);
    let iv = GenericArray::default();

    let mut encryptor = cbc::Encryptor::<TdesEde3>::new(&key, &iv);
    encryptor.encrypt_blocks_mut(&mut blocks);

    let mut result = Key::<Scp02>::default();
    result[0..8].copy_from_slice(&blocks[0]);
    result[8..16].copy_from_slice(&blocks[1]);
    result
}

/// Cryptogram over the challenge exchange. The card and host cryptograms
/// differ only in operand order.
pub fn calculate_cryptogram(
    enc_key: &Key<Scp02>,
    sequence_counter: &SequenceCounter,
    card_challenge: &CardChallenge,
    host_challenge: &HostChallenge,
    for_host: bool,
) -> Cryptogram {
    let mut blocks = [GenericArray::default(); 3];

    if for_host {
        blocks[0][0..2].copy_from_slice(sequence_counter);
        blocks[0][2..8].copy_from_slice(card_challenge);
        blocks[1][0..8].copy_from_slice(host_challenge);
    } else {
        blocks[0][0..8].copy_from_slice(host_challenge);
        blocks[1][0..2].copy_from_slice(sequence_counter);
        blocks[1][2..8].copy_from_slice(card_challenge);
    }

    // ISO 7816 padding of the 16 input bytes fills the third block.
    blocks[2][0] = 0x80;

    let mut cipher = cbc::Encryptor::<TdesEde3>::new(&resize_key(enc_key), &Default::default());
    cipher.encrypt_blocks_mut(&mut blocks);
    blocks[2].into()
}

/// SCP02 retail MAC: single DES over all blocks but the last, 3DES for the
/// final block.
pub fn mac_full_3des(key: &Key<Scp02>, icv: &Iv<Scp02>, data: &[u8]) -> RetailMac {
    let padding_bytes = 8 - data.len() % 8;
    let mut padded = Vec::with_capacity(data.len() + padding_bytes);
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(data.len() + padding_bytes, 0);

    let des_cipher = Des::new_from_slice(&key[..8]).expect("8-byte DES key");
    let des3_cipher = TdesEde3::new(&resize_key(key));

    let mut chain = GenericArray::<u8, U8>::default();
    chain.copy_from_slice(icv.as_slice());

    let last = padded.len() - 8;
    for chunk in padded[..last].chunks(8) {
        let mut block = GenericArray::default();
        block.copy_from_slice(chunk);
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= *c;
        }
        des_cipher.encrypt_block(&mut block);
        chain.copy_from_slice(&block);
    }

    let mut block = GenericArray::default();
    block.copy_from_slice(&padded[last..]);
    for (b, c) in block.iter_mut().zip(chain.iter()) {
        *b ^= *c;
    }
    des3_cipher.encrypt_block(&mut block);
    block.into()
}

/// Encrypt the previous MAC into the ICV for the next command.
pub fn encrypt_icv(mac_key: &Key<Scp02>, icv: &Iv<Scp02>) -> Iv<Scp02> {
    let key = GenericArray::from_slice(&mac_key[..8]);
    let mut mac = <CbcMac<Des> as Mac>::new(key);
    mac.update(icv.as_slice());
    mac.finalize().into_bytes()
}

/// Widen a 16-byte SCP02 key to 24 bytes for 3DES (K1 reused as K3).
pub fn resize_key(key: &Key<Scp02>) -> Key<TdesEde3> {
    let mut result = Key::<TdesEde3>::default();
    result[..16].copy_from_slice(key);
    result[16..24].copy_from_slice(&key[..8]);
    result
}
