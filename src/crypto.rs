//! Cryptography for the card secure channel: pairing-token and session-key
//! derivation, APDU encryption, and the chained CBC-MAC that doubles as the
//! rolling IV.

use aes::cipher::{
    BlockDecryptMut, BlockEncryptMut, Iv, IvSizeUser, Key, KeyIvInit, KeySizeUser,
    block_padding::Iso7816,
    typenum::{U16, U32},
};
use bytes::{Bytes, BytesMut};
use cipher::block_padding::UnpadError;
use generic_array::GenericArray;
use k256::{PublicKey, SecretKey, ecdh::SharedSecret, elliptic_curve::sec1::ToEncodedPoint};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use unicode_normalization::UnicodeNormalization;

pub const PAIRING_TOKEN_SALT: &str = "Keycard Pairing Password Salt";
const PAIRING_TOKEN_ROUNDS: u32 = 50_000;

pub type PairingToken = GenericArray<u8, U32>;
pub type Cryptogram = GenericArray<u8, U32>;
pub type Challenge = GenericArray<u8, U32>;
pub type ApduMeta = GenericArray<u8, U16>;

type Encryptor = cbc::Encryptor<aes::Aes256>;
type Decryptor = cbc::Decryptor<aes::Aes256>;

/// Cipher parameters of the card secure channel (AES-256, 16-byte IV).
pub struct CardScp;

impl KeySizeUser for CardScp {
    type KeySize = U32;
}

impl IvSizeUser for CardScp {
    type IvSize = U16;
}

pub fn ecdh_shared_secret(private: &SecretKey, public: &PublicKey) -> SharedSecret {
    k256::elliptic_curve::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine())
}

/// Pairing-step cryptogram: SHA-256(shared secret || challenge).
pub fn cryptogram(shared_secret: &PairingToken, challenge: &Challenge) -> Cryptogram {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(challenge);
    hasher.finalize()
}

/// Derive the session key pair from the ECDH secret, pairing key and card
/// challenge: (K_enc || K_mac) = SHA-512(secret || pairing key || challenge).
pub fn session_keys(
    secret: &SharedSecret,
    pairing_key: &Key<CardScp>,
    challenge: &Challenge,
) -> (Key<CardScp>, Key<CardScp>) {
    let mut hasher = Sha512::new();
    hasher.update(secret.raw_secret_bytes());
    hasher.update(pairing_key);
    hasher.update(challenge);
    let data = hasher.finalize();

    let enc = Key::<CardScp>::clone_from_slice(&data[0..32]);
    let mac = Key::<CardScp>::clone_from_slice(&data[32..64]);
    (enc, mac)
}

/// One-shot encryption against the card public key, used by INIT before any
/// channel exists. Output layout: len(host pub) || host pub || IV ||
/// ciphertext.
pub fn one_shot_encrypt(
    host_public: &PublicKey,
    secret: &SharedSecret,
    data: &mut BytesMut,
) -> Bytes {
    let mut iv = Iv::<CardScp>::default();
    rand::thread_rng().fill_bytes(&mut iv);

    let msg_len = pad_to_block(data);
    let ciphertext = Encryptor::new(secret.raw_secret_bytes(), &iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .expect("buffer padded to block size");

    let point = host_public.to_encoded_point(false);
    let mut buf = BytesMut::with_capacity(1 + point.len() + iv.len() + ciphertext.len());
    buf.extend(&[point.len() as u8]);
    buf.extend(point.as_bytes());
    buf.extend(&iv);
    buf.extend(ciphertext);
    buf.into()
}

/// Encrypt an APDU payload with ISO 7816 padding.
pub fn encrypt_apdu(data: &mut BytesMut, enc_key: &Key<CardScp>, iv: &Iv<CardScp>) -> Bytes {
    let msg_len = pad_to_block(data);
    let encrypted = Encryptor::new(enc_key, iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .expect("buffer padded to block size");
    Bytes::copy_from_slice(encrypted)
}

/// Decrypt an APDU payload, stripping the ISO 7816 padding.
pub fn decrypt_apdu(
    data: &mut BytesMut,
    enc_key: &Key<CardScp>,
    iv: &Iv<CardScp>,
) -> Result<Bytes, UnpadError> {
    let decrypted = Decryptor::new(enc_key, iv).decrypt_padded_mut::<Iso7816>(data)?;
    Ok(BytesMut::from(decrypted).into())
}

/// MAC over the APDU metadata and ciphertext. The result chains into the
/// next exchange as its IV.
pub fn apdu_mac(meta: &ApduMeta, data: &Bytes, mac_key: &Key<CardScp>) -> Iv<CardScp> {
    let iv = Iv::<CardScp>::default();

    let mut buf = BytesMut::with_capacity(meta.len() + data.len() + 16);
    buf.extend_from_slice(meta.as_slice());
    buf.extend_from_slice(data);

    let msg_len = pad_to_block(&mut buf);
    let ciphertext = Encryptor::new(mac_key, &iv)
        .encrypt_padded_mut::<Iso7816>(&mut buf, msg_len)
        .expect("buffer padded to block size");

    // meta || data is always block-aligned, so the padding added one trailing
    // block; the MAC is the last cipher block of the unpadded input.
    *Iv::<CardScp>::from_slice(&ciphertext[ciphertext.len() - 32..ciphertext.len() - 16])
}

/// PBKDF2-HMAC-SHA256 pairing token over the NFKD-normalized password.
pub fn pairing_token(password: &str) -> PairingToken {
    let password = password.nfkd().collect::<String>();
    let salt = PAIRING_TOKEN_SALT.nfkd().collect::<String>();

    let mut token = PairingToken::default();
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PAIRING_TOKEN_ROUNDS,
        &mut token,
    );
    token
}

// Grow the buffer so `encrypt_padded_mut` always has room for the padding
// block; returns the original message length.
fn pad_to_block(data: &mut BytesMut) -> usize {
    let len = data.len();
    data.resize(len + 16 - len % 16, 0);
    len
}
