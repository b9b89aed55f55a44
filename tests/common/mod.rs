//! In-process simulated card covering the three applets the crate talks to:
//! the key-management applet, the PIN-less signing applet, and the issuer
//! security domain. The simulation speaks the real wire protocol (secure
//! channel crypto included) so the host code under test runs unmodified.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use cipher::{Iv, Key};
use hmac::{Hmac, Mac as _};
use iso7816_tlv::ber::{Tag, Tlv, Value};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use k256::elliptic_curve::PrimeField;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{Scalar, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use keyward::crypto::{
    self, CardScp, Challenge, PairingToken, apdu_mac, cryptogram, decrypt_apdu, encrypt_apdu,
    session_keys,
};
use keyward::scp02;
use keyward::{CardChannel, CardCommand, CardResponse, StatusWord, TransportError};

const SW_OK: StatusWord = StatusWord::new(0x90, 0x00);
const SW_WRONG_DATA: StatusWord = StatusWord::new(0x6A, 0x80);
const SW_FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
const SW_FILE_FULL: StatusWord = StatusWord::new(0x6A, 0x84);
const SW_INCORRECT_P1P2: StatusWord = StatusWord::new(0x6A, 0x86);
const SW_REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x88);
const SW_CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);
const SW_SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
const SW_INS_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6D, 0x00);

const KEYCARD_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x01";
const CASH_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x03";
const ISD_AID: &[u8] = b"\xA0\x00\x00\x01\x51\x00\x00\x00";
const DEFAULT_ISD_KEY: [u8; 16] = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
];

const CAP_SECURE_CHANNEL: u8 = 0x01;
const CAP_KEY_MANAGEMENT: u8 = 0x02;
const CAP_CREDENTIALS: u8 = 0x04;
const CAP_FACTORY_RESET: u8 = 0x10;

const PAIRING_SLOTS: usize = 5;
const MAX_PIN_RETRIES: u8 = 3;
const MAX_PUK_RETRIES: u8 = 5;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Applet {
    None,
    Keycard,
    Cash,
    Isd,
}

struct ScpState {
    enc: [u8; 32],
    mac: [u8; 32],
    iv: [u8; 16],
    authenticated: bool,
}

struct IsdSession {
    enc: Key<scp02::Scp02>,
    mac: Key<scp02::Scp02>,
    host_challenge: [u8; 8],
    card_challenge: [u8; 6],
    icv: [u8; 8],
    authenticated: bool,
}

#[derive(Clone)]
struct MasterKey {
    key: SecretKey,
    chain: [u8; 32],
}

/// One recorded command header (headers stay in the clear even under the
/// secure channel, so this sees every instruction).
#[derive(Clone, Copy, Debug)]
pub struct LoggedCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
}

pub struct SimCard {
    // configuration
    version: (u8, u8),
    capabilities: u8,
    // identity
    instance_uid: [u8; 16],
    secure_channel_secret: SecretKey,
    ident_key: SigningKey,
    certificate: Option<Vec<u8>>,
    cash_key: SigningKey,
    // credentials
    pin: String,
    puk: String,
    pairing_token: PairingToken,
    pin_retries: u8,
    puk_retries: u8,
    pin_verified: bool,
    // pairing slots
    pairings: [Option<[u8; 32]>; PAIRING_SLOTS],
    pending_pair_challenge: Option<Challenge>,
    // key state
    master: Option<MasterKey>,
    current_path: Vec<u32>,
    // session state
    selected: Applet,
    scp: Option<ScpState>,
    isd: Option<IsdSession>,
    isd_sequence: [u8; 2],
    installed: bool,
    initialized: bool,
    // instrumentation
    pub command_log: Vec<LoggedCommand>,
}

impl SimCard {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut instance_uid = [0u8; 16];
        rng.fill_bytes(&mut instance_uid);

        Self {
            version: (3, 1),
            capabilities: CAP_SECURE_CHANNEL
                | CAP_KEY_MANAGEMENT
                | CAP_CREDENTIALS
                | CAP_FACTORY_RESET,
            instance_uid,
            secure_channel_secret: SecretKey::random(&mut rng),
            ident_key: SigningKey::random(&mut rng),
            certificate: None,
            cash_key: SigningKey::random(&mut rng),
            pin: "123456".to_owned(),
            puk: "123456789012".to_owned(),
            pairing_token: crypto::pairing_token("KeycardTest"),
            pin_retries: MAX_PIN_RETRIES,
            puk_retries: MAX_PUK_RETRIES,
            pin_verified: false,
            pairings: [None; PAIRING_SLOTS],
            pending_pair_challenge: None,
            master: None,
            current_path: Vec::new(),
            selected: Applet::None,
            scp: None,
            isd: None,
            isd_sequence: [0x00, 0x65],
            installed: true,
            initialized: true,
            command_log: Vec::new(),
        }
    }

    pub fn with_version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn with_pairing_password(mut self, password: &str) -> Self {
        self.pairing_token = crypto::pairing_token(password);
        self
    }

    pub fn without_factory_reset_capability(mut self) -> Self {
        self.capabilities &= !CAP_FACTORY_RESET;
        self
    }

    pub fn uninitialized(mut self) -> Self {
        self.initialized = false;
        self
    }

    /// A card whose applet instance was already deleted (e.g. by an earlier
    /// interrupted fallback); only the issuer domain is selectable.
    pub fn without_applet_instance(mut self) -> Self {
        self.installed = false;
        self
    }

    /// Certify this card's ident key with `authority`; the authority's
    /// compressed public key is what the trust store has to contain.
    pub fn certified_by(mut self, authority: &SigningKey) -> Self {
        let ident_pub = self.ident_key.verifying_key().to_encoded_point(true);
        let digest = Sha256::digest(ident_pub.as_bytes());
        let (signature, recovery_id) = authority
            .sign_prehash_recoverable(&digest)
            .expect("authority signs");

        let mut certificate = Vec::with_capacity(33 + 65);
        certificate.extend_from_slice(ident_pub.as_bytes());
        certificate.extend_from_slice(&signature.to_bytes());
        certificate.push(recovery_id.to_byte());
        self.certificate = Some(certificate);
        self
    }

    pub fn instance_uid_hex(&self) -> String {
        hex::encode(self.instance_uid)
    }

    pub fn has_master_key(&self) -> bool {
        self.master.is_some()
    }

    pub fn pairing_slot_count(&self) -> usize {
        self.pairings.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn count_instruction(&self, ins: u8) -> usize {
        self.command_log.iter().filter(|c| c.ins == ins).count()
    }

    pub fn clear_log(&mut self) {
        self.command_log.clear();
    }

    /// Move the card's current path externally, as another host would.
    pub fn set_current_path(&mut self, path: &[u32]) {
        self.current_path = path.to_vec();
    }

    fn free_slots(&self) -> u8 {
        self.pairings.iter().filter(|slot| slot.is_none()).count() as u8
    }

    fn key_uid(&self) -> Option<[u8; 32]> {
        self.master.as_ref().map(|master| {
            let public = master.key.public_key().to_encoded_point(false);
            Sha256::digest(public.as_bytes()).into()
        })
    }

    fn reset_to_factory(&mut self) {
        self.initialized = false;
        self.master = None;
        self.current_path.clear();
        self.pairings = [None; PAIRING_SLOTS];
        self.pin_verified = false;
        self.pin_retries = MAX_PIN_RETRIES;
        self.puk_retries = MAX_PUK_RETRIES;
        self.scp = None;
    }

    // ---- responses ----------------------------------------------------

    fn respond(&mut self, data: Vec<u8>, sw: StatusWord) -> Bytes {
        CardResponse::new(data, sw).to_bytes()
    }

    fn status_only(&mut self, sw: StatusWord) -> Bytes {
        self.respond(Vec::new(), sw)
    }

    fn application_info_tlv(&self) -> Vec<u8> {
        let public = self
            .secure_channel_secret
            .public_key()
            .to_encoded_point(false);
        let key_uid = self.key_uid().map(|uid| uid.to_vec()).unwrap_or_default();

        let inner = vec![
            tlv(0x8F, self.instance_uid.to_vec()),
            tlv(0x80, public.as_bytes().to_vec()),
            tlv(0x02, vec![self.version.0, self.version.1]),
            tlv(0x02, vec![self.free_slots()]),
            tlv(0x8E, key_uid),
            tlv(0x8D, vec![self.capabilities]),
        ];
        Tlv::new(
            Tag::try_from(0xA4).unwrap(),
            Value::Constructed(inner),
        )
        .unwrap()
        .to_vec()
    }

    fn pre_initialized_tlv(&self) -> Vec<u8> {
        let public = self
            .secure_channel_secret
            .public_key()
            .to_encoded_point(false);
        tlv(0x80, public.as_bytes().to_vec()).to_vec()
    }

    fn signature_tlv(key: &SigningKey, hash: &[u8]) -> Vec<u8> {
        let signature: Signature = key.sign_prehash(hash).expect("sim signs");
        let public = key.verifying_key().to_encoded_point(false);
        let (r, s) = signature.split_bytes();

        let inner = vec![
            tlv(0x80, public.as_bytes().to_vec()),
            Tlv::new(
                Tag::try_from(0x30).unwrap(),
                Value::Constructed(vec![tlv(0x02, r.to_vec()), tlv(0x02, s.to_vec())]),
            )
            .unwrap(),
        ];
        Tlv::new(Tag::try_from(0xA0).unwrap(), Value::Constructed(inner))
            .unwrap()
            .to_vec()
    }

    // ---- dispatch ------------------------------------------------------

    fn handle(&mut self, raw: &[u8]) -> Bytes {
        let command = match CardCommand::from_bytes(raw) {
            Ok(command) => command,
            Err(_) => return self.status_only(SW_WRONG_DATA),
        };
        self.command_log.push(LoggedCommand {
            cla: command.class(),
            ins: command.instruction(),
            p1: command.p1(),
        });

        // SELECT always runs in the clear and tears down session state.
        if command.class() == 0x00 && command.instruction() == 0xA4 {
            return self.handle_select(&command);
        }

        match self.selected {
            Applet::Keycard => self.handle_keycard(&command),
            Applet::Cash => self.handle_cash(&command),
            Applet::Isd => self.handle_isd(&command),
            Applet::None => self.status_only(SW_CONDITIONS_NOT_SATISFIED),
        }
    }

    fn handle_select(&mut self, command: &CardCommand) -> Bytes {
        self.scp = None;
        self.isd = None;
        self.pin_verified = false;
        self.pending_pair_challenge = None;

        match command.data() {
            Some(aid) if aid == KEYCARD_AID => {
                if !self.installed {
                    self.selected = Applet::None;
                    return self.status_only(SW_FILE_NOT_FOUND);
                }
                self.selected = Applet::Keycard;
                let info = if self.initialized {
                    self.application_info_tlv()
                } else {
                    self.pre_initialized_tlv()
                };
                self.respond(info, SW_OK)
            }
            Some(aid) if aid == CASH_AID => {
                if !self.installed {
                    self.selected = Applet::None;
                    return self.status_only(SW_FILE_NOT_FOUND);
                }
                self.selected = Applet::Cash;
                self.status_only(SW_OK)
            }
            Some(aid) if aid == ISD_AID => {
                self.selected = Applet::Isd;
                self.status_only(SW_OK)
            }
            _ => {
                self.selected = Applet::None;
                self.status_only(SW_FILE_NOT_FOUND)
            }
        }
    }

    // ---- keycard applet ------------------------------------------------

    fn handle_keycard(&mut self, command: &CardCommand) -> Bytes {
        // Once a session exists every command arrives wrapped.
        if self.scp.is_some() {
            return self.handle_wrapped(command);
        }

        match command.instruction() {
            0xFE => self.op_init(command),
            0x12 => self.op_pair(command),
            0x10 => self.op_open_secure_channel(command),
            0x14 => self.op_ident(command),
            0xFD => self.op_factory_reset(command),
            _ => self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED),
        }
    }

    fn handle_wrapped(&mut self, command: &CardCommand) -> Bytes {
        let data = command.data().unwrap_or(&[]);
        if data.len() < 32 {
            self.scp = None;
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        let (received_mac, ciphertext) = data.split_at(16);

        // Recreate the host's MAC metadata and verify the chain.
        let scp = self.scp.as_mut().expect("wrapped path requires session");
        let mut meta = keyward::crypto::ApduMeta::default();
        meta[0] = command.class();
        meta[1] = command.instruction();
        meta[2] = command.p1();
        meta[3] = command.p2();
        meta[4] = data.len() as u8;

        let ciphertext = Bytes::copy_from_slice(ciphertext);
        let expected = apdu_mac(&meta, &ciphertext, Key::<CardScp>::from_slice(&scp.mac));
        if expected.as_slice() != received_mac {
            self.scp = None;
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }

        let mut buffer = BytesMut::from(ciphertext.as_ref());
        let plaintext = match decrypt_apdu(
            &mut buffer,
            Key::<CardScp>::from_slice(&scp.enc),
            Iv::<CardScp>::from_slice(&scp.iv),
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.scp = None;
                return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
            }
        };
        scp.iv = expected.into();

        let inner = CardCommand::new(
            command.class(),
            command.instruction(),
            command.p1(),
            command.p2(),
        )
        .with_data(plaintext.to_vec());

        let (payload, sw) = self.dispatch_secure(&inner);
        self.wrap_response(payload, sw)
    }

    fn wrap_response(&mut self, payload: Vec<u8>, sw: StatusWord) -> Bytes {
        let scp = match self.scp.as_mut() {
            Some(scp) => scp,
            // The secure command tore down the session (factory reset).
            None => return CardResponse::new(payload, sw).to_bytes(),
        };

        let mut plaintext = BytesMut::with_capacity(payload.len() + 2);
        plaintext.extend_from_slice(&payload);
        plaintext.extend_from_slice(&[sw.sw1, sw.sw2]);

        let ciphertext = encrypt_apdu(
            &mut plaintext,
            Key::<CardScp>::from_slice(&scp.enc),
            Iv::<CardScp>::from_slice(&scp.iv),
        );

        let mut meta = keyward::crypto::ApduMeta::default();
        meta[0] = (ciphertext.len() + 16) as u8;
        let mac = apdu_mac(&meta, &ciphertext, Key::<CardScp>::from_slice(&scp.mac));
        scp.iv = mac.into();

        let mut data = Vec::with_capacity(16 + ciphertext.len());
        data.extend_from_slice(mac.as_slice());
        data.extend_from_slice(&ciphertext);
        CardResponse::new(data, SW_OK).to_bytes()
    }

    fn dispatch_secure(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        let authenticated = self.scp.as_ref().is_some_and(|scp| scp.authenticated);
        if !authenticated && command.instruction() != 0x11 {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }

        match command.instruction() {
            0x11 => self.op_mutually_authenticate(command),
            0x20 => self.op_verify_pin(command),
            0x21 => self.op_change_credential(command),
            0x22 => self.op_unblock_pin(command),
            0x13 => self.op_unpair(command),
            0xF2 => self.op_get_status(command),
            0xD1 => self.op_derive_key(command),
            0xC2 => self.op_export_key(command),
            0xD0 => self.op_load_key(command),
            0xD4 => self.op_generate_key(),
            0xD3 => self.op_remove_key(),
            0xD2 => self.op_generate_mnemonic(command),
            0xC0 => self.op_sign(command),
            _ => (Vec::new(), SW_INS_NOT_SUPPORTED),
        }
    }

    fn op_init(&mut self, command: &CardCommand) -> Bytes {
        if self.initialized {
            return self.status_only(SW_CONDITIONS_NOT_SATISFIED);
        }
        let data = command.data().unwrap_or(&[]);
        if data.is_empty() {
            return self.status_only(SW_WRONG_DATA);
        }

        let key_len = data[0] as usize;
        if data.len() < 1 + key_len + 16 {
            return self.status_only(SW_WRONG_DATA);
        }
        let host_public = match k256::PublicKey::from_sec1_bytes(&data[1..1 + key_len]) {
            Ok(key) => key,
            Err(_) => return self.status_only(SW_WRONG_DATA),
        };
        let iv: [u8; 16] = data[1 + key_len..1 + key_len + 16].try_into().unwrap();
        let ciphertext = &data[1 + key_len + 16..];

        let shared = crypto::ecdh_shared_secret(&self.secure_channel_secret, &host_public);
        let mut buffer = BytesMut::from(ciphertext);
        let plaintext = match decrypt_apdu(
            &mut buffer,
            Key::<CardScp>::from_slice(shared.raw_secret_bytes()),
            Iv::<CardScp>::from_slice(&iv),
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => return self.status_only(SW_WRONG_DATA),
        };
        if plaintext.len() != 6 + 12 + 32 {
            return self.status_only(SW_WRONG_DATA);
        }

        self.pin = String::from_utf8_lossy(&plaintext[..6]).into_owned();
        self.puk = String::from_utf8_lossy(&plaintext[6..18]).into_owned();
        self.pairing_token = PairingToken::clone_from_slice(&plaintext[18..50]);
        self.initialized = true;
        self.status_only(SW_OK)
    }

    fn op_pair(&mut self, command: &CardCommand) -> Bytes {
        let data = command.data().unwrap_or(&[]);
        match command.p1() {
            0x00 => {
                if data.len() != 32 {
                    return self.status_only(SW_WRONG_DATA);
                }
                if self.free_slots() == 0 {
                    return self.status_only(SW_FILE_FULL);
                }
                let host_challenge = Challenge::clone_from_slice(data);
                let card_cryptogram = cryptogram(&self.pairing_token, &host_challenge);

                let mut card_challenge = Challenge::default();
                rand::thread_rng().fill_bytes(&mut card_challenge);
                self.pending_pair_challenge = Some(card_challenge);

                let mut payload = Vec::with_capacity(64);
                payload.extend_from_slice(&card_cryptogram);
                payload.extend_from_slice(&card_challenge);
                self.respond(payload, SW_OK)
            }
            0x01 => {
                let card_challenge = match self.pending_pair_challenge.take() {
                    Some(challenge) => challenge,
                    None => return self.status_only(SW_INCORRECT_P1P2),
                };
                let expected = cryptogram(&self.pairing_token, &card_challenge);
                if data != expected.as_slice() {
                    return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
                }

                let index = match self.pairings.iter().position(|slot| slot.is_none()) {
                    Some(index) => index,
                    None => return self.status_only(SW_FILE_FULL),
                };

                let mut salt = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut salt);
                let mut hasher = Sha256::new();
                hasher.update(self.pairing_token);
                hasher.update(salt);
                self.pairings[index] = Some(hasher.finalize().into());

                let mut payload = Vec::with_capacity(33);
                payload.push(index as u8);
                payload.extend_from_slice(&salt);
                self.respond(payload, SW_OK)
            }
            _ => self.status_only(SW_INCORRECT_P1P2),
        }
    }

    fn op_open_secure_channel(&mut self, command: &CardCommand) -> Bytes {
        let pairing_key = match self.pairings.get(command.p1() as usize).copied().flatten() {
            Some(key) => key,
            None => return self.status_only(SW_INCORRECT_P1P2),
        };
        let host_public = match k256::PublicKey::from_sec1_bytes(command.data().unwrap_or(&[])) {
            Ok(key) => key,
            Err(_) => return self.status_only(SW_WRONG_DATA),
        };

        let mut salt = Challenge::default();
        rand::thread_rng().fill_bytes(&mut salt);
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let shared = crypto::ecdh_shared_secret(&self.secure_channel_secret, &host_public);
        let (enc, mac) = session_keys(&shared, Key::<CardScp>::from_slice(&pairing_key), &salt);

        self.scp = Some(ScpState {
            enc: enc.into(),
            mac: mac.into(),
            iv,
            authenticated: false,
        });

        let mut payload = Vec::with_capacity(48);
        payload.extend_from_slice(&salt);
        payload.extend_from_slice(&iv);
        self.respond(payload, SW_OK)
    }

    fn op_mutually_authenticate(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if command.data().map_or(0, <[u8]>::len) != 32 {
            self.scp = None;
            return (Vec::new(), SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        if let Some(scp) = self.scp.as_mut() {
            scp.authenticated = true;
        }
        let mut reply = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut reply);
        (reply, SW_OK)
    }

    fn op_ident(&mut self, command: &CardCommand) -> Bytes {
        let challenge = command.data().unwrap_or(&[]);
        if challenge.len() != 32 {
            return self.status_only(SW_WRONG_DATA);
        }
        let certificate = match &self.certificate {
            Some(certificate) => certificate.clone(),
            None => return self.status_only(SW_REFERENCED_DATA_NOT_FOUND),
        };

        let digest = Sha256::digest(challenge);
        let signature: Signature = self.ident_key.sign_prehash(&digest).expect("sim signs");
        let (r, s) = signature.split_bytes();

        let inner = vec![
            tlv(0x8A, certificate),
            Tlv::new(
                Tag::try_from(0x30).unwrap(),
                Value::Constructed(vec![tlv(0x02, r.to_vec()), tlv(0x02, s.to_vec())]),
            )
            .unwrap(),
        ];
        let payload = Tlv::new(Tag::try_from(0xA0).unwrap(), Value::Constructed(inner))
            .unwrap()
            .to_vec();
        self.respond(payload, SW_OK)
    }

    fn op_factory_reset(&mut self, command: &CardCommand) -> Bytes {
        if command.p1() != 0xAA || command.p2() != 0x55 {
            return self.status_only(SW_INCORRECT_P1P2);
        }
        if self.capabilities & CAP_FACTORY_RESET == 0 {
            return self.status_only(SW_INS_NOT_SUPPORTED);
        }
        self.reset_to_factory();
        self.status_only(SW_OK)
    }

    fn op_verify_pin(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if self.pin_retries == 0 {
            return (Vec::new(), StatusWord::new(0x63, 0xC0));
        }
        let attempt = String::from_utf8_lossy(command.data().unwrap_or(&[]));
        if attempt == self.pin {
            self.pin_verified = true;
            self.pin_retries = MAX_PIN_RETRIES;
            (Vec::new(), SW_OK)
        } else {
            self.pin_retries -= 1;
            (
                Vec::new(),
                StatusWord::new(0x63, 0xC0 | self.pin_retries),
            )
        }
    }

    fn op_change_credential(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let data = command.data().unwrap_or(&[]);
        match command.p1() {
            0x00 => self.pin = String::from_utf8_lossy(data).into_owned(),
            0x01 => self.puk = String::from_utf8_lossy(data).into_owned(),
            0x02 => {
                if data.len() != 32 {
                    return (Vec::new(), SW_WRONG_DATA);
                }
                self.pairing_token = PairingToken::clone_from_slice(data);
            }
            _ => return (Vec::new(), SW_INCORRECT_P1P2),
        }
        (Vec::new(), SW_OK)
    }

    fn op_unblock_pin(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if self.pin_retries != 0 {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let data = command.data().unwrap_or(&[]);
        if data.len() < 12 {
            return (Vec::new(), SW_WRONG_DATA);
        }
        let (puk, new_pin) = data.split_at(12);
        if String::from_utf8_lossy(puk) != self.puk {
            self.puk_retries = self.puk_retries.saturating_sub(1);
            return (
                Vec::new(),
                StatusWord::new(0x63, 0xC0 | self.puk_retries),
            );
        }
        self.pin = String::from_utf8_lossy(new_pin).into_owned();
        self.pin_retries = MAX_PIN_RETRIES;
        self.puk_retries = MAX_PUK_RETRIES;
        (Vec::new(), SW_OK)
    }

    fn op_unpair(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let index = command.p1() as usize;
        if index >= PAIRING_SLOTS {
            return (Vec::new(), SW_INCORRECT_P1P2);
        }
        self.pairings[index] = None;
        (Vec::new(), SW_OK)
    }

    fn op_get_status(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        match command.p1() {
            0x00 => {
                let inner = vec![
                    tlv(0x02, vec![self.pin_retries]),
                    tlv(0x02, vec![self.puk_retries]),
                    tlv(
                        0x01,
                        vec![if self.master.is_some() { 0xFF } else { 0x00 }],
                    ),
                ];
                let payload = Tlv::new(Tag::try_from(0xA3).unwrap(), Value::Constructed(inner))
                    .unwrap()
                    .to_vec();
                (payload, SW_OK)
            }
            0x01 => {
                let payload = self
                    .current_path
                    .iter()
                    .flat_map(|component| component.to_be_bytes())
                    .collect();
                (payload, SW_OK)
            }
            _ => (Vec::new(), SW_INCORRECT_P1P2),
        }
    }

    fn op_derive_key(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        if self.master.is_none() {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let path = match parse_path(command.data().unwrap_or(&[])) {
            Some(path) => path,
            None => return (Vec::new(), SW_WRONG_DATA),
        };
        self.current_path = path;
        (Vec::new(), SW_OK)
    }

    fn op_export_key(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let master = match &self.master {
            Some(master) => master.clone(),
            None => return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED),
        };

        let path = match command.p1() {
            0x00 => self.current_path.clone(),
            0x01 => match parse_path(command.data().unwrap_or(&[])) {
                Some(path) => path,
                None => return (Vec::new(), SW_WRONG_DATA),
            },
            _ => return (Vec::new(), SW_INCORRECT_P1P2),
        };
        if command.p1() == 0x01 && self.version < (3, 1) && command.p2() == 0x02 {
            // Extended export is a 3.1 feature.
            return (Vec::new(), SW_INCORRECT_P1P2);
        }

        let (key, chain) = derive_node(&master, &path);
        let public = key.public_key().to_encoded_point(false);

        let mut inner = Vec::new();
        inner.push(tlv(0x80, public.as_bytes().to_vec()));
        if command.p2() == 0x00 {
            inner.push(tlv(0x81, key.to_bytes().to_vec()));
        }
        if command.p2() == 0x02 {
            inner.push(tlv(0x82, chain.to_vec()));
        }
        let payload = Tlv::new(Tag::try_from(0xA1).unwrap(), Value::Constructed(inner))
            .unwrap()
            .to_vec();
        (payload, SW_OK)
    }

    fn op_load_key(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let data = command.data().unwrap_or(&[]);

        let master = match command.p1() {
            0x01 | 0x02 => match parse_keypair_template(data) {
                Some(master) => master,
                None => return (Vec::new(), SW_WRONG_DATA),
            },
            0x03 => {
                if data.len() != 64 {
                    return (Vec::new(), SW_WRONG_DATA);
                }
                let mut mac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed").unwrap();
                mac.update(data);
                let digest = mac.finalize().into_bytes();
                MasterKey {
                    key: SecretKey::from_slice(&digest[..32]).unwrap(),
                    chain: digest[32..].try_into().unwrap(),
                }
            }
            _ => return (Vec::new(), SW_INCORRECT_P1P2),
        };

        self.master = Some(master);
        self.current_path.clear();
        (self.key_uid().unwrap().to_vec(), SW_OK)
    }

    fn op_generate_key(&mut self) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let mut rng = rand::thread_rng();
        let mut chain = [0u8; 32];
        rng.fill_bytes(&mut chain);
        self.master = Some(MasterKey {
            key: SecretKey::random(&mut rng),
            chain,
        });
        self.current_path.clear();
        (self.key_uid().unwrap().to_vec(), SW_OK)
    }

    fn op_remove_key(&mut self) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        self.master = None;
        self.current_path.clear();
        (Vec::new(), SW_OK)
    }

    fn op_generate_mnemonic(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        let checksum = command.p1();
        if !(4..=8).contains(&checksum) {
            return (Vec::new(), SW_INCORRECT_P1P2);
        }
        let words = checksum as usize * 3;
        let mut payload = Vec::with_capacity(words * 2);
        let mut rng = rand::thread_rng();
        for _ in 0..words {
            let index = (rng.next_u32() % 2048) as u16;
            payload.extend_from_slice(&index.to_be_bytes());
        }
        (payload, SW_OK)
    }

    fn op_sign(&mut self, command: &CardCommand) -> (Vec<u8>, StatusWord) {
        if !self.pin_verified {
            return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }
        let master = match &self.master {
            Some(master) => master.clone(),
            None => return (Vec::new(), SW_CONDITIONS_NOT_SATISFIED),
        };
        let data = command.data().unwrap_or(&[]);
        if data.len() < 32 {
            return (Vec::new(), SW_WRONG_DATA);
        }
        let (hash, path_data) = data.split_at(32);

        let path = match command.p1() {
            0x00 => self.current_path.clone(),
            0x01 => {
                if self.version < (2, 2) {
                    return (Vec::new(), SW_INCORRECT_P1P2);
                }
                match parse_path(path_data) {
                    Some(path) => path,
                    None => return (Vec::new(), SW_WRONG_DATA),
                }
            }
            _ => return (Vec::new(), SW_INCORRECT_P1P2),
        };

        let (key, _) = derive_node(&master, &path);
        let payload = Self::signature_tlv(&SigningKey::from(&key), hash);
        (payload, SW_OK)
    }

    // ---- cash applet ---------------------------------------------------

    fn handle_cash(&mut self, command: &CardCommand) -> Bytes {
        match command.instruction() {
            0xC0 => {
                let data = command.data().unwrap_or(&[]);
                if data.len() != 32 {
                    return self.status_only(SW_WRONG_DATA);
                }
                let payload = Self::signature_tlv(&self.cash_key, data);
                self.respond(payload, SW_OK)
            }
            _ => self.status_only(SW_INS_NOT_SUPPORTED),
        }
    }

    // ---- issuer security domain ---------------------------------------

    fn handle_isd(&mut self, command: &CardCommand) -> Bytes {
        match (command.class(), command.instruction()) {
            (0x80, 0x50) => self.op_initialize_update(command),
            (0x84, 0x82) => self.op_external_authenticate(command),
            (0x84, 0xE4) => self.op_delete(command),
            (0x84, 0xE6) => self.op_install(command),
            _ => self.status_only(SW_INS_NOT_SUPPORTED),
        }
    }

    fn op_initialize_update(&mut self, command: &CardCommand) -> Bytes {
        let host_challenge: [u8; 8] = match command.data().unwrap_or(&[]).try_into() {
            Ok(challenge) => challenge,
            Err(_) => return self.status_only(SW_WRONG_DATA),
        };

        let mut card_challenge = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut card_challenge);

        let card_key = Key::<scp02::Scp02>::from_slice(&DEFAULT_ISD_KEY);
        let enc = scp02::derive_key(card_key, &self.isd_sequence, &scp02::DERIVATION_ENC);
        let mac = scp02::derive_key(card_key, &self.isd_sequence, &scp02::DERIVATION_MAC);

        let card_cryptogram = scp02::calculate_cryptogram(
            &enc,
            &self.isd_sequence,
            &card_challenge,
            &host_challenge,
            false,
        );

        let mut payload = Vec::with_capacity(28);
        payload.extend_from_slice(&[0u8; 10]); // key diversification data
        payload.extend_from_slice(&[0x01, 0x02]); // key info: version 1, SCP02
        payload.extend_from_slice(&self.isd_sequence);
        payload.extend_from_slice(&card_challenge);
        payload.extend_from_slice(&card_cryptogram);

        self.isd = Some(IsdSession {
            enc,
            mac,
            host_challenge,
            card_challenge,
            icv: [0; 8],
            authenticated: false,
        });
        self.respond(payload, SW_OK)
    }

    /// Verify the chained retail MAC of a wrapped issuer command; returns
    /// the command data with the MAC stripped.
    fn verify_isd_mac(&mut self, command: &CardCommand) -> Option<Vec<u8>> {
        let session = self.isd.as_mut()?;
        let data = command.data().unwrap_or(&[]);
        if data.len() < 8 {
            return None;
        }
        let (body, received_mac) = data.split_at(data.len() - 8);

        let mut mac_data = Vec::with_capacity(5 + body.len());
        mac_data.push(command.class());
        mac_data.push(command.instruction());
        mac_data.push(command.p1());
        mac_data.push(command.p2());
        mac_data.push((body.len() + 8) as u8);
        mac_data.extend_from_slice(body);

        let icv_for_mac = if session.icv == [0; 8] {
            Iv::<scp02::Scp02>::default()
        } else {
            scp02::encrypt_icv(&session.mac, Iv::<scp02::Scp02>::from_slice(&session.icv))
        };
        let expected = scp02::mac_full_3des(&session.mac, &icv_for_mac, &mac_data);
        if expected != received_mac {
            return None;
        }
        session.icv = expected;
        Some(body.to_vec())
    }

    fn op_external_authenticate(&mut self, command: &CardCommand) -> Bytes {
        let body = match self.verify_isd_mac(command) {
            Some(body) => body,
            None => return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED),
        };
        let session = self.isd.as_mut().expect("mac verified implies session");

        let expected = scp02::calculate_cryptogram(
            &session.enc,
            &self.isd_sequence,
            &session.card_challenge,
            &session.host_challenge,
            true,
        );
        if body != expected {
            self.isd = None;
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        session.authenticated = true;

        // The sequence counter advances with every successful channel.
        self.isd_sequence[1] = self.isd_sequence[1].wrapping_add(1);
        self.status_only(SW_OK)
    }

    fn op_delete(&mut self, command: &CardCommand) -> Bytes {
        let body = match self.verify_isd_mac(command) {
            Some(body) => body,
            None => return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED),
        };
        if !self.isd.as_ref().is_some_and(|s| s.authenticated) {
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }

        // 4F <len> <aid>
        if body.len() < 2 || body[0] != 0x4F || body[1] as usize != body.len() - 2 {
            return self.status_only(SW_WRONG_DATA);
        }
        let aid = &body[2..];
        if aid != KEYCARD_AID || !self.installed {
            return self.status_only(SW_REFERENCED_DATA_NOT_FOUND);
        }
        self.installed = false;
        self.status_only(SW_OK)
    }

    fn op_install(&mut self, command: &CardCommand) -> Bytes {
        if self.verify_isd_mac(command).is_none() {
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        if !self.isd.as_ref().is_some_and(|s| s.authenticated) {
            return self.status_only(SW_SECURITY_STATUS_NOT_SATISFIED);
        }

        self.installed = true;
        self.reset_to_factory();
        self.status_only(SW_OK)
    }
}

impl CardChannel for SimCard {
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        Ok(self.handle(command))
    }
}

// ---- helpers -----------------------------------------------------------

fn tlv(tag: u8, value: Vec<u8>) -> Tlv {
    Tlv::new(Tag::try_from(tag).unwrap(), Value::Primitive(value)).unwrap()
}

fn parse_path(data: &[u8]) -> Option<Vec<u32>> {
    if data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect(),
    )
}

fn parse_keypair_template(data: &[u8]) -> Option<MasterKey> {
    let template = Tlv::from_bytes(data).ok()?;
    if template.tag() != &Tag::try_from(0xA1).ok()? {
        return None;
    }
    let inner = match template.value() {
        Value::Constructed(inner) => inner,
        Value::Primitive(_) => return None,
    };

    let mut key = None;
    let mut chain = [0u8; 32];
    for tlv in inner {
        if let Value::Primitive(bytes) = tlv.value() {
            if tlv.tag() == &Tag::try_from(0x81).ok()? {
                key = SecretKey::from_slice(bytes).ok();
            } else if tlv.tag() == &Tag::try_from(0x82).ok()? {
                chain = bytes.as_slice().try_into().ok()?;
            }
        }
    }
    Some(MasterKey { key: key?, chain })
}

/// BIP32 child derivation over the simulated master key.
fn derive_node(master: &MasterKey, path: &[u32]) -> (SecretKey, [u8; 32]) {
    let mut key = master.key.clone();
    let mut chain = master.chain;

    for &index in path {
        let mut mac = Hmac::<Sha512>::new_from_slice(&chain).unwrap();
        if index >= 0x8000_0000 {
            mac.update(&[0]);
            mac.update(&key.to_bytes());
        } else {
            mac.update(key.public_key().to_encoded_point(true).as_bytes());
        }
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let tweak = Option::<Scalar>::from(Scalar::from_repr(
            *k256::FieldBytes::from_slice(&digest[..32]),
        ))
        .expect("derived scalar in field");
        let parent: Scalar = *key.to_nonzero_scalar();
        let child = tweak + parent;

        key = SecretKey::from_slice(&child.to_repr()).expect("nonzero child key");
        chain = digest[32..].try_into().unwrap();
    }

    (key, chain)
}
