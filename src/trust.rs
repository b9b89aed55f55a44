//! Trusted-authority set and the card authenticity check.
//!
//! The check is best-effort by contract: whatever happens at the card during
//! the probe, the caller's flow continues. The verdict keeps "the card failed
//! verification" distinct from "verification could not be attempted" so the
//! host can tell the two apart in diagnostics.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::commands;
use crate::constants::tags;
use crate::error::{Error, Result};
use crate::transport::{CardChannel, exchange};
use crate::types::parse_ecdsa_signature;

/// Outcome of an authenticity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    /// The card proved possession of a key certified by a trusted authority,
    /// or verification was waived (empty trust set, skip token).
    Trusted,
    /// The probe completed and the card is not vouched for by any trusted
    /// authority.
    Rejected,
    /// The probe could not be completed (card error, malformed evidence).
    Inconclusive,
}

impl Authenticity {
    pub const fn is_authentic(self) -> bool {
        matches!(self, Self::Trusted)
    }
}

/// Set of trusted certification-authority keys plus the one-shot
/// verification-skip token. Both are replaced wholesale by the host, never
/// merged.
#[derive(Debug, Default)]
pub struct AuthorityTrustStore {
    ca_keys: Vec<String>,
    skip_token: Option<String>,
}

impl AuthorityTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the trusted-authority list (hex-encoded compressed keys).
    pub fn replace_authorities(&mut self, keys: &[String]) {
        self.ca_keys = keys.iter().map(|k| k.to_lowercase()).collect();
    }

    /// Arm the one-time verification skip for a card instance.
    pub fn set_skip_token(&mut self, instance_uid_hex: String) {
        self.skip_token = Some(instance_uid_hex.to_lowercase());
    }

    pub fn is_trust_set_empty(&self) -> bool {
        self.ca_keys.is_empty()
    }

    fn contains(&self, ca_key_hex: &str) -> bool {
        self.ca_keys.iter().any(|k| k == ca_key_hex)
    }

    fn skip_token_matches(&self, instance_uid_hex: &str) -> bool {
        self.skip_token.as_deref() == Some(instance_uid_hex)
    }
}

/// Check a selected card against the trust store. The skip token is
/// consumed by the check that reaches it, regardless of what the check
/// concludes.
pub fn verify_authenticity(
    channel: &mut dyn CardChannel,
    instance_uid_hex: &str,
    store: &mut AuthorityTrustStore,
) -> Authenticity {
    if store.is_trust_set_empty() || store.skip_token_matches(&instance_uid_hex.to_lowercase()) {
        store.skip_token = None;
        return Authenticity::Trusted;
    }

    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);

    match identify_card(channel, &challenge) {
        Ok((_, Some(ca_key))) if store.contains(&ca_key) => Authenticity::Trusted,
        Ok(_) => Authenticity::Rejected,
        Err(e) => {
            debug!(error = %e, "authenticity probe failed");
            Authenticity::Inconclusive
        }
    }
}

/// Run the IDENT exchange and evaluate the returned evidence. Returns the
/// raw TLV evidence and, when both proofs verify, the recovered CA key in
/// compressed hex form.
pub(crate) fn identify_card(
    channel: &mut dyn CardChannel,
    challenge: &[u8; 32],
) -> Result<(Vec<u8>, Option<String>)> {
    let response = exchange(channel, &commands::card::ident(challenge))?;
    if !response.is_success() {
        return Err(Error::Status {
            command: "IDENT",
            sw: response.status(),
        });
    }

    let data = response.data().to_vec();
    let ca_key = recover_authority(challenge, &data)?;
    Ok((data, ca_key))
}

/// Parse the identity evidence: a signature template holding the card
/// certificate and the ident key's signature over the challenge hash.
/// Recovery yields the certifying authority's key; `None` means the
/// evidence did not verify.
fn recover_authority(challenge: &[u8; 32], evidence: &[u8]) -> Result<Option<String>> {
    let tlv = Tlv::from_bytes(evidence)?;
    if tlv.tag() != &Tag::try_from(tags::TEMPLATE_SIGNATURE)? {
        return Err(Error::InvalidData("Unexpected identity template tag"));
    }

    let tlvs = match tlv.value() {
        Value::Constructed(tlvs) if tlvs.len() >= 2 => tlvs,
        _ => return Err(Error::InvalidData("Identity template was not constructed")),
    };

    let certificate = match tlvs[0].value() {
        Value::Primitive(bytes) if tlvs[0].tag() == &Tag::try_from(tags::CERTIFICATE)? => bytes,
        _ => return Err(Error::InvalidData("Missing card certificate")),
    };
    if certificate.len() != 33 + 65 {
        return Err(Error::InvalidData("Invalid certificate length"));
    }
    let (ident_raw, ca_signature) = certificate.split_at(33);

    // Proof 1: the card controls the certified ident key.
    let ident_key = VerifyingKey::from_sec1_bytes(ident_raw)?;
    let challenge_signature = parse_ecdsa_signature(&tlvs[1])?;
    let challenge_hash = Sha256::digest(challenge);
    if ident_key
        .verify_prehash(&challenge_hash, &challenge_signature)
        .is_err()
    {
        return Ok(None);
    }

    // Proof 2: recover whoever certified the ident key.
    let signature = Signature::from_slice(&ca_signature[..64])?;
    let recovery_id = RecoveryId::from_byte(ca_signature[64])
        .ok_or(Error::InvalidData("Invalid certificate recovery id"))?;
    let ident_hash = Sha256::digest(ident_raw);
    let ca_key = VerifyingKey::recover_from_prehash(&ident_hash, &signature, recovery_id)?;

    Ok(Some(hex::encode(
        ca_key.to_encoded_point(true).as_bytes(),
    )))
}
