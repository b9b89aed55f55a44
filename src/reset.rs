//! Factory reset: the direct path when the applet supports it, otherwise the
//! issuer-domain fallback that deletes and reinstalls the applet instance.
//!
//! Every path ends by re-selecting the primary applet and reporting its
//! initialization state. Fallback commands are not retried; the first
//! failure inside the chain is fatal and surfaced.

use cipher::{Iv, Key};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info};

use crate::commands;
use crate::constants::{ISD_AID, KEYCARD_AID, KEYCARD_PACKAGE_AID, status};
use crate::error::{Error, Result};
use crate::scp02::{self, Scp02};
use crate::session::select_applet;
use crate::transport::{CardChannel, CardCommand, CardResponse, exchange};
use crate::types::{Capability, CardIdentity};

/// Default issuer key set (the GlobalPlatform test key), shared by all
/// factory-configured cards.
const DEFAULT_ISD_KEY: [u8; 16] = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
];

/// Terminal state of a factory reset: whether the re-selected applet reports
/// itself initialized.
#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    #[serde(rename = "initialized?")]
    pub initialized: bool,
}

/// Run the factory reset state machine.
pub fn factory_reset(channel: &mut dyn CardChannel) -> Result<ResetReport> {
    if !try_direct_reset(channel)? {
        fallback(channel)?;
    }
    post_select(channel)
}

/// The direct path: select the primary applet, require the factory reset
/// capability, issue the reset. Any card-level refusal routes to the
/// fallback; only transport failures are fatal here.
fn try_direct_reset(channel: &mut dyn CardChannel) -> Result<bool> {
    let response = exchange(channel, &commands::select(KEYCARD_AID))?;
    if !response.is_success() {
        debug!(sw = %response.status(), "primary applet selection failed, taking fallback");
        return Ok(false);
    }

    let identity = match CardIdentity::try_from(response.data()) {
        Ok(identity) => identity,
        Err(_) => {
            debug!("unparseable selection response, taking fallback");
            return Ok(false);
        }
    };
    if !identity.capabilities.has(Capability::FactoryReset) {
        debug!("applet is not reset-capable, taking fallback");
        return Ok(false);
    }

    let response = exchange(channel, &commands::card::factory_reset())?;
    if response.is_success() {
        info!("factory reset performed");
        Ok(true)
    } else {
        debug!(sw = %response.status(), "direct factory reset refused, taking fallback");
        Ok(false)
    }
}

/// The fallback chain: issuer domain, secure channel, delete instance
/// (an already-absent instance counts as deleted), reinstall.
fn fallback(channel: &mut dyn CardChannel) -> Result<()> {
    let response = exchange(channel, &commands::select(ISD_AID))?;
    if !response.is_success() {
        return Err(Error::Status {
            command: "SELECT ISD",
            sw: response.status(),
        });
    }
    info!("issuer security domain selected");

    let mut issuer = IssuerChannel::open(channel)?;
    info!("issuer secure channel opened");

    let response = issuer.transmit(&commands::issuer::delete_object_and_related(KEYCARD_AID))?;
    if !response.is_success() && response.status() != status::REFERENCED_DATA_NOT_FOUND {
        return Err(Error::Status {
            command: "DELETE",
            sw: response.status(),
        });
    }
    info!("applet instance deleted");

    let response = issuer.transmit(&commands::issuer::install_for_install(
        KEYCARD_PACKAGE_AID,
        KEYCARD_AID,
        KEYCARD_AID,
    ))?;
    if !response.is_success() {
        return Err(Error::Status {
            command: "INSTALL",
            sw: response.status(),
        });
    }
    info!("applet instance re-installed");
    Ok(())
}

fn post_select(channel: &mut dyn CardChannel) -> Result<ResetReport> {
    let identity = select_applet(channel)?;
    Ok(ResetReport {
        initialized: identity.initialized,
    })
}

/// SCP02 secure channel to the issuer domain. Opened with the default key
/// set; commands sent through it carry chained retail MACs.
struct IssuerChannel<'c> {
    channel: &'c mut dyn CardChannel,
    mac_key: [u8; 16],
    icv: [u8; 8],
}

impl<'c> IssuerChannel<'c> {
    fn open(channel: &'c mut dyn CardChannel) -> Result<Self> {
        let mut host_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut host_challenge);

        let response = exchange(channel, &commands::issuer::initialize_update(&host_challenge))?;
        if !response.is_success() {
            return Err(Error::Status {
                command: "INITIALIZE UPDATE",
                sw: response.status(),
            });
        }

        let data = response.data();
        if data.len() != 28 {
            return Err(Error::InvalidData("INITIALIZE UPDATE response length"));
        }
        let sequence_counter: [u8; 2] = data[12..14].try_into().expect("length checked");
        let card_challenge: [u8; 6] = data[14..20].try_into().expect("length checked");
        let card_cryptogram: [u8; 8] = data[20..28].try_into().expect("length checked");

        let card_key = Key::<Scp02>::from_slice(&DEFAULT_ISD_KEY);
        let enc_key = scp02::derive_key(card_key, &sequence_counter, &scp02::DERIVATION_ENC);
        let mac_key = scp02::derive_key(card_key, &sequence_counter, &scp02::DERIVATION_MAC);

        let expected = scp02::calculate_cryptogram(
            &enc_key,
            &sequence_counter,
            &card_challenge,
            &host_challenge,
            false,
        );
        if expected != card_cryptogram {
            return Err(Error::AuthenticationFailed);
        }

        let host_cryptogram = scp02::calculate_cryptogram(
            &enc_key,
            &sequence_counter,
            &card_challenge,
            &host_challenge,
            true,
        );

        let mut issuer = Self {
            channel,
            mac_key: mac_key.into(),
            icv: [0; 8],
        };
        let response =
            issuer.transmit(&commands::issuer::external_authenticate(&host_cryptogram))?;
        if !response.is_success() {
            return Err(Error::AuthenticationFailed);
        }
        Ok(issuer)
    }

    fn transmit(&mut self, command: &CardCommand) -> Result<CardResponse> {
        let wrapped = self.wrap(command);
        let raw = self.channel.transmit(&wrapped.to_bytes())?;
        Ok(CardResponse::from_bytes(&raw)?)
    }

    /// Append the retail MAC, chaining each MAC into the next command's ICV.
    fn wrap(&mut self, command: &CardCommand) -> CardCommand {
        let data = command.data().unwrap_or(&[]);
        let cla = command.class() | 0x04;

        let mut mac_data = Vec::with_capacity(5 + data.len());
        mac_data.push(cla);
        mac_data.push(command.instruction());
        mac_data.push(command.p1());
        mac_data.push(command.p2());
        mac_data.push((data.len() + 8) as u8);
        mac_data.extend_from_slice(data);

        let mac_key = Key::<Scp02>::from_slice(&self.mac_key);
        let icv_for_mac = if self.icv == [0; 8] {
            Iv::<Scp02>::default()
        } else {
            scp02::encrypt_icv(mac_key, Iv::<Scp02>::from_slice(&self.icv))
        };

        let mac = scp02::mac_full_3des(mac_key, &icv_for_mac, &mac_data);
        self.icv = mac;

        let mut wrapped_data = Vec::with_capacity(data.len() + 8);
        wrapped_data.extend_from_slice(data);
        wrapped_data.extend_from_slice(&mac);

        let mut wrapped = CardCommand::new(cla, command.instruction(), command.p1(), command.p2())
            .with_data(wrapped_data);
        if let Some(le) = command.le() {
            wrapped = wrapped.with_le(le);
        }
        wrapped
    }
}
