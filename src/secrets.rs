//! Credential generation for card initialization.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;

const PIN_LENGTH: usize = 6;
const PUK_LENGTH: usize = 12;
const PAIRING_PASSWORD_LENGTH: usize = 12;

/// The secret set installed on a card at initialization.
#[derive(Clone, Serialize)]
pub struct Secrets {
    pin: String,
    puk: String,
    #[serde(rename = "password")]
    pairing_password: String,
}

impl Secrets {
    /// Generate a secret set. A syntactically valid `user_pin` (six digits)
    /// is kept; anything else is replaced with a random PIN.
    pub fn generate(user_pin: &str) -> Self {
        let pin = if user_pin.len() == PIN_LENGTH && user_pin.bytes().all(|b| b.is_ascii_digit()) {
            user_pin.to_owned()
        } else {
            random_digits(PIN_LENGTH)
        };

        Self {
            pin,
            puk: random_digits(PUK_LENGTH),
            pairing_password: random_pairing_password(),
        }
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn puk(&self) -> &str {
        &self.puk
    }

    pub fn pairing_password(&self) -> &str {
        &self.pairing_password
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("pin", &"[redacted]")
            .field("puk", &"[redacted]")
            .field("pairing_password", &"[redacted]")
            .finish()
    }
}

fn random_digits(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn random_pairing_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PAIRING_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
