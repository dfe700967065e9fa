//! SCRAM-SHA-256 client state machine (RFC 5802, RFC 7677).
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, ErrorKind, Result},
    notice::Notice,
};

use super::saslprep::saslprep;

/// The only SASL mechanism the driver speaks.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// No channel binding, no authorization identity.
const GS2_HEADER: &str = "n,,";

/// `base64("n,,")`, the channel-binding field of the client-final message.
const CBIND_INPUT: &str = "biws";

const MIN_ITERATIONS: u32 = 4096;
const NONCE_LEN: usize = 24;

type HmacSha256 = Hmac<Sha256>;

/// One SCRAM-SHA-256 exchange.
///
/// ```text
/// client-first  ->
///               <- server-first   (nonce, salt, iterations)
/// client-final  ->
///               <- server-final   (server signature)
/// ```
pub struct ScramSha256 {
    client_first_bare: String,
    nonce: String,
    password: String,
    exchange: Exchange,
}

enum Exchange {
    ClientFirst,
    ClientFinal {
        client_final: String,
        salted_password: [u8; 32],
        auth_message: String,
    },
}

impl ScramSha256 {
    /// Prepare the exchange. Username and password go through SASLprep in
    /// stored-string mode.
    pub fn new(user: &str, password: &str) -> Result<ScramSha256> {
        Self::with_nonce(user, password, generate_nonce())
    }

    /// Used by tests to pin the client nonce to a known vector.
    pub(crate) fn with_nonce(user: &str, password: &str, nonce: String) -> Result<ScramSha256> {
        let user = saslprep(user).map_err(ErrorKind::InvalidUsername)?;
        let password = saslprep(password).map_err(ErrorKind::InvalidPassword)?;
        Ok(ScramSha256 {
            client_first_bare: format!("n={},r={}", escape_username(&user), nonce),
            nonce,
            password,
            exchange: Exchange::ClientFirst,
        })
    }

    /// The initial client response, `n,,n=<user>,r=<nonce>`.
    ///
    /// The username here is informational only; the server identifies the
    /// role from the startup message. The authorization identity stays empty.
    pub fn client_first(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    /// Digest the server-first message and derive the client proof.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<()> {
        let mut attrs = server_first.split(',');

        let server_nonce = attrs
            .next()
            .and_then(|v| v.strip_prefix("r="))
            .ok_or_else(|| Error::malformed("server-first message without nonce"))?;

        let salt = attrs
            .next()
            .and_then(|v| v.strip_prefix("s="))
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or_else(|| Error::malformed("server-first message without salt"))?;

        let iterations: u32 = attrs
            .next()
            .and_then(|v| v.strip_prefix("i="))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::malformed("server-first message without iteration count"))?;

        // the server nonce must extend the nonce we sent
        if !server_nonce.starts_with(&self.nonce) || server_nonce.len() <= self.nonce.len() {
            return Err(ErrorKind::ServerNonceMismatch.into());
        }

        if iterations < MIN_ITERATIONS {
            return Err(ErrorKind::ScramIterationsTooLow(iterations).into());
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);

        let client_key = HmacSha256::new_from_slice(&salted_password)
            .unwrap()
            .chain_update(b"Client Key")
            .finalize()
            .into_bytes();

        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={CBIND_INPUT},r={server_nonce}");
        let auth_message =
            format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let client_signature = HmacSha256::new_from_slice(&stored_key)
            .unwrap()
            .chain_update(auth_message.as_bytes())
            .finalize()
            .into_bytes();

        let mut client_proof = client_key;
        for (proof, signature) in client_proof.iter_mut().zip(client_signature) {
            *proof ^= signature;
        }

        self.exchange = Exchange::ClientFinal {
            client_final: format!("{},p={}", without_proof, BASE64.encode(client_proof)),
            salted_password,
            auth_message,
        };
        Ok(())
    }

    /// The final client response, `c=biws,r=<server nonce>,p=<proof>`.
    pub fn client_final(&self) -> Result<&str> {
        match &self.exchange {
            Exchange::ClientFinal { client_final, .. } => Ok(client_final),
            Exchange::ClientFirst => Err(Error::unexpected("sasl exchange", b'p')),
        }
    }

    /// Verify the server signature from the server-final message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let Exchange::ClientFinal { salted_password, auth_message, .. } = &self.exchange else {
            return Err(Error::unexpected("sasl exchange", b'v'));
        };

        if let Some(message) = server_final.strip_prefix("e=") {
            // the mechanism-level failure path; postgres itself reports
            // failures through ErrorResponse instead
            let notice = Notice {
                severity: Some("ERROR".into()),
                message: Some(message.to_owned()),
                ..Notice::default()
            };
            return Err(notice.into());
        }

        let signature = server_final
            .strip_prefix("v=")
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or_else(|| Error::malformed("server-final message without verifier"))?;

        let server_key = HmacSha256::new_from_slice(salted_password)
            .unwrap()
            .chain_update(b"Server Key")
            .finalize()
            .into_bytes();

        HmacSha256::new_from_slice(&server_key)
            .unwrap()
            .chain_update(auth_message.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| ErrorKind::ServerSignatureMismatch.into())
    }
}

/// `Hi(str, salt, i)`: PBKDF2-HMAC-SHA-256 with a 32-byte derived key.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut prev = HmacSha256::new_from_slice(password)
        .unwrap()
        .chain_update(salt)
        .chain_update(1u32.to_be_bytes())
        .finalize()
        .into_bytes();
    let mut output = prev;

    for _ in 1..iterations {
        prev = HmacSha256::new_from_slice(password)
            .unwrap()
            .chain_update(prev)
            .finalize()
            .into_bytes();
        for (out, prev) in output.iter_mut().zip(prev) {
            *out ^= prev;
        }
    }

    output.into()
}

/// 24 random characters from the printable ASCII range, commas excluded.
fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| loop {
        let c = rng.gen_range(0x21u8..=0x7e);
        if c != b',' {
            break char::from(c);
        }
    })
    .take(NONCE_LEN)
    .collect()
}

/// RFC 5802 username escaping: `,` and `=` are reserved.
fn escape_username(user: &str) -> String {
    if !user.contains([',', '=']) {
        return user.to_owned();
    }
    user.chars()
        .flat_map(|c| match c {
            ',' => "=2C".chars().collect::<Vec<_>>(),
            '=' => "=3D".chars().collect(),
            c => vec![c],
        })
        .collect()
}
