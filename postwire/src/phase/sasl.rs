//! SCRAM-SHA-256 client.
//!
//! <https://www.postgresql.org/docs/current/sasl-authentication.html>
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Maximum accepted iteration count.
pub const MAX_ITERATIONS: u32 = 1_000_000;

const NONCE_LEN: usize = 24;

/// `base64("n,,")`, no channel binding.
const CHANNEL_BINDING: &str = "biws";

/// SCRAM-SHA-256 exchange state.
///
/// The username is sent as `*`, postgres use the one in startup message.
pub struct ScramSha256 {
    password: Vec<u8>,
    client_nonce: String,
    state: State,
}

enum State {
    Initial,
    Continue {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

impl ScramSha256 {
    /// Create new exchange with random client nonce.
    pub fn new(password: &str) -> Self {
        let client_nonce = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(password, client_nonce)
    }

    #[doc(hidden)]
    pub fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self { password: password.as_bytes().to_vec(), client_nonce, state: State::Initial }
    }

    /// The client-first-message, sent in `SASLInitialResponse`.
    pub fn message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n=*,r={}", self.client_nonce)
    }

    /// Process server-first-message from `SASLContinue`.
    ///
    /// Returns the client-final-message, sent in `SASLResponse`.
    pub fn update(&mut self, server_first: &[u8]) -> Result<Vec<u8>, SaslError> {
        if !matches!(self.state, State::Initial) {
            return Err(SaslError::new("unexpected server first message"));
        }

        let message = std::str::from_utf8(server_first).map_err(|_| SaslError::new("invalid server message"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value);
            }
        }

        let nonce = nonce.ok_or(SaslError::new("missing server nonce"))?;
        let salt = salt.ok_or(SaslError::new("missing server salt"))?;
        let iterations = iterations.ok_or(SaslError::new("missing iteration count"))?;

        let iterations = match iterations.parse::<u32>() {
            Ok(i) if i > 0 => i,
            _ => return Err(SaslError::new("invalid iteration count")),
        };

        if !nonce.starts_with(&self.client_nonce) || nonce.len() <= self.client_nonce.len() {
            return Err(SaslError::new("invalid server nonce"));
        }

        let salt = BASE64.decode(salt).map_err(|_| SaslError::new("invalid server salt"))?;

        if iterations > MAX_ITERATIONS {
            return Err(SaslError::new("iteration count exceeds limit"));
        }

        let salted_password = pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(&self.password, &salt, iterations);

        let client_final_without_proof = format!("c={CHANNEL_BINDING},r={nonce}");
        let auth_message = format!("{},{message},{client_final_without_proof}", self.client_first_bare());

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature)?;

        self.state = State::Continue { salted_password, auth_message };

        Ok(format!("{client_final_without_proof},p={}", BASE64.encode(client_proof)).into_bytes())
    }

    /// Verify server-final-message from `SASLFinal`.
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), SaslError> {
        let State::Continue { salted_password, auth_message } = &self.state else {
            return Err(SaslError::new("unexpected server final message"));
        };

        let message = std::str::from_utf8(server_final).map_err(|_| SaslError::new("invalid server message"))?;

        if let Some(error) = message.strip_prefix("e=") {
            return Err(SaslError { reason: format!("server error: {error}").into() });
        }

        let verifier = message
            .split(',')
            .find_map(|e| e.strip_prefix("v="))
            .ok_or(SaslError::new("missing server signature"))?;

        let verifier = BASE64.decode(verifier).map_err(|_| SaslError::new("invalid server signature"))?;

        let server_key = hmac(salted_password, b"Server Key");
        let mut mac = HmacSha256::new_from_slice(&server_key).expect("HMAC accept any key length");
        mac.update(auth_message.as_bytes());

        // constant time comparison
        mac.verify_slice(&verifier).map_err(|_| SaslError::new("mismatch server signature"))?;

        self.state = State::Done;
        Ok(())
    }
}

impl fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramSha256")
            .field("client_nonce", &self.client_nonce)
            .finish_non_exhaustive()
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accept any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor(left: &[u8], right: &[u8]) -> Result<Vec<u8>, SaslError> {
    if left.is_empty() || left.len() != right.len() {
        return Err(SaslError::new("proof length mismatch"));
    }
    Ok(left.iter().zip(right).map(|(l, r)| l ^ r).collect())
}

/// SCRAM exchange failure.
pub struct SaslError {
    reason: std::borrow::Cow<'static, str>,
}

impl SaslError {
    fn new(reason: &'static str) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::error::Error for SaslError { }

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SASL authentication failed: {}", self.reason)
    }
}

impl fmt::Debug for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
