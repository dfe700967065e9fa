//! Authentication credentials and response computation.
//!
//! The startup driver in [`connection`][crate::connection] owns the message
//! loop; this module owns the credential variants and the pure response
//! math for each authentication type the backend may request.
use std::fmt;

use md5::{Digest, Md5};

pub mod saslprep;
pub mod scram;

/// Credential presented during the startup phase.
#[derive(Clone)]
pub enum Credential {
    /// No authentication; the server must accept the session as-is.
    Trust,
    /// `password_encryption` off; sent in the clear (use TLS).
    CleartextPassword { password: String },
    /// The historical md5 scheme.
    Md5Password { password: String },
    /// SCRAM-SHA-256 via SASL.
    ScramSha256 { password: String },
}

// passwords stay out of debug output and logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trust => f.write_str("Trust"),
            Self::CleartextPassword { .. } => f.write_str("CleartextPassword(…)"),
            Self::Md5Password { .. } => f.write_str("Md5Password(…)"),
            Self::ScramSha256 { .. } => f.write_str("ScramSha256(…)"),
        }
    }
}

/// The md5 password response:
/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`.
pub(crate) fn md5_response(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = hex::encode(Md5::new().chain_update(password).chain_update(user).finalize());
    let outer = hex::encode(Md5::new().chain_update(inner.as_bytes()).chain_update(salt).finalize());
    format!("md5{outer}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_inner_digest_known_vector() {
        // the value postgres stores for role "postgres", password "postgres"
        assert_eq!(
            hex::encode(Md5::digest(b"postgrespostgres")),
            "3175bce1d3201d16594cebf9d7eb3f9d"
        );
    }

    #[test]
    fn md5_response_shape() {
        let a = md5_response("postgres", "postgres", [1, 2, 3, 4]);
        let b = md5_response("postgres", "postgres", [4, 3, 2, 1]);
        assert!(a.starts_with("md5"));
        assert_eq!(a.len(), 3 + 32);
        assert!(a[3..].bytes().all(|b| b.is_ascii_hexdigit()));
        // the salt participates in the outer digest
        assert_ne!(a, b);
    }

    #[test]
    fn credential_debug_redacts() {
        let c = Credential::Md5Password { password: "hunter2".into() };
        assert!(!format!("{c:?}").contains("hunter2"));
    }
}
