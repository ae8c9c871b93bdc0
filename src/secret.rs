//! In-memory sealing of submitter credentials.
//!
//! Usernames and passwords read from a request, or decrypted from a
//! destination's stored credentials, are held encrypted under a key that is
//! generated at startup and never leaves the process. Plaintext only exists
//! while a message is being written to the wire.

use crate::destination::{AesGcmCredentialCodec, CredentialCodec, CredentialError};
use std::fmt;
use std::sync::LazyLock;

static SESSION_CODEC: LazyLock<AesGcmCredentialCodec> =
    LazyLock::new(AesGcmCredentialCodec::ephemeral);

/// A credential value encrypted under the per-process key.
#[derive(Clone)]
pub struct SealedSecret {
    sealed: String,
    blank: bool,
}

impl SealedSecret {
    /// Encrypt `plaintext`, wiping the buffer it arrived in.
    pub fn seal(plaintext: String) -> Result<Self, CredentialError> {
        let blank = plaintext.trim().is_empty();
        let sealed = SESSION_CODEC.encrypt(&plaintext);
        wipe(plaintext);
        Ok(Self {
            sealed: sealed?,
            blank,
        })
    }

    /// Decrypt the value. Callers drop the result as soon as it is written.
    pub fn reveal(&self) -> Result<String, CredentialError> {
        SESSION_CODEC.decrypt(&self.sealed)
    }

    /// Whether the sealed value is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.blank
    }
}

fn wipe(plaintext: String) {
    let mut bytes = plaintext.into_bytes();
    bytes.fill(0);
    std::hint::black_box(&bytes);
}

impl PartialEq for SealedSecret {
    fn eq(&self, other: &Self) -> bool {
        match (self.reveal(), other.reveal()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SealedSecret {}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedSecret(<redacted>)")
    }
}
