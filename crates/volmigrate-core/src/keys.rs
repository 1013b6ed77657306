//! Ephemeral SSH key pairs for network-mediated transfers
//!
//! A fresh pair is generated for every strategy attempt that needs a network
//! hop. The public half becomes `authorized_keys` of the sshd pod on the
//! source side, the private half is the rsync job's ssh identity.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Supported key algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// Ed25519 (default)
    #[default]
    Ed25519,
    /// RSA, 4096 bits
    Rsa,
}

impl KeyAlgorithm {
    /// Name used on the command line and in ssh identity file names
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Rsa => "rsa",
        }
    }

    /// Path ssh reads this algorithm's default identity from
    pub fn ssh_identity_file(&self) -> String {
        format!("/root/.ssh/id_{}", self.as_str())
    }

    fn ssh_algorithm(&self) -> Algorithm {
        match self {
            KeyAlgorithm::Ed25519 => Algorithm::Ed25519,
            KeyAlgorithm::Rsa => Algorithm::Rsa { hash: None },
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "rsa" => Ok(KeyAlgorithm::Rsa),
            other => Err(Error::configuration(format!(
                "unsupported ssh key algorithm '{}' (supported: ed25519, rsa)",
                other
            ))),
        }
    }
}

/// A generated key pair in OpenSSH encoding
pub struct KeyPair {
    /// `authorized_keys` line
    pub public_key: String,
    /// OpenSSH private key PEM, zeroized on drop
    pub private_key: Zeroizing<String>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Generate a key pair with the OS entropy source
pub fn generate(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    let key = PrivateKey::random(&mut OsRng, algorithm.ssh_algorithm())
        .map_err(|e| Error::key_generation(algorithm.as_str(), e.to_string()))?;

    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::key_generation(algorithm.as_str(), e.to_string()))?;
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| Error::key_generation(algorithm.as_str(), e.to_string()))?;

    Ok(KeyPair {
        public_key,
        private_key,
    })
}
