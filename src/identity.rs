//! # Identity Resolution
//!
//! Maps a client's SSH public key to the name of the container that key
//! owns.
//!
//! ## Modes
//!
//! | Mode       | Accepts                          | Container name                 |
//! |------------|----------------------------------|--------------------------------|
//! | Allow-list | Keys listed in authorized_keys   | The line's comment, verbatim   |
//! | Wildcard   | Any key                          | `wildcard` + SHA-256 fingerprint |
//!
//! ## Authorized-Keys Format
//!
//! One key per line in OpenSSH `authorized_keys` syntax:
//!
//! ```text
//! # comments and blank lines are ignored
//! ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... alice
//! no-pty ssh-rsa AAAAB3NzaC1yc2EAAAADAQAB... bob
//! ```
//!
//! The comment becomes the container name, so it is required and must be a
//! valid container name.
//!
//! ## Security Properties
//!
//! - **Key equality**: credentials compare by canonical key blob, so the
//!   signature algorithm a client negotiates (e.g. `rsa-sha2-512` for an
//!   `ssh-rsa` entry) does not affect matching.
//! - **Uniform rejection**: the allow-list is always scanned in full with a
//!   constant-time comparison; the audit record carries only the remote
//!   address and the presented key's fingerprint.

use crate::constants::{MAX_AUTHORIZED_KEYS, MAX_CONTAINER_NAME_LEN, WILDCARD_PREFIX};
use crate::error::{Error, Result};
use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Credential
// =============================================================================

/// A client public key, compared by key material.
#[derive(Clone)]
pub struct Credential {
    blob: Vec<u8>,
}

impl Credential {
    /// Wraps a parsed public key.
    pub fn new(key: PublicKey) -> Self {
        Self {
            blob: key.public_key_bytes(),
        }
    }

    /// Parses the base64 key field of an OpenSSH public key line.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = russh_keys::parse_public_key_base64(encoded)
            .map_err(|e| Error::InvalidConfig(format!("invalid public key: {e}")))?;
        Ok(Self::new(key))
    }

    /// Lowercase hex SHA-256 of the wire encoding.
    ///
    /// Deterministic across processes and restarts, and safe to embed in a
    /// container name.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.blob))
    }

    /// Key equality in time independent of where the blobs differ.
    pub fn key_eq(&self, other: &Credential) -> bool {
        if self.blob.len() != other.blob.len() {
            return false;
        }
        self.blob
            .iter()
            .zip(other.blob.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.key_eq(other)
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

// =============================================================================
// Container Identity
// =============================================================================

/// Name of the container a session runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerIdentity(String);

impl ContainerIdentity {
    /// Wraps a container name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derives the wildcard-mode identity of a credential.
    pub fn for_wildcard(credential: &Credential) -> Self {
        Self(format!("{}{}", WILDCARD_PREFIX, credential.fingerprint()))
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks a label against Docker's container-name grammar
/// (`[a-zA-Z0-9][a-zA-Z0-9_.-]*`).
pub fn validate_container_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("missing comment (the comment names the container)".to_string());
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(format!(
            "container name exceeds {} characters",
            MAX_CONTAINER_NAME_LEN
        ));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok {
        return Err(format!("'{}' is not a valid container name", name));
    }
    Ok(())
}

// =============================================================================
// Identity Map
// =============================================================================

/// Allow-list of `(container label, credential)` pairs.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: Vec<(ContainerIdentity, Credential)>,
}

impl IdentityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an authorized-keys file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &content)
    }

    /// Parses authorized-keys content. `path` is used in error messages.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let mut map = Self::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = index + 1;
            let invalid = |reason: String| Error::InvalidAuthorizedKey {
                path: PathBuf::from(path),
                line: line_no,
                reason,
            };

            let (credential, label) = parse_authorized_key(line).map_err(invalid)?;
            validate_container_name(&label).map_err(invalid)?;

            if map.len() >= MAX_AUTHORIZED_KEYS {
                return Err(invalid(format!(
                    "more than {} authorized keys",
                    MAX_AUTHORIZED_KEYS
                )));
            }
            map.insert(ContainerIdentity::new(label), credential);
        }
        debug!(path = %path.display(), keys = map.len(), "loaded authorized keys");
        Ok(map)
    }

    /// Adds an entry. A label already present is rebound to the new key.
    pub fn insert(&mut self, label: ContainerIdentity, credential: Credential) {
        if let Some(entry) = self.entries.iter_mut().find(|(l, _)| *l == label) {
            warn!(label = %label, "duplicate authorized key label, last entry wins");
            entry.1 = credential;
        } else {
            self.entries.push((label, credential));
        }
    }

    /// Returns the label bound to `credential`.
    ///
    /// Every entry is compared even after a match. With several labels
    /// bound to one key, the first in file order wins.
    pub fn lookup(&self, credential: &Credential) -> Option<&ContainerIdentity> {
        let mut found = None;
        for (label, candidate) in &self.entries {
            let matched = candidate.key_eq(credential);
            if matched && found.is_none() {
                found = Some(label);
            }
        }
        found
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no keys are authorized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over labels in file order.
    pub fn labels(&self) -> impl Iterator<Item = &ContainerIdentity> {
        self.entries.iter().map(|(label, _)| label)
    }
}

/// Splits one authorized-keys line into credential and comment.
///
/// Leading options (`no-pty`, `command="..."`) are skipped; the key type
/// token is the first one naming a key algorithm.
fn parse_authorized_key(line: &str) -> std::result::Result<(Credential, String), String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let type_index = tokens
        .iter()
        .position(|t| is_key_type(t))
        .ok_or_else(|| "no key type found".to_string())?;
    let encoded = tokens
        .get(type_index + 1)
        .ok_or_else(|| "missing key data".to_string())?;
    let credential = Credential::from_base64(encoded).map_err(|e| e.to_string())?;
    let comment = tokens[type_index + 2..].join(" ");
    Ok((credential, comment))
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

// =============================================================================
// Resolver
// =============================================================================

/// Result of resolving a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Key accepted; the session runs in this container.
    Accepted(ContainerIdentity),
    /// Key refused.
    Rejected,
}

impl Resolution {
    /// True when the key was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// The container identity, if accepted.
    pub fn identity(&self) -> Option<&ContainerIdentity> {
        match self {
            Self::Accepted(identity) => Some(identity),
            Self::Rejected => None,
        }
    }
}

/// Maps credentials to container identities.
#[derive(Debug, Clone)]
pub enum IdentityResolver {
    /// Only keys in the map are accepted.
    AllowList(IdentityMap),
    /// Every key is accepted and gets a fingerprint-derived container.
    Wildcard,
}

impl IdentityResolver {
    /// Resolves `credential`, logging an audit record on rejection.
    pub fn resolve(&self, credential: &Credential, remote: Option<SocketAddr>) -> Resolution {
        match self {
            Self::Wildcard => Resolution::Accepted(ContainerIdentity::for_wildcard(credential)),
            Self::AllowList(map) => match map.lookup(credential) {
                Some(identity) => Resolution::Accepted(identity.clone()),
                None => {
                    warn!(
                        remote = ?remote,
                        fingerprint = %credential.fingerprint(),
                        "public key rejected"
                    );
                    Resolution::Rejected
                }
            },
        }
    }

    /// True in wildcard mode.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }
}
