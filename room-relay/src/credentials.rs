//! Registered identities and secret verification.

use std::collections::HashMap;

const SALT_LEN: usize = 16;

/// An immutable registered identity.
#[derive(Debug, Clone)]
pub struct Identity {
    username: String,
    salt: [u8; SALT_LEN],
    secret_hash: String,
}

impl Identity {
    fn new(username: &str, secret: &str) -> Self {
        let salt = rand::random::<[u8; SALT_LEN]>();
        Self {
            username: username.to_string(),
            salt,
            secret_hash: hash_secret(&salt, secret),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn verify(&self, secret: &str) -> bool {
        self.secret_hash == hash_secret(&self.salt, secret)
    }
}

fn hash_secret(salt: &[u8], secret: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Username-keyed store of identities. No password policy is enforced.
#[derive(Debug, Default)]
pub struct CredentialStore {
    identities: HashMap<String, Identity>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new identity. Returns `false` if the username is taken.
    pub fn register(&mut self, username: &str, secret: &str) -> bool {
        if self.identities.contains_key(username) {
            return false;
        }
        self.identities
            .insert(username.to_string(), Identity::new(username, secret));
        true
    }

    /// Returns `true` only for a known username whose secret matches.
    pub fn authenticate(&self, username: &str, secret: &str) -> bool {
        self.identities
            .get(username)
            .is_some_and(|identity| identity.verify(secret))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.identities.contains_key(username)
    }
}
