//! Account keys and address resolution.

use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use alloy_primitives::{hex, keccak256, Address, B256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};

use crate::error::{BackendError, Result};

/// The supplied bytes are not a valid secp256k1 scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid private key")]
pub struct InvalidPrivateKey;

/// A secp256k1 private key.
///
/// Equality and hashing are defined over the raw secret so keys can index the
/// offline backend's registry.
#[derive(Clone)]
pub struct PrivateKey {
    secret: B256,
    signing_key: SigningKey,
}

impl PrivateKey {
    /// Creates a key from its 32 raw bytes.
    pub fn from_bytes(secret: B256) -> Result<Self, InvalidPrivateKey> {
        let signing_key =
            SigningKey::from_slice(secret.as_slice()).map_err(|_| InvalidPrivateKey)?;
        Ok(Self { secret, signing_key })
    }

    /// Generates a fresh key from a cryptographically secure RNG.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::random(rng);
        let secret = B256::from_slice(&signing_key.to_bytes());
        Self { secret, signing_key }
    }

    /// Generates a deterministic key from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self::random(&mut StdRng::seed_from_u64(seed))
    }

    /// The secp256k1 signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The raw secret.
    pub fn secret(&self) -> B256 {
        self.secret
    }

    /// `0x`-prefixed hex encoding of the secret.
    pub fn to_hex(&self) -> String {
        hex::encode_prefixed(self.secret)
    }

    /// Derives the Ethereum address controlled by this key.
    pub fn address(&self) -> Address {
        public_key_to_address(self.signing_key.verifying_key())
    }
}

impl FromStr for PrivateKey {
    type Err = InvalidPrivateKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secret = B256::from_str(s.trim()).map_err(|_| InvalidPrivateKey)?;
        Self::from_bytes(secret)
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.secret == other.secret
    }
}

impl Eq for PrivateKey {}

impl Hash for PrivateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.secret.hash(state);
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("address", &self.address()).finish_non_exhaustive()
    }
}

/// An account: a private key and the address it controls.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// The signing key.
    pub private_key: PrivateKey,
    /// The Ethereum address associated with the key.
    pub address: Address,
}

impl Account {
    /// Pairs a key with an externally supplied address (e.g. from an address list).
    pub fn new(private_key: PrivateKey, address: Address) -> Self {
        Self { private_key, address }
    }

    /// Creates an account whose address is derived from the key.
    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let address = private_key.address();
        Self { private_key, address }
    }

    /// Generates a fresh random account.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_private_key(PrivateKey::random(rng))
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self::from_private_key(PrivateKey::from_seed(seed))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account").field("address", &self.address).finish()
    }
}

/// Derives an Ethereum address from a secp256k1 public key.
pub fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Something that names an account: either its key or a registered symbol.
#[derive(Debug, Clone, Copy)]
pub enum AccountRef<'a> {
    /// A private key.
    Key(&'a PrivateKey),
    /// A symbolic name registered earlier.
    Name(&'a str),
}

/// Maps keys and symbolic names to addresses.
///
/// Live backends derive the address of any key. The offline backend only
/// knows the keys it was seeded with, since its accounts must also appear in
/// the batch genesis.
#[derive(Debug, Clone, Default)]
pub struct AccountResolver {
    derive_keys: bool,
    keys: HashMap<PrivateKey, Address>,
    names: HashMap<String, Address>,
}

impl AccountResolver {
    /// A resolver that derives addresses for unregistered keys.
    pub fn deriving() -> Self {
        Self { derive_keys: true, ..Default::default() }
    }

    /// A resolver that only answers for registered keys.
    pub fn registry_only() -> Self {
        Self::default()
    }

    /// Registers the address for a key.
    pub fn register_key(&mut self, key: PrivateKey, address: Address) {
        self.keys.insert(key, address);
    }

    /// Registers a symbolic name.
    pub fn register_name(&mut self, name: impl Into<String>, address: Address) {
        self.names.insert(name.into(), address);
    }

    /// Returns true if the key is registered.
    pub fn knows_key(&self, key: &PrivateKey) -> bool {
        self.keys.contains_key(key)
    }

    /// Resolves a key or name to an address.
    pub fn resolve(&self, account: AccountRef<'_>) -> Result<Address> {
        match account {
            AccountRef::Key(key) => match self.keys.get(key) {
                Some(address) => Ok(*address),
                None if self.derive_keys => Ok(key.address()),
                None => Err(BackendError::UnknownReference(format!(
                    "unregistered private key for {}",
                    key.address()
                ))),
            },
            AccountRef::Name(name) => self
                .names
                .get(name)
                .copied()
                .ok_or_else(|| BackendError::UnknownReference(format!("account `{name}`"))),
        }
    }
}
