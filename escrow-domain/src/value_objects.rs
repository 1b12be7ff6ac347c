//! Value Objects for the escrow domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Agreement id is empty, too long or contains control characters
    #[error("Invalid agreement id: {0}")]
    InvalidAgreementId(String),

    /// Ledger key is not a 32-byte hex string
    #[error("Invalid agreement key: {0}")]
    InvalidAgreementKey(String),

    /// Ledger address is malformed
    #[error("Invalid ledger address: {0}")]
    InvalidAddress(String),

    /// Escrow amount must be positive
    #[error("Invalid escrow amount: {0}")]
    InvalidAmount(String),

    /// Transaction reference is malformed
    #[error("Invalid transaction reference: {0}")]
    InvalidTxRef(String),

    /// Ledger status code outside of the known enum
    #[error("Invalid ledger status code: {0}")]
    InvalidLedgerStatus(u8),

    /// Unknown role, status or operation name
    #[error("Unknown {kind}: {value}")]
    UnknownName {
        /// What was being parsed
        kind: &'static str,
        /// The rejected input
        value: String,
    },

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Agreement ID
// =============================================================================

/// Application-chosen external identifier of an agreement.
///
/// Opaque to this subsystem. It is the Mirror Store key and the input of the
/// ledger key derivation ([`AgreementKey::from_agreement_id`]).
///
/// # Invariants
/// - Non-empty after trimming
/// - At most 128 characters
/// - No control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgreementId(String);

impl AgreementId {
    /// Maximum accepted length in characters
    pub const MAX_LEN: usize = 128;

    /// Create a new AgreementId with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAgreementId` if the id is empty, too long,
    /// or contains control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(DomainError::InvalidAgreementId("Agreement id must be non-empty".to_string()));
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(DomainError::InvalidAgreementId(format!(
                "Agreement id longer than {} characters",
                Self::MAX_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::InvalidAgreementId(
                "Agreement id contains control characters".to_string(),
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the fixed-width ledger key for this agreement
    pub fn ledger_key(&self) -> AgreementKey {
        AgreementKey::from_agreement_id(self)
    }
}

impl TryFrom<String> for AgreementId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgreementId> for String {
    fn from(id: AgreementId) -> Self {
        id.0
    }
}

impl fmt::Display for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Agreement Key
// =============================================================================

/// Fixed-width ledger key of an agreement (SHA-256 of the external id).
///
/// The derivation is pure and deterministic: the same [`AgreementId`] always
/// maps to the same key, so the ledger can reject collisions on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgreementKey([u8; 32]);

impl AgreementKey {
    /// Hash an agreement id into its ledger key
    pub fn from_agreement_id(id: &AgreementId) -> Self {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Build a key from raw bytes (as read back from the ledger)
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a `0x`-prefixed (or bare) 64 character hex string
    pub fn from_hex(value: &str) -> Result<Self, DomainError> {
        let stripped = value.strip_prefix("0x").unwrap_or(value);
        let decoded = hex::decode(stripped)
            .map_err(|e| DomainError::InvalidAgreementKey(format!("{}: {}", value, e)))?;

        let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
            DomainError::InvalidAgreementKey(format!("{}: expected 32 bytes", value))
        })?;

        Ok(Self(bytes))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex encoding
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for AgreementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for AgreementKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AgreementKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Ledger Address
// =============================================================================

/// Ledger account identifier of a party.
///
/// # Invariants
/// - `0x` prefix followed by exactly 40 hex characters
/// - Stored lowercase so comparisons are case-insensitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LedgerAddress(String);

impl LedgerAddress {
    /// Create a new LedgerAddress with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAddress` if the format is wrong
    pub fn new(value: &str) -> Result<Self, DomainError> {
        let body = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .ok_or_else(|| DomainError::InvalidAddress(format!("{}: missing 0x prefix", value)))?;

        if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidAddress(format!(
                "{}: expected 40 hex characters",
                value
            )));
        }

        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LedgerAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<LedgerAddress> for String {
    fn from(address: LedgerAddress) -> Self {
        address.0
    }
}

impl fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Escrow Amount
// =============================================================================

/// Fixed-point amount held in escrow
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct EscrowAmount(Decimal);

impl EscrowAmount {
    /// Create a new EscrowAmount with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAmount` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount("Escrow amount must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for EscrowAmount {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EscrowAmount> for Decimal {
    fn from(amount: EscrowAmount) -> Self {
        amount.0
    }
}

impl fmt::Display for EscrowAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Role
// =============================================================================

/// Party role within an agreement. Always supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Receives the work and authorizes fund release
    Needer,
    /// Performs the work and withdraws escrow on completion
    Provider,
}

impl Role {
    /// Lowercase role name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Needer => "needer",
            Role::Provider => "provider",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "needer" => Ok(Role::Needer),
            "provider" => Ok(Role::Provider),
            other => Err(DomainError::UnknownName {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_agreement_id_trims_and_validates() {
        let id = AgreementId::new("  A1  ").unwrap();
        assert_eq!(id.as_str(), "A1");

        assert!(AgreementId::new("").is_err());
        assert!(AgreementId::new("   ").is_err());
        assert!(AgreementId::new("a\nb").is_err());
        assert!(AgreementId::new("x".repeat(129)).is_err());
        assert!(AgreementId::new("x".repeat(128)).is_ok());
    }

    #[test]
    fn test_agreement_key_is_deterministic() {
        let a = AgreementId::new("proposal-42").unwrap();
        let b = AgreementId::new("proposal-42").unwrap();
        let c = AgreementId::new("proposal-43").unwrap();

        assert_eq!(a.ledger_key(), b.ledger_key());
        assert_ne!(a.ledger_key(), c.ledger_key());
    }

    #[test]
    fn test_agreement_key_hex_roundtrip() {
        let key = AgreementId::new("A1").unwrap().ledger_key();
        let hex = key.to_hex();

        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(AgreementKey::from_hex(&hex).unwrap(), key);
        assert_eq!(AgreementKey::from_hex(&hex[2..]).unwrap(), key);
    }

    #[test]
    fn test_agreement_key_rejects_wrong_width() {
        assert!(AgreementKey::from_hex("0x1234").is_err());
        assert!(AgreementKey::from_hex("0xzz").is_err());
    }

    #[test]
    fn test_agreement_key_serializes_as_hex_string() {
        let key = AgreementId::new("A1").unwrap().ledger_key();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));

        let parsed: AgreementKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_ledger_address_normalizes_case() {
        let upper = LedgerAddress::new("0xABCDEF0123456789ABCDEF0123456789ABCDEF01").unwrap();
        let lower = LedgerAddress::new("0xabcdef0123456789abcdef0123456789abcdef01").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_ledger_address_rejects_malformed() {
        assert!(LedgerAddress::new("abcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(LedgerAddress::new("0x1234").is_err());
        assert!(LedgerAddress::new("0xgggggg0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn test_escrow_amount_must_be_positive() {
        assert!(EscrowAmount::new(dec!(500)).is_ok());
        assert!(EscrowAmount::new(dec!(0)).is_err());
        assert!(EscrowAmount::new(dec!(-1)).is_err());
    }

    #[test]
    fn test_escrow_amount_deserialize_validates() {
        assert!(serde_json::from_str::<EscrowAmount>("\"500.25\"").is_ok());
        assert!(serde_json::from_str::<EscrowAmount>("\"0\"").is_err());
    }

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("needer".parse::<Role>().unwrap(), Role::Needer);
        assert_eq!("PROVIDER".parse::<Role>().unwrap(), Role::Provider);
        assert!("arbiter".parse::<Role>().is_err());
        assert_eq!(Role::Provider.to_string(), "provider");
    }
}
