use serde::{Deserialize, Serialize};
use std::fmt;

/// Monetary value in minor units (satoshi, wei-scaled, zatoshi, lamport).
/// u128 covers the largest account-chain amounts without saturation.
pub type Amount = u128;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Basis points (1/100 of a percent). Output shares and fees sum in these.
pub type Bps = u16;

// ── SessionId ────────────────────────────────────────────────────────────────

/// Opaque 128-bit session identifier, drawn from the CSPRNG at creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}…)", &self.to_hex()[..8])
    }
}

// ── PoolEntryId ──────────────────────────────────────────────────────────────

/// Identifier for one unit of pooled inventory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolEntryId(pub [u8; 16]);

impl PoolEntryId {
    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PoolEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PoolEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolEntryId({}…)", &self.to_hex()[..8])
    }
}

// ── BroadcastId ──────────────────────────────────────────────────────────────

/// Identifier for one chain-write attempt (ours, not the chain's txid).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastId(pub [u8; 16]);

impl BroadcastId {
    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BroadcastId({}…)", &self.to_hex()[..8])
    }
}

// ── HopNonce ─────────────────────────────────────────────────────────────────

/// Opaque per-hop nonce. The chain facade keys duplicate-broadcast
/// suppression on this value, so replaying a hop submission with the same
/// nonce produces at most one on-chain effect.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopNonce(pub [u8; 16]);

impl HopNonce {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for HopNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HopNonce({}…)", &self.to_hex()[..8])
    }
}

// ── ChainTxId ────────────────────────────────────────────────────────────────

/// Chain-native transaction reference in the chain's own encoding
/// (hex for UTXO and account chains, base-58 for the high-throughput chain).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainTxId(pub String);

impl ChainTxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChainTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = self.0.chars().take(16).collect::<String>();
        write!(f, "ChainTxId({head}…)")
    }
}

// ── Address ──────────────────────────────────────────────────────────────────

/// A chain address in its native string encoding. Validated by the chain
/// facade for the session's currency before it is ever accepted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

// ── Currency ─────────────────────────────────────────────────────────────────

/// Ledger model family. Determines which adapter variant serves a currency
/// and how confirmations are counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainFamily {
    /// Script-based outputs, raw-transaction broadcast, block confirmations.
    Utxo,
    /// Balance accounts, nonce-ordered signed transactions, gas.
    Account,
    /// Account model plus an opaque shielded operation path.
    AccountShielded,
    /// Slot/epoch confirmation model; one confirmation is final.
    HighThroughput,
}

/// The closed set of supported currencies. Config enables a subset.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Btc,
    Ltc,
    Eth,
    Zec,
    Sol,
}

impl Currency {
    pub const ALL: [Currency; 5] = [
        Currency::Btc,
        Currency::Ltc,
        Currency::Eth,
        Currency::Zec,
        Currency::Sol,
    ];

    pub fn family(&self) -> ChainFamily {
        match self {
            Currency::Btc | Currency::Ltc => ChainFamily::Utxo,
            Currency::Eth => ChainFamily::Account,
            Currency::Zec => ChainFamily::AccountShielded,
            Currency::Sol => ChainFamily::HighThroughput,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Btc => "btc",
            Currency::Ltc => "ltc",
            Currency::Eth => "eth",
            Currency::Zec => "zec",
            Currency::Sol => "sol",
        }
    }

    pub fn from_code(s: &str) -> Option<Currency> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Some(Currency::Btc),
            "ltc" => Some(Currency::Ltc),
            "eth" => Some(Currency::Eth),
            "zec" => Some(Currency::Zec),
            "sol" => Some(Currency::Sol),
            _ => None,
        }
    }

    /// Default confirmation threshold before a deposit counts as settled.
    /// Overridable per currency in config.
    pub fn default_confirmations(&self) -> u32 {
        match self {
            Currency::Btc => 3,
            Currency::Ltc => 6,
            Currency::Eth => 12,
            Currency::Zec => 10,
            // Slot-based finality: a single confirmation is sufficient.
            Currency::Sol => 1,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ── StreamId ─────────────────────────────────────────────────────────────────

/// Audit streams: one per session, one global stream for operator actions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum StreamId {
    Session(SessionId),
    Global,
}

impl StreamId {
    /// Stable key prefix for range scans over the audit tree.
    pub fn key_prefix(&self) -> Vec<u8> {
        match self {
            StreamId::Session(id) => {
                let mut k = Vec::with_capacity(17);
                k.push(b's');
                k.extend_from_slice(id.as_bytes());
                k
            }
            StreamId::Global => vec![b'g'],
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Session(id) => write!(f, "session/{id}"),
            StreamId::Global => write!(f, "global"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_hex_round_trip() {
        let id = SessionId::from_bytes([0xAB; 16]);
        let parsed = SessionId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_id_rejects_wrong_length() {
        assert!(SessionId::from_hex("abcd").is_err());
    }

    #[test]
    fn currency_codes_round_trip() {
        for c in Currency::ALL {
            assert_eq!(Currency::from_code(c.code()), Some(c));
        }
        assert_eq!(Currency::from_code("doge"), None);
    }

    #[test]
    fn stream_prefixes_do_not_collide() {
        let a = StreamId::Session(SessionId::from_bytes([1; 16])).key_prefix();
        let b = StreamId::Session(SessionId::from_bytes([2; 16])).key_prefix();
        let g = StreamId::Global.key_prefix();
        assert_ne!(a, b);
        assert!(!a.starts_with(&g));
    }
}
