//! Chain primitives shared by the chain client, simulator and executor

use crate::utils;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Token amounts in the chain's smallest unit
pub type Balance = u128;

/// 32-byte hash used for blocks and transactions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct H256(pub [u8; 32]);

/// Block hash
pub type BlockHash = H256;

/// Transaction hash
pub type TxHash = H256;

impl H256 {
    /// All-zero hash
    pub const ZERO: H256 = H256([0u8; 32]);

    /// Keccak-256 of arbitrary bytes
    pub fn keccak(bytes: &[u8]) -> Self {
        H256(utils::keccak256(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", utils::sanitize_for_logging(&self.to_string()))
    }
}

impl FromStr for H256 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim_start_matches("0x");
        let bytes = hex::decode(raw).map_err(|e| format!("invalid hash hex: {}", e))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("hash must be 32 bytes: {}", s))?;
        Ok(H256(array))
    }
}

impl Serialize for H256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Account address on the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A signable chain operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ChainCall {
    /// Balances.transfer_keep_alive
    Transfer {
        dest: AccountId,
        #[serde(with = "utils::balance_str")]
        amount: Balance,
    },
    /// Staking.bond
    Bond {
        #[serde(with = "utils::balance_str")]
        amount: Balance,
    },
    /// Staking.unbond
    Unbond {
        #[serde(with = "utils::balance_str")]
        amount: Balance,
    },
    /// System.remark
    Remark { data: String },
    /// Utility.batch_all, atomic
    Batch { calls: Vec<ChainCall> },
}

impl ChainCall {
    /// `Pallet.call` name of this call
    pub fn label(&self) -> &'static str {
        match self {
            ChainCall::Transfer { .. } => "Balances.transfer_keep_alive",
            ChainCall::Bond { .. } => "Staking.bond",
            ChainCall::Unbond { .. } => "Staking.unbond",
            ChainCall::Remark { .. } => "System.remark",
            ChainCall::Batch { .. } => "Utility.batch_all",
        }
    }

    /// Accounts other than the origin whose balances this call changes
    pub fn counterparties(&self) -> Vec<AccountId> {
        match self {
            ChainCall::Transfer { dest, .. } => vec![dest.clone()],
            ChainCall::Batch { calls } => {
                let mut accounts = Vec::new();
                for call in calls {
                    for account in call.counterparties() {
                        if !accounts.contains(&account) {
                            accounts.push(account);
                        }
                    }
                }
                accounts
            }
            _ => Vec::new(),
        }
    }

    /// Number of leaf calls, counting batch members
    pub fn call_count(&self) -> usize {
        match self {
            ChainCall::Batch { calls } => calls.iter().map(ChainCall::call_count).sum(),
            _ => 1,
        }
    }

    /// Canonical bytes used for hashing and signing
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Account storage entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub nonce: u64,
    /// Transferable balance
    #[serde(with = "utils::balance_str")]
    pub free: Balance,
    /// Balance locked by staking
    #[serde(with = "utils::balance_str")]
    pub bonded: Balance,
}

impl AccountInfo {
    pub fn with_free(free: Balance) -> Self {
        Self {
            free,
            ..Default::default()
        }
    }

    pub fn total(&self) -> Balance {
        self.free.saturating_add(self.bonded)
    }
}

/// Event emitted by the runtime while applying a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub pallet: String,
    pub variant: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ChainEvent {
    pub fn new(pallet: &str, variant: &str, data: serde_json::Value) -> Self {
        Self {
            pallet: pallet.to_string(),
            variant: variant.to_string(),
            data,
        }
    }

    /// `Pallet.Variant`
    pub fn name(&self) -> String {
        format!("{}.{}", self.pallet, self.variant)
    }
}

/// Decoded on-chain dispatch error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchError {
    pub module: String,
    pub error: String,
}

impl DispatchError {
    pub fn new(module: &str, error: &str) -> Self {
        Self {
            module: module.to_string(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.error)
    }
}

/// A call signed by its origin, ready for submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub signer: AccountId,
    pub call: ChainCall,
    pub signature: String,
}

impl SignedPayload {
    /// Transaction hash of the signed payload
    pub fn hash(&self) -> TxHash {
        let mut bytes = self.signer.as_str().as_bytes().to_vec();
        bytes.extend(self.call.encode());
        bytes.extend(self.signature.as_bytes());
        H256::keccak(&bytes)
    }
}

/// Block that included a submitted transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInclusion {
    pub block_hash: BlockHash,
    pub block_number: u64,
    pub events: Vec<ChainEvent>,
    /// Set when the call was included but its dispatch failed
    pub dispatch_error: Option<DispatchError>,
}

/// Progress of a submitted transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    /// Included in a block, not yet final
    InBlock(BlockInclusion),
    /// Included block is final
    Finalized(BlockInclusion),
    /// Removed from the pool without inclusion
    Dropped { reason: String },
    /// Rejected as invalid by the pool
    Invalid { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip_display() {
        let hash = H256::keccak(b"block");
        let parsed: H256 = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!(hash.to_string().starts_with("0x"));
        assert_eq!(hash.to_string().len(), 66);
    }

    #[test]
    fn test_call_serialization_uses_string_amounts() {
        let call = ChainCall::Transfer {
            dest: AccountId::from("bob"),
            amount: 1_000_000_000_000_000_000_000u128,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["call"], "transfer");
        assert_eq!(json["amount"], "1000000000000000000000");

        let back: ChainCall = serde_json::from_value(json).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_call_accepts_numeric_amounts() {
        let call: ChainCall =
            serde_json::from_str(r#"{"call":"bond","amount":50}"#).unwrap();
        assert_eq!(call, ChainCall::Bond { amount: 50 });
    }

    #[test]
    fn test_batch_counterparties_are_unique() {
        let batch = ChainCall::Batch {
            calls: vec![
                ChainCall::Transfer { dest: "bob".into(), amount: 1 },
                ChainCall::Bond { amount: 5 },
                ChainCall::Transfer { dest: "bob".into(), amount: 2 },
                ChainCall::Transfer { dest: "carol".into(), amount: 3 },
            ],
        };
        assert_eq!(
            batch.counterparties(),
            vec![AccountId::from("bob"), AccountId::from("carol")]
        );
        assert_eq!(batch.call_count(), 4);
        assert_eq!(batch.label(), "Utility.batch_all");
    }

    #[test]
    fn test_signed_payload_hash_depends_on_signature() {
        let call = ChainCall::Remark { data: "hi".to_string() };
        let a = SignedPayload {
            signer: "alice".into(),
            call: call.clone(),
            signature: "0x01".to_string(),
        };
        let b = SignedPayload {
            signature: "0x02".to_string(),
            ..a.clone()
        };
        assert_ne!(a.hash(), b.hash());
    }
}
