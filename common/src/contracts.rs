//! On-chain storage contract types.
//!
//! A contract pins a file-merkle-root commitment between client and host,
//! with payout tables for the proved and missed cases. The contract itself
//! is immutable once on chain; all later state (uploads, balance movement)
//! travels through numbered revisions that both parties co-sign.
//!
//! Everything here is RLP-encodable because the precompiled contracts take
//! RLP payloads, and hashes for signing are keccak over the RLP bytes.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::ContractId;

/// A single payout entry: who gets paid and how much, in camel.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct PaymentOutput {
    pub value: U256,
    pub address: Address,
}

/// The 2-of-2 address pair that authorizes contract spends. Both the client
/// and the host payment address must sign a revision for it to be valid.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct UnlockConditions {
    pub payment_addresses: Vec<Address>,
    pub signatures_required: u64,
}

impl UnlockConditions {
    /// The standard client/host pair requiring both signatures.
    pub fn new(client: Address, host: Address) -> Self {
        Self {
            payment_addresses: vec![client, host],
            signatures_required: 2,
        }
    }

    /// Commitment to the conditions, embedded in contracts and revisions.
    pub fn unlock_hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

/// A storage contract as submitted to the contract-create precompile.
///
/// `signatures` holds the client and host contract signatures, in that
/// order; it is empty on the draft that gets hashed for signing.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct StorageContract {
    pub file_size: u64,
    pub file_merkle_root: B256,
    /// First block of the proof window; equals the contract end height
    pub window_start: u64,
    /// Last block the host may submit a storage proof in
    pub window_end: u64,
    pub client_collateral: PaymentOutput,
    pub host_collateral: PaymentOutput,
    pub valid_proof_outputs: Vec<PaymentOutput>,
    pub missed_proof_outputs: Vec<PaymentOutput>,
    pub unlock_hash: B256,
    pub revision_number: u64,
    pub signatures: Vec<Bytes>,
}

impl StorageContract {
    /// Keccak hash of the RLP encoding, used as the signing digest.
    pub fn rlp_hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Contract identity: the hash of the unsigned contract, so both parties
    /// derive the same id regardless of signature order.
    pub fn id(&self) -> ContractId {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        ContractId(unsigned.rlp_hash())
    }

    /// Payout to the client when the host proves storage (output 0 by
    /// convention).
    pub fn client_payout(&self) -> U256 {
        self.valid_proof_outputs
            .first()
            .map(|o| o.value)
            .unwrap_or_default()
    }
}

/// A co-signed mutation of a storage contract. Revision numbers are strictly
/// increasing; the highest revision wins at proof time.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct StorageContractRevision {
    pub parent_id: B256,
    pub unlock_conditions: UnlockConditions,
    pub new_revision_number: u64,
    pub new_file_size: u64,
    pub new_file_merkle_root: B256,
    pub new_window_start: u64,
    pub new_window_end: u64,
    pub new_valid_proof_outputs: Vec<PaymentOutput>,
    pub new_missed_proof_outputs: Vec<PaymentOutput>,
    pub new_unlock_hash: B256,
    pub signatures: Vec<Bytes>,
}

impl StorageContractRevision {
    /// Keccak hash of the RLP encoding, used as the signing digest.
    pub fn rlp_hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// The client's remaining balance under this revision (valid output 0).
    pub fn client_balance(&self) -> U256 {
        self.new_valid_proof_outputs
            .first()
            .map(|o| o.value)
            .unwrap_or_default()
    }

    /// Build revision number 1 from a freshly signed contract, carrying the
    /// contract's payout tables unchanged.
    pub fn initial(contract: &StorageContract, uc: UnlockConditions) -> Self {
        Self {
            parent_id: contract.id().0,
            unlock_conditions: uc,
            new_revision_number: 1,
            new_file_size: contract.file_size,
            new_file_merkle_root: contract.file_merkle_root,
            new_window_start: contract.window_start,
            new_window_end: contract.window_end,
            new_valid_proof_outputs: contract.valid_proof_outputs.clone(),
            new_missed_proof_outputs: contract.missed_proof_outputs.clone(),
            new_unlock_hash: contract.unlock_hash,
            signatures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Decodable;

    fn sample_contract() -> StorageContract {
        let client = Address::repeat_byte(0x11);
        let host = Address::repeat_byte(0x22);
        let uc = UnlockConditions::new(client, host);
        StorageContract {
            file_size: 1 << 22,
            file_merkle_root: B256::repeat_byte(0xab),
            window_start: 1000,
            window_end: 1100,
            client_collateral: PaymentOutput {
                value: U256::from(500u64),
                address: client,
            },
            host_collateral: PaymentOutput {
                value: U256::from(700u64),
                address: host,
            },
            valid_proof_outputs: vec![
                PaymentOutput {
                    value: U256::from(500u64),
                    address: client,
                },
                PaymentOutput {
                    value: U256::from(700u64),
                    address: host,
                },
            ],
            missed_proof_outputs: vec![
                PaymentOutput {
                    value: U256::from(500u64),
                    address: client,
                },
                PaymentOutput {
                    value: U256::from(650u64),
                    address: host,
                },
            ],
            unlock_hash: uc.unlock_hash(),
            revision_number: 0,
            signatures: vec![Bytes::from(vec![1u8; 65]), Bytes::from(vec![2u8; 65])],
        }
    }

    #[test]
    fn signed_contract_rlp_round_trips_bit_identically() {
        let contract = sample_contract();
        let encoded = alloy_rlp::encode(&contract);
        let decoded = StorageContract::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(contract, decoded);
        // Re-encoding must reproduce the exact bytes
        assert_eq!(alloy_rlp::encode(&decoded), encoded);
    }

    #[test]
    fn contract_id_ignores_signatures() {
        let mut contract = sample_contract();
        let id_signed = contract.id();
        let hash_signed = contract.rlp_hash();
        contract.signatures.clear();
        assert_eq!(contract.id(), id_signed);
        // But the signing hash does cover the signatures
        assert_ne!(contract.rlp_hash(), hash_signed);
    }

    #[test]
    fn initial_revision_carries_contract_fields() {
        let contract = sample_contract();
        let uc = UnlockConditions::new(Address::repeat_byte(0x11), Address::repeat_byte(0x22));
        let rev = StorageContractRevision::initial(&contract, uc);
        assert_eq!(rev.new_revision_number, 1);
        assert_eq!(rev.parent_id, contract.id().0);
        assert_eq!(rev.new_file_size, contract.file_size);
        assert_eq!(rev.new_valid_proof_outputs, contract.valid_proof_outputs);
        assert_eq!(rev.client_balance(), U256::from(500u64));
    }

    #[test]
    fn revision_rlp_round_trips() {
        let contract = sample_contract();
        let uc = UnlockConditions::new(Address::repeat_byte(0x11), Address::repeat_byte(0x22));
        let mut rev = StorageContractRevision::initial(&contract, uc);
        rev.signatures = vec![Bytes::from(vec![3u8; 65])];
        let encoded = alloy_rlp::encode(&rev);
        let decoded = StorageContractRevision::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(rev, decoded);
    }
}
