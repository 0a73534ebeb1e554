//! Negotiation wire protocol: single-byte message codes and RLP frames.
//!
//! Every message exchanged with a host during negotiation is a
//! `{code, RLP payload}` frame. Codes 0x20-0x28 flow host→client, codes
//! 0x30-0x36 mirror them client→host. A host that declines mid-handshake
//! answers with [`NEGOTIATION_ERROR_MSG`] carrying an RLP-encoded string;
//! [`HOST_BUSY_MSG`] asks the client to retry later without debiting the
//! host's score.

use alloy_primitives::Bytes;
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::contracts::{StorageContract, StorageContractRevision};
use crate::ContractId;

// Host → client message codes
pub const HOST_CONFIG_RESP_MSG: u8 = 0x20;
pub const CONTRACT_CREATE_HOST_SIGN_MSG: u8 = 0x21;
pub const CONTRACT_CREATE_REVISION_SIGN_MSG: u8 = 0x22;
pub const CONTRACT_UPLOAD_MERKLE_PROOF_MSG: u8 = 0x23;
pub const CONTRACT_UPLOAD_REVISION_SIGN_MSG: u8 = 0x24;
pub const CONTRACT_DOWNLOAD_DATA_MSG: u8 = 0x25;
pub const NEGOTIATION_ERROR_MSG: u8 = 0x26;
pub const HOST_BUSY_MSG: u8 = 0x27;
pub const HOST_STOP_MSG: u8 = 0x28;

// Client → host message codes
pub const HOST_CONFIG_REQ_MSG: u8 = 0x30;
pub const CONTRACT_CREATE_REQ_MSG: u8 = 0x31;
pub const CONTRACT_CREATE_CLIENT_REVISION_SIGN_MSG: u8 = 0x32;
pub const CONTRACT_UPLOAD_REQ_MSG: u8 = 0x33;
pub const CONTRACT_UPLOAD_CLIENT_REVISION_SIGN_MSG: u8 = 0x34;
pub const CONTRACT_DOWNLOAD_REQ_MSG: u8 = 0x35;
pub const CLIENT_STOP_MSG: u8 = 0x36;

/// One framed message on a host session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Frame an RLP-encodable payload under the given code.
    pub fn encode(code: u8, payload: &impl alloy_rlp::Encodable) -> Self {
        Self {
            code,
            payload: alloy_rlp::encode(payload).into(),
        }
    }

    /// Decode the payload as the expected RLP type.
    pub fn decode<T: Decodable>(&self) -> Result<T, WireError> {
        T::decode(&mut self.payload.as_ref()).map_err(WireError::Rlp)
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame payload: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("unexpected message code {got:#04x}, expected {expected:#04x}")]
    UnexpectedCode { got: u8, expected: u8 },
}

/// Decode the string carried by a negotiation-error frame.
pub fn decode_negotiation_error(payload: &[u8]) -> Result<String, WireError> {
    String::decode(&mut &payload[..]).map_err(WireError::Rlp)
}

/// Round-2 request: the drafted contract plus the client's contract
/// signature. `old_contract_id` is zero for a fresh create and names the
/// predecessor on renew.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ContractCreateRequest {
    pub storage_contract: StorageContract,
    pub sign: Bytes,
    pub renew: bool,
    pub old_contract_id: ContractId,
}

/// Round-3 request: the client's signature over the initial revision.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ContractRevisionSign {
    pub revision: StorageContractRevision,
    pub sign: Bytes,
}
