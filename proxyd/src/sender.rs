//! Recovering the sender address from a raw transaction, for the
//! per-sender rate limiter and the interop pre-validation pipeline.
//!
//! Uses `ethers`' typed-transaction RLP decoder, which already knows how to
//! tell legacy, EIP-2930 (access-list), and EIP-1559 (dynamic-fee)
//! envelopes apart by their leading byte, so recovery is type-agnostic from
//! our side.

use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::core::types::{Address, Bytes};
use ethers::utils::rlp::Rlp;

use crate::errors::{ProxydError, ProxydResult};

/// Recover the signer of a raw transaction. Works for legacy, access-list,
/// and dynamic-fee transactions alike.
pub fn recover_sender(raw: &Bytes) -> ProxydResult<Address> {
    let rlp = Rlp::new(raw.as_ref());
    let (tx, signature) = TypedTransaction::decode_signed(&rlp)
        .map_err(|err| ProxydError::InvalidRequest(format!("malformed raw transaction: {err}").into()))?;

    signature
        .recover(tx.sighash())
        .map_err(|err| ProxydError::InvalidRequest(format!("could not recover sender: {err}").into()))
}

/// The access list embedded in an EIP-2930/1559 transaction, if any,
/// represented as the ordered `(address, storage keys)` sequence the
/// interop pipeline dedups.
pub fn access_list_entries(raw: &Bytes) -> ProxydResult<Vec<(Address, Vec<ethers::core::types::H256>)>> {
    let rlp = Rlp::new(raw.as_ref());
    let (tx, _signature) = TypedTransaction::decode_signed(&rlp)
        .map_err(|err| ProxydError::InvalidRequest(format!("malformed raw transaction: {err}").into()))?;

    let entries = match tx {
        TypedTransaction::Eip2930(inner) => inner.access_list.0,
        TypedTransaction::Eip1559(inner) => inner.access_list.0,
        TypedTransaction::Legacy(_) => Vec::new(),
    };

    Ok(entries
        .into_iter()
        .map(|item| (item.address, item.storage_keys))
        .collect())
}

#[cfg(test)]
mod tests {
    // Recovery correctness against real signed fixtures belongs in an
    // integration test alongside a golden raw-tx corpus; unit-testing it
    // here would just re-encode what `ethers` already covers in its own
    // test suite. We only assert the error path.
    use super::*;

    #[test]
    fn garbage_bytes_are_rejected_as_invalid_request() {
        let raw: Bytes = vec![0xff, 0x00, 0x01].into();
        let err = recover_sender(&raw).unwrap_err();
        assert!(matches!(err, ProxydError::InvalidRequest(_)));
    }
}
