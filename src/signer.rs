//! Transaction signing.

use alloy_consensus::{SignableTransaction, Signed, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Signature, B256};

use crate::account::PrivateKey;

/// Signs a 32-byte prehash with the given key.
pub fn sign_hash(key: &PrivateKey, hash: B256) -> Result<Signature, k256::ecdsa::Error> {
    let (sig, recovery_id) = key.signing_key().sign_prehash_recoverable(hash.as_slice())?;
    Ok(Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()))
}

/// Signs an EIP-155 legacy transaction.
pub fn sign_legacy(key: &PrivateKey, tx: TxLegacy) -> Result<Signed<TxLegacy>, k256::ecdsa::Error> {
    let signature = sign_hash(key, tx.signature_hash())?;
    Ok(tx.into_signed(signature))
}

/// Encodes a signed legacy transaction for `eth_sendRawTransaction`.
pub fn encode_legacy(signed: Signed<TxLegacy>) -> Vec<u8> {
    TxEnvelope::from(signed).encoded_2718()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_eips::eip2718::Decodable2718;
    use alloy_primitives::{Address, TxKind, U256};

    #[test]
    fn test_signature_recovers_sender() {
        let key = PrivateKey::from_seed(11);
        let hash = B256::with_last_byte(0x42);
        let signature = sign_hash(&key, hash).unwrap();
        assert_eq!(signature.recover_address_from_prehash(&hash).unwrap(), key.address());
    }

    #[test]
    fn test_legacy_roundtrip() {
        let key = PrivateKey::from_seed(12);
        let tx = TxLegacy {
            chain_id: Some(1337),
            nonce: 4,
            gas_price: 1_000_000_000,
            gas_limit: 500_000,
            to: TxKind::Call(Address::with_last_byte(9)),
            value: U256::from(1_000),
            input: Default::default(),
        };
        let raw = encode_legacy(sign_legacy(&key, tx.clone()).unwrap());

        let decoded = TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap();
        let legacy = decoded.as_legacy().unwrap();
        assert_eq!(legacy.tx(), &tx);
        let sender = legacy
            .signature()
            .recover_address_from_prehash(&legacy.tx().signature_hash())
            .unwrap();
        assert_eq!(sender, key.address());
    }
}
