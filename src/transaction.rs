//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{new_transfer, ReferencedTxs, UtxoProvider};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address;
    use crate::blockchain::FundSelection;
    use crate::crypto::KeyPair;
    use crate::error::ChainError;
    use crate::wallet::{KeyStore, Wallets};

    /// Provider over a fixed list of transactions that treats every output as unspent.
    struct StaticLedger {
        txs: Vec<Transaction>,
    }

    impl UtxoProvider for StaticLedger {
        fn find_needed_unspent_outputs(
            &self,
            pub_key_hash: &[u8],
            amount: f64,
        ) -> Result<FundSelection, ChainError> {
            let mut selection = FundSelection::default();
            for tx in &self.txs {
                for (index, output) in tx.outputs.iter().enumerate() {
                    if selection.total >= amount {
                        return Ok(selection);
                    }
                    if output.is_locked_with(pub_key_hash) {
                        selection.add(&tx.id, index as i64, output.value);
                    }
                }
            }
            Ok(selection)
        }

        fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, ChainError> {
            Ok(self.txs.iter().find(|tx| tx.id.as_slice() == id).cloned())
        }
    }

    fn funded_sender() -> (Wallets, String, StaticLedger) {
        let wallets = Wallets::in_memory();
        let sender = wallets.create_wallet().unwrap();
        let ledger = StaticLedger {
            txs: vec![
                Transaction::new_coinbase(&sender, "first").unwrap(),
                Transaction::new_coinbase(&sender, "second").unwrap(),
            ],
        };
        (wallets, sender, ledger)
    }

    fn other_address() -> String {
        address::encode(&KeyPair::generate().pub_key_hash())
    }

    #[test]
    fn test_coinbase_shape() {
        let addr = other_address();
        let tx = Transaction::new_coinbase(&addr, "hello").unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs[0].ref_index, COINBASE_INDEX);
        assert!(tx.inputs[0].ref_tx_id.is_empty());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, REWARD);
        assert_eq!(
            tx.outputs[0].pub_key_hash,
            address::pub_key_hash(&addr).unwrap().to_vec()
        );
        assert_eq!(tx.coinbase_memo().as_deref(), Some("hello"));
        assert_eq!(tx.id, tx.compute_id());
        assert!(tx.validate_structure().is_ok());
    }

    #[test]
    fn test_empty_memo_gets_unique_id() {
        let addr = other_address();
        let a = Transaction::new_coinbase(&addr, "").unwrap();
        let b = Transaction::new_coinbase(&addr, "").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_coinbase_to_invalid_address_fails() {
        let result = Transaction::new_coinbase("not-an-address", "memo");
        assert!(matches!(result, Err(ChainError::InvalidAddress(_))));
    }

    #[test]
    fn test_transfer_with_change() {
        let (wallets, sender, ledger) = funded_sender();
        let recipient = other_address();

        let tx = new_transfer(&sender, &recipient, 5.0, &wallets, &ledger).unwrap();
        assert!(!tx.is_coinbase());
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 5.0);
        assert_eq!(tx.outputs[1].value, REWARD - 5.0);
        assert_eq!(
            tx.outputs[1].pub_key_hash,
            address::pub_key_hash(&sender).unwrap().to_vec()
        );

        let referenced = ledger.referenced_transactions(&tx).unwrap();
        assert!(tx.verify(&referenced));
        assert!(tx.validate_structure().is_ok());
    }

    #[test]
    fn test_transfer_exact_amount_has_no_change() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 2.0 * REWARD, &wallets, &ledger).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 1);

        let referenced = ledger.referenced_transactions(&tx).unwrap();
        assert!(tx.verify(&referenced));
    }

    #[test]
    fn test_insufficient_funds() {
        let (wallets, sender, ledger) = funded_sender();
        let err = new_transfer(&sender, &other_address(), 100.0, &wallets, &ledger).unwrap_err();
        match err {
            ChainError::InsufficientFunds { needed, available } => {
                assert_eq!(needed, 100.0);
                assert_eq!(available, 2.0 * REWARD);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_invalid_amounts_rejected() {
        let (wallets, sender, ledger) = funded_sender();
        for amount in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = new_transfer(&sender, &other_address(), amount, &wallets, &ledger);
            assert!(matches!(result, Err(ChainError::InvalidTransaction(_))));
        }
    }

    #[test]
    fn test_unknown_sender_key() {
        let (wallets, _, ledger) = funded_sender();
        let result = new_transfer(&other_address(), &other_address(), 1.0, &wallets, &ledger);
        assert!(matches!(result, Err(ChainError::WalletError(_))));
    }

    #[test]
    fn test_signing_keeps_id() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        assert!(!tx.inputs[0].signature.is_empty());
        assert_eq!(tx.id, tx.compute_id());
    }

    #[test]
    fn test_payload_differs_per_input() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 20.0, &wallets, &ledger).unwrap();
        let lock = &tx.outputs[1].pub_key_hash;
        let first = signing_payload(&tx, 0, lock).unwrap();
        let second = signing_payload(&tx, 1, lock).unwrap();
        assert_ne!(first, second);
        assert!(signing_payload(&tx, 2, lock).is_err());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let (wallets, sender, ledger) = funded_sender();
        let mut tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        let referenced = ledger.referenced_transactions(&tx).unwrap();

        tx.inputs[0].signature[10] ^= 0x01;
        assert!(!tx.verify(&referenced));
    }

    #[test]
    fn test_tampered_pub_key_fails() {
        let (wallets, sender, ledger) = funded_sender();
        let mut tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        let referenced = ledger.referenced_transactions(&tx).unwrap();

        tx.inputs[0].pub_key[5] ^= 0x01;
        assert!(!tx.verify(&referenced));
    }

    #[test]
    fn test_tampered_id_fails() {
        let (wallets, sender, ledger) = funded_sender();
        let mut tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        let referenced = ledger.referenced_transactions(&tx).unwrap();

        tx.id[0] ^= 0x01;
        assert!(!tx.verify(&referenced));
    }

    #[test]
    fn test_foreign_key_cannot_spend() {
        // A thief signs correctly with their own key; the lock check rejects it.
        let (_, _, ledger) = funded_sender();
        let thief = KeyPair::generate();
        let prev = &ledger.txs[0];

        let mut tx = Transaction {
            id: [0u8; 32],
            inputs: vec![TXInput {
                ref_tx_id: prev.id.to_vec(),
                ref_index: 0,
                signature: Vec::new(),
                pub_key: thief.public_key_bytes().to_vec(),
            }],
            outputs: vec![TXOutput::new(REWARD, &other_address()).unwrap()],
        };
        tx.id = tx.compute_id();
        let referenced = ledger.referenced_transactions(&tx).unwrap();
        tx.sign(&thief, &referenced).unwrap();

        let err = tx.check_signatures(&referenced).unwrap_err();
        assert!(matches!(err, ChainError::InvalidSignature(_)));
        assert!(err.to_string().contains("does not match the lock"));
    }

    #[test]
    fn test_unknown_reference_reported() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();

        let empty = StaticLedger { txs: Vec::new() };
        let referenced = empty.referenced_transactions(&tx).unwrap();
        assert!(referenced.is_empty());
        assert!(matches!(
            tx.check_signatures(&referenced),
            Err(ChainError::UnknownReference(_))
        ));
    }

    #[test]
    fn test_coinbase_always_verifies() {
        let tx = Transaction::new_coinbase(&other_address(), "memo").unwrap();
        assert!(tx.verify(&ReferencedTxs::new()));
    }

    #[test]
    fn test_structure_rejects_bad_values_and_ids() {
        let mut tx = Transaction::new_coinbase(&other_address(), "memo").unwrap();
        tx.outputs[0].value = -1.0;
        assert!(tx.validate_structure().is_err());

        let mut tx = Transaction::new_coinbase(&other_address(), "memo").unwrap();
        tx.outputs[0].value = 100.0;
        let err = tx.validate_structure().unwrap_err();
        assert!(err.to_string().contains("Id mismatch"));
    }

    #[test]
    fn test_display_lists_inputs_and_outputs() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        let text = tx.to_string();
        assert!(text.starts_with(&format!("--- Transaction {}", tx.id_str())));
        assert!(text.contains("Input 0:"));
        assert!(text.contains("Output 1:"));
        assert!(text.contains("5.000000"));
    }

    #[test]
    fn test_bincode_roundtrip() {
        let (wallets, sender, ledger) = funded_sender();
        let tx = new_transfer(&sender, &other_address(), 5.0, &wallets, &ledger).unwrap();
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert!(wallets.lookup(&sender).is_some());
    }
}
