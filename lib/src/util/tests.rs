#[cfg(test)]
mod tests {
    use crate::crypto::PrivateKey;
    use crate::sha256::Hash;
    use crate::test_helpers::create_test_output;
    use crate::types::Transaction;
    use crate::util::{serialized_size, MerkleRoot};

    #[test]
    fn test_merkle_root_single_transaction() {
        let private_key = PrivateKey::new_key();
        let output = create_test_output(100, &private_key);
        let transaction = Transaction::new(vec![], vec![output], 0);
        let transactions = vec![transaction];

        let merkle_root = MerkleRoot::calculate(&transactions);

        // Single transaction: root should be that transaction's id
        assert_eq!(merkle_root.as_hash(), transactions[0].hash());
    }

    #[test]
    fn test_merkle_root_two_transactions() {
        let private_key = PrivateKey::new_key();

        let tx1 = Transaction::new(vec![], vec![create_test_output(100, &private_key)], 0);
        let tx2 = Transaction::new(vec![], vec![create_test_output(200, &private_key)], 0);
        let transactions = vec![tx1, tx2];

        let merkle_root = MerkleRoot::calculate(&transactions);

        // Two transactions: root should be hash of [H(tx1), H(tx2)]
        let hash1 = transactions[0].hash();
        let hash2 = transactions[1].hash();
        let expected = Hash::hash(&[hash1, hash2]);

        assert_eq!(merkle_root.as_hash(), expected);
    }

    #[test]
    fn test_merkle_root_three_transactions() {
        // Tests the odd number duplication behavior
        let private_key = PrivateKey::new_key();

        let tx1 = Transaction::new(vec![], vec![create_test_output(100, &private_key)], 0);
        let tx2 = Transaction::new(vec![], vec![create_test_output(200, &private_key)], 0);
        let tx3 = Transaction::new(vec![], vec![create_test_output(300, &private_key)], 0);
        let transactions = vec![tx1, tx2, tx3];

        let merkle_root = MerkleRoot::calculate(&transactions);

        // Three transactions: the last one is duplicated
        let hash1 = transactions[0].hash();
        let hash2 = transactions[1].hash();
        let hash3 = transactions[2].hash();

        // First level: [(H1, H2), (H3, H3)]
        let left = Hash::hash(&[hash1, hash2]);
        let right = Hash::hash(&[hash3, hash3]);

        // Second level: hash of the two results
        let expected = Hash::hash(&[left, right]);

        assert_eq!(merkle_root.as_hash(), expected);
    }

    #[test]
    fn test_merkle_root_four_transactions() {
        let private_key = PrivateKey::new_key();

        let transactions: Vec<Transaction> = [100u64, 200, 300, 400]
            .into_iter()
            .map(|value| Transaction::new(vec![], vec![create_test_output(value, &private_key)], 0))
            .collect();

        let merkle_root = MerkleRoot::calculate(&transactions);

        // Structure: H(H(H1,H2), H(H3,H4))
        let hash1 = transactions[0].hash();
        let hash2 = transactions[1].hash();
        let hash3 = transactions[2].hash();
        let hash4 = transactions[3].hash();

        let left = Hash::hash(&[hash1, hash2]);
        let right = Hash::hash(&[hash3, hash4]);
        let expected = Hash::hash(&[left, right]);

        assert_eq!(merkle_root.as_hash(), expected);
    }

    #[test]
    fn test_merkle_root_consistency() {
        // Same transactions should produce same root
        let private_key = PrivateKey::new_key();

        let tx1 = Transaction::new(vec![], vec![create_test_output(100, &private_key)], 0);
        let tx2 = Transaction::new(vec![], vec![create_test_output(200, &private_key)], 0);

        let root1 = MerkleRoot::calculate(&[tx1.clone(), tx2.clone()]);
        let root2 = MerkleRoot::calculate(&[tx1, tx2]);

        assert_eq!(root1, root2);
    }

    #[test]
    fn test_merkle_root_different_transactions_different_root() {
        let private_key = PrivateKey::new_key();

        let tx1 = Transaction::new(vec![], vec![create_test_output(100, &private_key)], 0);
        let tx2 = Transaction::new(vec![], vec![create_test_output(200, &private_key)], 0);

        let root1 = MerkleRoot::calculate(&[tx1]);
        let root2 = MerkleRoot::calculate(&[tx2]);

        assert_ne!(root1, root2);
    }

    #[test]
    fn test_serialized_size_grows_with_content() {
        let private_key = PrivateKey::new_key();
        let small = Transaction::new(vec![], vec![create_test_output(1, &private_key)], 0);
        let large = Transaction::new(
            vec![],
            vec![
                create_test_output(1, &private_key),
                create_test_output(2, &private_key),
                create_test_output(3, &private_key),
            ],
            0,
        );
        assert!(serialized_size(&large) > serialized_size(&small));
        assert_eq!(small.serialized_size(), serialized_size(&small));
    }
}
