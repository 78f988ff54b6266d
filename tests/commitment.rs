use htlc_swap_coordinator::secret::{Commitments, HashFunction, Secret};

use std::collections::HashSet;

#[test]
fn test_generated_pairs_verify_without_collisions() {
    for function in [HashFunction::Keccak256, HashFunction::Sha256] {
        let commitments = Commitments::new(function);
        let mut locks = HashSet::new();
        let mut secrets = HashSet::new();

        for _ in 0..10_000 {
            let (secret, lock) = commitments.generate();
            assert!(commitments.verify(&secret, &lock));
            assert!(secrets.insert(*secret.as_bytes()));
            assert!(locks.insert(lock));
        }
    }
}

#[test]
fn test_published_secret_verifies() {
    let commitments = Commitments::new(HashFunction::Keccak256);
    let (secret, lock) = commitments.generate();

    let published = secret.expose_hex();
    assert!(published.starts_with("0x"));
    assert_eq!(published.len(), 66);

    let recovered = Secret::from_hex(&published).unwrap();
    assert!(commitments.verify(&recovered, &lock));
}

#[test]
fn test_known_sha256_vector() {
    // sha256 of 32 zero bytes
    let lock = Commitments::new(HashFunction::Sha256).hash_lock(&Secret::from_bytes([0u8; 32]));
    assert_eq!(
        lock.to_hex(),
        "0x66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
    );
}
