use burrow::{ErrorKind, TunnelError};
use burrow::keys::{self, KeyAlgorithm};

#[test]
fn test_ed25519_keypair_is_usable() {
    let pair = keys::generate(KeyAlgorithm::Ed25519, None).unwrap();

    assert!(pair.private_key.contains("BEGIN OPENSSH PRIVATE KEY"));
    assert!(pair.public_key.starts_with("ssh-ed25519 "));
    assert!(pair.fingerprint.starts_with("SHA256:"));
    assert!(pair.bits.is_none());

    // Importing the generated key reproduces its fingerprint.
    let imported = keys::import_private_key(&pair.private_key, None).unwrap();
    assert_eq!(imported.algorithm, KeyAlgorithm::Ed25519);
    assert_eq!(imported.fingerprint, pair.fingerprint);
    assert!(!imported.encrypted);

    let again = keys::import_private_key(&pair.private_key, None).unwrap();
    assert_eq!(again.fingerprint, imported.fingerprint);
}

#[test]
fn test_distinct_keys_have_distinct_fingerprints() {
    let a = keys::generate(KeyAlgorithm::Ed25519, None).unwrap();
    let b = keys::generate(KeyAlgorithm::Ed25519, None).unwrap();
    assert_ne!(a.fingerprint, b.fingerprint);
}

#[test]
fn test_ecdsa_sizes() {
    let pair = keys::generate(KeyAlgorithm::Ecdsa, Some(384)).unwrap();
    assert!(pair.public_key.starts_with("ecdsa-sha2-nistp384 "));
    assert_eq!(pair.bits, Some(384));

    let err = keys::generate(KeyAlgorithm::Ecdsa, Some(300)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_unknown_algorithm_name() {
    let err = "dsa".parse::<KeyAlgorithm>().unwrap_err();
    assert!(matches!(err, TunnelError::UnsupportedAlgorithm(ref name) if name == "dsa"));
    assert_eq!(err.kind(), ErrorKind::KeyFormat);
}

#[test]
fn test_import_rejects_garbage() {
    let err = keys::import_private_key("not a key at all", None).unwrap_err();
    assert!(matches!(err, TunnelError::InvalidKeyFormat(_)));
}

#[test]
fn test_import_rejects_truncated_key() {
    let pair = keys::generate(KeyAlgorithm::Ed25519, None).unwrap();
    let truncated: String = pair
        .private_key
        .lines()
        .filter(|l| !l.starts_with("-----END"))
        .collect::<Vec<_>>()
        .join("\n");

    let err = keys::import_private_key(&truncated, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyFormat);
}
