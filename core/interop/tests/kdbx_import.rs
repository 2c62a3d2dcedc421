//! KDBX import against fixture databases produced by
//! `fixtures/generate_fixtures.py`.

use std::path::PathBuf;

use keyward_common::error::AUTHENTICATION_FAILED;
use keyward_common::{Error, SensitiveBytes};
use keyward_interop::{detect_format, import_kdbx, ImportFormat, ImportLimits, ImportOutcome};
use keyward_vault::EntryKind;

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {}", path.display(), e))
}

fn open(name: &str, password: &str) -> Result<ImportOutcome, Error> {
    import_kdbx(
        &fixture(name),
        &SensitiveBytes::from_passphrase(password),
        &ImportLimits::default(),
    )
}

fn assert_fixture_contents(outcome: &ImportOutcome) {
    assert_eq!(outcome.report.format, ImportFormat::Kdbx);
    assert_eq!(outcome.report.imported, 2);
    assert_eq!(outcome.report.skipped, 1, "recycle bin entry is skipped");
    assert!(outcome.report.errors.is_empty());

    assert_eq!(outcome.groups.len(), 1);
    let banking = &outcome.groups[0];
    assert_eq!(banking.name, "Banking");
    assert_eq!(banking.parent_id, None);

    let email = outcome
        .entries
        .iter()
        .find(|e| e.title == "Email")
        .expect("email entry");
    assert_eq!(email.kind, EntryKind::Login);
    assert_eq!(email.username, "alice@example.com");
    assert_eq!(email.password, "correct horse battery staple");
    assert_eq!(email.urls, vec!["https://mail.example.com"]);
    assert_eq!(email.notes, "Primary inbox\nRecovery codes in the safe");
    assert_eq!(email.tags, vec!["mail", "personal"]);
    assert_eq!(email.group_id, None);
    assert_eq!(email.created_at.timestamp(), 1_600_000_000);
    assert_eq!(email.modified_at.timestamp(), 1_700_000_000);
    assert_eq!(email.password_history.len(), 1);
    assert_eq!(email.password_history[0].password, "old-mail-password");
    assert_eq!(email.password_history[0].retired_at.timestamp(), 1_650_000_000);

    // The title carried a right-to-left override.
    let bank = outcome
        .entries
        .iter()
        .find(|e| e.title == "Bank")
        .expect("bank entry");
    assert_eq!(bank.username, "acct-1001");
    assert_eq!(bank.password, "Tr0ub4dor&3");
    assert_eq!(bank.group_id, Some(banking.id));
    assert_eq!(bank.custom_fields["PIN"], "4321");
    assert_eq!(bank.custom_fields["Branch"], "Main Street");
    assert_eq!(bank.modified_at.timestamp(), 1_710_000_000);

    assert!(outcome.entries.iter().all(|e| e.title != "Deleted login"));
}

#[test]
fn test_kdbx3_aes_salsa20() {
    let outcome = open("kdbx3_aes.kdbx", "kdbx3-fixture").unwrap();
    assert_fixture_contents(&outcome);
}

#[test]
fn test_kdbx4_chacha20_argon2id() {
    let outcome = open("kdbx4_chacha20_argon2id.kdbx", "kdbx4-fixture").unwrap();
    assert_fixture_contents(&outcome);
}

#[test]
fn test_kdbx4_aes_aeskdf_gzip() {
    let outcome = open("kdbx4_aes_aeskdf.kdbx", "kdbx4-fixture").unwrap();
    assert_fixture_contents(&outcome);
}

#[test]
fn test_fixtures_are_detected() {
    assert_eq!(detect_format(&fixture("kdbx3_aes.kdbx")), ImportFormat::Kdbx);
    assert_eq!(
        detect_format(&fixture("kdbx4_chacha20_argon2id.kdbx")),
        ImportFormat::Kdbx
    );
}

#[test]
fn test_wrong_password_is_generic() {
    for (name, password) in [
        ("kdbx3_aes.kdbx", "kdbx4-fixture"),
        ("kdbx4_chacha20_argon2id.kdbx", "wrong"),
        ("kdbx4_aes_aeskdf.kdbx", "kdbx3-fixture"),
    ] {
        match open(name, password) {
            Err(Error::Authentication(message)) => assert_eq!(message, AUTHENTICATION_FAILED),
            other => panic!("{}: expected authentication failure, got {:?}", name, other.map(|o| o.report)),
        }
    }
}

#[test]
fn test_tampered_body_is_generic() {
    for name in ["kdbx3_aes.kdbx", "kdbx4_chacha20_argon2id.kdbx"] {
        let mut bytes = fixture(name);
        let index = bytes.len() - 40;
        bytes[index] ^= 0x80;
        let result = import_kdbx(
            &bytes,
            &SensitiveBytes::from_passphrase(if name.starts_with("kdbx3") {
                "kdbx3-fixture"
            } else {
                "kdbx4-fixture"
            }),
            &ImportLimits::default(),
        );
        assert!(
            matches!(result, Err(Error::Authentication(_))),
            "{} accepted a tampered body",
            name
        );
    }
}

#[test]
fn test_tampered_header_is_generic() {
    // Byte 20 sits inside the first header field of the v4 file.
    let mut bytes = fixture("kdbx4_aes_aeskdf.kdbx");
    bytes[20] ^= 0x01;
    let result = import_kdbx(
        &bytes,
        &SensitiveBytes::from_passphrase("kdbx4-fixture"),
        &ImportLimits::default(),
    );
    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[test]
fn test_truncated_file_is_generic() {
    let bytes = fixture("kdbx4_chacha20_argon2id.kdbx");
    for cut in [12, bytes.len() / 2, bytes.len() - 1] {
        let result = import_kdbx(
            &bytes[..cut],
            &SensitiveBytes::from_passphrase("kdbx4-fixture"),
            &ImportLimits::default(),
        );
        assert!(
            matches!(result, Err(Error::Authentication(_))),
            "truncation at {} was not rejected",
            cut
        );
    }
}

#[test]
fn test_doctype_is_rejected() {
    let result = open("kdbx4_doctype.kdbx", "kdbx4-fixture");
    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[test]
fn test_not_kdbx_is_validation_error() {
    let result = import_kdbx(
        b"title,username,password\n",
        &SensitiveBytes::from_passphrase("x"),
        &ImportLimits::default(),
    );
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_oversized_input_is_refused_before_parsing() {
    let limits = ImportLimits {
        max_file_bytes: 64,
        ..ImportLimits::default()
    };
    let result = import_kdbx(
        &fixture("kdbx3_aes.kdbx"),
        &SensitiveBytes::from_passphrase("kdbx3-fixture"),
        &limits,
    );
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_decompression_bound_is_enforced() {
    let limits = ImportLimits {
        max_decompressed_bytes: 128,
        ..ImportLimits::default()
    };
    let result = import_kdbx(
        &fixture("kdbx4_aes_aeskdf.kdbx"),
        &SensitiveBytes::from_passphrase("kdbx4-fixture"),
        &limits,
    );
    assert!(matches!(result, Err(Error::Authentication(_))));
}
