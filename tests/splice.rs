use std::fs;
use std::path::Path;

use tempfile::TempDir;

use tapedb::testing::{CounterFactory, TestChange};
use tapedb::{
    splice, CreateOptions, Database, NonceSource, OpenOptions, Payload, SpliceOptions,
    FILE_NAME_BASE, FILE_NAME_LOG, FILE_PREFIX_PAYLOAD,
};

const TEST_KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
    0x0f,
];

const ENCRYPTED_BASE_VALUE0: &str =
    "0000000000000000000000001c0032f4f132f5eec3aed9b9076221fb0062a32f6712aa1595b4899d94f7";
const ENCRYPTED_BASE_VALUE21: &str =
    "0000000000000000000000001d0032f4f132f5eec3aed9bb4b156af8f2abfee6efcca2f547288713ece689";
const ENCRYPTED_LOG_INC2: &str =
    "1000003400000000000000000000000042b5e826f7efc3fecee0140b1ba3c6fcd5d84e0c0e58bf329cc6f1d87f518aac127ad66856192f29";

fn zero_nonce() -> NonceSource {
    NonceSource::fixed(vec![0u8; 12])
}

fn write_file(path: impl AsRef<Path>, content: &[u8]) {
    fs::write(path, content).unwrap();
}

fn write_file_hex(path: impl AsRef<Path>, content: &str) {
    fs::write(path, hex::decode(content).unwrap()).unwrap();
}

fn read_file(path: impl AsRef<Path>) -> Vec<u8> {
    fs::read(path).unwrap()
}

fn read_file_hex(path: impl AsRef<Path>) -> String {
    hex::encode(fs::read(path).unwrap())
}

#[test]
fn splice_empty_directory_writes_fresh_base() {
    let dir = TempDir::new().unwrap();

    splice(&CounterFactory, dir.path(), SpliceOptions::new()).unwrap();

    assert_eq!(read_file(dir.path().join(FILE_NAME_BASE)), b"{\"value\":0}\n");
    assert_eq!(read_file(dir.path().join(FILE_NAME_LOG)), b"");
}

#[test]
fn splice_without_rebase_preserves_bytes() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":21}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n",
    );

    splice(&CounterFactory, dir.path(), SpliceOptions::new()).unwrap();

    assert_eq!(
        read_file(dir.path().join(FILE_NAME_BASE)),
        b"{\"value\":21}\n"
    );
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_LOG)),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n".to_vec()
    );
}

#[test]
fn splice_rebases_leading_changes_into_the_base() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":21}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":7}\n\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n",
    );

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_first(1),
    )
    .unwrap();

    assert_eq!(
        read_file(dir.path().join(FILE_NAME_BASE)),
        b"{\"value\":28}\n"
    );
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_LOG)),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n".to_vec()
    );

    let db = Database::open(&CounterFactory, dir.path(), OpenOptions::new()).unwrap();
    assert_eq!(db.log_len(), 1);
    assert_eq!(db.state().counter, 30);
}

#[test]
fn splice_rebase_selector_sees_log_order() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":20}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n\x00\x00\x00\x18\x0bcounter-inc{\"value\":1}\n",
    );

    let mut seen = Vec::new();
    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_with(move |change: &TestChange, index| {
            if let TestChange::CounterInc(inc) = change {
                seen.push((index, inc.value));
            }
            Ok(index < 1)
        }),
    )
    .unwrap();

    assert_eq!(
        read_file(dir.path().join(FILE_NAME_BASE)),
        b"{\"value\":22}\n"
    );
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_LOG)),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":1}\n".to_vec()
    );
}

#[test]
fn splice_rebasing_everything_leaves_an_empty_log() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":1}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n\x00\x00\x00\x18\x0bcounter-inc{\"value\":4}\n",
    );

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_first(10),
    )
    .unwrap();

    assert_eq!(read_file(dir.path().join(FILE_NAME_BASE)), b"{\"value\":7}\n");
    assert_eq!(read_file(dir.path().join(FILE_NAME_LOG)), b"");
}

#[test]
fn splice_garbage_collects_unreferenced_payloads() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":21}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x23\x0eattach-payload{\"payloadID\":\"456\"}\n",
    );
    write_file(
        dir.path().join(format!("{FILE_PREFIX_PAYLOAD}123")),
        b"test content",
    );
    write_file(
        dir.path().join(format!("{FILE_PREFIX_PAYLOAD}456")),
        b"test content",
    );

    splice(&CounterFactory, dir.path(), SpliceOptions::new()).unwrap();

    assert!(!dir.path().join(format!("{FILE_PREFIX_PAYLOAD}123")).exists());
    assert!(dir.path().join(format!("{FILE_PREFIX_PAYLOAD}456")).exists());
}

#[test]
fn splice_keeps_payloads_referenced_by_the_rebased_base() {
    let dir = TempDir::new().unwrap();

    let mut db = Database::create(&CounterFactory, dir.path(), CreateOptions::new()).unwrap();
    db.apply_with(
        &TestChange::attach("456"),
        vec![Payload::new("456", b"kept".as_slice())],
    )
    .unwrap();
    db.close().unwrap();
    write_file(
        dir.path().join(format!("{FILE_PREFIX_PAYLOAD}123")),
        b"orphan",
    );

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_first(1),
    )
    .unwrap();

    // The attach change folded into the base, which now advertises the id.
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_BASE)),
        b"{\"value\":0,\"payloadIDs\":[\"456\"]}\n"
    );
    assert!(dir.path().join(format!("{FILE_PREFIX_PAYLOAD}456")).exists());
    assert!(!dir.path().join(format!("{FILE_PREFIX_PAYLOAD}123")).exists());
}

#[test]
fn splice_from_plain_to_encrypted() {
    let dir = TempDir::new().unwrap();

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new()
            .target_key(TEST_KEY)
            .nonce(zero_nonce()),
    )
    .unwrap();

    assert_eq!(
        read_file_hex(dir.path().join(FILE_NAME_BASE)),
        ENCRYPTED_BASE_VALUE0
    );
    assert_eq!(read_file(dir.path().join(FILE_NAME_LOG)), b"");
}

#[test]
fn splice_from_plain_to_encrypted_with_base_and_log() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":21}");
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n",
    );

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new()
            .target_key(TEST_KEY)
            .nonce(zero_nonce()),
    )
    .unwrap();

    assert_eq!(
        read_file_hex(dir.path().join(FILE_NAME_BASE)),
        ENCRYPTED_BASE_VALUE21
    );
    assert_eq!(
        read_file_hex(dir.path().join(FILE_NAME_LOG)),
        ENCRYPTED_LOG_INC2
    );
}

#[test]
fn splice_from_encrypted_to_plain() {
    let dir = TempDir::new().unwrap();
    write_file_hex(dir.path().join(FILE_NAME_BASE), ENCRYPTED_BASE_VALUE21);
    write_file_hex(dir.path().join(FILE_NAME_LOG), ENCRYPTED_LOG_INC2);

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().source_key(TEST_KEY),
    )
    .unwrap();

    assert_eq!(
        read_file(dir.path().join(FILE_NAME_BASE)),
        b"{\"value\":21}\n"
    );
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_LOG)),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n".to_vec()
    );
}

#[test]
fn splice_from_encrypted_to_encrypted() {
    let dir = TempDir::new().unwrap();
    write_file_hex(dir.path().join(FILE_NAME_BASE), ENCRYPTED_BASE_VALUE21);
    write_file_hex(dir.path().join(FILE_NAME_LOG), ENCRYPTED_LOG_INC2);

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new()
            .source_key(TEST_KEY)
            .target_key(TEST_KEY)
            .nonce(zero_nonce()),
    )
    .unwrap();

    assert_eq!(
        read_file_hex(dir.path().join(FILE_NAME_BASE)),
        ENCRYPTED_BASE_VALUE21
    );
    assert_eq!(
        read_file_hex(dir.path().join(FILE_NAME_LOG)),
        ENCRYPTED_LOG_INC2
    );
}

#[test]
fn splice_clears_stale_temp_files() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path().join(FILE_NAME_BASE), b"{\"value\":3}");
    write_file(dir.path().join("base.new"), b"left by a crashed splice");
    write_file(dir.path().join("log.new"), b"left by a crashed splice");

    splice(&CounterFactory, dir.path(), SpliceOptions::new()).unwrap();

    assert_eq!(read_file(dir.path().join(FILE_NAME_BASE)), b"{\"value\":3}\n");
    assert!(!dir.path().join("base.new").exists());
    assert!(!dir.path().join("log.new").exists());
}

#[test]
fn splice_preserves_state_across_reopen() {
    let dir = TempDir::new().unwrap();

    let mut db = Database::create(&CounterFactory, dir.path(), CreateOptions::new()).unwrap();
    for value in [3, 5, 7, 11] {
        db.apply(&TestChange::inc(value)).unwrap();
    }
    let before = db.state().counter;
    db.close().unwrap();

    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_first(2),
    )
    .unwrap();

    let db = Database::open(&CounterFactory, dir.path(), OpenOptions::new()).unwrap();
    assert_eq!(db.state().counter, before);
    assert_eq!(db.log_len(), 2);
    assert_eq!(db.base().value, 8);
}

#[test]
fn splice_rekeying_keeps_state() {
    let dir = TempDir::new().unwrap();

    let mut db = Database::create(
        &CounterFactory,
        dir.path(),
        CreateOptions::new().key(TEST_KEY),
    )
    .unwrap();
    db.apply(&TestChange::inc(21)).unwrap();
    db.apply(&TestChange::inc(2)).unwrap();
    db.close().unwrap();

    let new_key = [0x42u8; 32];
    splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new()
            .source_key(TEST_KEY)
            .target_key(new_key)
            .rebase_first(1),
    )
    .unwrap();

    let db = Database::open(
        &CounterFactory,
        dir.path(),
        OpenOptions::new().key(new_key),
    )
    .unwrap();
    assert_eq!(db.state().counter, 23);
    assert_eq!(db.log_len(), 1);
    assert_eq!(db.base().value, 21);
}

#[test]
fn splice_selector_error_aborts() {
    let dir = TempDir::new().unwrap();
    write_file(
        dir.path().join(FILE_NAME_LOG),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n",
    );

    let err = splice(
        &CounterFactory,
        dir.path(),
        SpliceOptions::new().rebase_with(|_: &TestChange, _| {
            Err(tapedb::ModelError::Apply("selector failed".into()))
        }),
    )
    .unwrap_err();
    assert!(matches!(err, tapedb::DatabaseError::Model(_)));

    // The original log is untouched.
    assert_eq!(
        read_file(dir.path().join(FILE_NAME_LOG)),
        b"\x00\x00\x00\x18\x0bcounter-inc{\"value\":2}\n".to_vec()
    );
}
