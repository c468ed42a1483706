//! Engine end-to-end scenarios: commit, recovery, conflicts, assembly
//! hot-swap, and the configuration boundary behaviors.

mod common;

use common::{book, book_model, open_db, title_of, BOOK};
use heliodb::config::{LogStreamConfig, PersistenceConfig, MAX_LOG_STREAMS};
use heliodb::error::{ClusterKind, ConfigKind, ConflictKind};
use heliodb::model::{ClassDescriptor, PropertyDescriptor, PropertyKind};
use heliodb::{AssemblyBundle, Error, PropertyBlock, PropertyValue, TxnKind};

// === Scenario: basic commit and log replay ===

#[test]
fn basic_commit_then_recovery_without_snapshot() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let db = open_db("n1", dir.path());
        let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
        let id = txn.create(BOOK, book("Gatsby", "Fitzegarld")).unwrap();
        assert_eq!(txn.commit().unwrap(), 1, "first commit gets version 1");

        let mut read = db.begin(TxnKind::Read).unwrap();
        let block = read.get(id).unwrap().unwrap();
        assert_eq!(title_of(&block), "Gatsby");
        db.shutdown();
        id
    };

    // Restart without any snapshot: state comes back from log replay.
    let db = open_db("n1", dir.path());
    let mut read = db.begin(TxnKind::Read).unwrap();
    let block = read.get(id).unwrap().unwrap();
    assert_eq!(title_of(&block), "Gatsby");
    assert_eq!(common::author_of(&block), "Fitzegarld");
    assert_eq!(db.manager().current_version(), 1);
    db.shutdown();
}

// === Scenario: conflict and retry ===

#[test]
fn conflicting_update_fails_then_retries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db("n1", dir.path());

    let mut setup = db.begin(TxnKind::ReadWrite).unwrap();
    let id = setup.create(BOOK, book("Gatsby", "Fitzegarld")).unwrap();
    setup.commit().unwrap();

    // A reads the object.
    let mut a = db.begin(TxnKind::ReadWrite).unwrap();
    a.get(id).unwrap().unwrap();

    // B fixes the author and commits at version 2.
    let mut b = db.begin(TxnKind::ReadWrite).unwrap();
    b.update(id, book("Gatsby", "Fitzgerald")).unwrap();
    assert_eq!(b.commit().unwrap(), 2);

    // A's write is now stale.
    a.update(id, book("Great Gatsby", "Fitzegarld")).unwrap();
    let err = a.commit().unwrap_err();
    assert_eq!(err, Error::Conflict(ConflictKind::WriteAfterRead));
    assert!(err.is_retryable());

    // The retry sees B's commit and lands at version 3.
    let mut retry = db.begin(TxnKind::ReadWrite).unwrap();
    let current = retry.get(id).unwrap().unwrap();
    assert_eq!(common::author_of(&current), "Fitzgerald");
    retry.update(id, book("Great Gatsby", "Fitzgerald")).unwrap();
    assert_eq!(retry.commit().unwrap(), 3);
    db.shutdown();
}

#[test]
fn blind_update_after_concurrent_commit_is_write_after_write() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db("n1", dir.path());

    let mut setup = db.begin(TxnKind::ReadWrite).unwrap();
    let id = setup.create(BOOK, book("Gatsby", "Fitzegarld")).unwrap();
    setup.commit().unwrap();

    // A updates the object blindly, without reading it first.
    let mut a = db.begin(TxnKind::ReadWrite).unwrap();
    a.update(id, book("Gatsby", "Someone Else")).unwrap();

    // B commits a newer head for the same object.
    let mut b = db.begin(TxnKind::ReadWrite).unwrap();
    b.update(id, book("Gatsby", "Fitzgerald")).unwrap();
    assert_eq!(b.commit().unwrap(), 2);

    // With no read on record, the conflict is a write-write overlap, not
    // an anti-dependency.
    let err = a.commit().unwrap_err();
    assert_eq!(err, Error::Conflict(ConflictKind::WriteAfterWrite));
    assert!(err.is_retryable());
    db.shutdown();
}

// === Scenario: snapshot + suffix equivalence ===

#[test]
fn snapshot_plus_log_suffix_recovers_identically() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = {
        let db = open_db("n1", dir.path());
        let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
        let first = txn.create(BOOK, book("One", "A")).unwrap();
        txn.commit().unwrap();

        db.snapshot_now().unwrap();

        let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
        let second = txn.create(BOOK, book("Two", "B")).unwrap();
        txn.commit().unwrap();
        db.shutdown();
        (first, second)
    };

    let db = open_db("n1", dir.path());
    let mut read = db.begin(TxnKind::Read).unwrap();
    assert_eq!(title_of(&read.get(first).unwrap().unwrap()), "One");
    assert_eq!(title_of(&read.get(second).unwrap().unwrap()), "Two");
    assert_eq!(db.manager().current_version(), 2);
    db.shutdown();
}

// === Scenario: assembly hot-swap ===

#[test]
fn assembly_hot_swap_changes_guid_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db("n1", dir.path());
    let guid_before = db.model_guid();

    // A transaction begun under the old model keeps it pinned.
    let mut old_txn = db.begin(TxnKind::ReadWrite).unwrap();
    let old_model = std::sync::Arc::clone(old_txn.model());

    let mut model = book_model();
    model.version = 2;
    model.classes.push(ClassDescriptor {
        id: 2,
        name: "Reader".to_string(),
        properties: vec![PropertyDescriptor {
            id: 0,
            name: "Name".to_string(),
            kind: PropertyKind::Str,
        }],
        log_stream: 0,
    });
    db.update_assemblies(AssemblyBundle::for_model(model.clone()))
        .unwrap();
    let guid_after = db.model_guid();
    assert_ne!(guid_before, guid_after, "an effective update changes the guid");

    // New transactions use the new model immediately.
    let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
    txn.create(2, PropertyBlock::new(vec![PropertyValue::string("Nick")]))
        .unwrap();
    txn.commit().unwrap();

    // The in-flight transaction still completes against its pinned model.
    assert_eq!(old_model.version, 1);
    let id = old_txn.create(BOOK, book("Late", "Writer")).unwrap();
    old_txn.commit().unwrap();
    let mut read = db.begin(TxnKind::Read).unwrap();
    assert!(read.get(id).unwrap().is_some());

    // Reapplying the same bundle is a no-op: guid unchanged.
    db.update_assemblies(AssemblyBundle::for_model(model)).unwrap();
    assert_eq!(db.model_guid(), guid_after);
    db.shutdown();
}

// === Boundary behaviors ===

#[test]
fn ninth_log_stream_is_rejected() {
    let mut config = PersistenceConfig::main_only("/data");
    for i in 1..MAX_LOG_STREAMS {
        config
            .create_stream(LogStreamConfig {
                name: format!("s{i}"),
                directory: format!("/data/s{i}/log"),
                snapshot_directory: format!("/data/s{i}/snapshot"),
                max_size: 1 << 20,
                packed: false,
            })
            .unwrap();
    }
    let err = config
        .create_stream(LogStreamConfig {
            name: "ninth".to_string(),
            directory: "/data/ninth/log".to_string(),
            snapshot_directory: "/data/ninth/snapshot".to_string(),
            max_size: 1 << 20,
            packed: false,
        })
        .unwrap_err();
    assert_eq!(
        err,
        Error::Configuration(ConfigKind::TooManyLogs(MAX_LOG_STREAMS))
    );
}

#[test]
fn deleting_the_main_stream_is_an_invalid_argument() {
    let mut config = PersistenceConfig::main_only("/data");
    assert!(matches!(
        config.delete_stream("main").unwrap_err(),
        Error::InvalidArgument { .. }
    ));
}

#[test]
fn standby_site_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db("n1", dir.path());
    db.global_role()
        .set_initial_role(heliodb::GlobalWriteRole::StandbySite);
    let err = db.begin(TxnKind::ReadWrite).unwrap_err();
    assert_eq!(err, Error::Cluster(ClusterKind::NotApplicable));
    // Reads still work on a standby site.
    assert!(db.begin(TxnKind::Read).is_ok());
    db.shutdown();
}
