//! Integration tests for the deduplicated content store: reference counting,
//! reclamation, share links, and the maintenance sweep.

use std::sync::Arc;
use std::time::Duration;

use cloud_server::content::{content_hash, ContentStore};
use cloud_server::db::models::Visibility;
use cloud_server::db::DbPool;
use cloud_server::error::StoreError;

struct Fixture {
    store: ContentStore,
    db: DbPool,
    alice: i64,
    bob: i64,
    data_dir: String,
    _tmp: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp.path().to_str().unwrap().to_string();
    let db = cloud_server::db::init_db(&data_dir).expect("Failed to init DB");
    let (alice, bob) = {
        let conn = db.lock().unwrap();
        (
            cloud_server::db::users::create_user(&conn, "alice", "a").unwrap(),
            cloud_server::db::users::create_user(&conn, "bob", "b").unwrap(),
        )
    };
    let store = ContentStore::new(db.clone(), &data_dir).unwrap();
    Fixture {
        store,
        db,
        alice,
        bob,
        data_dir,
        _tmp: tmp,
    }
}

fn blob_file(f: &Fixture, hash: &str) -> std::path::PathBuf {
    std::path::Path::new(&f.data_dir).join("blobs").join(hash)
}

const GRACE: Duration = Duration::from_secs(3600);

fn entry_count(db: &DbPool, blob_id: i64) -> i64 {
    db.lock()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM path_entries WHERE blob_id = ?1",
            [blob_id],
            |row| row.get(0),
        )
        .unwrap()
}

fn blob_row_count(db: &DbPool) -> i64 {
    db.lock()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM content_blobs", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_identical_uploads_share_one_blob() {
    let f = fixture();
    let bytes = b"holiday photos";
    let hash = content_hash(bytes);

    let a = f.store.upload(f.alice, "/photos/1.jpg", bytes, Visibility::Private, None).unwrap();
    let b = f.store.upload(f.bob, "/mine.jpg", bytes, Visibility::Private, None).unwrap();

    assert_eq!(a.blob_id, b.blob_id);
    assert_eq!(blob_row_count(&f.db), 1);
    let blob = f.store.blob(&hash).unwrap().unwrap();
    assert_eq!(blob.ref_count, 2);
    assert_eq!(blob.size, bytes.len() as i64);

    let released = f.store.unbind_path(a.id).unwrap();
    assert_eq!(released.ref_count, 1);
    assert!(!released.reclaimed);
    assert_eq!(f.store.read(b.id).unwrap(), bytes);
    assert!(f.store.entry(a.id).unwrap().is_none());
}

#[test]
fn test_last_unbind_reclaims_blob() {
    let f = fixture();
    let bytes = b"only copy";
    let hash = content_hash(bytes);
    let entry = f.store.upload(f.alice, "/only.txt", bytes, Visibility::Private, None).unwrap();
    assert!(blob_file(&f, &hash).exists());

    let released = f.store.unbind_path(entry.id).unwrap();
    assert_eq!(released.ref_count, 0);
    assert!(released.reclaimed);

    assert!(f.store.blob(&hash).unwrap().is_none());
    assert!(!blob_file(&f, &hash).exists());
    assert!(matches!(f.store.read(entry.id), Err(StoreError::NotFound(_))));
    assert!(matches!(f.store.unbind_path(entry.id), Err(StoreError::NotFound(_))));
}

#[test]
fn test_put_then_bind() {
    let f = fixture();
    let reference = f.store.put(b"report").unwrap();
    let blob = reference.blob().clone();
    assert_eq!(blob.ref_count, 1);

    let entry = f
        .store
        .bind_path(f.alice, "/report.pdf", reference, Visibility::Private, None)
        .unwrap();
    assert_eq!(entry.blob_id, blob.id);
    assert_eq!(entry.path, "/report.pdf");
    assert_eq!(f.store.blob(&blob.hash).unwrap().unwrap().ref_count, 1);

    // Same bytes again: no new row, count goes up
    let again = f.store.put(b"report").unwrap();
    assert_eq!(again.blob().id, blob.id);
    assert_eq!(again.blob().ref_count, 2);
    f.store
        .bind_path(f.bob, "/report.pdf", again, Visibility::Public, Some("1234"))
        .unwrap();
    assert_eq!(blob_row_count(&f.db), 1);
    assert_eq!(entry_count(&f.db, blob.id), 2);
}

#[test]
fn test_failed_bind_releases_reference() {
    let f = fixture();
    f.store.upload(f.alice, "/taken", b"first", Visibility::Private, None).unwrap();

    let reference = f.store.put(b"second").unwrap();
    let hash = reference.hash().to_string();
    let err = f
        .store
        .bind_path(f.alice, "/taken", reference, Visibility::Private, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::PathExists(_)));
    // The only reference was the failed bind's, so the blob is gone
    assert!(f.store.blob(&hash).unwrap().is_none());

    let reference = f.store.put(b"first").unwrap();
    let hash = reference.hash().to_string();
    assert_eq!(reference.blob().ref_count, 2);
    assert!(f
        .store
        .bind_path(f.alice, "relative", reference, Visibility::Private, None)
        .is_err());
    assert_eq!(f.store.blob(&hash).unwrap().unwrap().ref_count, 1);
}

#[test]
fn test_release_unbound_put() {
    let f = fixture();
    let reference = f.store.put(b"abandoned upload").unwrap();
    let hash = reference.hash().to_string();
    let released = f.store.release(reference).unwrap();
    assert!(released.reclaimed);
    assert!(!blob_file(&f, &hash).exists());
}

#[test]
fn test_reference_backs_one_entry() {
    let f = fixture();
    let first = f.store.put(b"shared").unwrap();
    let second = f.store.put(b"shared").unwrap();
    let blob_id = first.blob().id;

    let a = f.store.bind_path(f.alice, "/a", first, Visibility::Private, None).unwrap();
    let b = f.store.bind_path(f.alice, "/b", second, Visibility::Private, None).unwrap();
    assert_eq!(f.store.blob(&content_hash(b"shared")).unwrap().unwrap().ref_count, 2);
    assert_eq!(entry_count(&f.db, blob_id), 2);

    // Both entries can be deleted again
    assert_eq!(f.store.unbind_path(a.id).unwrap().ref_count, 1);
    assert!(f.store.unbind_path(b.id).unwrap().reclaimed);
    assert_eq!(blob_row_count(&f.db), 0);
}

#[test]
fn test_swept_reference_cannot_be_bound() {
    let f = fixture();
    f.store.upload(f.alice, "/kept", b"shared", Visibility::Private, None).unwrap();
    let reference = f.store.put(b"shared").unwrap();
    let blob_id = reference.blob().id;

    let report = f.store.sweep(Duration::ZERO).unwrap();
    assert_eq!(report.stale_reservations, 1);

    let err = f
        .store
        .bind_path(f.alice, "/late", reference, Visibility::Private, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(f.store.find_entry(f.alice, "/late").unwrap().is_none());
    assert_eq!(f.store.blob(&content_hash(b"shared")).unwrap().unwrap().ref_count, 1);
    assert_eq!(entry_count(&f.db, blob_id), 1);
}

#[test]
fn test_sweep_reconciles_abandoned_references() {
    let f = fixture();
    let entry = f.store.upload(f.alice, "/kept", b"kept", Visibility::Private, None).unwrap();
    let _dropped = f.store.put(b"kept").unwrap();
    let _lost = f.store.put(b"never bound").unwrap();
    let lost_hash = content_hash(b"never bound");

    // Inside the grace period nothing changes
    assert_eq!(f.store.sweep(GRACE).unwrap(), Default::default());
    assert_eq!(f.store.blob(&content_hash(b"kept")).unwrap().unwrap().ref_count, 2);

    let report = f.store.sweep(Duration::ZERO).unwrap();
    assert_eq!(report.stale_reservations, 2);
    assert_eq!(report.zero_ref_rows, 1);
    assert_eq!(report.orphan_files, 1);

    assert_eq!(f.store.blob(&content_hash(b"kept")).unwrap().unwrap().ref_count, 1);
    assert_eq!(f.store.read(entry.id).unwrap(), b"kept");
    assert!(f.store.blob(&lost_hash).unwrap().is_none());
    assert!(!blob_file(&f, &lost_hash).exists());
}

#[test]
fn test_duplicate_path_rejected_without_touching_counts() {
    let f = fixture();
    f.store.upload(f.alice, "/a.txt", b"one", Visibility::Private, None).unwrap();
    let err = f
        .store
        .upload(f.alice, "/a.txt", b"two", Visibility::Private, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::PathExists(_)));
    assert!(f.store.blob(&content_hash(b"two")).unwrap().is_none());
    assert_eq!(f.store.blob(&content_hash(b"one")).unwrap().unwrap().ref_count, 1);
}

#[test]
fn test_concurrent_identical_uploads() {
    let f = fixture();
    let store = Arc::new(f.store.clone());
    let bytes = b"same bytes from many clients".to_vec();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let bytes = bytes.clone();
            let owner = if i % 2 == 0 { f.alice } else { f.bob };
            std::thread::spawn(move || {
                store
                    .upload(owner, &format!("/copy-{}", i), &bytes, Visibility::Private, None)
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let blob = f.store.blob(&content_hash(&bytes)).unwrap().unwrap();
    assert_eq!(blob.ref_count, 8);
    assert_eq!(blob_row_count(&f.db), 1);
}

#[test]
fn test_directories_reference_empty_blob() {
    let f = fixture();
    let dir = f.store.make_directory(f.alice, "/docs").unwrap();
    let other = f.store.make_directory(f.bob, "/docs").unwrap();
    assert!(dir.is_dir);
    assert_eq!(dir.blob_id, other.blob_id);
    assert_eq!(
        f.store.blob(&content_hash(b"")).unwrap().unwrap().ref_count,
        2
    );
    assert!(f.store.read(dir.id).unwrap().is_empty());

    let found = f.store.find_entry(f.alice, "/docs/").unwrap().unwrap();
    assert_eq!(found.id, dir.id);
}

#[test]
fn test_list_entries_per_owner() {
    let f = fixture();
    f.store.upload(f.alice, "/b", b"2", Visibility::Private, None).unwrap();
    f.store.upload(f.alice, "/a", b"1", Visibility::Private, None).unwrap();
    f.store.upload(f.bob, "/c", b"3", Visibility::Private, None).unwrap();

    let paths: Vec<String> = f
        .store
        .list_entries(f.alice)
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert_eq!(paths, vec!["/a".to_string(), "/b".to_string()]);
}

#[test]
fn test_share_link_with_password() {
    let f = fixture();
    let entry = f.store.upload(f.alice, "/share.txt", b"shared", Visibility::Private, None).unwrap();
    assert_eq!(entry.visibility, Visibility::Private);
    assert!(entry.share_link.is_none());

    let link = f.store.publish(entry.id, Some("4321")).unwrap();
    assert!(matches!(f.store.open_shared(&link, None), Err(StoreError::AccessDenied)));
    assert!(matches!(
        f.store.open_shared(&link, Some("0000")),
        Err(StoreError::AccessDenied)
    ));

    let (opened, bytes) = f.store.open_shared(&link, Some("4321")).unwrap();
    assert_eq!(bytes, b"shared");
    assert_eq!(opened.downloads, 1);
    assert_eq!(opened.visibility, Visibility::Public);
    let (opened, _) = f.store.open_shared(&link, Some("4321")).unwrap();
    assert_eq!(opened.downloads, 2);

    f.store.unbind_path(entry.id).unwrap();
    assert!(matches!(
        f.store.open_shared(&link, Some("4321")),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_unknown_share_link() {
    let f = fixture();
    assert!(matches!(
        f.store.open_shared("missing", None),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(f.store.publish(999, None), Err(StoreError::NotFound(_))));
}

#[test]
fn test_sweep_removes_orphans_only() {
    let f = fixture();
    let entry = f.store.upload(f.alice, "/keep", b"keep me", Visibility::Private, None).unwrap();
    let keep_hash = content_hash(b"keep me");

    std::fs::write(blob_file(&f, "deadbeefdeadbeefdeadbeefdeadbeef"), b"orphan").unwrap();
    std::fs::write(blob_file(&f, "leftover.tmp"), b"partial").unwrap();
    f.db.lock()
        .unwrap()
        .execute(
            "INSERT INTO content_blobs (hash, size, ref_count, created_at)
             VALUES ('00000000000000000000000000000000', 0, 0, 'now')",
            [],
        )
        .unwrap();

    let report = f.store.sweep(GRACE).unwrap();
    assert_eq!(report.zero_ref_rows, 1);
    assert_eq!(report.orphan_files, 2);
    assert!(blob_file(&f, &keep_hash).exists());
    assert_eq!(f.store.read(entry.id).unwrap(), b"keep me");

    let again = f.store.sweep(GRACE).unwrap();
    assert_eq!(again, Default::default());
}
