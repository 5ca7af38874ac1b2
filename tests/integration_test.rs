// tests/integration_test.rs

//! Integration tests for entropy
//!
//! A server context publishes its repository store to a mirror directory
//! and a client context updates from it, exercising modules end to end.

use entropy::atom::DepSpec;
use entropy::branch::BranchManager;
use entropy::cleanup;
use entropy::db;
use entropy::db::models::{DependencyKind, ExpiredPackage, Package};
use entropy::lock::LockMode;
use entropy::notice::NoticeBoard;
use entropy::preserved::PreservedLibraries;
use entropy::query::Query;
use entropy::repository::sync::{UpdateEngine, UpdateOptions, UpdateStatus};
use entropy::repository::{add_repository, mirror};
use entropy::resolver::{self, ResolveOptions};
use entropy::settings::Settings;
use entropy::store::{self, PackageRecord, add_package};
use entropy::{Error, RepositoryContext};
use std::fs;
use tempfile::{NamedTempFile, TempDir};

struct Setup {
    _server_root: TempDir,
    _client_root: TempDir,
    mirror: TempDir,
    server: RepositoryContext,
    client: RepositoryContext,
}

fn setup() -> Setup {
    let server_root = TempDir::new().unwrap();
    let client_root = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();

    let server = RepositoryContext::new(server_root.path(), Settings::default()).unwrap();
    let client = RepositoryContext::new(client_root.path(), Settings::default()).unwrap();

    add_repository(
        &server.open_system().unwrap(),
        "main".into(),
        "/srv/unused".into(),
        "5".into(),
        0,
    )
    .unwrap();
    add_repository(
        &client.open_system().unwrap(),
        "main".into(),
        format!("file://{}", mirror.path().display()),
        "5".into(),
        0,
    )
    .unwrap();

    let conn = server.open_current_store("main").unwrap();
    let mut glibc = PackageRecord::new("sys-libs/glibc-2.38")
        .provides("libc.so.6", 2, "/lib64/libc.so.6");
    glibc.description = Some("GNU C library".into());
    glibc.download_path = Some("packages/glibc-2.38.tbz2".into());
    add_package(&conn, "5", &glibc).unwrap();
    add_package(
        &conn,
        "5",
        &PackageRecord::new("sys-libs/readline-8.2")
            .depends("sys-libs/glibc", DependencyKind::Runtime)
            .provides("libreadline.so.8", 2, "/lib64/libreadline.so.8")
            .needs("libc.so.6", 2),
    )
    .unwrap();
    let mut bash = PackageRecord::new("app-shells/bash-5.2")
        .depends("sys-libs/readline", DependencyKind::Runtime)
        .depends(">=sys-libs/glibc-2.30", DependencyKind::Runtime)
        .needs("libreadline.so.8", 2)
        .needs("libc.so.6", 2);
    bash.download_path = Some("packages/bash-5.2.tbz2".into());
    add_package(&conn, "5", &bash).unwrap();

    Setup {
        _server_root: server_root,
        _client_root: client_root,
        mirror,
        server,
        client,
    }
}

fn publish(s: &Setup, branch: &str) -> String {
    let repo = s.server.repository("main").unwrap();
    assert_eq!(repo.branch, branch);
    let conn = s.server.open_current_store("main").unwrap();
    mirror::publish(&conn, s.mirror.path(), "standard", branch)
        .unwrap()
        .checksum
}

fn update(s: &Setup) -> UpdateStatus {
    let report = UpdateEngine::new(&s.client)
        .update(&[], UpdateOptions::default())
        .unwrap();
    match &report.get("main").unwrap().result {
        Ok(status) => status.clone(),
        Err(e) => panic!("update failed: {}", e),
    }
}

#[test]
fn test_database_init_creates_parent_directories() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nested/path/to/packages.db");

    db::init(&db_path).unwrap();
    assert!(db_path.exists(), "Database should exist in nested path");

    let conn = db::open(&db_path).unwrap();
    let foreign_keys: i32 = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .unwrap();
    assert_eq!(foreign_keys, 1, "Foreign keys should be enabled");

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_lowercase(), "wal", "Journal mode should be WAL");
}

#[test]
fn test_open_missing_database_fails() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_path_buf();
    drop(temp_file);

    let err = db::open(&db_path).unwrap_err();
    assert!(matches!(err, Error::DatabaseNotFound(_)));
}

#[test]
fn test_transaction_rollback_on_error() {
    let temp_dir = TempDir::new().unwrap();
    let mut conn = db::open_or_init(&temp_dir.path().join("packages.db")).unwrap();

    let result = db::transaction(&mut conn, |tx| {
        add_package(tx, "5", &PackageRecord::new("app-misc/a-1"))?;
        // Same atom twice violates the unique constraint
        add_package(tx, "5", &PackageRecord::new("app-misc/a-1"))?;
        Ok(())
    });

    assert!(result.is_err(), "Transaction should fail on duplicate");
    assert_eq!(
        Package::count(&conn).unwrap(),
        0,
        "No packages should be in the store after rollback"
    );
}

#[test]
fn test_client_update_and_queries() {
    let s = setup();
    let checksum = publish(&s, "5");

    match update(&s) {
        UpdateStatus::Updated {
            checksum: got,
            packages,
            ..
        } => {
            assert_eq!(got, checksum);
            assert_eq!(packages, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(update(&s), UpdateStatus::UpToDate);

    let query = Query::new(&s.client, &[], LockMode::NoWait).unwrap();
    let hits = query.search(&["bash".into()]).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].package.atom.qualified(), "app-shells/bash-5.2:0");

    let required = query.required(&["libc.so.6".into()], None).unwrap();
    assert_eq!(required.len(), 2);

    // Install bash into an empty system: dependencies come first
    let store = s.client.open_current_store("main").unwrap();
    let plan = resolver::install_plan(
        &store,
        None,
        &[DepSpec::parse("app-shells/bash").unwrap()],
        &ResolveOptions::default(),
    )
    .unwrap();
    let order: Vec<String> = plan.iter().map(|p| p.atom.key()).collect();
    assert_eq!(
        order,
        vec!["sys-libs/glibc", "sys-libs/readline", "app-shells/bash"]
    );
}

#[test]
fn test_notices_travel_with_updates() {
    let s = setup();
    publish(&s, "5");
    update(&s);

    NoticeBoard::new(&s.server, "main")
        .add("Maintenance", "Mirror moves on Monday", None, LockMode::NoWait)
        .unwrap();
    publish(&s, "5");

    match update(&s) {
        UpdateStatus::Updated { eapi, .. } => assert_eq!(eapi, 3, "Expected a delta update"),
        other => panic!("unexpected {:?}", other),
    }

    let board = NoticeBoard::new(&s.client, "main");
    let unread = board.unread(LockMode::NoWait).unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].title, "Maintenance");

    board.mark_all_read(LockMode::NoWait).unwrap();
    assert!(board.unread(LockMode::NoWait).unwrap().is_empty());
}

#[test]
fn test_removed_package_expires_and_is_cleaned() {
    let s = setup();
    publish(&s, "5");
    update(&s);

    {
        let conn = s.server.open_current_store("main").unwrap();
        store::remove_by_atom(&conn, "app-shells/bash-5.2:0").unwrap();
    }
    publish(&s, "5");

    match update(&s) {
        UpdateStatus::Updated { expired, .. } => assert_eq!(expired, 1),
        other => panic!("unexpected {:?}", other),
    }

    let packages = s.client.packages_dir("main", "5");
    fs::create_dir_all(&packages).unwrap();
    let file = packages.join("bash-5.2.tbz2");
    fs::write(&file, b"binary package").unwrap();

    // Inside the expiration period nothing goes away
    let report = cleanup::cleanup(&s.client, "main", None, false, LockMode::NoWait).unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.pending.len(), 1);
    assert!(file.exists());

    let report = cleanup::cleanup(&s.client, "main", Some(0), false, LockMode::NoWait).unwrap();
    assert_eq!(report.removed.len(), 1);
    assert!(!file.exists());

    let store = s.client.open_current_store("main").unwrap();
    assert!(ExpiredPackage::list_all(&store).unwrap().is_empty());
}

#[test]
fn test_branch_switch_on_both_sides() {
    let s = setup();
    publish(&s, "5");
    update(&s);

    let outcome = BranchManager::new(&s.server)
        .switch("main", "6", None, true, LockMode::NoWait)
        .unwrap();
    assert!(outcome.created);
    {
        let conn = s.server.open_current_store("main").unwrap();
        add_package(&conn, "6", &PackageRecord::new("app-editors/nano-7.2")).unwrap();
    }
    publish(&s, "6");

    let client_branches = BranchManager::new(&s.client);
    client_branches
        .switch("main", "6", None, true, LockMode::NoWait)
        .unwrap();
    assert_eq!(client_branches.current("main").unwrap(), "6");

    match update(&s) {
        UpdateStatus::Updated { packages, .. } => assert_eq!(packages, 4),
        other => panic!("unexpected {:?}", other),
    }

    // Branch 5 data is untouched
    let old = db::open(&s.client.store_path("main", "5")).unwrap();
    assert_eq!(Package::count(&old).unwrap(), 3);
    let new = s.client.open_current_store("main").unwrap();
    assert!(
        Package::list_all(&new)
            .unwrap()
            .iter()
            .all(|p| p.branch == "6")
    );
}

#[test]
fn test_preserved_library_lifecycle() {
    let root = TempDir::new().unwrap();
    let ctx = RepositoryContext::new(root.path(), Settings::default()).unwrap();
    let installed = ctx.open_installed().unwrap();

    let system_root = TempDir::new().unwrap();
    let lib = system_root.path().join("lib64/libreadline.so.8");
    fs::create_dir_all(lib.parent().unwrap()).unwrap();
    fs::write(&lib, b"\x7fELF").unwrap();

    let readline = add_package(
        &installed,
        "5",
        &PackageRecord::new("sys-libs/readline-8.2")
            .provides("libreadline.so.8", 2, "/lib64/libreadline.so.8"),
    )
    .unwrap();
    let bash = add_package(
        &installed,
        "5",
        &PackageRecord::new("app-shells/bash-5.2").needs("libreadline.so.8", 2),
    )
    .unwrap();

    // Upgrading readline to a new soname would break bash: keep the old one
    let package = Package::find_by_id(&installed, readline).unwrap().unwrap();
    let tracker = PreservedLibraries::for_package(&installed, system_root.path(), &package).unwrap();
    let outcome = tracker
        .remove_package_files(&["/lib64/libreadline.so.8".into()], "sys-libs/readline-8.2:0")
        .unwrap();
    assert_eq!(outcome.preserved, vec!["/lib64/libreadline.so.8"]);
    assert!(lib.exists());
    Package::delete(&installed, readline).unwrap();

    let tracker = PreservedLibraries::new(&installed, system_root.path());
    let entries = tracker.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].references(), 1);
    assert!(tracker.gc().unwrap().is_empty(), "Referenced library must not be collectable");
    assert!(resolver::libtest(&installed).unwrap().is_empty());

    // Once bash is rebuilt without it the library can go
    Package::delete(&installed, bash).unwrap();
    let candidates = tracker.gc().unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(lib.exists(), "gc never deletes");

    assert!(tracker.collect(&candidates).unwrap().is_empty());
    assert!(!lib.exists());
    assert!(tracker.list().unwrap().is_empty());
}
