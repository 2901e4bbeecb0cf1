use iopx::dispatch;
use iopx::prelude::*;
use iopx::xattr::{ARCHIVE_XATTRS, BACKUP_COMPLETION_XATTRS};

use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;

fn clustered_tree(engine: &Arc<Engine>, role: Role, root: &std::path::Path) -> Arc<dyn Iopx> {
    let cfg = TreeConfig::plain(
        root.to_string_lossy().into_owned(),
        BackendConfig::ClusteredFs { root: root.to_path_buf(), sharding_enabled: false },
    );
    engine.tree(role, cfg).unwrap()
}

#[test]
fn single_file_backup_round_trip_sets_all_six_xattrs() {
    let engine = Engine::global();
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    let payload = vec![0x5Au8; 5 * 1024 * 1024];
    let mut f = File::create(src_dir.path().join("big.bin")).unwrap();
    f.write_all(&payload).unwrap();
    drop(f);

    let source = clustered_tree(&engine, Role::Source, src_dir.path());
    let sink = clustered_tree(&engine, Role::Sink, dst_dir.path());

    let stats = dispatch::DmStats::new();
    let failed = dispatch::FailedFiles::new();

    let list_path = src_dir.path().join("collect.0");
    fs::write(&list_path, "/big.bin").unwrap();
    dispatch::run_backup_batch(
        &source,
        &sink,
        Product::ClusteredFs,
        Product::ClusteredFs,
        "src-store",
        "dst-store",
        &list_path,
        4 * 1024 * 1024,
        true,
        &stats,
        &failed,
    )
    .unwrap();

    assert!(failed.is_empty());
    assert_eq!(stats.done(), 1);

    // Extent-based transfer caps the copy at min(actual_size, extent_size):
    // a 5 MiB source file backed by a 4 MiB extent yields a 4 MiB copy.
    let dest_contents = fs::read(dst_dir.path().join("big.bin")).unwrap();
    assert_eq!(dest_contents.len(), 4 * 1024 * 1024);
    assert_eq!(dest_contents, payload[..4 * 1024 * 1024]);

    let src_loc = Location::new(Product::ClusteredFs, "src-store", "/big.bin");
    for name in BACKUP_COMPLETION_XATTRS {
        assert!(source.getxattr(&src_loc, name).is_ok(), "missing backup xattr {name}");
    }

    let dst_loc = Location::new(Product::ClusteredFs, "dst-store", "/big.bin");
    dispatch::run_archive_batch(
        &sink,
        Product::ClusteredFs,
        "dst-store",
        &{
            let p = dst_dir.path().join("archive.0");
            fs::write(&p, "/big.bin").unwrap();
            p
        },
        &dispatch::DmStats::new(),
        &dispatch::FailedFiles::new(),
    )
    .unwrap();
    for name in ARCHIVE_XATTRS {
        assert!(sink.getxattr(&dst_loc, name).is_ok(), "missing archive xattr {name}");
    }
    // Archived file is stubbed to zero length in place.
    assert_eq!(fs::metadata(dst_dir.path().join("big.bin")).unwrap().len(), 0);
}

#[test]
fn archive_batch_is_idempotent_across_two_runs() {
    let engine = Engine::global();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), b"some content").unwrap();
    let tree = clustered_tree(&engine, Role::Source, dir.path());

    let list_path = dir.path().join("archive.0");
    fs::write(&list_path, "/f.txt").unwrap();

    let stats1 = dispatch::DmStats::new();
    let failed1 = dispatch::FailedFiles::new();
    dispatch::run_archive_batch(&tree, Product::ClusteredFs, "vol1", &list_path, &stats1, &failed1).unwrap();
    assert!(failed1.is_empty());
    assert_eq!(fs::metadata(dir.path().join("f.txt")).unwrap().len(), 0);

    let list_path_2 = dir.path().join("archive.1");
    fs::write(&list_path_2, "/f.txt").unwrap();
    let stats2 = dispatch::DmStats::new();
    let failed2 = dispatch::FailedFiles::new();
    dispatch::run_archive_batch(&tree, Product::ClusteredFs, "vol1", &list_path_2, &stats2, &failed2).unwrap();
    assert!(failed2.is_empty());
    assert_eq!(fs::metadata(dir.path().join("f.txt")).unwrap().len(), 0);
}

#[test]
fn full_scan_lists_every_file_under_the_store_root() {
    let engine = Engine::global();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"a").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

    let tree = clustered_tree(&engine, Role::Source, dir.path());
    let root = Location::new(Product::ClusteredFs, "vol1", "/");
    let collect_path = dispatch::scan(&tree, &root, ScanMode::Full).unwrap();

    let contents = fs::read_to_string(&collect_path).unwrap();
    assert!(contents.contains("/a.txt"));
    assert!(contents.contains("/sub/b.txt"));
}

#[test]
fn restore_then_backup_chain_moves_content_between_both_backends() {
    let engine = Engine::global();
    let backup_dir = tempfile::tempdir().unwrap();
    let restored_dir = tempfile::tempdir().unwrap();

    let backup_args = "cc=1:cn=n:ph=p:pp=1:at=1:in=i:bs=b:sc=s:jt=full-backup:ns=2";
    let backup_cfg = TreeConfig::plain(
        "store",
        BackendConfig::BackupService { argument_string: backup_args.to_string(), root: backup_dir.path().to_path_buf() },
    );
    let backup_tree = engine.tree(Role::Sink, backup_cfg).unwrap();

    let dest_loc = Location::new(Product::BackupService, "store", "/report.csv");
    let handle = backup_tree.creat(&dest_loc, OpenFlags::WRONLY, 0o640, 9).unwrap();
    backup_tree.pwrite(&handle, 0, b"col,val,x").unwrap();
    let assigned_uuid = handle.location().uuid;
    backup_tree.close(&handle).unwrap();

    let restore_args = "cc=1:cn=n:ph=p:pp=1:at=1:in=i:bs=b:sc=s:jt=restore:ns=2";
    let restore_cfg = TreeConfig::restore(
        "store-restore",
        BackendConfig::BackupService { argument_string: restore_args.to_string(), root: backup_dir.path().to_path_buf() },
        4,
    );
    let restore_source = engine.tree(Role::Source, restore_cfg).unwrap();
    let sink = clustered_tree(&engine, Role::Sink, restored_dir.path());

    dispatch::restore_one(
        &restore_source,
        &sink,
        Product::BackupService,
        Product::ClusteredFs,
        "store-restore",
        "vol-restored",
        "/report.csv",
        assigned_uuid,
        4096,
    )
    .unwrap();

    let contents = fs::read(restored_dir.path().join("report.csv")).unwrap();
    assert_eq!(contents, b"col,val,x");
}
