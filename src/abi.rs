//! Thin `extern "C"` façade over the engine, shaped like the CLI surface's
//! `backup`/`scan`/`stub`/`restore` verbs. The CLI itself —
//! argv parsing, config files — is an external collaborator out of scope
//! here; this module only commits to the entry-point contract: one function
//! per user-visible operation, C strings in, an errno-shaped exit code out.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dispatch::{self, DmStats, FailedFiles};
use crate::engine::{BackendConfig, Engine, Role, TreeConfig};
use crate::error::{DmResult, OsError};
use crate::iopx::{Iopx, ScanMode};
use crate::location::{Location, Product};

/// Where a freshly parsed backup-service argument string resolves its local
/// item store, when the caller doesn't otherwise configure one. Config
/// plumbing is out of scope; this is the one fallback this façade commits
/// to so a `BackupService` store string can be used standalone.
fn default_backup_service_root() -> PathBuf {
    std::env::var("IOPX_BACKUP_SERVICE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/iopx/backup-service"))
}

fn cstr<'a>(ptr: *const c_char) -> DmResult<&'a str> {
    if ptr.is_null() {
        return Err(OsError::new(libc::EINVAL, "null C string argument"));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| OsError::new(libc::EILSEQ, format!("argument is not valid UTF-8: {e}")))
}

fn parse_product(s: &str) -> DmResult<Product> {
    match s {
        "clustered-fs" => Ok(Product::ClusteredFs),
        "backup-service" => Ok(Product::BackupService),
        other => Err(OsError::new(libc::EINVAL, format!("unknown product {other:?}"))),
    }
}

fn backend_config(product: Product, store: &str) -> BackendConfig {
    match product {
        Product::ClusteredFs => BackendConfig::ClusteredFs { root: PathBuf::from(store), sharding_enabled: false },
        Product::BackupService => {
            BackendConfig::BackupService { argument_string: store.to_string(), root: default_backup_service_root() }
        }
    }
}

fn tree_for(engine: &Engine, role: Role, product: Product, store: &str) -> DmResult<Arc<dyn Iopx>> {
    let cfg = match (role, product) {
        (Role::Source, Product::BackupService) => {
            TreeConfig::restore(store, backend_config(product, store), 32)
        }
        _ => TreeConfig::plain(store, backend_config(product, store)),
    };
    engine.tree(role, cfg)
}

fn result_code(result: DmResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e}");
            e.raw_error()
        }
    }
}

fn run_scan(mode: &str, product: &str, store: &str, output_list: &str) -> DmResult<()> {
    let mode = match mode {
        "full" => ScanMode::Full,
        "incr" => ScanMode::Incremental,
        other => return Err(OsError::new(libc::EINVAL, format!("unknown scan mode {other:?}"))),
    };
    let product = parse_product(product)?;
    let engine = Engine::global();
    let tree = tree_for(&engine, Role::Source, product, store)?;
    let root = Location::new(product, store, "/");
    let collect_path = dispatch::scan(&tree, &root, mode)?;
    std::fs::copy(&collect_path, output_list).map_err(OsError::from)?;
    Ok(())
}

fn run_transfer(
    src_product: &str,
    src_store: &str,
    dest_product: &str,
    dest_store: &str,
    input_list: &str,
    failed_list: &str,
    is_backup: bool,
) -> DmResult<()> {
    let src_product = parse_product(src_product)?;
    let dest_product = parse_product(dest_product)?;
    let engine = Engine::global();
    let source = tree_for(&engine, Role::Source, src_product, src_store)?;
    let failed = FailedFiles::new();
    let stats = DmStats::new();

    if is_backup {
        let sink = tree_for(&engine, Role::Sink, dest_product, dest_store)?;
        dispatch::run_backup_batch(
            &source,
            &sink,
            src_product,
            dest_product,
            src_store,
            dest_store,
            input_list.as_ref(),
            1024 * 1024,
            true,
            &stats,
            &failed,
        )?;
    } else {
        dispatch::run_archive_batch(&source, src_product, src_store, input_list.as_ref(), &stats, &failed)?;
    }

    let entries = failed.list();
    if !entries.is_empty() {
        let body: String = entries.iter().map(|(path, err)| format!("{path}\t{err}\n")).collect();
        std::fs::write(failed_list, body).map_err(OsError::from)?;
    }
    if stats.last_error_code() != 0 {
        return Err(OsError::new(stats.last_error_code(), "one or more files failed"));
    }
    Ok(())
}

/// `scan <full|incr> <src-product> <src-store> <output-list>`
#[no_mangle]
pub extern "C" fn iopx_scan(
    mode: *const c_char,
    src_product: *const c_char,
    src_store: *const c_char,
    output_list: *const c_char,
) -> i32 {
    let result = (|| -> DmResult<()> {
        run_scan(cstr(mode)?, cstr(src_product)?, cstr(src_store)?, cstr(output_list)?)
    })();
    result_code(result)
}

/// `backup <src-product> <src-store> <dest-product> <dest-store> <input-list> <failed-list>`
#[no_mangle]
pub extern "C" fn iopx_backup(
    src_product: *const c_char,
    src_store: *const c_char,
    dest_product: *const c_char,
    dest_store: *const c_char,
    input_list: *const c_char,
    failed_list: *const c_char,
) -> i32 {
    let result = (|| -> DmResult<()> {
        run_transfer(
            cstr(src_product)?,
            cstr(src_store)?,
            cstr(dest_product)?,
            cstr(dest_store)?,
            cstr(input_list)?,
            cstr(failed_list)?,
            true,
        )
    })();
    result_code(result)
}

/// `stub <src-product> <src-store> <dest-product> <dest-store> <input-list> <failed-list>`
///
/// `dest-product`/`dest-store` are accepted for CLI symmetry with `backup`
/// but unused: archiving stubs files in place on the source tree.
#[no_mangle]
pub extern "C" fn iopx_stub(
    src_product: *const c_char,
    src_store: *const c_char,
    _dest_product: *const c_char,
    _dest_store: *const c_char,
    input_list: *const c_char,
    failed_list: *const c_char,
) -> i32 {
    let result = (|| -> DmResult<()> {
        run_transfer(
            cstr(src_product)?,
            cstr(src_store)?,
            cstr(src_product)?,
            cstr(src_store)?,
            cstr(input_list)?,
            cstr(failed_list)?,
            false,
        )
    })();
    result_code(result)
}

/// `restore <src-product> <src-store> <dest-product> <dest-store> <input-list> <failed-list>`
///
/// `input_list` is a newline-delimited `<path>\t<hex-uuid>` list: a restore
/// needs the backend-assigned uuid the original backup recorded, which a
/// plain path can't recover on its own.
#[no_mangle]
pub extern "C" fn iopx_restore(
    src_product: *const c_char,
    src_store: *const c_char,
    dest_product: *const c_char,
    dest_store: *const c_char,
    input_list: *const c_char,
    failed_list: *const c_char,
) -> i32 {
    let result = (|| -> DmResult<()> {
        let src_product = parse_product(cstr(src_product)?)?;
        let dest_product = parse_product(cstr(dest_product)?)?;
        let src_store = cstr(src_store)?;
        let dest_store = cstr(dest_store)?;
        let input_list = cstr(input_list)?;
        let failed_list = cstr(failed_list)?;

        let engine = Engine::global();
        let source = tree_for(&engine, Role::Source, src_product, src_store)?;
        let sink = tree_for(&engine, Role::Sink, dest_product, dest_store)?;
        let failed = FailedFiles::new();

        let contents = std::fs::read_to_string(input_list).map_err(OsError::from)?;
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let (path, uuid_hex) = line
                .split_once('\t')
                .ok_or_else(|| OsError::new(libc::EINVAL, format!("malformed restore entry: {line:?}")))?;
            let uuid = parse_hex_uuid(uuid_hex)?;
            if let Err(e) =
                dispatch::restore_one(&source, &sink, src_product, dest_product, src_store, dest_store, path, uuid, 1024 * 1024)
            {
                failed.push(path, e);
            }
        }

        let entries = failed.list();
        if !entries.is_empty() {
            let body: String = entries.iter().map(|(path, err)| format!("{path}\t{err}\n")).collect();
            std::fs::write(failed_list, body).map_err(OsError::from)?;
            return Err(OsError::new(libc::EIO, "one or more files failed to restore"));
        }
        Ok(())
    })();
    result_code(result)
}

fn parse_hex_uuid(s: &str) -> DmResult<crate::location::Uuid> {
    if s.len() != 32 {
        return Err(OsError::new(libc::EINVAL, format!("uuid {s:?} must be 32 hex characters")));
    }
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| OsError::new(libc::EINVAL, format!("uuid {s:?} is not valid hex")))?;
    }
    Ok(crate::location::Uuid(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn scan_and_backup_round_trip_through_the_c_abi() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.txt"), b"hello").unwrap();

        let output_list = src_dir.path().join("out.list");
        let mode = CString::new("full").unwrap();
        let product = CString::new("clustered-fs").unwrap();
        let src_store = CString::new(src_dir.path().to_str().unwrap()).unwrap();
        let output = CString::new(output_list.to_str().unwrap()).unwrap();
        let rc = iopx_scan(mode.as_ptr(), product.as_ptr(), src_store.as_ptr(), output.as_ptr());
        assert_eq!(rc, 0);
        assert!(std::fs::read_to_string(&output_list).unwrap().contains("/a.txt"));

        let failed_list = src_dir.path().join("failed.list");
        let dest_store = CString::new(dst_dir.path().to_str().unwrap()).unwrap();
        let failed = CString::new(failed_list.to_str().unwrap()).unwrap();
        let rc = iopx_backup(product.as_ptr(), src_store.as_ptr(), product.as_ptr(), dest_store.as_ptr(), output.as_ptr(), failed.as_ptr());
        assert_eq!(rc, 0);
        assert_eq!(std::fs::read(dst_dir.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn hex_uuid_round_trips() {
        let uuid = crate::location::Uuid([0xAB; 16]);
        let parsed = parse_hex_uuid(&uuid.to_hex_string()).unwrap();
        assert_eq!(parsed, uuid);
    }
}
