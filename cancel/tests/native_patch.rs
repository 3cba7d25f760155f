//! Drives the real ELF backend through the public entry points, using this
//! test binary's own import of `getppid` as the patch target.

#![cfg(target_os = "linux")]

use std::sync::{Mutex, MutexGuard};

use ocicancel::{CancelError, Config, PatchTarget, Replacement};

const FAKE_PARENT: libc::pid_t = 0x5eed;

extern "C" fn fake_getppid() -> libc::pid_t {
    FAKE_PARENT
}

static LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn exe_name() -> String {
    let path = std::fs::read_link("/proc/self/exe").expect("read /proc/self/exe");
    path.file_name()
        .expect("exe has a file name")
        .to_string_lossy()
        .into_owned()
}

fn config(candidates: Vec<String>, symbols: &[&str]) -> Config {
    let replacements = symbols
        .iter()
        .map(|&symbol| unsafe { Replacement::new(symbol, fake_getppid as usize) })
        .collect();
    Config {
        primary: PatchTarget::new(candidates, replacements),
        secondary: None,
    }
}

#[test]
fn init_patches_first_loaded_candidate_and_teardown_restores() {
    let _guard = serial();
    let real_parent = unsafe { libc::getppid() };
    let addr = || std::hint::black_box(libc::getppid as usize);
    let real_addr = addr();

    let candidates = vec!["libclntsh.so.12.1".to_string(), exe_name()];
    ocicancel::init_with(config(candidates, &["getppid"])).expect("init");

    assert_eq!(ocicancel::primary_module(), Some(exe_name()));
    assert_eq!(unsafe { libc::getppid() }, FAKE_PARENT);
    assert_eq!(
        ocicancel::ensure_secondary_installed().expect("no secondary"),
        ocicancel::SecondaryState::Installed
    );

    // A second init leaves the existing patch alone.
    ocicancel::init_with(config(vec![exe_name()], &["getppid"])).expect("re-init");

    ocicancel::teardown().expect("teardown");
    assert_eq!(unsafe { libc::getppid() }, real_parent);
    assert_eq!(addr(), real_addr);
    assert_eq!(ocicancel::primary_module(), None);
    assert!(!ocicancel::secondary_installed());
}

#[test]
fn failed_init_rolls_back_and_leaves_nothing_installed() {
    let _guard = serial();
    let real_parent = unsafe { libc::getppid() };

    let err = ocicancel::init_with(config(
        vec![exe_name()],
        &["getppid", "ocicancel_no_such_import"],
    ))
    .unwrap_err();

    match err {
        CancelError::PatchFailed { symbol, .. } => assert_eq!(symbol, "ocicancel_no_such_import"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(unsafe { libc::getppid() }, real_parent);
    assert_eq!(ocicancel::primary_module(), None);
    assert!(matches!(
        ocicancel::ensure_secondary_installed(),
        Err(CancelError::NotInitialized)
    ));
}

#[test]
fn init_without_any_candidate_loaded_fails() {
    let _guard = serial();
    let err = ocicancel::init_with(config(
        vec!["libclntsh.so.12.1".to_string(), "libclntsh.so.11.1".to_string()],
        &["read"],
    ))
    .unwrap_err();
    assert!(matches!(err, CancelError::NoModuleFound { .. }), "{err:?}");
    ocicancel::teardown().expect("nothing to tear down");
}
