//! Contention tests against the Unix backend.
//!
//! Each runtime stands in for a separate process: runtimes never share
//! bootstrap state, only the named objects under a common root.

use std::fs;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use nsmutex_core::{NamespaceConfig, NamespaceError, SystemError, SystemRuntime};
use tempfile::TempDir;

fn runtime(root: &TempDir) -> SystemRuntime {
    SystemRuntime::system(NamespaceConfig::with_root(root.path()))
}

#[test]
fn test_pool_mutex_single_owner() {
    const WORKERS: usize = 8;
    const ROUNDS: usize = 25;

    let root = tempfile::tempdir().unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let rt = runtime(&root);
            let inside = Arc::clone(&inside);
            let completed = Arc::clone(&completed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let guard = rt.take_pool_mutex("x").expect("acquire");
                    let owners = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(owners, 1, "two owners inside the critical section");
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.release();
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("worker panicked");
    }
    assert_eq!(completed.load(Ordering::SeqCst), WORKERS * ROUNDS);
}

#[test]
fn test_installation_mutex_blocks_second_thread() {
    let root = tempfile::tempdir().unwrap();
    let first = runtime(&root);
    let second = runtime(&root);

    let guard = first.take_installation_mutex().unwrap();
    let released = Arc::new(AtomicBool::new(false));

    let observed = Arc::clone(&released);
    let waiter = thread::spawn(move || {
        let guard = second.take_installation_mutex().unwrap();
        let was_released = observed.load(Ordering::SeqCst);
        guard.release();
        was_released
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished(), "second caller did not block");

    released.store(true, Ordering::SeqCst);
    guard.release();
    assert!(waiter.join().unwrap(), "second caller acquired before release");
}

#[test]
fn test_case_differing_pools_do_not_contend() {
    let root = tempfile::tempdir().unwrap();
    let rt = Arc::new(runtime(&root));

    let held = rt.take_pool_mutex("Local").unwrap();

    let (tx, rx) = mpsc::channel();
    let other = Arc::clone(&rt);
    thread::spawn(move || {
        let guard = other.take_pool_mutex("local").unwrap();
        let name = guard.name().clone();
        guard.release();
        let _ = tx.send(name);
    });

    let name = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("\"local\" blocked behind \"Local\"");
    assert_ne!(&name, held.name());
    held.release();
}

#[test]
fn test_nfc_equivalent_pools_contend() {
    let root = tempfile::tempdir().unwrap();
    let rt = Arc::new(runtime(&root));

    let held = rt.take_pool_mutex("caf\u{00e9}").unwrap();

    let (tx, rx) = mpsc::channel();
    let other = Arc::clone(&rt);
    thread::spawn(move || {
        let guard = other.take_pool_mutex("cafe\u{0301}").unwrap();
        guard.release();
        let _ = tx.send(());
    });

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    held.release();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("waiter never acquired after release");
}

#[test]
fn test_concurrent_bootstrap_single_namespace() {
    const RUNTIMES: usize = 8;

    let root = tempfile::tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(RUNTIMES));

    let handles: Vec<_> = (0..RUNTIMES)
        .map(|_| {
            let rt = runtime(&root);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                rt.ensure_ready()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().expect("bootstrap failed");
    }

    let mut entries: Vec<String> = fs::read_dir(root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec![".Wintun.ns.lock", "Wintun.ns"]);
}

#[test]
fn test_bootstrap_survives_namespace_teardown() {
    let root = tempfile::tempdir().unwrap();
    let platform = nsmutex_core::UnixPlatform::new(root.path());
    let stop = Arc::new(AtomicBool::new(false));

    // Keep tearing the namespace down and recreating it
    let churn = {
        let stop = Arc::clone(&stop);
        let rt = runtime(&root);
        let platform = platform.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let _ = rt.ensure_ready();
                rt.shutdown();
                let _ = platform.remove_namespace("Wintun");
            }
        })
    };

    for _ in 0..50 {
        let rt = runtime(&root);
        rt.ensure_ready().expect("bootstrap failed during churn");
        assert!(rt.is_ready());
    }

    stop.store(true, Ordering::SeqCst);
    churn.join().unwrap();
}

#[test]
fn test_bootstrap_recovers_namespace_without_marker() {
    let root = tempfile::tempdir().unwrap();
    let rt = runtime(&root);
    rt.take_pool_mutex("pool").unwrap().release();
    rt.shutdown();

    // Left behind by a teardown that died halfway
    fs::remove_file(root.path().join("Wintun.ns").join(".boundary")).unwrap();

    let config = NamespaceConfig {
        max_namespace_retries: Some(3),
        ..NamespaceConfig::with_root(root.path())
    };
    let rt = SystemRuntime::system(config);
    rt.ensure_ready().expect("bootstrap stuck on stale namespace");
    assert_eq!(rt.stats().namespace_retries, 1);

    let guard = rt.take_pool_mutex("pool").unwrap();
    assert!(!guard.was_abandoned());
    guard.release();
}

#[test]
fn test_shared_root_refused_before_squat_is_touched() {
    use std::os::unix::fs::PermissionsExt;

    let parent = tempfile::tempdir().unwrap();
    let shared = parent.path().join("shared");
    fs::create_dir(&shared).unwrap();
    fs::set_permissions(&shared, fs::Permissions::from_mode(0o1777)).unwrap();
    fs::create_dir(shared.join("Wintun.ns")).unwrap();
    fs::write(shared.join("Wintun.ns").join("junk"), b"x").unwrap();

    let rt = SystemRuntime::system(NamespaceConfig::with_root(&shared));
    assert!(matches!(
        rt.ensure_ready(),
        Err(NamespaceError::Bootstrap(SystemError::AccessDenied))
    ));
    assert_eq!(fs::read_dir(&shared).unwrap().count(), 1);

    // The same squat cannot exist under a principal-private root
    let private = parent.path().join("private");
    let rt = SystemRuntime::system(NamespaceConfig::with_root(&private));
    rt.ensure_ready().unwrap();
    let mode = fs::metadata(&private).unwrap().permissions().mode();
    assert_eq!(mode & 0o077, 0);
}

#[test]
fn test_abandoned_by_killed_process() {
    let root = tempfile::tempdir().unwrap();
    let config = NamespaceConfig::with_root(root.path());
    let config_path = root.path().join("nsmutex.json");
    fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

    let rt = SystemRuntime::system(config);
    let name = rt.pool_mutex_name("victim").unwrap();
    let lock_file = root
        .path()
        .join("Wintun.ns")
        .join(format!("{}.lock", name.object()));

    let mut child = Command::new(env!("CARGO_BIN_EXE_nsmutex"))
        .arg("--config")
        .arg(&config_path)
        .args(["hold", "victim", "--seconds", "60"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn nsmutex");

    // Wait for the child to stamp the lock file
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let stamped = fs::read_to_string(&lock_file)
            .map(|s| s.trim() == child.id().to_string())
            .unwrap_or(false);
        if stamped {
            break;
        }
        assert!(Instant::now() < deadline, "child never acquired the mutex");
        thread::sleep(Duration::from_millis(20));
    }

    child.kill().unwrap();
    child.wait().unwrap();

    let guard = rt.take_pool_mutex("victim").unwrap();
    assert!(guard.was_abandoned());
    assert_eq!(rt.stats().abandoned, 1);
    guard.release();

    // A clean release is not reported as abandoned
    let guard = rt.take_pool_mutex("victim").unwrap();
    assert!(!guard.was_abandoned());
    guard.release();
}
