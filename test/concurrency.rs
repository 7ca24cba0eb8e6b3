//! Concurrency Tests
//!
//! Many threads racing on first loads, first stub builds, and unloads that
//! overlap running native calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dynffi::ffi::{
    library_filename, CallingConvention, DynamicInvoker, ErrorKind, SignatureKey, TypeDescriptor,
    UnloadPolicy, Value,
};

const THREADS: usize = 16;

fn fixture(name: &str) -> Option<PathBuf> {
    let path = Path::new(env!("DYNFFI_FIXTURE_DIR")).join(library_filename(name));
    if path.exists() {
        Some(path)
    } else {
        eprintln!("skipping: fixture {} was not built", path.display());
        None
    }
}

#[test]
fn test_concurrent_first_load_opens_once() {
    let Some(lib) = fixture("sum") else { return };
    let invoker = Arc::new(DynamicInvoker::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let invoker = Arc::clone(&invoker);
            let barrier = Arc::clone(&barrier);
            let lib = lib.clone();
            thread::spawn(move || {
                barrier.wait();
                invoker.registry().load(&lib).unwrap()
            })
        })
        .collect();

    let loaded: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(loaded.iter().all(|h| Arc::ptr_eq(h, &loaded[0])));
    assert_eq!(invoker.registry().len(), 1);

    drop(loaded);
    assert_eq!(invoker.reset().unwrap(), 1);
}

#[test]
fn test_concurrent_calls_share_one_stub() {
    let Some(lib) = fixture("sum") else { return };
    let invoker = Arc::new(DynamicInvoker::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS as i32)
        .map(|i| {
            let invoker = Arc::clone(&invoker);
            let barrier = Arc::clone(&barrier);
            let lib = lib.clone();
            thread::spawn(move || {
                barrier.wait();
                let function = if i % 2 == 0 { "sum" } else { "difference" };
                let result: i32 =
                    unsafe { invoker.invoke_typed(&lib, function, &[i.into(), 1.into()]) }.unwrap();
                (i, result)
            })
        })
        .collect();

    for handle in handles {
        let (i, result) = handle.join().unwrap();
        let expected = if i % 2 == 0 { i + 1 } else { i - 1 };
        assert_eq!(result, expected);
    }

    let key = SignatureKey::new(
        CallingConvention::Cdecl,
        TypeDescriptor::Int32,
        vec![TypeDescriptor::Int32, TypeDescriptor::Int32],
    );
    assert!(invoker.stubs().contains(&key));
    let stats = invoker.stubs().stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.lookups, THREADS as u64);

    invoker.reset().unwrap();
}

#[test]
fn test_unload_during_call_defers_close() {
    let Some(lib) = fixture("sum") else { return };
    let invoker = Arc::new(DynamicInvoker::new());

    let caller = {
        let invoker = Arc::clone(&invoker);
        let lib = lib.clone();
        thread::spawn(move || unsafe {
            invoker.invoke_typed::<i32>(&lib, "slow_sum", &[3.into(), 4.into(), 300.into()])
        })
    };

    thread::sleep(Duration::from_millis(100));
    invoker.reset_library(&lib, UnloadPolicy::IgnoreMissing).unwrap();

    assert_eq!(caller.join().unwrap().unwrap(), 7);
    assert!(invoker.registry().get(&lib).is_none());
}

#[test]
fn test_reload_waits_for_deferred_close() {
    let (Some(sum), Some(mul)) = (fixture("sum"), fixture("mul")) else { return };
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join(library_filename("target"));
    fs::copy(&sum, &target).unwrap();

    let invoker = Arc::new(DynamicInvoker::new());
    let caller = {
        let invoker = Arc::clone(&invoker);
        let target = target.clone();
        thread::spawn(move || unsafe {
            invoker.invoke_typed::<i32>(&target, "slow_sum", &[3.into(), 4.into(), 500.into()])
        })
    };

    thread::sleep(Duration::from_millis(100));
    invoker.reset_library(&target, UnloadPolicy::Strict).unwrap();

    let staged = dir.path().join("staged.tmp");
    fs::copy(&mul, &staged).unwrap();
    fs::rename(&staged, &target).unwrap();

    // The old image is still mapped by the running call, so the loader would
    // hand it back under the new handle
    let early = unsafe {
        invoker.invoke_typed::<f64>(&target, "multiply", &[9.2.into(), 3.4.into()])
    };
    match early {
        Err(e) => {
            assert_eq!(e.kind(), ErrorKind::LibraryLoadFailed, "{}", e);
            assert!(e.to_string().contains("close pending"), "{}", e);
            assert!(invoker.registry().get(&target).is_none());
        }
        Ok(product) => {
            assert!(caller.is_finished(), "reloaded while the old image was in use");
            assert!((product - 9.2 * 3.4).abs() < 1e-9);
        }
    }

    assert_eq!(caller.join().unwrap().unwrap(), 7);
    assert!(!invoker.registry().is_close_pending(&target));

    let product: f64 =
        unsafe { invoker.invoke_typed(&target, "multiply", &[9.2.into(), 3.4.into()]) }.unwrap();
    assert!((product - 9.2 * 3.4).abs() < 1e-9);

    let err = unsafe { invoker.invoke_typed::<i32>(&target, "sum", &[2.into(), 5.into()]) }
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);

    invoker.reset().unwrap();
}

#[test]
fn test_calls_racing_resets_fail_cleanly() {
    let Some(lib) = fixture("sum") else { return };
    let invoker = Arc::new(DynamicInvoker::new());
    let stop = Arc::new(AtomicBool::new(false));

    let resetter = {
        let invoker = Arc::clone(&invoker);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                invoker.reset().unwrap();
                thread::yield_now();
            }
        })
    };

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let invoker = Arc::clone(&invoker);
            let lib = lib.clone();
            thread::spawn(move || {
                let mut completed = 0;
                for _ in 0..200 {
                    let args = [Value::Int32(2), Value::Int32(5)];
                    match unsafe { invoker.invoke(&lib, "sum", TypeDescriptor::Int32, &args) } {
                        Ok(value) => {
                            assert_eq!(value, Some(Value::Int32(7)));
                            completed += 1;
                        }
                        // Retired between load and symbol lookup, or reloaded while
                        // another caller still held the retired image
                        Err(e) => assert!(
                            matches!(
                                e.kind(),
                                ErrorKind::LibraryNotLoaded | ErrorKind::LibraryLoadFailed
                            ),
                            "unexpected error: {}",
                            e
                        ),
                    }
                }
                completed
            })
        })
        .collect();

    let completed: usize = callers.into_iter().map(|h| h.join().unwrap()).sum();
    stop.store(true, Ordering::Relaxed);
    resetter.join().unwrap();

    assert!(completed > 0);
    invoker.reset().unwrap();
}
