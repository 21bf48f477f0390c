//! C-compatible FFI wrappers around bibledit-core for the macOS host.
//!
//! The Swift side owns the window, the web view and the distributed
//! notification observer. It creates one shell handle at launch, polls it for
//! events from its main-loop timer and forwards companion references into it.
//!
//! All functions use C strings for input/output and JSON encoding for events.
//! Callers must free returned strings with `bibledit_free_string`.
//!
//! All extern "C" functions are wrapped in `ffi_catch` so Rust panics never
//! cross the FFI boundary. Panic payloads are logged before returning the
//! fallback value.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use bibledit_core::kernel::NativeKernel;
use bibledit_core::paths::LaunchPaths;
use bibledit_core::readiness::{HttpProbe, ReadinessState};
use bibledit_core::settings::ShellSettings;
use bibledit_core::{Shell, ShellEvent};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Run `f` inside `catch_unwind`, logging the panic payload before returning the
/// fallback value.
fn ffi_catch<T>(fallback: T, f: impl FnOnce() -> T + std::panic::UnwindSafe) -> T {
    match catch_unwind(f) {
        Ok(v) => v,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            log::error!("FFI panic caught: {}", msg);
            fallback
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_rust_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: Caller guarantees `ptr` is a valid, null-terminated C string
    // whose memory remains valid for the duration of this call.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(String::from)
}

fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => {
            log::warn!(
                "String contains interior NUL bytes, sanitizing ({} chars)",
                s.len()
            );
            let sanitized: String = s.chars().filter(|&c| c != '\0').collect();
            CString::new(sanitized).unwrap_or_default().into_raw()
        }
    }
}

// ---------------------------------------------------------------------------
// Memory management and logging
// ---------------------------------------------------------------------------

/// Free a string previously returned by a `bibledit_*` function.
#[no_mangle]
pub extern "C" fn bibledit_free_string(s: *mut c_char) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            if !s.is_null() {
                // SAFETY: `s` was previously returned by `CString::into_raw` from
                // one of the `bibledit_*` functions, so it is valid to reclaim it.
                unsafe {
                    drop(CString::from_raw(s));
                }
            }
        }),
    );
}

/// Route `log` output to stderr, filtered by `RUST_LOG`. Safe to call twice.
#[no_mangle]
pub extern "C" fn bibledit_init_logging() {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            if env_logger::try_init().is_ok() {
                log::info!("Bibledit shell logging initialized");
            }
        }),
    );
}

// ---------------------------------------------------------------------------
// Shell handles
// ---------------------------------------------------------------------------

/// Inner data for a shell handle, stored in the global registry.
struct ShellInner {
    shell: Arc<Shell<NativeKernel>>,
    runtime: Arc<Runtime>,
    event_tx: mpsc::UnboundedSender<ShellEvent>,
    event_rx: parking_lot::Mutex<mpsc::UnboundedReceiver<ShellEvent>>,
}

/// Global registry mapping handle addresses to their inner data.
/// The pointer handed to C is only ever used as an opaque key.
fn shell_handle_registry() -> &'static parking_lot::Mutex<HashMap<usize, Arc<ShellInner>>> {
    static REGISTRY: OnceLock<parking_lot::Mutex<HashMap<usize, Arc<ShellInner>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| parking_lot::Mutex::new(HashMap::new()))
}

/// Look up a handle in the global registry and run `f` with the inner data.
/// Returns `default` if the handle is null or freed.
fn with_shell_handle<T>(
    handle: *mut ShellHandle,
    default: T,
    f: impl FnOnce(&ShellInner) -> T,
) -> T {
    if handle.is_null() {
        return default;
    }
    let key = handle as usize;
    let guard = shell_handle_registry().lock();
    match guard.get(&key) {
        Some(inner) => {
            let inner = Arc::clone(inner);
            drop(guard);
            f(&inner)
        }
        None => {
            log::warn!("Attempted to use invalid or freed shell handle");
            default
        }
    }
}

/// Opaque handle token for the C API. Never dereferenced, only used as a key.
pub struct ShellHandle {
    _private: (),
}

/// Initialize the kernel and create the shell.
///
/// `resources` is the bundled, read-only webroot. `writable_root` may be null
/// to use the platform data directory. Returns null on failure. The caller
/// must free the handle with `bibledit_shell_free`.
#[no_mangle]
pub extern "C" fn bibledit_shell_new(
    resources: *const c_char,
    writable_root: *const c_char,
) -> *mut ShellHandle {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            let resources = match to_rust_str(resources) {
                Some(s) => PathBuf::from(s),
                None => return std::ptr::null_mut(),
            };
            let writable_root = to_rust_str(writable_root).map(PathBuf::from);

            let paths = match LaunchPaths::resolve(&resources, writable_root.as_deref()) {
                Ok(paths) => paths,
                Err(e) => {
                    log::error!("Cannot launch Bibledit: {}", e);
                    return std::ptr::null_mut();
                }
            };

            let runtime = match Runtime::new() {
                Ok(rt) => Arc::new(rt),
                Err(e) => {
                    log::error!("Failed to create Tokio runtime for shell: {}", e);
                    return std::ptr::null_mut();
                }
            };

            let settings = ShellSettings::load();
            let shell = match Shell::launch(Arc::new(NativeKernel::new()), settings, &paths) {
                Ok(shell) => shell,
                Err(e) => {
                    log::error!("Cannot launch Bibledit: {}", e);
                    return std::ptr::null_mut();
                }
            };

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let inner = Arc::new(ShellInner {
                shell,
                runtime,
                event_tx,
                event_rx: parking_lot::Mutex::new(event_rx),
            });

            let handle = Box::into_raw(Box::new(ShellHandle { _private: () }));
            shell_handle_registry().lock().insert(handle as usize, inner);
            handle
        }),
    )
}

/// Start probing the server and exchanging companion references.
#[no_mangle]
pub extern "C" fn bibledit_shell_start(handle: *mut ShellHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            with_shell_handle(handle, (), |inner| {
                let _guard = inner.runtime.enter();
                let probe = HttpProbe::new(inner.shell.settings().probe_timeout());
                inner
                    .shell
                    .spawn(probe, Arc::new(inner.event_tx.clone()));
            });
        }),
    );
}

/// Hand over a reference received on the companion notification topic.
#[no_mangle]
pub extern "C" fn bibledit_shell_receive_reference(
    handle: *mut ShellHandle,
    reference: *const c_char,
) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            let reference = match to_rust_str(reference) {
                Some(s) => s,
                None => return,
            };
            with_shell_handle(handle, (), |inner| {
                inner.shell.receive_reference(&reference);
            });
        }),
    );
}

/// Poll for the next event from the shell.
///
/// Returns a JSON string such as `{"type":"loadUrl","url":"..."}`, or null if
/// no events are pending. Browser requests are handled here and never
/// returned. The caller must free the returned string with
/// `bibledit_free_string`.
#[no_mangle]
pub extern "C" fn bibledit_shell_poll_event(handle: *mut ShellHandle) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            with_shell_handle(handle, std::ptr::null_mut(), |inner| {
                let mut rx = inner.event_rx.lock();
                while let Ok(event) = rx.try_recv() {
                    if let ShellEvent::OpenExternalUrl { url } = &event {
                        open_in_browser(url);
                        continue;
                    }
                    return match serde_json::to_string(&event) {
                        Ok(json) => to_c_string(&json),
                        Err(e) => {
                            log::error!("JSON serialization failed: {}", e);
                            to_c_string(
                                &serde_json::json!({
                                    "error": format!("serialization failed: {}", e)
                                })
                                .to_string(),
                            )
                        }
                    };
                }
                std::ptr::null_mut()
            })
        }),
    )
}

fn open_in_browser(url: &str) {
    match open::that_detached(url) {
        Ok(()) => log::info!("Opened {} in default browser", url),
        Err(e) => log::warn!("Failed to open {} in browser: {}", url, e),
    }
}

/// Whether the embedded server has answered.
#[no_mangle]
pub extern "C" fn bibledit_shell_is_ready(handle: *mut ShellHandle) -> bool {
    ffi_catch(
        false,
        AssertUnwindSafe(|| {
            with_shell_handle(handle, false, |inner| {
                inner.shell.readiness() == ReadinessState::Ready
            })
        }),
    )
}

/// Return the URL of the embedded server.
/// The caller must free the returned string with `bibledit_free_string`.
#[no_mangle]
pub extern "C" fn bibledit_shell_server_url(handle: *mut ShellHandle) -> *mut c_char {
    ffi_catch(
        std::ptr::null_mut(),
        AssertUnwindSafe(|| {
            with_shell_handle(handle, std::ptr::null_mut(), |inner| {
                to_c_string(inner.shell.endpoint().url().as_str())
            })
        }),
    )
}

/// Stop the kernel and wait (bounded) for it to finish.
///
/// Returns true when the kernel stopped in time or was already shut down.
#[no_mangle]
pub extern "C" fn bibledit_shell_shutdown(handle: *mut ShellHandle) -> bool {
    ffi_catch(
        false,
        AssertUnwindSafe(|| {
            with_shell_handle(handle, false, shutdown_inner)
        }),
    )
}

fn shutdown_inner(inner: &ShellInner) -> bool {
    match inner.runtime.block_on(inner.shell.shutdown()) {
        Some(outcome) => outcome == bibledit_core::teardown::ShutdownOutcome::Clean,
        None => true,
    }
}

/// Free a shell handle. Shuts the kernel down first if that has not happened.
#[no_mangle]
pub extern "C" fn bibledit_shell_free(handle: *mut ShellHandle) {
    ffi_catch(
        (),
        AssertUnwindSafe(|| {
            if handle.is_null() {
                return;
            }
            let key = handle as usize;
            // Remove from registry. The Arc keeps data alive if another
            // thread is currently using it via with_shell_handle.
            let inner = {
                let mut reg = shell_handle_registry().lock();
                reg.remove(&key)
            };
            if let Some(inner) = inner {
                shutdown_inner(&inner);
            } else {
                log::warn!("bibledit_shell_free called on already-freed handle");
                return;
            }
            // SAFETY: `handle` was allocated by `Box::into_raw` in `bibledit_shell_new`.
            // The registry removal above ensures this only happens once per handle.
            unsafe {
                drop(Box::from_raw(handle));
            }
        }),
    );
}
