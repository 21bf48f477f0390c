use std::path::Path;

/// The embedded Bibledit kernel as seen from the shell.
///
/// The kernel owns the local web server and the editing engine; the shell only
/// starts it, asks where it listens and exchanges a few strings with it.
/// Implementations must be cheap to call from a timer tick.
pub trait Kernel: Send + Sync + 'static {
    /// Copy bundled read-only resources into the writable root. The copy may
    /// continue on kernel threads after this returns.
    fn initialize(&self, resources: &Path, writable_root: &Path);

    /// Start listening. The kernel only acts on the first call.
    fn start(&self);

    /// The negotiated port, or `None` while negotiation has not completed.
    fn network_port(&self) -> Option<String>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Release kernel resources. Only valid once `is_running` reports false.
    fn shutdown(&self);

    /// A URL the kernel wants opened in the system browser, or an empty string.
    fn external_url(&self) -> String;

    /// The passage the user is looking at, as a companion-app reference.
    /// Empty when there is nothing to share.
    fn reference_for_companion(&self) -> String;

    /// Navigate to a reference received from the companion app.
    fn put_reference_from_companion(&self, reference: &str);
}

#[cfg(feature = "native-kernel")]
pub use native::NativeKernel;

#[cfg(feature = "native-kernel")]
mod native {
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;
    use std::path::Path;
    use std::sync::Once;

    use super::Kernel;

    extern "C" {
        fn bibledit_initialize_library(package: *const c_char, webroot: *const c_char);
        fn bibledit_start_library();
        fn bibledit_get_network_port() -> *const c_char;
        fn bibledit_stop_library();
        fn bibledit_is_running() -> bool;
        fn bibledit_shutdown_library();
        fn bibledit_get_external_url() -> *const c_char;
        fn bibledit_get_reference_for_accordance() -> *const c_char;
        fn bibledit_put_reference_from_accordance(reference: *const c_char);
    }

    static INITIALIZE: Once = Once::new();

    /// Kernel backed by the C entry points of the linked Bibledit library.
    #[derive(Debug, Default)]
    pub struct NativeKernel {
        _private: (),
    }

    impl NativeKernel {
        pub fn new() -> Self {
            Self::default()
        }
    }

    /// Copy a kernel-owned C string. The kernel keeps ownership of the buffer.
    fn from_kernel_str(ptr: *const c_char) -> String {
        if ptr.is_null() {
            return String::new();
        }
        // SAFETY: non-null pointers returned by the kernel reference a
        // null-terminated buffer that stays valid until the next call.
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    }

    fn to_kernel_str(s: &str) -> CString {
        CString::new(s).unwrap_or_else(|_| {
            let sanitized: String = s.chars().filter(|&c| c != '\0').collect();
            CString::new(sanitized).unwrap_or_default()
        })
    }

    impl Kernel for NativeKernel {
        fn initialize(&self, resources: &Path, writable_root: &Path) {
            INITIALIZE.call_once(|| {
                let package = to_kernel_str(&resources.to_string_lossy());
                let webroot = to_kernel_str(&writable_root.to_string_lossy());
                // SAFETY: both pointers are valid C strings for the duration of the call.
                unsafe { bibledit_initialize_library(package.as_ptr(), webroot.as_ptr()) }
            });
        }

        fn start(&self) {
            // SAFETY: no arguments; the kernel deduplicates repeated starts.
            unsafe { bibledit_start_library() }
        }

        fn network_port(&self) -> Option<String> {
            // SAFETY: returns a kernel-owned string or null.
            let port = from_kernel_str(unsafe { bibledit_get_network_port() });
            if port.is_empty() {
                None
            } else {
                Some(port)
            }
        }

        fn stop(&self) {
            // SAFETY: no arguments.
            unsafe { bibledit_stop_library() }
        }

        fn is_running(&self) -> bool {
            // SAFETY: no arguments.
            unsafe { bibledit_is_running() }
        }

        fn shutdown(&self) {
            // SAFETY: no arguments; callers wait for `is_running` to clear first.
            unsafe { bibledit_shutdown_library() }
        }

        fn external_url(&self) -> String {
            // SAFETY: returns a kernel-owned string or null.
            from_kernel_str(unsafe { bibledit_get_external_url() })
        }

        fn reference_for_companion(&self) -> String {
            // SAFETY: returns a kernel-owned string or null.
            from_kernel_str(unsafe { bibledit_get_reference_for_accordance() })
        }

        fn put_reference_from_companion(&self, reference: &str) {
            let reference = to_kernel_str(reference);
            // SAFETY: `reference` is a valid C string for the duration of the call.
            unsafe { bibledit_put_reference_from_accordance(reference.as_ptr()) }
        }
    }
}
