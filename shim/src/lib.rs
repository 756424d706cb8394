//! Preloaded into the sandboxed child to interpose `dlopen`.
//!
//! Linux: loaded with `LD_PRELOAD`, exports `dlopen` and reaches the real
//! one through `dlsym(RTLD_NEXT, ..)`. Bare names are then searched as if
//! the shim had asked (see the Linux `dlopen` below).
//! macOS: loaded with `DYLD_INSERT_LIBRARIES`, registers a replacement in
//! the `__DATA,__interpose` section.
//!
//! All decisions live in `sandbridge::shim`; this crate only adapts the C
//! entry point.

use std::ffi::{CStr, c_char};
use std::sync::OnceLock;

use sandbridge::shim::ShimEnv;

fn shim_env() -> &'static ShimEnv {
    static ENV: OnceLock<ShimEnv> = OnceLock::new();
    ENV.get_or_init(ShimEnv::from_env)
}

/// # Safety
/// `filename` is null or points to a NUL-terminated string, as `dlopen`
/// requires of its caller.
unsafe fn requested_path<'a>(filename: *const c_char) -> Option<&'a CStr> {
    if filename.is_null() {
        None
    } else {
        // SAFETY: non-null and NUL-terminated per dlopen's contract.
        Some(unsafe { CStr::from_ptr(filename) })
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::{c_char, c_int, c_void};
    use std::sync::OnceLock;

    use sandbridge::shim::load_library;

    use super::{requested_path, shim_env};

    type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

    fn real_dlopen() -> Option<DlopenFn> {
        static REAL: OnceLock<Option<DlopenFn>> = OnceLock::new();
        *REAL.get_or_init(|| {
            // SAFETY: RTLD_NEXT lookup of a symbol name literal.
            let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, c"dlopen".as_ptr()) };
            if sym.is_null() {
                None
            } else {
                // SAFETY: the next `dlopen` in lookup order has this signature.
                Some(unsafe { std::mem::transmute::<*mut c_void, DlopenFn>(sym) })
            }
        })
    }

    /// # Safety
    /// Same contract as libc `dlopen`.
    ///
    /// glibc resolves a bare name (no `/`) against the DT_RUNPATH and
    /// `$ORIGIN` of the object that called `dlopen`. Through this wrapper
    /// that object is the shim, so a library found only via the caller's
    /// own RUNPATH is not found. Callers that pass full paths are unaffected.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
        let Some(real) = real_dlopen() else {
            eprintln!("sandbridge-shim: real dlopen not found");
            return std::ptr::null_mut();
        };
        // SAFETY: forwarded from our caller.
        let path = unsafe { requested_path(filename) };
        load_library(path, shim_env(), || unsafe { real(filename, flags) })
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::ffi::{c_char, c_int, c_void};

    use sandbridge::shim::load_library;

    use super::{requested_path, shim_env};

    /// # Safety
    /// Same contract as libc `dlopen`.
    pub unsafe extern "C" fn sandbridge_dlopen(
        filename: *const c_char,
        flags: c_int,
    ) -> *mut c_void {
        // SAFETY: forwarded from our caller.
        let path = unsafe { requested_path(filename) };
        // dyld does not apply an image's own interpose entries to that
        // image, so this reaches the system dlopen.
        load_library(path, shim_env(), || unsafe { libc::dlopen(filename, flags) })
    }

    #[repr(C)]
    struct Interpose {
        replacement: *const c_void,
        original: *const c_void,
    }

    // SAFETY: read-only function addresses consumed by dyld.
    unsafe impl Sync for Interpose {}

    #[used]
    #[unsafe(link_section = "__DATA,__interpose")]
    static INTERPOSE_DLOPEN: Interpose = Interpose {
        replacement: sandbridge_dlopen as *const c_void,
        original: libc::dlopen as *const c_void,
    };
}
