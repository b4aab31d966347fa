//! Thin `openssl-sys` shim for the two DTLS retransmission primitives that
//! `openssl`'s safe wrapper does not expose.
//!
//! `DTLSv1_get_timeout`/`DTLSv1_handle_timeout` are `SSL_ctrl`-based macros
//! in the C headers, not real functions, so there is nothing for the safe
//! crate to bind. This is the entire unsafe surface of the engine: two
//! `SSL_ctrl` calls with fixed control codes, mirroring what
//! `dtls/openssl.py` did with raw `ctypes` prototypes for the same pair.

use std::os::raw::{c_long, c_void};
use std::time::Duration;

use openssl::error::ErrorStack;
use openssl::foreign_types::ForeignTypeRef;
use openssl::ssl::SslRef;

// From openssl/ssl3.h: DTLS-specific SSL_ctrl commands.
const DTLS_CTRL_GET_TIMEOUT: std::os::raw::c_int = 73;
const DTLS_CTRL_HANDLE_TIMEOUT: std::os::raw::c_int = 74;

#[repr(C)]
struct Timeval {
    tv_sec: i64,
    tv_usec: i64,
}

/// Time until the next retransmission is due, or `None` if no
/// retransmission timer is currently armed (e.g. handshake not in
/// progress, or already complete).
pub(crate) fn dtls_get_timeout(ssl: &SslRef) -> Option<Duration> {
    let mut tv = Timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let set = unsafe {
        openssl_sys::SSL_ctrl(
            ssl.as_ptr(),
            DTLS_CTRL_GET_TIMEOUT,
            0,
            &mut tv as *mut Timeval as *mut c_void,
        )
    };
    if set == 0 {
        return None;
    }
    Some(Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1000))
}

/// Perform retransmission if the timer retrieved from
/// [`dtls_get_timeout`] has elapsed. `Ok(true)` if datagrams were
/// resent, `Ok(false)` if the timer had not actually expired yet.
pub(crate) fn dtls_handle_timeout(ssl: &SslRef) -> Result<bool, ErrorStack> {
    let ret: c_long = unsafe {
        openssl_sys::SSL_ctrl(
            ssl.as_ptr(),
            DTLS_CTRL_HANDLE_TIMEOUT,
            0,
            std::ptr::null_mut(),
        )
    };
    match ret {
        1 => Ok(true),
        0 => Ok(false),
        _ => Err(ErrorStack::get()),
    }
}
