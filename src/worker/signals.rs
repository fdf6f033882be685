//! Signal handling inside worker processes.
//!
//! The handler is a plain `extern "C"` function touching only statics, so a
//! worker can install it no matter how it was created. It logs receipt and
//! raises a flag; it never unwinds the task.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static INTERRUPT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signum: libc::c_int) {
    match signum {
        libc::SIGTERM => TERMINATE.store(true, Ordering::SeqCst),
        libc::SIGINT => INTERRUPT.store(true, Ordering::SeqCst),
        _ => {}
    }
    log_receipt(signum);
}

// Async-signal-safe: fixed buffer and a raw write(2).
fn log_receipt(signum: libc::c_int) {
    const PREFIX: &[u8] = b"strategy worker received signal ";
    let mut buf = [0u8; 64];
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut len = PREFIX.len();

    let mut digits = [0u8; 12];
    let mut n = signum.unsigned_abs();
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let digits = &digits[i..];
    buf[len..len + digits.len()].copy_from_slice(digits);
    len += digits.len();
    buf[len] = b'\n';
    len += 1;

    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
    }
}

/// Installs the logging handler for SIGTERM and SIGINT and clears old flags.
pub fn install() -> io::Result<()> {
    TERMINATE.store(false, Ordering::SeqCst);
    INTERRUPT.store(false, Ordering::SeqCst);
    for signum in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

pub fn interrupt_requested() -> bool {
    INTERRUPT.load(Ordering::SeqCst)
}
