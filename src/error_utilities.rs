use std::io;

use tracing::error;

/// Log the last OS error with a note and hand it back for propagation
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Log the last OS error and hand it back for propagation
pub(crate) fn log_ret_last_os_err() -> io::Error {
    log_ret_last_os_err_with_note("")
}

/// Log the last OS error and swallow it, for use in `drop` paths
pub(crate) fn log_last_os_err() {
    let _ = log_ret_last_os_err_with_note("");
}

/// Returns an error representing the last OS error which occurred
pub(crate) fn last_error() -> io::Error {
    io::Error::last_os_error()
}
