//! Error-handling utilities.

use anyhow::Error;
use tracing::{debug, error};

/// Log an error, plus all the underlying "causes" (ie, wrapped errors). The
/// backtrace is only interesting when debugging, so we log it at that level.
pub(crate) fn log_causes_and_backtrace(err: &Error) {
    error!("{}", err);
    for cause in err.chain().skip(1) {
        error!("  caused by: {}", cause);
    }
    debug!("backtrace:\n{}", err.backtrace());
}
