//! Mapping of `sqlx` errors onto [`MirrorError`].

use chainmirror_core::MirrorError;

/// SQLSTATE classes and codes worth retrying (Postgres), plus SQLite's
/// `SQLITE_BUSY` and `SQLITE_LOCKED` result codes.
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "53300", "57P01", "57P03", "5", "6"];

/// Returns `true` if `err` may go away on retry: I/O, TLS, pool exhaustion,
/// lost connections, serialization failures and deadlocks.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| code.starts_with("08") || TRANSIENT_CODES.contains(&&*code)),
        _ => false,
    }
}

pub(crate) fn db_error(context: &str, err: sqlx::Error) -> MirrorError {
    let message = format!("{context}: {err}");
    if is_transient(&err) {
        MirrorError::TransientStorage(message)
    } else {
        MirrorError::Storage(message)
    }
}
