use std::fmt::Display;

/// Ashcache errors.
///
/// The cache itself never fails: oversize entries, misses, collisions and
/// stale positions are silent by design. Errors only surface from the
/// snapshot codec and the iterator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A snapshot I/O operation failed. `stage` names the step (open, write,
    /// persist, read, ...) so callers can tell a half-written temp file from
    /// an unreadable source.
    Snapshot {
        stage: &'static str,
        detail: String,
    },
    /// A snapshot file was built for a different capacity than the caller
    /// expects. Both sides are reported in bytes.
    CapacityMismatch {
        file_max_bytes: u64,
        expected_max_bytes: u64,
    },
    /// Snapshot contents failed structural validation.
    Corrupt(String),
    /// `value()` was called on an iterator that already reached the end.
    IterationFinished,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Snapshot { stage, detail } => {
                write!(f, "snapshot {stage} failed: {detail}")
            }
            Error::CapacityMismatch {
                file_max_bytes,
                expected_max_bytes,
            } => write!(
                f,
                "snapshot holds maxBytes={file_max_bytes}; caller expects {expected_max_bytes}"
            ),
            Error::Corrupt(msg) => write!(f, "corrupt snapshot: {msg}"),
            Error::IterationFinished => {
                write!(f, "iterator reached the last element")
            }
        }
    }
}

impl Error {
    /// Wraps an I/O error with the snapshot stage that produced it.
    pub(crate) fn snapshot(stage: &'static str, err: std::io::Error) -> Self {
        Error::Snapshot {
            stage,
            detail: err.to_string(),
        }
    }
}

/// An ashcache Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_stage() {
        let err = Error::snapshot(
            "open",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        let msg = err.to_string();
        assert!(msg.contains("open"), "stage missing from {msg:?}");
        assert!(msg.contains("no such file"), "detail missing from {msg:?}");
    }

    #[test]
    fn test_capacity_mismatch_reports_both_sides() {
        let err = Error::CapacityMismatch {
            file_max_bytes: 128,
            expected_max_bytes: 256,
        };
        let msg = err.to_string();
        assert!(msg.contains("128") && msg.contains("256"));
    }
}
