use std::fmt;

pub type DResult<T> = Result<T, DriverError>;

/// A driver error: the native numeric code plus its message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: i32,
    pub text: String,
}

/// User requested cancel of current operation.
pub const CODE_CANCELLED: i32 = 1013;
/// Transaction has been heuristically committed.
pub const CODE_HEURISTIC_COMMIT: i32 = 24764;
/// Transaction has been heuristically rolled back.
pub const CODE_HEURISTIC_ROLLBACK: i32 = 24765;

/// Errors after which the session is unusable; the worker surfaces the
/// error, finishes the current response and exits at the loop boundary.
const FATAL_CODES: &[i32] = &[
    28,    // session killed
    1012,  // not logged on
    1041,  // internal error, hostdef extension missing
    3113,  // end-of-file on communication channel
    3114,  // not connected
    3127,  // no new operation allowed until active operation ends
    4031,  // unable to allocate shared memory
    24343, // user defined callback error, corrupts the bind array
    25402, // transaction must roll back
    25405, // transaction status unknown
    25408, // cannot safely replay call
    25425, // connection lost during rollback
    27101, // shared memory realm does not exist
];

impl DriverError {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        DriverError {
            code,
            text: text.into(),
        }
    }

    pub fn internal(text: impl Into<String>) -> Self {
        DriverError::new(-1, text)
    }

    pub fn cancelled() -> Self {
        DriverError::new(
            CODE_CANCELLED,
            "ORA-01013: user requested cancel of current operation",
        )
    }

    pub fn is_fatal(&self) -> bool {
        FATAL_CODES.contains(&self.code)
    }

    pub fn is_cancel(&self) -> bool {
        self.code == CODE_CANCELLED
    }

    pub fn is_heuristically_completed(&self) -> bool {
        self.code == CODE_HEURISTIC_COMMIT || self.code == CODE_HEURISTIC_ROLLBACK
    }

    /// Canonical event name, e.g. `ORA-01013`.
    pub fn ora_name(&self) -> String {
        format!("ORA-{:05}", self.code.max(0))
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.code, self.text)
    }
}

impl std::error::Error for DriverError {}

/// A warning-grade outcome: the call succeeded with info attached. The
/// worker logs it and treats the call as a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverWarning(pub DriverError);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fatal_set_is_closed() {
        assert!(DriverError::new(28, "session killed").is_fatal());
        assert!(DriverError::new(3113, "eof").is_fatal());
        assert!(DriverError::new(25405, "unknown state").is_fatal());
        assert!(!DriverError::new(1, "unique constraint").is_fatal());
        assert!(!DriverError::cancelled().is_fatal());
    }

    #[test]
    fn classification() {
        assert!(DriverError::cancelled().is_cancel());
        assert!(DriverError::new(24764, "").is_heuristically_completed());
        assert!(DriverError::new(24765, "").is_heuristically_completed());
        assert_eq!(DriverError::new(1013, "x").ora_name(), "ORA-01013");
    }
}
