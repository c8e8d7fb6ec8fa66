//! Exit code constants for the `cotflow` binary.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Operation completed successfully |
//! | 1 | `INTERNAL` | General/internal failure |
//! | 2 | `CLI_ARGS` | Invalid arguments, configuration or session state |
//! | 3 | `NOT_FOUND` | Session does not exist |
//! | 4 | `SESSION_FAILED` | Session ended in FAILED |
//! | 5 | `BLOCKED` | Step is missing prerequisite context |
//! | 9 | `ALREADY_EXECUTING` | Another caller holds the session |
//! | 10 | `TIMEOUT` | Backend call timed out |
//! | 70 | `BACKEND_FAILURE` | Completion or search backend failed |

/// Process exit code.
///
/// The numeric values are stable; scripts may branch on them.
///
/// ```rust
/// use cotflow_utils::exit_codes::ExitCode;
///
/// assert_eq!(ExitCode::SUCCESS.as_i32(), 0);
/// assert_eq!(ExitCode::from_i32(9), ExitCode::ALREADY_EXECUTING);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const INTERNAL: ExitCode = ExitCode(1);
    pub const CLI_ARGS: ExitCode = ExitCode(2);
    pub const NOT_FOUND: ExitCode = ExitCode(3);
    pub const SESSION_FAILED: ExitCode = ExitCode(4);
    pub const BLOCKED: ExitCode = ExitCode(5);
    pub const ALREADY_EXECUTING: ExitCode = ExitCode(9);
    pub const TIMEOUT: ExitCode = ExitCode(10);
    pub const BACKEND_FAILURE: ExitCode = ExitCode(70);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        Self(code)
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}
