//! Shared helpers for tests across the workspace.

use camino::Utf8PathBuf;
use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::types::SessionId;

/// Check whether tests against real HTTP backends should run.
///
/// `COTFLOW_SKIP_LLM_TESTS=1` always disables them;
/// `COTFLOW_REAL_LLM_TESTS=1` enables them.
#[must_use]
pub fn llm_tests_enabled() -> bool {
    let flag = |name: &str| {
        std::env::var(name)
            .ok()
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };
    !flag("COTFLOW_SKIP_LLM_TESTS") && flag("COTFLOW_REAL_LLM_TESTS")
}

/// A temporary state directory with a UTF-8 path.
pub struct TempStateDir {
    _dir: TempDir,
    pub path: Utf8PathBuf,
}

impl TempStateDir {
    /// # Panics
    ///
    /// Panics if the temp directory cannot be created or is not UTF-8.
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .expect("temp dir path is UTF-8");
        Self { _dir: dir, path }
    }
}

impl Default for TempStateDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a session id, panicking on invalid input.
///
/// # Panics
///
/// Panics if `raw` is not a valid session id.
#[must_use]
pub fn session_id(raw: &str) -> SessionId {
    SessionId::parse(raw).expect("valid test session id")
}

/// Convert a `json!({...})` literal into a map.
///
/// # Panics
///
/// Panics if `value` is not an object.
#[must_use]
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected JSON object, got {other}"),
    }
}
