//! Fixture corpus for the tolerant decoder.
//!
//! Every `tests/fixtures/decoder/<name>.txt` is raw model output. A sibling
//! `<name>.json` holds the value it must decode to; a sibling `<name>.fail`
//! marks output that must be rejected with the raw text preserved.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use cotflow_extraction::decode;

fn corpus_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/decoder")
}

fn inputs() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(corpus_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();
    files
}

#[test]
fn test_corpus_is_not_empty() {
    let files = inputs();
    assert!(files.len() >= 8, "expected a corpus, found {files:?}");
}

#[test]
fn test_corpus_decodes_to_expected_values() {
    for input in inputs() {
        let raw = fs::read_to_string(&input).unwrap();
        let expected = input.with_extension("json");
        let failing = input.with_extension("fail");
        assert!(
            expected.exists() != failing.exists(),
            "{} needs exactly one of .json or .fail",
            input.display()
        );

        let decoded = decode(&raw);
        if failing.exists() {
            let err = decoded.expect_err(&format!("{} should not decode", input.display()));
            assert_eq!(err.raw(), raw, "{} lost its raw text", input.display());
            continue;
        }

        let want: Value = serde_json::from_str(&fs::read_to_string(&expected).unwrap()).unwrap();
        let got = decoded.unwrap_or_else(|e| panic!("{} failed: {e}", input.display()));
        assert_eq!(got.value, want, "{}", input.display());
    }
}

#[test]
fn test_clean_fixture_needs_no_repair() {
    let raw = fs::read_to_string(corpus_dir().join("clean.txt")).unwrap();
    assert!(!decode(&raw).unwrap().was_repaired());
}
