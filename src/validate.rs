//! Validation of external inputs crossing the public boundary: filenames,
//! content IDs, passwords, block sizes, header values, and ports. Failures
//! are input errors, never security events.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, SearchError};

/// Maximum filename length in characters.
pub const MAX_FILENAME_LEN: usize = 255;

/// Accepted block sizes in KiB.
pub const VALID_BLOCK_SIZES_KIB: [u32; 5] = [64, 128, 256, 512, 1024];

/// Reserved Windows device names (case-insensitive, extension-stripped).
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

fn cid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=_-]{10,100}$").expect("static pattern"))
}

/// Validate a filename: length, separators, traversal, control characters,
/// reserved device names, optional extension allowlist.
pub fn validate_filename(name: &str, allowed_extensions: Option<&[String]>) -> Result<()> {
    if name.is_empty() {
        return Err(SearchError::InvalidQuery("filename is empty".into()));
    }
    if name.chars().count() > MAX_FILENAME_LEN {
        return Err(SearchError::InvalidQuery(format!(
            "filename exceeds {MAX_FILENAME_LEN} characters"
        )));
    }
    if name.contains("..") {
        return Err(SearchError::InvalidQuery("filename contains '..'".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(SearchError::InvalidQuery("filename contains a path separator".into()));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(SearchError::InvalidQuery("filename contains control characters".into()));
    }
    let stem = name.split_once('.').map(|(s, _)| s).unwrap_or(name);
    if RESERVED_NAMES.contains(&stem.to_ascii_lowercase().as_str()) {
        return Err(SearchError::InvalidQuery(format!("'{stem}' is a reserved name")));
    }
    if let Some(allowed) = allowed_extensions {
        let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)) {
            return Err(SearchError::InvalidQuery(format!("extension '{ext}' is not allowed")));
        }
    }
    Ok(())
}

/// Validate a directory path: non-empty, bounded components, no traversal.
pub fn validate_dir_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(SearchError::InvalidQuery("directory path is empty".into()));
    }
    if path.contains("..") {
        return Err(SearchError::InvalidQuery("directory path contains '..'".into()));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(SearchError::InvalidQuery("directory path contains control characters".into()));
    }
    Ok(())
}

/// Validate a content ID: 10..=100 chars against the CID shape.
pub fn validate_cid(cid: &str) -> Result<()> {
    if !cid_regex().is_match(cid) {
        return Err(SearchError::InvalidQuery(format!(
            "malformed content id ({} chars)",
            cid.chars().count()
        )));
    }
    Ok(())
}

/// Validate a password: 8..=128 chars, no NUL.
pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(8..=128).contains(&len) {
        return Err(SearchError::InvalidQuery("password must be 8..=128 characters".into()));
    }
    if password.contains('\0') {
        return Err(SearchError::InvalidQuery("password contains NUL".into()));
    }
    Ok(())
}

/// Validate a block size in KiB against the fixed set.
pub fn validate_block_size_kib(kib: u32) -> Result<()> {
    if !VALID_BLOCK_SIZES_KIB.contains(&kib) {
        return Err(SearchError::InvalidQuery(format!(
            "block size {kib} KiB is not one of {VALID_BLOCK_SIZES_KIB:?}"
        )));
    }
    Ok(())
}

/// Validate an HTTP header value: bounded, no CR/LF.
pub fn validate_header_value(value: &str) -> Result<()> {
    if value.len() > 8192 {
        return Err(SearchError::InvalidQuery("header value exceeds 8192 bytes".into()));
    }
    if value.contains('\r') || value.contains('\n') {
        return Err(SearchError::InvalidQuery("header value contains CR/LF".into()));
    }
    Ok(())
}

/// Validate a TCP port.
pub fn validate_port(port: u32) -> Result<()> {
    if !(1..=65535).contains(&port) {
        return Err(SearchError::InvalidQuery(format!("port {port} out of range")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_filenames_pass() {
        assert!(validate_filename("report.pdf", None).is_ok());
        assert!(validate_filename("notes", None).is_ok());
    }

    #[test]
    fn traversal_and_separators_fail() {
        assert!(validate_filename("../secret", None).is_err());
        assert!(validate_filename("a/b.txt", None).is_err());
        assert!(validate_filename("a\\b.txt", None).is_err());
    }

    #[test]
    fn control_chars_fail() {
        assert!(validate_filename("bad\u{0}name", None).is_err());
        assert!(validate_filename("bad\nname", None).is_err());
    }

    #[test]
    fn reserved_windows_names_fail() {
        assert!(validate_filename("CON", None).is_err());
        assert!(validate_filename("con.txt", None).is_err());
        assert!(validate_filename("lpt3.log", None).is_err());
        assert!(validate_filename("console.txt", None).is_ok());
    }

    #[test]
    fn overlong_filename_fails() {
        assert!(validate_filename(&"x".repeat(256), None).is_err());
        assert!(validate_filename(&"x".repeat(255), None).is_ok());
    }

    #[test]
    fn extension_allowlist_is_enforced() {
        let allowed = vec!["pdf".to_string(), "txt".to_string()];
        assert!(validate_filename("doc.pdf", Some(&allowed)).is_ok());
        assert!(validate_filename("doc.PDF", Some(&allowed)).is_ok());
        assert!(validate_filename("doc.exe", Some(&allowed)).is_err());
    }

    #[test]
    fn cid_shape_is_enforced() {
        assert!(validate_cid("bafybeigdyrzt5example").is_ok());
        assert!(validate_cid("short").is_err());
        assert!(validate_cid(&"a".repeat(101)).is_err());
        assert!(validate_cid("has spaces here!").is_err());
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("longenough").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"p".repeat(129)).is_err());
        assert!(validate_password("with\0nul").is_err());
    }

    #[test]
    fn block_sizes() {
        assert!(validate_block_size_kib(256).is_ok());
        assert!(validate_block_size_kib(100).is_err());
    }

    #[test]
    fn header_values() {
        assert!(validate_header_value("application/json").is_ok());
        assert!(validate_header_value("evil\r\ninjected: yes").is_err());
    }

    #[test]
    fn ports() {
        assert!(validate_port(8432).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(70_000).is_err());
    }
}
