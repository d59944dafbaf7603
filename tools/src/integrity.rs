//! Canonical content hashing and signature verification.
//!
//! `content_hash = SHA-256(canonical_manifest ‖ 0x00 ‖ sorted_file_table)`.
//! The canonical manifest serializes with sorted keys; the file table is a
//! newline-joined sequence of `path US sha256 US is_executable` rows in
//! lexicographic path order. A tool's optional signature line is excluded
//! from the hashed body, so signing a tool does not change its identity.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use kiwi_types::ToolManifest;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// Prefix of the optional first-line integrity signature.
pub const SIGNATURE_PREFIX: &str = "# kiwi-mcp:validated:";

/// Field separator inside a file-table row (ASCII unit separator).
const FIELD_SEP: char = '\x1f';

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("failed to read '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("malformed signature line: {0}")]
    MalformedSignature(String),
    #[error("cannot serialize manifest for '{tool_id}': {reason}")]
    Manifest { tool_id: String, reason: String },
}

/// A parsed `# kiwi-mcp:validated:…` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub validated_at: DateTime<Utc>,
    pub body_sha256: String,
}

/// Parse the signature line, if `line` is one.
#[must_use]
pub fn parse_signature(line: &str) -> Option<Signature> {
    let rest = line.trim_end().strip_prefix(SIGNATURE_PREFIX)?;
    let (timestamp, digest) = rest.rsplit_once(':')?;
    let validated_at = DateTime::parse_from_rfc3339(timestamp).ok()?.to_utc();
    (digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())).then(|| Signature {
        validated_at,
        body_sha256: digest.to_ascii_lowercase(),
    })
}

/// The hashed body: line endings normalized, signature line removed.
fn canonical_body(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    match normalized.split_once('\n') {
        Some((first, rest)) if parse_signature(first).is_some() => rest.to_string(),
        _ if parse_signature(&normalized).is_some() => String::new(),
        _ => normalized,
    }
}

fn read(path: &Path) -> Result<String, IntegrityError> {
    fs::read_to_string(path).map_err(|e| IntegrityError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

fn file_row(rel_path: &str, path: &Path) -> Result<String, IntegrityError> {
    let body = canonical_body(&read(path)?);
    let digest = hex::encode(Sha256::digest(body.as_bytes()));
    Ok(format!(
        "{rel_path}{FIELD_SEP}{digest}{FIELD_SEP}{}",
        is_executable(path)
    ))
}

/// The sorted file table for a tool path (single file or directory).
fn file_table(path: &Path) -> Result<String, IntegrityError> {
    if path.is_file() {
        let name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        return file_row(&name, path);
    }

    let mut rows = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| IntegrityError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        rows.push((rel.clone(), entry.path().to_path_buf()));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    let rows: Result<Vec<String>, IntegrityError> = rows
        .iter()
        .map(|(rel, path)| file_row(rel, path))
        .collect();
    Ok(rows?.join("\n"))
}

/// Serialize the manifest with sorted keys, excluding the hash itself.
fn canonical_manifest(manifest: &ToolManifest) -> Result<Vec<u8>, IntegrityError> {
    let mut stripped = manifest.clone();
    stripped.content_hash = String::new();
    let err = |reason: String| IntegrityError::Manifest {
        tool_id: manifest.tool_id.clone(),
        reason,
    };
    // Round-trip through Value: its object map is keyed by a sorted map,
    // which is exactly the canonical key order.
    let value = serde_json::to_value(&stripped).map_err(|e| err(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| err(e.to_string()))
}

/// Compute the canonical content hash for a tool.
pub fn content_hash(path: &Path, manifest: &ToolManifest) -> Result<String, IntegrityError> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_manifest(manifest)?);
    hasher.update([0u8]);
    hasher.update(file_table(path)?.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a tool file's signature line against its body.
///
/// `Ok(None)` when the file carries no signature; `Ok(Some(true))` when the
/// recomputed body hash matches the signed one.
pub fn verify_signature(path: &Path) -> Result<Option<bool>, IntegrityError> {
    let content = read(path)?;
    let Some(first_line) = content.lines().next() else {
        return Ok(None);
    };
    let Some(signature) = parse_signature(first_line) else {
        return Ok(None);
    };
    let body = canonical_body(&content);
    let digest = hex::encode(Sha256::digest(body.as_bytes()));
    Ok(Some(digest == signature.body_sha256))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiwi_types::{ToolManifest, ToolType};
    use sha2::{Digest, Sha256};

    use super::{content_hash, parse_signature, verify_signature};

    fn manifest(tool_id: &str) -> ToolManifest {
        ToolManifest {
            tool_id: tool_id.to_string(),
            tool_type: ToolType::Primitive,
            executor_id: None,
            category: "core".to_string(),
            version: semver::Version::new(1, 0, 0),
            config_schema: None,
            config: None,
            env_config: None,
            requires: Vec::new(),
            child_version_req: None,
            content_hash: String::new(),
        }
    }

    #[test]
    fn identical_content_hashes_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("subprocess.py");
        let b = dir.path().join("copy").join("subprocess.py");
        fs::create_dir_all(b.parent().unwrap()).unwrap();
        fs::write(&a, "# tool_type: primitive\nprint('hi')\n").unwrap();
        fs::write(&b, "# tool_type: primitive\nprint('hi')\n").unwrap();

        let m = manifest("subprocess");
        assert_eq!(
            content_hash(&a, &m).unwrap(),
            content_hash(&b, &m).unwrap()
        );
    }

    #[test]
    fn one_byte_change_changes_the_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tool.py");
        let m = manifest("tool");

        fs::write(&path, "print(1)\n").unwrap();
        let before = content_hash(&path, &m).unwrap();
        fs::write(&path, "print(2)\n").unwrap();
        let after = content_hash(&path, &m).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn manifest_change_changes_the_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tool.py");
        fs::write(&path, "print(1)\n").unwrap();

        let before = content_hash(&path, &manifest("tool")).unwrap();
        let mut bumped = manifest("tool");
        bumped.version = semver::Version::new(1, 0, 1);
        let after = content_hash(&path, &bumped).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn crlf_normalization_makes_hashes_portable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unix = dir.path().join("a.py");
        let dos = dir.path().join("b").join("a.py");
        fs::create_dir_all(dos.parent().unwrap()).unwrap();
        fs::write(&unix, "x = 1\ny = 2\n").unwrap();
        fs::write(&dos, "x = 1\r\ny = 2\r\n").unwrap();

        let m = manifest("a");
        assert_eq!(
            content_hash(&unix, &m).unwrap(),
            content_hash(&dos, &m).unwrap()
        );
    }

    #[test]
    fn signature_line_is_excluded_from_the_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("t.py");
        let signed = dir.path().join("s").join("t.py");
        fs::create_dir_all(signed.parent().unwrap()).unwrap();

        let body = "print('x')\n";
        let digest = hex::encode(Sha256::digest(body.as_bytes()));
        fs::write(&plain, body).unwrap();
        fs::write(
            &signed,
            format!("# kiwi-mcp:validated:2025-06-01T00:00:00Z:{digest}\n{body}"),
        )
        .unwrap();

        let m = manifest("t");
        assert_eq!(
            content_hash(&plain, &m).unwrap(),
            content_hash(&signed, &m).unwrap()
        );
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.py");
        let body = "print('x')\n";
        let digest = hex::encode(Sha256::digest(body.as_bytes()));
        fs::write(
            &path,
            format!("# kiwi-mcp:validated:2025-06-01T00:00:00Z:{digest}\n{body}"),
        )
        .unwrap();
        assert_eq!(verify_signature(&path).unwrap(), Some(true));

        fs::write(
            &path,
            format!("# kiwi-mcp:validated:2025-06-01T00:00:00Z:{digest}\nprint('tampered')\n"),
        )
        .unwrap();
        assert_eq!(verify_signature(&path).unwrap(), Some(false));
    }

    #[test]
    fn unsigned_file_has_no_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.py");
        std::fs::write(&path, "print('x')\n").unwrap();
        assert_eq!(verify_signature(&path).unwrap(), None);
    }

    #[test]
    fn parses_well_formed_signature_lines_only() {
        let digest = "a".repeat(64);
        let line = format!("# kiwi-mcp:validated:2025-06-01T12:30:00Z:{digest}");
        let sig = parse_signature(&line).expect("parse");
        assert_eq!(sig.body_sha256, digest);

        assert!(parse_signature("# kiwi-mcp:validated:not-a-date:abc").is_none());
        assert!(parse_signature("# something else").is_none());
        assert!(
            parse_signature(&format!("# kiwi-mcp:validated:2025-06-01T12:30:00Z:{}", "z".repeat(64)))
                .is_none()
        );
    }
}
