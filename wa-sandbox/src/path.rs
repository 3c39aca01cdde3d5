use crate::backup::BACKUP_DIR_NAME;
use crate::error::{Result, SandboxError};
use std::path::{Path, PathBuf};

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Turns a caller-supplied relative path into a clean relative `PathBuf`.
///
/// Pure string work, never touches the filesystem. Absolute prefixes and
/// drive letters are stripped, reserved characters removed, `.` and empty
/// segments dropped. Any `..` segment rejects the whole path.
pub fn sanitize_relative_path(raw: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for (idx, segment) in raw.split(['/', '\\']).enumerate() {
        let segment = segment.trim();
        if segment == ".." {
            return Err(SandboxError::validation(format!(
                "path traversal is not allowed: {raw:?}"
            )));
        }
        let segment = if idx == 0 { strip_drive(segment) } else { segment };
        let cleaned: String = segment
            .chars()
            .filter(|c| !c.is_control() && !RESERVED_CHARS.contains(c))
            .collect();
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || cleaned == "." {
            continue;
        }
        if cleaned.chars().all(|c| c == '.') {
            return Err(SandboxError::validation(format!(
                "path traversal is not allowed: {raw:?}"
            )));
        }
        if cleaned == BACKUP_DIR_NAME {
            return Err(SandboxError::validation(format!(
                "{BACKUP_DIR_NAME} is reserved for file history"
            )));
        }
        out.push(cleaned);
    }
    if out.as_os_str().is_empty() {
        return Err(SandboxError::validation(format!(
            "relative path is empty: {raw:?}"
        )));
    }
    Ok(out)
}

fn strip_drive(segment: &str) -> &str {
    let bytes = segment.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return &segment[2..];
    }
    segment
}

/// Resolves `relative` under `base` and proves the result stays inside it.
///
/// The comparison runs on canonical paths, so symlinks that point outside
/// the base directory are rejected even though the string looks harmless.
pub async fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf> {
    let clean = sanitize_relative_path(relative)?;
    let canonical_base = tokio::fs::canonicalize(base).await.map_err(|e| {
        SandboxError::validation(format!(
            "asset directory {} is not accessible: {e}",
            base.display()
        ))
    })?;
    let resolved = canonicalize_lenient(&canonical_base.join(&clean)).await?;
    if !resolved.starts_with(&canonical_base) {
        tracing::warn!(
            base = %canonical_base.display(),
            requested = %relative,
            resolved = %resolved.display(),
            "path escapes asset directory"
        );
        return Err(SandboxError::validation(format!(
            "path {relative:?} resolves outside the asset directory"
        )));
    }
    Ok(resolved)
}

/// Canonicalizes the longest existing ancestor of `path` and re-appends the
/// components that do not exist yet.
async fn canonicalize_lenient(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(canonical) => {
                let mut out = canonical;
                for part in missing.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A dangling symlink also reports NotFound; writing through it
                // would follow the link wherever it points.
                if let Ok(meta) = tokio::fs::symlink_metadata(&existing).await {
                    if meta.file_type().is_symlink() {
                        tracing::warn!(link = %existing.display(), "dangling symlink in path");
                        return Err(SandboxError::validation(format!(
                            "path {} goes through a dangling symlink",
                            path.display()
                        )));
                    }
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(SandboxError::validation(format!(
                        "path {} has no existing ancestor",
                        path.display()
                    )));
                };
                missing.push(name);
                if !existing.pop() {
                    return Err(SandboxError::validation(format!(
                        "path {} has no existing ancestor",
                        path.display()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_absolute_prefixes_and_reserved_chars() {
        assert_eq!(
            sanitize_relative_path("/inc/functions.php").unwrap(),
            PathBuf::from("inc/functions.php")
        );
        assert_eq!(
            sanitize_relative_path("C:\\inc\\a?b.php").unwrap(),
            PathBuf::from("inc/ab.php")
        );
        assert_eq!(
            sanitize_relative_path("./assets//app.js").unwrap(),
            PathBuf::from("assets/app.js")
        );
    }

    #[test]
    fn sanitize_rejects_parent_segments() {
        for raw in ["../wp-config.php", "inc/../../x", "a\\..\\b", " .. /x", "...."] {
            let err = sanitize_relative_path(raw).unwrap_err();
            assert!(matches!(err, SandboxError::Validation(_)), "{raw}");
        }
    }

    #[test]
    fn sanitize_rejects_empty_and_reserved_names() {
        assert!(sanitize_relative_path("").is_err());
        assert!(sanitize_relative_path("/./").is_err());
        assert!(sanitize_relative_path(".wpagent-backups/x.bak").is_err());
    }

    #[tokio::test]
    async fn resolve_allows_new_files_inside_base() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_within(tmp.path(), "new/dir/file.php").await.unwrap();
        let base = tokio::fs::canonicalize(tmp.path()).await.unwrap();
        assert_eq!(resolved, base.join("new/dir/file.php"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("plugin");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        let err = resolve_within(&base, "link/secret.txt").await.unwrap_err();
        assert!(err.to_string().contains("outside the asset directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_dangling_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("theme");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(outside.join("planted.php"), base.join("evil.php")).unwrap();
        std::os::unix::fs::symlink(outside.join("gone"), base.join("dir")).unwrap();

        for relative in ["evil.php", "dir/nested.php"] {
            let err = resolve_within(&base, relative).await.unwrap_err();
            assert!(matches!(err, SandboxError::Validation(_)), "{relative}");
            assert!(err.to_string().contains("dangling symlink"), "{relative}");
        }
        assert!(!outside.join("planted.php").exists());
    }
}
