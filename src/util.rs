use std::path::{Component, Path, PathBuf};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Truncate tool output at a line boundary, keeping it under `max_bytes`.
pub fn truncate_output(result: String, max_bytes: usize) -> String {
    if result.len() <= max_bytes {
        return result;
    }
    let mut cut = max_bytes;
    while cut > 0 && !result.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncate_at = result[..cut].rfind('\n').unwrap_or(cut);
    format!(
        "{}\n\n... (truncated - read a narrower range for the rest)",
        &result[..truncate_at]
    )
}

pub struct WorkspacePath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve a model-supplied path inside the workspace, allowing files that
/// do not exist yet.
pub fn resolve_workspace_path(workspace_root: &Path, candidate: &Path) -> Result<WorkspacePath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = workspace_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve workspace root: {}", e))?;
    let candidate = normalize_relative(candidate);
    if candidate.as_os_str().is_empty() {
        // "." and friends name the workspace root itself.
        return Ok(WorkspacePath {
            absolute: root,
            relative: PathBuf::new(),
        });
    }
    let joined = root.join(&candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes workspace: {}", candidate.display()));
    }

    let relative = joined
        .strip_prefix(&root)
        .map(normalize_relative)
        .unwrap_or_else(|_| candidate.clone());

    Ok(WorkspacePath {
        absolute: joined,
        relative,
    })
}

/// Canonicalize a path that may not exist yet by resolving its nearest
/// existing ancestor and re-appending the missing tail.
pub fn canonicalize_allow_missing(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }

    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => break,
        }
        if !existing.pop() {
            break;
        }
    }

    let base = if existing.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        existing.canonicalize()?
    };
    let mut resolved = base;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Normalize a relative path by removing `.` and folding `..` components.
pub fn normalize_relative(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            _ => {
                result.push(component);
            }
        }
    }
    result
}

/// Forward-slash form of a relative path, used as a stable map key.
pub fn path_key(path: &Path) -> String {
    normalize_relative(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_truncate_output_cuts_at_line_boundary() {
        let text = "line one\nline two\nline three\n".to_string();
        let out = truncate_output(text, 12);
        assert!(out.starts_with("line one\n\n..."));
    }

    #[test]
    fn test_resolve_workspace_path_accepts_missing_file() {
        let dir = tempdir().unwrap();
        let candidate = PathBuf::from("new_dir/new_file.rs");
        let resolved = resolve_workspace_path(dir.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("new_dir/new_file.rs"));
    }

    #[test]
    fn test_resolve_workspace_path_rejects_escape() {
        let dir = tempdir().unwrap();
        assert!(resolve_workspace_path(dir.path(), Path::new("../etc/passwd")).is_err());
        assert!(resolve_workspace_path(dir.path(), Path::new("/etc/passwd")).is_err());
        assert!(resolve_workspace_path(dir.path(), Path::new("")).is_err());
    }

    #[test]
    fn test_canonicalize_allow_missing_keeps_tail() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        let missing = dir.path().join("a/b/c.txt");
        let canon = canonicalize_allow_missing(&missing).unwrap();
        assert!(canon.ends_with("a/b/c.txt"));
        assert!(canon.is_absolute());
    }

    #[test]
    fn test_path_key_normalizes() {
        assert_eq!(path_key(Path::new("./src/../lib/app.js")), "lib/app.js");
    }
}
