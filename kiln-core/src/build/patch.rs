// kiln-core/src/build/patch.rs
// Applies unified diffs (`patch -pN` style) to an extracted source tree.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use tracing::debug;

const DEV_NULL: &str = "/dev/null";

#[derive(Debug)]
struct FileDiff {
    old_path: String,
    new_path: String,
    hunk_lines: Vec<String>,
}

/// Applies every file section of `content` below `root`, stripping `strip`
/// leading components from the paths named in the diff. Returns the number
/// of files touched.
pub fn apply_patch(
    package: &str,
    patch_name: &str,
    content: &str,
    strip: u32,
    root: &Path,
) -> Result<usize> {
    let fail = |reason: String| KilnError::PatchFailed {
        package: package.to_string(),
        patch: patch_name.to_string(),
        reason,
    };

    let diffs = parse_file_diffs(content).map_err(&fail)?;
    if diffs.is_empty() {
        return Err(fail("no file changes found in patch".to_string()));
    }

    for diff in &diffs {
        let is_new = diff.old_path == DEV_NULL;
        let is_delete = diff.new_path == DEV_NULL;
        let named = if is_delete { &diff.old_path } else { &diff.new_path };
        let rel = strip_path(named, strip).map_err(&fail)?;
        let target = root.join(&rel);
        debug!(
            "[{}] Patch '{}' -> {}{}",
            package,
            patch_name,
            rel.display(),
            if is_new {
                " (new)"
            } else if is_delete {
                " (delete)"
            } else {
                ""
            }
        );

        if is_delete {
            fs::remove_file(&target)
                .map_err(|e| fail(format!("cannot delete {}: {e}", rel.display())))?;
            continue;
        }

        let base = if is_new {
            String::new()
        } else {
            match fs::read_to_string(&target) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(fail(format!("{} does not exist", rel.display())));
                }
                Err(e) => return Err(fail(format!("cannot read {}: {e}", rel.display()))),
            }
        };

        let mut normalized = String::from("--- a\n+++ b\n");
        for line in &diff.hunk_lines {
            normalized.push_str(line);
            normalized.push('\n');
        }
        let parsed = diffy::Patch::from_str(&normalized)
            .map_err(|e| fail(format!("malformed hunk for {}: {e}", rel.display())))?;
        let patched = diffy::apply(&base, &parsed)
            .map_err(|e| fail(format!("{} does not match: {e}", rel.display())))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| fail(format!("cannot create {}: {e}", parent.display())))?;
        }
        fs::write(&target, patched)
            .map_err(|e| fail(format!("cannot write {}: {e}", rel.display())))?;
    }
    Ok(diffs.len())
}

fn header_path(rest: &str) -> String {
    // "a/foo.c\t2013-06-01 12:00:00" -> "a/foo.c"
    rest.split('\t')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string()
}

fn parse_range_count(range: &str) -> std::result::Result<usize, String> {
    match range.split_once(',') {
        Some((_, count)) => count
            .parse()
            .map_err(|_| format!("bad hunk range '{range}'")),
        None => Ok(1),
    }
}

/// `@@ -a,b +c,d @@` -> (b, d)
fn parse_hunk_header(line: &str) -> std::result::Result<(usize, usize), String> {
    let mut parts = line.split_whitespace();
    let (Some("@@"), Some(old), Some(new)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("bad hunk header '{line}'"));
    };
    let old = old
        .strip_prefix('-')
        .ok_or_else(|| format!("bad hunk header '{line}'"))?;
    let new = new
        .strip_prefix('+')
        .ok_or_else(|| format!("bad hunk header '{line}'"))?;
    Ok((parse_range_count(old)?, parse_range_count(new)?))
}

fn parse_file_diffs(content: &str) -> std::result::Result<Vec<FileDiff>, String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut diffs: Vec<FileDiff> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let (Some(old), Some(new)) = (
            line.strip_prefix("--- "),
            lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")),
        ) {
            diffs.push(FileDiff {
                old_path: header_path(old),
                new_path: header_path(new),
                hunk_lines: Vec::new(),
            });
            i += 2;
            continue;
        }
        if line.starts_with("@@ ") {
            let Some(current) = diffs.last_mut() else {
                return Err("hunk before any file header".to_string());
            };
            let (mut old_left, mut new_left) = parse_hunk_header(line)?;
            current.hunk_lines.push(line.to_string());
            i += 1;
            while i < lines.len() && (old_left > 0 || new_left > 0) {
                let body = lines[i];
                match body.chars().next() {
                    Some('\\') => {}
                    // Some tools drop the space on blank context lines.
                    None | Some(' ') => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                    Some('-') => old_left = old_left.saturating_sub(1),
                    Some('+') => new_left = new_left.saturating_sub(1),
                    Some(_) => return Err(format!("unexpected line in hunk: '{body}'")),
                }
                current.hunk_lines.push(if body.is_empty() {
                    " ".to_string()
                } else {
                    body.to_string()
                });
                i += 1;
            }
            if old_left > 0 || new_left > 0 {
                return Err("hunk is truncated".to_string());
            }
            if let Some(marker) = lines.get(i).filter(|l| l.starts_with('\\')) {
                current.hunk_lines.push(marker.to_string());
                i += 1;
            }
            continue;
        }
        // Preamble such as "diff --git" or "index" lines.
        i += 1;
    }
    Ok(diffs)
}

fn strip_path(path: &str, strip: u32) -> std::result::Result<PathBuf, String> {
    let mut rel = PathBuf::new();
    let mut skipped = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) if skipped < strip => skipped += 1,
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => return Err(format!("unsafe path '{path}' in patch")),
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(format!("path '{path}' is empty after stripping {strip} components"));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIGURE_FIX: &str = "\
diff --git a/configure b/configure
index 1111111..2222222 100755
--- a/configure
+++ b/configure
@@ -1,3 +1,3 @@
 #!/bin/sh
-SERF_LIBS=-lserf
+SERF_LIBS=-lserf-1
 exit 0
--- a/build/ac-macros/swig.m4
+++ b/build/ac-macros/swig.m4
@@ -2,2 +2,3 @@
 SWIG_PY_INCLUDES=
+SWIG_RB_INCLUDES=
 done
";

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("configure"),
            "#!/bin/sh\nSERF_LIBS=-lserf\nexit 0\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("build/ac-macros")).unwrap();
        fs::write(
            dir.path().join("build/ac-macros/swig.m4"),
            "dnl swig\nSWIG_PY_INCLUDES=\ndone\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn applies_multi_file_patch_with_strip() {
        let dir = tree();
        let touched = apply_patch("subversion", "serf-libs", CONFIGURE_FIX, 1, dir.path()).unwrap();
        assert_eq!(touched, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("configure")).unwrap(),
            "#!/bin/sh\nSERF_LIBS=-lserf-1\nexit 0\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("build/ac-macros/swig.m4")).unwrap(),
            "dnl swig\nSWIG_PY_INCLUDES=\nSWIG_RB_INCLUDES=\ndone\n"
        );
    }

    #[test]
    fn mismatching_context_names_the_patch() {
        let dir = tree();
        fs::write(dir.path().join("configure"), "#!/bin/sh\nSOMETHING_ELSE\nexit 0\n").unwrap();
        let err = apply_patch("subversion", "serf-libs", CONFIGURE_FIX, 1, dir.path()).unwrap_err();
        match err {
            KilnError::PatchFailed { package, patch, .. } => {
                assert_eq!(package, "subversion");
                assert_eq!(patch, "serf-libs");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn creates_new_files_and_rejects_escaping_paths() {
        let dir = tree();
        let new_file = "--- /dev/null\n+++ b/NOTES\n@@ -0,0 +1,1 @@\n+patched by kiln\n";
        apply_patch("subversion", "notes", new_file, 1, dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("NOTES")).unwrap(),
            "patched by kiln\n"
        );

        let escaping = "--- a/../etc/passwd\n+++ b/../etc/passwd\n@@ -1 +1 @@\n-x\n+y\n";
        assert!(matches!(
            apply_patch("subversion", "evil", escaping, 1, dir.path()),
            Err(KilnError::PatchFailed { .. })
        ));
    }

    #[test]
    fn empty_patch_is_rejected() {
        let dir = tree();
        assert!(apply_patch("subversion", "empty", "just words\n", 1, dir.path()).is_err());
    }
}
