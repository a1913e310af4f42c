//! Path & project normalizer (§4.A).
//!
//! Canonicalizes project identifiers in three shapes — a dash-encoded path,
//! a filesystem path, or a bare name — into a stable project name, and
//! derives the 8-hex project hash used to build collection names. The same
//! function runs at index time and at query time so hashes agree.

use md5::{Digest, Md5};

const KNOWN_PARENTS: &[&str] = &[
    "projects",
    "code",
    "repos",
    "repositories",
    "dev",
    "development",
    "work",
    "src",
    "github",
    "gitlab",
];

/// Normalizes a raw project identifier into the canonical project name used
/// in chunk payloads and collection names.
///
/// - If `raw` starts with `-` (Claude's dash-encoded project directory
///   name), split on `-`, find the first segment whose lowercase form
///   matches a known parent directory, and return everything after it
///   joined back with `-`.
/// - Otherwise, treat `raw` as a filesystem path or bare name and return its
///   final path component.
pub fn normalize_project_name(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix('-') {
        let segments: Vec<&str> = rest.split('-').filter(|s| !s.is_empty()).collect();
        if let Some(idx) = segments
            .iter()
            .position(|seg| KNOWN_PARENTS.contains(&seg.to_lowercase().as_str()))
        {
            let remainder = &segments[idx + 1..];
            if !remainder.is_empty() {
                return remainder.join("-");
            }
        }
        // No known parent found; fall back to the last dash-separated segment.
        return segments.last().copied().unwrap_or(trimmed).to_string();
    }

    trimmed
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

/// MD5(normalized project name)[:8], the hash used in collection names
/// `conv_<hash>_<suffix>`.
pub fn project_hash(project_name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(project_name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..8].to_string()
}

/// Convenience: normalize then hash in one call, the path every writer and
/// reader must share so hashes agree between index time and query time.
pub fn normalize_and_hash(raw: &str) -> (String, String) {
    let name = normalize_project_name(raw);
    let hash = project_hash(&name);
    (name, hash)
}

/// Infers the current project from the process's working directory by
/// finding a `projects` path component and joining everything after it.
/// Used when a caller (reflection storage, an unscoped search) omits an
/// explicit project and MCP-style callers haven't passed a client cwd.
pub fn project_from_cwd() -> Option<String> {
    let cwd = std::env::current_dir().ok()?;
    project_from_path(&cwd)
}

fn project_from_path(path: &std::path::Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let idx = parts.iter().position(|p| p == "projects")?;
    let rest = &parts[idx + 1..];
    if rest.is_empty() {
        return None;
    }
    Some(rest.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_encoded_path_with_projects_parent() {
        assert_eq!(
            normalize_project_name("-Users-alice-projects-foo-bar"),
            "foo-bar"
        );
    }

    #[test]
    fn dash_encoded_path_uses_lowercase_match() {
        // "Projects" in the raw casing still matches the lowercase known set.
        assert_eq!(
            normalize_project_name("-Users-alice-Projects-widget"),
            "widget"
        );
    }

    #[test]
    fn dash_encoded_path_with_github_parent() {
        assert_eq!(
            normalize_project_name("-home-bob-github-my-repo"),
            "my-repo"
        );
    }

    #[test]
    fn dash_encoded_path_no_known_parent_falls_back_to_last_segment() {
        assert_eq!(normalize_project_name("-tmp-scratch-area"), "area");
    }

    #[test]
    fn plain_filesystem_path_returns_basename() {
        assert_eq!(normalize_project_name("/home/alice/projects/foo-bar"), "foo-bar");
    }

    #[test]
    fn bare_name_passes_through() {
        assert_eq!(normalize_project_name("foo-bar"), "foo-bar");
    }

    #[test]
    fn trailing_slash_is_stripped() {
        assert_eq!(normalize_project_name("/home/alice/projects/foo-bar/"), "foo-bar");
    }

    #[test]
    fn hash_is_eight_hex_chars() {
        let hash = project_hash("foo-bar");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_stable_and_case_sensitive() {
        // Hashing happens after normalization/lowercasing decisions are
        // made by the caller; the hash function itself is a pure function
        // of its input string.
        assert_ne!(project_hash("foo-bar"), project_hash("FOO-BAR"));
        assert_eq!(project_hash("foo-bar"), project_hash("foo-bar"));
    }

    #[test]
    fn normalize_and_hash_agrees_across_equivalent_inputs() {
        let (name_a, hash_a) = normalize_and_hash("-Users-alice-projects-foo-bar");
        let (name_b, hash_b) = normalize_and_hash("foo-bar");
        assert_eq!(name_a, name_b);
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn project_from_path_joins_segments_after_projects_dir() {
        let path = std::path::Path::new("/Users/alice/projects/foo-bar/sub");
        assert_eq!(project_from_path(path), Some("foo-bar/sub".to_string()));
    }

    #[test]
    fn project_from_path_is_none_without_a_projects_segment() {
        let path = std::path::Path::new("/Users/alice/scratch");
        assert_eq!(project_from_path(path), None);
    }

    #[test]
    fn project_from_path_is_none_when_projects_is_the_last_segment() {
        let path = std::path::Path::new("/Users/alice/projects");
        assert_eq!(project_from_path(path), None);
    }
}
