//! Logical path (LFN) utilities
//!
//! LFNs are backend-agnostic, slash-separated paths. A canonical LFN
//! never ends with a slash and never repeats the leading slash; the
//! root is `/`.

/// Canonicalize an LFN: strip trailing slashes, collapse slashes after
/// the leading one, map the empty string to the root.
#[must_use]
pub fn trim_path(s: &str) -> String {
    let mut out = s.to_string();
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    while out.len() > 1 && out.as_bytes().get(1) == Some(&b'/') {
        out.remove(1);
    }
    if out.is_empty() || out == "/" {
        return "/".to_string();
    }
    out
}

/// Split an LFN into its parent path and final component.
/// Returns `None` for the root or a path with no slash.
#[must_use]
pub fn split_parent(lfn: &str) -> Option<(&str, &str)> {
    let pos = lfn.rfind('/')?;
    let child = &lfn[pos + 1..];
    if child.is_empty() {
        return None;
    }
    let parent = if pos == 0 { "/" } else { &lfn[..pos] };
    Some((parent, child))
}

/// Join a parent path and a child component.
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// True if `ancestor` is a strict path-component ancestor of `path`.
#[must_use]
pub fn is_ancestor_of(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == "/" {
        return path.starts_with('/');
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// The single child component of `ancestor` on the way down to `path`,
/// if `ancestor` is an ancestor of `path`.
#[must_use]
pub fn next_component<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if !is_ancestor_of(ancestor, path) {
        return None;
    }
    let rest = if ancestor == "/" {
        &path[1..]
    } else {
        &path[ancestor.len() + 1..]
    };
    let comp = rest.split('/').next()?;
    if comp.is_empty() { None } else { Some(comp) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_path() {
        assert_eq!(trim_path("/a/b/"), "/a/b");
        assert_eq!(trim_path("/a/b///"), "/a/b");
        assert_eq!(trim_path("///a"), "/a");
        assert_eq!(trim_path(""), "/");
        assert_eq!(trim_path("/"), "/");
        assert_eq!(trim_path("/a"), "/a");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a/b"), Some(("/a", "b")));
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_ancestry() {
        assert!(is_ancestor_of("/a", "/a/b/c"));
        assert!(is_ancestor_of("/", "/a"));
        assert!(!is_ancestor_of("/a", "/a"));
        assert!(!is_ancestor_of("/a", "/ab/c"));
        assert_eq!(next_component("/a", "/a/b/c"), Some("b"));
        assert_eq!(next_component("/", "/x"), Some("x"));
        assert_eq!(next_component("/a", "/b/c"), None);
    }
}
