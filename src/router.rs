//! Location matching (§4.3). A `Router` is built once per `ServerConfig`
//! and holds its locations sorted so the longest matching prefix always
//! wins, with a lexicographic tie-break for equal-length prefixes.

use crate::config::Location;

pub struct Router<'a> {
    locations: Vec<&'a Location>,
}

impl<'a> Router<'a> {
    pub fn new(locations: &'a [Location]) -> Self {
        let mut sorted: Vec<&'a Location> = locations.iter().collect();
        sorted.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.path.cmp(&b.path))
        });
        Router { locations: sorted }
    }

    /// Finds the longest `Location::path` that prefixes `target`. `target`
    /// must already be sanitized by `normalize_target`.
    pub fn resolve(&self, target: &str) -> Option<&'a Location> {
        self.locations
            .iter()
            .find(|loc| prefix_matches(&loc.path, target))
            .copied()
    }
}

fn prefix_matches(prefix: &str, target: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    target == prefix || target.starts_with(&(prefix.to_string() + "/"))
}

/// Normalizes a raw request target into a clean, root-relative path:
/// backslashes become slashes, runs of slashes collapse to one, and any
/// `..` segment that would climb above the root falls back to `/` rather
/// than rejecting the request.
pub fn normalize_target(raw: &str) -> String {
    let decoded = raw.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return "/".to_string();
                }
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Location;

    fn loc(path: &str) -> Location {
        Location {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn picks_longest_prefix() {
        let locations = vec![loc("/"), loc("/api"), loc("/api/v1")];
        let router = Router::new(&locations);
        assert_eq!(router.resolve("/api/v1/users").unwrap().path, "/api/v1");
        assert_eq!(router.resolve("/api/other").unwrap().path, "/api");
        assert_eq!(router.resolve("/elsewhere").unwrap().path, "/");
    }

    #[test]
    fn exact_match_does_not_require_trailing_slash() {
        let locations = vec![loc("/"), loc("/api")];
        let router = Router::new(&locations);
        assert_eq!(router.resolve("/api").unwrap().path, "/api");
    }

    #[test]
    fn does_not_match_sibling_with_shared_prefix() {
        let locations = vec![loc("/"), loc("/api")];
        let router = Router::new(&locations);
        assert_eq!(router.resolve("/apiextra").unwrap().path, "/");
    }

    #[test]
    fn ties_broken_lexicographically() {
        let locations = vec![loc("/bbb"), loc("/aaa")];
        let router = Router::new(&locations);
        assert_eq!(router.locations[0].path, "/aaa");
    }

    #[test]
    fn normalizes_backslashes_and_repeated_slashes() {
        assert_eq!(normalize_target("\\foo\\\\bar"), "/foo/bar");
    }

    #[test]
    fn falls_back_to_root_on_traversal_above_root() {
        assert_eq!(normalize_target("/../../etc/passwd"), "/");
    }

    #[test]
    fn collapses_internal_traversal() {
        assert_eq!(normalize_target("/a/b/../c"), "/a/c".to_string());
    }
}
