//! Route pattern matching for caller authorization.
//!
//! Patterns and paths are normalised first (`//`, `.` and `..` collapse the
//! way a path clean does), then compared segment by segment:
//!
//! - a literal segment matches itself
//! - `*` matches exactly one segment
//! - `**` matches the rest of the path, including nothing
//!
//! So `/orders/*` matches `/orders/123` but not `/orders/123/items`, and
//! `/orders/**` matches both as well as `/orders` itself. The prefix is
//! compared by whole segments: `/orders/**` does not match `/ordersX`.

/// Normalise a path into its segments.
pub fn clean_segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out
}

/// Normalised string form, always rooted: `clean_path("a//b/../c") == "/a/c"`.
pub fn clean_path(path: &str) -> String {
    format!("/{}", clean_segments(path).join("/"))
}

pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern = clean_segments(pattern);
    let path = clean_segments(path);

    for (i, seg) in pattern.iter().enumerate() {
        match *seg {
            "**" => return path.len() >= i,
            "*" => {
                if i >= path.len() {
                    return false;
                }
            }
            literal => {
                if path.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    pattern.len() == path.len()
}

/// True if any of `patterns` matches `path`.
pub fn any_matches<S: AsRef<str>>(patterns: &[S], path: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_wildcard() {
        assert!(matches("/orders/*", "/orders/123"));
        assert!(!matches("/orders/*", "/orders/123/items"));
        assert!(!matches("/orders/*", "/orders"));
    }

    #[test]
    fn test_double_wildcard() {
        assert!(matches("/orders/**", "/orders/123"));
        assert!(matches("/orders/**", "/orders/123/items"));
        assert!(matches("/orders/**", "/orders"));
        assert!(matches("/orders/**", "/orders/"));
        assert!(!matches("/orders/**", "/ordersX/1"));
        assert!(!matches("/orders/**", "/ordersX"));
        assert!(!matches("/orders/**", "/"));
        assert!(matches("/**", "/"));
    }

    #[test]
    fn test_exact() {
        assert!(matches("/health", "/health"));
        assert!(!matches("/health", "/health/deep"));
        assert!(!matches("/health", "/healthz"));
    }

    #[test]
    fn test_normalisation() {
        assert_eq!(clean_path("a//b/./c/"), "/a/b/c");
        assert_eq!(clean_path("/a/b/../../.."), "/");
        assert!(matches("api/*", "/api//x/"));
        assert!(!matches("/api/*", "/api/x/../../admin"));
        assert!(matches("/admin", "/api/x/../../admin"));
    }

    #[test]
    fn test_mixed() {
        assert!(matches("/v1/*/items/**", "/v1/abc/items/1/2"));
        assert!(!matches("/v1/*/items/**", "/v1/abc/other/1"));
        assert!(any_matches(&["/a", "/b/**"], "/b/c"));
        assert!(!any_matches::<&str>(&[], "/b/c"));
    }
}
