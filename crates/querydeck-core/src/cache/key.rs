//! Cache key derivation

use xxhash_rust::xxh3::xxh3_64;

/// Collapse whitespace runs outside literals, trim, and drop trailing semicolons.
///
/// Case is preserved: string literals are case-sensitive.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for ch in sql.chars() {
        match quote {
            Some(q) => {
                out.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if matches!(ch, '\'' | '"') {
                    quote = Some(ch);
                } else if ch == '[' {
                    quote = Some(']');
                }
                out.push(ch);
            }
        }
    }

    while out.ends_with(';') {
        out.pop();
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
    }
    out
}

/// Deterministic key for `(connection identity, normalized SQL)`
pub fn cache_key(connection_identity: &str, sql: &str) -> String {
    let digest = xxh3_64(normalize_sql(sql).as_bytes());
    format!("{}:{:016x}", connection_identity, digest)
}

/// Prefix shared by every key of one connection
pub(crate) fn connection_prefix(connection_identity: &str) -> String {
    format!("{}:", connection_identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_sql("  SELECT   1\n FROM t ;; "), "SELECT 1 FROM t");
        assert_eq!(normalize_sql("SELECT   'A  b'"), "SELECT 'A  b'");
        assert_ne!(
            cache_key("c", "SELECT 'A  b'"),
            cache_key("c", "SELECT 'A b'")
        );
        assert_eq!(normalize_sql(""), "");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = cache_key("conn-1", "SELECT * FROM users");
        let b = cache_key("conn-1", "SELECT *\n  FROM users;");
        assert_eq!(a, b);
        assert!(a.starts_with("conn-1:"));
        assert_eq!(a.len(), "conn-1:".len() + 16);
    }

    #[test]
    fn test_key_separates_connections_and_text() {
        let a = cache_key("conn-1", "SELECT 1");
        assert_ne!(a, cache_key("conn-2", "SELECT 1"));
        assert_ne!(a, cache_key("conn-1", "select 1"));
    }
}
