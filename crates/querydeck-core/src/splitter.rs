//! Statement splitting
//!
//! The scheduler decides between single- and multi-statement execution by
//! asking a [`StatementSplitter`]. [`SqlSplitter`] is the default: it splits
//! on `;` outside string literals, quoted/bracketed identifiers and
//! comments, and recognizes `USE <database>` as a session-context change.

/// Splits SQL batches and classifies statements
pub trait StatementSplitter: Send + Sync {
    /// Ordered, trimmed, non-empty statements of `sql`
    fn split_statements(&self, sql: &str) -> Vec<String>;

    /// Whether `statement` switches the active database/schema
    fn is_session_context_statement(&self, statement: &str) -> bool;

    /// Target of a session-context statement (`USE [db]` -> `db`)
    fn extract_session_context_target(&self, statement: &str) -> String;

    /// Whether a result for `statement` may be served from the cache
    ///
    /// Only plain reads qualify: `SELECT` without a top-level `INTO`, and
    /// `WITH` whose main statement is such a `SELECT`.
    fn is_cacheable_query(&self, statement: &str) -> bool {
        let words = top_level_words(statement);
        let main = match words.first().map(String::as_str) {
            Some("SELECT") => "SELECT",
            Some("WITH") => match words.iter().find(|w| is_main_keyword(w)) {
                Some(word) => word.as_str(),
                None => return false,
            },
            _ => return false,
        };
        main == "SELECT" && !words.iter().any(|w| w == "INTO")
    }
}

fn is_main_keyword(word: &str) -> bool {
    matches!(
        word,
        "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT"
    )
}

/// Default splitter for T-SQL-like dialects
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlSplitter;

impl SqlSplitter {
    /// Create a splitter
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    SingleQuote,
    DoubleQuote,
    Bracket,
    LineComment,
    BlockComment,
}

impl StatementSplitter for SqlSplitter {
    fn split_statements(&self, sql: &str) -> Vec<String> {
        let mut statements = Vec::new();
        let mut start = 0;
        let mut has_code = false;
        let mut state = Lex::Code;
        let bytes = sql.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            let next = bytes.get(i + 1).copied();
            match state {
                Lex::Code => match b {
                    b';' => {
                        if has_code {
                            statements.push(sql[start..i].trim().to_string());
                        }
                        start = i + 1;
                        has_code = false;
                    }
                    b'\'' => {
                        state = Lex::SingleQuote;
                        has_code = true;
                    }
                    b'"' => {
                        state = Lex::DoubleQuote;
                        has_code = true;
                    }
                    b'[' => {
                        state = Lex::Bracket;
                        has_code = true;
                    }
                    b'-' if next == Some(b'-') => {
                        state = Lex::LineComment;
                        i += 1;
                    }
                    b'/' if next == Some(b'*') => {
                        state = Lex::BlockComment;
                        i += 1;
                    }
                    b if b.is_ascii_whitespace() => {}
                    _ => has_code = true,
                },
                Lex::SingleQuote => {
                    if b == b'\'' {
                        // '' is an escaped quote inside the literal
                        if next == Some(b'\'') {
                            i += 1;
                        } else {
                            state = Lex::Code;
                        }
                    }
                }
                Lex::DoubleQuote => {
                    if b == b'"' {
                        state = Lex::Code;
                    }
                }
                Lex::Bracket => {
                    if b == b']' {
                        if next == Some(b']') {
                            i += 1;
                        } else {
                            state = Lex::Code;
                        }
                    }
                }
                Lex::LineComment => {
                    if b == b'\n' {
                        state = Lex::Code;
                    }
                }
                Lex::BlockComment => {
                    if b == b'*' && next == Some(b'/') {
                        state = Lex::Code;
                        i += 1;
                    }
                }
            }
            i += 1;
        }

        if has_code {
            statements.push(sql[start..].trim().to_string());
        }

        statements
    }

    fn is_session_context_statement(&self, statement: &str) -> bool {
        leading_keyword(statement).as_deref() == Some("USE")
    }

    fn extract_session_context_target(&self, statement: &str) -> String {
        if !self.is_session_context_statement(statement) {
            return String::new();
        }
        let body = skip_comments(statement);
        let rest = body[3..].trim().trim_end_matches(';').trim();
        unquote_identifier(rest)
    }
}

/// Upper-cased words of `sql` outside parentheses, literals, quoted
/// identifiers and comments, in source order
pub fn top_level_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut depth = 0usize;
    let mut state = Lex::Code;
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        if state == Lex::Code && (b.is_ascii_alphanumeric() || b == b'_') {
            if depth == 0 {
                word.push(b.to_ascii_uppercase() as char);
            }
            i += 1;
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        match state {
            Lex::Code => match b {
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b'\'' => state = Lex::SingleQuote,
                b'"' => state = Lex::DoubleQuote,
                b'[' => state = Lex::Bracket,
                b'-' if next == Some(b'-') => {
                    state = Lex::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = Lex::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            Lex::SingleQuote => {
                if b == b'\'' {
                    if next == Some(b'\'') {
                        i += 1;
                    } else {
                        state = Lex::Code;
                    }
                }
            }
            Lex::DoubleQuote => {
                if b == b'"' {
                    state = Lex::Code;
                }
            }
            Lex::Bracket => {
                if b == b']' {
                    if next == Some(b']') {
                        i += 1;
                    } else {
                        state = Lex::Code;
                    }
                }
            }
            Lex::LineComment => {
                if b == b'\n' {
                    state = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = Lex::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if !word.is_empty() {
        words.push(word);
    }
    words
}

/// Upper-cased first keyword of `sql`, skipping leading whitespace and comments
pub fn leading_keyword(sql: &str) -> Option<String> {
    let body = skip_comments(sql);
    let word: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

fn skip_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(pos) => after[pos + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(pos) => after[pos + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

fn unquote_identifier(name: &str) -> String {
    let stripped = if name.len() >= 2 {
        let (first, last) = (name.as_bytes()[0], name.as_bytes()[name.len() - 1]);
        match (first, last) {
            (b'[', b']') => Some(name[1..name.len() - 1].replace("]]", "]")),
            (b'"', b'"') | (b'`', b'`') => Some(name[1..name.len() - 1].to_string()),
            _ => None,
        }
    } else {
        None
    };
    stripped.unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_basic() {
        let s = SqlSplitter::new();
        assert_eq!(s.split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert_eq!(
            s.split_statements("USE testdb; SELECT 1;"),
            vec!["USE testdb", "SELECT 1"]
        );
        assert!(s.split_statements("  ;; ").is_empty());
    }

    #[test]
    fn test_split_ignores_semicolons_in_literals_and_comments() {
        let s = SqlSplitter::new();
        let sql = "SELECT 'a;b' AS [x;y]; -- trailing; comment\nSELECT 2 /* ; */";
        assert_eq!(
            s.split_statements(sql),
            vec!["SELECT 'a;b' AS [x;y]", "-- trailing; comment\nSELECT 2 /* ; */"]
        );
    }

    #[test]
    fn test_split_escaped_quote() {
        let s = SqlSplitter::new();
        assert_eq!(
            s.split_statements("SELECT 'it''s; fine'; SELECT 3"),
            vec!["SELECT 'it''s; fine'", "SELECT 3"]
        );
    }

    #[test]
    fn test_comment_only_tail_is_dropped() {
        let s = SqlSplitter::new();
        assert_eq!(s.split_statements("SELECT 1; -- done"), vec!["SELECT 1"]);
    }

    #[test]
    fn test_session_context_detection() {
        let s = SqlSplitter::new();
        assert!(s.is_session_context_statement("USE testdb"));
        assert!(s.is_session_context_statement("  use [Sales DB]"));
        assert!(s.is_session_context_statement("/* switch */ USE x"));
        assert!(!s.is_session_context_statement("SELECT * FROM users"));
        assert!(!s.is_session_context_statement("USERS"));

        assert_eq!(s.extract_session_context_target("USE testdb"), "testdb");
        assert_eq!(s.extract_session_context_target("use [Sales DB];"), "Sales DB");
        assert_eq!(s.extract_session_context_target("USE \"quoted\""), "quoted");
        assert_eq!(s.extract_session_context_target("SELECT 1"), "");
    }

    #[test]
    fn test_cacheable_queries() {
        let s = SqlSplitter::new();
        assert!(s.is_cacheable_query("select * from t"));
        assert!(s.is_cacheable_query("WITH c AS (SELECT 1) SELECT * FROM c"));
        assert!(!s.is_cacheable_query("UPDATE t SET a = 1"));
        assert!(!s.is_cacheable_query("USE master"));
    }

    #[test]
    fn test_writes_behind_read_keywords_are_not_cacheable() {
        let s = SqlSplitter::new();
        assert!(!s.is_cacheable_query(
            "WITH old AS (SELECT id FROM t WHERE id < 10) DELETE FROM t WHERE id IN (SELECT id FROM old)"
        ));
        assert!(!s.is_cacheable_query("WITH c (x) AS (SELECT 1) INSERT INTO t SELECT x FROM c"));
        assert!(!s.is_cacheable_query("with c as (select 1) update t set a = 1"));
        assert!(!s.is_cacheable_query("SELECT * INTO backup FROM t"));
        assert!(!s.is_cacheable_query("WITH c AS (SELECT 1 AS a) SELECT a INTO #tmp FROM c"));

        // INTO inside literals, identifiers or subqueries does not count
        assert!(s.is_cacheable_query("SELECT 'insert into' AS [into] FROM t"));
        assert!(s.is_cacheable_query("SELECT * FROM t WHERE a IN (SELECT a FROM u) -- into"));
    }

    #[test]
    fn test_top_level_words() {
        assert_eq!(
            top_level_words("WITH c AS (SELECT 1) select x_1 FROM c /* into */"),
            vec!["WITH", "C", "AS", "SELECT", "X_1", "FROM", "C"]
        );
        assert!(top_level_words("").is_empty());
    }
}
