//! Statement classification for QUERY log events.
//!
//! Only classifies: transaction control, DDL family and the target object
//! name. Anything it cannot attribute to a table is reported as unparsed
//! rather than guessed.

use serde::{Deserialize, Serialize};

/// DDL statement family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdlKind {
    Create,
    Alter,
    Drop,
    Rename,
    Truncate,
}

/// Result of classifying a DDL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlTarget {
    pub kind: DdlKind,
    /// Explicit schema qualifier, or the database for `CREATE DATABASE` etc.
    pub database: Option<String>,
    /// Target table/view. `None` when the statement is not table-scoped.
    pub table: Option<String>,
    /// Whether the target object could be identified at all.
    pub parsed: bool,
}

/// Classification of a statement found in a QUERY event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Ddl(DdlTarget),
    /// DML logged as a statement, SAVEPOINT, GRANT, SET, ...
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Dot,
    Punct(char),
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

const MAX_TOKENS: usize = 48;

/// Classify a statement.
pub fn classify(sql: &str) -> StatementKind {
    let tokens = tokenize(sql);
    let Some(first) = tokens.first() else {
        return StatementKind::Other;
    };

    if first.is_kw("BEGIN") && tokens.len() == 1 {
        return StatementKind::Begin;
    }
    if first.is_kw("START") && tokens.get(1).is_some_and(|t| t.is_kw("TRANSACTION")) {
        return StatementKind::Begin;
    }
    if first.is_kw("COMMIT") {
        return StatementKind::Commit;
    }
    if first.is_kw("ROLLBACK") {
        // ROLLBACK TO SAVEPOINT does not end the transaction
        if tokens.get(1).is_some_and(|t| t.is_kw("TO")) {
            return StatementKind::Other;
        }
        return StatementKind::Rollback;
    }

    let kind = if first.is_kw("CREATE") {
        DdlKind::Create
    } else if first.is_kw("ALTER") {
        DdlKind::Alter
    } else if first.is_kw("DROP") {
        DdlKind::Drop
    } else if first.is_kw("RENAME") {
        DdlKind::Rename
    } else if first.is_kw("TRUNCATE") {
        DdlKind::Truncate
    } else {
        return StatementKind::Other;
    };

    StatementKind::Ddl(parse_target(kind, &tokens[1..]))
}

fn parse_target(kind: DdlKind, rest: &[Token]) -> DdlTarget {
    let unparsed = DdlTarget {
        kind,
        database: None,
        table: None,
        parsed: false,
    };

    if kind == DdlKind::Truncate {
        let rest = match rest.first() {
            Some(t) if t.is_kw("TABLE") => &rest[1..],
            _ => rest,
        };
        return table_target(kind, rest).unwrap_or(unparsed);
    }

    // Find the object keyword, skipping modifiers such as TEMPORARY,
    // OR REPLACE, ONLINE, UNIQUE or ALGORITHM=... clauses.
    let Some((idx, object)) = rest.iter().enumerate().take(16).find_map(|(i, t)| {
        [
            "TABLE", "INDEX", "VIEW", "DATABASE", "SCHEMA", "TRIGGER", "PROCEDURE", "FUNCTION",
            "EVENT", "USER", "ROLE", "TABLESPACE", "SERVER",
        ]
        .iter()
        .find(|kw| t.is_kw(kw))
        .map(|kw| (i, *kw))
    }) else {
        return unparsed;
    };
    let after = &rest[idx + 1..];

    match object {
        "TABLE" | "VIEW" => table_target(kind, skip_if_exists(after)).unwrap_or(unparsed),
        "INDEX" => {
            // CREATE INDEX idx ON tbl / DROP INDEX idx ON tbl
            match after.iter().position(|t| t.is_kw("ON")) {
                Some(on) => table_target(kind, &after[on + 1..]).unwrap_or(unparsed),
                None => unparsed,
            }
        }
        "DATABASE" | "SCHEMA" => match skip_if_exists(after).first().and_then(Token::ident) {
            Some(name) => DdlTarget {
                kind,
                database: Some(name.to_owned()),
                table: None,
                parsed: true,
            },
            None => unparsed,
        },
        _ => unparsed,
    }
}

fn skip_if_exists(tokens: &[Token]) -> &[Token] {
    let mut rest = tokens;
    if rest.first().is_some_and(|t| t.is_kw("IF")) {
        rest = &rest[1..];
        if rest.first().is_some_and(|t| t.is_kw("NOT")) {
            rest = &rest[1..];
        }
        if rest.first().is_some_and(|t| t.is_kw("EXISTS")) {
            rest = &rest[1..];
        }
    }
    rest
}

fn table_target(kind: DdlKind, tokens: &[Token]) -> Option<DdlTarget> {
    let first = tokens.first()?.ident()?;
    match (tokens.get(1), tokens.get(2).and_then(Token::ident)) {
        (Some(Token::Dot), Some(table)) => Some(DdlTarget {
            kind,
            database: Some(first.to_owned()),
            table: Some(table.to_owned()),
            parsed: true,
        }),
        (Some(Token::Dot), None) => None,
        _ => Some(DdlTarget {
            kind,
            database: None,
            table: Some(first.to_owned()),
            parsed: true,
        }),
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() && tokens.len() < MAX_TOKENS {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if c == '#' || (c == '-' && chars.get(i + 1) == Some(&'-')) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '`' || c == '"' {
            let quote = c;
            let mut ident = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == quote {
                    if chars.get(i + 1) == Some(&quote) {
                        ident.push(quote);
                        i += 2;
                        continue;
                    }
                    break;
                }
                ident.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(Token::Quoted(ident));
        } else if c == '.' {
            tokens.push(Token::Dot);
            i += 1;
        } else if c.is_alphanumeric() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ddl(sql: &str) -> DdlTarget {
        match classify(sql) {
            StatementKind::Ddl(t) => t,
            other => panic!("expected DDL for {sql:?}, got {other:?}"),
        }
    }

    #[test]
    fn transaction_control() {
        assert_eq!(classify("BEGIN"), StatementKind::Begin);
        assert_eq!(classify("commit"), StatementKind::Commit);
        assert_eq!(classify("ROLLBACK"), StatementKind::Rollback);
        assert_eq!(classify("ROLLBACK TO SAVEPOINT sp1"), StatementKind::Other);
        assert_eq!(classify("START TRANSACTION"), StatementKind::Begin);
    }

    #[test]
    fn create_table_with_qualifier_and_backticks() {
        let t = ddl("CREATE TABLE IF NOT EXISTS `shop`.`orders` (id INT PRIMARY KEY)");
        assert_eq!(t.kind, DdlKind::Create);
        assert_eq!(t.database.as_deref(), Some("shop"));
        assert_eq!(t.table.as_deref(), Some("orders"));
        assert!(t.parsed);
    }

    #[test]
    fn alter_table_unqualified() {
        let t = ddl("ALTER ONLINE TABLE users ADD COLUMN age INT");
        assert_eq!(t.kind, DdlKind::Alter);
        assert_eq!(t.database, None);
        assert_eq!(t.table.as_deref(), Some("users"));
    }

    #[test]
    fn drop_table_with_server_comment() {
        let t = ddl("DROP TABLE IF EXISTS `tmp_import` /* generated by server */");
        assert_eq!(t.kind, DdlKind::Drop);
        assert_eq!(t.table.as_deref(), Some("tmp_import"));
    }

    #[test]
    fn create_index_targets_table_after_on() {
        let t = ddl("CREATE UNIQUE INDEX idx_email ON shop.users (email)");
        assert_eq!(t.database.as_deref(), Some("shop"));
        assert_eq!(t.table.as_deref(), Some("users"));
    }

    #[test]
    fn rename_and_truncate() {
        assert_eq!(ddl("RENAME TABLE a TO b").table.as_deref(), Some("a"));
        assert_eq!(ddl("TRUNCATE TABLE logs").table.as_deref(), Some("logs"));
        assert_eq!(ddl("truncate logs").table.as_deref(), Some("logs"));
    }

    #[test]
    fn create_database_has_no_table() {
        let t = ddl("CREATE DATABASE IF NOT EXISTS analytics");
        assert!(t.parsed);
        assert_eq!(t.database.as_deref(), Some("analytics"));
        assert_eq!(t.table, None);
    }

    #[test]
    fn create_view_with_definer() {
        let t = ddl("CREATE ALGORITHM=UNDEFINED DEFINER=`root`@`%` SQL SECURITY DEFINER VIEW `v_orders` AS select 1");
        assert_eq!(t.table.as_deref(), Some("v_orders"));
    }

    #[test]
    fn procedures_and_users_are_unparsed() {
        assert!(!ddl("CREATE PROCEDURE p() BEGIN SELECT 1; END").parsed);
        assert!(!ddl("DROP USER 'etl'@'%'").parsed);
        assert!(!ddl("ALTER").parsed);
    }

    #[test]
    fn leading_comments_are_skipped() {
        let t = ddl("/* migration 42 */ -- note\nALTER TABLE t1 DROP COLUMN c");
        assert_eq!(t.table.as_deref(), Some("t1"));
    }

    #[test]
    fn dml_is_other() {
        assert_eq!(classify("INSERT INTO t VALUES (1)"), StatementKind::Other);
        assert_eq!(classify(""), StatementKind::Other);
        assert_eq!(classify("SAVEPOINT s1"), StatementKind::Other);
    }
}
