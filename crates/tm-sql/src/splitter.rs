//! Statement splitting for migration scripts

use sqlparser::tokenizer::{Token, Tokenizer};

use crate::dialect::{dialect_for, DuckDbDialect, GenericDialect, SqlDialect};
use crate::error::{SqlError, SqlResult};

/// Leading keywords of statements that open or close transactions.
const TRANSACTION_KEYWORDS: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "START", "END", "ABORT"];

/// Splits a script into statements using a dialect-aware tokenizer
pub struct StatementSplitter {
    dialect: Box<dyn SqlDialect>,
}

impl StatementSplitter {
    /// Splitter using the DuckDB tokenizer rules
    pub fn duckdb() -> Self {
        Self {
            dialect: Box::new(DuckDbDialect::new()),
        }
    }

    /// Splitter using dialect-neutral tokenizer rules
    pub fn generic() -> Self {
        Self {
            dialect: Box::new(GenericDialect::new()),
        }
    }

    /// Splitter for a backend's `db_type`, falling back to generic rules
    pub fn for_backend(db_type: &str) -> Self {
        match dialect_for(db_type) {
            Ok(dialect) => Self { dialect },
            Err(_) => Self::generic(),
        }
    }

    /// Get the dialect name
    pub fn dialect_name(&self) -> &'static str {
        self.dialect.name()
    }

    /// Split `script` into trimmed statements without trailing semicolons.
    ///
    /// Fragments holding only whitespace or comments are dropped, so an
    /// empty or comment-only script yields no statements. Statements that
    /// open or close transactions are rejected.
    pub fn split(&self, script: &str) -> SqlResult<Vec<String>> {
        let tokenized = Tokenizer::new(self.dialect.parser_dialect(), script)
            .with_unescape(false)
            .tokenize();

        let statements = match tokenized {
            Ok(tokens) => split_tokens(&tokens),
            Err(e) => {
                log::warn!(
                    "SQL tokenizing failed ({}), using naive semicolon splitting: {}",
                    self.dialect.name(),
                    e
                );
                naive_split(script)
            }
        };

        for (index, statement) in statements.iter().enumerate() {
            if let Some(keyword) = leading_word(statement) {
                let upper = keyword.to_uppercase();
                if TRANSACTION_KEYWORDS.contains(&upper.as_str()) {
                    return Err(SqlError::TransactionControl {
                        index: index + 1,
                        keyword: upper,
                    });
                }
            }
        }

        Ok(statements)
    }
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::duckdb()
    }
}

/// Rebuild statements from tokens, cutting at top-level semicolons
fn split_tokens(tokens: &[Token]) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_content = false;

    for token in tokens {
        match token {
            Token::SemiColon => {
                flush(&mut statements, &mut current, &mut has_content);
            }
            Token::EOF => {}
            Token::Whitespace(_) => current.push_str(&token.to_string()),
            other => {
                has_content = true;
                current.push_str(&other.to_string());
            }
        }
    }
    flush(&mut statements, &mut current, &mut has_content);
    statements
}

fn flush(statements: &mut Vec<String>, current: &mut String, has_content: &mut bool) {
    if *has_content {
        statements.push(current.trim().to_string());
    }
    current.clear();
    *has_content = false;
}

/// Fallback used when the tokenizer rejects the script
fn naive_split(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !strip_leading_comments(s).is_empty())
        .map(str::to_string)
        .collect()
}

/// Skip leading whitespace and `--` / `/* */` comments
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i + 1..]).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

/// First word of a statement after skipping whitespace and comments
fn leading_word(sql: &str) -> Option<&str> {
    let rest = strip_leading_comments(sql);
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

#[cfg(test)]
#[path = "splitter_test.rs"]
mod tests;
