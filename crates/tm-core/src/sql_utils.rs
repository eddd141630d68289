//! SQL identifier quoting utilities
//!
//! Used when building bookkeeping statements from configured table names
//! and from values (migration names, lock owners) that end up in literals.

/// Quote a SQL identifier to prevent injection.
///
/// Wraps the identifier in double quotes and escapes any embedded double quotes
/// by doubling them, following the SQL standard.
///
/// # Examples
/// ```
/// use tm_core::sql_utils::quote_ident;
/// assert_eq!(quote_ident("schema_migrations"), r#""schema_migrations""#);
/// assert_eq!(quote_ident(r#"my"table"#), r#""my""table""#);
/// ```
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a potentially schema-qualified name (e.g. `ops.schema_migrations`).
///
/// Splits on `.` and individually quotes each component.
///
/// # Examples
/// ```
/// use tm_core::sql_utils::quote_qualified;
/// assert_eq!(quote_qualified("schema_migrations"), r#""schema_migrations""#);
/// assert_eq!(quote_qualified("ops.versions"), r#""ops"."versions""#);
/// ```
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Schema part of a qualified name, if any.
///
/// # Examples
/// ```
/// use tm_core::sql_utils::schema_of;
/// assert_eq!(schema_of("ops.versions"), Some("ops"));
/// assert_eq!(schema_of("versions"), None);
/// ```
pub fn schema_of(name: &str) -> Option<&str> {
    name.rfind('.').map(|pos| &name[..pos])
}

/// Escape a SQL string literal value by doubling single quotes.
///
/// This is for use inside single-quoted SQL string literals, not identifiers.
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}
