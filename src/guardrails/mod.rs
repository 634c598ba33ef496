pub mod extract;
pub mod repair;
pub mod rewrite;

pub use extract::extract_sql;
pub use rewrite::Rewriter;

use crate::catalog::{BLOCKED_KEYWORDS, Catalog};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Why a candidate statement was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    NoCandidate,
    NotSingleSelect,
    BlockedKeyword,
    DisallowedObject,
    UnknownColumn,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Rejection {}

/// Short-circuiting pipeline of independent checks a candidate statement must
/// pass before it can touch the database. Fails closed: anything inconclusive
/// is rejected, never allowed by default.
///
/// The column check is a best-effort static pass, not a SQL parser; it can let
/// invalid SQL through (execution catches that), but it must not reject
/// standard SQL that sticks to allowed objects and its own aliases.
pub struct Validator {
    catalog: Arc<Catalog>,
    blocked_word: Regex,
    copy_word: Regex,
    any_object: Regex,
    alias_bindings: Vec<(String, Regex)>,
    column_ref: Regex,
}

impl Validator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let words = BLOCKED_KEYWORDS
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        let blocked_word = Regex::new(&format!(r"(?i)\b({words})\b")).unwrap();
        // COPY is always dangerous, independent of the word list above.
        let copy_word = Regex::new(r"(?i)\bcopy\b").unwrap();

        let objects = catalog
            .objects()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");
        let any_object = Regex::new(&format!(r"(?i)\b({objects})\b")).unwrap();

        let alias_bindings = catalog
            .objects()
            .map(|obj| {
                let pat = format!(
                    r"\b{}\b\s+(?:as\s+)?([a-z][a-z0-9_]*)",
                    regex::escape(obj)
                );
                (obj.to_string(), Regex::new(&pat).unwrap())
            })
            .collect();

        let column_ref = Regex::new(r"\b([a-z][a-z0-9_]*)\.(\*|[a-z][a-z0-9_]*)").unwrap();

        Self {
            catalog,
            blocked_word,
            copy_word,
            any_object,
            alias_bindings,
            column_ref,
        }
    }

    /// Runs the full pipeline: shape, blocklist, object allow-list, columns.
    pub fn validate(&self, sql: &str) -> Result<(), Rejection> {
        if !self.is_single_select(sql) {
            return Err(Rejection::new(
                RejectionKind::NotSingleSelect,
                "statement must be a single SELECT or WITH query",
            ));
        }
        if let Some(kw) = self.blocked_keyword(sql) {
            return Err(Rejection::new(
                RejectionKind::BlockedKeyword,
                format!("blocked keyword in SQL: {kw}"),
            ));
        }
        if !self.mentions_allowed_object(sql) {
            return Err(Rejection::new(
                RejectionKind::DisallowedObject,
                "SQL references no allowed view or table",
            ));
        }
        if let Some(problems) = self.column_problems(sql) {
            return Err(Rejection::new(RejectionKind::UnknownColumn, problems));
        }
        Ok(())
    }

    /// Shape check: at most one trailing terminator, then the text must begin
    /// with SELECT or WITH and contain no further `;`.
    pub fn is_single_select(&self, sql: &str) -> bool {
        let s = sql.trim();
        let s = s.strip_suffix(';').map(str::trim_end).unwrap_or(s);
        let low = s.to_ascii_lowercase();
        if !(low.starts_with("select") || low.starts_with("with")) {
            return false;
        }
        !s.contains(';')
    }

    fn blocked_keyword(&self, sql: &str) -> Option<String> {
        if sql.contains(";--") {
            return Some(";--".to_string());
        }
        if let Some(m) = self.blocked_word.find(sql) {
            return Some(m.as_str().to_ascii_lowercase());
        }
        self.copy_word
            .find(sql)
            .map(|m| m.as_str().to_ascii_lowercase())
    }

    /// True when the statement mentions at least one allowed view or table as
    /// a whole word.
    pub fn mentions_allowed_object(&self, sql: &str) -> bool {
        self.any_object.is_match(sql)
    }

    /// Alias/column resolution. Builds an alias map from FROM/JOIN clauses over
    /// allowed objects, then checks every `alias.column` reference against the
    /// owning object's column set. An alias bound to a non-allowed object never
    /// enters the map, so its references read as undefined - that stays
    /// conservative on purpose. Objects may also qualify their own columns
    /// (`stores.store_id`). All distinct problems are reported together.
    fn column_problems(&self, sql: &str) -> Option<String> {
        let low = sql.to_ascii_lowercase();

        let mut alias_of: HashMap<String, &str> = HashMap::new();
        for (obj, binding) in &self.alias_bindings {
            alias_of.insert(obj.clone(), obj.as_str());
            for cap in binding.captures_iter(&low) {
                if let Some(alias) = cap.get(1) {
                    alias_of.insert(alias.as_str().to_string(), obj.as_str());
                }
            }
        }

        let mut problems: Vec<String> = Vec::new();
        for cap in self.column_ref.captures_iter(&low) {
            let alias = &cap[1];
            let column = &cap[2];
            match alias_of.get(alias) {
                None => problems.push(format!("undefined alias '{alias}'")),
                Some(obj) => {
                    if column == "*" {
                        continue;
                    }
                    let known = self
                        .catalog
                        .columns_of(obj)
                        .map(|cols| cols.contains(column))
                        .unwrap_or(false);
                    if !known {
                        problems.push(format!("{alias}.{column} not in {obj}"));
                    }
                }
            }
        }

        if problems.is_empty() {
            return None;
        }
        problems.sort();
        problems.dedup();
        Some(problems.join("; "))
    }

    /// Groundedness score for ranking race trials: one point each for an
    /// extractable candidate, a passing shape check, and a mention of an
    /// allowed object. Cheap by construction - no column check, no execution.
    pub fn grounding_score(&self, raw_text: &str) -> u8 {
        let Some(sql) = extract_sql(raw_text) else {
            return 0;
        };
        let mut score = 1;
        if self.is_single_select(&sql) {
            score += 1;
        }
        if self.mentions_allowed_object(&sql) {
            score += 1;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(Arc::new(Catalog::retail()))
    }

    #[test]
    fn accepts_plain_select_with_trailing_terminator() {
        let v = validator();
        assert!(v.validate("SELECT s.store_id FROM stores s;").is_ok());
    }

    #[test]
    fn rejects_second_statement() {
        let v = validator();
        let err = v
            .validate("SELECT 1 FROM stores; SELECT 2 FROM stores")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::NotSingleSelect);
    }

    #[test]
    fn rejects_non_select_shape() {
        let v = validator();
        let err = v.validate("SHOW TABLES").unwrap_err();
        assert_eq!(err.kind, RejectionKind::NotSingleSelect);
    }

    #[test]
    fn cte_alias_reads_as_undefined() {
        let v = validator();
        let sql = "WITH t AS (SELECT s.store_id FROM stores s) SELECT t.store_id FROM t";
        // `t` is not an allowed object, so t.store_id reads as undefined.
        let err = v.validate(sql).unwrap_err();
        assert_eq!(err.kind, RejectionKind::UnknownColumn);
        assert!(err.detail.contains("undefined alias 't'"));
    }

    #[test]
    fn rejects_mutating_keyword() {
        let v = validator();
        let err = v
            .validate("SELECT s.store_id FROM stores s WHERE 1=1 UNION SELECT 1 -- drop")
            .unwrap_err();
        // multi-word statement still single; DROP is caught by the blocklist
        assert_eq!(err.kind, RejectionKind::BlockedKeyword);
    }

    #[test]
    fn injection_sentinel_is_blocked() {
        // Anything carrying `;--` already fails the shape check, but the
        // blocklist stage must catch it on its own as well.
        let v = validator();
        assert_eq!(
            v.blocked_keyword("SELECT 1 FROM stores WHERE x = '';-- comment"),
            Some(";--".to_string())
        );
        let err = v
            .validate("SELECT 1 FROM stores WHERE x = '';-- comment")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::NotSingleSelect);
    }

    #[test]
    fn copy_is_always_rejected() {
        let v = validator();
        let err = v
            .validate("SELECT Copy FROM stores")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::BlockedKeyword);
    }

    #[test]
    fn rejects_statement_without_allowed_objects() {
        let v = validator();
        let err = v.validate("SELECT 1").unwrap_err();
        assert_eq!(err.kind, RejectionKind::DisallowedObject);
    }

    #[test]
    fn rejects_undefined_alias() {
        let v = validator();
        let err = v.validate("SELECT z.foo FROM stores s").unwrap_err();
        assert_eq!(err.kind, RejectionKind::UnknownColumn);
        assert!(err.detail.contains("undefined alias 'z'"));
    }

    #[test]
    fn accepts_known_alias_and_column() {
        let v = validator();
        assert!(v.validate("SELECT s.store_id FROM stores s").is_ok());
    }

    #[test]
    fn rejects_unknown_column_on_known_alias() {
        let v = validator();
        let err = v
            .validate("SELECT s.promo_id FROM v_sales_daily s")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::UnknownColumn);
        assert!(err.detail.contains("s.promo_id not in v_sales_daily"));
    }

    #[test]
    fn reports_all_problems_sorted_and_distinct() {
        let v = validator();
        let err = v
            .validate("SELECT z.a, z.a, s.nope FROM v_sales_daily s")
            .unwrap_err();
        assert_eq!(
            err.detail,
            "s.nope not in v_sales_daily; undefined alias 'z'"
        );
    }

    #[test]
    fn object_name_may_qualify_its_own_columns() {
        let v = validator();
        assert!(
            v.validate("SELECT stores.store_id FROM stores")
                .is_ok()
        );
    }

    #[test]
    fn star_reference_is_skipped() {
        let v = validator();
        assert!(v.validate("SELECT s.*, s.brand FROM v_sales_daily s").is_ok());
    }

    #[test]
    fn score_counts_candidate_shape_and_object_mention() {
        let v = validator();
        assert_eq!(v.grounding_score("no sql here"), 0);
        assert_eq!(v.grounding_score("select 1; select 2"), 1);
        assert_eq!(v.grounding_score("select 1"), 2);
        assert_eq!(
            v.grounding_score("```sql\nSELECT s.brand FROM v_sales_daily s\n```"),
            3
        );
    }
}
