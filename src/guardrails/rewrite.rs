use chrono::NaiveDate;
use regex::Regex;

/// Aliases the fact-object scan must never mistake for a table alias.
const RESERVED_AFTER_OBJECT: &[&str] = &[
    "where", "group", "having", "order", "limit", "join", "inner", "left", "right", "full",
    "cross", "union", "on", "using", "natural",
];

/// Deterministic text transforms applied (in order) to every validated
/// statement before execution: store-scope injection, result-size capping and
/// temporal anchoring. Each transform is idempotent, so the whole sequence can
/// be re-run safely - the repair path relies on that.
pub struct Rewriter {
    default_limit: u32,
    store_predicate: Regex,
    fact_bindings: Vec<Regex>,
    where_kw: Regex,
    tail_kw: Regex,
    limit_kw: Regex,
    aggregate_shape: Regex,
    ts_cast_to_date: Regex,
    day_trunc_now: Regex,
    current_date: Regex,
    now_call: Regex,
    current_ts: Regex,
}

impl Rewriter {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            store_predicate: Regex::new(r"(?i)\bstore_id\s*=\s*'[^']*'").unwrap(),
            // The daily-sales view is the preferred fact object; the raw
            // transactions table is the fallback.
            fact_bindings: vec![
                Regex::new(r"(?i)\bfrom\s+v_sales_daily\s+(?:as\s+)?([a-zA-Z][a-zA-Z0-9_]*)")
                    .unwrap(),
                Regex::new(r"(?i)\bfrom\s+sales_transactions\s+(?:as\s+)?([a-zA-Z][a-zA-Z0-9_]*)")
                    .unwrap(),
            ],
            where_kw: Regex::new(r"(?i)\bwhere\b").unwrap(),
            tail_kw: Regex::new(r"(?i)\b(group\s+by|having|order\s+by|limit)\b").unwrap(),
            limit_kw: Regex::new(r"(?i)\blimit\b").unwrap(),
            aggregate_shape: Regex::new(
                r"(?i)\bgroup\s+by\b|\bsum\s*\(|\bavg\s*\(|\bcount\s*\(|\bmax\s*\(|\bmin\s*\(",
            )
            .unwrap(),
            ts_cast_to_date: Regex::new(r"(?i)\bcurrent_timestamp\s*::\s*date\b").unwrap(),
            day_trunc_now: Regex::new(r"(?i)date_trunc\(\s*'day'\s*,\s*now\(\)\s*\)").unwrap(),
            current_date: Regex::new(r"(?i)\bcurrent_date\b").unwrap(),
            now_call: Regex::new(r"(?i)\bnow\(\)").unwrap(),
            current_ts: Regex::new(r"(?i)\bcurrent_timestamp\b").unwrap(),
        }
    }

    /// Full rewrite sequence. The one permitted trailing terminator is dropped
    /// up front so the transforms can append clauses.
    pub fn apply(&self, sql: &str, store_id: &str, anchor: Option<NaiveDate>) -> String {
        let s = strip_terminator(sql);
        let s = self.inject_store_scope(&s, store_id);
        let s = self.cap_rows(&s);
        self.anchor_dates(&s, anchor)
    }

    /// Ensures a `store_id = '<id>'` predicate is present, qualified by the
    /// fact object's alias when one is declared. An existing WHERE clause is
    /// kept intact by wrapping its predicate in parentheses, so a top-level OR
    /// keeps its meaning.
    pub fn inject_store_scope(&self, sql: &str, store_id: &str) -> String {
        if self.store_predicate.is_match(sql) {
            return sql.to_string();
        }

        let alias = self.fact_bindings.iter().find_map(|binding| {
            binding.captures(sql).and_then(|cap| {
                let name = cap.get(1)?.as_str();
                if RESERVED_AFTER_OBJECT.contains(&name.to_ascii_lowercase().as_str()) {
                    None
                } else {
                    Some(name.to_string())
                }
            })
        });

        let predicate = match alias {
            Some(a) => format!("{a}.store_id = '{store_id}'"),
            None => format!("store_id = '{store_id}'"),
        };

        if let Some(m) = self.where_kw.find(sql) {
            let (head, rest) = sql.split_at(m.end());
            // Only the predicate gets wrapped; GROUP BY / ORDER BY / LIMIT
            // stay outside the parentheses.
            let (existing, tail) = match self.tail_kw.find(rest) {
                Some(t) => rest.split_at(t.start()),
                None => (rest, ""),
            };
            let sep = if tail.is_empty() { "" } else { " " };
            return format!("{head} {predicate} AND ({}){sep}{tail}", existing.trim());
        }

        if let Some(m) = self.tail_kw.find(sql) {
            let (head, tail) = sql.split_at(m.start());
            let spacer = if head.ends_with(char::is_whitespace) {
                ""
            } else {
                " "
            };
            return format!("{head}{spacer}WHERE {predicate} {tail}");
        }

        let spacer = if sql.ends_with(char::is_whitespace) {
            ""
        } else {
            " "
        };
        format!("{sql}{spacer}WHERE {predicate}")
    }

    /// Appends `LIMIT <default>` unless a LIMIT already exists or the statement
    /// is aggregate-shaped - aggregates return few rows by construction.
    pub fn cap_rows(&self, sql: &str) -> String {
        let s = sql.trim_end();
        if self.limit_kw.is_match(s) {
            return s.to_string();
        }
        if self.aggregate_shape.is_match(s) {
            return s.to_string();
        }
        let s = strip_terminator(s);
        format!("{s} LIMIT {}", self.default_limit)
    }

    /// Replaces wall-clock "now" references with constants derived from the
    /// dataset's latest known date. Without an anchor this is a no-op: the
    /// statement keeps wall-clock time, which is a degraded mode, not an
    /// error. The cast and date_trunc forms go first so the bare keyword
    /// patterns cannot eat them halfway.
    pub fn anchor_dates(&self, sql: &str, anchor: Option<NaiveDate>) -> String {
        let Some(date) = anchor else {
            return sql.to_string();
        };
        let d = date.format("%Y-%m-%d").to_string();

        let s = self
            .ts_cast_to_date
            .replace_all(sql, format!("'{d}'::date"));
        let s = self
            .day_trunc_now
            .replace_all(&s, format!("'{d}'::timestamp"));
        let s = self.current_date.replace_all(&s, format!("'{d}'::date"));
        let s = self.now_call.replace_all(&s, format!("'{d}'::timestamp"));
        let s = self.current_ts.replace_all(&s, format!("'{d}'::timestamp"));
        s.into_owned()
    }
}

fn strip_terminator(sql: &str) -> String {
    let s = sql.trim_end();
    s.strip_suffix(';').map(str::trim_end).unwrap_or(s).to_string()
}
