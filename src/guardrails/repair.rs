use regex::Regex;
use std::sync::LazyLock;

static PROMO_ALIAS_IN_SCOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bv_promos_active\b.*\bpa\b").unwrap());
static PROMO_COUNT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcount\s*\(\s*distinct\s*s\.promo_id\s*\)").unwrap());
static PRODUCTS_BRAND_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bp\.brand\b").unwrap());
static SALES_ALIAS_IN_SCOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bv_sales_daily\b.*\bs\b").unwrap());

/// Precision fixes for alias/column mistakes the models make over and over,
/// keyed off the backend's error text. Returns the fixed statement only when
/// something actually changed; the caller re-validates before executing.
///
/// This is deliberately a short list. Anything it cannot fix falls through to
/// the one-shot model-assisted repair.
pub fn repair_known_errors(sql: &str, db_error: &str) -> Option<String> {
    let err = db_error.to_ascii_lowercase();
    let mut fixed = sql.to_string();

    // Models keep reading promo_id off the daily-sales alias even though that
    // column only exists on v_promos_active. When the expected join is
    // present, move the count over to the promo alias.
    if err.contains("column s.promo_id does not exist") && PROMO_ALIAS_IN_SCOPE.is_match(&fixed) {
        fixed = PROMO_COUNT_REF
            .replace_all(&fixed, "COUNT(DISTINCT pa.promo_id)")
            .into_owned();
    }

    // brand is denormalized onto v_sales_daily; a stray products alias isn't
    // needed when the view is already in scope as `s`.
    if PRODUCTS_BRAND_REF.is_match(&fixed) && SALES_ALIAS_IN_SCOPE.is_match(&fixed) {
        fixed = PRODUCTS_BRAND_REF.replace_all(&fixed, "s.brand").into_owned();
    }

    if fixed == sql { None } else { Some(fixed) }
}
