use regex::Regex;
use std::sync::LazyLock;

static FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)```sql(.*?)```").unwrap());
static BARE_SELECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)\bselect\b.*").unwrap());

/// Pulls a single candidate SQL statement out of a model's free-text answer.
///
/// Extraction order: the first ```sql fenced block wins; failing that, the
/// first case-insensitive `select` token through the end of the text. This is
/// a textual step, not a SQL parse - whatever comes out still has to pass the
/// full validation pipeline. Same input always yields the same candidate.
pub fn extract_sql(text: &str) -> Option<String> {
    if let Some(m) = FENCE.captures(text) {
        let sql = m.get(1).map(|g| g.as_str().trim())?;
        if !sql.is_empty() {
            return Some(sql.to_string());
        }
        return None;
    }

    BARE_SELECT.find(text).map(|m| m.as_str().trim().to_string())
}
