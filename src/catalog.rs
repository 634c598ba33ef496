use std::collections::{HashMap, HashSet};

/// Mutating / administrative keywords that must never appear in generated SQL.
/// `;--` is the comment-based statement-termination sentinel and is matched as a
/// literal substring rather than a whole word.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "update",
    "delete",
    "insert",
    "alter",
    "drop",
    "grant",
    "revoke",
    "truncate",
    "create",
    "copy",
    "call",
    "execute",
    "prepare",
    "deallocate",
    "explain",
    "vacuum",
    "analyze",
    "listen",
    "notify",
];

/// The views and tables generated SQL is allowed to touch, together with their
/// column sets. Built once at startup and shared read-only; concurrent readers
/// need no synchronization.
#[derive(Debug, Clone)]
pub struct Catalog {
    views: Vec<String>,
    tables: Vec<String>,
    columns: HashMap<String, HashSet<String>>,
}

impl Catalog {
    /// The retail analytics catalog: two reporting views (preferred) plus the
    /// base tables they are derived from.
    pub fn retail() -> Self {
        let mut columns = HashMap::new();

        columns.insert(
            "v_sales_daily".to_string(),
            cols(&[
                "date",
                "promo_week_start_wed",
                "store_id",
                "article_no",
                "product_name",
                "brand",
                "category",
                "sub_category",
                "regular_price",
                "order_multiple",
                "base_demand",
                "is_high_velocity",
                "units_sold",
                "sale_price",
                "is_promo",
                "discount_pct",
                "promo_channel",
                "has_endcap",
                "on_promo_bay",
                "price_ratio",
            ]),
        );
        columns.insert(
            "v_promos_active".to_string(),
            cols(&[
                "promo_id",
                "article_no",
                "store_id",
                "start_date",
                "end_date",
                "active_date",
                "offer_type",
                "discount_pct",
                "promo_channel",
                "has_endcap",
                "on_promo_bay",
                "brand",
                "category",
                "sub_category",
            ]),
        );
        columns.insert(
            "sales_transactions".to_string(),
            cols(&[
                "date",
                "store_id",
                "article_no",
                "units_sold",
                "sale_price",
                "is_promo",
                "promo_id",
            ]),
        );
        columns.insert(
            "stores".to_string(),
            cols(&[
                "store_id",
                "store_name",
                "region",
                "store_type",
                "opening_date",
                "store_area_sqm",
            ]),
        );
        columns.insert(
            "brands".to_string(),
            cols(&["brand", "category", "sub_category", "promo_allowed"]),
        );
        columns.insert(
            "products".to_string(),
            cols(&[
                "article_no",
                "product_name",
                "brand",
                "category",
                "sub_category",
                "regular_price",
                "order_multiple",
                "base_demand",
                "is_high_velocity",
            ]),
        );
        columns.insert(
            "promotions".to_string(),
            cols(&[
                "promo_id",
                "article_no",
                "store_id",
                "start_date",
                "end_date",
                "offer_type",
                "discount_pct",
                "promo_channel",
                "has_endcap",
                "on_promo_bay",
                "brand",
                "category",
                "sub_category",
            ]),
        );

        Self {
            views: vec!["v_sales_daily".to_string(), "v_promos_active".to_string()],
            tables: vec![
                "stores".to_string(),
                "brands".to_string(),
                "products".to_string(),
                "promotions".to_string(),
                "sales_transactions".to_string(),
            ],
            columns,
        }
    }

    pub fn views(&self) -> &[String] {
        &self.views
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// All allowed object names, views first.
    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.views
            .iter()
            .chain(self.tables.iter())
            .map(String::as_str)
    }

    pub fn columns_of(&self, object: &str) -> Option<&HashSet<String>> {
        self.columns.get(object)
    }

    /// Expected CSV columns for a base table; used to sanity-check seed files
    /// before they reach the database.
    pub fn expected_csv_columns(&self, table: &str) -> Option<Vec<String>> {
        if !self.tables.iter().any(|t| t == table) {
            return None;
        }
        self.columns.get(table).map(|set| {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        })
    }
}

fn cols(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retail_catalog_has_both_views_and_all_base_tables() {
        let cat = Catalog::retail();
        assert_eq!(cat.views().len(), 2);
        assert_eq!(cat.tables().len(), 5);
        assert_eq!(cat.objects().count(), 7);
    }

    #[test]
    fn daily_sales_view_has_no_promo_id_column() {
        // promo identifiers live on v_promos_active only; the column check and
        // the deterministic repair both depend on this.
        let cat = Catalog::retail();
        assert!(!cat.columns_of("v_sales_daily").unwrap().contains("promo_id"));
        assert!(cat.columns_of("v_promos_active").unwrap().contains("promo_id"));
    }
}
