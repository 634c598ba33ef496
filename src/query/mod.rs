use crate::db::freshness::FreshnessSource;
use crate::db::gateway::{ExecError, ExecutionGateway, ResultSet};
use crate::db::run_log::{LogSink, RunRecord};
use crate::guardrails::extract::extract_sql;
use crate::guardrails::repair::repair_known_errors;
use crate::guardrails::rewrite::Rewriter;
use crate::guardrails::{Rejection, RejectionKind, Validator};
use crate::llm::race::{RaceCoordinator, Trial, WinnerPolicy};
use crate::llm::ChatMessage;
use crate::prompts::{build_messages, build_repair_messages, PROMPT_VERSION, SCHEMA_VERSION};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a question could not be answered. Carries enough structure for the API
/// layer to render a useful error without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProvidersExhausted,
    NoSqlProduced,
    NotSingleSelect,
    BlockedKeyword,
    DisallowedObject,
    UnknownColumn,
    RepairExhausted,
}

#[derive(Debug, Serialize)]
pub struct QueryFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Everything each model produced, kept for inspection even on failure.
    pub trials: Vec<Trial>,
}

impl QueryFailure {
    fn new(kind: FailureKind, detail: impl Into<String>, trials: Vec<Trial>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            trials,
        }
    }

    fn from_rejection(rejection: Rejection, trials: Vec<Trial>) -> Self {
        let kind = match rejection.kind {
            RejectionKind::NoCandidate => FailureKind::NoSqlProduced,
            RejectionKind::NotSingleSelect => FailureKind::NotSingleSelect,
            RejectionKind::BlockedKeyword => FailureKind::BlockedKeyword,
            RejectionKind::DisallowedObject => FailureKind::DisallowedObject,
            RejectionKind::UnknownColumn => FailureKind::UnknownColumn,
        };
        Self::new(kind, rejection.detail, trials)
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for QueryFailure {}

/// A successfully answered question.
#[derive(Debug, Serialize)]
pub struct QueryOutcome {
    pub final_sql: String,
    pub result: ResultSet,
    pub winner: Trial,
    pub trials: Vec<Trial>,
    pub anchor_date: Option<NaiveDate>,
    pub repaired: bool,
}

/// End-to-end pipeline for one question: prompt, race, extract, validate,
/// rewrite, re-validate, execute, and at most one repair round. Every piece
/// of SQL that reaches the gateway has passed validation after its most
/// recent transformation.
pub struct QueryService {
    race: RaceCoordinator,
    validator: Arc<Validator>,
    rewriter: Rewriter,
    gateway: Arc<dyn ExecutionGateway>,
    freshness: Arc<dyn FreshnessSource>,
    run_log: Arc<dyn LogSink>,
    default_policy: WinnerPolicy,
}

impl QueryService {
    pub fn new(
        race: RaceCoordinator,
        validator: Arc<Validator>,
        rewriter: Rewriter,
        gateway: Arc<dyn ExecutionGateway>,
        freshness: Arc<dyn FreshnessSource>,
        run_log: Arc<dyn LogSink>,
        default_policy: WinnerPolicy,
    ) -> Self {
        Self {
            race,
            validator,
            rewriter,
            gateway,
            freshness,
            run_log,
            default_policy,
        }
    }

    pub async fn ask(
        &self,
        store_id: &str,
        user_id: &str,
        question: &str,
        policy: Option<WinnerPolicy>,
    ) -> Result<QueryOutcome, QueryFailure> {
        let policy = policy.unwrap_or(self.default_policy);
        let messages = build_messages(store_id, question);

        let (winner, mut trials) = self.race.run(&messages, policy).await.map_err(|e| {
            QueryFailure::new(FailureKind::ProvidersExhausted, e.detail, e.trials)
        })?;
        info!(
            model = %winner.model_id,
            score = winner.score,
            latency_ms = winner.latency_ms,
            "race winner"
        );

        let Some(sql) = extract_sql(&winner.raw_text) else {
            return Err(QueryFailure::new(
                FailureKind::NoSqlProduced,
                "winning answer contained no SELECT statement",
                trials,
            ));
        };
        if let Err(rejection) = self.validator.validate(&sql) {
            return Err(QueryFailure::from_rejection(rejection, trials));
        }

        let anchor = self.freshness.latest_date(store_id).await;
        let rewritten = self.rewriter.apply(&sql, store_id, anchor);
        if let Err(rejection) = self.validator.validate(&rewritten) {
            return Err(QueryFailure::from_rejection(rejection, trials));
        }
        debug!(sql = %rewritten, "executing");

        let (final_sql, result, winner, repaired) = match self.gateway.execute(&rewritten).await {
            Ok(result) => (rewritten, result, winner, false),
            Err(exec_err) => {
                let (sql, result, repair_winner) = self
                    .repair(&messages, &rewritten, &exec_err, store_id, anchor, policy, &mut trials)
                    .await?;
                (sql, result, repair_winner.unwrap_or(winner), true)
            }
        };

        self.run_log
            .record(RunRecord {
                user_id: user_id.to_string(),
                store_id: store_id.to_string(),
                question: question.to_string(),
                chosen_model: winner.model_id.clone(),
                latency_ms: winner.latency_ms,
                cost_usd: winner.cost_usd,
                trials: serde_json::to_value(&trials).unwrap_or(serde_json::Value::Null),
                prompt_version: PROMPT_VERSION.to_string(),
                schema_version: SCHEMA_VERSION.to_string(),
            })
            .await;

        Ok(QueryOutcome {
            final_sql,
            result,
            winner,
            trials,
            anchor_date: anchor,
            repaired,
        })
    }

    /// One repair round. A deterministic fix that survives validation gets
    /// the only retry; otherwise one model-assisted attempt gets it. The
    /// second execution failure is terminal.
    async fn repair(
        &self,
        base_messages: &[ChatMessage],
        failing_sql: &str,
        exec_err: &ExecError,
        store_id: &str,
        anchor: Option<NaiveDate>,
        policy: WinnerPolicy,
        trials: &mut Vec<Trial>,
    ) -> Result<(String, ResultSet, Option<Trial>), QueryFailure> {
        let err_text = exec_err.to_string();
        warn!(error = %err_text, "statement failed, attempting repair");

        if let Some(fixed) = repair_known_errors(failing_sql, &err_text) {
            let rewritten = self.rewriter.apply(&fixed, store_id, anchor);
            if self.validator.validate(&fixed).is_ok() && self.validator.validate(&rewritten).is_ok()
            {
                return match self.gateway.execute(&rewritten).await {
                    Ok(result) => {
                        info!("deterministic repair succeeded");
                        Ok((rewritten, result, None))
                    }
                    Err(e) => Err(QueryFailure::new(
                        FailureKind::RepairExhausted,
                        format!("repaired statement failed: {e}"),
                        std::mem::take(trials),
                    )),
                };
            }
            // An invalid fix is discarded; the model round takes over.
        }

        let repair_messages = build_repair_messages(base_messages, failing_sql, &err_text);
        let (repair_winner, repair_trials) =
            self.race.run(&repair_messages, policy).await.map_err(|e| {
                let mut all = std::mem::take(trials);
                all.extend(e.trials);
                QueryFailure::new(
                    FailureKind::RepairExhausted,
                    format!("repair round failed: {}", e.detail),
                    all,
                )
            })?;
        trials.extend(repair_trials);

        let Some(sql) = extract_sql(&repair_winner.raw_text) else {
            return Err(QueryFailure::new(
                FailureKind::RepairExhausted,
                "repair answer contained no SELECT statement",
                std::mem::take(trials),
            ));
        };
        if let Err(rejection) = self.validator.validate(&sql) {
            return Err(QueryFailure::new(
                FailureKind::RepairExhausted,
                format!("repair answer rejected: {rejection}"),
                std::mem::take(trials),
            ));
        }
        let rewritten = self.rewriter.apply(&sql, store_id, anchor);
        if let Err(rejection) = self.validator.validate(&rewritten) {
            return Err(QueryFailure::new(
                FailureKind::RepairExhausted,
                format!("repair answer rejected after rewrite: {rejection}"),
                std::mem::take(trials),
            ));
        }

        match self.gateway.execute(&rewritten).await {
            Ok(result) => {
                info!(model = %repair_winner.model_id, "model-assisted repair succeeded");
                Ok((rewritten, result, Some(repair_winner)))
            }
            Err(e) => Err(QueryFailure::new(
                FailureKind::RepairExhausted,
                format!("repaired statement failed: {e}"),
                std::mem::take(trials),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ModelDescriptor;
    use crate::llm::{Completion, LlmError, ProviderClient};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProvider {
        /// Answers returned in call order, shared across all model ids.
        answers: Mutex<Vec<Result<String, String>>>,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<Result<&str, &str>>) -> Self {
            Self {
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn send(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<Completion, LlmError> {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                return Err(LlmError::Transport("no scripted answer".into()));
            }
            match answers.remove(0) {
                Ok(text) => Ok(Completion {
                    text,
                    prompt_tokens: 100,
                    completion_tokens: 50,
                }),
                Err(e) => Err(LlmError::Response(e)),
            }
        }
    }

    struct FakeGateway {
        /// Scripted outcomes per execute call; `Err` text becomes an
        /// execution error. Captures every statement it is handed.
        outcomes: Mutex<Vec<Result<ResultSet, String>>>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeGateway {
        fn new(outcomes: Vec<Result<ResultSet, String>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn succeeding() -> Self {
            Self::new(vec![Ok(one_row())])
        }
    }

    fn one_row() -> ResultSet {
        ResultSet {
            columns: vec!["n".into()],
            rows: vec![vec![serde_json::json!(1)]],
        }
    }

    #[async_trait]
    impl ExecutionGateway for FakeGateway {
        async fn execute(&self, sql: &str) -> Result<ResultSet, ExecError> {
            self.seen.lock().unwrap().push(sql.to_string());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Ok(one_row());
            }
            outcomes.remove(0).map_err(ExecError::Execution)
        }
    }

    struct FixedFreshness(Option<NaiveDate>);

    #[async_trait]
    impl FreshnessSource for FixedFreshness {
        async fn latest_date(&self, _store_id: &str) -> Option<NaiveDate> {
            self.0
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        records: Mutex<Vec<RunRecord>>,
    }

    #[async_trait]
    impl LogSink for CapturingSink {
        async fn record(&self, record: RunRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn anchor() -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2024, 12, 1)
    }

    fn service(
        provider: ScriptedProvider,
        gateway: Arc<FakeGateway>,
        sink: Arc<CapturingSink>,
    ) -> QueryService {
        let catalog = Arc::new(Catalog::retail());
        let validator = Arc::new(Validator::new(Arc::clone(&catalog)));
        let models = vec![ModelDescriptor {
            id: "test/model".into(),
            input_price_per_1k: 0.001,
            output_price_per_1k: 0.002,
        }];
        let race = RaceCoordinator::new(
            Arc::new(provider),
            models,
            Arc::clone(&validator),
            600,
            0.1,
        );
        QueryService::new(
            race,
            validator,
            Rewriter::new(200),
            gateway,
            Arc::new(FixedFreshness(anchor())),
            sink,
            WinnerPolicy::Cheapest,
        )
    }

    #[tokio::test]
    async fn happy_path_scopes_caps_and_anchors() {
        let provider = ScriptedProvider::new(vec![Ok(
            "```sql\nSELECT s.product_name, SUM(s.units_sold * s.sale_price) AS revenue\n\
             FROM v_sales_daily s\n\
             WHERE s.date >= CURRENT_DATE - INTERVAL '6 days'\n\
             GROUP BY s.product_name\nORDER BY revenue DESC\nLIMIT 5\n```",
        )]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), Arc::clone(&sink));

        let outcome = svc
            .ask("S001", "u1", "Top 5 products by revenue in the last 7 days", None)
            .await
            .unwrap();

        assert!(outcome.final_sql.contains("store_id = 'S001'"));
        assert!(outcome.final_sql.to_lowercase().contains("limit"));
        assert!(!outcome.final_sql.to_uppercase().contains("CURRENT_DATE"));
        assert!(outcome.final_sql.contains("'2024-12-01'::date"));
        assert!(!outcome.repaired);
        assert_eq!(outcome.result.rows.len(), 1);

        // The statement the gateway saw is the rewritten one.
        let seen = gateway.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], outcome.final_sql);
    }

    #[tokio::test]
    async fn successful_run_is_logged() {
        let provider = ScriptedProvider::new(vec![Ok(
            "```sql\nSELECT store_name FROM stores WHERE store_id = 'S001'\n```",
        )]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, gateway, Arc::clone(&sink));

        svc.ask("S001", "analyst", "what is my store called?", None)
            .await
            .unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "analyst");
        assert_eq!(records[0].chosen_model, "test/model");
        assert_eq!(records[0].prompt_version, PROMPT_VERSION);
        assert!(records[0].trials.is_array());
    }

    #[tokio::test]
    async fn no_select_in_answer_fails_without_execution() {
        let provider =
            ScriptedProvider::new(vec![Ok("I cannot answer that question, sorry.")]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), sink);

        let err = svc.ask("S001", "u1", "hi", None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::NoSqlProduced);
        assert_eq!(err.trials.len(), 1);
        assert!(gateway.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_statement_is_rejected() {
        let provider = ScriptedProvider::new(vec![Ok(
            "```sql\nSELECT * FROM stores; DROP TABLE stores\n```",
        )]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), sink);

        let err = svc.ask("S001", "u1", "drop it", None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::NotSingleSelect);
        assert!(gateway.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn providers_exhausted_surfaces_trials() {
        let provider = ScriptedProvider::new(vec![
            Err("500 upstream"),
            Err("500 upstream"),
            Err("500 upstream"),
        ]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, gateway, sink);

        let err = svc.ask("S001", "u1", "anything", None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ProvidersExhausted);
        assert_eq!(err.trials.len(), 1);
        assert!(err.trials[0].error.is_some());
    }

    #[tokio::test]
    async fn deterministic_repair_retries_once() {
        let provider = ScriptedProvider::new(vec![Ok(
            "```sql\nSELECT pa.store_id, COUNT(DISTINCT s.promo_id) AS promos\n\
             FROM sales_transactions s JOIN v_promos_active pa ON pa.article_no = s.article_no\n\
             WHERE s.store_id = 'S001'\nGROUP BY pa.store_id\n```",
        )]);
        let gateway = Arc::new(FakeGateway::new(vec![
            Err("Binder Error: column s.promo_id does not exist".into()),
            Ok(one_row()),
        ]));
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), sink);

        let outcome = svc
            .ask("S001", "u1", "how many promos ran?", None)
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert!(outcome
            .final_sql
            .contains("COUNT(DISTINCT pa.promo_id)"));
        let seen = gateway.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        // No second race: the lone scripted answer was consumed by the first.
        assert_eq!(outcome.trials.len(), 1);
    }

    #[tokio::test]
    async fn model_assisted_repair_runs_one_more_race() {
        let provider = ScriptedProvider::new(vec![
            Ok("```sql\nSELECT product_name FROM v_sales_daily WHERE store_id = 'S001' AND brand = 'Acme'\n```"),
            Ok("```sql\nSELECT product_name FROM v_sales_daily WHERE store_id = 'S001' AND LOWER(brand) = LOWER('Acme')\n```"),
        ]);
        let gateway = Arc::new(FakeGateway::new(vec![
            Err("Conversion Error: something unrecognized".into()),
            Ok(one_row()),
        ]));
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), Arc::clone(&sink));

        let outcome = svc
            .ask("S001", "u1", "acme products?", None)
            .await
            .unwrap();

        assert!(outcome.repaired);
        assert!(outcome.final_sql.contains("LOWER(brand)"));
        assert_eq!(outcome.trials.len(), 2);
        assert_eq!(gateway.seen.lock().unwrap().len(), 2);
        // The repair winner is credited in the run log.
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_deterministic_fix_falls_through_to_model_round() {
        // The error-keyed fix rewrites the count onto `pa`, but here `pa` is
        // only an output column alias, never a table binding - the fixed
        // statement fails validation and the model round must take over.
        let provider = ScriptedProvider::new(vec![
            Ok("```sql\nSELECT s.store_id, COUNT(DISTINCT s.promo_id) AS pa\n\
                FROM sales_transactions s\n\
                JOIN v_promos_active ON v_promos_active.article_no = s.article_no\n\
                WHERE s.store_id = 'S001'\nGROUP BY s.store_id\nORDER BY pa\n```"),
            Ok("```sql\nSELECT pa.store_id, COUNT(DISTINCT pa.promo_id) AS promos\n\
                FROM v_promos_active pa WHERE pa.store_id = 'S001'\nGROUP BY pa.store_id\n```"),
        ]);
        let gateway = Arc::new(FakeGateway::new(vec![
            Err("Binder Error: column s.promo_id does not exist".into()),
            Ok(one_row()),
        ]));
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), sink);

        let outcome = svc
            .ask("S001", "u1", "how many promos ran?", None)
            .await
            .unwrap();

        assert!(outcome.repaired);
        // The discarded fix never reaches the gateway; the model's answer does.
        let seen = gateway.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].contains("FROM v_promos_active pa"));
        assert_eq!(outcome.trials.len(), 2);
    }

    #[tokio::test]
    async fn second_failure_is_terminal() {
        let provider = ScriptedProvider::new(vec![
            Ok("```sql\nSELECT product_name FROM v_sales_daily WHERE store_id = 'S001'\n```"),
            Ok("```sql\nSELECT product_name FROM v_sales_daily WHERE store_id = 'S001'\n```"),
        ]);
        let gateway = Arc::new(FakeGateway::new(vec![
            Err("IO Error: disk on fire".into()),
            Err("IO Error: disk still on fire".into()),
        ]));
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), Arc::clone(&sink));

        let err = svc.ask("S001", "u1", "products?", None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::RepairExhausted);
        assert!(err.detail.contains("disk still on fire"));
        // Only two executions total: original plus the single retry.
        assert_eq!(gateway.seen.lock().unwrap().len(), 2);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewrite_result_is_revalidated() {
        // The rewriter never introduces new objects, so the post-rewrite
        // validation passes whenever the pre-rewrite one did.
        let provider = ScriptedProvider::new(vec![Ok(
            "```sql\nSELECT region FROM stores WHERE store_type = 'metro' ORDER BY region\n```",
        )]);
        let gateway = Arc::new(FakeGateway::succeeding());
        let sink = Arc::new(CapturingSink::default());
        let svc = service(provider, Arc::clone(&gateway), sink);

        let outcome = svc.ask("S001", "u1", "regions?", None).await.unwrap();
        assert!(outcome.final_sql.contains("store_id = 'S001'"));
        assert!(outcome.final_sql.contains("LIMIT 200"));
    }
}
