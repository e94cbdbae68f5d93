use crate::error::{serde_error, SessionError, SessionResult, ValidationError};
use crate::validator;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Version tag written into every persisted record.
pub const SERIALIZATION_VERSION: &str = "1.0";

/// Template reference attached to records when the caller does not pick one.
pub const DEFAULT_CONTRACT_TEMPLATE: &str = "purchase_contract";

const SUMMARY_LIMIT: usize = 200;

/// Opaque identifier of one purchase-contract conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub(crate) String);

impl SessionId {
    /// Wraps a caller-supplied identifier, rejecting blank values.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyField("session_id"));
        }
        Ok(Self(raw))
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Fixed vocabulary of contract workflow states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Start,
    Search,
    RefineConstraints,
    CollectPreferences,
    MatchPreferences,
    ConfirmPurchase,
    Completed,
    Cancelled,
    Failed,
}

impl ContractState {
    pub const ALL: [ContractState; 9] = [
        ContractState::Start,
        ContractState::Search,
        ContractState::RefineConstraints,
        ContractState::CollectPreferences,
        ContractState::MatchPreferences,
        ContractState::ConfirmPurchase,
        ContractState::Completed,
        ContractState::Cancelled,
        ContractState::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ContractState::Start => "start",
            ContractState::Search => "search",
            ContractState::RefineConstraints => "refine_constraints",
            ContractState::CollectPreferences => "collect_preferences",
            ContractState::MatchPreferences => "match_preferences",
            ContractState::ConfirmPurchase => "confirm_purchase",
            ContractState::Completed => "completed",
            ContractState::Cancelled => "cancelled",
            ContractState::Failed => "failed",
        }
    }

    /// True for states after which the contract accepts no further work.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ContractState::Completed | ContractState::Cancelled | ContractState::Failed
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractState {
    type Err = ValidationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyField("current_state"));
        }
        ContractState::ALL
            .into_iter()
            .find(|state| state.as_str() == name)
            .ok_or_else(|| ValidationError::UnknownState(name.to_owned()))
    }
}

/// Lifecycle flag of the contract, tracked next to the workflow state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    #[default]
    Active,
    Cancelled,
    Completed,
    Failed,
}

impl ContractStatus {
    /// Checks the status against a workflow state. An active contract must not sit in a
    /// terminal state, and a closed contract must sit in its matching terminal state.
    pub fn is_consistent_with(self, state: ContractState) -> bool {
        match self {
            ContractStatus::Active => !state.is_terminal(),
            ContractStatus::Cancelled => state == ContractState::Cancelled,
            ContractStatus::Completed => state == ContractState::Completed,
            ContractStatus::Failed => state == ContractState::Failed,
        }
    }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct Transition {
    pub from: ContractState,
    pub to: ContractState,
    #[serde(with = "time::serde::rfc3339")]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub at: OffsetDateTime,
}

impl Transition {
    /// Renders the `step_log` entry for this transition.
    pub fn step_entry(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// Outcome of a single run of an external pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PipelineExecution {
    #[serde(with = "time::serde::rfc3339")]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub timestamp: OffsetDateTime,
    pub status: String,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub result_summary: String,
}

/// Contract progress of one session.
///
/// Fields are private so that `current_state` and `step_log` can only move together through
/// [`SessionContext::update_state`].
#[derive(Clone, Debug, PartialEq)]
pub struct SessionContext {
    session_id: SessionId,
    current_state: ContractState,
    step_log: Vec<String>,
    state_history: Vec<Transition>,
    preferences: Map<String, Value>,
    constraints: Vec<Value>,
    search_results: Vec<Value>,
    selected_product: Option<Value>,
    extracted_attributes: Map<String, Value>,
    tools_used: Vec<String>,
    pipeline_executions: BTreeMap<String, Vec<PipelineExecution>>,
    last_pipeline_results: BTreeMap<String, Value>,
    pipeline_metrics: BTreeMap<String, f64>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    contract_status: ContractStatus,
}

impl SessionContext {
    /// Starts a new contract in [`ContractState::Start`].
    pub fn new(session_id: SessionId) -> Self {
        Self::starting_at(session_id, ContractState::Start)
    }

    /// Starts a new contract in an arbitrary initial state.
    pub fn starting_at(session_id: SessionId, state: ContractState) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id,
            current_state: state,
            step_log: Vec::new(),
            state_history: Vec::new(),
            preferences: Map::new(),
            constraints: Vec::new(),
            search_results: Vec::new(),
            selected_product: None,
            extracted_attributes: Map::new(),
            tools_used: Vec::new(),
            pipeline_executions: BTreeMap::new(),
            last_pipeline_results: BTreeMap::new(),
            pipeline_metrics: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            contract_status: ContractStatus::Active,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn current_state(&self) -> ContractState {
        self.current_state
    }

    pub fn step_log(&self) -> &[String] {
        &self.step_log
    }

    pub fn state_history(&self) -> &[Transition] {
        &self.state_history
    }

    pub fn preferences(&self) -> &Map<String, Value> {
        &self.preferences
    }

    pub fn constraints(&self) -> &[Value] {
        &self.constraints
    }

    pub fn search_results(&self) -> &[Value] {
        &self.search_results
    }

    pub fn selected_product(&self) -> Option<&Value> {
        self.selected_product.as_ref()
    }

    pub fn extracted_attributes(&self) -> &Map<String, Value> {
        &self.extracted_attributes
    }

    pub fn tools_used(&self) -> &[String] {
        &self.tools_used
    }

    pub fn pipeline_executions(&self, name: &str) -> &[PipelineExecution] {
        self.pipeline_executions
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn last_pipeline_result(&self, name: &str) -> Option<&Value> {
        self.last_pipeline_results.get(name)
    }

    /// Derived per-pipeline metrics such as `"{name}_avg_time"`.
    pub fn pipeline_metrics(&self) -> &BTreeMap<String, f64> {
        &self.pipeline_metrics
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn contract_status(&self) -> ContractStatus {
        self.contract_status
    }

    /// Moves to `new_state`, appending the transition to the step log in the same call.
    ///
    /// Legality is not checked here; see [`SessionContext::try_transition`].
    /// Transition timestamps strictly increase within one context.
    pub fn update_state(&mut self, new_state: ContractState) -> Transition {
        let mut now = OffsetDateTime::now_utc();
        if let Some(last) = self.state_history.last() {
            if now <= last.at {
                now = last.at + time::Duration::nanoseconds(1);
            }
        }
        let transition = Transition {
            from: self.current_state,
            to: new_state,
            at: now,
        };
        self.step_log.push(transition.step_entry());
        self.state_history.push(transition.clone());
        self.current_state = new_state;
        self.updated_at = now;
        transition
    }

    /// Validates `target` as a state name and as a transition from the current state, then
    /// applies it.
    pub fn try_transition(&mut self, target: &str) -> SessionResult<Transition> {
        let rejected = || SessionError::InvalidTransition {
            from: self.current_state.to_string(),
            to: target.to_owned(),
        };
        if !validator::is_valid_transition(self.current_state.as_str(), target) {
            return Err(rejected());
        }
        let state: ContractState = target.parse().map_err(|_| rejected())?;
        Ok(self.update_state(state))
    }

    /// Appends an execution record for `name` and stores `result` as its latest output.
    ///
    /// Missing `status` falls back to `"unknown"`, a missing time to `0`. When
    /// `execution_time` is supplied the `"{name}_avg_time"` metric is recomputed. Times that
    /// are NaN or infinite count as missing, since JSON cannot carry them.
    pub fn record_pipeline_execution(
        &mut self,
        name: &str,
        result: &Value,
        execution_time: Option<f64>,
    ) {
        let now = OffsetDateTime::now_utc();
        let status = result
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let execution_time = execution_time.filter(|time| time.is_finite());
        let recorded_time = execution_time
            .or_else(|| result.get("execution_time").and_then(Value::as_f64))
            .filter(|time| time.is_finite())
            .unwrap_or(0.0);

        let runs = self.pipeline_executions.entry(name.to_owned()).or_default();
        runs.push(PipelineExecution {
            timestamp: now,
            status,
            execution_time: recorded_time,
            result_summary: summarize(result),
        });

        if execution_time.is_some() {
            let total: f64 = runs.iter().map(|run| run.execution_time).sum();
            let average = total / runs.len() as f64;
            if average.is_finite() {
                self.pipeline_metrics
                    .insert(format!("{name}_avg_time"), average);
            }
        }

        self.last_pipeline_results
            .insert(name.to_owned(), result.clone());
        self.updated_at = now;
    }

    pub fn set_preference(&mut self, key: impl Into<String>, value: Value) {
        self.preferences.insert(key.into(), value);
        self.touch();
    }

    pub fn add_constraint(&mut self, constraint: Value) {
        self.constraints.push(constraint);
        self.touch();
    }

    pub fn set_search_results(&mut self, results: Vec<Value>) {
        self.search_results = results;
        self.touch();
    }

    pub fn select_product(&mut self, product: Option<Value>) {
        self.selected_product = product;
        self.touch();
    }

    pub fn set_extracted_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.extracted_attributes.insert(key.into(), value);
        self.touch();
    }

    /// Records that a tool was used; repeated names are kept once.
    pub fn record_tool_use(&mut self, tool: impl Into<String>) {
        let tool = tool.into();
        if !self.tools_used.contains(&tool) {
            self.tools_used.push(tool);
        }
        self.touch();
    }

    pub fn set_contract_status(&mut self, status: ContractStatus) {
        self.contract_status = status;
        self.touch();
    }

    /// Whether `contract_status` agrees with `current_state`.
    pub fn status_consistent(&self) -> bool {
        self.contract_status.is_consistent_with(self.current_state)
    }

    /// Checks that `current_state` is the target of the last step log entry.
    pub fn check_consistency(&self) -> Result<(), ValidationError> {
        validator::check_state_log(&self.step_log, self.current_state)
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Projects the context into its persisted form using the default template reference.
    pub fn serialize(&self) -> SessionResult<StoredSession> {
        self.serialize_with_template(DEFAULT_CONTRACT_TEMPLATE)
    }

    /// Projects the context into its persisted form.
    ///
    /// Fails when the context is corrupted: blank identifier or a step log that disagrees
    /// with `current_state`.
    pub fn serialize_with_template(&self, contract_template: &str) -> SessionResult<StoredSession> {
        if self.session_id.as_str().trim().is_empty() {
            return Err(SessionError::Serialization(ValidationError::EmptyField(
                "session_id",
            )));
        }
        self.check_consistency()
            .map_err(SessionError::Serialization)?;

        Ok(StoredSession {
            serialization_version: SERIALIZATION_VERSION.to_owned(),
            session_id: self.session_id.as_str().to_owned(),
            current_state: self.current_state.as_str().to_owned(),
            step_log: self.step_log.clone(),
            fsm_state_history: self.state_history.clone(),
            preferences: self.preferences.clone(),
            constraints: self.constraints.clone(),
            search_results: self.search_results.clone(),
            selected_product: self.selected_product.clone(),
            extracted_attributes: self.extracted_attributes.clone(),
            tools_used: self.tools_used.clone(),
            pipeline_executions: self.pipeline_executions.clone(),
            last_pipeline_results: self.last_pipeline_results.clone(),
            pipeline_performance_metrics: self.pipeline_metrics.clone(),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
            contract_status: self.contract_status,
            contract_template: contract_template.to_owned(),
        })
    }

    /// Rebuilds a context from an untyped record.
    ///
    /// `session_id` and `current_state` must be present non-empty strings and the state must
    /// be known. Unknown keys are ignored, missing or `null` containers become empty.
    pub fn deserialize(data: &Value) -> SessionResult<Self> {
        let Some(object) = data.as_object() else {
            return Err(SessionError::Codec(
                "session record must be a JSON object".into(),
            ));
        };
        require_string(object, "session_id")?;
        require_string(object, "current_state")?;
        let stored: StoredSession = serde_json::from_value(data.clone()).map_err(serde_error)?;
        Self::from_stored(stored)
    }

    /// Rebuilds a context from its typed persisted form, applying the same checks as
    /// [`SessionContext::deserialize`].
    pub fn from_stored(stored: StoredSession) -> SessionResult<Self> {
        let version_major = stored
            .serialization_version
            .split('.')
            .next()
            .unwrap_or_default();
        if version_major != "1" {
            return Err(SessionError::Deserialization(
                ValidationError::UnsupportedVersion(stored.serialization_version),
            ));
        }

        let session_id = SessionId::new(stored.session_id).map_err(SessionError::Deserialization)?;
        let current_state: ContractState = stored
            .current_state
            .parse()
            .map_err(SessionError::Deserialization)?;
        validator::check_state_log(&stored.step_log, current_state)
            .map_err(SessionError::Deserialization)?;

        let now = OffsetDateTime::now_utc();
        let created_at = stored.created_at.unwrap_or(now);
        Ok(Self {
            session_id,
            current_state,
            step_log: stored.step_log,
            state_history: stored.fsm_state_history,
            preferences: stored.preferences,
            constraints: stored.constraints,
            search_results: stored.search_results,
            selected_product: stored.selected_product,
            extracted_attributes: stored.extracted_attributes,
            tools_used: stored.tools_used,
            pipeline_executions: stored.pipeline_executions,
            last_pipeline_results: stored.last_pipeline_results,
            pipeline_metrics: stored.pipeline_performance_metrics,
            created_at,
            updated_at: stored.updated_at.unwrap_or(created_at),
            contract_status: stored.contract_status,
        })
    }
}

fn require_string(object: &Map<String, Value>, field: &'static str) -> SessionResult<()> {
    match object.get(field) {
        None | Some(Value::Null) => Err(SessionError::Deserialization(
            ValidationError::MissingField(field),
        )),
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(()),
        Some(_) => Err(SessionError::Deserialization(ValidationError::EmptyField(
            field,
        ))),
    }
}

fn summarize(result: &Value) -> String {
    if let Some(summary) = result.get("summary").and_then(Value::as_str) {
        return summary.chars().take(SUMMARY_LIMIT).collect();
    }
    let rendered = match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    rendered.chars().take(SUMMARY_LIMIT).collect()
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_version() -> String {
    SERIALIZATION_VERSION.to_owned()
}

/// Flat, versioned wire form of a [`SessionContext`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct StoredSession {
    #[serde(default = "default_version")]
    pub serialization_version: String,
    pub session_id: String,
    pub current_state: String,
    #[serde(default, deserialize_with = "nullable")]
    pub step_log: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub fsm_state_history: Vec<Transition>,
    #[serde(default, deserialize_with = "nullable")]
    pub preferences: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub constraints: Vec<Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub search_results: Vec<Value>,
    #[serde(default)]
    pub selected_product: Option<Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub extracted_attributes: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub tools_used: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub pipeline_executions: BTreeMap<String, Vec<PipelineExecution>>,
    #[serde(default, deserialize_with = "nullable")]
    pub last_pipeline_results: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub pipeline_performance_metrics: BTreeMap<String, f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    #[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    #[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "nullable")]
    pub contract_status: ContractStatus,
    #[serde(default, deserialize_with = "nullable")]
    pub contract_template: String,
}

impl StoredSession {
    /// Encodes the record as the JSON document handed to backing stores.
    pub fn to_value(&self) -> SessionResult<Value> {
        serde_json::to_value(self).map_err(serde_error)
    }

    /// Template reference, falling back to [`DEFAULT_CONTRACT_TEMPLATE`] for legacy records.
    pub fn template(&self) -> &str {
        if self.contract_template.is_empty() {
            DEFAULT_CONTRACT_TEMPLATE
        } else {
            &self.contract_template
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(id: &str) -> SessionContext {
        SessionContext::new(SessionId::new(id).expect("session id"))
    }

    #[test]
    fn update_state_moves_log_and_state_together() {
        let mut ctx = context("s-1");
        let transition = ctx.update_state(ContractState::Search);
        assert_eq!(transition.from, ContractState::Start);
        assert_eq!(ctx.current_state(), ContractState::Search);
        assert_eq!(ctx.step_log(), ["start->search"]);
        assert_eq!(ctx.state_history().len(), 1);
        assert!(ctx.check_consistency().is_ok());
    }

    #[test]
    fn try_transition_rejects_unknown_target() {
        let mut ctx = context("s-2");
        let err = ctx
            .try_transition("teleport")
            .expect_err("unknown state must be rejected");
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        assert_eq!(ctx.current_state(), ContractState::Start);
        assert!(ctx.step_log().is_empty());
    }

    #[test]
    fn pipeline_execution_defaults_and_average() {
        let mut ctx = context("s-3");
        ctx.record_pipeline_execution("search", &json!({"items": [1, 2]}), None);
        let runs = ctx.pipeline_executions("search");
        assert_eq!(runs[0].status, "unknown");
        assert_eq!(runs[0].execution_time, 0.0);
        assert!(!ctx.pipeline_metrics().contains_key("search_avg_time"));

        ctx.record_pipeline_execution("rank", &json!({"status": "ok"}), Some(2.0));
        ctx.record_pipeline_execution("rank", &json!({"status": "ok", "n": 2}), Some(4.0));
        assert_eq!(ctx.pipeline_executions("rank").len(), 2);
        assert_eq!(ctx.pipeline_metrics()["rank_avg_time"], 3.0);
        assert_eq!(
            ctx.last_pipeline_result("rank"),
            Some(&json!({"status": "ok", "n": 2}))
        );
    }

    #[test]
    fn non_finite_times_are_recorded_as_missing() {
        let mut ctx = context("s-nan");
        ctx.record_pipeline_execution("rank", &json!({"status": "ok"}), Some(f64::NAN));
        ctx.record_pipeline_execution("rank", &json!({"status": "ok"}), Some(f64::INFINITY));
        let runs = ctx.pipeline_executions("rank");
        assert!(runs.iter().all(|run| run.execution_time == 0.0));
        assert!(!ctx.pipeline_metrics().contains_key("rank_avg_time"));

        ctx.record_pipeline_execution("rank", &json!({"status": "ok"}), Some(f64::MAX));
        ctx.record_pipeline_execution("rank", &json!({"status": "ok"}), Some(f64::MAX));
        assert!(ctx.pipeline_metrics().values().all(|avg| avg.is_finite()));

        let record = ctx.serialize().expect("serialize").to_value().expect("encode");
        let restored = SessionContext::deserialize(&record).expect("record stays loadable");
        assert_eq!(restored, ctx);
    }

    #[test]
    fn transition_times_strictly_increase() {
        let mut ctx = context("s-mono");
        let mut previous = None;
        for _ in 0..50 {
            let transition = ctx.update_state(ContractState::Search);
            if let Some(previous) = previous {
                assert!(transition.at > previous);
            }
            previous = Some(transition.at);
        }
    }

    #[test]
    fn summary_is_bounded() {
        let long = "x".repeat(1000);
        assert_eq!(summarize(&json!(long)).chars().count(), SUMMARY_LIMIT);
        assert_eq!(summarize(&json!({"summary": "short"})), "short");
    }

    #[test]
    fn status_consistency() {
        assert!(ContractStatus::Active.is_consistent_with(ContractState::Search));
        assert!(!ContractStatus::Active.is_consistent_with(ContractState::Completed));
        assert!(!ContractStatus::Cancelled.is_consistent_with(ContractState::Search));
        assert!(ContractStatus::Cancelled.is_consistent_with(ContractState::Cancelled));
    }

    #[test]
    fn blank_session_id_rejected() {
        assert_eq!(
            SessionId::new("  "),
            Err(ValidationError::EmptyField("session_id"))
        );
    }

    #[test]
    fn null_containers_become_empty() {
        let ctx = SessionContext::deserialize(&json!({
            "session_id": "legacy",
            "current_state": "search",
            "preferences": null,
            "step_log": null,
            "contract_status": null,
            "unexpected": {"ignored": true}
        }))
        .expect("legacy record loads");
        assert!(ctx.preferences().is_empty());
        assert!(ctx.step_log().is_empty());
        assert_eq!(ctx.contract_status(), ContractStatus::Active);
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = SessionContext::deserialize(&json!({
            "serialization_version": "2.0",
            "session_id": "future",
            "current_state": "search"
        }))
        .expect_err("major version 2 is unknown");
        assert_eq!(
            err.validation(),
            Some(&ValidationError::UnsupportedVersion("2.0".into()))
        );
    }

    #[test]
    fn mismatched_step_log_rejected() {
        let err = SessionContext::deserialize(&json!({
            "session_id": "corrupt",
            "current_state": "search",
            "step_log": ["start->search", "search->confirm_purchase"]
        }))
        .expect_err("log disagrees with state");
        assert!(matches!(
            err.validation(),
            Some(ValidationError::StepLogMismatch { .. })
        ));
    }
}
