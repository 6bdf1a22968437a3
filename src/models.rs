//! Canonical domain model.
//!
//! Every row the engines operate on lives here: entities, snapshots, AR/AP
//! documents, bank postings, FX rates, allocations, matching policies,
//! forecast segments, workflow records and the append-only audit log.
//! Status enums round-trip through their `as_str` form for storage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ROLES
// =============================================================================

/// Privilege class attached to every mutating operation. Never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May lock snapshots, approve scenarios/actions, override lock gates.
    LockCapable,
    Regular,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::LockCapable => "lock_capable",
            Role::Regular => "regular",
        }
    }

    pub fn can_lock(&self) -> bool {
        matches!(self, Role::LockCapable)
    }
}

// =============================================================================
// ENTITY & SNAPSHOT
// =============================================================================

/// A legal/operating unit. Created once; identity stable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub base_currency: String,
    /// Weekday on which AP is disbursed (0 = Monday .. 6 = Sunday).
    pub payment_run_day: u8,
    /// Internal account identifiers used to spot intercompany traffic.
    pub internal_accounts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Draft,
    ReadyForReview,
    Locked,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Draft => "DRAFT",
            SnapshotStatus::ReadyForReview => "READY_FOR_REVIEW",
            SnapshotStatus::Locked => "LOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(SnapshotStatus::Draft),
            "READY_FOR_REVIEW" => Some(SnapshotStatus::ReadyForReview),
            "LOCKED" => Some(SnapshotStatus::Locked),
            _ => None,
        }
    }
}

/// Point-in-time captured state for one entity. Once LOCKED, no attribute or
/// child row may mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub entity_id: i64,
    pub label: String,
    pub status: SnapshotStatus,
    pub opening_bank_balance: f64,
    pub min_cash_threshold: f64,
    /// Cached north-star KPI, refreshed after every matching pass.
    pub cash_explained_pct: f64,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_reason: Option<String>,
    /// MatchingPolicy rows serialized at lock time for reproduction.
    pub policies_json: Option<String>,
    /// Opaque id of the Dataset this snapshot was promoted from.
    pub dataset_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn is_locked(&self) -> bool {
        self.status == SnapshotStatus::Locked
    }
}

// =============================================================================
// AR / AP DOCUMENTS
// =============================================================================

/// Open receivable belonging to a snapshot. Amount is immutable after
/// ingestion; only prediction fields and reconciliation linkage mutate.
/// `(snapshot_id, canonical_id)` is unique — the idempotency guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub snapshot_id: i64,
    pub entity_id: Option<i64>,
    pub canonical_id: String,
    pub document_number: String,
    pub document_type: String,
    pub customer: Option<String>,
    pub country: Option<String>,
    pub project: Option<String>,
    pub project_desc: Option<String>,
    pub terms_of_payment: Option<String>,
    pub payment_terms_days: Option<i64>,
    pub amount: f64,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    // Prediction fields, written by the forecast engine.
    pub predicted_payment_date: Option<NaiveDate>,
    pub confidence_p25: Option<NaiveDate>,
    pub confidence_p75: Option<NaiveDate>,
    pub predicted_delay_days: Option<i64>,
    pub prediction_segment: Option<String>,
    /// Set to "reconciled" once fully matched against bank cash.
    pub truth_label: Option<String>,
}

impl Invoice {
    pub fn is_open(&self) -> bool {
        self.payment_date.is_none()
    }
}

/// Open payable belonging to a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorBill {
    pub id: i64,
    pub snapshot_id: i64,
    pub entity_id: Option<i64>,
    pub canonical_id: String,
    pub document_number: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub approval_date: Option<NaiveDate>,
    pub scheduled_payment_date: Option<NaiveDate>,
    pub is_discretionary: bool,
    /// Manual CFO hold; held bills never enter the payment run.
    pub hold_status: bool,
}

// =============================================================================
// BANK TRANSACTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationType {
    Deterministic,
    Rule,
    Suggested,
    Manual,
    None,
}

impl ReconciliationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationType::Deterministic => "deterministic",
            ReconciliationType::Rule => "rule",
            ReconciliationType::Suggested => "suggested",
            ReconciliationType::Manual => "manual",
            ReconciliationType::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deterministic" => Some(ReconciliationType::Deterministic),
            "rule" => Some(ReconciliationType::Rule),
            "suggested" => Some(ReconciliationType::Suggested),
            "manual" => Some(ReconciliationType::Manual),
            "none" => Some(ReconciliationType::None),
            _ => None,
        }
    }

    pub fn tier(&self) -> u8 {
        match self {
            ReconciliationType::Deterministic => 1,
            ReconciliationType::Rule => 2,
            ReconciliationType::Suggested => 3,
            ReconciliationType::Manual => 4,
            ReconciliationType::None => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    New,
    InReview,
    Resolved,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::New => "new",
            LifecycleStatus::InReview => "in_review",
            LifecycleStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(LifecycleStatus::New),
            "in_review" => Some(LifecycleStatus::InReview),
            "resolved" => Some(LifecycleStatus::Resolved),
            _ => None,
        }
    }
}

/// One bank posting. Positive amount = inflow, negative = outflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub snapshot_id: i64,
    /// Present when the posting arrived through ingestion; manual postings
    /// have none.
    pub canonical_id: Option<String>,
    pub bank_account_id: String,
    pub transaction_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub amount: f64,
    pub currency: String,
    pub reference: Option<String>,
    pub counterparty: Option<String>,
    pub fee_amount: f64,
    pub is_reconciled: bool,
    pub reconciliation_type: ReconciliationType,
    pub match_confidence: Option<f64>,
    pub lifecycle_status: LifecycleStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// RECONCILIATION ALLOCATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    PendingApproval,
    Reconciled,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::PendingApproval => "PENDING_APPROVAL",
            MatchStatus::Reconciled => "RECONCILED",
            MatchStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_APPROVAL" => Some(MatchStatus::PendingApproval),
            "RECONCILED" => Some(MatchStatus::Reconciled),
            "REJECTED" => Some(MatchStatus::Rejected),
            _ => None,
        }
    }
}

/// Many-to-many link between one bank transaction and one invoice or bill.
///
/// Conservation: over a reconciled transaction,
/// sum(allocated_amount) + fees + writeoffs = |transaction amount|.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationAllocation {
    pub id: i64,
    pub snapshot_id: i64,
    pub bank_transaction_id: i64,
    pub invoice_id: Option<i64>,
    pub vendor_bill_id: Option<i64>,
    pub allocated_amount: f64,
    pub writeoff_amount: f64,
    pub match_tier: u8,
    pub confidence: f64,
    pub status: MatchStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// FX & POLICY
// =============================================================================

/// Snapshot-scoped FX rate. A missing rate routes the amount to Unknown;
/// it is never a silent 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxRate {
    pub id: i64,
    pub snapshot_id: i64,
    pub from_currency: String,
    pub to_currency: String,
    pub rate: f64,
}

/// Per entity/currency matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingPolicy {
    pub entity_id: Option<i64>,
    pub currency: String,
    /// Relative amount tolerance as a fraction (0.02 = 2%).
    pub amount_tolerance: f64,
    pub date_window_days: i64,
    pub tier2_min_confidence: f64,
    pub tier3_min_confidence: f64,
    pub auto_apply_tier1: bool,
    pub auto_apply_tier2: bool,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            entity_id: None,
            currency: "EUR".to_string(),
            amount_tolerance: 0.02,
            date_window_days: 7,
            tier2_min_confidence: 0.85,
            tier3_min_confidence: 0.60,
            auto_apply_tier1: true,
            auto_apply_tier2: false,
        }
    }
}

// =============================================================================
// FORECAST ARTIFACTS
// =============================================================================

/// Weighted delay distribution for one segment of the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStats {
    pub snapshot_id: i64,
    /// Hierarchy level, e.g. "customer+country+terms_of_payment" or "Global".
    pub segment_type: String,
    /// Level values joined with '+', empty for Global.
    pub segment_key: String,
    pub sample_size: i64,
    pub p25_delay: f64,
    pub p50_delay: f64,
    pub p75_delay: f64,
    pub p90_delay: f64,
    pub mean_delay: f64,
    pub std_delay: f64,
}

/// Split-conformal backtest coverage for one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub snapshot_id: i64,
    pub segment_type: String,
    pub segment_key: String,
    /// Empirical coverage of the P25–P75 band (expected ~0.50).
    pub coverage_p25: f64,
    pub coverage_p50: f64,
    pub coverage_p75: f64,
    pub coverage_p90: f64,
    pub calibration_error: f64,
    pub sample_size: i64,
    pub backtest_splits: i64,
}

// =============================================================================
// WORKFLOW RECORDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    Open,
    InReview,
    Escalated,
    Resolved,
    WontFix,
}

impl ExceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionStatus::Open => "open",
            ExceptionStatus::InReview => "in_review",
            ExceptionStatus::Escalated => "escalated",
            ExceptionStatus::Resolved => "resolved",
            ExceptionStatus::WontFix => "wont_fix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ExceptionStatus::Open),
            "in_review" => Some(ExceptionStatus::InReview),
            "escalated" => Some(ExceptionStatus::Escalated),
            "resolved" => Some(ExceptionStatus::Resolved),
            "wont_fix" => Some(ExceptionStatus::WontFix),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ExceptionStatus::Open | ExceptionStatus::InReview)
    }
}

/// Reference from a workflow or invariant record to its underlying evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_type: String,
    pub evidence_id: String,
}

impl EvidenceRef {
    pub fn new(evidence_type: impl Into<String>, evidence_id: impl ToString) -> Self {
        Self {
            evidence_type: evidence_type.into(),
            evidence_id: evidence_id.to_string(),
        }
    }
}

/// A flagged condition on a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exception {
    pub id: i64,
    pub snapshot_id: i64,
    pub exception_type: String,
    pub severity: Severity,
    pub title: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub status: ExceptionStatus,
    pub assignee: Option<String>,
    pub assigned_by: Option<String>,
    pub sla_due_at: Option<DateTime<Utc>>,
    pub resolution_type: Option<String>,
    pub resolution_note: Option<String>,
    pub evidence_refs: Vec<EvidenceRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    Draft,
    Proposed,
    Approved,
    Rejected,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Draft => "DRAFT",
            ScenarioStatus::Proposed => "PROPOSED",
            ScenarioStatus::Approved => "APPROVED",
            ScenarioStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ScenarioStatus::Draft),
            "PROPOSED" => Some(ScenarioStatus::Proposed),
            "APPROVED" => Some(ScenarioStatus::Approved),
            "REJECTED" => Some(ScenarioStatus::Rejected),
            _ => None,
        }
    }
}

/// What-if shock configuration applied on top of the base forecast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Days every predicted payment slips (positive = later).
    pub global_shock_days: i64,
    /// Per-customer additional slip days.
    pub customer_shock_days: std::collections::HashMap<String, i64>,
    /// Days recovered by collections effort.
    pub collections_improvement_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: i64,
    pub snapshot_id: i64,
    pub name: String,
    pub config: ScenarioConfig,
    pub status: ScenarioStatus,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Draft,
    PendingApproval,
    Approved,
    InProgress,
    Done,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Draft => "DRAFT",
            ActionStatus::PendingApproval => "PENDING_APPROVAL",
            ActionStatus::Approved => "APPROVED",
            ActionStatus::InProgress => "IN_PROGRESS",
            ActionStatus::Done => "DONE",
            ActionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ActionStatus::Draft),
            "PENDING_APPROVAL" => Some(ActionStatus::PendingApproval),
            "APPROVED" => Some(ActionStatus::Approved),
            "IN_PROGRESS" => Some(ActionStatus::InProgress),
            "DONE" => Some(ActionStatus::Done),
            "CANCELLED" => Some(ActionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub snapshot_id: i64,
    pub title: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub requires_approval: bool,
    pub assignee: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub created_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub parent_type: String,
    pub parent_id: i64,
    pub author: String,
    pub body: String,
    pub reply_to: Option<i64>,
    pub evidence_refs: Vec<EvidenceRef>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// One append-only audit entry per mutating action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub actor: String,
    pub role: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<i64>,
    pub snapshot_id: Option<i64>,
    pub changes_json: Option<String>,
    pub ip_address: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// OUTFLOW PLANNING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "frequency")]
pub enum RecurringFrequency {
    /// Fires on a weekday (0 = Monday .. 6 = Sunday).
    Weekly { day_of_week: u8 },
    /// Fires on a day of the month; `is_last_day` pins it to month end.
    Monthly { day_of_month: u8, is_last_day: bool },
}

/// Template outflow (rent, payroll, tax) projected into OutflowItems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringOutflow {
    pub id: i64,
    pub entity_id: i64,
    pub category: String,
    pub description: String,
    pub amount: f64,
    pub currency: String,
    pub frequency: RecurringFrequency,
    pub is_discretionary: bool,
}

/// One planned outflow in a snapshot's 13-week window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutflowItem {
    pub id: i64,
    pub snapshot_id: i64,
    pub entity_id: i64,
    pub category: String,
    pub description: String,
    pub amount: f64,
    pub currency: String,
    pub expected_date: NaiveDate,
    pub is_discretionary: bool,
    pub source: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in [
            SnapshotStatus::Draft,
            SnapshotStatus::ReadyForReview,
            SnapshotStatus::Locked,
        ] {
            assert_eq!(SnapshotStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            ExceptionStatus::Open,
            ExceptionStatus::InReview,
            ExceptionStatus::Escalated,
            ExceptionStatus::Resolved,
            ExceptionStatus::WontFix,
        ] {
            assert_eq!(ExceptionStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            ActionStatus::Draft,
            ActionStatus::PendingApproval,
            ActionStatus::Approved,
            ActionStatus::InProgress,
            ActionStatus::Done,
            ActionStatus::Cancelled,
        ] {
            assert_eq!(ActionStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_reconciliation_tiers() {
        assert_eq!(ReconciliationType::Deterministic.tier(), 1);
        assert_eq!(ReconciliationType::Rule.tier(), 2);
        assert_eq!(ReconciliationType::Suggested.tier(), 3);
        assert_eq!(ReconciliationType::Manual.tier(), 4);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_role_capability() {
        assert!(Role::LockCapable.can_lock());
        assert!(!Role::Regular.can_lock());
    }
}
