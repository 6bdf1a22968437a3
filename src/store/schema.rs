//! SQLite schema for the canonical and lineage stores.
//!
//! Uniqueness on `(snapshot_id, canonical_id)` and
//! `(dataset_id, canonical_id)` is what makes re-ingestion idempotent at the
//! storage layer. FK cascades flow from snapshots to their children. The
//! audit and override tables are append-only — no update path is exposed.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    base_currency TEXT NOT NULL DEFAULT 'EUR',
    payment_run_day INTEGER NOT NULL DEFAULT 3,
    internal_accounts_json TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id),
    label TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    opening_bank_balance REAL NOT NULL DEFAULT 0,
    min_cash_threshold REAL NOT NULL DEFAULT 0,
    cash_explained_pct REAL NOT NULL DEFAULT 0,
    locked_at TEXT,
    locked_by TEXT,
    lock_reason TEXT,
    policies_json TEXT,
    dataset_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS invoices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    entity_id INTEGER,
    canonical_id TEXT NOT NULL,
    document_number TEXT NOT NULL,
    document_type TEXT NOT NULL DEFAULT 'INV',
    customer TEXT,
    country TEXT,
    project TEXT,
    project_desc TEXT,
    terms_of_payment TEXT,
    payment_terms_days INTEGER,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    issue_date TEXT,
    due_date TEXT,
    payment_date TEXT,
    predicted_payment_date TEXT,
    confidence_p25 TEXT,
    confidence_p75 TEXT,
    predicted_delay_days INTEGER,
    prediction_segment TEXT,
    truth_label TEXT,
    UNIQUE(snapshot_id, canonical_id)
);
CREATE INDEX IF NOT EXISTS idx_invoices_snapshot ON invoices(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_invoices_open
    ON invoices(snapshot_id) WHERE payment_date IS NULL;

CREATE TABLE IF NOT EXISTS vendor_bills (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    entity_id INTEGER,
    canonical_id TEXT NOT NULL,
    document_number TEXT NOT NULL,
    vendor TEXT,
    category TEXT,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    issue_date TEXT,
    due_date TEXT,
    payment_date TEXT,
    approval_date TEXT,
    scheduled_payment_date TEXT,
    is_discretionary INTEGER NOT NULL DEFAULT 0,
    hold_status INTEGER NOT NULL DEFAULT 0,
    UNIQUE(snapshot_id, canonical_id)
);
CREATE INDEX IF NOT EXISTS idx_bills_snapshot ON vendor_bills(snapshot_id);

CREATE TABLE IF NOT EXISTS bank_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    canonical_id TEXT,
    bank_account_id TEXT NOT NULL,
    transaction_date TEXT NOT NULL,
    value_date TEXT,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    reference TEXT,
    counterparty TEXT,
    fee_amount REAL NOT NULL DEFAULT 0,
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    reconciliation_type TEXT NOT NULL DEFAULT 'none',
    match_confidence REAL,
    lifecycle_status TEXT NOT NULL DEFAULT 'new',
    resolved_at TEXT,
    UNIQUE(snapshot_id, canonical_id)
);
CREATE INDEX IF NOT EXISTS idx_txns_snapshot ON bank_transactions(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_txns_unreconciled
    ON bank_transactions(snapshot_id) WHERE is_reconciled = 0;

CREATE TABLE IF NOT EXISTS fx_rates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    from_currency TEXT NOT NULL,
    to_currency TEXT NOT NULL,
    rate REAL NOT NULL,
    UNIQUE(snapshot_id, from_currency, to_currency)
);

CREATE TABLE IF NOT EXISTS matching_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER,
    currency TEXT NOT NULL DEFAULT 'EUR',
    amount_tolerance REAL NOT NULL DEFAULT 0.02,
    date_window_days INTEGER NOT NULL DEFAULT 7,
    tier2_min_confidence REAL NOT NULL DEFAULT 0.85,
    tier3_min_confidence REAL NOT NULL DEFAULT 0.60,
    auto_apply_tier1 INTEGER NOT NULL DEFAULT 1,
    auto_apply_tier2 INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS reconciliation_allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    bank_transaction_id INTEGER NOT NULL REFERENCES bank_transactions(id),
    invoice_id INTEGER REFERENCES invoices(id),
    vendor_bill_id INTEGER REFERENCES vendor_bills(id),
    allocated_amount REAL NOT NULL,
    writeoff_amount REAL NOT NULL DEFAULT 0,
    match_tier INTEGER NOT NULL,
    confidence REAL NOT NULL,
    status TEXT NOT NULL,
    approved_by TEXT,
    approved_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alloc_txn
    ON reconciliation_allocations(bank_transaction_id);
CREATE INDEX IF NOT EXISTS idx_alloc_invoice
    ON reconciliation_allocations(invoice_id);
CREATE INDEX IF NOT EXISTS idx_alloc_snapshot
    ON reconciliation_allocations(snapshot_id, status);

CREATE TABLE IF NOT EXISTS segment_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    segment_type TEXT NOT NULL,
    segment_key TEXT NOT NULL,
    sample_size INTEGER NOT NULL,
    p25_delay REAL NOT NULL,
    p50_delay REAL NOT NULL,
    p75_delay REAL NOT NULL,
    p90_delay REAL NOT NULL,
    mean_delay REAL NOT NULL,
    std_delay REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_segments_snapshot ON segment_stats(snapshot_id);

CREATE TABLE IF NOT EXISTS calibration_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    segment_type TEXT NOT NULL,
    segment_key TEXT NOT NULL,
    coverage_p25 REAL NOT NULL,
    coverage_p50 REAL NOT NULL,
    coverage_p75 REAL NOT NULL,
    coverage_p90 REAL NOT NULL,
    calibration_error REAL NOT NULL,
    sample_size INTEGER NOT NULL,
    backtest_splits INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS exceptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    exception_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    title TEXT NOT NULL,
    amount REAL,
    currency TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    assignee TEXT,
    assigned_by TEXT,
    sla_due_at TEXT,
    resolution_type TEXT,
    resolution_note TEXT,
    evidence_refs_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exceptions_snapshot ON exceptions(snapshot_id, status);

CREATE TABLE IF NOT EXISTS scenarios (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'DRAFT',
    created_by TEXT NOT NULL,
    approved_by TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    action_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    requires_approval INTEGER NOT NULL DEFAULT 0,
    assignee TEXT,
    due_date TEXT,
    created_by TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_type TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    author TEXT NOT NULL,
    body TEXT NOT NULL,
    reply_to INTEGER,
    evidence_refs_json TEXT NOT NULL DEFAULT '[]',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    role TEXT NOT NULL,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id INTEGER,
    snapshot_id INTEGER,
    changes_json TEXT,
    ip_address TEXT,
    note TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_snapshot ON audit_log(snapshot_id, created_at);

CREATE TABLE IF NOT EXISTS recurring_outflows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id),
    category TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    frequency_json TEXT NOT NULL,
    is_discretionary INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS outflow_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    expected_date TEXT NOT NULL,
    is_discretionary INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL DEFAULT 'Calendar',
    status TEXT NOT NULL DEFAULT 'Planned'
);
CREATE INDEX IF NOT EXISTS idx_outflows_snapshot ON outflow_items(snapshot_id);

CREATE TABLE IF NOT EXISTS invariant_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    summary_json TEXT
);

CREATE TABLE IF NOT EXISTS invariant_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES invariant_runs(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    severity TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    proof_string TEXT NOT NULL,
    evidence_refs_json TEXT NOT NULL DEFAULT '[]',
    exposure_amount REAL NOT NULL DEFAULT 0,
    exposure_currency TEXT NOT NULL DEFAULT 'EUR'
);

CREATE TABLE IF NOT EXISTS lock_gate_overrides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
    user TEXT NOT NULL,
    role TEXT NOT NULL,
    email TEXT,
    ip_address TEXT,
    failed_gates_json TEXT NOT NULL,
    acknowledgment_text TEXT NOT NULL,
    override_reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    config_json TEXT NOT NULL DEFAULT '{}',
    secret_ref TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING_SETUP',
    status_message TEXT,
    last_test_at TEXT,
    last_sync_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL REFERENCES connections(id),
    status TEXT NOT NULL DEFAULT 'PENDING',
    triggered_by TEXT NOT NULL DEFAULT 'manual',
    started_at TEXT,
    finished_at TEXT,
    rows_extracted INTEGER NOT NULL DEFAULT 0,
    rows_normalized INTEGER NOT NULL DEFAULT 0,
    rows_loaded INTEGER NOT NULL DEFAULT 0,
    rows_skipped INTEGER NOT NULL DEFAULT 0,
    rows_error INTEGER NOT NULL DEFAULT 0,
    errors_json TEXT,
    warnings_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_runs_connection ON sync_runs(connection_id, started_at);

CREATE TABLE IF NOT EXISTS datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_uid TEXT NOT NULL UNIQUE,
    entity_id INTEGER,
    sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id),
    source_type TEXT NOT NULL,
    schema_fingerprint TEXT,
    schema_columns_json TEXT,
    row_count INTEGER NOT NULL DEFAULT 0,
    amount_total REAL NOT NULL DEFAULT 0,
    date_range_start TEXT,
    date_range_end TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    source_table TEXT NOT NULL,
    source_row_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    raw_hash TEXT NOT NULL,
    is_processed INTEGER NOT NULL DEFAULT 0,
    processing_error TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_raw_dataset ON raw_records(dataset_id);

CREATE TABLE IF NOT EXISTS canonical_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    raw_record_id INTEGER REFERENCES raw_records(id),
    record_type TEXT NOT NULL,
    canonical_id TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    amount REAL,
    currency TEXT,
    record_date TEXT,
    due_date TEXT,
    counterparty TEXT,
    external_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(dataset_id, canonical_id)
);
CREATE INDEX IF NOT EXISTS idx_canonical_dataset ON canonical_records(dataset_id);

CREATE TABLE IF NOT EXISTS schema_drift_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL REFERENCES connections(id),
    old_dataset_id INTEGER,
    new_dataset_id INTEGER,
    old_fingerprint TEXT,
    new_fingerprint TEXT,
    added_columns_json TEXT,
    removed_columns_json TEXT,
    type_changes_json TEXT,
    severity TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evidence_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    ref_id TEXT NOT NULL,
    context_type TEXT,
    context_id INTEGER,
    metadata_json TEXT,
    created_at TEXT NOT NULL
);
"#;
