//! Database schema definitions

/// Tables owned by game-data ingestion and report submission; only read here.
pub const REQUIRED_TABLES: &[&str] = &[
    "drop_reports",
    "drop_patterns",
    "drop_pattern_elements",
    "drop_infos",
    "time_ranges",
    "stages",
    "items",
    "accounts",
];

// Daily drop-matrix elements written by the calculation worker
pub const CREATE_DROP_MATRIX_ELEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS drop_matrix_elements (
    element_id BIGSERIAL PRIMARY KEY,
    server TEXT NOT NULL,
    source_category TEXT NOT NULL,
    stage_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    range_id INTEGER NOT NULL,       -- 0 for ad-hoc ranges
    quantity BIGINT NOT NULL,
    times BIGINT NOT NULL,
    quantity_buckets JSONB NOT NULL, -- {"1": 5, "2": 3}
    day_num INTEGER NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ NOT NULL
)
"#;

// Latest-range pattern matrix, replaced per server on refresh
pub const CREATE_PATTERN_MATRIX_ELEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pattern_matrix_elements (
    element_id BIGSERIAL PRIMARY KEY,
    server TEXT NOT NULL,
    stage_id INTEGER NOT NULL,
    pattern_id INTEGER NOT NULL,
    range_id INTEGER NOT NULL,
    quantity BIGINT NOT NULL,
    times BIGINT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ NOT NULL
)
"#;

// === INDEXES ===

// One row per (stage, item, range) for a server's game day and source category
pub const CREATE_INDEX_DME_DAY: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_dme_day ON drop_matrix_elements(server, day_num, source_category, stage_id, item_id, range_id)";

// For chain reduction reads
pub const CREATE_INDEX_DME_RANGE: &str = "CREATE INDEX IF NOT EXISTS idx_dme_range ON drop_matrix_elements(server, source_category, range_id)";

pub const CREATE_INDEX_PME_SERVER: &str = "CREATE INDEX IF NOT EXISTS idx_pme_server ON pattern_matrix_elements(server, stage_id)";

// Report scans filter on server and created_at first
pub const CREATE_INDEX_REPORTS_SERVER_CREATED_STAGE: &str = "CREATE INDEX IF NOT EXISTS idx_drop_reports_server_created_stage ON drop_reports(server, created_at, stage_id)";

pub const CREATE_INDEX_PATTERN_ELEMENTS_PATTERN: &str = "CREATE INDEX IF NOT EXISTS idx_dpe_pattern ON drop_pattern_elements(drop_pattern_id)";
