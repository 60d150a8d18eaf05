//! Result store DDL. The layout version lives in `PRAGMA user_version`.

pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS addon_results (
    turn_id TEXT NOT NULL,
    variant_index INTEGER NOT NULL,
    addon_id TEXT NOT NULL,
    content TEXT NOT NULL,
    addon_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    format_style TEXT NOT NULL,
    response_location TEXT NOT NULL,
    edited INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL,
    PRIMARY KEY (turn_id, variant_index, addon_id)
);

CREATE INDEX IF NOT EXISTS idx_results_addon ON addon_results(addon_id, revision);
CREATE INDEX IF NOT EXISTS idx_results_turn ON addon_results(turn_id, variant_index);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
