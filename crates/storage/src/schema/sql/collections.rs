#![forbid(unsafe_code)]

// Every collection shares one row shape so the generic record helpers can
// address them uniformly. For projects `project_id` repeats `id`.
pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS projects (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS connections (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );
"#;
