//! SQLite Schema Definitions for Model Storage
//!
//! One database holds every source location. Each entity is a JSON body
//! keyed by (source, kind, position) so collections load back in save order.

/// Schema version for model databases
pub const STORE_SCHEMA_VERSION: &str = "1";

/// SQL to create the entities table
pub const SCHEMA_CREATE_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    -- Source location the collection belongs to
    source TEXT NOT NULL,

    -- Entity kind (table, view, procedure)
    kind TEXT NOT NULL,

    -- Position within the collection
    position INTEGER NOT NULL,

    -- Qualified name (schema.name), for inspection only
    name TEXT NOT NULL,

    -- Serialized entity
    body_json TEXT NOT NULL,

    PRIMARY KEY (source, kind, position)
)
"#;

/// SQL to create indexes for efficient queries
pub const SCHEMA_CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(source, name);
"#;

/// SQL to create the metadata table
pub const SCHEMA_CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(SCHEMA_CREATE_ENTITIES, []).unwrap();
        conn.execute(SCHEMA_CREATE_METADATA, []).unwrap();
        conn.execute_batch(SCHEMA_CREATE_INDEXES).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["entities", "store_metadata"]);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        for _ in 0..2 {
            conn.execute(SCHEMA_CREATE_ENTITIES, []).unwrap();
            conn.execute(SCHEMA_CREATE_METADATA, []).unwrap();
            conn.execute_batch(SCHEMA_CREATE_INDEXES).unwrap();
        }
    }
}
