use rusqlite::Connection;

/// Pragmas applied to every connection the asset store opens.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA foreign_keys = OFF;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
