use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Optional client-supplied idempotency token for retried sends
ALTER TABLE messages ADD COLUMN client_token TEXT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_token
    ON messages(sender, client_token) WHERE client_token IS NOT NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
