//! Token store schema definitions
//!
//! Two tables cross restarts: OAuth tokens (one row per server key) and the
//! completion log that lets a sibling process signal the daemon after an
//! interactive flow.

/// Schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL
pub const SCHEMA: &str = r#"
--------------------------------------------------------------------------------
-- OAUTH TOKENS
-- One credential per server identity. server_key = sha256(name || '|' || url).
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS oauth_tokens (
    server_key TEXT PRIMARY KEY,
    server_name TEXT NOT NULL,
    url TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    token_type TEXT NOT NULL DEFAULT 'Bearer',
    expires_at INTEGER,                     -- Unix timestamp ms, NULL = no expiry
    display_name TEXT,
    created_at INTEGER NOT NULL,            -- Unix timestamp ms
    updated_at INTEGER NOT NULL             -- Unix timestamp ms
);

CREATE INDEX IF NOT EXISTS idx_tokens_name ON oauth_tokens(server_name);

--------------------------------------------------------------------------------
-- OAUTH COMPLETIONS
-- Durable out-of-band channel: a CLI helper finishing a flow writes a row,
-- the daemon polls for unprocessed rows. Delivery is at-least-once.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS oauth_completions (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    server_name TEXT NOT NULL,
    completed_at INTEGER NOT NULL,          -- Unix timestamp ms
    processed INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_completions_key
    ON oauth_completions(server_name, completed_at);
CREATE INDEX IF NOT EXISTS idx_completions_unprocessed
    ON oauth_completions(processed) WHERE processed = 0;
"#;
