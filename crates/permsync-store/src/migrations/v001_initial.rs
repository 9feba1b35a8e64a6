//! v001 -- Initial schema creation.
//!
//! Creates `subscriptions`, `domain_permissions` and `subscription_claims`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Subscriptions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS subscriptions (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v7
    priority          INTEGER NOT NULL,           -- 0..=255
    title             TEXT,
    permission_type   TEXT NOT NULL,              -- 'allow' | 'block'
    uri               TEXT NOT NULL UNIQUE,
    content_type      TEXT NOT NULL,              -- 'plain' | 'csv' | 'json'
    fetch_username    TEXT,
    fetch_password    BLOB,                       -- nonce || ciphertext
    as_draft          INTEGER NOT NULL,           -- boolean 0/1
    adopt_orphans     INTEGER NOT NULL,           -- boolean 0/1
    created_at        TEXT NOT NULL,              -- RFC-3339
    last_fetch_status TEXT NOT NULL DEFAULT 'never',
    last_fetch_error  TEXT,
    last_fetched_at   TEXT,
    last_success_at   TEXT,
    etag              TEXT,
    last_modified     TEXT,
    entry_count       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_type_priority
    ON subscriptions(permission_type, priority DESC);

-- ----------------------------------------------------------------
-- Domain permissions (subscription_id NULL = orphan)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS domain_permissions (
    domain          TEXT NOT NULL,
    permission_type TEXT NOT NULL,
    subscription_id TEXT,
    state           TEXT NOT NULL,                -- 'draft' | 'active'
    obfuscate       INTEGER,
    public_comment  TEXT,
    private_comment TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,

    PRIMARY KEY (domain, permission_type)
);

CREATE INDEX IF NOT EXISTS idx_domain_permissions_owner
    ON domain_permissions(subscription_id, permission_type);

-- ----------------------------------------------------------------
-- Claim sets: entries of each subscription's last successful parse
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS subscription_claims (
    subscription_id TEXT NOT NULL,
    domain          TEXT NOT NULL,
    permission_type TEXT NOT NULL,
    obfuscate       INTEGER,
    public_comment  TEXT,
    private_comment TEXT,

    PRIMARY KEY (subscription_id, domain),
    FOREIGN KEY (subscription_id) REFERENCES subscriptions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_subscription_claims_domain
    ON subscription_claims(domain, permission_type);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
