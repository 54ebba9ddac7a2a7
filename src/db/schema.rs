use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS transaction_receipts (
            tx_hash             TEXT PRIMARY KEY,
            block_number        INTEGER NOT NULL,
            block_hash          TEXT NOT NULL,
            block_timestamp     INTEGER NOT NULL,
            tx_index            INTEGER NOT NULL,
            from_addr           TEXT NOT NULL,
            to_addr             TEXT NOT NULL,
            value               REAL NOT NULL,
            gas                 INTEGER NOT NULL,
            gas_price           REAL NOT NULL,
            gas_used            INTEGER NOT NULL,
            cumulative_gas_used INTEGER NOT NULL,
            status              INTEGER NOT NULL,
            contract_addr       TEXT NOT NULL,
            effective_gas_price REAL NOT NULL,
            processed_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fraud_scores (
            tx_hash           TEXT PRIMARY KEY,
            fraud_probability REAL NOT NULL,
            is_fraud          INTEGER NOT NULL,
            risk_level        TEXT NOT NULL,
            anomaly_flag      INTEGER, -- NULL when anomaly detection did not run
            anomaly_score     REAL,
            scored_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_state (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            last_block INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        INSERT OR IGNORE INTO pipeline_state (id, last_block, updated_at)
        VALUES (1, 0, datetime('now'));

        CREATE INDEX IF NOT EXISTS idx_receipts_block ON transaction_receipts(block_number, tx_index);
        CREATE INDEX IF NOT EXISTS idx_receipts_sender_time ON transaction_receipts(from_addr, block_timestamp);
        CREATE INDEX IF NOT EXISTS idx_scores_probability ON fraud_scores(fraud_probability DESC);
        ",
    )?;
    Ok(())
}
