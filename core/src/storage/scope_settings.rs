//! Persistence of the process-wide scope record.
//!
//! Kept in the `settings` table, outside the flow rows, so clearing the
//! archive leaves it untouched.

use anyhow::Context;
use rusqlite::{params, OptionalExtension};

use super::FlowStore;
use crate::error::CoreResult;
use crate::models::ScopeSettings;

const SCOPE_KEY: &str = "scope";

impl FlowStore {
    /// Current scope settings. Missing, legacy or malformed records read as
    /// normalised defaults rather than failing.
    pub async fn get_scope(&self) -> CoreResult<ScopeSettings> {
        let raw = self
            .with_conn(|conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        params![SCOPE_KEY],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("loading scope settings")?;
                Ok(raw)
            })
            .await?;

        Ok(raw
            .map(|raw| ScopeSettings::from_stored(&raw))
            .unwrap_or_default())
    }

    /// Replace the scope record wholesale.
    pub async fn set_scope(&self, settings: ScopeSettings) -> CoreResult<()> {
        let payload =
            serde_json::to_string(&settings.normalized()).context("encoding scope settings")?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![SCOPE_KEY, payload],
            )
            .context("saving scope settings")?;
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn put_raw_scope(&self, raw: &str) -> CoreResult<()> {
        let raw = raw.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![SCOPE_KEY, raw],
            )?;
            Ok(())
        })
        .await
    }
}
