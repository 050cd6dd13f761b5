//! Durable finding log.
//!
//! Findings are append-only for the lifetime of an engagement; the final
//! report reads them back ordered by discovery time.

use rusqlite::params;
use tracing::{info, instrument};

use redtalon_core::{Finding, Severity};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Append-only persistence for [`Finding`] records.
#[derive(Clone)]
pub struct FindingStore {
    db: Database,
}

impl FindingStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a finding.
    #[instrument(skip(self, finding), fields(title = %finding.title, severity = %finding.severity))]
    pub async fn record(&self, finding: &Finding) -> StoreResult<()> {
        let finding = finding.clone();
        let evidence = serde_json::to_string(&finding.evidence)?;
        let metadata = serde_json::to_string(&finding.metadata)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO findings
                     (id, phase, title, severity, description, evidence, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        finding.id,
                        finding.phase,
                        finding.title,
                        finding.severity.as_str(),
                        finding.description,
                        evidence,
                        metadata,
                        finding.timestamp,
                    ],
                )?;
                Ok(())
            })
            .await?;
        info!("finding recorded");
        Ok(())
    }

    /// All findings, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<Finding>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, phase, title, severity, description, evidence, metadata, created_at
                     FROM findings ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map([], row_to_finding_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(FindingRow::into_finding).collect()
            })
            .await
    }

    /// Findings at a given severity, oldest first.
    pub async fn by_severity(&self, severity: Severity) -> StoreResult<Vec<Finding>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, phase, title, severity, description, evidence, metadata, created_at
                     FROM findings WHERE severity = ?1 ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![severity.as_str()], row_to_finding_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(FindingRow::into_finding).collect()
            })
            .await
    }

    /// Total number of findings.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM findings", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
    }

    /// Delete all findings (fresh engagement).
    pub async fn reset(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute("DELETE FROM findings", [])?;
                Ok(())
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

struct FindingRow {
    id: String,
    phase: String,
    title: String,
    severity: String,
    description: String,
    evidence: String,
    metadata: Option<String>,
    created_at: i64,
}

fn row_to_finding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FindingRow> {
    Ok(FindingRow {
        id: row.get(0)?,
        phase: row.get(1)?,
        title: row.get(2)?,
        severity: row.get(3)?,
        description: row.get(4)?,
        evidence: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl FindingRow {
    fn into_finding(self) -> StoreResult<Finding> {
        let severity = Severity::parse(&self.severity).ok_or_else(|| StoreError::Corrupt {
            entity: "finding",
            id: self.id.clone(),
            reason: format!("unknown severity '{}'", self.severity),
        })?;
        let evidence: Vec<String> = serde_json::from_str(&self.evidence)?;
        let metadata = match self.metadata {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };
        Ok(Finding {
            id: self.id,
            phase: self.phase,
            title: self.title,
            severity,
            description: self.description,
            evidence,
            timestamp: self.created_at,
            metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> FindingStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        FindingStore::new(db)
    }

    #[tokio::test]
    async fn record_and_list_round_trip() {
        let fs = store().await;
        let finding = Finding::new("recon", "Open SSH", Severity::Info, "port 22 open")
            .with_evidence("22/tcp open ssh OpenSSH 8.2");
        fs.record(&finding).await.unwrap();

        let all = fs.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, finding.id);
        assert_eq!(all[0].severity, Severity::Info);
        assert_eq!(all[0].evidence.len(), 1);
    }

    #[tokio::test]
    async fn by_severity_filters() {
        let fs = store().await;
        fs.record(&Finding::new("scan", "RCE", Severity::Critical, "bad"))
            .await
            .unwrap();
        fs.record(&Finding::new("scan", "Banner", Severity::Info, "meh"))
            .await
            .unwrap();

        let critical = fs.by_severity(Severity::Critical).await.unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].title, "RCE");
        assert_eq!(fs.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reset_clears_findings() {
        let fs = store().await;
        fs.record(&Finding::new("p", "t", Severity::Low, "d")).await.unwrap();
        fs.reset().await.unwrap();
        assert_eq!(fs.count().await.unwrap(), 0);
    }
}
