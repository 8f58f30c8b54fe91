//! Report artifacts on disk.
//!
//! Layout per run: `<dir>/<run_id>/report.json`, `report.digest` (SHA-256 of
//! the JSON bytes) and a rendered `report.md`.

use std::path::{Path, PathBuf};

use repair_state::ContentDigest;

use crate::domain::{CycleReport, RepairError, Result, UnitStatus};

const REPORT_JSON: &str = "report.json";
const REPORT_DIGEST: &str = "report.digest";
const REPORT_MD: &str = "report.md";

/// Persist the report artifacts for `report.run_id`. Returns the JSON path.
pub fn write_report_artifacts(dir: &Path, report: &CycleReport) -> Result<PathBuf> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let artifact_path = run_dir.join(REPORT_JSON);
    let json = serde_json::to_vec_pretty(report)?;
    let digest = ContentDigest::from_bytes(&json);

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(run_dir.join(REPORT_DIGEST), digest.as_str().as_bytes())?;
    std::fs::write(run_dir.join(REPORT_MD), render_report_md(report))?;

    Ok(artifact_path)
}

/// Read `<dir>/<run_id>/report.json`, verifying it against its digest.
pub fn read_report_artifact(dir: &Path, run_id: &str) -> Result<CycleReport> {
    let run_dir = dir.join(run_id);
    let json = std::fs::read(run_dir.join(REPORT_JSON))?;
    let expected = std::fs::read_to_string(run_dir.join(REPORT_DIGEST))?;
    let actual = ContentDigest::from_bytes(&json);
    if expected.trim() != actual.as_str() {
        return Err(RepairError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

pub fn render_report_md(report: &CycleReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Repair Report: {}\n\n", report.run_id));
    out.push_str(&format!(
        "- outcome: {}\n- repaired: {}\n- skipped: {}\n- failed: {}\n- generated: {}\n\n",
        report.terminal_phase,
        report.repaired,
        report.skipped,
        report.failed,
        report.generated_at.to_rfc3339()
    ));

    if !report.summary.is_empty() {
        out.push_str("## Summary\n");
        out.push_str(&report.summary);
        out.push_str("\n\n");
    }

    if !report.units.is_empty() {
        out.push_str("## Units\n");
        out.push_str("| unit | status | detail |\n|---|---|---|\n");
        for unit in &report.units {
            let status = match unit.status {
                UnitStatus::Repaired => "repaired",
                UnitStatus::Skipped => "skipped",
                UnitStatus::Failed => "failed",
            };
            out.push_str(&format!(
                "| `{}` | {} | {} |\n",
                unit.unit_id,
                status,
                unit.detail.replace('|', "\\|")
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CyclePhase, UnitReport};
    use chrono::Utc;

    fn report() -> CycleReport {
        CycleReport {
            run_id: "run-7".into(),
            terminal_phase: CyclePhase::ReportCompleted,
            repaired: 1,
            skipped: 1,
            failed: 0,
            summary: "1 repaired, 1 skipped, 0 failed".into(),
            units: vec![
                UnitReport {
                    unit_id: "O-1".into(),
                    status: UnitStatus::Repaired,
                    detail: "restocked".into(),
                },
                UnitReport {
                    unit_id: "O-2".into(),
                    status: UnitStatus::Skipped,
                    detail: "no repair needed".into(),
                },
            ],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_write_then_read_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let original = report();
        let path = write_report_artifacts(dir.path(), &original).unwrap();
        assert!(path.ends_with("run-7/report.json"));
        assert!(dir.path().join("run-7").join("report.md").exists());

        let loaded = read_report_artifact(dir.path(), "run-7").unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_tampered_report_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report_artifacts(dir.path(), &report()).unwrap();
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"repaired\": 1", "\"repaired\": 2");
        std::fs::write(&path, tampered).unwrap();

        let err = read_report_artifact(dir.path(), "run-7").unwrap_err();
        assert!(matches!(err, RepairError::DigestMismatch { .. }));
    }

    #[test]
    fn test_markdown_lists_units() {
        let md = render_report_md(&report());
        assert!(md.starts_with("# Repair Report: run-7"));
        assert!(md.contains("- outcome: REPORT-COMPLETED"));
        assert!(md.contains("| `O-1` | repaired | restocked |"));
    }
}
