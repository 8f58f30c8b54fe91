//! Detection and analysis results.

use serde::{Deserialize, Serialize};

use super::error::AgentError;

/// One addressable item flagged for repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemUnit {
    pub unit_id: String,
    /// Reference into the domain store (an order id).
    pub domain_ref: String,
    #[serde(default)]
    pub summary: String,
}

impl ProblemUnit {
    /// Unit for an order; the order id doubles as the unit id.
    pub fn for_order(order_id: impl Into<String>, summary: impl Into<String>) -> Self {
        let order_id = order_id.into();
        Self {
            unit_id: order_id.clone(),
            domain_ref: order_id,
            summary: summary.into(),
        }
    }
}

/// Output of the detection agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Confidence that problems exist at all.
    pub confidence: f64,
    pub units: Vec<ProblemUnit>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Detection {
    /// Whether this detection should lead to a repair cycle.
    pub fn has_problems(&self, min_confidence: f64) -> bool {
        !self.units.is_empty() && self.confidence >= min_confidence
    }
}

/// Output of the analysis agent for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub unit_id: String,
    pub findings: serde_json::Value,
    pub confidence: f64,
}

impl Diagnosis {
    /// Check the diagnosis against the unit it was requested for.
    pub fn validate_for(&self, unit: &ProblemUnit) -> Result<(), AgentError> {
        if self.unit_id != unit.unit_id {
            return Err(AgentError::Malformed(format!(
                "diagnosis for {} returned for unit {}",
                self.unit_id, unit.unit_id
            )));
        }
        if !is_confidence(self.confidence) {
            return Err(AgentError::Malformed(format!(
                "diagnosis confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }

    /// `findings.issue_kind`, if present.
    pub fn issue_kind(&self) -> Option<&str> {
        self.findings.get("issue_kind").and_then(|v| v.as_str())
    }
}

/// A unit the cycle will not repair, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedUnit {
    pub unit_id: String,
    pub reason: String,
}

impl SkippedUnit {
    pub fn new(unit_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            reason: reason.into(),
        }
    }
}

pub(crate) fn is_confidence(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_low_confidence_detection_has_no_problems() {
        let d = Detection {
            confidence: 0.3,
            units: vec![ProblemUnit::for_order("O-1", "stuck")],
            notes: None,
        };
        assert!(!d.has_problems(0.5));
        assert!(d.has_problems(0.2));
    }

    #[test]
    fn test_diagnosis_validation() {
        let unit = ProblemUnit::for_order("O-1", "");
        let good = Diagnosis {
            unit_id: "O-1".into(),
            findings: json!({"issue_kind": "needs_approval"}),
            confidence: 0.9,
        };
        assert!(good.validate_for(&unit).is_ok());
        assert_eq!(good.issue_kind(), Some("needs_approval"));

        let wrong_unit = Diagnosis {
            unit_id: "O-2".into(),
            ..good.clone()
        };
        assert!(wrong_unit.validate_for(&unit).is_err());

        let nan = Diagnosis {
            confidence: f64::NAN,
            ..good
        };
        assert!(nan.validate_for(&unit).is_err());
    }
}
