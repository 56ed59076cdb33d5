//! Read-only access to the external shipment master.
//!
//! The master originates every shipment and is never written to. The
//! workflow treats it as a feed and reconciles against it at read time.

#[cfg(feature = "http")]
pub mod http;
pub mod static_master;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;

/// One shipment as the master reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterShipment {
    pub external_ref: String,
    pub status: String,
    /// `YYYY-MM-DD`.
    pub document_date: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("master source '{source_id}' unavailable: {message}")]
    Unavailable { source_id: String, message: String },

    #[error("invalid master record '{external_ref}': {message}")]
    InvalidRecord {
        external_ref: String,
        message: String,
    },

    #[error("master config error: {0}")]
    Config(String),
}

/// Eligibility predicates for entering the workflow. Empty sets and missing
/// bounds do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityFilter {
    pub statuses: BTreeSet<String>,
    /// Inclusive lower bound on the document date.
    pub date_from: Option<Date>,
    /// Inclusive upper bound on the document date.
    pub date_to: Option<Date>,
    pub categories: BTreeSet<String>,
}

impl EligibilityFilter {
    pub fn parse_date(value: &str) -> Result<Date, MasterError> {
        Date::parse(value, format_description!("[year]-[month]-[day]"))
            .map_err(|e| MasterError::Config(format!("invalid date '{}': {}", value, e)))
    }

    pub fn matches(&self, shipment: &MasterShipment) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&shipment.status) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&shipment.category) {
            return false;
        }
        if self.date_from.is_none() && self.date_to.is_none() {
            return true;
        }
        let Ok(date) = Self::parse_date(&shipment.document_date) else {
            tracing::debug!(
                external_ref = %shipment.external_ref,
                document_date = %shipment.document_date,
                "excluding master shipment with unparseable document date"
            );
            return false;
        };
        self.date_from.map_or(true, |from| date >= from) && self.date_to.map_or(true, |to| date <= to)
    }
}

/// A read-only source of master shipments.
#[async_trait]
pub trait MasterSource: Send + Sync {
    /// Shipments matching the eligibility filter.
    async fn list_shipments(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<MasterShipment>, MasterError>;

    /// Shipments for the given references. Unknown references are omitted.
    async fn get_shipments(&self, refs: &[String]) -> Result<Vec<MasterShipment>, MasterError>;

    fn source_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn shipment(status: &str, date: &str, category: &str) -> MasterShipment {
        MasterShipment {
            external_ref: "SJ-1".into(),
            status: status.into(),
            document_date: date.into(),
            category: category.into(),
            customer: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EligibilityFilter::default().matches(&shipment("open", "not a date", "x")));
    }

    #[test]
    fn date_bounds_are_inclusive() {
        let filter = EligibilityFilter {
            date_from: Some(date!(2025 - 01 - 01)),
            date_to: Some(date!(2025 - 01 - 31)),
            ..Default::default()
        };
        assert!(filter.matches(&shipment("open", "2025-01-01", "x")));
        assert!(filter.matches(&shipment("open", "2025-01-31", "x")));
        assert!(!filter.matches(&shipment("open", "2025-02-01", "x")));
        assert!(!filter.matches(&shipment("open", "garbage", "x")));
    }

    #[test]
    fn status_and_category_sets() {
        let filter = EligibilityFilter {
            statuses: ["approved".to_string()].into(),
            categories: ["retail".to_string(), "export".to_string()].into(),
            ..Default::default()
        };
        assert!(filter.matches(&shipment("approved", "2025-01-01", "export")));
        assert!(!filter.matches(&shipment("draft", "2025-01-01", "export")));
        assert!(!filter.matches(&shipment("approved", "2025-01-01", "internal")));
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert_eq!(
            EligibilityFilter::parse_date("2025-06-30").unwrap(),
            date!(2025 - 06 - 30)
        );
        assert!(matches!(
            EligibilityFilter::parse_date("30/06/2025"),
            Err(MasterError::Config(_))
        ));
    }
}
