//! In-memory master source, optionally loaded from a JSON file.

use std::path::Path;

use async_trait::async_trait;

use super::{EligibilityFilter, MasterError, MasterShipment, MasterSource};

/// Serves a fixed list of shipments. Used for tests, demos and sites that
/// export the master as a JSON snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticMaster {
    shipments: Vec<MasterShipment>,
}

impl StaticMaster {
    pub fn new(shipments: Vec<MasterShipment>) -> Self {
        StaticMaster { shipments }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a JSON array of shipments.
    pub fn from_json_file(path: &Path) -> Result<Self, MasterError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MasterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let shipments: Vec<MasterShipment> = serde_json::from_str(&text).map_err(|e| {
            MasterError::Config(format!("invalid master JSON in {}: {}", path.display(), e))
        })?;
        Ok(StaticMaster { shipments })
    }

    pub fn len(&self) -> usize {
        self.shipments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shipments.is_empty()
    }
}

#[async_trait]
impl MasterSource for StaticMaster {
    async fn list_shipments(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<MasterShipment>, MasterError> {
        Ok(self
            .shipments
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn get_shipments(&self, refs: &[String]) -> Result<Vec<MasterShipment>, MasterError> {
        Ok(self
            .shipments
            .iter()
            .filter(|s| refs.contains(&s.external_ref))
            .cloned()
            .collect())
    }

    fn source_id(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn shipment(external_ref: &str, status: &str) -> MasterShipment {
        MasterShipment {
            external_ref: external_ref.into(),
            status: status.into(),
            document_date: "2025-01-15".into(),
            category: "retail".into(),
            customer: Some("PT Maju".into()),
        }
    }

    #[tokio::test]
    async fn lists_with_filter() {
        let master = StaticMaster::new(vec![shipment("SJ-1", "approved"), shipment("SJ-2", "draft")]);
        let filter = EligibilityFilter {
            statuses: ["approved".to_string()].into(),
            ..Default::default()
        };
        let listed = master.list_shipments(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].external_ref, "SJ-1");
    }

    #[tokio::test]
    async fn get_omits_unknown_refs() {
        let master = StaticMaster::new(vec![shipment("SJ-1", "approved")]);
        let found = master
            .get_shipments(&["SJ-1".to_string(), "SJ-9".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec![shipment("SJ-1", "approved")]);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"external_ref":"SJ-1","status":"approved","document_date":"2025-01-15","category":"retail"}}]"#
        )
        .unwrap();
        let master = StaticMaster::from_json_file(file.path()).unwrap();
        assert_eq!(master.len(), 1);
    }

    #[test]
    fn bad_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            StaticMaster::from_json_file(file.path()),
            Err(MasterError::Config(_))
        ));
    }
}
