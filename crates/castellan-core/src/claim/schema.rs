//! Field layout of the credential pool domain.

use serde::{Deserialize, Serialize};

use crate::ledger::LedgerItem;

/// Names of the domain and attributes that make up a credential row.
///
/// Historical pool layouts differ only in naming and read consistency,
/// so one protocol is driven by this schema instead of one code path per
/// layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimSchema {
    /// Ledger domain holding the pool.
    pub domain: String,
    /// Attribute naming the owning application.
    pub app_field: String,
    /// Attribute holding the owning instance id (empty = unclaimed).
    pub owner_field: String,
    /// Attribute holding the keystore location.
    pub keystore_field: String,
    /// Attribute holding the truststore location.
    pub truststore_field: String,
    /// Attribute holding the provisioning timestamp.
    pub updated_field: String,
    /// Issue the pool scan as a consistent read.
    pub consistent_scan: bool,
}

impl Default for ClaimSchema {
    fn default() -> Self {
        Self {
            domain: "InstanceSecurity".into(),
            app_field: "appId".into(),
            owner_field: "instanceId".into(),
            keystore_field: "keystore".into(),
            truststore_field: "truststore".into(),
            updated_field: "updateTimestamp".into(),
            consistent_scan: true,
        }
    }
}

/// One row of the credential pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Ledger item name.
    pub row_id: String,
    /// Owning instance, empty while unclaimed.
    pub owner_instance_id: String,
    /// Keystore location.
    pub keystore_ref: String,
    /// Truststore location.
    pub truststore_ref: String,
    /// Provisioning timestamp as stored, if any.
    pub last_updated: Option<String>,
}

impl CredentialRecord {
    /// Decode a ledger item using `schema`.
    #[must_use]
    pub fn from_item(item: &LedgerItem, schema: &ClaimSchema) -> Self {
        let updated = item.attribute(&schema.updated_field);
        Self {
            row_id: item.name.clone(),
            owner_instance_id: item.attribute(&schema.owner_field).to_string(),
            keystore_ref: item.attribute(&schema.keystore_field).to_string(),
            truststore_ref: item.attribute(&schema.truststore_field).to_string(),
            last_updated: (!updated.is_empty()).then(|| updated.to_string()),
        }
    }

    /// Returns `true` once an instance owns the row.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        !self.owner_instance_id.is_empty()
    }

    /// Returns `true` if both store references are present.
    #[must_use]
    pub fn has_refs(&self) -> bool {
        !self.keystore_ref.is_empty() && !self.truststore_ref.is_empty()
    }

    /// The references handed to the owning instance.
    #[must_use]
    pub fn refs(&self) -> CredentialRefs {
        CredentialRefs {
            row_id: self.row_id.clone(),
            keystore_ref: self.keystore_ref.clone(),
            truststore_ref: self.truststore_ref.clone(),
        }
    }
}

/// Keystore and truststore locations owned by this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRefs {
    /// Pool row the references came from.
    pub row_id: String,
    /// Keystore location.
    pub keystore_ref: String,
    /// Truststore location.
    pub truststore_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_field_names() {
        let schema = ClaimSchema::default();
        assert_eq!(schema.domain, "InstanceSecurity");
        assert_eq!(schema.owner_field, "instanceId");
        assert!(schema.consistent_scan);
    }

    #[test]
    fn test_schema_partial_override() {
        let schema: ClaimSchema =
            serde_json::from_str(r#"{"owner_field": "owner", "consistent_scan": false}"#).unwrap();
        assert_eq!(schema.owner_field, "owner");
        assert_eq!(schema.keystore_field, "keystore");
        assert!(!schema.consistent_scan);
    }

    #[test]
    fn test_record_from_item() {
        let schema = ClaimSchema::default();
        let item = LedgerItem::new("row-1")
            .with_attribute("keystore", "ks/a.jks")
            .with_attribute("truststore", "ts/a.jks");
        let record = CredentialRecord::from_item(&item, &schema);
        assert!(!record.is_claimed());
        assert!(record.has_refs());
        assert_eq!(record.last_updated, None);
        assert_eq!(record.refs().row_id, "row-1");
    }

    #[test]
    fn test_record_missing_truststore_has_no_refs() {
        let schema = ClaimSchema::default();
        let item = LedgerItem::new("row-1")
            .with_attribute("keystore", "ks/a.jks")
            .with_attribute("instanceId", "i-9")
            .with_attribute("updateTimestamp", "2016-03-24");
        let record = CredentialRecord::from_item(&item, &schema);
        assert!(record.is_claimed());
        assert!(!record.has_refs());
        assert_eq!(record.last_updated.as_deref(), Some("2016-03-24"));
    }
}
