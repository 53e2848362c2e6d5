//! # Property Loading
//!
//! Per-application key/value settings kept in a shared ledger domain.
//!
//! Rows may be scoped to a region. Resolution for the local region:
//!
//! - a row for another region is ignored
//! - a region-specific row always wins
//! - a region-less row only fills keys nothing has set yet

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerError, LedgerItem, LedgerQuery, LedgerScan, LedgerStore};

/// Field layout of the property domain.
///
/// The default domain is `InstanceProperties`, named alongside the
/// `InstanceSecurity` pool and `InstanceIdentity` membership domains.
/// Deployments with properties already stored under another domain name
/// set `domain` to that name; the attribute names are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySchema {
    /// Ledger domain holding the properties.
    pub domain: String,
    /// Attribute naming the application.
    pub app_field: String,
    /// Attribute holding the property key.
    pub key_field: String,
    /// Attribute holding the property value.
    pub value_field: String,
    /// Attribute holding the region (blank = all regions).
    pub region_field: String,
}

impl Default for PropertySchema {
    fn default() -> Self {
        Self {
            domain: "InstanceProperties".into(),
            app_field: "appId".into(),
            key_field: "property".into(),
            value_field: "value".into(),
            region_field: "region".into(),
        }
    }
}

/// One decoded property row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRecord {
    /// Owning application.
    pub app_id: String,
    /// Property key.
    pub key: String,
    /// Property value.
    pub value: String,
    /// Region the row applies to, `None` for every region.
    pub region: Option<String>,
}

impl PropertyRecord {
    /// Decode a ledger item using `schema`.
    #[must_use]
    pub fn from_item(item: &LedgerItem, schema: &PropertySchema) -> Self {
        let region = item.attribute(&schema.region_field).trim();
        Self {
            app_id: item.attribute(&schema.app_field).to_string(),
            key: item.attribute(&schema.key_field).to_string(),
            value: item.attribute(&schema.value_field).to_string(),
            region: (!region.is_empty()).then(|| region.to_string()),
        }
    }
}

/// Resolved properties for one application and region.
pub type PropertyMap = BTreeMap<String, String>;

/// Fold `record` into `map` for `local_region`.
///
/// Returns `true` if the map changed.
pub fn apply_property(map: &mut PropertyMap, record: PropertyRecord, local_region: &str) -> bool {
    match record.region.as_deref() {
        Some(region) if region != local_region => false,
        Some(_) => {
            map.insert(record.key, record.value);
            true
        }
        None if map.contains_key(&record.key) => false,
        None => {
            map.insert(record.key, record.value);
            true
        }
    }
}

/// Load every property of `app_id` that applies to `region`.
///
/// # Errors
///
/// Returns the first [`LedgerError`] hit while paging.
pub async fn load_properties<S: LedgerStore>(
    store: &S,
    schema: &PropertySchema,
    app_id: &str,
    region: &str,
    call_timeout: Option<Duration>,
) -> Result<PropertyMap, LedgerError> {
    let query = LedgerQuery::new(&schema.domain).where_eq(&schema.app_field, app_id);
    let mut scan = LedgerScan::new(store, query).with_call_timeout(call_timeout);
    let mut map = PropertyMap::new();
    let mut rows = 0usize;

    while let Some(page) = scan.next_page().await? {
        for item in &page {
            rows += 1;
            let record = PropertyRecord::from_item(item, schema);
            if record.key.is_empty() {
                tracing::debug!(item = %item.name, "property row without key, skipping");
                continue;
            }
            apply_property(&mut map, record, region);
        }
    }

    tracing::info!(app_id, region, rows, loaded = map.len(), "loaded properties");
    Ok(map)
}

/// Application id for an autoscaling group name: the text before the
/// first `-`. Names without a `-`, or starting with one, are used whole,
/// so the result is never empty for a non-empty name.
#[must_use]
pub fn app_id_from_group_name(group_name: &str) -> &str {
    match group_name.find('-') {
        Some(idx) if idx > 0 => &group_name[..idx],
        _ => group_name,
    }
}
