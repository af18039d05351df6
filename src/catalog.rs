//! Instance type catalog
//!
//! Read-only lookup from instance type name to its hardware and pricing
//! snapshot. Loaded once per region by the external pricing ingester and
//! immutable afterwards.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pricing bundle for one instance type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypePricing {
    pub on_demand: f64,
    /// Spot price per availability zone. A missing or zero entry means the
    /// type is unavailable in that zone.
    #[serde(default)]
    pub spot: HashMap<String, f64>,
    #[serde(default)]
    pub ebs_surcharge: f64,
    #[serde(default)]
    pub premium: f64,
}

impl TypePricing {
    pub fn spot_price(&self, availability_zone: &str) -> f64 {
        self.spot.get(availability_zone).copied().unwrap_or(0.0)
    }
}

/// Instance-store geometry of one instance type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InstanceStoreInfo {
    pub device_count: u32,
    pub device_size_gb: f64,
    pub is_ssd: bool,
}

/// Immutable hardware and pricing snapshot for one instance type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub vcpu: u32,
    /// Physical processor description, e.g. "Intel Xeon Platinum 8175".
    pub physical_processor: String,
    #[serde(default)]
    pub gpu: u32,
    pub memory_gib: f64,
    /// Supported virtualization types ("HVM", "PV"). Empty means HVM-only.
    #[serde(default)]
    pub virtualization_types: Vec<String>,
    #[serde(default)]
    pub instance_store: InstanceStoreInfo,
    /// EBS throughput ceiling in MB/s.
    #[serde(default)]
    pub ebs_throughput: f64,
    pub pricing: TypePricing,
}

/// Indexed catalog of instance types for one region.
///
/// `get` returns `None` for unknown types without error. No ordering is
/// guaranteed between types; callers that need determinism use
/// [`TypeCatalog::iter_sorted`].
#[derive(Debug, Default)]
pub struct TypeCatalog {
    types: HashMap<String, InstanceTypeInfo>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_types(types: Vec<InstanceTypeInfo>) -> Self {
        Self {
            types: types
                .into_iter()
                .map(|t| (t.instance_type.clone(), t))
                .collect(),
        }
    }

    /// Load from the JSON handed over by the pricing ingester.
    pub fn from_json(json: &str) -> Result<Self> {
        let types: Vec<InstanceTypeInfo> = serde_json::from_str(json)?;
        Ok(Self::from_types(types))
    }

    pub fn get(&self, instance_type: &str) -> Option<&InstanceTypeInfo> {
        self.types.get(instance_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate types in lexicographic type-name order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &InstanceTypeInfo> {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        names.into_iter().map(move |n| &self.types[n])
    }
}
