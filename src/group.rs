//! Auto-scaling group handles
//!
//! A [`GroupHandle`] is the engine's view of one opted-in group, produced by
//! the external discovery scanner (here deserialized from its JSON handover).
//! The handle carries the group's sizes, launch sources, member list, and the
//! effective per-group configuration.

use crate::config::GroupConfig;
use crate::launch::{LaunchConfiguration, LaunchTemplateRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One group member as reported by the group API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub instance_id: String,
    #[serde(default)]
    pub protected_from_scale_in: bool,
}

/// Engine view of one opted-in auto-scaling group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHandle {
    pub name: String,
    pub desired_capacity: i32,
    pub max_size: i32,
    /// Seconds after launch during which health checks are suppressed.
    pub health_check_grace_period: i64,
    #[serde(default)]
    pub launch_template: Option<LaunchTemplateRef>,
    #[serde(default)]
    pub launch_configuration: Option<LaunchConfiguration>,
    #[serde(default)]
    pub members: Vec<GroupMember>,
    /// Result of the external spot-ratio/target predicate: whether this
    /// group currently wants more of its on-demand members replaced.
    #[serde(default)]
    pub needs_replacement: bool,
    /// Group tags as reported by discovery; configuration overrides are
    /// layered from these over the region defaults.
    #[serde(default)]
    pub tags: Vec<crate::instance::Tag>,
    #[serde(default)]
    pub config: GroupConfig,
}

impl GroupHandle {
    pub fn has_member(&self, instance_id: &str) -> bool {
        self.members.iter().any(|m| m.instance_id == instance_id)
    }

    pub fn is_protected_from_scale_in(&self, instance_id: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.instance_id == instance_id && m.protected_from_scale_in)
    }

    /// Configured ephemeral block device count across the group's launch
    /// sources (the larger of launch configuration and launch template).
    pub fn configured_ephemeral_volumes(&self) -> u32 {
        let from_lc = self
            .launch_configuration
            .as_ref()
            .map(|lc| lc.ephemeral_volume_count())
            .unwrap_or(0);
        let from_lt = self
            .launch_template
            .as_ref()
            .and_then(|lt| lt.cached_data.as_ref())
            .map(|data| data.ephemeral_volume_count())
            .unwrap_or(0);
        from_lc.max(from_lt)
    }
}

/// Opted-in groups of one region, keyed by name.
pub type GroupTable = HashMap<String, GroupHandle>;

/// Parse the discovery scanner's JSON handover into a group table.
pub fn group_table_from_json(json: &str) -> crate::error::Result<GroupTable> {
    let groups: Vec<GroupHandle> = serde_json::from_str(json)?;
    Ok(groups.into_iter().map(|g| (g.name.clone(), g)).collect())
}
