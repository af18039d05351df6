//! Observed instance records
//!
//! An [`InstanceRecord`] is the snapshot of one EC2 instance as seen by the
//! external scanner. Records are `Clone`; the engine enriches its own copy
//! (effective price, group name) so registry contents stay immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag marking an instance as a spot replacement we launched.
pub const TAG_LAUNCHED_BY: &str = "launched-by-autospotting";
/// Tag naming the group a spot replacement was launched for.
pub const TAG_LAUNCHED_FOR_GROUP: &str = "launched-for-asg";
/// Tag naming the on-demand instance a spot replacement is meant to swap out.
pub const TAG_REPLACEMENT_TARGET: &str = "launched-for-replacing-instance";
/// Cloud-managed tag recording group membership on member instances.
pub const TAG_GROUP_MEMBERSHIP: &str = "aws:autoscaling:groupName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "terminated" => Some(InstanceState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationType {
    Hvm,
    Paravirtual,
}

/// Placement block of an observed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub availability_zone: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub tenancy: Option<String>,
}

/// One instance tag. Order of tags on a record is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Snapshot of one observed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub region: String,
    pub subnet_id: Option<String>,
    pub state: InstanceState,
    pub launch_time: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    pub placement: Placement,
    pub security_group_ids: Vec<String>,
    pub ebs_optimized: bool,
    pub virtualization_type: VirtualizationType,
    pub image_id: String,
    pub instance_type: String,
    pub tags: Vec<Tag>,
    /// Effective on-demand price after multipliers; set by the engine during
    /// group resolution.
    #[serde(default)]
    pub price: f64,
}

impl InstanceRecord {
    pub fn availability_zone(&self) -> &str {
        &self.placement.availability_zone
    }

    pub fn is_spot(&self) -> bool {
        self.lifecycle == Lifecycle::Spot
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Instances already shutting down or gone can't be terminated again.
    pub fn can_terminate(&self) -> bool {
        !matches!(
            self.state,
            InstanceState::Terminated | InstanceState::ShuttingDown
        )
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// True when this instance is a spot replacement launched by us.
    pub fn launched_by_us(&self) -> bool {
        self.tag_value(TAG_LAUNCHED_BY).is_some()
    }

    /// Group this instance is a member of, per the cloud-managed tag.
    pub fn member_of_group(&self) -> Option<&str> {
        self.tag_value(TAG_GROUP_MEMBERSHIP)
    }

    /// Group a spot replacement was launched for.
    pub fn replacement_target_group(&self) -> Option<&str> {
        self.tag_value(TAG_LAUNCHED_FOR_GROUP)
    }

    /// On-demand instance a spot replacement is meant to swap out.
    pub fn replacement_target_instance(&self) -> Option<&str> {
        self.tag_value(TAG_REPLACEMENT_TARGET)
    }

    /// Seconds since launch, at `now`.
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.launch_time).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> InstanceRecord {
        InstanceRecord {
            instance_id: "i-0abc".to_string(),
            region: "eu-west-1".to_string(),
            subnet_id: Some("subnet-1".to_string()),
            state: InstanceState::Running,
            launch_time: Utc::now() - Duration::seconds(600),
            lifecycle: Lifecycle::Spot,
            placement: Placement {
                availability_zone: "eu-west-1a".to_string(),
                group_name: None,
                tenancy: None,
            },
            security_group_ids: vec!["sg-1".to_string()],
            ebs_optimized: true,
            virtualization_type: VirtualizationType::Hvm,
            image_id: "ami-1".to_string(),
            instance_type: "m5.large".to_string(),
            tags: vec![
                Tag::new(TAG_LAUNCHED_BY, "true"),
                Tag::new(TAG_REPLACEMENT_TARGET, "i-0target"),
                Tag::new(TAG_LAUNCHED_FOR_GROUP, "web"),
            ],
            price: 0.0,
        }
    }

    #[test]
    fn test_replacement_tags() {
        let inst = record();
        assert!(inst.launched_by_us());
        assert_eq!(inst.replacement_target_instance(), Some("i-0target"));
        assert_eq!(inst.replacement_target_group(), Some("web"));
        assert_eq!(inst.member_of_group(), None);
    }

    #[test]
    fn test_can_terminate() {
        let mut inst = record();
        assert!(inst.can_terminate());
        inst.state = InstanceState::ShuttingDown;
        assert!(!inst.can_terminate());
        inst.state = InstanceState::Terminated;
        assert!(!inst.can_terminate());
    }

    #[test]
    fn test_uptime() {
        let inst = record();
        let uptime = inst.uptime_secs(Utc::now());
        assert!((595..=605).contains(&uptime));
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(
            InstanceState::parse("shutting-down"),
            Some(InstanceState::ShuttingDown)
        );
        assert_eq!(InstanceState::parse("rebooting"), None);
    }
}
