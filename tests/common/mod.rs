#![allow(dead_code)]

//! Shared test fixtures: a scripted mock of the cloud capability trait plus
//! builders for instances, types, and groups.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use spotctl::catalog::{InstanceStoreInfo, InstanceTypeInfo, TypePricing};
use spotctl::cloud::{CloudCapability, InstanceAttribute, LaunchedInstance};
use spotctl::config::{Config, GroupConfig};
use spotctl::error::{Result, SpotctlError};
use spotctl::group::{GroupHandle, GroupMember};
use spotctl::instance::{
    InstanceRecord, InstanceState, Lifecycle, Placement, Tag, VirtualizationType,
};
use spotctl::launch::{ImageDescription, LaunchSpec, LaunchTemplateData};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One recorded capability invocation, for asserting protocol order.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    DescribeAttribute(String),
    DescribeInstance(String),
    TerminateInstances(Vec<String>),
    RunInstances(String),
    SuspendProcesses(String),
    ResumeProcesses(String),
    SetMaxSize(String, i32),
    AttachInstances(String, Vec<String>, bool),
    TerminateInGroup(String, bool, bool),
}

/// What the next `run_instances` call should do.
pub enum LaunchBehavior {
    Succeed,
    InsufficientCapacity,
    Fail(&'static str),
}

#[derive(Default)]
pub struct MockCloud {
    pub calls: Mutex<Vec<CloudCall>>,
    /// Instances the mock can describe.
    pub instances: Mutex<HashMap<String, InstanceRecord>>,
    /// Termination-protection answers; missing ids answer false.
    pub protected: Mutex<HashMap<String, bool>>,
    /// Ids whose attribute describe fails outright.
    pub attribute_errors: Mutex<Vec<String>>,
    pub fail_attach: AtomicBool,
    pub fail_terminate_in_group: AtomicBool,
    pub fail_describe_instance: AtomicBool,
    /// Scripted launch outcomes, consumed in order; empty means succeed.
    pub launch_plan: Mutex<VecDeque<LaunchBehavior>>,
    /// Every launch request the mock received.
    pub launch_specs: Mutex<Vec<LaunchSpec>>,
    launch_counter: AtomicUsize,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, record: InstanceRecord) -> Self {
        self.instances
            .lock()
            .unwrap()
            .insert(record.instance_id.clone(), record);
        self
    }

    pub fn plan_launches(self, behaviors: Vec<LaunchBehavior>) -> Self {
        *self.launch_plan.lock().unwrap() = behaviors.into();
        self
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: CloudCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CloudCapability for MockCloud {
    async fn describe_instance_attribute(
        &self,
        instance_id: &str,
        _attribute: InstanceAttribute,
    ) -> Result<bool> {
        self.record(CloudCall::DescribeAttribute(instance_id.to_string()));
        if self
            .attribute_errors
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == instance_id)
        {
            return Err(SpotctlError::Capability {
                operation: "DescribeInstanceAttribute".to_string(),
                instance_id: instance_id.to_string(),
                message: "access denied".to_string(),
                source: None,
            });
        }
        Ok(self
            .protected
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .unwrap_or(false))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.record(CloudCall::TerminateInstances(instance_ids.to_vec()));
        Ok(())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<LaunchedInstance>> {
        self.record(CloudCall::RunInstances(spec.instance_type.clone()));
        self.launch_specs.lock().unwrap().push(spec.clone());
        let behavior = self
            .launch_plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LaunchBehavior::Succeed);
        match behavior {
            LaunchBehavior::Succeed => {
                let n = self.launch_counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![LaunchedInstance {
                    instance_id: format!("i-spot{:04}", n),
                    instance_type: spec.instance_type.clone(),
                }])
            }
            LaunchBehavior::InsufficientCapacity => Err(SpotctlError::InsufficientCapacity {
                instance_id: spec.instance_type.clone(),
                message: "InsufficientInstanceCapacity".to_string(),
            }),
            LaunchBehavior::Fail(message) => Err(SpotctlError::Capability {
                operation: "RunInstances".to_string(),
                instance_id: spec.instance_type.clone(),
                message: message.to_string(),
                source: None,
            }),
        }
    }

    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<ImageDescription>> {
        Ok(image_ids
            .iter()
            .map(|id| ImageDescription {
                image_id: id.clone(),
                block_device_mappings: vec![],
            })
            .collect())
    }

    async fn describe_launch_template_versions(
        &self,
        _launch_template_id: &str,
        _version: &str,
    ) -> Result<LaunchTemplateData> {
        Ok(LaunchTemplateData::default())
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.record(CloudCall::DescribeInstance(instance_id.to_string()));
        if self.fail_describe_instance.load(Ordering::SeqCst) {
            return Err(SpotctlError::Capability {
                operation: "DescribeInstances".to_string(),
                instance_id: instance_id.to_string(),
                message: "request timed out".to_string(),
                source: None,
            });
        }
        Ok(self.instances.lock().unwrap().get(instance_id).cloned())
    }

    async fn suspend_processes(&self, group: &str) -> Result<()> {
        self.record(CloudCall::SuspendProcesses(group.to_string()));
        Ok(())
    }

    async fn resume_processes(&self, group: &str) -> Result<()> {
        self.record(CloudCall::ResumeProcesses(group.to_string()));
        Ok(())
    }

    async fn set_group_max_size(&self, group: &str, max_size: i32) -> Result<()> {
        self.record(CloudCall::SetMaxSize(group.to_string(), max_size));
        Ok(())
    }

    async fn attach_instances(
        &self,
        group: &str,
        instance_ids: &[String],
        increment_capacity: bool,
    ) -> Result<()> {
        self.record(CloudCall::AttachInstances(
            group.to_string(),
            instance_ids.to_vec(),
            increment_capacity,
        ));
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(SpotctlError::Capability {
                operation: "AttachInstances".to_string(),
                instance_id: instance_ids.join(","),
                message: "ValidationError".to_string(),
                source: None,
            });
        }
        Ok(())
    }

    async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
        should_be_unhealthy: bool,
    ) -> Result<()> {
        self.record(CloudCall::TerminateInGroup(
            instance_id.to_string(),
            decrement_desired_capacity,
            should_be_unhealthy,
        ));
        if self.fail_terminate_in_group.load(Ordering::SeqCst) {
            return Err(SpotctlError::Capability {
                operation: "TerminateInstanceInAutoScalingGroup".to_string(),
                instance_id: instance_id.to_string(),
                message: "ScalingActivityInProgress".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

pub fn on_demand_instance(id: &str, group: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: id.to_string(),
        region: "eu-west-1".to_string(),
        subnet_id: Some("subnet-1".to_string()),
        state: InstanceState::Running,
        launch_time: Utc::now() - Duration::seconds(3600),
        lifecycle: Lifecycle::OnDemand,
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
            Tag::new("aws:autoscaling:groupName", group),
            Tag::new("Name", "web-1"),
        ],
        price: 0.0,
    }
}

pub fn spot_replacement(id: &str, target: &str, group: &str, uptime_secs: i64) -> InstanceRecord {
    InstanceRecord {
        instance_id: id.to_string(),
        region: "eu-west-1".to_string(),
        subnet_id: Some("subnet-1".to_string()),
        state: InstanceState::Running,
        launch_time: Utc::now() - Duration::seconds(uptime_secs),
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
        instance_type: "m5a.large".to_string(),
        tags: vec![
            Tag::new("launched-by-autospotting", "true"),
            Tag::new("launched-for-asg", group),
            Tag::new("launched-for-replacing-instance", target),
        ],
        price: 0.0,
    }
}

pub fn type_info(
    name: &str,
    processor: &str,
    vcpu: u32,
    memory: f64,
    on_demand: f64,
    spot: f64,
    surcharge: f64,
) -> InstanceTypeInfo {
    let mut spot_map = HashMap::new();
    spot_map.insert("eu-west-1a".to_string(), spot);
    InstanceTypeInfo {
        instance_type: name.to_string(),
        vcpu,
        physical_processor: processor.to_string(),
        gpu: 0,
        memory_gib: memory,
        virtualization_types: vec!["HVM".to_string()],
        instance_store: InstanceStoreInfo::default(),
        ebs_throughput: 650.0,
        pricing: TypePricing {
            on_demand,
            spot: spot_map,
            ebs_surcharge: surcharge,
            premium: 0.0,
        },
    }
}

pub fn group(name: &str, desired: i32, max: i32, grace: i64) -> GroupHandle {
    GroupHandle {
        name: name.to_string(),
        desired_capacity: desired,
        max_size: max,
        health_check_grace_period: grace,
        launch_template: None,
        launch_configuration: None,
        members: vec![],
        needs_replacement: true,
        tags: vec![],
        config: GroupConfig::from_defaults(&Config::default()),
    }
}

pub fn member(id: &str, protected: bool) -> GroupMember {
    GroupMember {
        instance_id: id.to_string(),
        protected_from_scale_in: protected,
    }
}
