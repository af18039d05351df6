//! Cloud capability interface
//!
//! The narrow, semantically-named slice of the cloud APIs the core needs,
//! behind one trait per region handle. [`AwsCloud`] is the production
//! adapter over the EC2 and Auto Scaling SDK clients; tests implement the
//! trait directly.

use crate::error::{Result, SpotctlError};
use crate::instance::{
    InstanceRecord, InstanceState, Lifecycle, Placement, Tag, VirtualizationType,
};
use crate::launch::{
    EbsDevice, ImageDescription, LaunchSpec, LaunchTemplateData, TemplateBlockDevice,
    TemplateNetworkInterface,
};
use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types as ec2;
use aws_sdk_ec2::Client as Ec2Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Instance attributes the core is allowed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAttribute {
    DisableApiTermination,
}

/// Summary of one instance started by a launch request.
#[derive(Debug, Clone)]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub instance_type: String,
}

/// Region-scoped cloud operations needed by the replacement core.
///
/// All operations are fallible and carry the per-call deadline configured on
/// the implementation.
#[async_trait]
pub trait CloudCapability: Send + Sync {
    /// Read a boolean instance attribute; only `disableApiTermination` is
    /// ever requested.
    async fn describe_instance_attribute(
        &self,
        instance_id: &str,
        attribute: InstanceAttribute,
    ) -> Result<bool>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<LaunchedInstance>>;

    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<ImageDescription>>;

    async fn describe_launch_template_versions(
        &self,
        launch_template_id: &str,
        version: &str,
    ) -> Result<LaunchTemplateData>;

    /// Single-id slice of the external discovery surface, used to refresh a
    /// swap target. `None` when the instance no longer exists.
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    async fn suspend_processes(&self, group: &str) -> Result<()>;

    async fn resume_processes(&self, group: &str) -> Result<()>;

    async fn set_group_max_size(&self, group: &str, max_size: i32) -> Result<()>;

    async fn attach_instances(
        &self,
        group: &str,
        instance_ids: &[String],
        increment_capacity: bool,
    ) -> Result<()>;

    async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
        should_be_unhealthy: bool,
    ) -> Result<()>;
}

/// Production capability handle for one region.
pub struct AwsCloud {
    ec2: Ec2Client,
    autoscaling: AutoScalingClient,
    region: String,
    call_timeout: Duration,
}

impl AwsCloud {
    pub fn new(aws_config: &aws_config::SdkConfig, region: String, call_timeout: Duration) -> Self {
        Self {
            ec2: Ec2Client::new(aws_config),
            autoscaling: AutoScalingClient::new(aws_config),
            region,
            call_timeout,
        }
    }

    /// Apply the per-call deadline and wrap failures with the operation name
    /// and the subject the caller was working on.
    async fn guarded<T, E, Fut>(&self, operation: &str, subject: &str, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SpotctlError::capability(operation, subject, e)),
            Err(_) => Err(SpotctlError::Capability {
                operation: operation.to_string(),
                instance_id: subject.to_string(),
                message: format!("deadline of {:?} exceeded", self.call_timeout),
                source: None,
            }),
        }
    }
}

#[async_trait]
impl CloudCapability for AwsCloud {
    async fn describe_instance_attribute(
        &self,
        instance_id: &str,
        attribute: InstanceAttribute,
    ) -> Result<bool> {
        let attribute_name = match attribute {
            InstanceAttribute::DisableApiTermination => {
                ec2::InstanceAttributeName::DisableApiTermination
            }
        };
        let output = self
            .guarded(
                "DescribeInstanceAttribute",
                instance_id,
                self.ec2
                    .describe_instance_attribute()
                    .instance_id(instance_id)
                    .attribute(attribute_name)
                    .send(),
            )
            .await?;
        Ok(output
            .disable_api_termination()
            .and_then(|v| v.value())
            .unwrap_or(false))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        let subject = instance_ids.join(",");
        let mut request = self.ec2.terminate_instances();
        for id in instance_ids {
            request = request.instance_ids(id);
        }
        self.guarded("TerminateInstances", &subject, request.send())
            .await?;
        Ok(())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<LaunchedInstance>> {
        let mut request = self
            .ec2
            .run_instances()
            .instance_type(ec2::InstanceType::from(spec.instance_type.as_str()))
            .min_count(spec.min_count)
            .max_count(spec.max_count)
            .ebs_optimized(spec.ebs_optimized)
            .placement(to_sdk_placement(&spec.placement))
            .instance_market_options(
                ec2::InstanceMarketOptionsRequest::builder()
                    .market_type(ec2::MarketType::Spot)
                    .spot_options(
                        ec2::SpotMarketOptions::builder()
                            .max_price(&spec.max_price)
                            .build(),
                    )
                    .build(),
            )
            .tag_specifications(to_sdk_tag_specification(&spec.tags));

        if let Some(subnet) = &spec.subnet_id {
            request = request.subnet_id(subnet);
        }
        for sg in &spec.security_group_ids {
            request = request.security_group_ids(sg);
        }
        if let Some(image_id) = &spec.image_id {
            request = request.image_id(image_id);
        }
        if let Some(key_name) = &spec.key_name {
            request = request.key_name(key_name);
        }
        if let Some(profile) = &spec.iam_instance_profile {
            let profile_spec = match profile {
                crate::launch::IamProfileSpec::Arn(arn) => {
                    ec2::IamInstanceProfileSpecification::builder()
                        .arn(arn)
                        .build()
                }
                crate::launch::IamProfileSpec::Name(name) => {
                    ec2::IamInstanceProfileSpecification::builder()
                        .name(name)
                        .build()
                }
            };
            request = request.iam_instance_profile(profile_spec);
        }
        if let Some(user_data) = &spec.user_data {
            request = request.user_data(user_data);
        }
        if let Some(enabled) = spec.monitoring {
            request = request.monitoring(
                ec2::RunInstancesMonitoringEnabled::builder()
                    .enabled(enabled)
                    .build(),
            );
        }
        for bdm in &spec.block_device_mappings {
            request = request.block_device_mappings(to_sdk_block_device(bdm));
        }
        for ni in &spec.network_interfaces {
            request = request.network_interfaces(to_sdk_network_interface(ni));
        }
        if let Some(lt) = &spec.launch_template {
            request = request.launch_template(
                ec2::LaunchTemplateSpecification::builder()
                    .launch_template_id(&lt.launch_template_id)
                    .version(&lt.version)
                    .build(),
            );
        }

        let output = match tokio::time::timeout(self.call_timeout, request.send()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                if e.code() == Some("InsufficientInstanceCapacity") {
                    return Err(SpotctlError::InsufficientCapacity {
                        instance_id: spec.instance_type.clone(),
                        message: e.message().unwrap_or("no spot capacity").to_string(),
                    });
                }
                return Err(SpotctlError::capability("RunInstances", &spec.instance_type, e));
            }
            Err(_) => {
                return Err(SpotctlError::Capability {
                    operation: "RunInstances".to_string(),
                    instance_id: spec.instance_type.clone(),
                    message: format!("deadline of {:?} exceeded", self.call_timeout),
                    source: None,
                })
            }
        };

        Ok(output
            .instances()
            .iter()
            .filter_map(|inst| {
                Some(LaunchedInstance {
                    instance_id: inst.instance_id()?.to_string(),
                    instance_type: inst
                        .instance_type()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<ImageDescription>> {
        let subject = image_ids.join(",");
        let mut request = self.ec2.describe_images();
        for id in image_ids {
            request = request.image_ids(id);
        }
        let output = self
            .guarded("DescribeImages", &subject, request.send())
            .await?;

        Ok(output
            .images()
            .iter()
            .filter_map(|image| {
                Some(ImageDescription {
                    image_id: image.image_id()?.to_string(),
                    block_device_mappings: image
                        .block_device_mappings()
                        .iter()
                        .map(from_sdk_block_device)
                        .collect(),
                })
            })
            .collect())
    }

    async fn describe_launch_template_versions(
        &self,
        launch_template_id: &str,
        version: &str,
    ) -> Result<LaunchTemplateData> {
        let output = self
            .guarded(
                "DescribeLaunchTemplateVersions",
                launch_template_id,
                self.ec2
                    .describe_launch_template_versions()
                    .launch_template_id(launch_template_id)
                    .versions(version)
                    .send(),
            )
            .await?;

        let data = output
            .launch_template_versions()
            .first()
            .and_then(|v| v.launch_template_data())
            .ok_or_else(|| SpotctlError::Capability {
                operation: "DescribeLaunchTemplateVersions".to_string(),
                instance_id: launch_template_id.to_string(),
                message: "missing launch template version information".to_string(),
                source: None,
            })?;

        Ok(LaunchTemplateData {
            block_device_mappings: data
                .block_device_mappings()
                .iter()
                .map(|bdm| TemplateBlockDevice {
                    device_name: bdm.device_name().map(str::to_string),
                    virtual_name: bdm.virtual_name().map(str::to_string),
                    no_device: bdm.no_device().map(str::to_string),
                    ebs: bdm.ebs().map(|ebs| EbsDevice {
                        delete_on_termination: ebs.delete_on_termination(),
                        encrypted: ebs.encrypted(),
                        iops: ebs.iops(),
                        snapshot_id: ebs.snapshot_id().map(str::to_string),
                        volume_size: ebs.volume_size(),
                        volume_type: ebs.volume_type().map(|v| v.as_str().to_string()),
                    }),
                })
                .collect(),
            network_interfaces: data
                .network_interfaces()
                .iter()
                .map(|ni| TemplateNetworkInterface {
                    associate_public_ip_address: ni.associate_public_ip_address(),
                    device_index: ni.device_index(),
                })
                .collect(),
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let output = self
            .guarded(
                "DescribeInstances",
                instance_id,
                self.ec2
                    .describe_instances()
                    .instance_ids(instance_id)
                    .send(),
            )
            .await?;

        let instance = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id));

        match instance {
            Some(instance) => Ok(from_sdk_instance(instance, &self.region)),
            None => Ok(None),
        }
    }

    async fn suspend_processes(&self, group: &str) -> Result<()> {
        self.guarded(
            "SuspendProcesses",
            group,
            self.autoscaling
                .suspend_processes()
                .auto_scaling_group_name(group)
                .send(),
        )
        .await?;
        Ok(())
    }

    async fn resume_processes(&self, group: &str) -> Result<()> {
        self.guarded(
            "ResumeProcesses",
            group,
            self.autoscaling
                .resume_processes()
                .auto_scaling_group_name(group)
                .send(),
        )
        .await?;
        Ok(())
    }

    async fn set_group_max_size(&self, group: &str, max_size: i32) -> Result<()> {
        self.guarded(
            "UpdateAutoScalingGroup",
            group,
            self.autoscaling
                .update_auto_scaling_group()
                .auto_scaling_group_name(group)
                .max_size(max_size)
                .send(),
        )
        .await?;
        Ok(())
    }

    async fn attach_instances(
        &self,
        group: &str,
        instance_ids: &[String],
        increment_capacity: bool,
    ) -> Result<()> {
        if !increment_capacity {
            // AttachInstances always raises desired capacity; the caller's
            // decrementing terminate brings it back to target.
            debug!(
                "Attach to {} will transiently raise desired capacity",
                group
            );
        }
        let mut request = self
            .autoscaling
            .attach_instances()
            .auto_scaling_group_name(group);
        for id in instance_ids {
            request = request.instance_ids(id);
        }
        self.guarded("AttachInstances", group, request.send())
            .await?;
        Ok(())
    }

    async fn terminate_instance_in_group(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
        should_be_unhealthy: bool,
    ) -> Result<()> {
        if should_be_unhealthy {
            if let Err(e) = self
                .guarded(
                    "SetInstanceHealth",
                    instance_id,
                    self.autoscaling
                        .set_instance_health()
                        .instance_id(instance_id)
                        .health_status("Unhealthy")
                        .should_respect_grace_period(false)
                        .send(),
                )
                .await
            {
                warn!(
                    "Couldn't mark {} unhealthy before termination: {}",
                    instance_id, e
                );
            }
        }
        self.guarded(
            "TerminateInstanceInAutoScalingGroup",
            instance_id,
            self.autoscaling
                .terminate_instance_in_auto_scaling_group()
                .instance_id(instance_id)
                .should_decrement_desired_capacity(decrement_desired_capacity)
                .send(),
        )
        .await?;
        Ok(())
    }
}

fn to_sdk_placement(placement: &Placement) -> ec2::Placement {
    ec2::Placement::builder()
        .availability_zone(&placement.availability_zone)
        .set_group_name(placement.group_name.clone())
        .set_tenancy(placement.tenancy.as_deref().map(ec2::Tenancy::from))
        .build()
}

fn to_sdk_tag_specification(tags: &[Tag]) -> ec2::TagSpecification {
    let mut builder = ec2::TagSpecification::builder().resource_type(ec2::ResourceType::Instance);
    for tag in tags {
        builder = builder.tags(
            ec2::Tag::builder()
                .key(&tag.key)
                .value(&tag.value)
                .build(),
        );
    }
    builder.build()
}

fn to_sdk_block_device(bdm: &crate::launch::BlockDeviceMapping) -> ec2::BlockDeviceMapping {
    ec2::BlockDeviceMapping::builder()
        .set_device_name(bdm.device_name.clone())
        .set_virtual_name(bdm.virtual_name.clone())
        .set_ebs(bdm.ebs.as_ref().map(|ebs| {
            ec2::EbsBlockDevice::builder()
                .set_delete_on_termination(ebs.delete_on_termination)
                .set_encrypted(ebs.encrypted)
                .set_iops(ebs.iops)
                .set_snapshot_id(ebs.snapshot_id.clone())
                .set_volume_size(ebs.volume_size)
                .set_volume_type(
                    ebs.volume_type
                        .as_deref()
                        .map(ec2::VolumeType::from),
                )
                .build()
        }))
        .build()
}

fn to_sdk_network_interface(
    ni: &crate::launch::NetworkInterfaceSpec,
) -> ec2::InstanceNetworkInterfaceSpecification {
    ec2::InstanceNetworkInterfaceSpecification::builder()
        .set_associate_public_ip_address(ni.associate_public_ip_address)
        .device_index(ni.device_index)
        .set_subnet_id(ni.subnet_id.clone())
        .set_groups(if ni.security_group_ids.is_empty() {
            None
        } else {
            Some(ni.security_group_ids.clone())
        })
        .build()
}

fn from_sdk_block_device(bdm: &ec2::BlockDeviceMapping) -> TemplateBlockDevice {
    TemplateBlockDevice {
        device_name: bdm.device_name().map(str::to_string),
        virtual_name: bdm.virtual_name().map(str::to_string),
        no_device: bdm.no_device().map(str::to_string),
        ebs: bdm.ebs().map(|ebs| EbsDevice {
            delete_on_termination: ebs.delete_on_termination(),
            encrypted: ebs.encrypted(),
            iops: ebs.iops(),
            snapshot_id: ebs.snapshot_id().map(str::to_string),
            volume_size: ebs.volume_size(),
            volume_type: ebs.volume_type().map(|v| v.as_str().to_string()),
        }),
    }
}

/// Parse an SDK instance into our record; `None` when identity fields are
/// absent (terminated instances lose their placement).
fn from_sdk_instance(instance: &ec2::Instance, region: &str) -> Option<InstanceRecord> {
    let instance_id = instance.instance_id()?.to_string();
    let state = instance
        .state()
        .and_then(|s| s.name())
        .and_then(|n| InstanceState::parse(n.as_str()))?;
    let availability_zone = instance
        .placement()
        .and_then(|p| p.availability_zone())
        .unwrap_or_default()
        .to_string();

    let launch_time = instance
        .launch_time()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0))
        .unwrap_or_else(Utc::now);

    let lifecycle = if instance.instance_lifecycle() == Some(&ec2::InstanceLifecycleType::Spot) {
        Lifecycle::Spot
    } else {
        Lifecycle::OnDemand
    };

    let virtualization_type =
        if instance.virtualization_type() == Some(&ec2::VirtualizationType::Paravirtual) {
            VirtualizationType::Paravirtual
        } else {
            VirtualizationType::Hvm
        };

    Some(InstanceRecord {
        instance_id,
        region: region.to_string(),
        subnet_id: instance.subnet_id().map(str::to_string),
        state,
        launch_time,
        lifecycle,
        placement: Placement {
            availability_zone,
            group_name: instance
                .placement()
                .and_then(|p| p.group_name())
                .filter(|g| !g.is_empty())
                .map(str::to_string),
            tenancy: instance
                .placement()
                .and_then(|p| p.tenancy())
                .map(|t| t.as_str().to_string()),
        },
        security_group_ids: instance
            .security_groups()
            .iter()
            .filter_map(|sg| sg.group_id())
            .map(str::to_string)
            .collect(),
        ebs_optimized: instance.ebs_optimized().unwrap_or(false),
        virtualization_type,
        image_id: instance.image_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        tags: instance
            .tags()
            .iter()
            .filter_map(|t| {
                Some(Tag::new(t.key()?.to_string(), t.value().unwrap_or_default()))
            })
            .collect(),
        price: 0.0,
    })
}
