//! Launch request synthesis
//!
//! Builds the spot launch request for a replacement by layering the source
//! image's block devices, the group's launch configuration, and the group's
//! launch template over fields copied from the running instance. Volume
//! types are rewritten (IO1→IO2, GP2→GP3) subject to regional and threshold
//! rules.

use crate::cloud::CloudCapability;
use crate::error::Result;
use crate::group::GroupHandle;
use crate::instance::{
    InstanceRecord, Placement, Tag, TAG_LAUNCHED_BY, TAG_LAUNCHED_FOR_GROUP,
    TAG_REPLACEMENT_TARGET,
};
use crate::pricing::format_max_price;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Regions where IO2 volumes are not offered; IO1 volumes stay IO1 there.
const IO2_UNSUPPORTED_REGIONS: [&str; 9] = [
    "us-gov-west-1",
    "us-gov-east-1",
    "sa-east-1",
    "cn-north-1",
    "cn-northwest-1",
    "eu-south-1",
    "af-south-1",
    "eu-west-3",
    "ap-northeast-3",
];

pub fn io2_supported(region: &str) -> bool {
    !IO2_UNSUPPORTED_REGIONS.contains(&region)
}

/// EBS settings shared by all block-device sources and the launch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EbsDevice {
    #[serde(default)]
    pub delete_on_termination: Option<bool>,
    #[serde(default)]
    pub encrypted: Option<bool>,
    #[serde(default)]
    pub iops: Option<i32>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub volume_size: Option<i32>,
    #[serde(default)]
    pub volume_type: Option<String>,
}

/// Block device entry of a launch configuration; `no_device` is a boolean
/// in this schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfigBlockDevice {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub virtual_name: Option<String>,
    #[serde(default)]
    pub no_device: Option<bool>,
    #[serde(default)]
    pub ebs: Option<EbsDevice>,
}

/// Block device entry of a launch template or image; `no_device` is the
/// literal string "true" in these schemas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateBlockDevice {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub virtual_name: Option<String>,
    #[serde(default)]
    pub no_device: Option<String>,
    #[serde(default)]
    pub ebs: Option<EbsDevice>,
}

/// Launch configuration blob attached to a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub name: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub block_device_mappings: Vec<LaunchConfigBlockDevice>,
    #[serde(default)]
    pub instance_monitoring: Option<bool>,
    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,
}

impl LaunchConfiguration {
    pub fn ephemeral_volume_count(&self) -> u32 {
        count_ephemeral(self.block_device_mappings.iter().map(|b| &b.virtual_name))
    }
}

/// Network interface declared by a launch template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateNetworkInterface {
    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,
    #[serde(default)]
    pub device_index: Option<i32>,
}

/// Resolved data of one launch template version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchTemplateData {
    #[serde(default)]
    pub block_device_mappings: Vec<TemplateBlockDevice>,
    #[serde(default)]
    pub network_interfaces: Vec<TemplateNetworkInterface>,
}

impl LaunchTemplateData {
    pub fn ephemeral_volume_count(&self) -> u32 {
        count_ephemeral(self.block_device_mappings.iter().map(|b| &b.virtual_name))
    }
}

fn count_ephemeral<'a, I>(virtual_names: I) -> u32
where
    I: Iterator<Item = &'a Option<String>>,
{
    virtual_names
        .filter(|v| {
            v.as_deref()
                .map(|name| name.starts_with("ephemeral"))
                .unwrap_or(false)
        })
        .count() as u32
}

/// Reference to a launch template version, optionally with the resolved
/// data handed over by discovery (fetched on demand otherwise).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTemplateRef {
    pub launch_template_id: String,
    pub version: String,
    #[serde(default)]
    pub cached_data: Option<LaunchTemplateData>,
}

/// Image description slice needed for launch synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDescription {
    pub image_id: String,
    #[serde(default)]
    pub block_device_mappings: Vec<TemplateBlockDevice>,
}

/// Block device entry of the synthesized launch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: Option<String>,
    pub virtual_name: Option<String>,
    pub ebs: Option<EbsDevice>,
}

/// Network interface of the synthesized launch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub associate_public_ip_address: Option<bool>,
    pub device_index: i32,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
}

/// IAM instance profile reference, by ARN or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IamProfileSpec {
    Arn(String),
    Name(String),
}

impl IamProfileSpec {
    /// Launch configurations store a single string; the ARN prefix decides
    /// which field it belongs in.
    pub fn from_launch_configuration(value: &str) -> Self {
        if value.starts_with("arn:aws:iam:") {
            IamProfileSpec::Arn(value.to_string())
        } else {
            IamProfileSpec::Name(value.to_string())
        }
    }
}

/// Concrete launch request for one spot replacement. Always a one-shot spot
/// request (min = max = 1, spot market, `max_price` as bid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub instance_type: String,
    pub max_price: String,
    pub min_count: i32,
    pub max_count: i32,
    pub ebs_optimized: bool,
    pub placement: Placement,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<IamProfileSpec>,
    pub user_data: Option<String>,
    pub monitoring: Option<bool>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub launch_template: Option<LaunchTemplateRef>,
    pub tags: Vec<Tag>,
}

/// External collaborator patching Elastic Beanstalk user data before launch.
pub trait UserdataPatcher: Send + Sync {
    fn patch(&self, user_data: &str) -> String;
}

/// Passthrough patcher for deployments without Beanstalk groups.
pub struct IdentityPatcher;

impl UserdataPatcher for IdentityPatcher {
    fn patch(&self, user_data: &str) -> String {
        user_data.to_string()
    }
}

/// Rewrite a source volume type for the new launch request.
///
/// IO1 becomes IO2 where the region offers it; GP2 becomes GP3 at or below
/// the configured size threshold. Anything else (including IO2/GP3 output of
/// a previous pass) is left unchanged, so the rewrite is idempotent.
pub fn rewrite_volume_type(
    volume_type: Option<&str>,
    volume_size: Option<i32>,
    region: &str,
    gp2_conversion_threshold: i32,
    group_name: &str,
) -> Option<String> {
    let Some(volume_type) = volume_type else {
        info!(
            "{}: Empty EBS volume type while converting volume for group {}",
            region, group_name
        );
        return None;
    };

    if volume_type == "io1" && io2_supported(region) {
        info!(
            "{}: Converting IO1 volume to IO2 for new instance launched for {}",
            region, group_name
        );
        return Some("io2".to_string());
    }

    if volume_type == "gp2" && volume_size.unwrap_or(0) <= gp2_conversion_threshold {
        info!(
            "{}: Converting GP2 volume to GP3 for new instance launched for {}",
            region, group_name
        );
        return Some("gp3".to_string());
    }

    Some(volume_type.to_string())
}

fn convert_ebs(
    ebs: &EbsDevice,
    region: &str,
    gp2_conversion_threshold: i32,
    group_name: &str,
) -> EbsDevice {
    EbsDevice {
        delete_on_termination: ebs.delete_on_termination,
        encrypted: ebs.encrypted,
        iops: ebs.iops,
        snapshot_id: ebs.snapshot_id.clone(),
        volume_size: ebs.volume_size,
        volume_type: rewrite_volume_type(
            ebs.volume_type.as_deref(),
            ebs.volume_size,
            region,
            gp2_conversion_threshold,
            group_name,
        ),
    }
}

/// Convert launch-configuration block devices, skipping `no_device: true`
/// entries.
pub fn convert_launch_config_block_devices(
    mappings: &[LaunchConfigBlockDevice],
    region: &str,
    gp2_conversion_threshold: i32,
    group_name: &str,
) -> Vec<BlockDeviceMapping> {
    if mappings.is_empty() {
        debug!("Missing launch configuration block device mappings");
    }
    mappings
        .iter()
        .filter(|bdm| !bdm.no_device.unwrap_or(false))
        .map(|bdm| BlockDeviceMapping {
            device_name: bdm.device_name.clone(),
            virtual_name: bdm.virtual_name.clone(),
            ebs: bdm
                .ebs
                .as_ref()
                .map(|ebs| convert_ebs(ebs, region, gp2_conversion_threshold, group_name)),
        })
        .collect()
}

/// Convert launch-template or image block devices, skipping entries whose
/// `no_device` is the literal string "true".
pub fn convert_template_block_devices(
    mappings: &[TemplateBlockDevice],
    region: &str,
    gp2_conversion_threshold: i32,
    group_name: &str,
) -> Vec<BlockDeviceMapping> {
    if mappings.is_empty() {
        debug!("Missing template/image block device mappings");
    }
    mappings
        .iter()
        .filter(|bdm| bdm.no_device.as_deref() != Some("true"))
        .map(|bdm| BlockDeviceMapping {
            device_name: bdm.device_name.clone(),
            virtual_name: bdm.virtual_name.clone(),
            ebs: bdm
                .ebs
                .as_ref()
                .map(|ebs| convert_ebs(ebs, region, gp2_conversion_threshold, group_name)),
        })
        .collect()
}

/// Reserved tag keys never copied back from the source instance. Both
/// spellings of the launch-configuration key are excluded; the misspelled
/// one has shipped on instances launched by older builds.
const RESERVED_TAG_KEYS: [&str; 7] = [
    TAG_LAUNCHED_BY,
    TAG_LAUNCHED_FOR_GROUP,
    TAG_REPLACEMENT_TARGET,
    "LaunchTemplateID",
    "LaunchTemplateVersion",
    "LaunchConfigurationName",
    "LaunchConfiguationName",
];

/// Tags written onto the spot replacement: the reserved marker set, the
/// launch source reference, and every copyable source tag.
pub fn generate_tags(source: &InstanceRecord, group: &GroupHandle) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(TAG_LAUNCHED_BY, "true"),
        Tag::new(TAG_LAUNCHED_FOR_GROUP, group.name.clone()),
        Tag::new(TAG_REPLACEMENT_TARGET, source.instance_id.clone()),
    ];

    if let Some(lt) = &group.launch_template {
        tags.push(Tag::new("LaunchTemplateID", lt.launch_template_id.clone()));
        tags.push(Tag::new("LaunchTemplateVersion", lt.version.clone()));
    } else if let Some(lc) = &group.launch_configuration {
        tags.push(Tag::new("LaunchConfigurationName", lc.name.clone()));
    }

    for tag in &source.tags {
        if !tag.key.starts_with("aws:") && !RESERVED_TAG_KEYS.contains(&tag.key.as_str()) {
            tags.push(tag.clone());
        }
    }
    tags
}

/// Assemble the launch request from already-fetched sources. Pure; the
/// async [`build_launch_spec`] fetches image and template data first.
pub(crate) fn assemble_launch_spec(
    source: &InstanceRecord,
    group: &GroupHandle,
    image: Option<&ImageDescription>,
    template_data: Option<&LaunchTemplateData>,
    instance_type: &str,
    bid_price: f64,
    patcher: &dyn UserdataPatcher,
) -> LaunchSpec {
    let region = source.region.as_str();
    let threshold = group.config.gp2_conversion_threshold;

    let mut spec = LaunchSpec {
        instance_type: instance_type.to_string(),
        max_price: format_max_price(bid_price),
        min_count: 1,
        max_count: 1,
        ebs_optimized: source.ebs_optimized,
        placement: source.placement.clone(),
        subnet_id: source.subnet_id.clone(),
        security_group_ids: source.security_group_ids.clone(),
        image_id: None,
        key_name: None,
        iam_instance_profile: None,
        user_data: None,
        monitoring: None,
        block_device_mappings: Vec::new(),
        network_interfaces: Vec::new(),
        launch_template: None,
        tags: generate_tags(source, group),
    };

    // Layer 1: image defaults contribute block devices only.
    if let Some(image) = image {
        spec.block_device_mappings = convert_template_block_devices(
            &image.block_device_mappings,
            region,
            threshold,
            &group.name,
        );
    }

    // Layer 2: launch configuration.
    if let Some(lc) = &group.launch_configuration {
        if let Some(key) = &lc.key_name {
            if !key.is_empty() {
                spec.key_name = Some(key.clone());
            }
        }
        if let Some(profile) = &lc.iam_instance_profile {
            spec.iam_instance_profile = Some(IamProfileSpec::from_launch_configuration(profile));
        }
        spec.image_id = lc.image_id.clone();

        if group.config.patch_beanstalk_userdata_enabled() {
            spec.user_data = lc.user_data.as_deref().map(|ud| patcher.patch(ud));
        } else {
            spec.user_data = lc.user_data.clone();
        }

        let mappings = convert_launch_config_block_devices(
            &lc.block_device_mappings,
            region,
            threshold,
            &group.name,
        );
        if !mappings.is_empty() {
            spec.block_device_mappings = mappings;
        }

        spec.monitoring = lc.instance_monitoring;

        if lc.associate_public_ip_address.is_some() || source.subnet_id.is_some() {
            // Instances are running in a VPC; a single primary interface
            // replaces the top-level subnet and security group fields.
            spec.network_interfaces = vec![NetworkInterfaceSpec {
                associate_public_ip_address: lc.associate_public_ip_address,
                device_index: 0,
                subnet_id: source.subnet_id.clone(),
                security_group_ids: source.security_group_ids.clone(),
            }];
            spec.subnet_id = None;
            spec.security_group_ids = Vec::new();
        }
    }

    // Layer 3: launch template.
    if let Some(lt) = &group.launch_template {
        spec.launch_template = Some(LaunchTemplateRef {
            launch_template_id: lt.launch_template_id.clone(),
            version: lt.version.clone(),
            cached_data: None,
        });

        if let Some(data) = template_data {
            spec.block_device_mappings = convert_template_block_devices(
                &data.block_device_mappings,
                region,
                threshold,
                &group.name,
            );

            if !data.network_interfaces.is_empty() {
                spec.network_interfaces = data
                    .network_interfaces
                    .iter()
                    .map(|ni| NetworkInterfaceSpec {
                        associate_public_ip_address: ni.associate_public_ip_address,
                        device_index: ni.device_index.unwrap_or(0),
                        subnet_id: source.subnet_id.clone(),
                        security_group_ids: source.security_group_ids.clone(),
                    })
                    .collect();
                spec.subnet_id = None;
                spec.security_group_ids = Vec::new();
            }
        }
    }

    spec
}

/// Build the launch request for replacing `source` with `instance_type`,
/// fetching the image and launch-template data through the capability
/// handle.
pub async fn build_launch_spec(
    cloud: &dyn CloudCapability,
    source: &InstanceRecord,
    group: &GroupHandle,
    instance_type: &str,
    bid_price: f64,
    patcher: &dyn UserdataPatcher,
) -> Result<LaunchSpec> {
    let image = match cloud.describe_images(&[source.image_id.clone()]).await {
        Ok(mut images) if !images.is_empty() => Some(images.remove(0)),
        Ok(_) => {
            warn!("Missing image data for {}", source.image_id);
            None
        }
        Err(e) => {
            warn!("Couldn't describe image {}: {}", source.image_id, e);
            None
        }
    };

    let template_data = match &group.launch_template {
        Some(lt) => match &lt.cached_data {
            Some(data) => Some(data.clone()),
            None => Some(
                cloud
                    .describe_launch_template_versions(&lt.launch_template_id, &lt.version)
                    .await?,
            ),
        },
        None => None,
    };

    Ok(assemble_launch_spec(
        source,
        group,
        image.as_ref(),
        template_data.as_ref(),
        instance_type,
        bid_price,
        patcher,
    ))
}
