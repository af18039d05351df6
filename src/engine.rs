//! Replacement engine
//!
//! Single entry point of the control loop: given a registered instance,
//! decide whether and how to act. On-demand members of opted-in groups get a
//! spot replacement launched; unattached replacements we launched earlier
//! get swapped in once they are past the group's grace period.

use crate::catalog::TypeCatalog;
use crate::cloud::{CloudCapability, InstanceAttribute};
use crate::compat;
use crate::error::{Result, SpotctlError};
use crate::group::{GroupHandle, GroupTable};
use crate::instance::InstanceRecord;
use crate::launch::{self, UserdataPatcher};
use crate::pricing;
use crate::registry::InstanceRegistry;
use crate::swap::{ReplacementPolicy, SwapOrchestrator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Expected, non-error reasons for leaving an instance alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRunning,
    AlreadyAttached,
    NotReplaceable,
    ProtectedFromScaleIn,
    ProtectedFromTermination,
}

/// Result of processing one observed instance.
#[derive(Debug)]
pub enum Outcome {
    Skipped(SkipReason),
    /// Spot replacement exists but is still inside the grace period; try
    /// again on the next run.
    Waiting { instance_id: String },
    LaunchedReplacement {
        spot_instance_id: String,
        instance_type: String,
        bid_price: f64,
    },
    Swapped {
        spot_instance_id: String,
        replaced_instance_id: String,
    },
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Skipped(reason) => write!(f, "skipped ({:?})", reason),
            Outcome::Waiting { instance_id } => {
                write!(f, "waiting for {} to leave the grace period", instance_id)
            }
            Outcome::LaunchedReplacement {
                spot_instance_id,
                instance_type,
                bid_price,
            } => write!(
                f,
                "launched spot replacement {} ({} at {})",
                spot_instance_id, instance_type, bid_price
            ),
            Outcome::Swapped {
                spot_instance_id,
                replaced_instance_id,
            } => write!(
                f,
                "swapped {} in for {}",
                spot_instance_id, replaced_instance_id
            ),
        }
    }
}

/// Per-region replacement engine.
pub struct Engine {
    region: String,
    catalog: Arc<TypeCatalog>,
    registry: InstanceRegistry,
    groups: GroupTable,
    cloud: Arc<dyn CloudCapability>,
    swapper: SwapOrchestrator,
    patcher: Arc<dyn UserdataPatcher>,
    recap: Mutex<Vec<String>>,
}

impl Engine {
    pub fn new(
        region: String,
        catalog: Arc<TypeCatalog>,
        groups: GroupTable,
        cloud: Arc<dyn CloudCapability>,
        patcher: Arc<dyn UserdataPatcher>,
    ) -> Self {
        Self {
            region,
            catalog,
            registry: InstanceRegistry::new(),
            groups,
            cloud: Arc::clone(&cloud),
            swapper: SwapOrchestrator::new(cloud),
            patcher,
            recap: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Recap lines accumulated during this run (launches and swaps).
    pub fn recap(&self) -> Vec<String> {
        self.recap.lock().expect("recap poisoned").clone()
    }

    fn push_recap(&self, line: String) {
        self.recap.lock().expect("recap poisoned").push(line);
    }

    /// Process one registered instance end to end.
    pub async fn process_instance(&self, instance_id: &str) -> Result<Outcome> {
        let mut instance = self
            .registry
            .get(instance_id)
            .await
            .ok_or_else(|| SpotctlError::InstanceNotFound(instance_id.to_string()))?;

        info!(
            "{} Found instance {} in state {:?}",
            self.region, instance.instance_id, instance.state
        );
        if !instance.is_running() {
            info!(
                "{} Instance {} is not in the running state",
                self.region, instance.instance_id
            );
            return Ok(Outcome::Skipped(SkipReason::NotRunning));
        }

        if instance.launched_by_us() {
            return self.handle_own_replacement(&instance).await;
        }

        let group = match self.qualify_for_replacement(&mut instance).await {
            Ok(group) => group,
            Err(reason) => return Ok(Outcome::Skipped(reason)),
        };
        self.launch_spot_replacement(&instance, group).await
    }

    /// A spot instance carrying our marker tag: attach it if it's an
    /// unattached replacement for an enabled group and past the grace
    /// period.
    async fn handle_own_replacement(&self, instance: &InstanceRecord) -> Result<Outcome> {
        let Some(group) = self.unattached_replacement_group(instance) else {
            info!(
                "{} Instance {} is already attached to a group, skipping it",
                self.region, instance.instance_id
            );
            return Ok(Outcome::Skipped(SkipReason::AlreadyAttached));
        };

        if !ready_to_attach(instance, group, Utc::now()) {
            return Ok(Outcome::Waiting {
                instance_id: instance.instance_id.clone(),
            });
        }

        let replaced = self
            .swapper
            .swap(instance, group, &self.registry, self)
            .await?;
        self.push_recap(format!(
            "{} Swapped spot instance {} in for {}",
            group.name, instance.instance_id, replaced.instance_id
        ));
        Ok(Outcome::Swapped {
            spot_instance_id: instance.instance_id.clone(),
            replaced_instance_id: replaced.instance_id,
        })
    }

    /// Group this unattached spot replacement was launched for, if it is
    /// still enabled and the instance isn't a member yet.
    fn unattached_replacement_group(&self, instance: &InstanceRecord) -> Option<&GroupHandle> {
        let Some(group_name) = instance.replacement_target_group() else {
            info!(
                "{} is missing the tag value for its target group",
                instance.instance_id
            );
            return None;
        };
        let group = self.groups.get(group_name)?;
        if !group.has_member(&instance.instance_id) && instance.is_spot() {
            info!("Found unattached spot instance {}", instance.instance_id);
            Some(group)
        } else {
            None
        }
    }

    /// Check every replaceability condition in order, enriching the record
    /// (effective price) along the way. Returns the group on success, the
    /// first failing condition otherwise.
    async fn qualify_for_replacement(
        &self,
        instance: &mut InstanceRecord,
    ) -> std::result::Result<&GroupHandle, SkipReason> {
        let Some(group) = self.resolve_enabled_group(instance) else {
            debug!(
                "{} instance {} doesn't belong to any enabled group",
                self.region, instance.instance_id
            );
            return Err(SkipReason::NotReplaceable);
        };
        if !group.needs_replacement {
            debug!("Group {} needs no further replacements", group.name);
            return Err(SkipReason::NotReplaceable);
        }
        if instance.is_spot() {
            return Err(SkipReason::NotReplaceable);
        }
        if group.is_protected_from_scale_in(&instance.instance_id) {
            info!(
                "{} Instance {} is protected from scale-in",
                instance.availability_zone(),
                instance.instance_id
            );
            return Err(SkipReason::ProtectedFromScaleIn);
        }
        if self.is_protected_from_termination(&instance.instance_id).await {
            return Err(SkipReason::ProtectedFromTermination);
        }
        Ok(group)
    }

    /// Resolve the group handle through the membership tag and derive the
    /// effective on-demand price from the group's multiplier.
    fn resolve_enabled_group(&self, instance: &mut InstanceRecord) -> Option<&GroupHandle> {
        let group_name = instance.member_of_group()?.to_string();
        let group = self.groups.get(&group_name)?;
        if let Some(type_info) = self.catalog.get(&instance.instance_type) {
            instance.price =
                type_info.pricing.on_demand * group.config.on_demand_price_multiplier;
        }
        info!(
            "{} instance {} belongs to enabled group {}",
            self.region, instance.instance_id, group.name
        );
        Some(group)
    }

    /// Termination protection per the instance attribute; a failed describe
    /// assumes protected and surfaces the error to telemetry.
    async fn is_protected_from_termination(&self, instance_id: &str) -> bool {
        match self
            .cloud
            .describe_instance_attribute(instance_id, InstanceAttribute::DisableApiTermination)
            .await
        {
            Ok(protected) => {
                if protected {
                    info!("Instance {} is protected from termination", instance_id);
                }
                protected
            }
            Err(e) => {
                warn!(
                    "Couldn't describe instance attributes, assuming instance {} is protected: {}",
                    instance_id, e
                );
                true
            }
        }
    }

    /// Walk the ranked candidate list and launch the first type that takes.
    async fn launch_spot_replacement(
        &self,
        instance: &InstanceRecord,
        group: &GroupHandle,
    ) -> Result<Outcome> {
        let source_type = self
            .catalog
            .get(&instance.instance_type)
            .ok_or_else(|| SpotctlError::UnknownInstanceType(instance.instance_type.clone()))?;

        let attached_volumes = group
            .configured_ephemeral_volumes()
            .min(source_type.instance_store.device_count);

        let candidates = compat::compatible_types_by_price(
            instance,
            source_type,
            attached_volumes,
            &group.config.allowed_instance_types,
            &group.config.disallowed_instance_types,
            &self.catalog,
        );
        if candidates.is_empty() {
            info!(
                "No cheaper compatible spot instance types found for {}",
                instance.instance_id
            );
            return Err(SpotctlError::NoCompatibleType {
                instance_id: instance.instance_id.clone(),
            });
        }

        let availability_zone = instance.availability_zone().to_string();
        info!(
            "Estimated savings for {}: {:.4}/h (on-demand {} vs spot {})",
            instance.instance_id,
            source_type.pricing.on_demand - source_type.pricing.spot_price(&availability_zone),
            source_type.pricing.on_demand,
            source_type.pricing.spot_price(&availability_zone)
        );

        let mut last_error: Option<SpotctlError> = None;
        for candidate in &candidates {
            let candidate_type = candidate.type_info.instance_type.as_str();
            let bid_price = pricing::price_to_bid(
                instance.price,
                candidate.type_info.pricing.spot_price(&availability_zone),
                candidate.type_info.pricing.premium,
                group.config.bidding_policy,
                group.config.spot_price_buffer_percentage,
            );

            let spec = match launch::build_launch_spec(
                self.cloud.as_ref(),
                instance,
                group,
                candidate_type,
                bid_price,
                self.patcher.as_ref(),
            )
            .await
            {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(
                        "{} {}: Failed to generate launch request, {}, skipping instance type {}",
                        availability_zone, group.name, e, candidate_type
                    );
                    continue;
                }
            };

            info!(
                "{} {}: Launching spot instance of type {} with bid price {}",
                availability_zone, group.name, candidate_type, bid_price
            );
            match self.cloud.run_instances(&spec).await {
                Ok(started) => {
                    let Some(spot) = started.into_iter().next() else {
                        warn!(
                            "Launch of {} returned no instances, trying next type",
                            candidate_type
                        );
                        continue;
                    };
                    info!(
                        "{}: Successfully launched spot instance {} of type {} with bid price {}",
                        group.name, spot.instance_id, candidate_type, bid_price
                    );
                    self.push_recap(format!(
                        "{} Launched spot instance {}",
                        group.name, spot.instance_id
                    ));
                    return Ok(Outcome::LaunchedReplacement {
                        spot_instance_id: spot.instance_id,
                        instance_type: candidate_type.to_string(),
                        bid_price,
                    });
                }
                Err(e @ SpotctlError::InsufficientCapacity { .. }) => {
                    warn!(
                        "Couldn't launch spot instance due to lack of capacity, trying next instance type: {}",
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("Couldn't launch spot instance: {}, trying next instance type", e);
                    last_error = Some(SpotctlError::LaunchFailed {
                        instance_id: instance.instance_id.clone(),
                        instance_type: candidate_type.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "{} Exhausted all compatible instance types without launch success",
            group.name
        );
        Err(last_error.unwrap_or_else(|| SpotctlError::LaunchFailed {
            instance_id: instance.instance_id.clone(),
            instance_type: String::new(),
            message: "couldn't generate any launch request".to_string(),
        }))
    }
}

#[async_trait]
impl ReplacementPolicy for Engine {
    async fn should_be_replaced_with_spot(
        &self,
        instance: &InstanceRecord,
        _group: &GroupHandle,
    ) -> bool {
        let mut instance = instance.clone();
        self.qualify_for_replacement(&mut instance).await.is_ok()
    }
}

/// A spot replacement may attach once it is running and its uptime exceeds
/// the group's health-check grace period.
pub(crate) fn ready_to_attach(
    instance: &InstanceRecord,
    group: &GroupHandle,
    now: DateTime<Utc>,
) -> bool {
    let uptime = instance.uptime_secs(now);
    debug!("Instance {} uptime: {}s", instance.instance_id, uptime);

    if instance.is_running() && uptime > group.health_check_grace_period {
        info!(
            "The spot instance {} has passed the grace period and is ready to attach",
            instance.instance_id
        );
        true
    } else {
        info!(
            "The spot instance {} is not ready to attach yet, waiting",
            instance.instance_id
        );
        false
    }
}
