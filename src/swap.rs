//! Swap protocol
//!
//! Attaches a ready spot replacement to its group and terminates the
//! on-demand member it replaces, while the group's lifecycle processes are
//! suspended and its max size is relaxed if capacity is already at the
//! ceiling. Suspension and max-size changes are released on every exit path;
//! a failed terminate after a successful attach is NOT rolled back.

use crate::cloud::CloudCapability;
use crate::error::{Result, SpotctlError};
use crate::group::GroupHandle;
use crate::instance::InstanceRecord;
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Re-check that a target still qualifies for replacement. Implemented by
/// the replacement engine; injected so the swap stays testable in isolation.
#[async_trait]
pub trait ReplacementPolicy: Send + Sync {
    async fn should_be_replaced_with_spot(
        &self,
        instance: &InstanceRecord,
        group: &GroupHandle,
    ) -> bool;
}

/// Keyed async mutexes serializing group mutations: two concurrent swaps on
/// one group would race on max size and process suspension.
#[derive(Default)]
pub struct GroupLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub fn for_group(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().expect("group lock table poisoned");
        locks.entry(group.to_string()).or_default().clone()
    }
}

/// Drives the attach + terminate protocol for one region.
pub struct SwapOrchestrator {
    cloud: Arc<dyn CloudCapability>,
    locks: GroupLocks,
}

impl SwapOrchestrator {
    pub fn new(cloud: Arc<dyn CloudCapability>) -> Self {
        Self {
            cloud,
            locks: GroupLocks::default(),
        }
    }

    /// Swap `spot` into `group`, replacing the on-demand instance named by
    /// its replacement tag. Returns the replaced on-demand record.
    pub async fn swap(
        &self,
        spot: &InstanceRecord,
        group: &GroupHandle,
        registry: &InstanceRegistry,
        policy: &dyn ReplacementPolicy,
    ) -> Result<InstanceRecord> {
        let target_id = spot
            .replacement_target_instance()
            .ok_or_else(|| SpotctlError::MissingReplacementTag {
                instance_id: spot.instance_id.clone(),
            })?
            .to_string();

        // The target must still be describable and registered; a vanished
        // target leaves the replacement orphaned, so it is terminated.
        match self.cloud.describe_instance(&target_id).await {
            Ok(Some(record)) => registry.add(record).await,
            Ok(None) => {
                warn!("Replacement target {} no longer exists", target_id);
                self.terminate_replacement(spot).await;
                return Err(SpotctlError::ReplacementTargetGone {
                    instance_id: spot.instance_id.clone(),
                    target_id,
                });
            }
            Err(e) => {
                warn!("Couldn't describe replacement target {}: {}", target_id, e);
                self.terminate_replacement(spot).await;
                return Err(SpotctlError::ReplacementTargetGone {
                    instance_id: spot.instance_id.clone(),
                    target_id,
                });
            }
        }
        let target = match registry.get(&target_id).await {
            Some(target) => target,
            None => {
                self.terminate_replacement(spot).await;
                return Err(SpotctlError::ReplacementTargetGone {
                    instance_id: spot.instance_id.clone(),
                    target_id,
                });
            }
        };

        if !policy.should_be_replaced_with_spot(&target, group).await {
            info!(
                "Target {} should no longer be replaced, terminating replacement {}",
                target_id, spot.instance_id
            );
            self.terminate_replacement(spot).await;
            return Err(SpotctlError::NotReplaceable {
                instance_id: target_id,
                reason: "target no longer qualifies for replacement".to_string(),
            });
        }

        let group_lock = self.locks.for_group(&group.name);
        let _guard = group_lock.lock().await;

        self.cloud.suspend_processes(&group.name).await?;

        let needs_bump = group.desired_capacity == group.max_size;
        let outcome = self
            .attach_and_terminate(spot, group, &target_id, needs_bump)
            .await;

        // Release in reverse order on every path, success or failure.
        if needs_bump {
            if let Err(e) = self
                .cloud
                .set_group_max_size(&group.name, group.max_size)
                .await
            {
                warn!("Couldn't restore max size of {}: {}", group.name, e);
            }
        }
        if let Err(e) = self.cloud.resume_processes(&group.name).await {
            warn!("Couldn't resume processes of {}: {}", group.name, e);
        }

        outcome.map(|()| target)
    }

    async fn attach_and_terminate(
        &self,
        spot: &InstanceRecord,
        group: &GroupHandle,
        target_id: &str,
        needs_bump: bool,
    ) -> Result<()> {
        if needs_bump {
            info!(
                "{}: Temporarily increasing max size to {}",
                group.name,
                group.max_size + 1
            );
            self.cloud
                .set_group_max_size(&group.name, group.max_size + 1)
                .await?;
        }

        info!(
            "Attaching spot instance {} to group {}",
            spot.instance_id, group.name
        );
        if let Err(e) = self
            .cloud
            .attach_instances(&group.name, &[spot.instance_id.clone()], false)
            .await
        {
            warn!(
                "Spot instance {} couldn't be attached to {}, terminating it",
                spot.instance_id, group.name
            );
            self.terminate_replacement(spot).await;
            return Err(SpotctlError::AttachFailed {
                instance_id: spot.instance_id.clone(),
                group: group.name.clone(),
                message: e.to_string(),
            });
        }

        info!(
            "Terminating on-demand instance {} through group {}",
            target_id, group.name
        );
        self.cloud
            .terminate_instance_in_group(target_id, true, true)
            .await
            .map_err(|e| SpotctlError::TerminateFailed {
                instance_id: target_id.to_string(),
                group: group.name.clone(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn terminate_replacement(&self, spot: &InstanceRecord) {
        if !spot.can_terminate() {
            warn!(
                "Can't terminate {}, current state: {:?}",
                spot.instance_id, spot.state
            );
            return;
        }
        if let Err(e) = self
            .cloud
            .terminate_instances(&[spot.instance_id.clone()])
            .await
        {
            warn!(
                "Couldn't terminate spot replacement {}: {}",
                spot.instance_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_locks_are_shared_per_group() {
        let locks = GroupLocks::default();
        let a1 = locks.for_group("a");
        let a2 = locks.for_group("a");
        let b = locks.for_group("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
