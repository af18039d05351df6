//! Compatibility filtering and ranking
//!
//! Decides which catalog types may replace a running on-demand instance and
//! ranks the survivors by effective price. Each predicate is independent so
//! a rejection is attributable to one dimension.

use crate::catalog::{InstanceTypeInfo, TypeCatalog};
use crate::instance::{InstanceRecord, VirtualizationType};
use glob::Pattern;
use tracing::{debug, warn};

/// A candidate that survived filtering, with its effective price.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub type_info: InstanceTypeInfo,
    pub price: f64,
}

/// Spot price of `candidate` in the source's availability zone, plus the EBS
/// surcharge when the source is EBS-optimized. Zero means unavailable.
pub fn effective_spot_price(source: &InstanceRecord, candidate: &InstanceTypeInfo) -> f64 {
    let mut price = candidate.pricing.spot_price(source.availability_zone());
    if source.ebs_optimized {
        price += candidate.pricing.ebs_surcharge;
    }
    price
}

/// Allow/deny list check with shell-style glob patterns.
///
/// A non-empty allow list must match; otherwise a non-empty deny list must
/// not match. Invalid patterns never match.
pub fn is_allowed(instance_type: &str, allowed: &[String], disallowed: &[String]) -> bool {
    let matches = |pattern: &String| {
        Pattern::new(pattern)
            .map(|p| p.matches(instance_type))
            .unwrap_or(false)
    };

    if !allowed.is_empty() {
        if allowed.iter().any(matches) {
            return true;
        }
        debug!("{} is not in the allowed instance type list", instance_type);
        return false;
    }
    if disallowed.iter().any(matches) {
        debug!("{} is in the disallowed instance type list", instance_type);
        return false;
    }
    true
}

/// Effective price must be non-zero (available in the AZ) and no higher than
/// the source's effective on-demand price.
pub fn is_price_compatible(source: &InstanceRecord, candidate_price: f64) -> bool {
    if candidate_price == 0.0 {
        debug!(
            "Candidate unavailable in {}",
            source.availability_zone()
        );
        return false;
    }
    if candidate_price <= source.price {
        return true;
    }
    debug!(
        "Candidate price {} above instance price {}",
        candidate_price, source.price
    );
    false
}

pub fn is_ebs_compatible(source_type: &InstanceTypeInfo, candidate: &InstanceTypeInfo) -> bool {
    if candidate.ebs_throughput < source_type.ebs_throughput {
        debug!(
            "EBS throughput insufficient: {} < {}",
            candidate.ebs_throughput, source_type.ebs_throughput
        );
        return false;
    }
    true
}

/// Same CPU family and at least the source's vCPU, memory, and GPU counts.
pub fn is_class_compatible(source_type: &InstanceTypeInfo, candidate: &InstanceTypeInfo) -> bool {
    if !is_same_arch(&source_type.physical_processor, &candidate.physical_processor) {
        debug!(
            "CPU architecture mismatch: {} vs {}",
            source_type.physical_processor, candidate.physical_processor
        );
        return false;
    }
    if candidate.vcpu >= source_type.vcpu
        && candidate.memory_gib >= source_type.memory_gib
        && candidate.gpu >= source_type.gpu
    {
        return true;
    }
    debug!(
        "Not class compatible: candidate {}/{}/{} vs instance {}/{}/{}",
        candidate.vcpu,
        candidate.memory_gib,
        candidate.gpu,
        source_type.vcpu,
        source_type.memory_gib,
        source_type.gpu
    );
    false
}

fn is_same_arch(source_cpu: &str, candidate_cpu: &str) -> bool {
    (is_intel_compatible(source_cpu) && is_intel_compatible(candidate_cpu))
        || (is_arm(source_cpu) && is_arm(candidate_cpu))
}

fn is_intel_compatible(cpu_name: &str) -> bool {
    // t1.micro is the only type describing its processor as "Variable".
    cpu_name.contains("Intel") || cpu_name.contains("Variable") || cpu_name.contains("AMD")
}

fn is_arm(cpu_name: &str) -> bool {
    // Graviton processors are all described as "AWS ...".
    cpu_name.contains("AWS")
}

/// Storage check against the configured ephemeral volume count.
///
/// `attached_volumes` is the group's configured ephemeral mapping count
/// capped by what the source type physically has. Never downgrade SSD to
/// spinning disk.
pub fn is_storage_compatible(
    source_type: &InstanceTypeInfo,
    candidate: &InstanceTypeInfo,
    attached_volumes: u32,
) -> bool {
    let existing = &source_type.instance_store;
    let offered = &candidate.instance_store;
    if attached_volumes == 0
        || (offered.device_count >= attached_volumes
            && offered.device_size_gb >= existing.device_size_gb
            && (offered.is_ssd || offered.is_ssd == existing.is_ssd))
    {
        return true;
    }
    debug!(
        "Not storage compatible: candidate {}x{}GB ssd={} vs required {}x{}GB ssd={}",
        offered.device_count,
        offered.device_size_gb,
        offered.is_ssd,
        attached_volumes,
        existing.device_size_gb,
        existing.is_ssd
    );
    false
}

/// Candidate virtualization types (HVM-only when unspecified) must cover the
/// source's virtualization.
pub fn is_virtualization_compatible(
    source_virtualization: VirtualizationType,
    candidate_types: &[String],
) -> bool {
    let default = ["HVM".to_string()];
    let effective: &[String] = if candidate_types.is_empty() {
        &default
    } else {
        candidate_types
    };

    for virt in effective {
        match (virt.as_str(), source_virtualization) {
            ("HVM", VirtualizationType::Hvm) | ("PV", VirtualizationType::Paravirtual) => {
                return true
            }
            _ => {}
        }
    }
    debug!(
        "Not virtualization compatible with {:?}",
        source_virtualization
    );
    false
}

/// Filter the catalog against the source instance and rank the survivors by
/// effective price ascending.
///
/// Types are enumerated in name order and the sort is stable, so equal
/// prices tie-break lexicographically.
pub fn compatible_types_by_price(
    source: &InstanceRecord,
    source_type: &InstanceTypeInfo,
    attached_volumes: u32,
    allowed: &[String],
    disallowed: &[String],
    catalog: &TypeCatalog,
) -> Vec<RankedCandidate> {
    if catalog.is_empty() {
        warn!("Missing instance type information for {}", source.region);
    }

    let mut accepted: Vec<RankedCandidate> = Vec::new();
    for candidate in catalog.iter_sorted() {
        let price = effective_spot_price(source, candidate);
        debug!(
            "Comparing {} (price {}) with candidate {} (price {})",
            source_type.instance_type, source.price, candidate.instance_type, price
        );

        if is_allowed(&candidate.instance_type, allowed, disallowed)
            && is_price_compatible(source, price)
            && is_ebs_compatible(source_type, candidate)
            && is_class_compatible(source_type, candidate)
            && is_storage_compatible(source_type, candidate, attached_volumes)
            && is_virtualization_compatible(
                source.virtualization_type,
                &candidate.virtualization_types,
            )
        {
            debug!(
                "Match found: {} at {} for {}",
                candidate.instance_type, price, source.instance_id
            );
            accepted.push(RankedCandidate {
                type_info: candidate.clone(),
                price,
            });
        }
    }

    accepted.sort_by(|a, b| a.price.total_cmp(&b.price));
    accepted
}
