use std::fmt;

use crate::strategy::PlacementStrategy;

/// The kind of capacity a replica should land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityClass {
    OnDemand,
    Spot,
}

impl fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityClass::OnDemand => write!(f, "on-demand"),
            CapacityClass::Spot => write!(f, "spot"),
        }
    }
}

/// Decides the capacity class of a new replica from the number of siblings
/// already committed to on-demand capacity.
pub trait PlacementPolicy: Send + Sync {
    /// Whether the pipeline should run at all. When false no lock is taken.
    fn should_compensate(&self, strategy: &PlacementStrategy) -> bool;

    fn decide(&self, on_demand_count: usize, strategy: &PlacementStrategy) -> CapacityClass;
}

/// Keeps replicas on on-demand capacity until the low water level is
/// exceeded, then leans on spot.
///
/// The high water level only takes part in the gate. Nothing between the two
/// levels behaves differently yet.
#[derive(Debug, Default)]
pub struct WaterLevelPolicy;

impl PlacementPolicy for WaterLevelPolicy {
    fn should_compensate(&self, strategy: &PlacementStrategy) -> bool {
        strategy.compensation_enabled == Some(true)
            && strategy.low_water_level > 0
            && strategy.high_water_level > 0
    }

    fn decide(&self, on_demand_count: usize, strategy: &PlacementStrategy) -> CapacityClass {
        let within = i64::try_from(on_demand_count)
            .is_ok_and(|count| count <= strategy.low_water_level);
        if within {
            CapacityClass::OnDemand
        } else {
            CapacityClass::Spot
        }
    }
}
