use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LOW_WATER_LEVEL_ANNOTATION: &str = "webhook-demo.com/low-water-level";
pub const DEFAULT_HIGH_WATER_LEVEL_ANNOTATION: &str = "webhook-demo.com/high-water-level";
pub const DEFAULT_SCHEDULE_COMPENSATION_ANNOTATION: &str = "webhook-demo.com/schedule-compensation";
pub const DEFAULT_CAPACITY_NODE_LABEL_KEY: &str = "node.kubernetes.io/capacity";
pub const DEFAULT_ON_DEMAND_NODE_LABEL_VALUE: &str = "on-demand";
pub const DEFAULT_SPOT_NODE_LABEL_VALUE: &str = "spot";

/// Weight of the generated spot preference, the maximum the scheduler accepts.
pub const DEFAULT_SPOT_PREFERENCE_WEIGHT: i32 = 100;
pub const DEFAULT_LOCK_SUFFIX: &str = "lease";
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Kept under the API server's default webhook timeout of 10s.
pub const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(8);

/// A node label pair identifying one capacity class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLabel {
    pub key: String,
    pub value: String,
}

impl NodeLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The annotation and label keys the webhook reads and writes.
///
/// Injected everywhere instead of being read from constants, so a cluster using
/// a different labelling convention only has to change the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementKeys {
    pub low_water_level: String,
    pub high_water_level: String,
    pub schedule_compensation: String,
    pub on_demand: NodeLabel,
    pub spot: NodeLabel,
    pub spot_weight: i32,
}

impl Default for PlacementKeys {
    fn default() -> Self {
        Self {
            low_water_level: DEFAULT_LOW_WATER_LEVEL_ANNOTATION.to_string(),
            high_water_level: DEFAULT_HIGH_WATER_LEVEL_ANNOTATION.to_string(),
            schedule_compensation: DEFAULT_SCHEDULE_COMPENSATION_ANNOTATION.to_string(),
            on_demand: NodeLabel::new(
                DEFAULT_CAPACITY_NODE_LABEL_KEY,
                DEFAULT_ON_DEMAND_NODE_LABEL_VALUE,
            ),
            spot: NodeLabel::new(DEFAULT_CAPACITY_NODE_LABEL_KEY, DEFAULT_SPOT_NODE_LABEL_VALUE),
            spot_weight: DEFAULT_SPOT_PREFERENCE_WEIGHT,
        }
    }
}

/// How the name of the lock record is derived from an admitted pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockScopeMode {
    /// `<generateName>-<suffix>`, shared by every replica of one ReplicaSet.
    /// Falls back to the deployment when the pod has no generateName.
    #[default]
    GenerateName,
    /// `<deployment>-<suffix>`, taken from the resolved owner chain.
    Deployment,
}

impl FromStr for LockScopeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate-name" => Ok(LockScopeMode::GenerateName),
            "deployment" => Ok(LockScopeMode::Deployment),
            other => Err(format!(
                "unknown lock scope mode {other:?}, expected generate-name or deployment"
            )),
        }
    }
}

impl fmt::Display for LockScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScopeMode::GenerateName => write!(f, "generate-name"),
            LockScopeMode::Deployment => write!(f, "deployment"),
        }
    }
}

/// Lock acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub suffix: String,
    pub retry_interval: Duration,
    pub deadline: Duration,
    pub scope_mode: LockScopeMode,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_LOCK_SUFFIX.to_string(),
            retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            deadline: DEFAULT_LOCK_DEADLINE,
            scope_mode: LockScopeMode::default(),
        }
    }
}

/// Everything the compensation pipeline needs to know besides the cluster itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationConfig {
    pub keys: PlacementKeys,
    pub lock: LockSettings,
}
