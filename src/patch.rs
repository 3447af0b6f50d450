use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;

use crate::error::{Error, Result};

/// The pod under admission together with the JSON it was decoded from.
#[derive(Debug, Clone)]
pub struct AdmittedPod {
    pub pod: Pod,
    baseline: Value,
}

impl AdmittedPod {
    /// Decode the raw admission object.
    ///
    /// The diff baseline is the object re-serialized through [`Pod`], so a
    /// field the typed model does not carry never shows up as a removal.
    pub fn decode(raw: Value) -> Result<Self> {
        let pod: Pod = serde_json::from_value(raw).map_err(|e| Error::decode(e.to_string()))?;
        let baseline = serde_json::to_value(&pod)?;
        Ok(Self { pod, baseline })
    }

    /// The minimal patch turning the admitted object into `mutated`.
    pub fn patch_to(&self, mutated: &Pod) -> Result<Patch> {
        let mutated = serde_json::to_value(mutated)?;
        Ok(json_patch::diff(&self.baseline, &mutated))
    }
}
