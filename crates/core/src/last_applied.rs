//! Last accepted spec, carried as a versioned JSON annotation on the cluster object.

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterSpec;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LastAppliedError {
    #[error("malformed last-applied annotation: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported last-applied version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastApplied {
    pub v: u32,
    pub spec: ClusterSpec,
}

impl LastApplied {
    pub fn new(spec: &ClusterSpec) -> Self {
        Self { v: CURRENT_VERSION, spec: spec.clone() }
    }

    pub fn encode(&self) -> Result<String, LastAppliedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, LastAppliedError> {
        let me: Self = serde_json::from_str(raw)?;
        if me.v != CURRENT_VERSION {
            return Err(LastAppliedError::UnsupportedVersion(me.v));
        }
        Ok(me)
    }
}
