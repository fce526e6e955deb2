use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{validation_if, MdrResult};

/// Snapshot payload of a versioned library item
pub trait VersionedValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Storage discriminator and uid prefix.
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn validate(&self) -> MdrResult<()> {
        validation_if(self.name().trim().is_empty(), || {
            format!("{} name must not be empty.", Self::KIND)
        })
    }
}

/// Value of a library concept such as a unit definition or a compound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
}

impl ConceptValue {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: None,
            abbreviation: None,
        }
    }
}

impl VersionedValue for ConceptValue {
    const KIND: &'static str = "Concept";

    fn name(&self) -> &str {
        &self.name
    }
}
