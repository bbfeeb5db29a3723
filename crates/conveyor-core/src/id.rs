//! Typed identifiers for pipelines and executions.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Time-ordered (UUIDv7) identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// First eight hex characters, for log lines and terminal output.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

resource_id!(
    /// Identifies a pipeline definition.
    PipelineId
);

resource_id!(
    /// Identifies one execution (run) of a pipeline.
    ExecutionId
);

impl PipelineId {
    /// Stable identifier derived from the pipeline name, so history written by
    /// one process is found by the next.
    pub fn for_name(name: &str) -> Self {
        Self(Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("conveyor:pipeline:{}", name).as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_id_for_name_is_stable() {
        assert_eq!(PipelineId::for_name("web"), PipelineId::for_name("web"));
        assert_ne!(PipelineId::for_name("web"), PipelineId::for_name("api"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        let id = PipelineId::new();
        let parsed: PipelineId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_serializes_as_plain_uuid() {
        let id = ExecutionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }
}
