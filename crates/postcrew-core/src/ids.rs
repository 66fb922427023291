use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ProjectId, "proj");
branded_id!(TemplateId, "tmpl");
branded_id!(RunId, "run");
branded_id!(StepId, "step");
branded_id!(FindingId, "find");
branded_id!(DraftId, "draft");
branded_id!(ReportId, "rep");
branded_id!(ConnectionId, "conn");
branded_id!(TaskId, "task");

const CHANNEL_PREFIX: &str = "agent_run:";

/// Pub/sub address scoping events to a single run: `agent_run:<run_id>`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn for_run(run_id: &RunId) -> Self {
        Self(format!("{CHANNEL_PREFIX}{run_id}"))
    }

    /// Parse a raw channel string. Only run channels are addressable.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.strip_prefix(CHANNEL_PREFIX) {
            Some(rest) if !rest.is_empty() => Some(Self(raw.to_owned())),
            _ => None,
        }
    }

    pub fn run_id(&self) -> RunId {
        RunId::from_raw(&self.0[CHANNEL_PREFIX.len()..])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
