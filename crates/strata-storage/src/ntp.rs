//! Partition Identity
//!
//! An NTP — namespace, topic, partition — names exactly one log. It also
//! fixes the log's location in the storage tree:
//!
//! ```text
//! <base_dir>/<namespace>/<topic>/<partition>/
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Namespace / topic / partition triple identifying one log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ntp {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl Ntp {
    pub fn new(
        namespace: impl Into<String>,
        topic: impl Into<String>,
        partition: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Directory of this partition relative to the storage root.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.namespace)
            .join(&self.topic)
            .join(self.partition.to_string())
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}
