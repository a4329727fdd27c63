use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The caller a workflow acts for. Groups are the caller's entitlements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), groups: BTreeSet::new() }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// True when the caller holds at least one of `required`.
    pub fn intersects<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().any(|group| self.groups.contains(group))
    }
}
