use colloquy_core::domain::identity::Identity;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny { reason_code: &'static str },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Group-based gate in front of retrieval. A collection without required groups is public.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionAccessPolicy;

impl CollectionAccessPolicy {
    pub fn evaluate(&self, identity: &Identity, required_groups: &[String]) -> AccessDecision {
        if required_groups.is_empty() {
            return AccessDecision::Allow;
        }
        if identity.groups.is_empty() {
            return AccessDecision::Deny { reason_code: "caller_has_no_groups" };
        }
        if identity.intersects(required_groups) {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny { reason_code: "group_mismatch" }
        }
    }

    /// Metadata groups win when the collection declares any; the binding's groups apply otherwise.
    pub fn required_groups<'a>(
        &self,
        metadata_groups: &'a [String],
        binding_groups: &'a [String],
    ) -> &'a [String] {
        if metadata_groups.is_empty() {
            binding_groups
        } else {
            metadata_groups
        }
    }
}
