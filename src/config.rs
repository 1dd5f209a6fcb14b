use crate::{mask::MAX_FIELDS, types::AddressSpaceId};

/// Default number of unchallenged dependence checks a logical user survives
/// before it becomes a pruning candidate.
pub const DEFAULT_LOGICAL_USER_TIMEOUT: u32 = 32;

/// Tuning knobs of one forest instance.
///
/// A forest is owned by the runtime of a single address space; the address
/// space is baked into every distributed id it allocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestConfig {
    /// Address space this forest lives in.
    pub address_space: AddressSpaceId,
    /// Checks a logical user may be skipped over before it is tested for
    /// pruning.
    pub logical_user_timeout: u32,
    /// Create a fresh instance instead of waiting on in-flight readers when a
    /// writer maps onto an instance with a write-after-read hazard.
    pub war_optimization: bool,
    /// Verify disjointness of every partition declared disjoint, even when
    /// the caller does not ask for it.
    pub verify_disjointness: bool,
    /// Upper bound on fields allocated in one field space.
    pub max_fields_per_space: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            address_space: AddressSpaceId(0),
            logical_user_timeout: DEFAULT_LOGICAL_USER_TIMEOUT,
            war_optimization: false,
            verify_disjointness: false,
            max_fields_per_space: MAX_FIELDS,
        }
    }
}

impl ForestConfig {
    /// Configuration for the given address space with defaults elsewhere.
    #[must_use]
    pub fn for_space(address_space: AddressSpaceId) -> Self {
        Self {
            address_space,
            ..Self::default()
        }
    }

    /// Enable or disable the write-after-read optimization.
    #[must_use]
    pub fn with_war_optimization(mut self, enabled: bool) -> Self {
        self.war_optimization = enabled;
        self
    }

    /// Enable or disable forced disjointness verification.
    #[must_use]
    pub fn with_verify_disjointness(mut self, enabled: bool) -> Self {
        self.verify_disjointness = enabled;
        self
    }

    /// Override the logical user timeout; zero is bumped to one.
    #[must_use]
    pub fn with_logical_user_timeout(mut self, timeout: u32) -> Self {
        self.logical_user_timeout = timeout.max(1);
        self
    }

    /// Override the per-space field limit, clamped to `MAX_FIELDS`.
    #[must_use]
    pub fn with_max_fields_per_space(mut self, max: usize) -> Self {
        self.max_fields_per_space = max.min(MAX_FIELDS);
        self
    }
}
