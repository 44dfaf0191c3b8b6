use serde::{Deserialize, Serialize};

/// Base model shared by every persisted record.
///
/// Carries the surrogate id and the optimistic-lock version. An unset id
/// means "not yet persisted". The version is unset until the first save,
/// becomes `0` on that save and is incremented by one on every successful
/// update; a mismatch between the in-memory version and the stored version
/// signals a concurrent writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    id: Option<i64>,
    version: Option<i32>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn version(&self) -> Option<i32> {
        self.version
    }

    /// Marks the entity as persisted. Called by the repository exactly once.
    pub fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = Some(version);
    }

    /// Bumps the version after a successful update, starting at `0` for a
    /// record that has never been saved.
    pub fn increment_version(&mut self) {
        self.version = Some(match self.version {
            Some(version) => version + 1,
            None => 0,
        });
    }
}

/// Identity-based equality: two entities are equal iff both have been
/// persisted and carry the same id. Two unsaved entities are never equal.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        matches!((self.id, other.id), (Some(left), Some(right)) if left == right)
    }
}
