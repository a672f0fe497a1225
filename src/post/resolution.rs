use crate::model::PostId;
use indexmap::IndexMap;

/// Origin post ID to destination post ID, filled during the first import pass
/// and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTable {
    ids: IndexMap<PostId, PostId>,
}

impl ResolutionTable {
    pub fn insert(&mut self, origin: PostId, destination: PostId) {
        self.ids.insert(origin, destination);
    }

    pub fn get(&self, origin: PostId) -> Option<PostId> {
        self.ids.get(&origin).copied()
    }

    pub fn contains(&self, origin: PostId) -> bool {
        self.ids.contains_key(&origin)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PostId, PostId)> + '_ {
        self.ids.iter().map(|(o, d)| (*o, *d))
    }

    pub fn into_map(self) -> IndexMap<PostId, PostId> {
        self.ids
    }
}
