use std::collections::HashMap;

use timeline_core::entity::{merge_props, now_ms, TimelineEntity};

/// What a mutation did to the conversation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new id was added at the end of the order.
    Inserted,
    /// An existing entity was merged or renamed.
    Updated,
    /// The incoming update was older than what is stored and was dropped.
    Stale,
    /// Nothing to do (duplicate create, missing target, empty payload).
    NoOp,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// All entities of one conversation plus their first-seen order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationTimeline {
    by_id: HashMap<String, TimelineEntity>,
    order: Vec<String>,
}

impl ConversationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&TimelineEntity> {
        self.by_id.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut TimelineEntity> {
        self.by_id.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entities in timeline order.
    pub fn entities(&self) -> Vec<TimelineEntity> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    pub(crate) fn insert_new(&mut self, entity: TimelineEntity) {
        self.order.push(entity.id.clone());
        self.by_id.insert(entity.id.clone(), entity);
    }

    /// Insert, or merge into the existing entity under version gating.
    pub fn upsert(&mut self, entity: TimelineEntity) -> MergeOutcome {
        let Some(existing) = self.by_id.get_mut(&entity.id) else {
            self.insert_new(entity);
            return MergeOutcome::Inserted;
        };

        let incoming_version = entity.effective_version();
        let existing_version = existing.effective_version();

        if incoming_version > 0 {
            if incoming_version < existing_version {
                return MergeOutcome::Stale;
            }
            if !entity.kind.is_empty() {
                existing.kind = entity.kind;
            }
            if entity.created_at != 0 {
                existing.created_at = entity.created_at;
            }
            existing.updated_at = entity.updated_at.or(existing.updated_at);
            existing.version = Some(incoming_version);
            existing.props = merge_props(&existing.props, &entity.props);
        } else if existing_version > 0 {
            // Content-only update against a versioned entity: the version and
            // identity fields belong to the versioned write.
            existing.updated_at = Some(entity.updated_at.unwrap_or_else(now_ms));
            existing.props = merge_props(&existing.props, &entity.props);
        } else {
            if !entity.kind.is_empty() {
                existing.kind = entity.kind;
            }
            if existing.created_at == 0 {
                existing.created_at = entity.created_at;
            }
            existing.updated_at = entity.updated_at.or(existing.updated_at);
            existing.props = merge_props(&existing.props, &entity.props);
        }
        MergeOutcome::Updated
    }

    /// Insert only; an existing id is left untouched.
    pub fn add(&mut self, entity: TimelineEntity) -> MergeOutcome {
        if self.by_id.contains_key(&entity.id) {
            return MergeOutcome::NoOp;
        }
        self.insert_new(entity);
        MergeOutcome::Inserted
    }

    /// Move `from_id` to `to_id`, merging into `to_id` if it already exists.
    pub fn rekey(&mut self, from_id: &str, to_id: &str) -> MergeOutcome {
        if from_id == to_id {
            return MergeOutcome::NoOp;
        }
        let Some(mut source) = self.by_id.remove(from_id) else {
            return MergeOutcome::NoOp;
        };

        match self.by_id.get_mut(to_id) {
            None => {
                source.id = to_id.to_string();
                self.by_id.insert(to_id.to_string(), source);
                if let Some(slot) = self.order.iter_mut().find(|id| id.as_str() == from_id) {
                    *slot = to_id.to_string();
                }
            }
            Some(dest) => {
                if dest.created_at == 0 {
                    dest.created_at = source.created_at;
                }
                dest.updated_at = dest.updated_at.or(source.updated_at);
                dest.version = dest.version.or(source.version);
                if dest.kind.is_empty() {
                    dest.kind = source.kind;
                }
                dest.props = merge_props(&source.props, &dest.props);
                self.order.retain(|id| id != from_id);
            }
        }
        MergeOutcome::Updated
    }

    /// Replace everything with `entities`. Duplicate ids keep the position of
    /// their first occurrence and the content of their last.
    pub fn apply_snapshot(&mut self, entities: Vec<TimelineEntity>) {
        let mut by_id = HashMap::with_capacity(entities.len());
        let mut order = Vec::with_capacity(entities.len());
        for entity in entities {
            if !by_id.contains_key(&entity.id) {
                order.push(entity.id.clone());
            }
            by_id.insert(entity.id.clone(), entity);
        }
        self.by_id = by_id;
        self.order = order;
    }
}
