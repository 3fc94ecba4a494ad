//! Operation groups.

use crate::context::EntityContext;
use crate::node::Node;
use entigraph_core::EntityId;
use std::collections::HashSet;

/// Ordered, duplicate-free sequence of entities destined for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationGroup {
    ids: Vec<EntityId>,
    members: HashSet<EntityId>,
}

impl OperationGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entity. Returns false if it was already a member.
    pub fn add(&mut self, id: EntityId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        self.ids.retain(|e| *e != id);
        true
    }

    pub fn retain(&mut self, mut keep: impl FnMut(EntityId) -> bool) {
        let members = &mut self.members;
        self.ids.retain(|id| {
            let kept = keep(*id);
            if !kept {
                members.remove(id);
            }
            kept
        });
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.ids.iter().copied()
    }

    /// This group followed by the members of `other` not already in it.
    #[must_use]
    pub fn merged(&self, other: &OperationGroup) -> Self {
        let mut merged = self.clone();
        for id in other.iter() {
            merged.add(id);
        }
        merged
    }

    /// Reordered so same-type entities are adjacent while every entity still
    /// follows the earlier members it references.
    #[must_use]
    pub fn optimized_for_insert(&self, ctx: &EntityContext) -> Self {
        self.clustered(ctx, |before, after| references(ctx, after, before))
    }

    /// Reordered so same-type entities are adjacent, keeping relative order per type.
    #[must_use]
    pub fn optimized_for_update(&self, ctx: &EntityContext) -> Self {
        self.clustered(ctx, |_, _| false)
    }

    /// Reordered so same-type entities are adjacent while every entity still
    /// follows the earlier members referencing it.
    #[must_use]
    pub fn optimized_for_delete(&self, ctx: &EntityContext) -> Self {
        self.clustered(ctx, |before, after| references(ctx, before, after))
    }

    /// Stable topological clustering. `depends(before, after)` says whether
    /// `after` must stay behind `before`, which precedes it in this group.
    fn clustered(
        &self,
        ctx: &EntityContext,
        depends: impl Fn(EntityId, EntityId) -> bool,
    ) -> Self {
        let type_of = |id: EntityId| ctx.get_by_id(id).map(|e| e.type_name().to_string());
        let deps: Vec<Vec<EntityId>> = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, after)| {
                self.ids[..i]
                    .iter()
                    .copied()
                    .filter(|before| depends(*before, *after))
                    .collect()
            })
            .collect();

        let mut pending: Vec<usize> = (0..self.ids.len()).collect();
        let mut placed: HashSet<EntityId> = HashSet::with_capacity(self.ids.len());
        let mut result = OperationGroup::new();
        let mut last_type: Option<String> = None;
        while !pending.is_empty() {
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|i| deps[*i].iter().all(|d| placed.contains(d)))
                .collect();
            let pick = if ready.is_empty() {
                pending[0]
            } else {
                ready
                    .iter()
                    .copied()
                    .find(|i| last_type.is_some() && type_of(self.ids[*i]) == last_type)
                    .unwrap_or(ready[0])
            };
            pending.retain(|i| *i != pick);
            let id = self.ids[pick];
            placed.insert(id);
            last_type = type_of(id);
            result.add(id);
        }
        result
    }
}

/// Whether `holder` has a reference node pointing at `target`.
fn references(ctx: &EntityContext, holder: EntityId, target: EntityId) -> bool {
    ctx.get_by_id(holder).is_some_and(|e| {
        e.nodes()
            .iter()
            .any(|n| matches!(n, Node::Ref(r) if r.reference() == Some(target)))
    })
}

impl<'a> IntoIterator for &'a OperationGroup {
    type Item = EntityId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, EntityId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::environment;

    #[test]
    fn test_add_is_duplicate_free() {
        let a = EntityId::next();
        let mut group = OperationGroup::new();
        assert!(group.add(a));
        assert!(!group.add(a));
        assert_eq!(group.len(), 1);
        assert!(group.remove(a));
        assert!(group.is_empty());
    }

    #[test]
    fn test_merged_keeps_first_position() {
        let (a, b, c) = (EntityId::next(), EntityId::next(), EntityId::next());
        let mut first = OperationGroup::new();
        first.add(a);
        first.add(b);
        let mut second = OperationGroup::new();
        second.add(b);
        second.add(c);
        assert_eq!(first.merged(&second).ids(), &[a, b, c]);
    }

    #[test]
    fn test_insert_order_clusters_types_after_dependencies() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let o1 = ctx.create("Order").unwrap();
        let l1 = ctx.create("OrderLine").unwrap();
        let o2 = ctx.create("Order").unwrap();
        let l2 = ctx.create("OrderLine").unwrap();
        ctx.add_to_many(o1, "lines", l1).unwrap();
        ctx.add_to_many(o2, "lines", l2).unwrap();

        let mut group = OperationGroup::new();
        for id in [o1, l1, o2, l2] {
            group.add(id);
        }
        let optimized = group.optimized_for_insert(&ctx);
        assert_eq!(optimized.ids(), &[o1, o2, l1, l2]);
    }

    #[test]
    fn test_delete_order_keeps_referrers_first() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let o1 = ctx.create("Order").unwrap();
        let l1 = ctx.create("OrderLine").unwrap();
        let l2 = ctx.create("OrderLine").unwrap();
        let o2 = ctx.create("Order").unwrap();
        ctx.add_to_many(o1, "lines", l1).unwrap();
        ctx.add_to_many(o2, "lines", l2).unwrap();

        let mut group = OperationGroup::new();
        for id in [l1, o1, l2, o2] {
            group.add(id);
        }
        let optimized = group.optimized_for_delete(&ctx);
        assert_eq!(optimized.ids(), &[l1, l2, o1, o2]);
    }

    #[test]
    fn test_update_order_is_stable_per_type() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let c1 = ctx.create("Customer").unwrap();
        let o1 = ctx.create("Order").unwrap();
        let c2 = ctx.create("Customer").unwrap();
        let mut group = OperationGroup::new();
        for id in [c1, o1, c2] {
            group.add(id);
        }
        assert_eq!(group.optimized_for_update(&ctx).ids(), &[c1, c2, o1]);
    }
}
