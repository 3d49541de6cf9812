//! Pipeline identifiers and the pipeline cache.
//!
//! Draw pipelines are selected by a closed pair of primary kind and
//! modifier. The renderer builds each variant once through a factory and
//! the [`PipelineTable`] keeps the result for the rest of the session.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Primary pipeline kind of a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    /// Lit, textured geometry.
    Standard,
    /// Flat vertex-colored geometry.
    #[default]
    Color,
    /// Line rendering of geometry edges.
    Wireframe,
    /// Sky cubemap.
    Cubemap,
    /// Stencil outline pass.
    Stencil,
    /// Hardware ray traced frame composition.
    RayTracing,
}

impl PipelineKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Standard,
        Self::Color,
        Self::Wireframe,
        Self::Cubemap,
        Self::Stencil,
        Self::RayTracing,
    ];
}

/// Variant applied on top of a primary kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineModifier {
    #[default]
    None,
    /// Writes the stencil buffer while drawing.
    Stencil,
    /// Draws an outline where the stencil was not written.
    PostStencil,
    /// Polygon mode line.
    Wireframe,
    /// Depth-only draw into a shadow map.
    ShadowMap,
}

/// Key of a pipeline in the [`PipelineTable`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId {
    pub kind: PipelineKind,
    pub modifier: PipelineModifier,
}

impl PipelineId {
    /// Create a pipeline id.
    pub const fn new(kind: PipelineKind, modifier: PipelineModifier) -> Self {
        Self { kind, modifier }
    }

    /// Unmodified pipeline of the given kind.
    pub const fn plain(kind: PipelineKind) -> Self {
        Self::new(kind, PipelineModifier::None)
    }

    /// Same kind with a different modifier.
    #[must_use]
    pub const fn with_modifier(self, modifier: PipelineModifier) -> Self {
        Self::new(self.kind, modifier)
    }
}

/// Cache of factory-built pipelines keyed by [`PipelineId`].
///
/// Entries are created on first use and live until [`PipelineTable::drain`]
/// hands them back for destruction.
pub struct PipelineTable<P> {
    entries: HashMap<PipelineId, P>,
}

impl<P> Default for PipelineTable<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<P> PipelineTable<P> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a pipeline that was already created.
    pub fn get(&self, id: PipelineId) -> Option<&P> {
        self.entries.get(&id)
    }

    /// Whether a pipeline exists for `id`.
    pub fn contains(&self, id: PipelineId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Return the cached pipeline for `id`, building it with `factory` if absent.
    ///
    /// The factory runs at most once per id; a failed build leaves the table
    /// unchanged so the error surfaces again on the next lookup.
    pub fn get_or_try_insert_with<E, F>(&mut self, id: PipelineId, factory: F) -> Result<&P, E>
    where
        F: FnOnce(PipelineId) -> Result<P, E>,
    {
        match self.entries.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(factory(id)?)),
        }
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every pipeline, yielding them for destruction.
    pub fn drain(&mut self) -> impl Iterator<Item = (PipelineId, P)> + '_ {
        self.entries.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn factory_runs_once_per_id() {
        let calls = Cell::new(0);
        let mut table: PipelineTable<String> = PipelineTable::new();
        let id = PipelineId::plain(PipelineKind::Standard);

        for _ in 0..3 {
            let p = table
                .get_or_try_insert_with::<(), _>(id, |id| {
                    calls.set(calls.get() + 1);
                    Ok(format!("{:?}", id.kind))
                })
                .unwrap();
            assert_eq!(p, "Standard");
        }

        assert_eq!(calls.get(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn modifiers_are_distinct_entries() {
        let mut table = PipelineTable::new();
        let base = PipelineId::plain(PipelineKind::Color);
        for modifier in [
            PipelineModifier::None,
            PipelineModifier::Stencil,
            PipelineModifier::Wireframe,
        ] {
            table
                .get_or_try_insert_with::<(), _>(base.with_modifier(modifier), |id| Ok(id))
                .unwrap();
        }
        assert_eq!(table.len(), 3);
        assert!(table.contains(base.with_modifier(PipelineModifier::Stencil)));
        assert!(!table.contains(base.with_modifier(PipelineModifier::ShadowMap)));
    }

    #[test]
    fn failed_factory_leaves_table_empty() {
        let mut table: PipelineTable<u32> = PipelineTable::new();
        let id = PipelineId::plain(PipelineKind::Cubemap);
        let result = table.get_or_try_insert_with(id, |_| Err("shader missing"));
        assert_eq!(result, Err("shader missing"));
        assert!(table.is_empty());
    }

    #[test]
    fn drain_empties_table() {
        let mut table = PipelineTable::new();
        for kind in PipelineKind::ALL {
            table
                .get_or_try_insert_with::<(), _>(PipelineId::plain(kind), |_| Ok(kind))
                .unwrap();
        }
        assert_eq!(table.drain().count(), PipelineKind::ALL.len());
        assert!(table.is_empty());
    }
}
