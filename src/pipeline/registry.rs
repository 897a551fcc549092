//! Unit discovery, registration records, seeding and priority tiers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::{debug, info};

use super::unit::{GenerationUnit, UnitId, UnitSpec};

/// Entry of the link-time unit table filled by `#[generation_unit]`
pub struct LinkedUnit {
    pub id: UnitId,
    pub create: fn() -> Box<dyn GenerationUnit>,
}

type UnitFactory = Box<dyn Fn() -> Box<dyn GenerationUnit> + Send + Sync>;

/// Ordered table of unit factories a pipeline discovers its units from.
///
/// Discovery order is the order factories were added, and it drives seed
/// assignment: the same catalog and the same seed give the same unit seeds.
#[derive(Default)]
pub struct UnitCatalog {
    factories: Vec<UnitFactory>,
}

impl UnitCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of every unit self-registered with `#[generation_unit]`,
    /// ordered by unit id so discovery order does not depend on link order.
    pub fn linked() -> Self {
        let mut entries: Vec<&LinkedUnit> = crate::UNITS.iter().collect();
        entries.sort_by_key(|entry| entry.id);

        let mut catalog = Self::new();
        for entry in entries {
            let create = entry.create;
            catalog.add_factory(move || create());
        }
        catalog
    }

    pub fn add_factory<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn GenerationUnit> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn GenerationUnit> + Send + Sync + 'static,
    {
        self.add_factory(factory);
        self
    }

    /// Add a unit that is cloned from `template` on every discovery
    pub fn with_unit<U>(self, template: U) -> Self
    where
        U: GenerationUnit + Clone + Sync,
    {
        self.with_factory(move || Box::new(template.clone()))
    }

    /// Instantiate every unit, in discovery order
    pub fn discover(&self) -> Vec<Box<dyn GenerationUnit>> {
        self.factories.iter().map(|factory| factory()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for UnitCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitCatalog")
            .field("factories", &self.factories.len())
            .finish()
    }
}

/// Immutable per-unit record built at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub unit: UnitId,
    pub spec: UnitSpec,
    /// Position in discovery order
    pub discovery_index: usize,
    /// Child seed drawn from the master stream
    pub seed: u64,
}

/// Registered units of the current run
#[derive(Default)]
pub struct Registry {
    records: HashMap<UnitId, RegistrationRecord>,
    order: Vec<UnitId>,
    tiers: BTreeMap<i32, Vec<UnitId>>,
    units: HashMap<UnitId, Box<dyn GenerationUnit>>,
    registered: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every discovered unit that is not known yet.
    ///
    /// Each new unit gets one draw from a master stream seeded with `seed`,
    /// in discovery order, and its `on_registrate` hook is called with a
    /// generator on that draw. Returns the records that were added.
    pub fn register(
        &mut self,
        seed: u64,
        discovered: Vec<Box<dyn GenerationUnit>>,
    ) -> Vec<RegistrationRecord> {
        let mut master = fastrand::Rng::with_seed(seed);
        let mut added = Vec::new();

        for mut unit in discovered {
            let id = unit.unit_id();
            if self.records.contains_key(id) {
                debug!(unit = id, "Unit already registered, skipping");
                continue;
            }

            let child_seed = master.u64(..);
            let record = RegistrationRecord {
                unit: id,
                spec: unit.unit_spec(),
                discovery_index: self.order.len(),
                seed: child_seed,
            };

            self.tiers
                .entry(record.spec.priority)
                .or_default()
                .push(id);
            self.order.push(id);
            self.records.insert(id, record.clone());

            unit.on_registrate(fastrand::Rng::with_seed(child_seed));
            self.units.insert(id, unit);

            debug!(
                unit = id,
                priority = record.spec.priority,
                dedicated_worker = record.spec.dedicated_worker,
                "Unit registered"
            );
            added.push(record);
        }

        self.registered = true;
        info!(
            added = added.len(),
            total = self.order.len(),
            tiers = self.tiers.len(),
            "Registration complete"
        );
        added
    }

    /// Forget every unit and record
    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.tiers.clear();
        self.units.clear();
        self.registered = false;
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.records.contains_key(unit)
    }

    pub fn record(&self, unit: &str) -> Option<&RegistrationRecord> {
        self.records.get(unit)
    }

    /// Records in discovery order
    pub fn records(&self) -> impl Iterator<Item = &RegistrationRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn child_seed(&self, unit: &str) -> Option<u64> {
        self.records.get(unit).map(|record| record.seed)
    }

    /// Tiers ascending by priority, units in discovery order within a tier
    pub fn tiers(&self) -> Vec<(i32, Vec<UnitId>)> {
        self.tiers
            .iter()
            .map(|(priority, units)| (*priority, units.clone()))
            .collect()
    }

    /// Number of units that want a dedicated worker
    pub fn dedicated_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.spec.dedicated_worker)
            .count()
    }

    /// Hand a unit instance over for dispatch. Each instance is taken once.
    pub fn take_unit(&mut self, unit: &str) -> Option<Box<dyn GenerationUnit>> {
        self.units.remove(unit)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("units", &self.order)
            .field("tiers", &self.tiers)
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::unit::{GenerationContext, UnitDeclaration};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct SeededUnit {
        id: UnitId,
        priority: i32,
        first_draw: Arc<AtomicU64>,
    }

    impl SeededUnit {
        fn new(id: UnitId, priority: i32) -> Self {
            Self {
                id,
                priority,
                first_draw: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl UnitDeclaration for SeededUnit {
        fn unit_id(&self) -> UnitId {
            self.id
        }

        fn unit_spec(&self) -> UnitSpec {
            UnitSpec::new(self.priority).no_requirement()
        }
    }

    impl GenerationUnit for SeededUnit {
        fn on_registrate(&mut self, mut rng: fastrand::Rng) {
            self.first_draw.store(rng.u64(..), Ordering::SeqCst);
        }

        fn on_generate(&mut self, ctx: &GenerationContext) -> anyhow::Result<()> {
            ctx.mark_complete();
            Ok(())
        }
    }

    fn catalog() -> UnitCatalog {
        UnitCatalog::new()
            .with_unit(SeededUnit::new("falloff", 2))
            .with_unit(SeededUnit::new("noise", 1))
            .with_unit(SeededUnit::new("biomes", 2))
    }

    #[test]
    fn test_register_builds_records_and_tiers() {
        let mut registry = Registry::new();
        let added = registry.register(7, catalog().discover());

        assert_eq!(added.len(), 3);
        assert!(registry.is_registered());
        assert_eq!(
            registry.tiers(),
            vec![(1, vec!["noise"]), (2, vec!["falloff", "biomes"])]
        );
        assert_eq!(registry.record("biomes").unwrap().discovery_index, 2);
        assert_eq!(
            registry.records().map(|r| r.unit).collect::<Vec<_>>(),
            vec!["falloff", "noise", "biomes"]
        );
    }

    #[test]
    fn test_seeds_are_deterministic_across_clear() {
        let mut registry = Registry::new();
        registry.register(1337, catalog().discover());
        let first: Vec<u64> = registry.records().map(|r| r.seed).collect();

        registry.clear();
        assert!(!registry.is_registered());
        assert!(registry.is_empty());

        registry.register(1337, catalog().discover());
        let second: Vec<u64> = registry.records().map(|r| r.seed).collect();
        assert_eq!(first, second);

        registry.clear();
        registry.register(1338, catalog().discover());
        let other: Vec<u64> = registry.records().map(|r| r.seed).collect();
        assert_ne!(first, other);
    }

    #[test]
    fn test_child_seeds_follow_master_stream() {
        let mut registry = Registry::new();
        registry.register(99, catalog().discover());

        let mut master = fastrand::Rng::with_seed(99);
        for record in registry.records() {
            assert_eq!(record.seed, master.u64(..));
        }
    }

    #[test]
    fn test_on_registrate_receives_child_generator() {
        let unit = SeededUnit::new("noise", 1);
        let observed = Arc::clone(&unit.first_draw);
        let mut registry = Registry::new();
        registry.register(5, UnitCatalog::new().with_unit(unit).discover());

        let seed = registry.child_seed("noise").unwrap();
        let expected = fastrand::Rng::with_seed(seed).u64(..);
        assert_eq!(observed.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_duplicate_discovery_is_skipped() {
        let mut registry = Registry::new();
        let catalog = catalog().with_unit(SeededUnit::new("noise", 9));
        let added = registry.register(3, catalog.discover());

        assert_eq!(added.len(), 3);
        assert_eq!(registry.record("noise").unwrap().spec.priority, 1);

        let again = registry.register(3, catalog.discover());
        assert!(again.is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_take_unit_hands_out_each_instance_once() {
        let mut registry = Registry::new();
        registry.register(0, catalog().discover());

        assert!(registry.take_unit("noise").is_some());
        assert!(registry.take_unit("noise").is_none());
        assert!(registry.contains("noise"));
    }
}
