//! [`ShapeRegistry`] – bookkeeping between collision elements, classifier
//! shapes and the links that move them.
//!
//! The registry is an arena keyed by [`ShapeHandle`]: every entry knows its
//! owning link and cache key, so the link of a shape is found from its handle
//! and nothing points back the other way.  One successful
//! [`rebuild`][ShapeRegistry::rebuild] installs one *generation*; a failed
//! rebuild leaves the registry empty and the classifier holding no shapes.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Isometry3;
use selffilter_types::{CacheKey, FilterError, RobotModel, ShapeHandle};
use tracing::{debug, info, warn};

use crate::classifier::{GeometryClassifier, Inflation};
use crate::ignore::{IgnoreRules, IgnoredShapes, naming_variants};

/// One registered collision element.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionEntry {
    pub handle: ShapeHandle,
    pub link: String,
    /// Collision origin relative to its link.
    pub origin: Isometry3<f64>,
    pub cache_key: CacheKey,
}

/// What a rebuild did with the model it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub registered: usize,
    pub without_geometry: usize,
    pub ignored_everywhere: usize,
    /// Links none of whose collisions were registered.
    pub unfiltered_links: Vec<String>,
}

/// Collisions registered with the classifier for the installed model, with
/// their link, local origin and ignore sets.
#[derive(Debug, Default)]
pub struct ShapeRegistry {
    entries: HashMap<ShapeHandle, CollisionEntry>,
    /// Registration order, for deterministic iteration.
    order: Vec<ShapeHandle>,
    ignored: IgnoredShapes,
    generation: u64,
}

impl ShapeRegistry {
    /// An empty registry at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered shapes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of generations installed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Handles excluded from each test for the current generation.
    pub fn ignored(&self) -> &IgnoredShapes {
        &self.ignored
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &CollisionEntry> {
        self.order.iter().filter_map(|h| self.entries.get(h))
    }

    pub fn entry(&self, handle: ShapeHandle) -> Result<&CollisionEntry, FilterError> {
        self.entries
            .get(&handle)
            .ok_or(FilterError::UnknownShape(handle))
    }

    /// Links whose frames have to be resolvable for filtering.
    pub fn monitored_frames(&self) -> BTreeSet<String> {
        self.entries().map(|e| e.link.clone()).collect()
    }

    /// Register every collision of `model` with `classifier` and install the
    /// resulting generation.  Any previous generation is cleared first.
    pub fn rebuild(
        &mut self,
        model: &RobotModel,
        rules: &IgnoreRules,
        inflation: Inflation,
        classifier: &mut dyn GeometryClassifier,
    ) -> Result<RebuildReport, FilterError> {
        if !self.is_empty() {
            self.clear(classifier);
        }

        let mut report = RebuildReport::default();
        for link in &model.links {
            let mut index = 0;
            let mut retained = 0;
            for collision in &link.collisions {
                let Some(geometry) = &collision.geometry else {
                    warn!(link = %link.name, collision = %collision.name, "collision without geometry is not filtered");
                    report.without_geometry += 1;
                    continue;
                };

                let variants = naming_variants(&link.name, &collision.name, index);
                let cache_key = CacheKey::new(&link.name, index);
                index += 1;

                if rules.ignored_everywhere(&variants) {
                    debug!(link = %link.name, key = %cache_key, "collision ignored everywhere");
                    report.ignored_everywhere += 1;
                    continue;
                }

                let handle = match classifier.add_shape(&cache_key, geometry, inflation) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(link = %link.name, key = %cache_key, error = %e, "registration failed, discarding model");
                        self.clear(classifier);
                        return Err(e.into());
                    }
                };

                self.ignored.insert(handle, rules.matching(&variants));
                self.entries.insert(
                    handle,
                    CollisionEntry {
                        handle,
                        link: link.name.clone(),
                        origin: collision.origin.to_isometry(),
                        cache_key,
                    },
                );
                self.order.push(handle);
                retained += 1;
            }

            if retained == 0 {
                warn!(link = %link.name, "link has no filtered collisions");
                report.unfiltered_links.push(link.name.clone());
            }
        }
        report.registered = self.order.len();

        classifier.set_ignore_in_contains_test(self.ignored.contains_test.clone());
        classifier.set_ignore_in_shadow_test(self.ignored.shadow_test.clone());
        classifier.update_shape_lists();
        self.generation += 1;

        info!(
            model = %model.name,
            generation = self.generation,
            shapes = report.registered,
            "robot model registered"
        );
        Ok(report)
    }

    /// Unregister every shape and forget the generation.
    pub fn clear(&mut self, classifier: &mut dyn GeometryClassifier) {
        for handle in self.order.drain(..) {
            if !classifier.remove_shape(handle) {
                warn!(?handle, "classifier did not know a registered shape");
            }
        }
        self.entries.clear();
        self.ignored.clear();
        classifier.set_ignore_in_contains_test(BTreeSet::new());
        classifier.set_ignore_in_shadow_test(BTreeSet::new());
        classifier.update_shape_lists();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClassifier;
    use nalgebra::Point3;
    use selffilter_perception::{Aabb, BoundingSphere};
    use selffilter_types::{ClassifierError, Collision, Geometry, Link, MaskValue, Origin};
    use slotmap::SlotMap;

    /// Logs the registry's calls into the classifier.
    #[derive(Default)]
    struct Recording {
        shapes: SlotMap<ShapeHandle, String>,
        calls: Vec<String>,
        shadow: BTreeSet<ShapeHandle>,
    }

    impl GeometryClassifier for Recording {
        fn add_shape(
            &mut self,
            key: &CacheKey,
            _geometry: &Geometry,
            _inflation: Inflation,
        ) -> Result<ShapeHandle, ClassifierError> {
            self.calls.push(format!("add {key}"));
            Ok(self.shapes.insert(key.to_string()))
        }

        fn remove_shape(&mut self, handle: ShapeHandle) -> bool {
            let removed = self.shapes.remove(handle);
            if let Some(key) = &removed {
                self.calls.push(format!("remove {key}"));
            }
            removed.is_some()
        }

        fn set_ignore_in_contains_test(&mut self, handles: BTreeSet<ShapeHandle>) {
            self.calls.push(format!("contains {}", handles.len()));
        }

        fn set_ignore_in_shadow_test(&mut self, handles: BTreeSet<ShapeHandle>) {
            self.calls.push(format!("shadow {}", handles.len()));
            self.shadow = handles;
        }

        fn update_shape_lists(&mut self) {
            self.calls.push("update".to_string());
        }

        fn mask_cloud(
            &mut self,
            _poses: &dyn crate::classifier::ShapePoseProvider,
            points: &[Point3<f64>],
            _sensor: &Point3<f64>,
        ) -> Vec<MaskValue> {
            vec![MaskValue::Outside; points.len()]
        }

        fn mask_point(
            &mut self,
            _poses: &dyn crate::classifier::ShapePoseProvider,
            _point: &Point3<f64>,
            _viewpoint: &Point3<f64>,
        ) -> MaskValue {
            MaskValue::Outside
        }

        fn bounding_spheres(&self) -> Vec<(ShapeHandle, BoundingSphere)> {
            Vec::new()
        }

        fn bounding_boxes(&self) -> Vec<(ShapeHandle, Aabb)> {
            Vec::new()
        }
    }

    fn collision(name: &str, geometry: Option<Geometry>) -> Collision {
        Collision {
            name: name.to_string(),
            origin: Origin::default(),
            geometry,
        }
    }

    fn sphere() -> Option<Geometry> {
        Some(Geometry::Sphere { radius: 0.1 })
    }

    fn base_and_arm() -> RobotModel {
        RobotModel {
            name: "rover".into(),
            links: vec![
                Link {
                    name: "base".into(),
                    collisions: vec![collision("hull", sphere())],
                },
                Link {
                    name: "arm".into(),
                    collisions: vec![collision("grip", sphere()), collision("", sphere())],
                },
            ],
        }
    }

    fn rules_with_shadow(entries: &[&str]) -> IgnoreRules {
        IgnoreRules {
            shadow_test: entries.iter().map(|s| s.to_string()).collect(),
            ..IgnoreRules::default()
        }
    }

    fn handle_of(registry: &ShapeRegistry, key: &str) -> ShapeHandle {
        registry
            .entries()
            .find(|e| e.cache_key.as_str() == key)
            .map(|e| e.handle)
            .unwrap()
    }

    #[test]
    fn named_collision_lands_in_its_ignore_set_only() {
        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        registry
            .rebuild(
                &base_and_arm(),
                &rules_with_shadow(&["arm::grip"]),
                Inflation::default(),
                &mut sim,
            )
            .unwrap();

        let grip = handle_of(&registry, "arm-0");
        let unnamed = handle_of(&registry, "arm-1");
        assert!(registry.ignored().shadow_test.contains(&grip));
        assert!(!registry.ignored().shadow_test.contains(&unnamed));
        assert!(registry.ignored().contains_test.is_empty());
        assert!(registry.ignored().bounding_sphere.is_empty());
        assert!(registry.ignored().bounding_box.is_empty());
    }

    #[test]
    fn rebuild_registers_every_collision() {
        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        let report = registry
            .rebuild(&base_and_arm(), &IgnoreRules::default(), Inflation::default(), &mut sim)
            .unwrap();
        assert_eq!(report.registered, 3);
        assert_eq!(sim.len(), 3);
        assert_eq!(registry.generation(), 1);
        assert_eq!(
            registry.monitored_frames(),
            BTreeSet::from(["arm".to_string(), "base".to_string()])
        );
        let keys: Vec<_> = registry.entries().map(|e| e.cache_key.to_string()).collect();
        assert_eq!(keys, vec!["base-0", "arm-0", "arm-1"]);
    }

    #[test]
    fn everywhere_ignored_collision_gets_no_handle() {
        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        let rules = IgnoreRules {
            everywhere: BTreeSet::from(["*::grip".to_string()]),
            ..IgnoreRules::default()
        };
        let report = registry
            .rebuild(&base_and_arm(), &rules, Inflation::default(), &mut sim)
            .unwrap();
        assert_eq!(report.ignored_everywhere, 1);
        assert_eq!(sim.len(), 2);
        // The skipped collision still consumes its index.
        let keys: Vec<_> = registry.entries().map(|e| e.cache_key.to_string()).collect();
        assert_eq!(keys, vec!["base-0", "arm-1"]);
    }

    #[test]
    fn missing_geometry_is_skipped_and_link_reported() {
        let mut model = base_and_arm();
        model.links.push(Link {
            name: "antenna".into(),
            collisions: vec![collision("whip", None)],
        });
        model.links[1].collisions.insert(0, collision("phantom", None));

        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        let report = registry
            .rebuild(&model, &IgnoreRules::default(), Inflation::default(), &mut sim)
            .unwrap();
        assert_eq!(report.without_geometry, 2);
        assert_eq!(report.unfiltered_links, vec!["antenna".to_string()]);
        let keys: Vec<_> = registry.entries().map(|e| e.cache_key.to_string()).collect();
        assert_eq!(keys, vec!["base-0", "arm-0", "arm-1"]);
    }

    #[test]
    fn failed_registration_leaves_registry_empty() {
        let mut model = base_and_arm();
        model.links[1].collisions.push(collision(
            "scan",
            Some(Geometry::Mesh {
                uri: "package://arm.stl".into(),
                scale: [1.0; 3],
            }),
        ));

        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        let err = registry
            .rebuild(&model, &rules_with_shadow(&["arm"]), Inflation::default(), &mut sim)
            .unwrap_err();
        assert!(matches!(err, FilterError::Classifier(_)));
        assert!(registry.is_empty());
        assert!(sim.is_empty());
        assert!(registry.ignored().shadow_test.is_empty());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn rebuild_replaces_previous_generation() {
        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        registry
            .rebuild(&base_and_arm(), &IgnoreRules::default(), Inflation::default(), &mut sim)
            .unwrap();
        let stale = handle_of(&registry, "arm-0");

        registry
            .rebuild(&base_and_arm(), &IgnoreRules::default(), Inflation::default(), &mut sim)
            .unwrap();
        assert_eq!(registry.generation(), 2);
        assert_eq!(sim.len(), 3);
        assert_eq!(registry.entry(stale), Err(FilterError::UnknownShape(stale)));
        assert_ne!(handle_of(&registry, "arm-0"), stale);
    }

    #[test]
    fn ignore_sets_are_installed_before_the_list_refresh() {
        let mut recording = Recording::default();
        let mut registry = ShapeRegistry::new();
        registry
            .rebuild(
                &base_and_arm(),
                &rules_with_shadow(&["arm::grip"]),
                Inflation::default(),
                &mut recording,
            )
            .unwrap();
        assert_eq!(
            recording.calls,
            vec!["add base-0", "add arm-0", "add arm-1", "contains 0", "shadow 1", "update"]
        );
        assert_eq!(recording.shadow, BTreeSet::from([handle_of(&registry, "arm-0")]));

        recording.calls.clear();
        registry.clear(&mut recording);
        assert_eq!(
            recording.calls,
            vec![
                "remove base-0",
                "remove arm-0",
                "remove arm-1",
                "contains 0",
                "shadow 0",
                "update"
            ]
        );
    }

    #[test]
    fn clear_unregisters_everything() {
        let mut sim = SimClassifier::new();
        let mut registry = ShapeRegistry::new();
        registry
            .rebuild(
                &base_and_arm(),
                &rules_with_shadow(&["base"]),
                Inflation::default(),
                &mut sim,
            )
            .unwrap();
        registry.clear(&mut sim);
        assert!(registry.is_empty());
        assert!(sim.is_empty());
        assert_eq!(registry.ignored(), &IgnoredShapes::default());
        assert!(registry.monitored_frames().is_empty());
    }
}
