//! Ignore rules: which collisions skip which test.
//!
//! A collision is addressed by any of its naming variants:
//!
//! | Variant | Matches |
//! |---|---|
//! | `link` | every collision of the link |
//! | `link::name` | the collision called `name` on `link` |
//! | `*::name` | every collision called `name`, on any link |
//! | `link::index` | the `index`-th collision of `link` |
//!
//! A collision is ignored by a rule set when any variant is in the set.

use std::collections::BTreeSet;

use selffilter_types::ShapeHandle;

use crate::config::FilterConfig;

/// Every name a collision answers to.  An unnamed collision answers only to
/// `link` and `link::index`; no `link::` or `*::` variant with an empty name
/// is generated, so a rule like `arm::` never matches.
pub fn naming_variants(link: &str, collision: &str, index: usize) -> Vec<String> {
    let mut variants = vec![link.to_string()];
    if !collision.is_empty() {
        variants.push(format!("{link}::{collision}"));
        variants.push(format!("*::{collision}"));
    }
    variants.push(format!("{link}::{index}"));
    variants
}

fn intersects(set: &BTreeSet<String>, variants: &[String]) -> bool {
    variants.iter().any(|v| set.contains(v))
}

/// The tests a single registered collision is excluded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreMatch {
    pub bounding_sphere: bool,
    pub bounding_box: bool,
    pub contains_test: bool,
    pub shadow_test: bool,
}

/// Configured ignore lists, by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoreRules {
    pub bounding_sphere: BTreeSet<String>,
    pub bounding_box: BTreeSet<String>,
    pub contains_test: BTreeSet<String>,
    pub shadow_test: BTreeSet<String>,
    pub everywhere: BTreeSet<String>,
}

impl IgnoreRules {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            bounding_sphere: config.links_ignored_in_bounding_sphere.clone(),
            bounding_box: config.links_ignored_in_bounding_box.clone(),
            contains_test: config.links_ignored_in_contains_test.clone(),
            shadow_test: config.links_ignored_in_shadow_test.clone(),
            everywhere: config.links_ignored_everywhere.clone(),
        }
    }

    /// True when the collision must not even be registered.
    pub fn ignored_everywhere(&self, variants: &[String]) -> bool {
        intersects(&self.everywhere, variants)
    }

    pub fn matching(&self, variants: &[String]) -> IgnoreMatch {
        IgnoreMatch {
            bounding_sphere: intersects(&self.bounding_sphere, variants),
            bounding_box: intersects(&self.bounding_box, variants),
            contains_test: intersects(&self.contains_test, variants),
            shadow_test: intersects(&self.shadow_test, variants),
        }
    }
}

/// Ignore lists resolved to the handles of one model generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoredShapes {
    pub bounding_sphere: BTreeSet<ShapeHandle>,
    pub bounding_box: BTreeSet<ShapeHandle>,
    pub contains_test: BTreeSet<ShapeHandle>,
    pub shadow_test: BTreeSet<ShapeHandle>,
}

impl IgnoredShapes {
    pub fn insert(&mut self, handle: ShapeHandle, matched: IgnoreMatch) {
        if matched.bounding_sphere {
            self.bounding_sphere.insert(handle);
        }
        if matched.bounding_box {
            self.bounding_box.insert(handle);
        }
        if matched.contains_test {
            self.contains_test.insert(handle);
        }
        if matched.shadow_test {
            self.shadow_test.insert(handle);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn variants_of_named_collision() {
        assert_eq!(
            naming_variants("arm", "grip", 0),
            vec!["arm", "arm::grip", "*::grip", "arm::0"]
        );
    }

    #[test]
    fn variants_of_unnamed_collision() {
        assert_eq!(naming_variants("arm", "", 1), vec!["arm", "arm::1"]);
    }

    #[test]
    fn empty_name_rules_never_match_unnamed_collisions() {
        let rules = IgnoreRules {
            shadow_test: set(&["arm::", "*::"]),
            ..IgnoreRules::default()
        };
        assert_eq!(
            rules.matching(&naming_variants("arm", "", 0)),
            IgnoreMatch::default()
        );
    }

    #[test]
    fn each_variant_kind_matches() {
        for entry in ["arm", "arm::grip", "*::grip", "arm::0"] {
            let rules = IgnoreRules {
                shadow_test: set(&[entry]),
                ..IgnoreRules::default()
            };
            let m = rules.matching(&naming_variants("arm", "grip", 0));
            assert!(m.shadow_test, "{entry} should match");
        }
    }

    #[test]
    fn match_lands_only_in_its_own_set() {
        let rules = IgnoreRules {
            bounding_box: set(&["arm::grip"]),
            ..IgnoreRules::default()
        };
        let m = rules.matching(&naming_variants("arm", "grip", 0));
        assert_eq!(
            m,
            IgnoreMatch {
                bounding_box: true,
                ..IgnoreMatch::default()
            }
        );

        let mut keys: SlotMap<ShapeHandle, ()> = SlotMap::with_key();
        let handle = keys.insert(());
        let mut shapes = IgnoredShapes::default();
        shapes.insert(handle, m);
        assert!(shapes.bounding_box.contains(&handle));
        assert!(shapes.bounding_sphere.is_empty());
        assert!(shapes.contains_test.is_empty());
        assert!(shapes.shadow_test.is_empty());
    }

    #[test]
    fn other_link_and_index_do_not_match() {
        let rules = IgnoreRules {
            contains_test: set(&["arm::grip", "leg", "arm::3"]),
            ..IgnoreRules::default()
        };
        assert!(!rules.matching(&naming_variants("arm", "", 1)).contains_test);
    }

    #[test]
    fn everywhere_is_separate() {
        let rules = IgnoreRules {
            everywhere: set(&["*::bumper"]),
            ..IgnoreRules::default()
        };
        assert!(rules.ignored_everywhere(&naming_variants("base", "bumper", 2)));
        assert!(!rules.ignored_everywhere(&naming_variants("base", "hull", 0)));
    }

    #[test]
    fn rules_come_from_config() {
        let rules = IgnoreRules::from_config(&FilterConfig::default());
        assert!(rules.shadow_test.contains("laser"));
        assert!(rules.everywhere.is_empty());
    }
}
