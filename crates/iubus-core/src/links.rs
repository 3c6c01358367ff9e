//! Typed link graph attached to every IU.
//!
//! A [`LinkMap`] maps a link type (e.g. `"grin"`, `"same_level"`) to the set
//! of target uids. Empty sets are never stored: removing the last target of
//! a type removes the type entirely.

use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap, BTreeSet};

/// Link type → set of target uids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMap(BTreeMap<String, BTreeSet<String>>);

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from `(type, targets)` pairs, dropping empty target lists.
    pub fn from_pairs<I, T, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, Vec<S>)>,
        T: Into<String>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for (link_type, targets) in pairs {
            map.insert_all(link_type.into(), targets.into_iter().map(Into::into));
        }
        map
    }

    /// Apply a diff: first remove, then add.
    ///
    /// A type whose set becomes empty during removal is erased before the
    /// additions run, so `remove={T:{X}}, add={T:{Y}}` leaves `T → {Y}`.
    pub fn add_and_remove(&mut self, add: &LinkMap, remove: &LinkMap) {
        for (link_type, targets) in &remove.0 {
            if let btree_map::Entry::Occupied(mut entry) = self.0.entry(link_type.clone()) {
                for target in targets {
                    entry.get_mut().remove(target);
                }
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
        for (link_type, targets) in &add.0 {
            self.insert_all(link_type.clone(), targets.iter().cloned());
        }
    }

    /// Replace the whole map.
    pub fn replace(&mut self, links: LinkMap) {
        self.0 = links.0;
    }

    /// Add a single link.
    pub fn insert(&mut self, link_type: impl Into<String>, target: impl Into<String>) {
        self.0
            .entry(link_type.into())
            .or_default()
            .insert(target.into());
    }

    fn insert_all(&mut self, link_type: String, targets: impl Iterator<Item = String>) {
        let mut targets = targets.peekable();
        if targets.peek().is_none() {
            return;
        }
        self.0.entry(link_type).or_default().extend(targets);
    }

    /// Targets of one link type, if any.
    pub fn get(&self, link_type: &str) -> Option<&BTreeSet<String>> {
        self.0.get(link_type)
    }

    pub fn contains_type(&self, link_type: &str) -> bool {
        self.0.contains_key(link_type)
    }

    pub fn contains(&self, link_type: &str, target: &str) -> bool {
        self.0
            .get(link_type)
            .map(|set| set.contains(target))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of link types.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, BTreeSet<String>> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.0
    }

    pub fn into_inner(self) -> BTreeMap<String, BTreeSet<String>> {
        self.0
    }
}

impl From<BTreeMap<String, BTreeSet<String>>> for LinkMap {
    fn from(map: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self(map.into_iter().filter(|(_, set)| !set.is_empty()).collect())
    }
}

impl<'a> IntoIterator for &'a LinkMap {
    type Item = (&'a String, &'a BTreeSet<String>);
    type IntoIter = btree_map::Iter<'a, String, BTreeSet<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(link_type: &str, target: &str) -> LinkMap {
        let mut map = LinkMap::new();
        map.insert(link_type, target);
        map
    }

    #[test]
    fn test_add_then_remove_prunes_type() {
        let mut links = LinkMap::new();
        links.add_and_remove(&single("grin", "x"), &LinkMap::new());
        assert!(links.contains("grin", "x"));

        links.add_and_remove(&LinkMap::new(), &single("grin", "x"));
        assert!(!links.contains_type("grin"));
        assert!(links.is_empty());
    }

    #[test]
    fn test_remove_runs_before_add() {
        let mut links = single("grin", "x");
        links.add_and_remove(&single("grin", "y"), &single("grin", "x"));
        let targets: Vec<_> = links.get("grin").unwrap().iter().cloned().collect();
        assert_eq!(targets, vec!["y".to_string()]);
    }

    #[test]
    fn test_remove_unknown_type_is_ignored() {
        let mut links = single("grin", "x");
        links.add_and_remove(&LinkMap::new(), &single("other", "x"));
        assert_eq!(links, single("grin", "x"));
    }

    #[test]
    fn test_replace() {
        let mut links = single("grin", "x");
        links.replace(single("same_level", "z"));
        assert!(!links.contains_type("grin"));
        assert!(links.contains("same_level", "z"));
    }

    #[test]
    fn test_from_pairs_drops_empty() {
        let links = LinkMap::from_pairs(vec![("a", vec!["1", "2"]), ("b", Vec::<&str>::new())]);
        assert_eq!(links.len(), 1);
        assert_eq!(links.get("a").map(|s| s.len()), Some(2));
    }
}
