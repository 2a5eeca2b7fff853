//! Administrative location hierarchy
//!
//! A read-only tree of counties, subcounties and wards, loaded once from the
//! reference data. Every unit's ancestor path is precomputed at load time so
//! containment checks are O(depth) with no string handling.

use crate::types::{AdministrativeUnit, OfficeLevel, UnitId, UnitLevel};
use crate::{Error, Result, reference_error};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Full path of a ward through the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPath<'a> {
    pub county: &'a AdministrativeUnit,
    pub subcounty: &'a AdministrativeUnit,
    pub ward: &'a AdministrativeUnit,
}

/// A partially specified position in the tree
///
/// Monitors narrow from nothing (national) to county, subcounty and ward.
/// Each specified level is a child of the previous one, which is why values
/// can only be built through [`LocationHierarchy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerLocation {
    county: Option<UnitId>,
    subcounty: Option<UnitId>,
    ward: Option<UnitId>,
}

impl ViewerLocation {
    /// No location selected: national scope
    pub fn national() -> Self {
        Self::default()
    }

    pub fn county(&self) -> Option<UnitId> {
        self.county
    }

    pub fn subcounty(&self) -> Option<UnitId> {
        self.subcounty
    }

    pub fn ward(&self) -> Option<UnitId> {
        self.ward
    }

    /// Viewer's unit at the level an office is contested
    pub fn level_id(&self, level: OfficeLevel) -> Option<UnitId> {
        match level {
            OfficeLevel::National => None,
            OfficeLevel::County => self.county,
            OfficeLevel::Constituency => self.subcounty,
            OfficeLevel::Ward => self.ward,
        }
    }

    /// Deepest specified unit, `None` at national scope
    pub fn most_specific(&self) -> Option<UnitId> {
        self.ward.or(self.subcounty).or(self.county)
    }

    /// Number of specified levels (0 to 3)
    pub fn depth(&self) -> usize {
        [self.county, self.subcounty, self.ward]
            .iter()
            .filter(|level| level.is_some())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.ward.is_some()
    }
}

/// Immutable administrative tree with precomputed ancestor paths
#[derive(Debug, Clone)]
pub struct LocationHierarchy {
    units: HashMap<UnitId, AdministrativeUnit>,
    /// Root-first path for each unit, ending with the unit itself
    paths: HashMap<UnitId, Vec<UnitId>>,
    children: HashMap<UnitId, Vec<UnitId>>,
    counties: Vec<UnitId>,
    names: HashMap<(Option<UnitId>, String), UnitId>,
}

impl LocationHierarchy {
    /// Build the tree, rejecting data that breaks the structural invariants
    ///
    /// Every subcounty needs a county parent and every ward a subcounty
    /// parent. Because parent levels are strictly shallower, a valid load can
    /// never contain a cycle.
    pub fn load(units: Vec<AdministrativeUnit>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(units.len());
        let mut load_order = Vec::with_capacity(units.len());
        for unit in units {
            if by_id.contains_key(&unit.id) {
                return Err(reference_error!("duplicate unit id {}", unit.id));
            }
            load_order.push(unit.id);
            by_id.insert(unit.id, unit);
        }

        let mut names = HashMap::new();
        let mut children: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        let mut counties = Vec::new();

        for id in &load_order {
            let unit = &by_id[id];
            match (unit.level.parent_level(), unit.parent_id) {
                (None, None) => counties.push(unit.id),
                (None, Some(_)) => {
                    return Err(reference_error!("county {} must not have a parent", unit.id));
                }
                (Some(_), None) => {
                    return Err(reference_error!("{} {} has no parent", unit.level, unit.id));
                }
                (Some(expected), Some(parent_id)) => {
                    let parent = by_id.get(&parent_id).ok_or_else(|| {
                        reference_error!("{} {} has unknown parent {}", unit.level, unit.id, parent_id)
                    })?;
                    if parent.level != expected {
                        return Err(reference_error!(
                            "{} {} must have a {} parent, found {} {}",
                            unit.level,
                            unit.id,
                            expected,
                            parent.level,
                            parent.id
                        ));
                    }
                    children.entry(parent_id).or_default().push(unit.id);
                }
            }

            if names
                .insert((unit.parent_id, unit.name.clone()), unit.id)
                .is_some()
            {
                return Err(reference_error!(
                    "duplicate name {:?} under {:?}",
                    unit.name,
                    unit.parent_id
                ));
            }
        }

        let mut paths = HashMap::with_capacity(by_id.len());
        for id in &load_order {
            let mut path = vec![*id];
            let mut cursor = by_id[id].parent_id;
            while let Some(parent) = cursor {
                path.push(parent);
                cursor = by_id[&parent].parent_id;
            }
            path.reverse();
            paths.insert(*id, path);
        }

        let sort_by_name = |ids: &mut Vec<UnitId>| {
            ids.sort_by(|a, b| by_id[a].name.cmp(&by_id[b].name));
        };
        sort_by_name(&mut counties);
        for siblings in children.values_mut() {
            sort_by_name(siblings);
        }

        tracing::info!(
            "🗺️  Location hierarchy loaded: {} units, {} counties",
            by_id.len(),
            counties.len()
        );

        Ok(Self {
            units: by_id,
            paths,
            children,
            counties,
            names,
        })
    }

    pub fn get(&self, id: UnitId) -> Result<&AdministrativeUnit> {
        self.units.get(&id).ok_or_else(|| Error::not_found("location", id))
    }

    pub fn exists(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Resolve a ward to its county and subcounty
    pub fn resolve_path(&self, ward_id: UnitId) -> Result<ResolvedPath<'_>> {
        let ward = self.get(ward_id)?;
        if ward.level != UnitLevel::Ward {
            return Err(Error::validation(format!(
                "location {ward_id} is a {}, not a ward",
                ward.level
            )));
        }
        let path = self.path(ward_id)?;
        Ok(ResolvedPath {
            county: self.get(path[0])?,
            subcounty: self.get(path[1])?,
            ward,
        })
    }

    /// Child units ordered by name
    pub fn children(&self, unit_id: UnitId) -> Result<Vec<&AdministrativeUnit>> {
        self.get(unit_id)?;
        Ok(self
            .children
            .get(&unit_id)
            .map(|ids| ids.iter().map(|id| &self.units[id]).collect())
            .unwrap_or_default())
    }

    /// All counties ordered by name
    pub fn counties(&self) -> Vec<&AdministrativeUnit> {
        self.counties.iter().map(|id| &self.units[id]).collect()
    }

    /// True when `unit_id` is `ancestor_id` or one of its descendants
    pub fn contains(&self, ancestor_id: UnitId, unit_id: UnitId) -> Result<bool> {
        self.get(ancestor_id)?;
        Ok(self.path(unit_id)?.contains(&ancestor_id))
    }

    /// Exact name lookup among the children of `parent` (counties when `None`)
    pub fn find_by_name(&self, parent: Option<UnitId>, name: &str) -> Option<&AdministrativeUnit> {
        self.names
            .get(&(parent, name.to_string()))
            .map(|id| &self.units[id])
    }

    /// Root-first ancestor path, ending with the unit itself
    pub fn path(&self, unit_id: UnitId) -> Result<&[UnitId]> {
        self.paths
            .get(&unit_id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::not_found("location", unit_id))
    }

    /// Validated partial location built level by level
    pub fn viewer(
        &self,
        county: Option<UnitId>,
        subcounty: Option<UnitId>,
        ward: Option<UnitId>,
    ) -> Result<ViewerLocation> {
        let levels = [
            (county, UnitLevel::County),
            (subcounty, UnitLevel::Subcounty),
            (ward, UnitLevel::Ward),
        ];

        let mut parent: Option<UnitId> = None;
        let mut gap = false;
        for (id, level) in levels {
            match id {
                Some(id) => {
                    if gap {
                        return Err(Error::validation(format!(
                            "{level} selected without its parent level"
                        )));
                    }
                    let unit = self.get(id)?;
                    if unit.level != level || unit.parent_id != parent {
                        return Err(Error::validation(format!(
                            "location {id} is not a {level} under {parent:?}"
                        )));
                    }
                    parent = Some(id);
                }
                None => gap = true,
            }
        }

        Ok(ViewerLocation {
            county,
            subcounty,
            ward,
        })
    }

    /// Fully or partially specified location implied by a single unit
    pub fn viewer_for(&self, unit_id: UnitId) -> Result<ViewerLocation> {
        let path = self.path(unit_id)?;
        Ok(ViewerLocation {
            county: path.first().copied(),
            subcounty: path.get(1).copied(),
            ward: path.get(2).copied(),
        })
    }

    /// Extend a location one level down
    pub fn narrow(&self, current: &ViewerLocation, child: UnitId) -> Result<ViewerLocation> {
        let unit = self.get(child)?;
        if unit.parent_id != current.most_specific() {
            return Err(Error::validation(format!(
                "location {child} is not directly below the current selection"
            )));
        }
        self.viewer_for(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: u32, name: &str, level: UnitLevel, parent: Option<u32>) -> AdministrativeUnit {
        AdministrativeUnit {
            id: UnitId(id),
            name: name.to_string(),
            level,
            parent_id: parent.map(UnitId),
        }
    }

    fn sample() -> LocationHierarchy {
        LocationHierarchy::load(vec![
            unit(1, "Mombasa", UnitLevel::County, None),
            unit(2, "Nairobi", UnitLevel::County, None),
            unit(10, "Nyali", UnitLevel::Subcounty, Some(1)),
            unit(11, "Changamwe", UnitLevel::Subcounty, Some(1)),
            unit(20, "Westlands", UnitLevel::Subcounty, Some(2)),
            unit(100, "Frere Town", UnitLevel::Ward, Some(10)),
            unit(101, "Kongowea", UnitLevel::Ward, Some(10)),
            unit(200, "Parklands", UnitLevel::Ward, Some(20)),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_path() {
        let hierarchy = sample();
        let path = hierarchy.resolve_path(UnitId(101)).unwrap();
        assert_eq!(path.county.name, "Mombasa");
        assert_eq!(path.subcounty.name, "Nyali");
        assert_eq!(path.ward.name, "Kongowea");

        assert!(matches!(
            hierarchy.resolve_path(UnitId(999)),
            Err(Error::NotFound { .. })
        ));
        assert!(hierarchy.resolve_path(UnitId(10)).is_err());
    }

    #[test]
    fn test_containment() {
        let hierarchy = sample();
        assert!(hierarchy.contains(UnitId(1), UnitId(100)).unwrap());
        assert!(hierarchy.contains(UnitId(10), UnitId(10)).unwrap());
        assert!(!hierarchy.contains(UnitId(2), UnitId(100)).unwrap());
        assert!(!hierarchy.contains(UnitId(100), UnitId(1)).unwrap());
        assert!(hierarchy.contains(UnitId(404), UnitId(1)).is_err());
    }

    #[test]
    fn test_children_are_ordered_by_name() {
        let hierarchy = sample();
        let names: Vec<_> = hierarchy
            .children(UnitId(1))
            .unwrap()
            .into_iter()
            .map(|u| u.name.as_str())
            .collect();
        assert_eq!(names, vec!["Changamwe", "Nyali"]);
        assert!(hierarchy.children(UnitId(200)).unwrap().is_empty());
    }

    #[test]
    fn test_load_rejects_broken_trees() {
        let ward_under_county = LocationHierarchy::load(vec![
            unit(1, "Mombasa", UnitLevel::County, None),
            unit(100, "Frere Town", UnitLevel::Ward, Some(1)),
        ]);
        assert!(matches!(ward_under_county, Err(Error::InvalidReference { .. })));

        let duplicate_names = LocationHierarchy::load(vec![
            unit(1, "Mombasa", UnitLevel::County, None),
            unit(10, "Nyali", UnitLevel::Subcounty, Some(1)),
            unit(11, "Nyali", UnitLevel::Subcounty, Some(1)),
        ]);
        assert!(duplicate_names.is_err());

        let orphan = LocationHierarchy::load(vec![unit(10, "Nyali", UnitLevel::Subcounty, Some(9))]);
        assert!(orphan.is_err());
    }

    #[test]
    fn test_viewer_construction() {
        let hierarchy = sample();

        let county_only = hierarchy.viewer(Some(UnitId(1)), None, None).unwrap();
        assert_eq!(county_only.depth(), 1);
        assert_eq!(county_only.level_id(OfficeLevel::County), Some(UnitId(1)));
        assert_eq!(county_only.level_id(OfficeLevel::Ward), None);

        // ward without subcounty
        assert!(hierarchy.viewer(Some(UnitId(1)), None, Some(UnitId(100))).is_err());
        // subcounty from a different county
        assert!(hierarchy.viewer(Some(UnitId(2)), Some(UnitId(10)), None).is_err());

        let full = hierarchy.viewer_for(UnitId(100)).unwrap();
        assert!(full.is_complete());
        assert_eq!(full.subcounty(), Some(UnitId(10)));

        let narrowed = hierarchy.narrow(&county_only, UnitId(11)).unwrap();
        assert_eq!(narrowed.most_specific(), Some(UnitId(11)));
        assert!(hierarchy.narrow(&county_only, UnitId(200)).is_err());
    }

    #[test]
    fn test_find_by_name_is_exact() {
        let hierarchy = sample();
        assert_eq!(
            hierarchy.find_by_name(None, "Nairobi").map(|u| u.id),
            Some(UnitId(2))
        );
        assert!(hierarchy.find_by_name(None, "nairobi").is_none());
        assert_eq!(
            hierarchy.find_by_name(Some(UnitId(10)), "Kongowea").map(|u| u.id),
            Some(UnitId(101))
        );
    }
}
