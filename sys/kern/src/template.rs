// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition memory templates.
//!
//! A template is an ordered catalog of the regions a class of partition
//! might hold. Table creation selects a subset of it with a bitmask, so
//! related partitions share one template instead of each carrying a
//! bespoke region list.
//!
//! Entries are either fixed descriptors, complete at template definition
//! time, or dynamic slots resolved at creation time against a list of
//! runtime-built descriptors. The single level of indirection is
//! deliberate: a dynamic entry names an index, never another template.

use crate::region::RegionDesc;

#[derive(Copy, Clone, Debug)]
pub enum TemplateEntry {
    /// Region known at definition time, used as-is.
    Fixed(RegionDesc),
    /// Placeholder resolved against the creation call's dynamic region
    /// list at this index.
    Dynamic(usize),
}

#[derive(Copy, Clone, Debug)]
pub struct Template<'a> {
    pub name: &'a str,
    pub entries: &'a [TemplateEntry],
}

impl Template<'_> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves entry `index` to a concrete descriptor, or `None` if a
    /// dynamic entry points outside `dyn_regions`.
    pub fn resolve(&self, index: usize, dyn_regions: &[RegionDesc]) -> Option<RegionDesc> {
        match *self.entries.get(index)? {
            TemplateEntry::Fixed(desc) => Some(desc),
            TemplateEntry::Dynamic(i) => dyn_regions.get(i).copied(),
        }
    }
}
