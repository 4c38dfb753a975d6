//! Region allocator
//!
//! The heap is carved into regions. New objects go to the nursery until it
//! fills, then to old regions; objects above the large-object threshold get
//! the large object space. Regions hold objects in slots, and a
//! [`Location`] (region, slot) is what the handle table points at.

use crate::object::HeapObject;

/// Generation a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Young objects; evacuated on every collection
    Nursery,
    /// Promoted or pretenured objects
    Old,
    /// Objects above the large-object threshold
    Large,
}

/// Physical position of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub(crate) region: u32,
    pub(crate) slot: u32,
}

/// A heap region
#[derive(Debug)]
pub struct Region {
    space: Space,
    /// Capacity in bytes
    capacity: usize,
    /// Bytes occupied by live slots
    used: usize,
    slots: Vec<Option<HeapObject>>,
    free_slots: Vec<u32>,
}

impl Region {
    fn new(space: Space, capacity: usize) -> Self {
        Self {
            space,
            capacity,
            used: 0,
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Generation of this region
    pub fn space(&self) -> Space {
        self.space
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupied bytes
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of objects resident
    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    fn has_room(&self, size: usize) -> bool {
        self.used + size <= self.capacity
    }

    fn insert(&mut self, object: HeapObject) -> u32 {
        self.used += object.header.size();
        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(object);
                slot
            }
            None => {
                self.slots.push(Some(object));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn take(&mut self, slot: u32) -> Option<HeapObject> {
        let object = self.slots.get_mut(slot as usize)?.take()?;
        self.used -= object.header.size();
        self.free_slots.push(slot);
        Some(object)
    }

    /// Resident objects with their slot numbers
    pub fn objects(&self) -> impl Iterator<Item = (u32, &HeapObject)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|o| (i as u32, o)))
    }

    fn objects_mut(&mut self) -> impl Iterator<Item = &mut HeapObject> + '_ {
        self.slots.iter_mut().flatten()
    }
}

/// Sizing knobs for the region set
#[derive(Debug, Clone, Copy)]
pub struct RegionLimits {
    /// Nursery capacity in bytes
    pub nursery_bytes: usize,
    /// Capacity of each old region in bytes
    pub region_bytes: usize,
    /// Objects larger than this go to the large object space
    pub large_object_threshold: usize,
}

/// All regions of a heap
#[derive(Debug)]
pub struct RegionSet {
    limits: RegionLimits,
    regions: Vec<Option<Region>>,
    nursery: u32,
    large: u32,
    /// Bytes occupied across all regions
    used: usize,
}

impl RegionSet {
    /// Create the nursery, one old region and the large object space
    pub fn new(limits: RegionLimits) -> Self {
        let regions = vec![
            Some(Region::new(Space::Nursery, limits.nursery_bytes)),
            Some(Region::new(Space::Large, usize::MAX)),
            Some(Region::new(Space::Old, limits.region_bytes)),
        ];
        Self {
            limits,
            regions,
            nursery: 0,
            large: 1,
            used: 0,
        }
    }

    /// Bytes occupied across all regions
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of regions currently held
    pub fn region_count(&self) -> usize {
        self.regions.iter().flatten().count()
    }

    /// Regions currently held
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.iter().flatten()
    }

    /// Space a location lives in
    pub fn space_of(&self, location: Location) -> Option<Space> {
        self.region(location.region).map(Region::space)
    }

    fn region(&self, id: u32) -> Option<&Region> {
        self.regions.get(id as usize).and_then(Option::as_ref)
    }

    fn region_mut(&mut self, id: u32) -> Option<&mut Region> {
        self.regions.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Place a freshly allocated object
    pub fn place(&mut self, object: HeapObject) -> Location {
        let size = object.header.size();
        let region = if size > self.limits.large_object_threshold {
            self.large
        } else if self
            .region(self.nursery)
            .is_some_and(|nursery| nursery.has_room(size))
        {
            self.nursery
        } else {
            self.old_region_with_room(size)
        };
        self.insert_into(region, object)
    }

    /// Place an object in an old region (promotion)
    pub fn place_old(&mut self, object: HeapObject) -> Location {
        let region = self.old_region_with_room(object.header.size());
        self.insert_into(region, object)
    }

    fn insert_into(&mut self, region: u32, object: HeapObject) -> Location {
        self.used += object.header.size();
        let slot = match self.region_mut(region) {
            Some(r) => r.insert(object),
            None => unreachable!("placement chose a released region"),
        };
        Location { region, slot }
    }

    fn old_region_with_room(&mut self, size: usize) -> u32 {
        let existing = self.regions.iter().position(|r| {
            r.as_ref()
                .is_some_and(|r| r.space == Space::Old && r.has_room(size))
        });
        if let Some(id) = existing {
            return id as u32;
        }

        let region = Region::new(Space::Old, self.limits.region_bytes.max(size));
        match self.regions.iter().position(Option::is_none) {
            Some(id) => {
                self.regions[id] = Some(region);
                id as u32
            }
            None => {
                self.regions.push(Some(region));
                (self.regions.len() - 1) as u32
            }
        }
    }

    /// Object at a location
    pub fn get(&self, location: Location) -> Option<&HeapObject> {
        self.region(location.region)?
            .slots
            .get(location.slot as usize)?
            .as_ref()
    }

    /// Mutable object at a location
    pub fn get_mut(&mut self, location: Location) -> Option<&mut HeapObject> {
        self.region_mut(location.region)?
            .slots
            .get_mut(location.slot as usize)?
            .as_mut()
    }

    /// Remove an object, returning it
    pub fn take(&mut self, location: Location) -> Option<HeapObject> {
        let object = self.region_mut(location.region)?.take(location.slot)?;
        self.used -= object.header.size();
        Some(object)
    }

    /// Every resident object
    pub fn for_each_object(&self, mut f: impl FnMut(Location, &HeapObject)) {
        for (region_id, region) in self.regions.iter().enumerate() {
            if let Some(region) = region {
                for (slot, object) in region.objects() {
                    f(
                        Location {
                            region: region_id as u32,
                            slot,
                        },
                        object,
                    );
                }
            }
        }
    }

    /// Every resident object, mutably
    pub fn for_each_object_mut(&mut self, mut f: impl FnMut(&mut HeapObject)) {
        for region in self.regions.iter_mut().flatten() {
            for object in region.objects_mut() {
                f(object);
            }
        }
    }

    /// Locations of every object in the nursery
    pub fn nursery_locations(&self) -> Vec<Location> {
        self.region(self.nursery)
            .map(|r| {
                r.objects()
                    .map(|(slot, _)| Location {
                        region: self.nursery,
                        slot,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop old regions left empty by a sweep, keeping the first one
    pub fn release_empty_regions(&mut self) -> usize {
        let mut kept_one = false;
        let mut released = 0;
        for entry in self.regions.iter_mut() {
            let empty_old = match entry {
                Some(r) if r.space == Space::Old => {
                    if r.object_count() == 0 && kept_one {
                        true
                    } else {
                        kept_one = true;
                        false
                    }
                }
                _ => false,
            };
            if empty_old {
                *entry = None;
                released += 1;
            }
        }
        released
    }
}
