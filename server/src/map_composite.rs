//! Map composite: the entities of one map, partitioned into square zones
//! for spatial queries, plus the per-map public id allocator.
//!
//! Zones are strict partitions; an entity is referenced by exactly one zone
//! at any time. When a moving entity crosses a zone border, the source zone
//! records the destination zone in its `destinations` set for the rest of
//! the tick, which is what lets awareness queries see entities that crossed
//! a border in the same tick as the observer.

use evermire_core::point::{Point, Rectangle};
use evermire_core::protocol::{EntityKind, PvpMode};

use crate::entity::EntityId;
use crate::map::Map;

/// Pixel diameter of the partition squares. Big enough that a moving entity
/// cannot cross several zones in one tick.
pub const ZONE_DIAM: i32 = 256;

pub type MapId = u16;

/// Sorted set of zone indices.
pub type MapRegion = Vec<usize>;

fn add_zone(region: &mut MapRegion, zone: usize) {
    match region.binary_search(&zone) {
        Ok(_) => {}
        Err(at) => region.insert(at, zone),
    }
}

fn is_moving(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Character | EntityKind::Monster | EntityKind::Npc
    )
}

/// One zone's entities, partitioned as characters first, then other moving
/// entities, then everything else.
#[derive(Debug, Default)]
pub struct MapZone {
    entities: Vec<EntityId>,
    nb_characters: usize,
    nb_moving: usize,
    destinations: MapRegion,
}

impl MapZone {
    fn insert(&mut self, id: EntityId, kind: EntityKind) {
        match kind {
            EntityKind::Character => {
                if self.nb_characters != self.nb_moving {
                    if self.nb_moving != self.entities.len() {
                        self.entities.push(self.entities[self.nb_moving]);
                        self.entities[self.nb_moving] = self.entities[self.nb_characters];
                    } else {
                        self.entities.push(self.entities[self.nb_characters]);
                    }
                    self.entities[self.nb_characters] = id;
                    self.nb_characters += 1;
                    self.nb_moving += 1;
                    return;
                }
                self.nb_characters += 1;
                // Fall through to the moving segment.
                if self.nb_moving != self.entities.len() {
                    self.entities.push(self.entities[self.nb_moving]);
                    self.entities[self.nb_moving] = id;
                    self.nb_moving += 1;
                    return;
                }
                self.nb_moving += 1;
                self.entities.push(id);
            }
            EntityKind::Monster | EntityKind::Npc => {
                if self.nb_moving != self.entities.len() {
                    self.entities.push(self.entities[self.nb_moving]);
                    self.entities[self.nb_moving] = id;
                    self.nb_moving += 1;
                    return;
                }
                self.nb_moving += 1;
                self.entities.push(id);
            }
            _ => {
                self.entities.push(id);
            }
        }
    }

    fn remove(&mut self, id: EntityId, kind: EntityKind) {
        let (seg_start, seg_end) = match kind {
            EntityKind::Character => (0, self.nb_characters),
            EntityKind::Monster | EntityKind::Npc => (self.nb_characters, self.nb_moving),
            _ => (self.nb_moving, self.entities.len()),
        };
        let mut pos = self.entities[seg_start..seg_end]
            .iter()
            .position(|e| *e == id)
            .map(|p| p + seg_start)
            .expect("entity not present in its zone segment");

        if pos < self.nb_characters {
            self.entities[pos] = self.entities[self.nb_characters - 1];
            pos = self.nb_characters - 1;
            self.nb_characters -= 1;
        }
        if pos < self.nb_moving {
            self.entities[pos] = self.entities[self.nb_moving - 1];
            pos = self.nb_moving - 1;
            self.nb_moving -= 1;
        }
        self.entities[pos] = self.entities[self.entities.len() - 1];
        self.entities.pop();
    }

    pub fn characters(&self) -> &[EntityId] {
        &self.entities[..self.nb_characters]
    }

    pub fn moving(&self) -> &[EntityId] {
        &self.entities[..self.nb_moving]
    }

    pub fn all(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn destinations(&self) -> &MapRegion {
        &self.destinations
    }
}

/// 256-slot bitmap allocator for one bucket of public ids.
struct EntityBucket {
    bitmap: [u32; 8],
    free: u16,
    next_slot: u16,
}

impl EntityBucket {
    fn new(reserved_slot: Option<u16>) -> Self {
        let mut bucket = EntityBucket {
            bitmap: [!0u32; 8],
            free: 256,
            next_slot: 0,
        };
        if let Some(slot) = reserved_slot {
            bucket.bitmap[slot as usize / 32] &= !(1 << (slot % 32));
            bucket.free -= 1;
            if slot == 0 {
                bucket.next_slot = 1;
            }
        }
        bucket
    }

    fn allocate(&mut self) -> Option<u16> {
        if self.free == 0 {
            return None;
        }

        // Fast path: the slot right after the last allocation.
        let n = self.next_slot as usize;
        if self.bitmap[n / 32] & (1 << (n % 32)) != 0 {
            self.bitmap[n / 32] &= !(1 << (n % 32));
            self.next_slot = ((n + 1) & 255) as u16;
            self.free -= 1;
            return Some(n as u16);
        }

        for i in 0..8 {
            let k = (i + n / 32) % 8;
            let word = self.bitmap[k];
            if word != 0 {
                let j = word.trailing_zeros() as usize;
                self.bitmap[k] &= !(1 << j);
                let slot = j + k * 32;
                self.next_slot = ((slot + 1) & 255) as u16;
                self.free -= 1;
                return Some(slot as u16);
            }
        }
        None
    }

    fn deallocate(&mut self, slot: u16) {
        debug_assert!(self.bitmap[slot as usize / 32] & (1 << (slot % 32)) == 0);
        self.bitmap[slot as usize / 32] |= 1 << (slot % 32);
        self.free += 1;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    /// All 65 535 public ids of this map are taken.
    MapFull,
    /// Position outside the map bounds.
    OutOfBounds,
}

/// The entities of one map plus the spatial structures over them.
pub struct MapComposite {
    id: MapId,
    name: String,
    map: Map,
    pvp: PvpMode,
    zones: Vec<MapZone>,
    zones_w: i32,
    zones_h: i32,
    buckets: Vec<Option<Box<EntityBucket>>>,
    last_bucket: usize,
    entities: Vec<EntityId>,
}

impl MapComposite {
    pub fn new(id: MapId, name: &str, map: Map) -> Self {
        let zones_w = (map.pixel_width() + ZONE_DIAM - 1) / ZONE_DIAM;
        let zones_h = (map.pixel_height() + ZONE_DIAM - 1) / ZONE_DIAM;
        let mut zones = Vec::new();
        zones.resize_with((zones_w * zones_h) as usize, MapZone::default);
        let mut buckets: Vec<Option<Box<EntityBucket>>> = Vec::new();
        buckets.resize_with(256, || None);
        // Bucket 0 exists from the start; slot 0 is reserved so id 0 is
        // never issued.
        buckets[0] = Some(Box::new(EntityBucket::new(Some(0))));
        MapComposite {
            id,
            name: name.to_string(),
            map,
            pvp: PvpMode::default(),
            zones,
            zones_w,
            zones_h,
            buckets,
            last_bucket: 0,
            entities: Vec::new(),
        }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut Map {
        &mut self.map
    }

    pub fn pvp(&self) -> PvpMode {
        self.pvp
    }

    pub fn set_pvp(&mut self, pvp: PvpMode) {
        self.pvp = pvp;
    }

    /// Entities of this map in insertion order.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn zone_index(&self, pos: &Point) -> usize {
        let zx = (pos.x / ZONE_DIAM).clamp(0, self.zones_w - 1);
        let zy = (pos.y / ZONE_DIAM).clamp(0, self.zones_h - 1);
        (zx + zy * self.zones_w) as usize
    }

    pub fn zone_at(&self, pos: &Point) -> &MapZone {
        &self.zones[self.zone_index(pos)]
    }

    pub fn zone(&self, index: usize) -> &MapZone {
        &self.zones[index]
    }

    fn allocate_public_id(&mut self) -> Option<u16> {
        // First, try allocating from the last used bucket.
        if let Some(bucket) = self.buckets[self.last_bucket].as_mut() {
            if let Some(slot) = bucket.allocate() {
                return Some((self.last_bucket * 256) as u16 + slot);
            }
        }

        // Scan all buckets for a free slot, materializing buckets lazily.
        for i in 0..256 {
            if self.buckets[i].is_none() {
                // Slot 255 of bucket 255 would be id 0xFFFF; keep it
                // reserved.
                let reserved = if i == 255 { Some(255) } else { None };
                self.buckets[i] = Some(Box::new(EntityBucket::new(reserved)));
            }
            if let Some(slot) = self.buckets[i].as_mut().unwrap().allocate() {
                self.last_bucket = i;
                return Some((i * 256) as u16 + slot);
            }
        }
        None
    }

    fn deallocate_public_id(&mut self, public_id: u16) {
        let bucket = (public_id / 256) as usize;
        if let Some(b) = self.buckets[bucket].as_mut() {
            b.deallocate(public_id % 256);
        }
    }

    /// Add an entity at `pos`. Moving entities get a public id.
    pub fn insert(
        &mut self,
        id: EntityId,
        kind: EntityKind,
        pos: &Point,
    ) -> Result<Option<u16>, InsertError> {
        if !self.map.contains_pixel(pos) {
            return Err(InsertError::OutOfBounds);
        }
        let public_id = if is_moving(kind) {
            match self.allocate_public_id() {
                Some(pid) => Some(pid),
                None => return Err(InsertError::MapFull),
            }
        } else {
            None
        };

        let zone = self.zone_index(pos);
        self.zones[zone].insert(id, kind);
        self.entities.push(id);
        Ok(public_id)
    }

    /// Remove an entity; its public id returns to the pool.
    pub fn remove(&mut self, id: EntityId, kind: EntityKind, pos: &Point, public_id: Option<u16>) {
        let zone = self.zone_index(pos);
        self.zones[zone].remove(id, kind);
        if let Some(pid) = public_id {
            self.deallocate_public_id(pid);
        }
        if let Some(at) = self.entities.iter().position(|e| *e == id) {
            self.entities.swap_remove(at);
        }
    }

    /// Clear all `destinations` sets; runs at the start of each tick.
    pub fn clear_destinations(&mut self) {
        for zone in &mut self.zones {
            zone.destinations.clear();
        }
    }

    /// Move entities whose zone changed this tick and record each crossing
    /// in the source zone's `destinations` set.
    pub fn update_zones(&mut self, moved: &[(EntityId, EntityKind, Point, Point)]) {
        for (id, kind, old_pos, new_pos) in moved {
            let src = self.zone_index(old_pos);
            let dst = self.zone_index(new_pos);
            if src != dst {
                add_zone(&mut self.zones[src].destinations, dst);
                self.zones[src].remove(*id, *kind);
                self.zones[dst].insert(*id, *kind);
            }
        }
    }

    /// Zones whose square intersects the disk around `center`.
    pub fn fill_region(&self, region: &mut MapRegion, center: &Point, radius: i32) {
        let ax = if center.x > radius {
            (center.x - radius) / ZONE_DIAM
        } else {
            0
        };
        let ay = if center.y > radius {
            (center.y - radius) / ZONE_DIAM
        } else {
            0
        };
        let bx = ((center.x + radius) / ZONE_DIAM).min(self.zones_w - 1);
        let by = ((center.y + radius) / ZONE_DIAM).min(self.zones_h - 1);
        for y in ay..=by {
            for x in ax..=bx {
                add_zone(region, (x + y * self.zones_w) as usize);
            }
        }
    }

    /// Zones near a position: the region all plain awareness queries use.
    pub fn region_around(&self, center: &Point, radius: i32) -> MapRegion {
        let mut region = MapRegion::new();
        self.fill_region(&mut region, center, radius);
        region
    }

    /// Zones an observer must scan: around the old position, every zone
    /// those zones sent entities to this tick, and around the new position.
    /// This catches two entities crossing borders in opposite directions in
    /// the same tick, and teleports.
    pub fn region_around_player(
        &self,
        old_pos: &Point,
        new_pos: &Point,
        radius: i32,
    ) -> MapRegion {
        let mut r1 = MapRegion::new();
        self.fill_region(&mut r1, old_pos, radius);
        let mut region = r1.clone();
        for zone in &r1 {
            for dst in &self.zones[*zone].destinations {
                add_zone(&mut region, *dst);
            }
        }
        self.fill_region(&mut region, new_pos, radius);
        region
    }

    /// Zones intersecting a pixel rectangle.
    pub fn region_for_rect(&self, rect: &Rectangle) -> MapRegion {
        let mut region = MapRegion::new();
        let ax = (rect.x / ZONE_DIAM).clamp(0, self.zones_w - 1);
        let ay = (rect.y / ZONE_DIAM).clamp(0, self.zones_h - 1);
        let bx = ((rect.x + rect.w - 1) / ZONE_DIAM).clamp(0, self.zones_w - 1);
        let by = ((rect.y + rect.h - 1) / ZONE_DIAM).clamp(0, self.zones_h - 1);
        for y in ay..=by {
            for x in ax..=bx {
                add_zone(&mut region, (x + y * self.zones_w) as usize);
            }
        }
        region
    }

    /// Every entity referenced from a region, zone by zone.
    pub fn entities_in_region<'a>(
        &'a self,
        region: &'a MapRegion,
    ) -> impl Iterator<Item = EntityId> + 'a {
        region.iter().flat_map(|z| self.zones[*z].all().iter().copied())
    }

    /// The character segment of every zone in a region.
    pub fn characters_in_region<'a>(
        &'a self,
        region: &'a MapRegion,
    ) -> impl Iterator<Item = EntityId> + 'a {
        region
            .iter()
            .flat_map(|z| self.zones[*z].characters().iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    fn composite() -> MapComposite {
        // 40x40 tiles of 32px -> 1280px -> 5x5 zones.
        MapComposite::new(1, "testmap", Map::new(40, 40, 32, 32))
    }

    fn eid(n: u32) -> EntityId {
        EntityId::from_raw(n, 1)
    }

    #[test]
    fn insert_assigns_exactly_one_zone() {
        let mut m = composite();
        let id = eid(7);
        m.insert(id, EntityKind::Character, &Point::new(300, 300)).unwrap();

        let mut owners = 0;
        for z in 0..25 {
            if m.zone(z).all().contains(&id) {
                owners += 1;
            }
        }
        assert_eq!(owners, 1);
        assert!(m.zone_at(&Point::new(300, 300)).all().contains(&id));
    }

    #[test]
    fn zone_partition_keeps_characters_first() {
        let mut m = composite();
        let item = eid(1);
        let monster = eid(2);
        let character = eid(3);
        let character2 = eid(4);
        let pos = Point::new(10, 10);

        m.insert(item, EntityKind::Item, &pos).unwrap();
        m.insert(monster, EntityKind::Monster, &pos).unwrap();
        m.insert(character, EntityKind::Character, &pos).unwrap();
        m.insert(character2, EntityKind::Character, &pos).unwrap();

        let zone = m.zone_at(&pos);
        assert_eq!(zone.characters().len(), 2);
        assert!(zone.characters().contains(&character));
        assert!(zone.characters().contains(&character2));
        assert_eq!(zone.moving().len(), 3);
        assert!(zone.moving().contains(&monster));
        assert_eq!(zone.all().len(), 4);
    }

    #[test]
    fn zone_remove_respects_segments() {
        let mut m = composite();
        let pos = Point::new(10, 10);
        let ids: Vec<EntityId> = (1..=6).map(eid).collect();
        let mut pids = Vec::new();
        pids.push(m.insert(ids[0], EntityKind::Item, &pos).unwrap());
        pids.push(m.insert(ids[1], EntityKind::Monster, &pos).unwrap());
        pids.push(m.insert(ids[2], EntityKind::Character, &pos).unwrap());
        pids.push(m.insert(ids[3], EntityKind::Npc, &pos).unwrap());
        pids.push(m.insert(ids[4], EntityKind::Character, &pos).unwrap());
        pids.push(m.insert(ids[5], EntityKind::Item, &pos).unwrap());

        m.remove(ids[2], EntityKind::Character, &pos, pids[2]);
        let zone = m.zone_at(&pos);
        assert_eq!(zone.characters().len(), 1);
        assert_eq!(zone.characters()[0], ids[4]);
        assert_eq!(zone.moving().len(), 3);
        assert_eq!(zone.all().len(), 5);

        m.remove(ids[1], EntityKind::Monster, &pos, pids[1]);
        let zone = m.zone_at(&pos);
        assert_eq!(zone.characters().len(), 1);
        assert_eq!(zone.moving().len(), 2);
        assert!(!zone.all().contains(&ids[1]));
    }

    #[test]
    fn public_ids_are_unique_and_skip_reserved_values() {
        let mut m = composite();
        let mut seen = std::collections::HashSet::new();
        for n in 0..600u32 {
            let pid = m
                .insert(eid(n), EntityKind::Monster, &Point::new(5, 5))
                .unwrap()
                .expect("moving entities always get a public id");
            assert_ne!(pid, 0);
            assert_ne!(pid, 0xffff);
            assert!(seen.insert(pid), "public id {pid} issued twice");
        }
    }

    #[test]
    fn public_id_is_returned_on_removal() {
        let mut m = composite();
        let pos = Point::new(5, 5);
        let pid = m.insert(eid(1), EntityKind::Character, &pos).unwrap().unwrap();
        m.remove(eid(1), EntityKind::Character, &pos, Some(pid));
        // The freed slot becomes allocatable again; with one bucket in play
        // the id space cannot run out.
        for n in 2..2000u32 {
            let pos2 = Point::new(6, 6);
            let pid2 = m.insert(eid(n), EntityKind::Character, &pos2).unwrap().unwrap();
            m.remove(eid(n), EntityKind::Character, &pos2, Some(pid2));
        }
    }

    #[test]
    fn static_entities_get_no_public_id() {
        let mut m = composite();
        let pid = m.insert(eid(1), EntityKind::Item, &Point::new(5, 5)).unwrap();
        assert_eq!(pid, None);
    }

    #[test]
    fn insert_outside_the_map_is_rejected() {
        let mut m = composite();
        let err = m
            .insert(eid(1), EntityKind::Character, &Point::new(5000, 5))
            .unwrap_err();
        assert_eq!(err, InsertError::OutOfBounds);
    }

    #[test]
    fn fill_region_covers_the_disk_bounding_box() {
        let m = composite();
        // Radius reaching into the four zones around (256, 256).
        let region = m.region_around(&Point::new(256, 256), 64);
        assert_eq!(region, vec![0, 1, 5, 6]);

        // Clamped at the map edge.
        let region = m.region_around(&Point::new(10, 10), 64);
        assert_eq!(region, vec![0]);
    }

    #[test]
    fn region_for_rect_matches_intersecting_zones() {
        let m = composite();
        let region = m.region_for_rect(&Rectangle::new(200, 200, 120, 60));
        assert_eq!(region, vec![0, 1, 5, 6]);
        let region = m.region_for_rect(&Rectangle::new(0, 0, 100, 100));
        assert_eq!(region, vec![0]);
    }

    #[test]
    fn crossing_a_zone_border_records_the_destination() {
        let mut m = composite();
        let id = eid(9);
        let old_pos = Point::new(250, 100);
        let new_pos = Point::new(260, 100);
        m.insert(id, EntityKind::Character, &old_pos).unwrap();

        m.update_zones(&[(id, EntityKind::Character, old_pos, new_pos)]);

        let src = m.zone_index(&old_pos);
        let dst = m.zone_index(&new_pos);
        assert_ne!(src, dst);
        assert!(!m.zone(src).all().contains(&id));
        assert!(m.zone(dst).all().contains(&id));
        assert_eq!(m.zone(src).destinations(), &vec![dst]);

        m.clear_destinations();
        assert!(m.zone(src).destinations().is_empty());
    }

    #[test]
    fn around_player_region_includes_destination_zones() {
        let mut m = composite();
        // A monster leaves the observer's old area for a far zone.
        let monster = eid(2);
        let from = Point::new(250, 100);
        let to = Point::new(600, 100);
        m.insert(monster, EntityKind::Monster, &from).unwrap();
        m.update_zones(&[(monster, EntityKind::Monster, from, to)]);

        let observer_old = Point::new(200, 100);
        let observer_new = Point::new(210, 100);
        let region = m.region_around_player(&observer_old, &observer_new, 64);
        // Zone 2 (x=2) only reachable through the destinations set.
        assert!(region.contains(&m.zone_index(&to)));
    }

    #[test]
    fn entities_in_region_walks_each_zone_once() {
        let mut m = composite();
        m.insert(eid(1), EntityKind::Character, &Point::new(10, 10)).unwrap();
        m.insert(eid(2), EntityKind::Monster, &Point::new(300, 10)).unwrap();
        m.insert(eid(3), EntityKind::Item, &Point::new(10, 300)).unwrap();

        let region: MapRegion = vec![0, 1, 5];
        let found: Vec<EntityId> = m.entities_in_region(&region).collect();
        assert_eq!(found.len(), 3);

        let characters: Vec<EntityId> = m.characters_in_region(&region).collect();
        assert_eq!(characters, vec![eid(1)]);
    }
}
