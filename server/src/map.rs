//! Tile map, blockmap, and the A* path engine.
//!
//! A map is a grid of tiles. Each tile carries one occupancy counter per
//! block class plus a derived blockmask byte; a tile is blocked for a class
//! as long as its counter is positive, so several occupants can share a
//! tile without clobbering each other's state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use bitflags::bitflags;
use evermire_core::point::{Path, Point};

/// Basic cost for moving from one tile to another in `find_path`.
pub const BASIC_COST: i32 = 100;

/// Cost of a diagonal step, ~BASIC_COST * sqrt(2).
const DIAGONAL_COST: i32 = BASIC_COST * 362 / 256;

/// Occupancy classes a tile tracks separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Wall = 0,
    Character = 1,
    Monster = 2,
}

pub const NB_BLOCKTYPES: usize = 3;

bitflags! {
    /// Blockmask bits; an entity is blocked on a tile iff
    /// `blockmask & walkmask != 0`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BlockMask: u8 {
        const WALL = 0x80;
        const CHARACTER = 0x01;
        const MONSTER = 0x02;
    }
}

impl BlockType {
    fn mask(self) -> BlockMask {
        match self {
            BlockType::Wall => BlockMask::WALL,
            BlockType::Character => BlockMask::CHARACTER,
            BlockType::Monster => BlockMask::MONSTER,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct MetaTile {
    blockmask: BlockMask,
}

/// A tile grid with per-tile occupancy counters by block class.
pub struct Map {
    width: i32,
    height: i32,
    tile_width: i32,
    tile_height: i32,
    tiles: Vec<MetaTile>,
    occupation: [Vec<i32>; NB_BLOCKTYPES],
    properties: HashMap<String, String>,
}

impl Map {
    pub fn new(width: i32, height: i32, tile_width: i32, tile_height: i32) -> Self {
        let size = (width * height) as usize;
        Map {
            width,
            height,
            tile_width,
            tile_height,
            tiles: vec![MetaTile::default(); size],
            occupation: [vec![0; size], vec![0; size], vec![0; size]],
            properties: HashMap::new(),
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn tile_width(&self) -> i32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> i32 {
        self.tile_height
    }

    /// Pixel width of the whole map.
    pub fn pixel_width(&self) -> i32 {
        self.width * self.tile_width
    }

    /// Pixel height of the whole map.
    pub fn pixel_height(&self) -> i32 {
        self.height * self.tile_height
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    pub fn contains_pixel(&self, p: &Point) -> bool {
        p.x >= 0 && p.y >= 0 && p.x < self.pixel_width() && p.y < self.pixel_height()
    }

    /// Tile coordinates of a pixel position.
    pub fn tile_at(&self, p: &Point) -> Point {
        Point::new(p.x / self.tile_width, p.y / self.tile_height)
    }

    /// Pixel center of a tile.
    pub fn tile_center(&self, tile: &Point) -> Point {
        Point::new(
            tile.x * self.tile_width + self.tile_width / 2,
            tile.y * self.tile_height + self.tile_height / 2,
        )
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// Raise the occupancy counter of `class` on a tile. The blockmask bit
    /// is set while the counter is positive.
    pub fn block_tile(&mut self, x: i32, y: i32, class: BlockType) {
        if !self.contains(x, y) {
            return;
        }
        let idx = (x + y * self.width) as usize;
        self.occupation[class as usize][idx] += 1;
        if self.occupation[class as usize][idx] > 0 {
            self.tiles[idx].blockmask |= class.mask();
        }
    }

    /// Lower the occupancy counter of `class` on a tile; the blockmask bit
    /// clears only when the counter returns to zero.
    pub fn free_tile(&mut self, x: i32, y: i32, class: BlockType) {
        if !self.contains(x, y) {
            return;
        }
        let idx = (x + y * self.width) as usize;
        debug_assert!(self.occupation[class as usize][idx] > 0);
        self.occupation[class as usize][idx] -= 1;
        if self.occupation[class as usize][idx] <= 0 {
            self.tiles[idx].blockmask &= !class.mask();
        }
    }

    pub fn occupancy(&self, x: i32, y: i32, class: BlockType) -> i32 {
        if !self.contains(x, y) {
            return 0;
        }
        self.occupation[class as usize][(x + y * self.width) as usize]
    }

    pub fn blockmask(&self, x: i32, y: i32) -> BlockMask {
        if !self.contains(x, y) {
            return BlockMask::all();
        }
        self.tiles[(x + y * self.width) as usize].blockmask
    }

    /// Whether a tile is walkable for an entity with the given walkmask.
    pub fn get_walk(&self, x: i32, y: i32, walkmask: BlockMask) -> bool {
        // You can't walk outside of the map.
        if !self.contains(x, y) {
            return false;
        }
        (self.tiles[(x + y * self.width) as usize].blockmask & walkmask).is_empty()
    }

    /// Straight-line walk check: steps one tile toward the destination per
    /// iteration and stops at the first blocked tile.
    pub fn find_simple_path(
        &self,
        start: Point,
        dest: Point,
        walkmask: BlockMask,
    ) -> Path {
        let mut path = Path::new();
        let mut pos = start;
        loop {
            pos.x += (dest.x - pos.x).signum();
            pos.y += (dest.y - pos.y).signum();
            if !self.get_walk(pos.x, pos.y, walkmask) {
                return path;
            }
            path.push_back(pos);
            if pos == dest {
                return path;
            }
        }
    }

    /// A* search over the tile grid.
    ///
    /// Returns the tile path from just after `start` to `dest`, or an empty
    /// path when no route of Gcost <= `max_cost * BASIC_COST` exists.
    /// Orthogonal steps cost `BASIC_COST + 1`; the +1 perturbation keeps two
    /// otherwise-equal paths distinguishable so the search terminates
    /// faster. Diagonal steps cost `BASIC_COST * 362 / 256` and are refused
    /// when either adjacent cardinal tile is blocked.
    pub fn find_path(
        &self,
        start: Point,
        dest: Point,
        walkmask: BlockMask,
        max_cost: i32,
    ) -> Path {
        let mut path = Path::new();

        if !self.get_walk(dest.x, dest.y, walkmask) {
            return path;
        }
        if start == dest {
            return path;
        }

        let size = (self.width * self.height) as usize;
        let mut search = SearchState {
            g_cost: vec![0; size],
            parent: vec![u32::MAX; size],
            listed: vec![WhichList::None; size],
            open: BinaryHeap::new(),
        };

        let start_idx = (start.x + start.y * self.width) as usize;
        search.open.push(Location {
            f_cost: 0,
            x: start.x,
            y: start.y,
        });
        search.listed[start_idx] = WhichList::Open;

        let mut found = false;

        while let Some(curr) = search.open.pop() {
            let curr_idx = (curr.x + curr.y * self.width) as usize;

            // A stale heap entry: already expanded with a shorter route.
            if search.listed[curr_idx] == WhichList::Closed {
                continue;
            }
            search.listed[curr_idx] = WhichList::Closed;

            for dy in -1..=1i32 {
                for dx in -1..=1i32 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let x = curr.x + dx;
                    let y = curr.y + dy;
                    if !self.contains(x, y) {
                        continue;
                    }

                    let idx = (x + y * self.width) as usize;
                    if search.listed[idx] == WhichList::Closed
                        || !(self.tiles[idx].blockmask & walkmask).is_empty()
                    {
                        continue;
                    }

                    // When taking a diagonal step, verify that the corner
                    // can be skipped.
                    if dx != 0 && dy != 0 {
                        let side1 = self.blockmask(curr.x, curr.y + dy);
                        let side2 = self.blockmask(curr.x + dx, curr.y);
                        if !((side1 | side2) & walkmask).is_empty() {
                            continue;
                        }
                    }

                    let g_cost = search.g_cost[curr_idx]
                        + if dx == 0 || dy == 0 {
                            // Demote horizontal and vertical directions so
                            // two equivalent routes cannot share an Fcost.
                            BASIC_COST + 1
                        } else {
                            DIAGONAL_COST
                        };

                    if g_cost > max_cost * BASIC_COST {
                        continue;
                    }

                    match search.listed[idx] {
                        WhichList::None => {
                            // The heuristic must never exceed the real
                            // cost; Manhattan distance is not usable here.
                            let hx = (x - dest.x).abs();
                            let hy = (y - dest.y).abs();
                            let h_cost =
                                (hx - hy).abs() * BASIC_COST + hx.min(hy) * DIAGONAL_COST;

                            search.g_cost[idx] = g_cost;
                            search.parent[idx] = curr_idx as u32;

                            if x == dest.x && y == dest.y {
                                found = true;
                            } else {
                                search.listed[idx] = WhichList::Open;
                                search.open.push(Location {
                                    f_cost: g_cost + h_cost,
                                    x,
                                    y,
                                });
                            }
                        }
                        WhichList::Open if g_cost < search.g_cost[idx] => {
                            search.g_cost[idx] = g_cost;
                            search.parent[idx] = curr_idx as u32;
                            let hx = (x - dest.x).abs();
                            let hy = (y - dest.y).abs();
                            let h_cost =
                                (hx - hy).abs() * BASIC_COST + hx.min(hy) * DIAGONAL_COST;
                            // The old entry stays in the heap and is skipped
                            // as closed when it surfaces.
                            search.open.push(Location {
                                f_cost: g_cost + h_cost,
                                x,
                                y,
                            });
                        }
                        _ => {}
                    }
                }
            }

            if found {
                break;
            }
        }

        if found {
            let mut idx = (dest.x + dest.y * self.width) as usize;
            while idx != start_idx {
                let x = idx as i32 % self.width;
                let y = idx as i32 / self.width;
                path.push_front(Point::new(x, y));
                idx = search.parent[idx] as usize;
            }
        }

        path
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WhichList {
    None,
    Open,
    Closed,
}

struct SearchState {
    g_cost: Vec<i32>,
    parent: Vec<u32>,
    listed: Vec<WhichList>,
    open: BinaryHeap<Location>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
struct Location {
    f_cost: i32,
    x: i32,
    y: i32,
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior.
        other.f_cost.cmp(&self.f_cost)
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
