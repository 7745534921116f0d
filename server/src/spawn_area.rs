//! Spawn area component: keeps a monster population topped up.

use evermire_core::point::Rectangle;

/// Game ticks per minute at the nominal 100 ms tick.
pub const TICKS_PER_MINUTE: u32 = 600;

#[derive(Clone, Debug)]
pub struct SpawnAreaComponent {
    /// Monster class to spawn.
    pub class_id: u16,
    /// Pixel rectangle monsters appear in. A dimensionless zone means the
    /// whole map.
    pub zone: Rectangle,
    pub max_beings: u32,
    /// Spawns per minute.
    pub spawn_rate: u32,
    num_beings: u32,
    next_spawn: u32,
}

impl SpawnAreaComponent {
    pub fn new(class_id: u16, zone: Rectangle, max_beings: u32, spawn_rate: u32) -> Self {
        SpawnAreaComponent {
            class_id,
            zone,
            max_beings,
            spawn_rate,
            num_beings: 0,
            next_spawn: 0,
        }
    }

    pub fn num_beings(&self) -> u32 {
        self.num_beings
    }

    /// Count down the spawn interval. Returns true when a monster should
    /// be spawned this tick; the caller reports the result back through
    /// [`SpawnAreaComponent::being_spawned`].
    pub fn update(&mut self) -> bool {
        if self.next_spawn > 0 {
            self.next_spawn -= 1;
        }
        if self.next_spawn == 0 && self.num_beings < self.max_beings && self.spawn_rate > 0 {
            // Predictable respawn intervals.
            self.next_spawn = TICKS_PER_MINUTE / self.spawn_rate;
            return true;
        }
        false
    }

    pub fn being_spawned(&mut self) {
        self.num_beings += 1;
    }

    /// Called when a spawned monster is removed from the world.
    pub fn being_removed(&mut self) {
        self.num_beings = self.num_beings.saturating_sub(1);
    }
}
