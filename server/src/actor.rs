//! Actor component: anything with a position on a map.

use bitflags::bitflags;
use evermire_core::point::Point;

use crate::map::{BlockMask, BlockType};

bitflags! {
    /// Dirty bits raised during a tick and consumed by the awareness pass.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UpdateFlags: u16 {
        /// Being moved or was teleported.
        const NEW_DESTINATION = 0x0001;
        /// Action state changed.
        const ACTION_CHANGE = 0x0002;
        /// Facing direction changed.
        const DIRECTION_CHANGE = 0x0004;
        /// Health changed.
        const HEALTH_CHANGE = 0x0008;
        /// Took at least one hit this tick.
        const DAMAGED = 0x0010;
        /// Performed an attack this tick.
        const ATTACK = 0x0020;
        /// Looks (hair, equipment sprite) changed.
        const LOOKS_CHANGE = 0x0040;
        /// Used an ability on a being.
        const ABILITY_ON_BEING = 0x0080;
        /// Used an ability on a point.
        const ABILITY_ON_POINT = 0x0100;
        /// Said something out loud.
        const SAY = 0x0200;
    }
}

/// World position, collision size and the per-map wire identity.
#[derive(Clone, Debug)]
pub struct ActorComponent {
    pos: Point,
    old_pos: Point,
    /// Collision radius in pixels.
    pub size: i32,
    /// 16-bit id unique per map, used in client-facing messages.
    pub public_id: u16,
    /// Which block classes impede this actor.
    pub walkmask: BlockMask,
    /// How this actor occupies tiles, if at all.
    pub block_type: Option<BlockType>,
    update_flags: UpdateFlags,
}

impl Default for ActorComponent {
    fn default() -> Self {
        ActorComponent {
            pos: Point::default(),
            old_pos: Point::default(),
            size: 0,
            public_id: 0,
            walkmask: BlockMask::empty(),
            block_type: None,
            update_flags: UpdateFlags::empty(),
        }
    }
}

impl ActorComponent {
    pub fn new(pos: Point, size: i32, walkmask: BlockMask, block_type: Option<BlockType>) -> Self {
        ActorComponent {
            pos,
            old_pos: pos,
            size,
            public_id: 0,
            walkmask,
            block_type,
            update_flags: UpdateFlags::empty(),
        }
    }

    pub fn position(&self) -> Point {
        self.pos
    }

    /// Position at the start of the current tick.
    pub fn old_position(&self) -> Point {
        self.old_pos
    }

    pub fn set_position(&mut self, pos: Point) {
        self.pos = pos;
    }

    /// Fold the current position into the old one; runs once per tick after
    /// the awareness pass.
    pub fn commit_position(&mut self) {
        self.old_pos = self.pos;
    }

    pub fn raise_update_flags(&mut self, flags: UpdateFlags) {
        self.update_flags |= flags;
    }

    pub fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }

    pub fn clear_update_flags(&mut self) {
        self.update_flags = UpdateFlags::empty();
    }
}
