//! Trigger area component: a rectangle that warps characters or runs a
//! script when beings step inside.

use std::collections::BTreeSet;

use evermire_core::point::{Point, Rectangle};

use crate::entity::EntityId;
use crate::map_composite::MapId;
use crate::script::ScriptRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerAction {
    /// Send characters to a point on a map, possibly on another shard.
    Warp { map: MapId, point: Point },
    /// Run a script callback with the entity and an argument.
    Script { callback: ScriptRef, arg: i64 },
}

#[derive(Clone, Debug)]
pub struct TriggerAreaComponent {
    pub zone: Rectangle,
    pub action: TriggerAction,
    /// When set, an entity only triggers on entry, not every tick inside.
    pub once: bool,
    inside: BTreeSet<EntityId>,
}

impl TriggerAreaComponent {
    pub fn new(zone: Rectangle, action: TriggerAction, once: bool) -> Self {
        TriggerAreaComponent {
            zone,
            action,
            once,
            inside: BTreeSet::new(),
        }
    }

    /// Feed the beings found inside the zone this tick; returns those the
    /// action fires for. With `once` set, only fresh entrants fire;
    /// otherwise everyone inside fires every tick.
    pub fn process(&mut self, inside_now: &[(EntityId, Point)]) -> Vec<EntityId> {
        let mut fired = Vec::new();
        let mut new_inside = BTreeSet::new();
        for (id, pos) in inside_now {
            if !self.zone.contains(pos) {
                continue;
            }
            new_inside.insert(*id);
            if !self.once || !self.inside.contains(id) {
                fired.push(*id);
            }
        }
        self.inside = new_inside;
        fired
    }
}
