//! Combat component and damage resolution.

use evermire_core::point::Point;
use evermire_core::protocol::{BeingAction, DamageType, EntityKind, PvpMode};
use rand::Rng;

use crate::actor::{ActorComponent, UpdateFlags};
use crate::attack::{Attacks, Damage};
use crate::attributes::{attr, AttributeSchema};
use crate::being::{BeingComponent, TimerId};
use crate::entity::EntityId;

/// Combat state of one entity: its current target and its attack list.
#[derive(Clone, Debug, Default)]
pub struct CombatComponent {
    target: Option<EntityId>,
    pub attacks: Attacks,
}

impl CombatComponent {
    pub fn new() -> Self {
        CombatComponent::default()
    }

    pub fn target(&self) -> Option<EntityId> {
        self.target
    }

    pub fn set_target(&mut self, target: EntityId) {
        self.target = Some(target);
    }

    pub fn clear_target(&mut self) {
        self.target = None;
    }
}

/// Result of applying one damage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttackOutcome {
    pub hp_loss: u32,
    pub died: bool,
}

/// Range gate: the attack reaches iff the squared distance is within
/// `(range + attacker size)^2`.
pub fn target_in_range(
    attacker_pos: &Point,
    attacker_size: i32,
    target_pos: &Point,
    range: u16,
) -> bool {
    let max_dist = range as i64 + attacker_size as i64;
    attacker_pos.dist_squared(target_pos) <= max_dist * max_dist
}

/// Character-on-character violence needs the map's consent.
pub fn pvp_forbids(pvp: PvpMode, attacker_kind: EntityKind, target_kind: EntityKind) -> bool {
    pvp == PvpMode::None
        && attacker_kind == EntityKind::Character
        && target_kind == EntityKind::Character
}

/// Take a damage structure, compute the real damage from the target's
/// stats, deduct it from the hit points and record the hit for the
/// awareness pass.
pub fn resolve_damage<R: Rng>(
    schema: &AttributeSchema,
    rng: &mut R,
    being: &mut BeingComponent,
    actor: &mut ActorComponent,
    damage: &Damage,
    hp_regen_break: i32,
) -> AttackOutcome {
    let mut hp_loss: f64 = damage.base as f64;
    if damage.delta > 0 {
        hp_loss += rng.gen_range(0..=damage.delta as u32) as f64;
    }

    match damage.damage_type {
        DamageType::Physical => {
            let dodge = being.attributes.modified(attr::DODGE).max(0.0) as u32;
            let dodged = !damage.true_strike
                && rng.gen_range(0..=dodge) > rng.gen_range(0..=damage.cth as u32);
            if dodged {
                hp_loss = 0.0;
            } else {
                let defense = being.attributes.modified(attr::DEFENSE).max(0.0);
                hp_loss *= 1.0 - (0.0159375 * defense) / (1.0 + 0.017 * defense);
                let jitter_cap = (hp_loss / 16.0) as u32;
                hp_loss += rng.gen_range(0..=jitter_cap) as f64;
            }
        }
        DamageType::Magical => {
            let vulnerability_id = attr::VULN_BASE + damage.element as u16;
            let vulnerability = if being.attributes.has(vulnerability_id) {
                being.attributes.modified(vulnerability_id)
            } else {
                1.0
            };
            hp_loss *= vulnerability;
        }
        DamageType::Direct => {}
        DamageType::Other => {
            log::warn!("unknown damage type {:?}", damage.damage_type);
            hp_loss = 0.0;
        }
    }

    let hp_loss = hp_loss.max(0.0) as u32;
    let mut died = false;
    if hp_loss > 0 {
        let hp = being.attributes.base(attr::HP);
        being
            .attributes
            .set_base(schema, attr::HP, hp - hp_loss as f64);
        being.push_hit(hp_loss);
        actor.raise_update_flags(UpdateFlags::DAMAGED | UpdateFlags::HEALTH_CHANGE);
        if hp_regen_break > 0 {
            being.set_timer_soft(TimerId::HpRegen, hp_regen_break);
        }
        if being.attributes.base(attr::HP) <= 0.0 {
            died = true;
        }
    }

    AttackOutcome { hp_loss, died }
}

/// Whether `target` is a legal victim at all, position checks aside.
pub fn target_alive_and_able(
    target_being: Option<&BeingComponent>,
    target_can_fight: bool,
) -> bool {
    match target_being {
        Some(being) => being.action() != BeingAction::Dead && target_can_fight,
        None => false,
    }
}
