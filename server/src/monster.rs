//! Monster classes and the monster component: aggression, kill-steal
//! ownership, experience attribution and drops.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;

use crate::attack::AttackInfo;
use crate::attributes::AttributeId;
use crate::entity::EntityId;

/// Time in game ticks until ownership of a monster can change.
pub const KILLSTEAL_PROTECTION_TIME: i32 = 100;

/// Time in game ticks a dead monster lingers before it is removed.
pub const DECAY_TIME: i32 = 50;

/// One possible drop with its probability in parts per 10 000.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonsterDrop {
    pub item_id: u16,
    pub probability: u16,
}

/// Static description of a monster species, loaded from the data files.
#[derive(Clone, Debug)]
pub struct MonsterClass {
    pub id: u16,
    pub name: String,
    /// Base attribute values applied to freshly spawned monsters.
    pub attributes: BTreeMap<AttributeId, f64>,
    pub attacks: Vec<AttackInfo>,
    pub size: i32,
    /// Experience reward for killing the monster.
    pub exp: i32,
    /// Whether the monster attacks without being attacked first.
    pub aggressive: bool,
    /// Range in pixels in which the monster searches for enemies.
    pub track_range: i32,
    /// Range in pixels in which the monster strolls when idle.
    pub stroll_range: i32,
    /// Preferred combat distance in pixels.
    pub attack_distance: i32,
    drops: Vec<MonsterDrop>,
}

impl MonsterClass {
    pub fn new(id: u16, name: &str) -> Self {
        MonsterClass {
            id,
            name: name.to_string(),
            attributes: BTreeMap::new(),
            attacks: Vec::new(),
            size: 8,
            exp: 0,
            aggressive: false,
            track_range: 200,
            stroll_range: 96,
            attack_distance: 32,
            drops: Vec::new(),
        }
    }

    pub fn add_drop(&mut self, item_id: u16, probability: u16) {
        self.drops.push(MonsterDrop {
            item_id,
            probability,
        });
    }

    /// Randomly select a drop, or none.
    pub fn random_drop<R: Rng>(&self, rng: &mut R) -> Option<u16> {
        for drop in &self.drops {
            if rng.gen_range(0..10_000) < drop.probability as u32 {
                return Some(drop.item_id);
            }
        }
        None
    }
}

/// Registry of all monster classes.
#[derive(Debug, Default)]
pub struct MonsterRegistry {
    classes: BTreeMap<u16, MonsterClass>,
}

impl MonsterRegistry {
    pub fn new() -> Self {
        MonsterRegistry::default()
    }

    pub fn add(&mut self, class: MonsterClass) {
        self.classes.insert(class.id, class);
    }

    pub fn get(&self, id: u16) -> Option<&MonsterClass> {
        self.classes.get(&id)
    }
}

/// Share of the experience for one receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpShare {
    pub receiver: EntityId,
    pub skill: u16,
    pub exp: i32,
}

/// Dynamic monster state.
#[derive(Clone, Debug)]
pub struct MonsterComponent {
    pub class_id: u16,
    /// Hate per target; the angriest-at target is attacked first.
    anger: BTreeMap<EntityId, i32>,
    /// Kill-steal protection: while the window runs, only the owner and
    /// its helpers receive experience.
    pub owner: Option<EntityId>,
    /// The spawn area this monster came from, so its slot reopens on
    /// removal.
    pub spawner: Option<EntityId>,
    /// Damage dealt per attacker and skill, for experience splitting.
    contributions: BTreeMap<EntityId, BTreeMap<u16, u32>>,
}

impl MonsterComponent {
    pub fn new(class_id: u16) -> Self {
        MonsterComponent {
            class_id,
            anger: BTreeMap::new(),
            owner: None,
            spawner: None,
            contributions: BTreeMap::new(),
        }
    }

    pub fn add_anger(&mut self, target: EntityId, amount: i32) {
        *self.anger.entry(target).or_insert(0) += amount;
    }

    pub fn forget_target(&mut self, target: EntityId) {
        self.anger.remove(&target);
    }

    pub fn anger_toward(&self, target: EntityId) -> i32 {
        self.anger.get(&target).copied().unwrap_or(0)
    }

    /// The most hated target, ties broken by lower entity id.
    pub fn angriest_target(&self) -> Option<EntityId> {
        self.anger
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id)
    }

    /// Record damage for experience attribution and claim ownership when
    /// unowned. Anger grows with the damage.
    pub fn record_damage(&mut self, source: EntityId, skill: u16, amount: u32) {
        *self
            .contributions
            .entry(source)
            .or_default()
            .entry(skill)
            .or_insert(0) += amount;
        self.add_anger(source, amount as i32);
        if self.owner.is_none() {
            self.owner = Some(source);
        }
    }

    /// Receivers allowed to gain experience: everyone when unowned, the
    /// owner alone while kill-steal protection holds.
    pub fn legal_exp_receivers(&self, protection_running: bool) -> BTreeSet<EntityId> {
        if protection_running {
            self.owner.into_iter().collect()
        } else {
            self.contributions.keys().copied().collect()
        }
    }

    /// Split the class experience among the legal receivers, proportional
    /// to the damage each contributed with each skill.
    pub fn split_exp(&self, class_exp: i32, protection_running: bool) -> Vec<ExpShare> {
        let legal = self.legal_exp_receivers(protection_running);
        let total_damage: u32 = self
            .contributions
            .iter()
            .filter(|(receiver, _)| legal.contains(receiver))
            .flat_map(|(_, skills)| skills.values())
            .sum();
        if total_damage == 0 || class_exp <= 0 {
            return Vec::new();
        }
        let mut shares = Vec::new();
        for (receiver, skills) in &self.contributions {
            if !legal.contains(receiver) {
                continue;
            }
            for (skill, damage) in skills {
                let exp =
                    (class_exp as i64 * *damage as i64 / total_damage as i64) as i32;
                if exp > 0 {
                    shares.push(ExpShare {
                        receiver: *receiver,
                        skill: *skill,
                        exp,
                    });
                }
            }
        }
        shares
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eid(n: u32) -> EntityId {
        EntityId::from_raw(n, 1)
    }

    #[test]
    fn anger_accumulates_and_picks_the_angriest() {
        let mut monster = MonsterComponent::new(1);
        assert_eq!(monster.angriest_target(), None);
        monster.add_anger(eid(1), 5);
        monster.add_anger(eid(2), 9);
        monster.add_anger(eid(1), 3);
        assert_eq!(monster.anger_toward(eid(1)), 8);
        assert_eq!(monster.angriest_target(), Some(eid(2)));

        monster.forget_target(eid(2));
        assert_eq!(monster.angriest_target(), Some(eid(1)));
    }

    #[test]
    fn first_attacker_claims_ownership() {
        let mut monster = MonsterComponent::new(1);
        monster.record_damage(eid(5), 1, 10);
        monster.record_damage(eid(6), 1, 50);
        assert_eq!(monster.owner, Some(eid(5)));
    }

    #[test]
    fn protection_restricts_exp_to_the_owner() {
        let mut monster = MonsterComponent::new(1);
        monster.record_damage(eid(1), 10, 30);
        monster.record_damage(eid(2), 10, 70);

        let protected = monster.legal_exp_receivers(true);
        assert_eq!(protected.len(), 1);
        assert!(protected.contains(&eid(1)));

        let open = monster.legal_exp_receivers(false);
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn exp_splits_proportionally_to_damage() {
        let mut monster = MonsterComponent::new(1);
        monster.record_damage(eid(1), 10, 30);
        monster.record_damage(eid(2), 20, 70);

        let shares = monster.split_exp(100, false);
        assert_eq!(shares.len(), 2);
        let share1 = shares.iter().find(|s| s.receiver == eid(1)).unwrap();
        let share2 = shares.iter().find(|s| s.receiver == eid(2)).unwrap();
        assert_eq!(share1.exp, 30);
        assert_eq!(share1.skill, 10);
        assert_eq!(share2.exp, 70);
        assert_eq!(share2.skill, 20);
    }

    #[test]
    fn exp_split_under_protection_gives_the_owner_everything() {
        let mut monster = MonsterComponent::new(1);
        monster.record_damage(eid(1), 10, 25);
        monster.record_damage(eid(2), 10, 75);
        let shares = monster.split_exp(40, true);
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].receiver, eid(1));
        assert_eq!(shares[0].exp, 40);
    }

    #[test]
    fn no_damage_means_no_exp() {
        let monster = MonsterComponent::new(1);
        assert!(monster.split_exp(100, false).is_empty());
    }

    #[test]
    fn random_drop_respects_probabilities() {
        let mut class = MonsterClass::new(1, "maggot");
        class.add_drop(100, 10_000); // always
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(class.random_drop(&mut rng), Some(100));

        let mut never = MonsterClass::new(2, "ghost");
        never.add_drop(200, 0);
        assert_eq!(never.random_drop(&mut rng), None);
        assert_eq!(MonsterClass::new(3, "empty").random_drop(&mut rng), None);
    }
}
