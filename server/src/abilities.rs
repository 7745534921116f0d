//! Cooldown-gated scriptable actions on a being or a point.

use std::collections::BTreeMap;

use crate::attributes::{attr, AttributeId, AttributeMap};
use crate::script::ScriptRef;

pub type AbilityId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbilityTarget {
    Being,
    Point,
}

/// Static description of one ability.
#[derive(Clone, Debug)]
pub struct AbilityInfo {
    pub id: AbilityId,
    pub category: String,
    pub name: String,
    pub rechargeable: bool,
    /// Attribute whose modified value is added to the points every tick.
    pub recharge_attribute: AttributeId,
    /// Attribute whose modified value becomes the global cooldown on use.
    pub cooldown_attribute: AttributeId,
    pub needed_points: u32,
    /// Whether using the ability empties its points and arms the cooldown.
    pub autoconsume: bool,
    pub target: AbilityTarget,
    pub recharged_callback: Option<ScriptRef>,
    pub use_callback: Option<ScriptRef>,
}

impl AbilityInfo {
    pub fn new(id: AbilityId, category: &str, name: &str, target: AbilityTarget) -> Self {
        AbilityInfo {
            id,
            category: category.to_string(),
            name: name.to_string(),
            rechargeable: true,
            recharge_attribute: attr::ABILITY_RECHARGE,
            cooldown_attribute: attr::ABILITY_COOLDOWN,
            needed_points: 100,
            autoconsume: true,
            target,
            recharged_callback: None,
            use_callback: None,
        }
    }
}

/// All abilities the data files define.
#[derive(Debug, Default)]
pub struct AbilityRegistry {
    infos: BTreeMap<AbilityId, AbilityInfo>,
}

impl AbilityRegistry {
    pub fn new() -> Self {
        AbilityRegistry::default()
    }

    pub fn add(&mut self, info: AbilityInfo) {
        self.infos.insert(info.id, info);
    }

    pub fn get(&self, id: AbilityId) -> Option<&AbilityInfo> {
        self.infos.get(&id)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct AbilityValue {
    current_points: u32,
    /// Edge detector for the recharged callback.
    recharged_reported: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbilityEvent {
    /// Points or availability changed; clients get a status update.
    Changed(AbilityId),
    /// Points reached the needed amount; fire the recharged callback once.
    Recharged(AbilityId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseError {
    GlobalCooldown,
    NotKnown,
    NotRecharged,
    WrongTargetKind,
    NoCallback,
}

/// Outcome of a successful use: the callback the script bridge must run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UseOutcome {
    pub ability_id: AbilityId,
    pub callback: ScriptRef,
}

/// Per-entity ability state: known abilities, their points, and the global
/// cooldown shared by all of them.
#[derive(Clone, Debug, Default)]
pub struct AbilityComponent {
    abilities: BTreeMap<AbilityId, AbilityValue>,
    cooldown: u32,
}

impl AbilityComponent {
    pub fn new() -> Self {
        AbilityComponent::default()
    }

    pub fn has(&self, id: AbilityId) -> bool {
        self.abilities.contains_key(&id)
    }

    pub fn known(&self) -> impl Iterator<Item = AbilityId> + '_ {
        self.abilities.keys().copied()
    }

    pub fn points(&self, id: AbilityId) -> u32 {
        self.abilities
            .get(&id)
            .map(|v| v.current_points)
            .unwrap_or(0)
    }

    pub fn cooldown_remaining(&self) -> u32 {
        self.cooldown
    }

    /// Teach an ability. Returns false when it was already known or does
    /// not exist.
    pub fn give(&mut self, registry: &AbilityRegistry, id: AbilityId, points: u32) -> bool {
        if self.abilities.contains_key(&id) {
            return false;
        }
        if registry.get(id).is_none() {
            log::error!("tried to give nonexistent ability {id}");
            return false;
        }
        self.abilities.insert(
            id,
            AbilityValue {
                current_points: points,
                recharged_reported: false,
            },
        );
        true
    }

    /// Forget an ability.
    pub fn take(&mut self, id: AbilityId) -> bool {
        self.abilities.remove(&id).is_some()
    }

    pub fn set_points(&mut self, id: AbilityId, points: u32) -> bool {
        match self.abilities.get_mut(&id) {
            Some(value) => {
                value.current_points = points;
                value.recharged_reported = false;
                true
            }
            None => false,
        }
    }

    /// Per-tick recharge. Points grow by the entity's recharge attribute;
    /// crossing the needed amount reports `Recharged` exactly once.
    pub fn update(
        &mut self,
        registry: &AbilityRegistry,
        attributes: &AttributeMap,
    ) -> Vec<AbilityEvent> {
        let mut events = Vec::new();
        if self.cooldown > 0 {
            self.cooldown -= 1;
        }
        for (id, value) in &mut self.abilities {
            let Some(info) = registry.get(*id) else {
                continue;
            };
            if !info.rechargeable {
                continue;
            }
            if value.current_points < info.needed_points {
                let speed = attributes.modified(info.recharge_attribute).max(0.0) as u32;
                if speed > 0 {
                    value.current_points =
                        (value.current_points + speed).min(info.needed_points);
                    events.push(AbilityEvent::Changed(*id));
                }
            }
            if value.current_points >= info.needed_points && !value.recharged_reported {
                value.recharged_reported = true;
                if info.recharged_callback.is_some() {
                    events.push(AbilityEvent::Recharged(*id));
                }
            }
        }
        events
    }

    pub fn use_on_being(
        &mut self,
        registry: &AbilityRegistry,
        attributes: &AttributeMap,
        id: AbilityId,
    ) -> Result<UseOutcome, UseError> {
        self.use_checked(registry, attributes, id, AbilityTarget::Being)
    }

    pub fn use_on_point(
        &mut self,
        registry: &AbilityRegistry,
        attributes: &AttributeMap,
        id: AbilityId,
    ) -> Result<UseOutcome, UseError> {
        self.use_checked(registry, attributes, id, AbilityTarget::Point)
    }

    fn use_checked(
        &mut self,
        registry: &AbilityRegistry,
        attributes: &AttributeMap,
        id: AbilityId,
        target: AbilityTarget,
    ) -> Result<UseOutcome, UseError> {
        if self.cooldown > 0 {
            return Err(UseError::GlobalCooldown);
        }
        let info = registry.get(id).ok_or(UseError::NotKnown)?;
        let current_points = self
            .abilities
            .get(&id)
            .ok_or(UseError::NotKnown)?
            .current_points;
        if info.rechargeable && current_points < info.needed_points {
            log::info!(
                "ability {}/{} used while not recharged ({}/{})",
                info.category,
                info.name,
                current_points,
                info.needed_points
            );
            return Err(UseError::NotRecharged);
        }
        if info.target != target {
            return Err(UseError::WrongTargetKind);
        }
        let callback = match info.use_callback {
            Some(callback) => callback,
            None => {
                log::warn!(
                    "no use callback for ability {}/{}, ignoring",
                    info.category,
                    info.name
                );
                return Err(UseError::NoCallback);
            }
        };

        if info.autoconsume {
            if let Some(value) = self.abilities.get_mut(&id) {
                value.current_points = 0;
                value.recharged_reported = false;
            }
            // A minimum of one tick prevents client sync issues.
            let cooldown = attributes.modified(info.cooldown_attribute).max(0.0) as u32;
            self.cooldown = cooldown.max(1);
        }

        Ok(UseOutcome {
            ability_id: id,
            callback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeSchema;

    fn registry() -> AbilityRegistry {
        let mut registry = AbilityRegistry::new();
        let mut heal = AbilityInfo::new(1, "magic", "heal", AbilityTarget::Being);
        heal.needed_points = 10;
        heal.use_callback = Some(ScriptRef::new(101));
        heal.recharged_callback = Some(ScriptRef::new(102));
        registry.add(heal);

        let mut quake = AbilityInfo::new(2, "magic", "quake", AbilityTarget::Point);
        quake.needed_points = 10;
        quake.use_callback = Some(ScriptRef::new(103));
        registry.add(quake);
        registry
    }

    fn charged_attributes(recharge: f64, cooldown: f64) -> AttributeMap {
        let schema = AttributeSchema::game_default();
        let mut attributes = AttributeMap::new();
        attributes.set_base(&schema, attr::ABILITY_RECHARGE, recharge);
        attributes.set_base(&schema, attr::ABILITY_COOLDOWN, cooldown);
        attributes
    }

    #[test]
    fn give_take_and_unknown_abilities() {
        let registry = registry();
        let mut component = AbilityComponent::new();
        assert!(component.give(&registry, 1, 10));
        assert!(!component.give(&registry, 1, 10));
        assert!(!component.give(&registry, 99, 0));
        assert!(component.has(1));
        assert!(component.take(1));
        assert!(!component.take(1));
    }

    #[test]
    fn successful_use_consumes_points_and_arms_the_cooldown() {
        let registry = registry();
        let attributes = charged_attributes(1.0, 5.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 10);

        let outcome = component
            .use_on_being(&registry, &attributes, 1)
            .expect("charged ability must fire");
        assert_eq!(outcome.callback, ScriptRef::new(101));
        assert_eq!(component.points(1), 0);
        assert_eq!(component.cooldown_remaining(), 5);
    }

    #[test]
    fn global_cooldown_blocks_every_ability() {
        let registry = registry();
        let attributes = charged_attributes(0.0, 5.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 10);
        component.give(&registry, 2, 10);

        component.use_on_being(&registry, &attributes, 1).unwrap();
        assert_eq!(
            component.use_on_point(&registry, &attributes, 2),
            Err(UseError::GlobalCooldown)
        );
    }

    #[test]
    fn cooldown_is_at_least_one_tick() {
        let registry = registry();
        let attributes = charged_attributes(0.0, 0.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 10);
        component.use_on_being(&registry, &attributes, 1).unwrap();
        assert_eq!(component.cooldown_remaining(), 1);
    }

    #[test]
    fn wrong_target_kind_is_rejected_without_cost() {
        let registry = registry();
        let attributes = charged_attributes(0.0, 5.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 2, 10);
        assert_eq!(
            component.use_on_being(&registry, &attributes, 2),
            Err(UseError::WrongTargetKind)
        );
        assert_eq!(component.points(2), 10);
        assert_eq!(component.cooldown_remaining(), 0);
    }

    #[test]
    fn uncharged_ability_is_rejected() {
        let registry = registry();
        let attributes = charged_attributes(0.0, 5.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 3);
        assert_eq!(
            component.use_on_being(&registry, &attributes, 1),
            Err(UseError::NotRecharged)
        );
    }

    #[test]
    fn recharge_reports_recharged_exactly_once() {
        let registry = registry();
        let attributes = charged_attributes(4.0, 5.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 0);

        let mut recharged_events = 0;
        for _ in 0..10 {
            for event in component.update(&registry, &attributes) {
                if event == AbilityEvent::Recharged(1) {
                    recharged_events += 1;
                }
            }
        }
        assert_eq!(recharged_events, 1);
        assert_eq!(component.points(1), 10);
    }

    #[test]
    fn using_resets_the_recharged_edge_detector() {
        let registry = registry();
        let attributes = charged_attributes(10.0, 1.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 10);
        // Consume, then recharge again: a second Recharged event must fire.
        component.use_on_being(&registry, &attributes, 1).unwrap();
        let mut recharged_events = 0;
        for _ in 0..5 {
            for event in component.update(&registry, &attributes) {
                if event == AbilityEvent::Recharged(1) {
                    recharged_events += 1;
                }
            }
        }
        assert_eq!(recharged_events, 1);
    }

    #[test]
    fn update_ticks_down_the_global_cooldown() {
        let registry = registry();
        let attributes = charged_attributes(0.0, 3.0);
        let mut component = AbilityComponent::new();
        component.give(&registry, 1, 10);
        component.use_on_being(&registry, &attributes, 1).unwrap();
        assert_eq!(component.cooldown_remaining(), 3);
        component.update(&registry, &attributes);
        component.update(&registry, &attributes);
        component.update(&registry, &attributes);
        assert_eq!(component.cooldown_remaining(), 0);
    }
}
