//! Layered, stackable attribute modifiers with recompute over a dependency
//! graph.
//!
//! Which layers an attribute has, and which attributes derive from which,
//! is fixed at startup in an [`AttributeSchema`]; a cycle in the declared
//! dependencies is a loading error. At runtime each being carries an
//! [`AttributeMap`] of live values, and every mutation goes through
//! `set_base` / `add_modifier` / `remove_modifiers`, which recompute the
//! attribute and its dependents iteratively and report every attribute
//! whose modified value actually changed.

use std::collections::BTreeMap;

/// Numeric attribute identity, shared with the wire and the database.
pub type AttributeId = u16;

/// Well-known attribute ids.
pub mod attr {
    use super::AttributeId;

    pub const STRENGTH: AttributeId = 1;
    pub const AGILITY: AttributeId = 2;
    pub const VITALITY: AttributeId = 3;
    pub const INTELLIGENCE: AttributeId = 4;
    pub const DEXTERITY: AttributeId = 5;
    pub const WILLPOWER: AttributeId = 6;

    pub const HP: AttributeId = 16;
    pub const MAX_HP: AttributeId = 17;
    pub const HP_REGEN: AttributeId = 18;
    pub const DODGE: AttributeId = 20;
    pub const DEFENSE: AttributeId = 21;
    /// Movement speed in pixels per tick.
    pub const SPEED: AttributeId = 22;
    /// Global ability cooldown, in ticks.
    pub const ABILITY_COOLDOWN: AttributeId = 23;
    /// Ability recharge speed, points per tick.
    pub const ABILITY_RECHARGE: AttributeId = 24;

    /// Elemental vulnerability block; actual id is `VULN_BASE + element`.
    /// Value 1.0 means neutral scaling.
    pub const VULN_BASE: AttributeId = 32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackType {
    Stackable,
    NonStackable,
    NonStackableBonus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyType {
    Additive,
    Multiplicative,
}

/// One modifier layer an attribute accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModifierLayer {
    pub stack: StackType,
    pub apply: ApplyType,
}

/// Conventional layer indices used by the default schema.
pub const LAYER_ADD: usize = 0;
pub const LAYER_MULT: usize = 1;
pub const LAYER_REPLACE: usize = 2;
pub const LAYER_BONUS: usize = 3;

/// A live modifier. `duration` is in ticks; zero means permanent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Modifier {
    pub value: f64,
    pub source_id: u32,
    pub duration: u32,
}

/// How a derived attribute computes its base from another attribute's
/// modified value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DerivedFormula {
    Scaled {
        source: AttributeId,
        factor: f64,
        offset: f64,
    },
}

impl DerivedFormula {
    fn source(&self) -> AttributeId {
        match self {
            DerivedFormula::Scaled { source, .. } => *source,
        }
    }

    fn eval(&self, source_modified: f64) -> f64 {
        match self {
            DerivedFormula::Scaled { factor, offset, .. } => source_modified * factor + offset,
        }
    }
}

#[derive(Clone, Debug)]
struct AttributeSpec {
    layers: Vec<ModifierLayer>,
    derived: Option<DerivedFormula>,
    dependents: Vec<AttributeId>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SchemaError {
    /// The declared dependencies contain a cycle through this attribute.
    DependencyCycle(AttributeId),
    /// A derived attribute references an undeclared source.
    UnknownSource(AttributeId),
}

/// Immutable attribute description set, built once at startup.
pub struct AttributeSchema {
    specs: BTreeMap<AttributeId, AttributeSpec>,
}

pub struct AttributeSchemaBuilder {
    specs: BTreeMap<AttributeId, AttributeSpec>,
}

impl AttributeSchemaBuilder {
    pub fn attribute(mut self, id: AttributeId, layers: &[ModifierLayer]) -> Self {
        self.specs.insert(
            id,
            AttributeSpec {
                layers: layers.to_vec(),
                derived: None,
                dependents: Vec::new(),
            },
        );
        self
    }

    pub fn derived(mut self, id: AttributeId, formula: DerivedFormula) -> Self {
        if let Some(spec) = self.specs.get_mut(&id) {
            spec.derived = Some(formula);
        }
        self
    }

    pub fn build(mut self) -> Result<AttributeSchema, SchemaError> {
        // Wire up dependent lists from the derivation formulas.
        let derived: Vec<(AttributeId, AttributeId)> = self
            .specs
            .iter()
            .filter_map(|(id, spec)| spec.derived.as_ref().map(|f| (f.source(), *id)))
            .collect();
        for (source, dependent) in &derived {
            let spec = self
                .specs
                .get_mut(source)
                .ok_or(SchemaError::UnknownSource(*dependent))?;
            spec.dependents.push(*dependent);
        }

        // Kahn's algorithm: every attribute must be orderable.
        let mut in_degree: BTreeMap<AttributeId, usize> = self
            .specs
            .iter()
            .map(|(id, spec)| (*id, usize::from(spec.derived.is_some())))
            .collect();
        let mut queue: Vec<AttributeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut ordered = 0;
        while let Some(id) = queue.pop() {
            ordered += 1;
            for dep in &self.specs[&id].dependents {
                let d = in_degree.get_mut(dep).expect("dependent is declared");
                *d -= 1;
                if *d == 0 {
                    queue.push(*dep);
                }
            }
        }
        if ordered != self.specs.len() {
            let cyclic = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .unwrap_or_default();
            return Err(SchemaError::DependencyCycle(cyclic));
        }

        Ok(AttributeSchema { specs: self.specs })
    }
}

/// The standard four layers every attribute accepts in the default schema.
pub const STANDARD_LAYERS: [ModifierLayer; 4] = [
    ModifierLayer {
        stack: StackType::Stackable,
        apply: ApplyType::Additive,
    },
    ModifierLayer {
        stack: StackType::Stackable,
        apply: ApplyType::Multiplicative,
    },
    ModifierLayer {
        stack: StackType::NonStackable,
        apply: ApplyType::Additive,
    },
    ModifierLayer {
        stack: StackType::NonStackableBonus,
        apply: ApplyType::Additive,
    },
];

impl AttributeSchema {
    pub fn builder() -> AttributeSchemaBuilder {
        AttributeSchemaBuilder {
            specs: BTreeMap::new(),
        }
    }

    /// The built-in attribute set used by the game service.
    pub fn game_default() -> AttributeSchema {
        let mut builder = AttributeSchema::builder();
        for id in [
            attr::STRENGTH,
            attr::AGILITY,
            attr::VITALITY,
            attr::INTELLIGENCE,
            attr::DEXTERITY,
            attr::WILLPOWER,
            attr::HP,
            attr::MAX_HP,
            attr::HP_REGEN,
            attr::DODGE,
            attr::DEFENSE,
            attr::SPEED,
            attr::ABILITY_COOLDOWN,
            attr::ABILITY_RECHARGE,
        ] {
            builder = builder.attribute(id, &STANDARD_LAYERS);
        }
        for element in 0..9u16 {
            builder = builder.attribute(attr::VULN_BASE + element, &STANDARD_LAYERS);
        }
        builder
            .derived(
                attr::MAX_HP,
                DerivedFormula::Scaled {
                    source: attr::VITALITY,
                    factor: 10.0,
                    offset: 10.0,
                },
            )
            .derived(
                attr::DODGE,
                DerivedFormula::Scaled {
                    source: attr::AGILITY,
                    factor: 1.0,
                    offset: 0.0,
                },
            )
            .derived(
                attr::DEFENSE,
                DerivedFormula::Scaled {
                    source: attr::VITALITY,
                    factor: 0.5,
                    offset: 0.0,
                },
            )
            .derived(
                attr::SPEED,
                DerivedFormula::Scaled {
                    source: attr::AGILITY,
                    factor: 0.5,
                    offset: 2.0,
                },
            )
            .build()
            .expect("the built-in schema is acyclic")
    }

    pub fn has_attribute(&self, id: AttributeId) -> bool {
        self.specs.contains_key(&id)
    }

    fn layers(&self, id: AttributeId) -> &[ModifierLayer] {
        self.specs
            .get(&id)
            .map(|s| s.layers.as_slice())
            .unwrap_or(&[])
    }

    fn dependents(&self, id: AttributeId) -> &[AttributeId] {
        self.specs
            .get(&id)
            .map(|s| s.dependents.as_slice())
            .unwrap_or(&[])
    }

    fn formula(&self, id: AttributeId) -> Option<&DerivedFormula> {
        self.specs.get(&id).and_then(|s| s.derived.as_ref())
    }
}

/// One live attribute: base value, computed value, and the modifiers of
/// each layer.
#[derive(Clone, Debug, Default)]
pub struct Attribute {
    base: f64,
    modified: f64,
    layers: Vec<Vec<Modifier>>,
}

impl Attribute {
    fn new(base: f64, layer_count: usize) -> Self {
        Attribute {
            base,
            modified: base,
            layers: vec![Vec::new(); layer_count],
        }
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn modified(&self) -> f64 {
        self.modified
    }

    /// Apply all live modifiers to the base, layer by layer. Returns true
    /// when the modified value changed.
    fn recompute(&mut self, layers: &[ModifierLayer]) -> bool {
        let mut value = self.base;
        for (index, layer) in layers.iter().enumerate() {
            let mods = match self.layers.get(index) {
                Some(m) => m,
                None => continue,
            };
            match layer.stack {
                StackType::Stackable => match layer.apply {
                    ApplyType::Additive => {
                        value += mods.iter().map(|m| m.value).sum::<f64>();
                    }
                    ApplyType::Multiplicative => {
                        value *= mods.iter().map(|m| m.value).product::<f64>();
                    }
                },
                StackType::NonStackable => {
                    if let Some(max) = mods.iter().map(|m| m.value).reduce(f64::max) {
                        value = max;
                    }
                }
                StackType::NonStackableBonus => {
                    if let Some(max) = mods.iter().map(|m| m.value).reduce(f64::max) {
                        value += max;
                    }
                }
            }
        }
        let changed = value != self.modified;
        self.modified = value;
        changed
    }
}

/// The attribute table of one being.
#[derive(Clone, Debug, Default)]
pub struct AttributeMap {
    attributes: BTreeMap<AttributeId, Attribute>,
    /// Set while any attribute carries a duration-bound modifier, so the
    /// per-tick expiry scan can be skipped for most beings.
    has_expiring: bool,
}

impl AttributeMap {
    pub fn new() -> Self {
        AttributeMap::default()
    }

    pub fn has(&self, id: AttributeId) -> bool {
        self.attributes.contains_key(&id)
    }

    pub fn get(&self, id: AttributeId) -> Option<&Attribute> {
        self.attributes.get(&id)
    }

    pub fn base(&self, id: AttributeId) -> f64 {
        self.attributes.get(&id).map(|a| a.base()).unwrap_or(0.0)
    }

    pub fn modified(&self, id: AttributeId) -> f64 {
        self.attributes
            .get(&id)
            .map(|a| a.modified())
            .unwrap_or(0.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = AttributeId> + '_ {
        self.attributes.keys().copied()
    }

    fn ensure(&mut self, schema: &AttributeSchema, id: AttributeId) -> &mut Attribute {
        let layer_count = schema.layers(id).len();
        self.attributes
            .entry(id)
            .or_insert_with(|| Attribute::new(0.0, layer_count))
    }

    /// Set an attribute's base value. Returns every attribute whose
    /// modified value changed, the set attribute first.
    pub fn set_base(
        &mut self,
        schema: &AttributeSchema,
        id: AttributeId,
        value: f64,
    ) -> Vec<AttributeId> {
        let attribute = self.ensure(schema, id);
        attribute.base = value;
        self.recompute_and_propagate(schema, id)
    }

    /// Add a modifier to one layer of an attribute.
    pub fn add_modifier(
        &mut self,
        schema: &AttributeSchema,
        id: AttributeId,
        layer: usize,
        modifier: Modifier,
    ) -> Vec<AttributeId> {
        if layer >= schema.layers(id).len() {
            log::error!("attribute {id} has no modifier layer {layer}");
            return Vec::new();
        }
        if modifier.duration > 0 {
            self.has_expiring = true;
        }
        let attribute = self.ensure(schema, id);
        attribute.layers[layer].push(modifier);
        self.recompute_and_propagate(schema, id)
    }

    /// Remove every modifier a source put on one layer of an attribute.
    pub fn remove_modifiers(
        &mut self,
        schema: &AttributeSchema,
        id: AttributeId,
        layer: usize,
        source_id: u32,
    ) -> Vec<AttributeId> {
        let Some(attribute) = self.attributes.get_mut(&id) else {
            return Vec::new();
        };
        let Some(mods) = attribute.layers.get_mut(layer) else {
            return Vec::new();
        };
        let before = mods.len();
        mods.retain(|m| m.source_id != source_id);
        if mods.len() == before {
            return Vec::new();
        }
        self.recompute_and_propagate(schema, id)
    }

    /// Count down duration-bound modifiers; expired ones are dropped. Only
    /// does work when such modifiers exist. Returns changed attributes.
    pub fn tick_modifier_expiry(&mut self, schema: &AttributeSchema) -> Vec<AttributeId> {
        if !self.has_expiring {
            return Vec::new();
        }
        let mut still_expiring = false;
        let mut touched = Vec::new();
        for (id, attribute) in &mut self.attributes {
            let mut expired = false;
            for mods in &mut attribute.layers {
                mods.retain_mut(|m| {
                    if m.duration == 0 {
                        // Permanent modifier.
                        return true;
                    }
                    m.duration -= 1;
                    if m.duration == 0 {
                        expired = true;
                        false
                    } else {
                        still_expiring = true;
                        true
                    }
                });
            }
            if expired {
                touched.push(*id);
            }
        }
        self.has_expiring = still_expiring;

        let mut changed = Vec::new();
        for id in touched {
            for c in self.recompute_and_propagate(schema, id) {
                if !changed.contains(&c) {
                    changed.push(c);
                }
            }
        }
        changed
    }

    fn recompute_and_propagate(
        &mut self,
        schema: &AttributeSchema,
        id: AttributeId,
    ) -> Vec<AttributeId> {
        let mut changed = Vec::new();
        let mut visited = Vec::new();
        let mut work = vec![id];

        while let Some(current) = work.pop() {
            // The schema is a DAG, but guard anyway so a future schema bug
            // cannot hang the tick.
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);

            // Derived attributes refresh their base from the source first.
            if let Some(formula) = schema.formula(current) {
                let source_value = self.modified(formula.source());
                let new_base = formula.eval(source_value);
                self.ensure(schema, current).base = new_base;
            }

            let layers = schema.layers(current).to_vec();
            let attribute = self.ensure(schema, current);
            let did_change = attribute.recompute(&layers);

            if did_change || current == id {
                if did_change && !changed.contains(&current) {
                    changed.push(current);
                }
                for dep in schema.dependents(current) {
                    work.push(*dep);
                }
            }
        }
        changed
    }
}
