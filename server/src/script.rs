//! Script bridge: the narrow capability the host needs from an embedded
//! scripting language.
//!
//! The simulation never interprets scripts itself. It holds opaque
//! [`ScriptRef`] handles, pushes typed arguments, and gets a single integer
//! back. A callback that yields suspends the character's dialogue thread;
//! the tick loop resumes it when the character answers, and drops it when
//! the character disconnects.

use std::collections::BTreeMap;

use crate::entity::EntityId;

/// Opaque handle to a function registered by the embedded engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScriptRef(u32);

impl ScriptRef {
    pub fn new(raw: u32) -> Self {
        ScriptRef(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A typed argument pushed before a callback runs.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptArg {
    Entity(EntityId),
    Int(i64),
    Str(String),
    /// A list of inventory items as (item id, amount) pairs.
    Items(Vec<(u16, u16)>),
}

/// A typed value a suspended dialogue thread is resumed with.
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeValue {
    Int(i64),
    Str(String),
    /// Index of the choice the character picked.
    Selection(u8),
}

/// Callback slots the embedded engine fills at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallbackSlot {
    AbilityUse,
    AbilityRecharged,
    NpcTalk,
    NpcUpdate,
    MonsterDamaged,
    CharacterDeath,
    CharacterDeathAccepted,
    CharacterLogin,
    QuestReply,
    PostReply,
    DeathNotification,
    RemoveNotification,
    TriggerScriptAction,
}

/// The named callbacks an engine has registered.
#[derive(Debug, Default)]
pub struct CallbackTable {
    slots: BTreeMap<CallbackSlot, ScriptRef>,
}

impl CallbackTable {
    pub fn new() -> Self {
        CallbackTable::default()
    }

    pub fn set(&mut self, slot: CallbackSlot, callback: ScriptRef) {
        self.slots.insert(slot, callback);
    }

    pub fn get(&self, slot: CallbackSlot) -> Option<ScriptRef> {
        self.slots.get(&slot).copied()
    }
}

/// What an invocation produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptResult {
    /// The callback ran to completion with an integer return.
    Done(i32),
    /// The callback yielded; the dialogue thread is suspended.
    Suspended,
}

/// The embedding contract. One engine instance serves the whole game
/// service; it runs only at component update points, never mid-step.
pub trait ScriptEngine {
    /// Run `callback` with the given arguments.
    fn invoke(&mut self, callback: ScriptRef, args: &[ScriptArg]) -> anyhow::Result<ScriptResult>;

    /// Resume the suspended thread attached to `character`.
    fn resume(&mut self, character: EntityId, value: ResumeValue)
        -> anyhow::Result<ScriptResult>;

    /// Drop any suspended thread attached to `character`. Called on
    /// disconnect; the thread must never resume afterwards.
    fn cancel(&mut self, character: EntityId);
}

/// Engine used when no scripting backend is embedded. Every call completes
/// immediately and returns zero.
#[derive(Debug, Default)]
pub struct NullScriptEngine;

impl ScriptEngine for NullScriptEngine {
    fn invoke(&mut self, _callback: ScriptRef, _args: &[ScriptArg]) -> anyhow::Result<ScriptResult> {
        Ok(ScriptResult::Done(0))
    }

    fn resume(
        &mut self,
        _character: EntityId,
        _value: ResumeValue,
    ) -> anyhow::Result<ScriptResult> {
        Ok(ScriptResult::Done(0))
    }

    fn cancel(&mut self, _character: EntityId) {}
}

/// Engine for tests: records every call and returns scripted results.
#[derive(Debug, Default)]
pub struct RecordingScriptEngine {
    pub invocations: Vec<(ScriptRef, Vec<ScriptArg>)>,
    pub resumes: Vec<(EntityId, ResumeValue)>,
    pub cancelled: Vec<EntityId>,
    /// Callbacks that should report a yield instead of completing.
    pub suspend_on: Vec<ScriptRef>,
    pub return_value: i32,
}

impl ScriptEngine for RecordingScriptEngine {
    fn invoke(&mut self, callback: ScriptRef, args: &[ScriptArg]) -> anyhow::Result<ScriptResult> {
        self.invocations.push((callback, args.to_vec()));
        if self.suspend_on.contains(&callback) {
            Ok(ScriptResult::Suspended)
        } else {
            Ok(ScriptResult::Done(self.return_value))
        }
    }

    fn resume(
        &mut self,
        character: EntityId,
        value: ResumeValue,
    ) -> anyhow::Result<ScriptResult> {
        self.resumes.push((character, value));
        Ok(ScriptResult::Done(self.return_value))
    }

    fn cancel(&mut self, character: EntityId) {
        self.cancelled.push(character);
    }
}
