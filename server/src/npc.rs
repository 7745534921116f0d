//! NPC component.

use crate::script::ScriptRef;

#[derive(Clone, Debug, Default)]
pub struct NpcComponent {
    /// Id the scripts use to refer to this NPC.
    pub script_id: u32,
    /// Disabled NPCs neither talk nor run their update callback.
    pub enabled: bool,
    pub talk_callback: Option<ScriptRef>,
    pub update_callback: Option<ScriptRef>,
}

impl NpcComponent {
    pub fn new(script_id: u32) -> Self {
        NpcComponent {
            script_id,
            enabled: true,
            talk_callback: None,
            update_callback: None,
        }
    }
}
