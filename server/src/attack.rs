//! Attack descriptions and the per-entity attack scheduler.
//!
//! Each live attack runs a single countdown timer `T` against its
//! `AttackInfo`:
//!
//! - `T > cooldown`  — warming up; may still be soft-reset or halted,
//! - `T == cooldown` — the damage resolves this tick,
//! - `T < cooldown`  — cooling down; cannot be reset.
//!
//! After triggering, a separate reuse timer of `cooldown + reuse` must run
//! out before the same attack can start warming up again.

use evermire_core::protocol::{DamageType, Element};

use crate::script::ScriptRef;

/// Severity and nature of one hit a being can take.
#[derive(Clone, Debug, PartialEq)]
pub struct Damage {
    /// Id of the attack, needed client-side to pick the animation.
    pub id: u32,
    /// Skill the source used, needed for experience attribution.
    pub skill: u16,
    /// Base amount of damage.
    pub base: u16,
    /// Additional damage when lucky.
    pub delta: u16,
    /// Chance to hit; opposes the dodge attribute.
    pub cth: u16,
    pub element: Element,
    pub damage_type: DamageType,
    /// Overrides the dodge calculation.
    pub true_strike: bool,
    /// Maximum distance this attack can be used from, in pixels.
    pub range: u16,
}

impl Default for Damage {
    fn default() -> Self {
        Damage {
            id: 0,
            skill: 0,
            base: 0,
            delta: 0,
            cth: 0,
            element: Element::Neutral,
            damage_type: DamageType::Other,
            true_strike: false,
            range: 32,
        }
    }
}

/// Static description of an attack.
#[derive(Clone, Debug, PartialEq)]
pub struct AttackInfo {
    pub damage: Damage,
    pub warmup_time: u16,
    pub cooldown_time: u16,
    pub reuse_time: u16,
    pub priority: u32,
    pub script_callback: Option<ScriptRef>,
}

impl AttackInfo {
    pub fn new(
        priority: u32,
        damage: Damage,
        warmup_time: u16,
        cooldown_time: u16,
        reuse_time: u16,
    ) -> Self {
        AttackInfo {
            damage,
            // The trigger condition is `T == cooldown` after one decrement,
            // so a zero warmup could never fire.
            warmup_time: warmup_time.max(1),
            cooldown_time,
            reuse_time,
            priority,
            script_callback: None,
        }
    }
}

/// A live attack instance owned by one entity.
#[derive(Clone, Debug)]
pub struct Attack {
    info: AttackInfo,
    /// Tag of whatever granted this attack (item, ability, monster class),
    /// used to drop it when the source goes away.
    source_id: u32,
    timer: u16,
    reuse_timer: u16,
    performing: bool,
}

impl Attack {
    pub fn new(info: AttackInfo, source_id: u32) -> Self {
        Attack {
            info,
            source_id,
            timer: 0,
            reuse_timer: 0,
            performing: false,
        }
    }

    pub fn info(&self) -> &AttackInfo {
        &self.info
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn timer(&self) -> u16 {
        self.timer
    }

    /// Ready to start a new performance.
    pub fn is_usable(&self) -> bool {
        !self.performing && self.reuse_timer == 0
    }

    pub fn is_warming_up(&self) -> bool {
        self.performing && self.timer > self.info.cooldown_time
    }

    /// The damage of this attack resolves this tick.
    pub fn triggers_now(&self) -> bool {
        self.performing && self.timer == self.info.cooldown_time
    }

    /// Begin a performance.
    fn start(&mut self) {
        debug_assert!(self.is_usable());
        self.timer = self.info.warmup_time + self.info.cooldown_time;
        self.performing = true;
    }

    /// Arm the reuse timer; called when the attack triggers, whether or not
    /// its damage was the one chosen to resolve.
    fn mark_triggered(&mut self) {
        self.reuse_timer = self.info.cooldown_time + self.info.reuse_time;
    }

    /// Restart the warmup. A no-op once the attack committed (cooldown).
    pub fn soft_reset(&mut self) {
        if self.is_warming_up() {
            self.timer = self.info.warmup_time + self.info.cooldown_time;
        }
    }

    /// Cancel the performance. A no-op once the attack committed.
    pub fn halt(&mut self) {
        if self.is_warming_up() {
            self.timer = 0;
            self.performing = false;
        }
    }

    /// Advance one tick. Timers only ever decrease within a lifecycle.
    fn tick(&mut self) {
        if self.performing {
            if self.timer > 0 {
                self.timer -= 1;
            }
            if self.timer == 0 {
                self.performing = false;
            }
        }
        if self.reuse_timer > 0 {
            self.reuse_timer -= 1;
        }
    }
}

/// All attacks available to one entity, advanced together.
#[derive(Clone, Debug, Default)]
pub struct Attacks {
    attacks: Vec<Attack>,
}

impl Attacks {
    pub fn new() -> Self {
        Attacks::default()
    }

    pub fn add(&mut self, info: AttackInfo, source_id: u32) {
        self.attacks.push(Attack::new(info, source_id));
        self.sort();
    }

    /// Drop every attack granted by `source_id`.
    pub fn remove_source(&mut self, source_id: u32) {
        self.attacks.retain(|a| a.source_id != source_id);
    }

    pub fn len(&self) -> usize {
        self.attacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attacks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attack> {
        self.attacks.iter()
    }

    fn sort(&mut self) {
        self.attacks.sort_by_key(|a| a.timer);
    }

    /// Advance every timer one tick and keep the list ordered by T.
    pub fn tick(&mut self) {
        for attack in &mut self.attacks {
            attack.tick();
        }
        self.sort();
    }

    /// The attack whose damage resolves this tick, if any.
    ///
    /// When several attacks reach their trigger point in the same tick, the
    /// highest priority wins; the losers are marked triggered anyway so
    /// they go through reuse without dealing damage.
    pub fn take_triggered(&mut self) -> Option<Attack> {
        let mut winner: Option<usize> = None;
        for (i, attack) in self.attacks.iter().enumerate() {
            if !attack.triggers_now() {
                continue;
            }
            match winner {
                Some(w) if self.attacks[w].info.priority >= attack.info.priority => {}
                _ => winner = Some(i),
            }
        }
        let winner = winner?;
        let snapshot = self.attacks[winner].clone();
        for attack in &mut self.attacks {
            if attack.triggers_now() {
                attack.mark_triggered();
            }
        }
        Some(snapshot)
    }

    /// Indices of attacks ready to start a new performance.
    pub fn usable(&self) -> Vec<usize> {
        self.attacks
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_usable())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn attack(&self, index: usize) -> &Attack {
        &self.attacks[index]
    }

    pub fn start(&mut self, index: usize) {
        self.attacks[index].start();
    }

    /// Abort all warmups; cooldowns and reuse keep running. Used when the
    /// entity stops attacking.
    pub fn stop_all(&mut self) {
        for attack in &mut self.attacks {
            attack.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(priority: u32, warmup: u16, cooldown: u16, reuse: u16) -> AttackInfo {
        AttackInfo::new(
            priority,
            Damage {
                base: 10,
                range: 32,
                ..Damage::default()
            },
            warmup,
            cooldown,
            reuse,
        )
    }

    #[test]
    fn lifecycle_triggers_exactly_once_at_the_cooldown_mark() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 2, 5, 3), 1);

        // Tick 0: nothing running yet; start the attack.
        attacks.tick();
        assert!(attacks.take_triggered().is_none());
        let usable = attacks.usable();
        assert_eq!(usable.len(), 1);
        attacks.start(usable[0]);

        let mut trigger_ticks = Vec::new();
        let mut last_timer = attacks.attack(0).timer();
        for tick in 1..=20 {
            attacks.tick();
            let timer = attacks.attack(0).timer();
            assert!(timer <= last_timer, "timer must not increase mid-cycle");
            last_timer = timer;
            if attacks.take_triggered().is_some() {
                trigger_ticks.push(tick);
            }
        }

        // Warmup 2: started on tick 0, so the trigger lands on tick 2.
        assert_eq!(trigger_ticks, vec![2]);
    }

    #[test]
    fn reuse_blocks_restart_for_cooldown_plus_reuse_ticks() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 2, 5, 3), 1);

        attacks.tick();
        attacks.start(0);

        let mut trigger_tick = None;
        let mut usable_tick = None;
        for tick in 1..=30 {
            attacks.tick();
            if attacks.take_triggered().is_some() {
                trigger_tick = Some(tick);
            }
            if usable_tick.is_none() && trigger_tick.is_some() && !attacks.usable().is_empty() {
                usable_tick = Some(tick);
            }
        }

        // Triggered at tick 2; reuse = cooldown + reuse = 8 ticks.
        assert_eq!(trigger_tick, Some(2));
        assert_eq!(usable_tick, Some(10));
    }

    #[test]
    fn starting_before_reuse_expires_is_impossible() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 2, 5, 3), 1);
        attacks.tick();
        attacks.start(0);
        for _ in 1..=4 {
            attacks.tick();
            attacks.take_triggered();
        }
        // Mid-cooldown: not usable.
        assert!(attacks.usable().is_empty());
    }

    #[test]
    fn soft_reset_restarts_warmup_but_not_cooldown() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 4, 5, 0), 1);
        attacks.tick();
        attacks.start(0);

        // One tick into the warmup, a soft reset rewinds it.
        attacks.tick();
        assert!(attacks.attack(0).is_warming_up());
        let before = attacks.attack(0).timer();
        let mut attack = attacks.attacks[0].clone();
        attack.soft_reset();
        assert_eq!(attack.timer(), before + 1);

        // Run to the cooldown phase; soft reset must do nothing there.
        let mut a = Attack::new(info(1, 2, 5, 0), 9);
        a.start();
        for _ in 0..4 {
            a.tick();
        }
        assert!(a.timer() < a.info().cooldown_time);
        let t = a.timer();
        a.soft_reset();
        assert_eq!(a.timer(), t);
    }

    #[test]
    fn halt_cancels_only_during_warmup() {
        let mut a = Attack::new(info(1, 3, 5, 0), 1);
        a.start();
        a.tick();
        assert!(a.is_warming_up());
        a.halt();
        assert!(!a.is_warming_up());
        assert_eq!(a.timer(), 0);
        // Halting never armed the reuse timer, so it is usable again.
        assert!(a.is_usable());
    }

    #[test]
    fn highest_priority_wins_simultaneous_triggers() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 2, 5, 0), 100);
        attacks.add(info(9, 2, 5, 0), 200);

        attacks.tick();
        for index in attacks.usable() {
            attacks.start(index);
        }
        attacks.tick();
        attacks.tick();

        let triggered = attacks.take_triggered().expect("both reach trigger");
        assert_eq!(triggered.info().priority, 9);
        // The loser entered reuse without resolving.
        assert!(attacks.take_triggered().is_none());
        assert!(attacks.usable().is_empty());
    }

    #[test]
    fn zero_warmup_is_clamped_so_the_trigger_can_fire() {
        let clamped = AttackInfo::new(1, Damage::default(), 0, 4, 0);
        assert_eq!(clamped.warmup_time, 1);
    }

    #[test]
    fn remove_source_drops_only_that_sources_attacks() {
        let mut attacks = Attacks::new();
        attacks.add(info(1, 2, 5, 0), 10);
        attacks.add(info(2, 2, 5, 0), 11);
        attacks.add(info(3, 2, 5, 0), 10);
        attacks.remove_source(10);
        assert_eq!(attacks.len(), 1);
        assert_eq!(attacks.attack(0).source_id(), 11);
    }
}
