//! # Event Sets
//!
//! An event set is a named snapshot of the register file. A context owns
//! an ordered collection of sets, one of which is active while the context
//! is attached; the others wait their turn in the multiplexing ring.
//!
//! ```text
//!   SetList (ascending ids)          ring order on switch
//!   ┌─────┬─────┬─────┐
//!   │  0  │  3  │  7  │     0 ──▶ 3 ──▶ 7 ──┐
//!   └─────┴──▲──┴─────┘     ▲               │
//!            │ active       └───────────────┘
//! ```
//!
//! Sets are created and deleted only while the context is detached; while
//! attached only their values change.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::bitmap::RegMask;
use crate::error::{PfmError, PfmResult};
use crate::random::{carta_random32, DEFAULT_SEED};
use crate::regs::PmuDescription;
use crate::SetId;

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Multiplexing policy of a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetFlags: u32 {
        /// Switch to the next set after overflow thresholds expire
        const SWITCH_OVFL = 1 << 0;
        /// Switch to the next set when the time slice expires
        const SWITCH_TIMEOUT = 1 << 1;
    }
}

bitflags! {
    /// Per data register software flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PmdFlags: u32 {
        /// Notify the controller on overflow
        const NOTIFY = 1 << 0;
        /// Randomize the reset value
        const RANDOM = 1 << 1;
    }
}

// =============================================================================
// PER-REGISTER SOFT STATE
// =============================================================================

/// Software state of one data register within a set
#[derive(Debug, Clone, Copy)]
pub struct PmdState {
    /// 64-bit shadow value
    pub value: u64,
    /// Value written by the last reset
    pub last_reset: u64,
    /// Reset value applied at interrupt time
    pub short_reset: u64,
    /// Reset value applied at restart
    pub long_reset: u64,
    /// Bits of randomization subtracted from reset values
    pub random_mask: u64,
    /// Randomization state
    pub seed: u32,
    /// Software flags
    pub flags: PmdFlags,
    /// Registers reset when this one overflows
    pub reset_pmds: RegMask,
    /// Registers sampled when this one overflows
    pub smpl_pmds: RegMask,
    /// Configured overflow-switch threshold (0 = none)
    pub ovflsw_ref: u64,
    /// Overflows left before a switch
    pub ovflsw_thres: u64,
}

impl Default for PmdState {
    fn default() -> Self {
        Self {
            value: 0,
            last_reset: 0,
            short_reset: 0,
            long_reset: 0,
            random_mask: 0,
            seed: DEFAULT_SEED,
            flags: PmdFlags::empty(),
            reset_pmds: RegMask::new(),
            smpl_pmds: RegMask::new(),
            ovflsw_ref: 0,
            ovflsw_thres: 0,
        }
    }
}

// =============================================================================
// EVENT SET
// =============================================================================

/// One register configuration snapshot
#[derive(Debug)]
pub struct EventSet {
    /// Set identifier
    pub id: SetId,
    /// Multiplexing flags
    pub flags: SetFlags,
    /// Effective switch timeout (ns)
    pub timeout_ns: u64,
    /// Control register values
    pub pmcs: Vec<u64>,
    /// Data register soft state
    pub pmds: Vec<PmdState>,
    /// Control registers claimed by a write
    pub used_pmcs: RegMask,
    /// Data registers claimed by a write
    pub used_pmds: RegMask,
    /// Overflows latched but not yet processed
    pub pending_ovfl: RegMask,
    /// Registers with a confirmed 64-bit overflow in the last interrupt
    pub ovfl_pmds: RegMask,
    /// Resets deferred to restart or to the next activation
    pub reset_pending: RegMask,
    /// Number of activations
    pub runs: u64,
    /// Cumulative active time (ns)
    pub duration_ns: u64,
    /// Timestamp of the current activation, 0 while inactive
    pub duration_start: u64,
    /// Unused part of the current time slice (ns)
    pub remaining_ns: u64,
}

impl EventSet {
    /// Allocate a set sized for `desc`, with control registers at their
    /// default values
    pub fn new(id: SetId, desc: &PmuDescription) -> PfmResult<Self> {
        let mut pmcs = Vec::new();
        pmcs.try_reserve_exact(desc.num_pmcs())?;
        pmcs.extend(desc.pmcs.iter().map(|c| c.default));

        let mut pmds = Vec::new();
        pmds.try_reserve_exact(desc.num_pmds())?;
        pmds.resize(desc.num_pmds(), PmdState::default());

        Ok(Self {
            id,
            flags: SetFlags::empty(),
            timeout_ns: 0,
            pmcs,
            pmds,
            used_pmcs: RegMask::new(),
            used_pmds: RegMask::new(),
            pending_ovfl: RegMask::new(),
            ovfl_pmds: RegMask::new(),
            reset_pending: RegMask::new(),
            runs: 0,
            duration_ns: 0,
            duration_start: 0,
            remaining_ns: 0,
        })
    }

    /// Reload every overflow-switch threshold from its configured value
    pub fn reload_thresholds(&mut self) {
        for i in self.used_pmds.iter() {
            let pmd = &mut self.pmds[i];
            pmd.ovflsw_thres = pmd.ovflsw_ref;
        }
    }

    /// Compute the next reset value of register `index`, store it as the
    /// new shadow value and return it
    pub fn apply_reset(&mut self, index: usize, long: bool) -> u64 {
        let pmd = &mut self.pmds[index];
        let mut val = if long { pmd.long_reset } else { pmd.short_reset };
        if pmd.flags.contains(PmdFlags::RANDOM) {
            pmd.seed = carta_random32(pmd.seed);
            val = val.wrapping_sub(pmd.seed as u64 & pmd.random_mask);
        }
        pmd.last_reset = val;
        pmd.value = val;
        val
    }

    /// Make this set the active one: count the activation and reload the
    /// overflow-switch thresholds
    pub fn activate(&mut self) {
        self.runs += 1;
        self.reload_thresholds();
    }

    /// Start accounting active time at `now`
    pub fn open_window(&mut self, now: u64) {
        if self.duration_start == 0 {
            self.duration_start = now.max(1);
        }
    }

    /// Stop accounting active time at `now`
    pub fn close_window(&mut self, now: u64) {
        if self.duration_start != 0 {
            self.duration_ns += now.saturating_sub(self.duration_start);
            self.duration_start = 0;
        }
    }

    /// Active time including the open window, if any
    pub fn duration_at(&self, now: u64) -> u64 {
        if self.duration_start == 0 {
            self.duration_ns
        } else {
            self.duration_ns + now.saturating_sub(self.duration_start)
        }
    }

    /// Public view of the set at `now`
    pub fn info(&self, now: u64) -> SetInfo {
        SetInfo {
            id: self.id,
            flags: self.flags,
            timeout_ns: self.timeout_ns,
            runs: self.runs,
            duration_ns: self.duration_at(now),
            remaining_ns: self.remaining_ns,
            used_pmds: self.used_pmds,
        }
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Create/modify request for a set. `timeout_ns` is updated with the
/// effective (rounded) timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetDesc {
    /// Set identifier
    pub id: SetId,
    /// Multiplexing flags
    pub flags: SetFlags,
    /// Requested switch timeout (ns)
    pub timeout_ns: u64,
}

impl SetDesc {
    /// Descriptor with no switching policy
    pub fn new(id: SetId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Switch after overflow thresholds expire
    pub fn switch_on_overflow(mut self) -> Self {
        self.flags |= SetFlags::SWITCH_OVFL;
        self
    }

    /// Switch after `ns` of active time
    pub fn switch_on_timeout(mut self, ns: u64) -> Self {
        self.flags |= SetFlags::SWITCH_TIMEOUT;
        self.timeout_ns = ns;
        self
    }

    /// Check flag consistency
    pub fn validate(&self) -> PfmResult<()> {
        if self.flags.contains(SetFlags::SWITCH_OVFL | SetFlags::SWITCH_TIMEOUT) {
            return Err(PfmError::invalid_argument(
                "switch-on-overflow and switch-on-timeout are exclusive",
            ));
        }
        if self.flags.contains(SetFlags::SWITCH_TIMEOUT) && self.timeout_ns == 0 {
            return Err(PfmError::invalid_argument("timeout switching needs a timeout"));
        }
        Ok(())
    }
}

/// Public view of a set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetInfo {
    /// Set identifier
    pub id: SetId,
    /// Multiplexing flags
    pub flags: SetFlags,
    /// Effective switch timeout (ns)
    pub timeout_ns: u64,
    /// Number of activations
    pub runs: u64,
    /// Cumulative active time (ns)
    pub duration_ns: u64,
    /// Unused part of the time slice (ns)
    pub remaining_ns: u64,
    /// Data registers claimed in this set
    pub used_pmds: RegMask,
}

// =============================================================================
// SET LIST
// =============================================================================

/// Sets of a context, ordered by ascending id
#[derive(Debug, Default)]
pub struct SetList {
    sets: Vec<EventSet>,
    active: usize,
}

impl SetList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// True if there are no sets
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Position of a set
    pub fn position(&self, id: SetId) -> Option<usize> {
        self.sets.binary_search_by_key(&id, |s| s.id).ok()
    }

    /// Set by id
    pub fn get(&self, id: SetId) -> Option<&EventSet> {
        self.position(id).map(|i| &self.sets[i])
    }

    /// Mutable set by id
    pub fn get_mut(&mut self, id: SetId) -> Option<&mut EventSet> {
        self.position(id).map(move |i| &mut self.sets[i])
    }

    /// Set at a position
    pub fn at(&self, pos: usize) -> &EventSet {
        &self.sets[pos]
    }

    /// Mutable set at a position
    pub fn at_mut(&mut self, pos: usize) -> &mut EventSet {
        &mut self.sets[pos]
    }

    /// Insert keeping id order; fails if the id exists
    pub fn insert(&mut self, set: EventSet) -> PfmResult<()> {
        match self.sets.binary_search_by_key(&set.id, |s| s.id) {
            Ok(_) => Err(PfmError::invalid_argument("set already exists")),
            Err(pos) => {
                self.sets.try_reserve(1)?;
                self.sets.insert(pos, set);
                if pos <= self.active && self.sets.len() > 1 {
                    self.active += 1;
                }
                Ok(())
            },
        }
    }

    /// Remove a set
    pub fn remove(&mut self, id: SetId) -> PfmResult<EventSet> {
        let pos = self
            .position(id)
            .ok_or(PfmError::invalid_argument("no such set"))?;
        let set = self.sets.remove(pos);
        if pos < self.active || self.active >= self.sets.len() {
            self.active = self.active.saturating_sub(1);
        }
        Ok(set)
    }

    /// Position of the active set
    pub fn active_pos(&self) -> usize {
        self.active
    }

    /// Make the set at `pos` active
    pub fn set_active(&mut self, pos: usize) {
        debug_assert!(pos < self.sets.len());
        self.active = pos;
    }

    /// Active set
    pub fn active(&self) -> &EventSet {
        &self.sets[self.active]
    }

    /// Mutable active set
    pub fn active_mut(&mut self) -> &mut EventSet {
        &mut self.sets[self.active]
    }

    /// Ring successor of `pos`
    pub fn next_pos(&self, pos: usize) -> usize {
        (pos + 1) % self.sets.len()
    }

    /// Iterate in id order
    pub fn iter(&self) -> core::slice::Iter<'_, EventSet> {
        self.sets.iter()
    }

    /// Iterate mutably in id order
    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, EventSet> {
        self.sets.iter_mut()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sim_desc;

    #[test]
    fn test_new_set_uses_defaults() {
        let desc = sim_desc(4, 32);
        let set = EventSet::new(3, &desc).unwrap();
        assert_eq!(set.pmcs.len(), 4);
        assert_eq!(set.pmds.len(), 4);
        assert!(set.used_pmds.is_empty());
    }

    #[test]
    fn test_list_order_and_ring() {
        let desc = sim_desc(2, 32);
        let mut list = SetList::new();
        for id in [7, 0, 3] {
            list.insert(EventSet::new(id, &desc).unwrap()).unwrap();
        }
        let ids: std::vec::Vec<SetId> = list.iter().map(|s| s.id).collect();
        assert_eq!(ids, [0, 3, 7]);
        assert_eq!(list.next_pos(2), 0);
        assert!(list.insert(EventSet::new(3, &desc).unwrap()).is_err());
    }

    #[test]
    fn test_active_survives_insert_and_remove() {
        let desc = sim_desc(2, 32);
        let mut list = SetList::new();
        list.insert(EventSet::new(5, &desc).unwrap()).unwrap();
        list.insert(EventSet::new(9, &desc).unwrap()).unwrap();
        list.set_active(1);
        list.insert(EventSet::new(1, &desc).unwrap()).unwrap();
        assert_eq!(list.active().id, 9);
        list.remove(1).unwrap();
        assert_eq!(list.active().id, 9);
        list.remove(9).unwrap();
        assert_eq!(list.active().id, 5);
    }

    #[test]
    fn test_desc_validation() {
        assert!(SetDesc::new(1).switch_on_overflow().validate().is_ok());
        assert!(SetDesc::new(1).switch_on_timeout(0).validate().is_err());
        let both = SetDesc::new(1).switch_on_overflow().switch_on_timeout(10);
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_randomized_reset_stays_below_base() {
        let desc = sim_desc(1, 32);
        let mut set = EventSet::new(0, &desc).unwrap();
        set.pmds[0].short_reset = 1_000_000;
        set.pmds[0].random_mask = 0xFF;
        set.pmds[0].flags = PmdFlags::RANDOM;
        let a = set.apply_reset(0, false);
        let b = set.apply_reset(0, false);
        assert!(a <= 1_000_000 && a > 1_000_000 - 256);
        assert!(b <= 1_000_000 && b > 1_000_000 - 256);
        assert_eq!(set.pmds[0].last_reset, b);
        assert_eq!(set.pmds[0].value, b);
    }

    #[test]
    fn test_activation_accounting() {
        let desc = sim_desc(1, 32);
        let mut set = EventSet::new(0, &desc).unwrap();
        set.used_pmds.set(0);
        set.pmds[0].ovflsw_ref = 3;
        set.activate();
        assert_eq!(set.pmds[0].ovflsw_thres, 3);
        set.open_window(100);
        assert_eq!(set.duration_at(150), 50);
        set.close_window(350);
        set.close_window(900);
        assert_eq!(set.runs, 1);
        assert_eq!(set.duration_ns, 250);
    }
}
