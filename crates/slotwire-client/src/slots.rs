//! Lock-free request slot table and the completion cell carried by each slot.
//!
//! A slot's wire id is its index. The slot state moves as follows; any other
//! transition attempt is a lost race and leaves the slot untouched:
//!
//! ```text
//! Idle          --reserve-------------> AwaitingSend
//! AwaitingSend  --batch written-------> Sent
//! AwaitingSend,
//! Sent          --success response----> Idle
//! AwaitingSend,
//! Sent          --failure-------------> ErrorInFlight --delivered--> Idle
//! ```
//!
//! A response can overtake the batch bookkeeping on a fast peer, so
//! completion accepts `AwaitingSend` as well as `Sent`. The response kind the
//! caller awaits lives in the same atomic word as the state, so whoever wins
//! a transition also reads the kind that belongs to that occupancy.
//!
//! The completion cell has its own phase word, which decides who may touch
//! the stored outcome:
//!
//! ```text
//! Free --reserve--> Armed --publish--> Publishing --> Ready --poll--> Taking --> Free
//! ```
//!
//! Dropping the waiting future sets the abandoned bit on `Armed` or
//! `Publishing`; the publisher then discards the outcome and frees the cell.
//! A user slot is reserved only while its cell is `Free`, so a result is
//! never handed to the next caller. No step blocks: each one is a single
//! compare-and-swap, and the waker is exchanged through an [`AtomicWaker`].

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;

use crate::error::CallError;

/// Decoded response or the reason there is none.
pub(crate) type Outcome = Result<Box<dyn Any + Send>, CallError>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle = 0,
    AwaitingSend = 1,
    Sent = 2,
    ErrorInFlight = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::AwaitingSend,
            2 => Self::Sent,
            3 => Self::ErrorInFlight,
            _ => Self::Idle,
        }
    }
}

/// State word: low byte is the [`SlotState`], high byte the expected kind.
/// An idle slot is always `0`.
const IDLE_WORD: u16 = 0;

fn state_word(state: SlotState, expected_kind: u8) -> u16 {
    u16::from_le_bytes([state as u8, expected_kind])
}

/// Completion cell phases.
mod phase {
    pub(super) const FREE: u8 = 0;
    pub(super) const ARMED: u8 = 1;
    pub(super) const PUBLISHING: u8 = 2;
    pub(super) const READY: u8 = 3;
    pub(super) const TAKING: u8 = 4;
    /// Added to `ARMED` or `PUBLISHING` once the waiting future is gone.
    pub(super) const ABANDONED: u8 = 0x10;
}

/// Result of handing a success response to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Resolved,
    /// The response kind differs from the one the caller awaits; the caller
    /// got `InternalError`.
    WrongKind { expected: u8 },
    /// Nothing was pending on the slot.
    NotPending,
}

pub(crate) struct Slot {
    state: AtomicU16,
    phase: AtomicU8,
    waker: AtomicWaker,
    outcome: UnsafeCell<Option<Outcome>>,
}

// SAFETY: `outcome` is only read or written by the thread that moved `phase`
// into `PUBLISHING` or `TAKING` with a successful compare-and-swap. Only the
// publisher leaves `PUBLISHING` and only the waiting future leaves `TAKING`,
// so accesses never overlap. The stored value is `Send`.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU16::new(IDLE_WORD),
            phase: AtomicU8::new(phase::FREE),
            waker: AtomicWaker::new(),
            outcome: UnsafeCell::new(None),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        let [state, _] = self.state.load(Ordering::Acquire).to_le_bytes();
        SlotState::from_u8(state)
    }

    /// Moves `from` to `to`, keeping the expected kind. Returns that kind.
    fn transition(&self, from: SlotState, to: SlotState) -> Option<u8> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let [state, kind] = word.to_le_bytes();
                (state == from as u8).then(|| {
                    if to == SlotState::Idle {
                        IDLE_WORD
                    } else {
                        state_word(to, kind)
                    }
                })
            })
            .ok()
            .map(|word| word.to_le_bytes()[1])
    }

    fn leave_pending(&self, to: SlotState) -> Option<u8> {
        self.transition(SlotState::Sent, to)
            .or_else(|| self.transition(SlotState::AwaitingSend, to))
    }

    fn claim(&self, expected_kind: u8) -> bool {
        self.state
            .compare_exchange(
                IDLE_WORD,
                state_word(SlotState::AwaitingSend, expected_kind),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set_phase(&self, from: u8, to: u8) -> bool {
        self.phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the slot for a caller awaiting a response of `expected_kind`.
    ///
    /// Fails if a request is still pending or the previous caller has not
    /// collected its result.
    pub(crate) fn reserve(&self, expected_kind: u8) -> bool {
        // Arming first keeps a failure fan-out from resolving a claimed slot
        // whose cell is not armed yet.
        if !self.set_phase(phase::FREE, phase::ARMED) {
            return false;
        }
        if self.claim(expected_kind) {
            return true;
        }
        self.phase.store(phase::FREE, Ordering::Release);
        false
    }

    /// Claims the slot for a request whose result nobody collects.
    pub(crate) fn reserve_detached(&self, expected_kind: u8) -> bool {
        self.phase.load(Ordering::Acquire) == phase::FREE && self.claim(expected_kind)
    }

    pub(crate) fn mark_sent(&self) {
        self.transition(SlotState::AwaitingSend, SlotState::Sent);
    }

    /// Resolves the pending request with a decoded response of `kind`.
    pub(crate) fn complete(&self, kind: u8, message: Box<dyn Any + Send>) -> Completion {
        let Some(expected) = self.leave_pending(SlotState::Idle) else {
            return Completion::NotPending;
        };
        if kind == expected {
            self.publish(Ok(message));
            Completion::Resolved
        } else {
            self.publish(Err(CallError::InternalError));
            Completion::WrongKind { expected }
        }
    }

    /// Resolves the pending request with `error`. False if nothing was
    /// pending.
    pub(crate) fn fail(&self, error: CallError) -> bool {
        if self.leave_pending(SlotState::ErrorInFlight).is_none() {
            return false;
        }
        self.publish(Err(error));
        self.state.store(IDLE_WORD, Ordering::Release);
        true
    }

    /// Stores `outcome` for the waiting caller, if there is one. Called only
    /// by the winner of a transition out of a pending state.
    fn publish(&self, outcome: Outcome) {
        let mut outcome = Some(outcome);
        loop {
            let current = self.phase.load(Ordering::Acquire);
            if current == phase::ARMED {
                if !self.set_phase(phase::ARMED, phase::PUBLISHING) {
                    continue;
                }
                // SAFETY: this thread holds `PUBLISHING`.
                unsafe { *self.outcome.get() = outcome.take() };
                if self.set_phase(phase::PUBLISHING, phase::READY) {
                    self.waker.wake();
                } else {
                    // Abandoned while publishing.
                    // SAFETY: still `PUBLISHING`, with the abandoned bit.
                    unsafe { *self.outcome.get() = None };
                    self.phase.store(phase::FREE, Ordering::Release);
                }
                return;
            }
            if current == phase::ARMED | phase::ABANDONED {
                if self.set_phase(current, phase::FREE) {
                    return;
                }
                continue;
            }
            // Detached reservation: nobody collects.
            return;
        }
    }

    /// Takes the outcome, or registers the waker until it arrives.
    pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Outcome> {
        self.waker.register(cx.waker());
        if !self.set_phase(phase::READY, phase::TAKING) {
            return Poll::Pending;
        }
        // SAFETY: this thread holds `TAKING`.
        let outcome = unsafe { (*self.outcome.get()).take() };
        self.waker.take();
        self.phase.store(phase::FREE, Ordering::Release);
        Poll::Ready(outcome.unwrap_or(Err(CallError::InternalError)))
    }

    /// Detaches the waiting caller; a later result is discarded.
    pub(crate) fn disarm(&self) {
        self.waker.take();
        loop {
            let current = self.phase.load(Ordering::Acquire);
            match current {
                phase::ARMED | phase::PUBLISHING => {
                    if self.set_phase(current, current | phase::ABANDONED) {
                        return;
                    }
                }
                phase::READY => {
                    if self.set_phase(phase::READY, phase::TAKING) {
                        // SAFETY: this thread holds `TAKING`.
                        drop(unsafe { (*self.outcome.get()).take() });
                        self.phase.store(phase::FREE, Ordering::Release);
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

/// `N` user slots plus one reserved for the keepalive ping.
pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    user_slots: u32,
    next: AtomicU32,
}

impl SlotTable {
    /// `user_slots` must be at least one.
    pub(crate) fn new(user_slots: u32) -> Self {
        let user_slots = user_slots.max(1);
        Self {
            slots: (0..=user_slots).map(|_| Slot::new()).collect(),
            user_slots,
            next: AtomicU32::new(0),
        }
    }

    pub(crate) fn user_slots(&self) -> u32 {
        self.user_slots
    }

    /// Next user slot id, round-robin.
    pub(crate) fn next_user_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed) % self.user_slots
    }

    pub(crate) fn get(&self, id: u32) -> Option<&Slot> {
        self.slots.get(usize::try_from(id).ok()?)
    }

    pub(crate) fn ping_id(&self) -> u32 {
        self.user_slots
    }

    pub(crate) fn ping(&self) -> &Slot {
        &self.slots[self.slots.len() - 1]
    }

    /// Resolves every pending slot with `error`; returns how many there were.
    pub(crate) fn fail_pending(&self, error: CallError) -> usize {
        self.slots.iter().filter(|slot| slot.fail(error)).count()
    }

    /// Slots not idle, ping included.
    pub(crate) fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != SlotState::Idle)
            .count()
    }
}
