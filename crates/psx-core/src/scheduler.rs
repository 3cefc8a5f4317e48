//! Deadline-ordered event scheduler.
//!
//! One slot per [`EventKind`]: scheduling a kind again replaces its pending
//! deadline. Owners reschedule themselves from inside their callback.

/// Scheduled event sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Timer0,
    Timer1,
    Timer2,
    /// Frame blank, fixed interval from the cycle it fired at.
    VBlank,
    /// Scanline batch, rescheduled from its ideal deadline.
    HBlank,
    CdRom,
    /// Deferred first response of a CD-ROM command.
    CdRomDeferred,
    /// Delayed CD-ROM interrupt assertion.
    CdRomIrq,
    Sio,
}

impl EventKind {
    pub const COUNT: usize = 9;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Timer0,
        EventKind::Timer1,
        EventKind::Timer2,
        EventKind::VBlank,
        EventKind::HBlank,
        EventKind::CdRom,
        EventKind::CdRomDeferred,
        EventKind::CdRomIrq,
        EventKind::Sio,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Callback invoked with the owning context, the kind that fired and the
/// current cycle count.
pub type EventCallback<C> = fn(&mut C, EventKind, u64);

struct Slot<C> {
    deadline: u64,
    callback: EventCallback<C>,
    seq: u64,
}

pub struct Scheduler<C> {
    slots: [Option<Slot<C>>; EventKind::COUNT],
    /// Earliest pending deadline, `u64::MAX` when idle.
    earliest: u64,
    next_seq: u64,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            earliest: u64::MAX,
            next_seq: 0,
        }
    }

    /// Insert or replace the event for `kind`.
    pub fn schedule(&mut self, kind: EventKind, deadline: u64, callback: EventCallback<C>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[kind.index()] = Some(Slot {
            deadline,
            callback,
            seq,
        });
        self.earliest = self.earliest.min(deadline);
        if self.earliest != deadline {
            // A replaced slot may have been the earliest one.
            self.recompute();
        }
    }

    pub fn cancel(&mut self, kind: EventKind) -> bool {
        let removed = self.slots[kind.index()].take().is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots = std::array::from_fn(|_| None);
        self.earliest = u64::MAX;
    }

    pub fn is_scheduled(&self, kind: EventKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn deadline(&self, kind: EventKind) -> Option<u64> {
        self.slots[kind.index()].as_ref().map(|s| s.deadline)
    }

    /// Soonest pending deadline, if any event is scheduled.
    #[inline]
    pub fn next_deadline(&self) -> Option<u64> {
        (self.earliest != u64::MAX).then_some(self.earliest)
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn recompute(&mut self) {
        self.earliest = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.deadline)
            .min()
            .unwrap_or(u64::MAX);
    }

    /// Remove and return the soonest event due at `now` that was scheduled
    /// before sequence mark `before`. Ties go to the older event.
    fn pop_due(&mut self, now: u64, before: u64) -> Option<(EventKind, EventCallback<C>)> {
        if self.earliest > now {
            return None;
        }
        let mut best: Option<(usize, u64, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.deadline > now || slot.seq >= before {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, d, s)) => (slot.deadline, slot.seq) < (d, s),
            };
            if better {
                best = Some((i, slot.deadline, slot.seq));
            }
        }
        let (index, _, _) = best?;
        let slot = self.slots[index].take()?;
        self.recompute();
        Some((EventKind::ALL[index], slot.callback))
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            if let Some(deadline) = self.deadline(kind) {
                map.entry(&kind, &deadline);
            }
        }
        map.finish()
    }
}

/// A context that owns its own scheduler.
pub trait Scheduled: Sized {
    fn scheduler_mut(&mut self) -> &mut Scheduler<Self>;
}

/// Fire every event due at `now`, in deadline order.
///
/// Each event is removed before its callback runs. Events scheduled by a
/// callback wait for the next dispatch even if already due, so a callback
/// that reschedules itself at or before `now` cannot spin here.
pub fn dispatch_due<C: Scheduled>(ctx: &mut C, now: u64) -> usize {
    let mark = ctx.scheduler_mut().next_seq;
    let mut fired = 0;
    while let Some((kind, callback)) = ctx.scheduler_mut().pop_due(now, mark) {
        callback(ctx, kind, now);
        fired += 1;
    }
    fired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ctx {
        sched: Scheduler<Ctx>,
        log: Vec<(EventKind, u64)>,
        period: u64,
    }

    impl Scheduled for Ctx {
        fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
            &mut self.sched
        }
    }

    fn record(ctx: &mut Ctx, kind: EventKind, now: u64) {
        ctx.log.push((kind, now));
    }

    fn periodic(ctx: &mut Ctx, kind: EventKind, now: u64) {
        ctx.log.push((kind, now));
        let next = now + ctx.period;
        ctx.sched.schedule(kind, next, periodic);
    }

    fn immediate(ctx: &mut Ctx, kind: EventKind, now: u64) {
        ctx.log.push((kind, now));
        ctx.sched.schedule(kind, now, immediate);
    }

    #[test]
    fn fires_on_first_dispatch_at_or_after_deadline() {
        let mut ctx = Ctx::default();
        ctx.sched.schedule(EventKind::Timer1, 100, record);
        assert_eq!(ctx.sched.next_deadline(), Some(100));

        for now in [0, 50, 99] {
            assert_eq!(dispatch_due(&mut ctx, now), 0);
        }
        assert!(ctx.log.is_empty());

        assert_eq!(dispatch_due(&mut ctx, 130), 1);
        assert_eq!(ctx.log, vec![(EventKind::Timer1, 130)]);
        assert_eq!(ctx.sched.next_deadline(), None);
        assert_eq!(dispatch_due(&mut ctx, 200), 0);
    }

    #[test]
    fn dispatches_in_deadline_order() {
        let mut ctx = Ctx::default();
        ctx.sched.schedule(EventKind::Sio, 30, record);
        ctx.sched.schedule(EventKind::Timer0, 10, record);
        ctx.sched.schedule(EventKind::CdRom, 20, record);
        ctx.sched.schedule(EventKind::HBlank, 500, record);

        assert_eq!(dispatch_due(&mut ctx, 40), 3);
        let kinds: Vec<EventKind> = ctx.log.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![EventKind::Timer0, EventKind::CdRom, EventKind::Sio]);
        assert_eq!(ctx.sched.next_deadline(), Some(500));
    }

    #[test]
    fn schedule_replaces_and_cancel_removes() {
        let mut ctx = Ctx::default();
        ctx.sched.schedule(EventKind::Timer2, 10, record);
        ctx.sched.schedule(EventKind::Timer2, 80, record);
        assert_eq!(ctx.sched.pending(), 1);
        assert_eq!(ctx.sched.next_deadline(), Some(80));

        ctx.sched.schedule(EventKind::VBlank, 40, record);
        assert_eq!(ctx.sched.next_deadline(), Some(40));
        assert!(ctx.sched.cancel(EventKind::VBlank));
        assert!(!ctx.sched.cancel(EventKind::VBlank));
        assert_eq!(ctx.sched.next_deadline(), Some(80));

        ctx.sched.clear();
        assert_eq!(ctx.sched.next_deadline(), None);
    }

    #[test]
    fn callback_may_reschedule_itself() {
        let mut ctx = Ctx {
            period: 100,
            ..Ctx::default()
        };
        ctx.sched.schedule(EventKind::Timer0, 100, periodic);
        assert_eq!(dispatch_due(&mut ctx, 100), 1);
        assert_eq!(ctx.sched.deadline(EventKind::Timer0), Some(200));

        // Far past two periods: one firing per dispatch.
        assert_eq!(dispatch_due(&mut ctx, 450), 1);
        assert_eq!(ctx.sched.deadline(EventKind::Timer0), Some(550));
    }

    #[test]
    fn event_rescheduled_at_now_waits_for_next_dispatch() {
        let mut ctx = Ctx::default();
        ctx.sched.schedule(EventKind::CdRomIrq, 5, immediate);
        assert_eq!(dispatch_due(&mut ctx, 5), 1);
        assert_eq!(ctx.sched.deadline(EventKind::CdRomIrq), Some(5));
        assert_eq!(dispatch_due(&mut ctx, 5), 1);
        assert_eq!(ctx.log.len(), 2);
    }

    #[test]
    fn equal_deadlines_fire_oldest_first() {
        let mut ctx = Ctx::default();
        ctx.sched.schedule(EventKind::Sio, 10, record);
        ctx.sched.schedule(EventKind::Timer0, 10, record);
        dispatch_due(&mut ctx, 10);
        assert_eq!(ctx.log[0].0, EventKind::Sio);
        assert_eq!(ctx.log[1].0, EventKind::Timer0);
    }
}
