use crate::config::RuntimeConfig;
use crate::context::{Context, Trampoline};
use crate::error::{fatal, ThreadError, ThreadResult};
use crate::preemption;
use crate::priority::Priority;
use crate::stack_guard::{self, Stack};
use crate::thread::{Entry, ExitStatus, Tcb, ThreadId, ThreadStatus};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::time::Duration;
use spin::Once;

/// Run queue, thread registry and the notion of the current thread.
///
/// The registry is keyed by id, so iteration follows creation order and the
/// main thread always comes first. Both queues keep enough spare capacity for
/// every live thread: the preemption handler and the overflow handler push
/// onto them and must never allocate.
pub(crate) struct Scheduler {
    config: RuntimeConfig,
    threads: BTreeMap<ThreadId, Tcb>,
    run_queue: VecDeque<ThreadId>,
    to_free: Vec<ThreadId>,
    current: ThreadId,
    next_id: usize,
}

/// A control transfer prepared by [`Scheduler::begin_switch`].
pub(crate) struct Switch {
    pub from: *mut Context,
    pub to: *const Context,
    pub timeslice: Duration,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        let priority = Priority::new(config.default_priority).unwrap_or_default();
        let mut threads = BTreeMap::new();
        threads.insert(ThreadId::MAIN, Tcb::main(priority));

        Scheduler {
            config,
            threads,
            run_queue: VecDeque::new(),
            to_free: Vec::new(),
            current: ThreadId::MAIN,
            next_id: ThreadId::MAIN.get() + 1,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn has_runnable(&self) -> bool {
        !self.run_queue.is_empty()
    }

    pub fn thread(&self, id: ThreadId) -> ThreadResult<&Tcb> {
        self.threads.get(&id).ok_or(ThreadError::InvalidThreadId)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> ThreadResult<&mut Tcb> {
        self.threads.get_mut(&id).ok_or(ThreadError::InvalidThreadId)
    }

    /// Registers a new thread and appends it to the run queue.
    pub fn spawn(
        &mut self,
        entry: Entry,
        priority: Priority,
        stack_size: usize,
        trampoline: Trampoline,
    ) -> ThreadResult<ThreadId> {
        let stack = Stack::new(stack_size, self.config.guard_size, self.config.instrumentation)?;
        let context = unsafe { Context::prepare(stack.top(), trampoline) };
        let id = ThreadId::from_raw(self.next_id).ok_or(ThreadError::InvalidThreadId)?;
        self.next_id += 1;

        self.threads.insert(id, Tcb::new(id, priority, stack, context, entry));
        self.reserve_queues();
        self.run_queue.push_back(id);
        Ok(id)
    }

    fn reserve_queues(&mut self) {
        let live = self.threads.len();
        if self.run_queue.capacity() < live {
            self.run_queue.reserve(live - self.run_queue.len());
        }
        if self.to_free.capacity() < live {
            self.to_free.reserve(live - self.to_free.len());
        }
    }

    /// Makes `id` the current thread without a switch. Used when a fault
    /// reveals that the CPU is on a different stack than the one recorded;
    /// the recorded thread stays runnable at the head of the queue.
    pub fn adopt(&mut self, id: ThreadId) {
        let stale = core::mem::replace(&mut self.current, id);
        if stale != id {
            self.run_queue.push_front(stale);
        }
    }

    /// Puts `id` ahead of everything else, used for woken mutex waiters.
    pub fn enqueue_front(&mut self, id: ThreadId) {
        self.run_queue.push_front(id);
    }

    /// Round-robin step: the current thread goes to the tail and the head
    /// comes out. `None` when nobody else is runnable.
    pub fn rotate(&mut self) -> Option<ThreadId> {
        let next = self.run_queue.pop_front()?;
        self.run_queue.push_back(self.current);
        Some(next)
    }

    /// Who runs when the current thread blocks or exits: the run-queue head,
    /// or the main thread when the queue is empty. `None` only when the main
    /// thread itself is leaving and nothing else can run.
    pub fn successor(&mut self) -> Option<ThreadId> {
        self.run_queue
            .pop_front()
            .or_else(|| (self.current != ThreadId::MAIN).then_some(ThreadId::MAIN))
    }

    /// Makes `next` current and hands back what the context switch needs.
    /// Computing the timeslice advances `next`'s priority alternation.
    pub fn begin_switch(&mut self, next: ThreadId) -> Switch {
        let previous = core::mem::replace(&mut self.current, next);
        let from = self
            .threads
            .get_mut(&previous)
            .and_then(|tcb| tcb.context.as_mut())
            .map_or(ptr::null_mut(), |context| context as *mut Context);

        let tick = self.config.tick;
        let Some(tcb) = self.threads.get_mut(&next) else {
            unsafe { libc::abort() }
        };
        let timeslice = tcb.priority.timeslice(tick);
        let to = match tcb.context.as_ref() {
            Some(context) => context as *const Context,
            None => unsafe { libc::abort() },
        };

        Switch { from, to, timeslice }
    }

    /// Exit bookkeeping for `id`: store the result, wake the joiner at the
    /// run-queue tail and queue the context for lazy teardown.
    pub fn retire(&mut self, id: ThreadId, status: ExitStatus) {
        let Some(tcb) = self.threads.get_mut(&id) else {
            return;
        };
        tcb.status = ThreadStatus::PendingFree;
        tcb.exit = Some(status);
        let joiner = tcb.joiner;

        if let Some(joiner) = joiner {
            self.run_queue.push_back(joiner);
        }
        if id != ThreadId::MAIN {
            self.to_free.push(id);
        }
    }

    /// Tears down the stacks of exited threads. None of them can be running:
    /// an exiting thread always switches away before anyone gets here.
    pub fn reclaim_pending(&mut self) {
        let current = self.current;
        let threads = &mut self.threads;
        self.to_free.retain(|id| {
            if *id == current {
                return true;
            }
            if let Some(tcb) = threads.get_mut(id) {
                if tcb.status == ThreadStatus::PendingFree {
                    tcb.release_context();
                }
            }
            false
        });
    }

    /// Validates a join on `target` by the current thread and records the
    /// caller as its joiner.
    pub fn register_joiner(&mut self, target: ThreadId) -> ThreadResult<()> {
        let me = self.current;
        if target == me || self.thread(me)?.joiner == Some(target) {
            return Err(ThreadError::Deadlock);
        }

        let tcb = self.thread_mut(target)?;
        if tcb.joiner.is_some() {
            return Err(ThreadError::AlreadyJoined);
        }
        tcb.joiner = Some(me);
        Ok(())
    }

    /// Moves the return value out of a finished thread and reclaims it. The
    /// main thread's record stays until shutdown.
    pub fn collect(&mut self, target: ThreadId) -> ThreadResult<ExitStatus> {
        let tcb = self.thread_mut(target)?;
        let status = tcb.exit.unwrap_or(ExitStatus::Returned(0));
        if target == ThreadId::MAIN {
            return Ok(status);
        }

        if tcb.status == ThreadStatus::PendingFree {
            tcb.release_context();
            self.to_free.retain(|id| *id != target);
        }
        self.threads.remove(&target);
        Ok(status)
    }

    /// Reclaims every thread, the main thread last.
    pub fn teardown(&mut self) {
        let main = self.threads.remove(&ThreadId::MAIN);
        log::debug!("reclaiming {} threads", self.threads.len());
        self.to_free.clear();
        self.run_queue.clear();
        self.threads.clear();
        drop(main);
    }
}

pub(crate) struct SchedulerCell(UnsafeCell<Option<Scheduler>>);

// Only the OS thread that started the runtime touches the scheduler, and it
// does so with preemption masked.
unsafe impl Sync for SchedulerCell {}

impl SchedulerCell {
    pub const fn new() -> Self {
        SchedulerCell(UnsafeCell::new(None))
    }

    /// # Safety
    /// Preemption must be masked, or the caller must only read.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> Option<&mut Scheduler> {
        unsafe { (*self.0.get()).as_mut() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn install(&self, scheduler: Scheduler) -> &mut Scheduler {
        unsafe { (*self.0.get()).insert(scheduler) }
    }

    unsafe fn take(&self) -> Option<Scheduler> {
        unsafe { (*self.0.get()).take() }
    }
}

pub(crate) static SCHEDULER: SchedulerCell = SchedulerCell::new();

static EXIT_HOOK: Once<()> = Once::new();

/// Starts the runtime: overflow handling, the main thread's record and the
/// preemption timer.
pub(crate) fn start(config: RuntimeConfig) -> ThreadResult<&'static mut Scheduler> {
    if unsafe { SCHEDULER.get() }.is_some() {
        return Err(ThreadError::AlreadyInitialized);
    }

    stack_guard::arm()?;
    let scheduler = unsafe { SCHEDULER.install(Scheduler::new(config)) };
    if let Err(err) = preemption::start(config.tick) {
        unsafe { SCHEDULER.take() };
        return Err(err);
    }
    EXIT_HOOK.call_once(|| {
        if unsafe { libc::atexit(crate::sync::shutdown_at_exit) } != 0 {
            log::warn!("failed to register the exit hook; threads still queued at exit will not run");
        }
    });
    log::debug!("runtime started: {config:?}");
    Ok(scheduler)
}

/// The live scheduler, starting the runtime with default settings on first
/// use. Call with preemption masked.
pub(crate) fn scheduler() -> &'static mut Scheduler {
    match unsafe { SCHEDULER.get() } {
        Some(scheduler) => scheduler,
        None => start(RuntimeConfig::default())
            .unwrap_or_else(|err| fatal("failed to start the thread runtime", Some(err))),
    }
}

/// Whether a thread other than the current one could run. Safe to call from
/// the preemption handler.
pub(crate) fn has_runnable() -> bool {
    unsafe { SCHEDULER.get() }.is_some_and(|scheduler| scheduler.has_runnable())
}

/// The live thread whose stack guard contains `address`, if any. Called from
/// the fault handler, so it only reads.
pub(crate) fn guard_owner(address: usize) -> Option<ThreadId> {
    let scheduler = unsafe { SCHEDULER.get() }?;
    scheduler
        .threads
        .values()
        .find(|tcb| tcb.is_running() && tcb.owns_guard(address))
        .map(|tcb| tcb.id)
}

/// Stops preemption and reclaims everything. Call with preemption masked,
/// from the main thread.
pub(crate) fn teardown() {
    preemption::stop();
    if let Some(mut scheduler) = unsafe { SCHEDULER.take() } {
        scheduler.teardown();
        log::debug!("runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    extern "C" fn never_entered() -> ! {
        unreachable!()
    }

    fn spawn(scheduler: &mut Scheduler) -> ThreadId {
        scheduler
            .spawn(Box::new(|| 0), Priority::default(), 16 * 1024, never_entered)
            .unwrap()
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        assert_eq!(scheduler.current(), ThreadId::MAIN);
        assert!(!scheduler.has_runnable());
        assert!(scheduler.thread(ThreadId::MAIN).unwrap().is_running());
    }

    #[test]
    fn test_spawn_appends_in_order() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let first = spawn(&mut scheduler);
        let second = spawn(&mut scheduler);

        assert!(first < second);
        assert_eq!(scheduler.run_queue, [first, second]);
        assert!(scheduler.run_queue.capacity() >= 3);
        assert!(scheduler.to_free.capacity() >= 3);
    }

    #[test]
    fn test_rotate_is_round_robin() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let a = spawn(&mut scheduler);
        let b = spawn(&mut scheduler);

        let next = scheduler.rotate().unwrap();
        assert_eq!(next, a);
        scheduler.begin_switch(next);
        assert_eq!(scheduler.run_queue, [b, ThreadId::MAIN]);

        let next = scheduler.rotate().unwrap();
        assert_eq!(next, b);
        scheduler.begin_switch(next);
        assert_eq!(scheduler.run_queue, [ThreadId::MAIN, a]);
    }

    #[test]
    fn test_rotate_alone_stays_put() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        assert_eq!(scheduler.rotate(), None);
        assert!(!scheduler.has_runnable());
    }

    #[test]
    fn test_adopt_keeps_stale_current_runnable() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let a = spawn(&mut scheduler);
        let b = spawn(&mut scheduler);
        scheduler.run_queue.retain(|id| *id != b);

        scheduler.adopt(b);
        assert_eq!(scheduler.current(), b);
        assert_eq!(scheduler.run_queue, [ThreadId::MAIN, a]);

        scheduler.adopt(b);
        assert_eq!(scheduler.run_queue, [ThreadId::MAIN, a]);
    }

    #[test]
    fn test_begin_switch_uses_next_priority() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let id = spawn(&mut scheduler);
        scheduler.thread_mut(id).unwrap().priority = Priority::new(9).unwrap();

        let switch = scheduler.begin_switch(id);
        assert_eq!(scheduler.current(), id);
        assert_eq!(switch.timeslice, RuntimeConfig::DEFAULT_TICK * 5);
        assert!(!switch.from.is_null());
        assert!(!switch.to.is_null());
    }

    #[test]
    fn test_successor_falls_back_to_main() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let id = spawn(&mut scheduler);
        assert_eq!(scheduler.successor(), Some(id));
        scheduler.begin_switch(id);

        assert_eq!(scheduler.successor(), Some(ThreadId::MAIN));
        scheduler.begin_switch(ThreadId::MAIN);
        assert_eq!(scheduler.successor(), None);
    }

    #[test]
    fn test_woken_waiter_goes_first() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let a = spawn(&mut scheduler);
        let b = spawn(&mut scheduler);
        scheduler.run_queue.retain(|id| *id != b);

        scheduler.enqueue_front(b);
        assert_eq!(scheduler.run_queue, [b, a]);
    }

    #[test]
    fn test_retire_wakes_joiner_and_defers_teardown() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let child = spawn(&mut scheduler);

        scheduler.register_joiner(child).unwrap();
        scheduler.run_queue.clear();
        scheduler.begin_switch(child);
        scheduler.retire(child, ExitStatus::Returned(42));

        let tcb = scheduler.thread(child).unwrap();
        assert_eq!(tcb.status, ThreadStatus::PendingFree);
        assert!(tcb.stack.is_some());
        assert_eq!(scheduler.run_queue, [ThreadId::MAIN]);
        assert_eq!(scheduler.to_free, [child]);

        scheduler.begin_switch(ThreadId::MAIN);
        scheduler.reclaim_pending();
        let tcb = scheduler.thread(child).unwrap();
        assert_eq!(tcb.status, ThreadStatus::Freed);
        assert!(tcb.stack.is_none() && tcb.context.is_none());

        assert_eq!(scheduler.collect(child), Ok(ExitStatus::Returned(42)));
        assert_eq!(scheduler.thread(child).err(), Some(ThreadError::InvalidThreadId));
    }

    #[test]
    fn test_collect_tears_down_pending_thread() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let child = spawn(&mut scheduler);
        scheduler.run_queue.clear();
        scheduler.retire(child, ExitStatus::Returned(0));

        assert_eq!(scheduler.collect(child), Ok(ExitStatus::Returned(0)));
        assert!(scheduler.to_free.is_empty());
        assert!(scheduler.thread(child).is_err());
    }

    #[test]
    fn test_join_errors() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let a = spawn(&mut scheduler);
        let b = spawn(&mut scheduler);

        assert_eq!(scheduler.register_joiner(ThreadId::MAIN), Err(ThreadError::Deadlock));
        scheduler.register_joiner(a).unwrap();
        assert_eq!(scheduler.thread(a).unwrap().joiner, Some(ThreadId::MAIN));

        // b now tries to join a, which main already joins.
        scheduler.begin_switch(b);
        assert_eq!(scheduler.register_joiner(a), Err(ThreadError::AlreadyJoined));

        // a tries to join main, which is waiting on a.
        scheduler.begin_switch(a);
        assert_eq!(scheduler.register_joiner(ThreadId::MAIN), Err(ThreadError::Deadlock));
    }

    #[test]
    fn test_main_is_never_collected() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let child = spawn(&mut scheduler);
        scheduler.begin_switch(child);
        scheduler.retire(ThreadId::MAIN, ExitStatus::Returned(3));

        assert!(scheduler.to_free.is_empty());
        assert_eq!(scheduler.collect(ThreadId::MAIN), Ok(ExitStatus::Returned(3)));
        assert!(scheduler.thread(ThreadId::MAIN).is_ok());
    }

    #[test]
    fn test_guard_owner_matches_guard_only() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        let id = spawn(&mut scheduler);
        let tcb = scheduler.thread(id).unwrap();
        let guard = tcb.stack.as_ref().unwrap().guard_region();
        let usable = tcb.stack.as_ref().unwrap().usable();

        let owner = |address| {
            scheduler
                .threads
                .values()
                .find(|tcb| tcb.is_running() && tcb.owns_guard(address))
                .map(|tcb| tcb.id)
        };
        assert_eq!(owner(guard.start), Some(id));
        assert_eq!(owner(guard.end - 1), Some(id));
        assert_eq!(owner(usable.start), None);
    }

    #[test]
    fn test_teardown_empties_registry() {
        let mut scheduler = Scheduler::new(RuntimeConfig::default());
        spawn(&mut scheduler);
        spawn(&mut scheduler);
        scheduler.teardown();
        assert!(scheduler.threads.is_empty());
        assert!(!scheduler.has_runnable());
    }
}
