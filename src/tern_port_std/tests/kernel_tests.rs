//! Kernel behavior tests, driven through the simulator port.
//!
//! Each test module instantiates its own kernel. The scenario logic runs in
//! the root task; a panicking assertion inside any task fails the test via
//! the harness in `run_kernel`.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex, OnceLock,
};

use tern_kernel::{
    EventWaitFlags, KernelError, ObjName, QueueFlags, SemFlags, SemId, System, TaskFlags,
    TaskMode, TimeOfDay, WaitFlags,
};

fn name(bytes: &[u8; 4]) -> ObjName {
    ObjName::new(*bytes)
}

/// A task preempted by a higher-priority wakeup resumes only afterwards.
mod priority_preemption {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static SEM: OnceLock<SemId> = OnceLock::new();

    fn low_task(_: [u32; 4]) {
        loop {
            LOG.lock().unwrap().push("low");
            Sys::timer_wake_after(10).unwrap();
        }
    }

    fn high_task(_: [u32; 4]) {
        LOG.lock().unwrap().push("high:waiting");
        Sys::sem_p(*SEM.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        LOG.lock().unwrap().push("high:acquired");
        loop {
            Sys::timer_wake_after(1000).unwrap();
        }
    }

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"PSEM"), 0, SemFlags::empty()).unwrap();
        SEM.set(sem).unwrap();

        let high = Sys::task_create(name(b"HIGH"), 5, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(high, TaskMode::empty(), high_task, [0; 4]).unwrap();
        let low = Sys::task_create(name(b"LOW "), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(low, TaskMode::empty(), low_task, [0; 4]).unwrap();

        // Let HIGH reach its acquire and LOW start looping
        Sys::timer_wake_after(35).unwrap();

        let switches_before = Sys::context_switch_count().unwrap();
        LOG.lock().unwrap().push("signal");
        Sys::sem_v(sem).unwrap();
        Sys::timer_wake_after(35).unwrap();
        let switches_after = Sys::context_switch_count().unwrap();

        let log = LOG.lock().unwrap().clone();
        let signal = log.iter().position(|s| *s == "signal").unwrap();
        let acquired = log.iter().position(|s| *s == "high:acquired").unwrap();
        let next_low = log
            .iter()
            .enumerate()
            .position(|(i, s)| i > signal && *s == "low")
            .unwrap();
        assert!(acquired > signal, "HIGH ran before the signal: {log:?}");
        assert!(
            acquired < next_low,
            "HIGH must run before LOW resumes: {log:?}"
        );
        assert!(switches_after > switches_before);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn priority_preemption() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A periodic timer posts its event once per period, and only then.
mod timer_periodic {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let start = Sys::tick_count();
        let timer = Sys::timer_event_every(100, 0x1).unwrap();

        for n in 1..=3 {
            let got = Sys::ev_receive(0x1, EventWaitFlags::ANY, 0).unwrap();
            assert_eq!(got, 0x1);
            assert_eq!(Sys::tick_count(), start + 100 * n);
        }

        // Nothing further is pending until the next period elapses
        assert_eq!(
            Sys::ev_receive(0x1, EventWaitFlags::ANY | EventWaitFlags::NO_WAIT, 0),
            Err(KernelError::NoEvents)
        );

        Sys::timer_cancel(timer).unwrap();

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn timer_periodic() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Messages come out of a queue in send order, word-for-word.
mod queue_fifo {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let queue = Sys::queue_create(name(b"QFIF"), 4, QueueFlags::empty()).unwrap();

        Sys::queue_send(queue, [1, 0xdead_beef, 2, 3]).unwrap();
        Sys::queue_send(queue, [2, 0, 0, 0]).unwrap();
        Sys::queue_send(queue, [3, 0, 0, 0]).unwrap();

        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::empty(), 0).unwrap(),
            [1, 0xdead_beef, 2, 3]
        );
        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::empty(), 0).unwrap(),
            [2, 0, 0, 0]
        );
        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::empty(), 0).unwrap(),
            [3, 0, 0, 0]
        );
        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::NO_WAIT, 0),
            Err(KernelError::NoMessage)
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn queue_fifo() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// An urgent message jumps the line.
mod queue_urgent {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let queue = Sys::queue_create(name(b"QURG"), 4, QueueFlags::empty()).unwrap();

        Sys::queue_send(queue, [1, 0, 0, 0]).unwrap();
        Sys::queue_send(queue, [2, 0, 0, 0]).unwrap();
        Sys::queue_urgent(queue, [9, 0, 0, 0]).unwrap();

        for expected in [9, 1, 2] {
            let msg = Sys::queue_receive(queue, WaitFlags::empty(), 0).unwrap();
            assert_eq!(msg[0], expected);
        }

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn queue_urgent() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A full queue rejects sends until a message is drained.
mod queue_full {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let queue = Sys::queue_create(name(b"QFUL"), 4, QueueFlags::empty()).unwrap();

        for n in 0..4 {
            Sys::queue_send(queue, [n, 0, 0, 0]).unwrap();
        }
        assert_eq!(
            Sys::queue_send(queue, [99, 0, 0, 0]),
            Err(KernelError::QueueFull)
        );
        assert_eq!(
            Sys::queue_urgent(queue, [99, 0, 0, 0]),
            Err(KernelError::QueueFull)
        );

        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::empty(), 0).unwrap(),
            [0, 0, 0, 0]
        );
        Sys::queue_send(queue, [4, 0, 0, 0]).unwrap();

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn queue_full() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A priority-ordered semaphore wakes waiters by priority; arrival order
/// breaks ties.
mod sem_priority_order {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static WOKE: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static SEM: OnceLock<SemId> = OnceLock::new();

    fn waiter(args: [u32; 4]) {
        Sys::sem_p(*SEM.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        WOKE.lock().unwrap().push(args[0]);
    }

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"SPRI"), 0, SemFlags::PRIORITY_WAIT).unwrap();
        SEM.set(sem).unwrap();

        // Arrival order 2, 5, 3 — staggered so each waiter reaches the
        // semaphore before the next one starts
        for (tag, priority) in [(2u32, 2u8), (5, 5), (3, 3)] {
            let task = Sys::task_create(name(b"WAIT"), priority, 1024, TaskFlags::empty()).unwrap();
            Sys::task_start(task, TaskMode::empty(), waiter, [tag, 0, 0, 0]).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }

        // Release one at a time; the highest-priority waiter takes each
        for _ in 0..3 {
            Sys::sem_v(sem).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }

        assert_eq!(*WOKE.lock().unwrap(), vec![2, 3, 5]);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn sem_priority_order() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A FIFO semaphore wakes waiters strictly in arrival order.
mod sem_fifo_order {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static WOKE: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static SEM: OnceLock<SemId> = OnceLock::new();

    fn waiter(args: [u32; 4]) {
        Sys::sem_p(*SEM.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        WOKE.lock().unwrap().push(args[0]);
    }

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"SFIF"), 0, SemFlags::empty()).unwrap();
        SEM.set(sem).unwrap();

        for (tag, priority) in [(5u32, 5u8), (3, 3), (2, 2)] {
            let task = Sys::task_create(name(b"WAIT"), priority, 1024, TaskFlags::empty()).unwrap();
            Sys::task_start(task, TaskMode::empty(), waiter, [tag, 0, 0, 0]).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }

        for _ in 0..3 {
            Sys::sem_v(sem).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }

        assert_eq!(*WOKE.lock().unwrap(), vec![5, 3, 2]);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn sem_fifo_order() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A timed-out acquire returns `Timeout` and leaves no trace on the
/// semaphore.
mod sem_timeout {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"STMO"), 0, SemFlags::empty()).unwrap();

        let start = Sys::tick_count();
        assert_eq!(
            Sys::sem_p(sem, WaitFlags::empty(), 50),
            Err(KernelError::Timeout)
        );
        assert_eq!(Sys::tick_count(), start + 50);

        // The departed waiter left the queue: this release banks a count
        // instead of waking anything, and the count is still there
        Sys::sem_v(sem).unwrap();
        Sys::sem_p(sem, WaitFlags::NO_WAIT, 0).unwrap();
        assert_eq!(
            Sys::sem_p(sem, WaitFlags::NO_WAIT, 0),
            Err(KernelError::NoSemaphore)
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn sem_timeout() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// An ALL-condition event wait completes only when every requested bit is
/// pending.
mod event_all {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static ROOT_ID: OnceLock<tern_kernel::TaskId> = OnceLock::new();

    fn sender(_: [u32; 4]) {
        let root = *ROOT_ID.get().unwrap();
        LOG.lock().unwrap().push("send:1");
        Sys::ev_send(root, 0x1).unwrap();
        Sys::timer_wake_after(10).unwrap();
        LOG.lock().unwrap().push("send:2");
        Sys::ev_send(root, 0x2).unwrap();
    }

    fn root(_: [u32; 4]) {
        ROOT_ID.set(Sys::current_task().unwrap()).unwrap();

        let task = Sys::task_create(name(b"SEND"), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(task, TaskMode::empty(), sender, [0; 4]).unwrap();

        let got = Sys::ev_receive(0x3, EventWaitFlags::empty(), 0).unwrap();
        LOG.lock().unwrap().push("woke");
        assert_eq!(got, 0x3);

        // The first send alone must not have completed the wait
        assert_eq!(
            *LOG.lock().unwrap(),
            vec!["send:1", "send:2", "woke"]
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn event_all() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Round-trip laws: semaphore counts balance, events echo back.
mod round_trips {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        // For every matched P/V pair the count is unchanged
        let sem = Sys::sem_create(name(b"SBAL"), 3, SemFlags::empty()).unwrap();
        Sys::sem_p(sem, WaitFlags::empty(), 0).unwrap();
        Sys::sem_v(sem).unwrap();
        for _ in 0..3 {
            Sys::sem_p(sem, WaitFlags::NO_WAIT, 0).unwrap();
        }
        assert_eq!(
            Sys::sem_p(sem, WaitFlags::NO_WAIT, 0),
            Err(KernelError::NoSemaphore)
        );

        // Self-send then receive returns exactly the sent set
        let me = Sys::current_task().unwrap();
        Sys::ev_send(me, 0xa5).unwrap();
        assert_eq!(Sys::ev_receive(0xa5, EventWaitFlags::ANY, 0).unwrap(), 0xa5);

        // Unrequested pending bits stay pending
        Sys::ev_send(me, 0x30).unwrap();
        assert_eq!(Sys::ev_receive(0x10, EventWaitFlags::ANY, 0).unwrap(), 0x10);
        assert_eq!(
            Sys::ev_receive(0x20, EventWaitFlags::ANY | EventWaitFlags::NO_WAIT, 0).unwrap(),
            0x20
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn round_trips() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Parameter validation across the call surface.
mod boundaries {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        assert_eq!(
            Sys::timer_event_after(0, 0x1),
            Err(KernelError::IllegalTicks)
        );
        assert_eq!(Sys::timer_wake_after(0), Err(KernelError::IllegalTicks));
        assert_eq!(
            Sys::queue_create(name(b"Q0  "), 0, QueueFlags::empty()),
            Err(KernelError::BadParam)
        );
        assert_eq!(
            Sys::ev_receive(0, EventWaitFlags::ANY, 0),
            Err(KernelError::BadParam)
        );
        assert_eq!(
            Sys::task_create(name(b"P0  "), 0, 1024, TaskFlags::empty()),
            Err(KernelError::BadPriority)
        );
        assert_eq!(
            Sys::task_create(name(b"TINY"), 10, 16, TaskFlags::empty()),
            Err(KernelError::TinyStack)
        );
        assert_eq!(Sys::task_ident(name(b"NONE")), Err(KernelError::ObjectNotFound));
        assert_eq!(Sys::sem_ident(name(b"NONE")), Err(KernelError::ObjectNotFound));
        assert_eq!(Sys::queue_ident(name(b"NONE")), Err(KernelError::ObjectNotFound));

        // Registers
        let me = Sys::current_task().unwrap();
        Sys::task_set_register(me, 3, 0x1234).unwrap();
        assert_eq!(Sys::task_get_register(me, 3).unwrap(), 0x1234);
        assert_eq!(
            Sys::task_get_register(me, 8),
            Err(KernelError::BadRegister)
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn boundaries() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Suspension, resumption, and their error outcomes. Suspending a task
/// blocked on IPC is deferred until its wait concludes.
mod suspend_resume {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn worker(_: [u32; 4]) {
        loop {
            Sys::ev_receive(0x1, EventWaitFlags::ANY, 0).unwrap();
            COUNTER.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn root(_: [u32; 4]) {
        let task = Sys::task_create(name(b"WORK"), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(task, TaskMode::empty(), worker, [0; 4]).unwrap();

        for _ in 0..3 {
            Sys::ev_send(task, 0x1).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 3);

        // The worker is blocked in its receive: suspension is deferred
        Sys::task_suspend(task).unwrap();
        assert_eq!(Sys::task_suspend(task), Err(KernelError::Suspended));

        // The satisfied wait parks the worker in Suspended instead of
        // letting it run
        Sys::ev_send(task, 0x1).unwrap();
        Sys::timer_wake_after(50).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 3);

        Sys::task_resume(task).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 4);

        // Blocked again, with no suspension pending
        assert_eq!(Sys::task_resume(task), Err(KernelError::NotSuspended));

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn suspend_resume() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Restart tears the old activation down and enters the entry point with
/// the new argument vector.
mod task_restart {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static SEEN: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn worker(args: [u32; 4]) {
        SEEN.lock().unwrap().push(args[0]);
        loop {
            Sys::timer_wake_after(100).unwrap();
        }
    }

    fn root(_: [u32; 4]) {
        let task = Sys::task_create(name(b"REST"), 10, 1024, TaskFlags::empty()).unwrap();

        assert_eq!(Sys::task_restart(task, [0; 4]), Err(KernelError::NotActive));

        Sys::task_start(task, TaskMode::empty(), worker, [7, 0, 0, 0]).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(*SEEN.lock().unwrap(), vec![7]);

        Sys::task_restart(task, [8, 0, 0, 0]).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(*SEEN.lock().unwrap(), vec![7, 8]);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn task_restart() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Deleting an object wakes its waiters with `ObjectDeleted`, and stale ids
/// are recognized.
mod deletion {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static OUTCOME: Mutex<Option<Result<(), KernelError>>> = Mutex::new(None);
    static SEM: OnceLock<SemId> = OnceLock::new();

    fn waiter(_: [u32; 4]) {
        let result = Sys::sem_p(*SEM.get().unwrap(), WaitFlags::empty(), 0);
        *OUTCOME.lock().unwrap() = Some(result);
        loop {
            Sys::timer_wake_after(1000).unwrap();
        }
    }

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"SDEL"), 0, SemFlags::empty()).unwrap();
        SEM.set(sem).unwrap();

        let task = Sys::task_create(name(b"WAIT"), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(task, TaskMode::empty(), waiter, [0; 4]).unwrap();
        Sys::timer_wake_after(10).unwrap();

        Sys::sem_delete(sem).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(
            *OUTCOME.lock().unwrap(),
            Some(Err(KernelError::ObjectDeleted))
        );

        // The stale id no longer names anything
        assert_eq!(Sys::sem_v(sem), Err(KernelError::ObjectDeleted));

        // Deleted tasks are recognized too
        Sys::task_delete(task).unwrap();
        assert_eq!(Sys::task_resume(task), Err(KernelError::ObjectDeleted));

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn deletion() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Broadcast replicates a message to every waiting receiver.
mod queue_broadcast {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static GOT: Mutex<Vec<[u32; 4]>> = Mutex::new(Vec::new());
    static QUEUE: OnceLock<tern_kernel::QueueId> = OnceLock::new();

    fn receiver(_: [u32; 4]) {
        let msg = Sys::queue_receive(*QUEUE.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        GOT.lock().unwrap().push(msg);
    }

    fn root(_: [u32; 4]) {
        let queue = Sys::queue_create(name(b"QBRD"), 4, QueueFlags::empty()).unwrap();
        QUEUE.set(queue).unwrap();

        for _ in 0..2 {
            let task = Sys::task_create(name(b"RECV"), 10, 1024, TaskFlags::empty()).unwrap();
            Sys::task_start(task, TaskMode::empty(), receiver, [0; 4]).unwrap();
        }
        Sys::timer_wake_after(10).unwrap();

        assert_eq!(Sys::queue_broadcast(queue, [0xb, 0, 0, 0]).unwrap(), 2);
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(*GOT.lock().unwrap(), vec![[0xb, 0, 0, 0]; 2]);

        // With nobody waiting, broadcast degenerates to an ordinary send
        assert_eq!(Sys::queue_broadcast(queue, [0xc, 0, 0, 0]).unwrap(), 0);
        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::NO_WAIT, 0).unwrap(),
            [0xc, 0, 0, 0]
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn queue_broadcast() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// The calendar clock follows virtual time and drives absolute timers.
mod calendar_clock {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        // 2031-05-12 13:45:10.0
        Sys::time_set(TimeOfDay {
            date: (2031 << 16) | (5 << 8) | 12,
            time: (13 << 16) | (45 << 8) | 10,
            ticks: 0,
        })
        .unwrap();

        Sys::timer_wake_after(150).unwrap();

        let now = Sys::time_get().unwrap();
        assert_eq!(now.date, (2031 << 16) | (5 << 8) | 12);
        assert_eq!(now.time, (13 << 16) | (45 << 8) | 11);
        assert_eq!(now.ticks, 50);

        // An absolute timer two seconds out fires at the right tick
        let start = Sys::tick_count();
        Sys::timer_event_when(
            TimeOfDay {
                date: (2031 << 16) | (5 << 8) | 12,
                time: (13 << 16) | (45 << 8) | 13,
                ticks: 50,
            },
            0x1,
        )
        .unwrap();
        assert_eq!(Sys::ev_receive(0x1, EventWaitFlags::ANY, 0).unwrap(), 0x1);
        assert_eq!(Sys::tick_count(), start + 200);

        // Nonsense dates are rejected
        assert_eq!(
            Sys::time_set(TimeOfDay {
                date: (2031 << 16) | (13 << 8) | 1,
                time: 0,
                ticks: 0,
            }),
            Err(KernelError::BadParam)
        );

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn calendar_clock() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// A blocked receive completes when a message arrives, and a timed-out
/// receive reports `Timeout`.
mod queue_blocking {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static QUEUE: OnceLock<tern_kernel::QueueId> = OnceLock::new();
    static GOT: Mutex<Option<[u32; 4]>> = Mutex::new(None);

    fn receiver(_: [u32; 4]) {
        let msg = Sys::queue_receive(*QUEUE.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        *GOT.lock().unwrap() = Some(msg);
        loop {
            Sys::timer_wake_after(1000).unwrap();
        }
    }

    fn root(_: [u32; 4]) {
        let queue = Sys::queue_create(name(b"QBLK"), 4, QueueFlags::empty()).unwrap();
        QUEUE.set(queue).unwrap();

        let task = Sys::task_create(name(b"RECV"), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(task, TaskMode::empty(), receiver, [0; 4]).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(*GOT.lock().unwrap(), None);

        Sys::queue_send(queue, [42, 43, 44, 45]).unwrap();
        Sys::timer_wake_after(10).unwrap();
        assert_eq!(*GOT.lock().unwrap(), Some([42, 43, 44, 45]));

        // A bounded receive on an empty queue times out
        let start = Sys::tick_count();
        assert_eq!(
            Sys::queue_receive(queue, WaitFlags::empty(), 30),
            Err(KernelError::Timeout)
        );
        assert_eq!(Sys::tick_count(), start + 30);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn queue_blocking() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Sleeps stack up correctly with other timers in the timeout list.
mod wake_after {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    fn root(_: [u32; 4]) {
        let start = Sys::tick_count();
        Sys::timer_wake_after(7).unwrap();
        Sys::timer_wake_after(13).unwrap();
        assert_eq!(Sys::tick_count(), start + 20);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn wake_after() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}

/// Changing priorities reorders both ready tasks and blocked waiters.
mod set_priority {
    use super::*;

    tern_port_std::use_port!(struct Traits);
    type Sys = System<Traits>;

    static WOKE: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static SEM: OnceLock<SemId> = OnceLock::new();

    fn waiter(args: [u32; 4]) {
        Sys::sem_p(*SEM.get().unwrap(), WaitFlags::empty(), 0).unwrap();
        WOKE.lock().unwrap().push(args[0]);
    }

    fn root(_: [u32; 4]) {
        let sem = Sys::sem_create(name(b"SPRI"), 0, SemFlags::PRIORITY_WAIT).unwrap();
        SEM.set(sem).unwrap();

        let first = Sys::task_create(name(b"WAT1"), 10, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(first, TaskMode::empty(), waiter, [1, 0, 0, 0]).unwrap();
        Sys::timer_wake_after(10).unwrap();
        let second = Sys::task_create(name(b"WAT2"), 20, 1024, TaskFlags::empty()).unwrap();
        Sys::task_start(second, TaskMode::empty(), waiter, [2, 0, 0, 0]).unwrap();
        Sys::timer_wake_after(10).unwrap();

        // Boost the late arrival past the early one while both wait
        assert_eq!(Sys::task_set_priority(second, 5).unwrap(), 20);

        for _ in 0..2 {
            Sys::sem_v(sem).unwrap();
            Sys::timer_wake_after(10).unwrap();
        }
        assert_eq!(*WOKE.lock().unwrap(), vec![2, 1]);

        tern_port_std::shutdown::<Traits>();
        let _ = Sys::task_suspend(Sys::current_task().unwrap());
    }

    #[test]
    fn set_priority() {
        tern_port_std::run_kernel::<Traits>(root);
    }
}
