/*!
    the realtime cyclic scheduling primitive both masters run on.

    A [CyclicTask] is a dedicated thread waking at a fixed period on a
    timerfd-backed wait, with its own scheduling priority and stack budget,
    invoking one work callback per tick. It is deliberately not part of any
    shared executor: the point is a thread the OS scheduler can preempt
    everything else for.

    Overrun policy: a callback still running at the next tick makes the task
    skip that tick (ticks are never queued nor coalesced) and count an
    overrun. Overruns are a health indicator to watch, not an error.
*/

use core::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    };
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
    };


/// scheduling parameters of a [CyclicTask]
#[derive(Clone, Debug)]
pub struct TaskConfig {
    /// thread name, shows up in scheduler tooling
    pub name: String,
    /// invocation period of the work callback
    pub period: Duration,
    /// FIFO realtime priority from 1 to 99, or 0 for a regular thread
    pub priority: u8,
    /// stack budget of the task thread
    pub stack: usize,
}
impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "cyclic".into(),
            period: Duration::from_millis(1),
            priority: 0,
            stack: 512 * 1024,
        }
    }
}

/**
    a periodic realtime task running one work callback.

    The callback is a future factory so one invocation can await bus
    exchanges; it is polled on a runtime private to the task thread, so
    nothing else competes for it. [CyclicTask::stop] halts further
    invocations and only returns once any in-flight invocation completed.
*/
pub struct CyclicTask {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CyclicTask {
    /// start the periodic invocations, the first tick comes one period from now
    pub fn spawn<F, W>(config: TaskConfig, mut work: F) -> io::Result<Self>
    where
        F: FnMut() -> W + Send + 'static,
        W: Future<Output = ()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));
        let overruns = Arc::new(AtomicU64::new(0));

        let period = config.period;
        let priority = config.priority;
        let thread_running = running.clone();
        let thread_ticks = ticks.clone();
        let thread_overruns = overruns.clone();

        let handle = std::thread::Builder::new()
            .name(config.name.clone())
            .stack_size(config.stack)
            .spawn(move || {
                #[cfg(not(target_os = "linux"))]
                let _ = priority;
                #[cfg(target_os = "linux")]
                if priority != 0 {
                    let level = thread_priority::ThreadPriorityValue::try_from(priority)
                        .map(thread_priority::ThreadPriority::Crossplatform)
                        .unwrap_or(thread_priority::ThreadPriority::Max);
                    if let Err(error) = thread_priority::set_thread_priority_and_policy(
                        thread_priority::thread_native_id(),
                        level,
                        thread_priority::ThreadSchedulePolicy::Realtime(
                            thread_priority::RealtimeThreadSchedulePolicy::Fifo),
                        )
                    {
                        log::warn!("cyclic task: no realtime priority, continuing best-effort: {error:?}");
                    }
                }

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        log::error!("cyclic task: cannot start its runtime: {error}");
                        return
                    }
                };

                runtime.block_on(async move {
                    let mut next = Instant::now() + period;
                    while thread_running.load(Ordering::Acquire) {
                        match tokio_timerfd::Delay::new(next) {
                            Ok(delay) => if let Err(error) = delay.await {
                                log::error!("cyclic task: wait failed, stopping: {error}");
                                break
                            },
                            Err(error) => {
                                log::error!("cyclic task: timer unavailable, stopping: {error}");
                                break
                            }
                        }
                        if ! thread_running.load(Ordering::Acquire) {break}

                        work().await;
                        thread_ticks.fetch_add(1, Ordering::Relaxed);

                        // skip the ticks the callback ran over, never queue them
                        next += period;
                        let now = Instant::now();
                        while next <= now {
                            next += period;
                            thread_overruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            })?;

        Ok(Self {
            running,
            ticks,
            overruns,
            handle: Some(handle),
        })
    }

    /// number of completed invocations of the work callback
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
    /// number of ticks skipped because the previous invocation overran
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
    /// false once the task stopped or failed
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().map(|handle| ! handle.is_finished()).unwrap_or(false)
    }

    /**
        halt further invocations.

        Returns once any in-flight invocation has completed, which takes up
        to one period plus the longest bus deadline the callback awaits on.
    */
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("cyclic task: its thread panicked");
            }
        }
    }
}

impl Drop for CyclicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
