//! The periodic trigger block.
//!
//! `ptrig` wraps one or more trigger chains in a dedicated worker
//! thread that ticks to absolute deadlines on the monotonic clock,
//! optionally under `SCHED_FIFO`/`SCHED_RR` with a configured priority
//! and stack size.
//!
//! Two state views coexist: the *desired* state driven by the owning
//! thread through the lifecycle hooks, and the *actual* thread state
//! the worker reports back so shutdown can wait for acknowledgement.
//! The worker suspends only in the condition wait while inactive and in
//! the absolute-time sleep between cycles; a misbehaving chain target
//! wedges it by design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crate::block::{Block, BlockProto, Computation, ConfigSpec, PortSpec};
use crate::error::{Error, Result};
use crate::module::Module;
use crate::node::Node;
use crate::time::{gettime, sleep_until, Timespec};
use crate::trigger::{configure_chains, init_chains, trigger_configs, write_profiles, Chain, Tstat};
use crate::types::{DataType, PortableType, Value};
use crate::{log_err, log_warn};

#[cfg(test)]
mod test;

/// Prototype name registered by [`PtrigMod`].
pub const PTRIG_PROTO: &str = "ptrig";

// Bounded wait for the worker to acknowledge shutdown: 30 polls of
// 10 ms, as a compromise between teardown latency and slow schedules.
const THREAD_STOP_RETRIES: u32 = 30;
const THREAD_STOP_POLL: Duration = Duration::from_millis(10);

/// Trigger interval; a registered struct type so it can be configured
/// like any other value.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Period {
    pub sec: i64,
    pub usec: i64,
}

unsafe impl PortableType for Period {
    const TYPE_NAME: &'static str = "period";
}

impl Period {
    fn to_timespec(self) -> Timespec {
        Timespec::new(self.sec, self.usec * 1_000)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Desired {
    Inactive,
    Active,
    Exit,
}

struct Shared {
    desired: Mutex<Desired>,
    cond: Condvar,
    // Actual worker state, reported back for bounded shutdown.
    thread_active: AtomicBool,
    chains: Mutex<Vec<Chain>>,
}

impl Shared {
    fn set_desired(&self, desired: Desired) {
        *lock(&self.desired) = desired;
        self.cond.notify_one();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The periodic trigger implementation.
#[derive(Default)]
pub struct Ptrig {
    num_chains: usize,
    shared: Option<Arc<Shared>>,
    worker: Option<thread::JoinHandle<()>>,
}

struct SchedConfig {
    policy: i32,
    priority: i32,
    stacksize: usize,
    thread_name: String,
}

fn sched_config(b: &Block) -> Result<SchedConfig> {
    let stacksize = b.config_scalar::<usize>("stacksize")?.unwrap_or(0);
    #[allow(clippy::unnecessary_cast)]
    let stack_min = libc::PTHREAD_STACK_MIN as usize;
    if stacksize > 0 && stacksize < stack_min {
        log_err!(b, "stacksize ({stacksize}) less than PTHREAD_STACK_MIN ({stack_min})");
        return Err(Error::InvalidConfig(format!("stacksize={stacksize}")));
    }

    let policy_str = b
        .config_str("sched_policy")?
        .unwrap_or_else(|| "SCHED_OTHER".to_string());
    let policy = match policy_str.as_str() {
        "SCHED_OTHER" => libc::SCHED_OTHER,
        "SCHED_FIFO" => libc::SCHED_FIFO,
        "SCHED_RR" => libc::SCHED_RR,
        other => {
            log_err!(b, "sched_policy: illegal value {other}");
            return Err(Error::InvalidConfig(format!("sched_policy={other}")));
        }
    };

    let priority = b.config_scalar::<i32>("sched_priority")?.unwrap_or(0);
    let rt_policy = policy == libc::SCHED_FIFO || policy == libc::SCHED_RR;
    if (rt_policy && priority == 0) || (!rt_policy && priority != 0) {
        log_err!(b, "sched_priority {priority} invalid with {policy_str}");
        return Err(Error::InvalidConfig(format!(
            "sched_priority={priority} with {policy_str}"
        )));
    }

    let thread_name = b
        .config_str("thread_name")?
        .unwrap_or_else(|| b.name().to_string());

    Ok(SchedConfig {
        policy,
        priority,
        stacksize,
        thread_name,
    })
}

impl Computation for Ptrig {
    fn init(&mut self, b: &Block) -> Result<()> {
        self.num_chains = init_chains(b)?;

        let period = b
            .config_scalar::<Period>("period")?
            .ok_or_else(|| Error::InvalidConfig("period unconfigured".to_string()))?
            .to_timespec();
        let sched = sched_config(b)?;

        let shared = Arc::new(Shared {
            desired: Mutex::new(Desired::Inactive),
            cond: Condvar::new(),
            thread_active: AtomicBool::new(false),
            chains: Mutex::new(Vec::new()),
        });

        let mut builder = thread::Builder::new().name(sched.thread_name.clone());
        if sched.stacksize > 0 {
            builder = builder.stack_size(sched.stacksize);
        }

        let weak = b.weak();
        let worker_shared = Arc::clone(&shared);
        let worker = builder
            .spawn(move || worker_loop(weak, worker_shared, period, sched.policy, sched.priority))
            .map_err(|e| {
                log_err!(b, "spawning worker thread failed: {e}");
                Error::Io(e)
            })?;

        self.shared = Some(shared);
        self.worker = Some(worker);
        Ok(())
    }

    fn start(&mut self, b: &Block) -> Result<()> {
        let mut chains = configure_chains(b, self.num_chains)?;
        for chain in &mut chains {
            chain.arm();
        }

        let shared = self.shared.as_ref().ok_or(Error::InvalidBlock)?;
        *lock(&shared.chains) = chains;
        shared.set_desired(Desired::Active);
        Ok(())
    }

    fn stop(&mut self, _b: &Block) {
        if let Some(shared) = &self.shared {
            // The worker flushes tstats and acknowledges on its way
            // into the condition wait.
            shared.set_desired(Desired::Inactive);
        }
    }

    fn cleanup(&mut self, b: &Block) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.set_desired(Desired::Exit);

        let Some(worker) = self.worker.take() else {
            return;
        };

        // Bounded wait for the worker to report back inactive.
        for _ in 0..THREAD_STOP_RETRIES {
            if !shared.thread_active.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(THREAD_STOP_POLL);
        }

        if shared.thread_active.load(Ordering::Acquire) {
            // No forced cancellation: the worker exits at its next
            // wake-up, we just stop waiting for it.
            log_warn!(b, "timeout waiting for worker thread to stop");
            return;
        }

        if worker.join().is_err() {
            log_err!(b, "worker thread panicked");
        }
    }

    fn step(&mut self, _b: &Block) -> Result<()> {
        // ptrig carries its own activity; being stepped is a no-op.
        Ok(())
    }
}

fn worker_loop(weak: Weak<Block>, shared: Arc<Shared>, period: Timespec, policy: i32, priority: i32) {
    if policy != libc::SCHED_OTHER || priority != 0 {
        if let Err(e) = crate::ffi::syscall::setschedparam_self(policy, priority) {
            if let Some(b) = weak.upgrade() {
                log_warn!(b, "setting scheduling policy failed: {e}");
            }
        }
    }

    let mut current_chain = 0usize;
    let mut warned_chain: Option<i32> = None;
    let mut active_val: Option<Value> = None;
    // Nothing to flush before the first activation.
    let mut flushed = true;

    loop {
        {
            let mut desired = lock(&shared.desired);
            loop {
                match *desired {
                    Desired::Active => break,
                    Desired::Exit => {
                        shared.thread_active.store(false, Ordering::Release);
                        return;
                    }
                    Desired::Inactive => {
                        if !flushed {
                            flush_stats(&weak, &shared);
                            flushed = true;
                        }
                        shared.thread_active.store(false, Ordering::Release);
                        desired = shared
                            .cond
                            .wait(desired)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            shared.thread_active.store(true, Ordering::Release);
            flushed = false;
        }

        let Some(b) = weak.upgrade() else {
            shared.thread_active.store(false, Ordering::Release);
            return;
        };

        let mut deadline = match gettime() {
            Ok(ts) => ts,
            Err(e) => {
                log_err!(b, "clock_gettime failed: {e}");
                shared.thread_active.store(false, Ordering::Release);
                return;
            }
        };

        poll_chain_switch(&b, &shared, &mut current_chain, &mut warned_chain, &mut active_val);

        {
            let mut chains = lock(&shared.chains);
            if let Some(chain) = chains.get_mut(current_chain) {
                // Per-step failures are logged by the chain engine and
                // must not stall the schedule.
                let _ = chain.trigger(&b);
            }
        }
        drop(b);

        deadline = deadline + period;
        if let Err(e) = sleep_until(&deadline) {
            if let Some(b) = weak.upgrade() {
                log_err!(b, "clock_nanosleep failed: {e}");
            }
            shared.thread_active.store(false, Ordering::Release);
            return;
        }
    }
}

/// Read the `active_chain` port and switch the current chain if the
/// index is valid; out-of-range values are warned about once per value
/// and leave the selection unchanged.
fn poll_chain_switch(
    b: &Arc<Block>,
    shared: &Shared,
    current: &mut usize,
    warned: &mut Option<i32>,
    val: &mut Option<Value>,
) {
    let Ok(port) = b.port("active_chain") else {
        return;
    };

    if val.is_none() {
        if let Some(node) = b.node() {
            if let Some(ty) = node.type_get(<i32 as PortableType>::TYPE_NAME) {
                *val = Some(Value::new(&ty, 1));
            }
        }
    }
    let Some(val) = val.as_mut() else { return };

    let Ok(n) = port.read(val) else { return };
    if n == 0 {
        return;
    }
    let Ok(requested) = val.scalar::<i32>() else {
        return;
    };

    let num_chains = lock(&shared.chains).len();
    if requested >= 0 && (requested as usize) < num_chains {
        *current = requested as usize;
        *warned = None;
    } else if *warned != Some(requested) {
        log_warn!(b, "active_chain {requested} out of range, keeping chain {current}");
        *warned = Some(requested);
    }
}

fn flush_stats(weak: &Weak<Block>, shared: &Shared) {
    let Some(b) = weak.upgrade() else { return };
    let chains = lock(&shared.chains);
    for chain in chains.iter() {
        chain.log_all(&b);
    }
    write_profiles(&b, &chains);
}

/// Module registering the `period` type and the `ptrig` prototype.
/// Requires the `stdtypes` module.
pub struct PtrigMod;

impl Module for PtrigMod {
    fn init(&self, node: &Node) -> Result<()> {
        node.type_register(DataType::structure::<Period>())?;

        let mut proto = BlockProto::computation(PTRIG_PROTO, Ptrig::default)
            .doc("periodic trigger: steps its chains from a dedicated realtime thread")
            .trigger()
            .config(
                ConfigSpec::new("period", Period::TYPE_NAME)
                    .min(1)
                    .max(1)
                    .doc("trigger period { sec, usec }"),
            )
            .config(
                ConfigSpec::new("stacksize", "size_t")
                    .max(1)
                    .doc("worker stack size in bytes (0: platform default)"),
            )
            .config(
                ConfigSpec::new("sched_policy", "char")
                    .doc("SCHED_OTHER | SCHED_FIFO | SCHED_RR (default SCHED_OTHER)"),
            )
            .config(
                ConfigSpec::new("sched_priority", "int")
                    .max(1)
                    .doc("worker priority; > 0 only with SCHED_FIFO/SCHED_RR"),
            )
            .config(
                ConfigSpec::new("thread_name", "char")
                    .doc("worker thread name (default: block name)"),
            )
            .port(
                PortSpec::new("tstats")
                    .output(Tstat::TYPE_NAME)
                    .doc("per-chain and per-block timing statistics"),
            )
            .port(
                PortSpec::new("active_chain")
                    .input("int")
                    .doc("index of the chain to run (default 0)"),
            );
        for spec in trigger_configs() {
            proto = proto.config(spec);
        }

        if let Err(e) = node.block_register(proto) {
            let _ = node.type_unregister(Period::TYPE_NAME);
            return Err(e);
        }
        Ok(())
    }

    fn cleanup(&self, node: &Node) {
        let _ = node.block_unregister(PTRIG_PROTO);
        let _ = node.type_unregister(Period::TYPE_NAME);
    }

    fn license(&self) -> &str {
        "MIT"
    }
}
