//! The trigger chain engine.
//!
//! A [`Chain`] is an ordered list of `(block, num_steps, every)` entries
//! that is executed as a unit each time its owner fires, with optional
//! per-chain and per-block timing statistics, throttled publication of
//! those statistics on a port, throttled log emission, and CSV
//! persistence to a profile path.
//!
//! Trigger blocks (the synchronous [`simple::Trig`] and the threaded
//! [`crate::ptrig::Ptrig`]) share the config surface implemented here:
//! a `num_chains` config from which one `chainN` config of `triggee`
//! records is derived per chain.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use simple::{Trig, TrigMod, TRIG_PROTO};
pub use tstat::{Tstat, CSV_HEADER, GLOBAL_TSTAT_ID, TSTAT_ID_MAXLEN};

use crate::block::{Block, BlockKind, BlockState, Port, BLOCK_NAME_MAXLEN};
use crate::error::{Error, Result};
use crate::time::{gettime, Timespec, NSEC_PER_SEC};
use crate::types::{PortableType, Value};
use crate::{log_err, log_info, log_warn};

pub mod simple;
mod tstat;


/// One entry of a chain configuration: which block to step, how many
/// times per firing, and on every how-many-th firing. Plain layout so a
/// `chainN` config can hold an array of these.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Triggee {
    block: [u8; BLOCK_NAME_MAXLEN + 1],
    /// Steps per firing; 0 means 1, -1 disables the entry.
    pub num_steps: i32,
    /// Step only on every Nth firing; 0 and 1 mean every firing.
    pub every: u32,
}

unsafe impl PortableType for Triggee {
    const TYPE_NAME: &'static str = "triggee";
}

impl Triggee {
    pub fn new(block: &str, num_steps: i32, every: u32) -> Result<Triggee> {
        if block.len() > BLOCK_NAME_MAXLEN {
            return Err(Error::InvalidArg(format!("block name too long: {block}")));
        }
        let mut t = Triggee {
            block: [0; BLOCK_NAME_MAXLEN + 1],
            num_steps,
            every,
        };
        t.block[..block.len()].copy_from_slice(block.as_bytes());
        Ok(t)
    }

    pub fn block_name(&self) -> &str {
        let end = self
            .block
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.block.len());
        std::str::from_utf8(&self.block[..end]).unwrap_or("<non-utf8>")
    }
}

/// Timing statistics mode of a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TstatsMode {
    #[default]
    Disabled = 0,
    Global = 1,
    PerBlock = 2,
}

impl TstatsMode {
    pub fn from_i32(v: i32) -> Option<TstatsMode> {
        match v {
            0 => Some(TstatsMode::Disabled),
            1 => Some(TstatsMode::Global),
            2 => Some(TstatsMode::PerBlock),
            _ => None,
        }
    }
}

/// A resolved chain entry.
pub struct ChainEntry {
    pub block: Arc<Block>,
    pub num_steps: i32,
    pub every: u32,
    warned_inactive: bool,
}

impl ChainEntry {
    pub fn new(block: Arc<Block>, num_steps: i32, every: u32) -> ChainEntry {
        ChainEntry {
            block,
            // 0 is normalised to 1; -1 disables the entry at runtime.
            num_steps: if num_steps == 0 { 1 } else { num_steps },
            every,
            warned_inactive: false,
        }
    }

    fn skipped(&self, firing: u64) -> bool {
        self.num_steps < 0 || (self.every > 1 && firing % self.every as u64 != 0)
    }
}

/// An ordered step schedule with timing statistics.
pub struct Chain {
    id: String,
    entries: Vec<ChainEntry>,
    mode: TstatsMode,
    skip_first: u32,
    output_rate_ns: u64,
    log_rate_ns: u64,
    global: Tstat,
    blk: Vec<Tstat>,
    output_last_ns: u64,
    log_last_ns: u64,
    output_idx: usize,
    log_idx: usize,
    firing: u64,
    port: Option<Arc<Port>>,
    // Cached publication value so the firing path does not allocate.
    port_val: Option<Value>,
}

impl Chain {
    /// Assemble a chain.
    ///
    /// `output_rate_s`/`log_rate_s` throttle statistics publication and
    /// log emission in seconds; 0 disables. `skip_first` firings are
    /// executed without timing so cold-start outliers stay out of the
    /// statistics.
    pub fn new(
        id: &str,
        entries: Vec<ChainEntry>,
        mode: TstatsMode,
        skip_first: u32,
        output_rate_s: f64,
        log_rate_s: f64,
        port: Option<(Arc<Port>, Value)>,
    ) -> Chain {
        let id = if id.is_empty() { GLOBAL_TSTAT_ID } else { id };
        let blk = if mode == TstatsMode::PerBlock {
            entries.iter().map(|e| Tstat::new(e.block.name())).collect()
        } else {
            Vec::new()
        };
        let (port, port_val) = match port {
            Some((p, v)) => (Some(p), Some(v)),
            None => (None, None),
        };

        Chain {
            id: id.to_string(),
            global: Tstat::new(id),
            entries,
            mode,
            skip_first,
            output_rate_ns: (output_rate_s * NSEC_PER_SEC as f64) as u64,
            log_rate_ns: (log_rate_s * NSEC_PER_SEC as f64) as u64,
            blk,
            output_last_ns: 0,
            log_last_ns: 0,
            output_idx: 0,
            log_idx: 0,
            firing: 0,
            port,
            port_val,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate statistics over whole-chain executions.
    pub fn global_tstats(&self) -> &Tstat {
        &self.global
    }

    /// Per-entry statistics; empty unless the mode is `PerBlock`.
    pub fn blk_tstats(&self) -> &[Tstat] {
        &self.blk
    }

    /// Re-arm per-activation state (the skipped-target warnings).
    pub fn arm(&mut self) {
        for e in &mut self.entries {
            e.warned_inactive = false;
        }
    }

    /// Fire the chain once, according to the configured stats mode.
    ///
    /// A failing target step is logged and does not abort the chain;
    /// the last failure is returned after all entries ran. A target
    /// that is not `Active` is skipped with one warning per
    /// activation.
    pub fn trigger(&mut self, b: &Block) -> Result<()> {
        if self.skip_first > 0 {
            self.skip_first -= 1;
            let ret = self.run_entries(b);
            self.firing += 1;
            return ret;
        }

        let ret = match self.mode {
            TstatsMode::Disabled => self.run_entries(b),
            TstatsMode::Global => self.trigger_global(b),
            TstatsMode::PerBlock => self.trigger_perblock(b),
        };
        self.firing += 1;
        ret
    }

    fn run_entries(&mut self, b: &Block) -> Result<()> {
        let firing = self.firing;
        let mut ret = Ok(());
        for e in &mut self.entries {
            if e.skipped(firing) {
                continue;
            }
            if let Err(err) = step_entry(b, e) {
                ret = Err(err);
            }
        }
        ret
    }

    fn trigger_global(&mut self, b: &Block) -> Result<()> {
        let start = now(b);
        let ret = self.run_entries(b);
        let end = now(b);

        self.global.update(start, end);
        self.throttled_output(b, end.to_ns());
        ret
    }

    fn trigger_perblock(&mut self, b: &Block) -> Result<()> {
        let firing = self.firing;
        let start = now(b);
        let mut ret = Ok(());

        for (i, e) in self.entries.iter_mut().enumerate() {
            if e.skipped(firing) {
                continue;
            }
            let blk_start = now(b);
            let stepped = step_entry(b, e);
            let blk_end = now(b);

            match stepped {
                Ok(true) => self.blk[i].update(blk_start, blk_end),
                Ok(false) => (),
                Err(err) => {
                    self.blk[i].update(blk_start, blk_end);
                    ret = Err(err);
                }
            }
        }

        let end = now(b);
        self.global.update(start, end);
        self.throttled_output(b, end.to_ns());
        ret
    }

    fn throttled_output(&mut self, b: &Block, now_ns: u64) {
        if self.output_rate_ns > 0
            && self.port.is_some()
            && now_ns > self.output_last_ns + self.output_rate_ns
        {
            let rec = match self.mode {
                TstatsMode::Global => self.global,
                // Round-robin over per-block records plus the global one.
                _ => {
                    let rec = if self.output_idx < self.blk.len() {
                        self.blk[self.output_idx]
                    } else {
                        self.global
                    };
                    self.output_idx = (self.output_idx + 1) % (self.blk.len() + 1);
                    rec
                }
            };
            self.publish(b, &rec);
            self.output_last_ns = now_ns;
        }

        if self.log_rate_ns > 0 && now_ns > self.log_last_ns + self.log_rate_ns {
            match self.mode {
                TstatsMode::Global => self.global.log(b),
                _ => {
                    if self.log_idx < self.blk.len() {
                        self.blk[self.log_idx].log(b);
                    } else {
                        self.global.log(b);
                    }
                    self.log_idx = (self.log_idx + 1) % (self.blk.len() + 1);
                }
            }
            self.log_last_ns = now_ns;
        }
    }

    fn publish(&mut self, b: &Block, rec: &Tstat) {
        let (Some(port), Some(val)) = (&self.port, &mut self.port_val) else {
            return;
        };
        if val.set_scalar(*rec).is_ok() {
            if let Err(e) = port.write(val) {
                log_err!(b, "publishing tstats failed: {e}");
            }
        }
    }

    /// Publish every record of this chain on the stats port.
    pub fn output_all(&mut self, b: &Block) {
        match self.mode {
            TstatsMode::Disabled => (),
            TstatsMode::Global => {
                let rec = self.global;
                self.publish(b, &rec);
            }
            TstatsMode::PerBlock => {
                for i in 0..self.blk.len() {
                    let rec = self.blk[i];
                    self.publish(b, &rec);
                }
                let rec = self.global;
                self.publish(b, &rec);
            }
        }
    }

    /// Log every record of this chain.
    pub fn log_all(&self, b: &Block) {
        match self.mode {
            TstatsMode::Disabled => (),
            TstatsMode::Global => self.global.log(b),
            TstatsMode::PerBlock => {
                for rec in &self.blk {
                    rec.log(b);
                }
                self.global.log(b);
            }
        }
    }

    /// Serialise the chain's statistics to
    /// `<profile_path>/<sanitised id>.tstats`. A `Disabled` chain
    /// writes no file.
    pub fn write_profile(&self, b: &Block, profile_path: &str) -> Result<()> {
        if self.mode == TstatsMode::Disabled {
            return Ok(());
        }

        let filename = stats_filename(&self.id, profile_path);
        let mut file = File::create(&filename)?;
        writeln!(file, "{CSV_HEADER}")?;

        if self.mode == TstatsMode::PerBlock {
            for rec in &self.blk {
                rec.write_row(&mut file)?;
            }
        }
        self.global.write_row(&mut file)?;

        log_info!(b, "wrote tstats profile to {}", filename.display());
        Ok(())
    }
}

/// Step one entry `num_steps` times; returns whether any step was
/// attempted. A target that is not active is skipped with a single
/// warning per activation.
fn step_entry(b: &Block, e: &mut ChainEntry) -> Result<bool> {
    if e.block.state() != BlockState::Active {
        if !e.warned_inactive {
            log_warn!(b, "trigger target {} not active, skipping", e.block.name());
            e.warned_inactive = true;
        }
        return Ok(false);
    }

    for _ in 0..e.num_steps {
        if let Err(err) = e.block.step() {
            log_err!(b, "step of {} failed: {err}", e.block.name());
            return Err(err);
        }
    }
    Ok(true)
}

fn now(b: &Block) -> Timespec {
    gettime().unwrap_or_else(|e| {
        log_err!(b, "clock_gettime failed: {e}");
        Timespec::ZERO
    })
}

/// `<profile_path>/<name>.tstats` with slashes in `name` sanitised to
/// dashes.
pub fn stats_filename(name: &str, profile_path: &str) -> PathBuf {
    let sanitised = name.replace('/', "-");
    Path::new(profile_path).join(format!("{sanitised}.tstats"))
}

/*
 * shared config surface of trigger blocks
 */

/// Read `num_chains` and add one `chainN` config per chain. Run from a
/// trigger block's init hook, before the chains can be configured.
pub(crate) fn init_chains(b: &Block) -> Result<usize> {
    let num_chains = b.config_scalar::<i32>("num_chains")?.unwrap_or(1);
    if num_chains < 1 {
        log_err!(b, "num_chains must be >= 1 but is {num_chains}");
        return Err(Error::InvalidConfig(format!("num_chains={num_chains}")));
    }

    for i in 0..num_chains {
        let added = b.config_add(
            &format!("chain{i}"),
            Triggee::TYPE_NAME,
            "chain specification: array of (block, num_steps, every)",
            0,
            None,
        );
        match added {
            // Re-initialisation after cleanup finds the configs of the
            // previous cycle; they stay usable.
            Err(Error::EntityExists(_)) => (),
            other => other?,
        }
    }
    Ok(num_chains as usize)
}

/// Resolve every `chainN` config into a [`Chain`], applying the
/// `tstats_*` config family. Run from a trigger block's start hook.
///
/// An unknown or non-computation target is a configuration error and
/// fails the start.
pub(crate) fn configure_chains(b: &Block, num_chains: usize) -> Result<Vec<Chain>> {
    let node = b.node().ok_or(Error::InvalidBlock)?;

    let mode_raw = b.config_scalar::<i32>("tstats_mode")?.unwrap_or(0);
    let mode = TstatsMode::from_i32(mode_raw).ok_or_else(|| {
        log_err!(b, "invalid tstats_mode {mode_raw}");
        Error::InvalidConfig(format!("tstats_mode={mode_raw}"))
    })?;

    let skip_first = b.config_scalar::<i32>("tstats_skip_first")?.unwrap_or(0).max(0) as u32;
    let output_rate = b.config_scalar::<f64>("tstats_output_rate")?.unwrap_or(0.0);
    let log_rate = b.config_scalar::<f64>("tstats_log_rate")?.unwrap_or(0.0);

    let tstats_port = b.port("tstats").ok();
    let tstat_ty = node.type_get(Tstat::TYPE_NAME);

    let mut chains = Vec::with_capacity(num_chains);
    for i in 0..num_chains {
        let specs = b.config_vec::<Triggee>(&format!("chain{i}"))?;

        let mut entries = Vec::with_capacity(specs.len());
        for spec in &specs {
            let target = node.block_get(spec.block_name()).map_err(|e| {
                log_err!(b, "chain{i}: unknown target {}: {e}", spec.block_name());
                Error::InvalidConfig(format!("chain{i}: unknown target {}", spec.block_name()))
            })?;
            if target.kind() != BlockKind::Computation {
                log_err!(b, "chain{i}: target {} is not a computation", target.name());
                return Err(Error::InvalidConfig(format!(
                    "chain{i}: target {} is not a computation",
                    target.name()
                )));
            }
            entries.push(ChainEntry::new(target, spec.num_steps, spec.every));
        }

        let port = match (&tstats_port, &tstat_ty) {
            (Some(p), Some(ty)) => Some((Arc::clone(p), Value::new(ty, 1))),
            _ => None,
        };

        chains.push(Chain::new(
            &format!("{}/chain{i}", b.name()),
            entries,
            mode,
            skip_first,
            output_rate,
            log_rate,
            port,
        ));
    }
    Ok(chains)
}

/// Write every chain's profile if `tstats_profile_path` is configured.
/// Run from a trigger block's stop hook.
pub(crate) fn write_profiles(b: &Block, chains: &[Chain]) {
    let path = match b.config_str("tstats_profile_path") {
        Ok(Some(path)) if !path.is_empty() => path,
        _ => return,
    };
    for chain in chains {
        if let Err(e) = chain.write_profile(b, &path) {
            log_err!(b, "writing tstats profile for {} failed: {e}", chain.id());
        }
    }
}

/// Config specs shared by all trigger blocks.
pub(crate) fn trigger_configs() -> Vec<crate::block::ConfigSpec> {
    use crate::block::ConfigSpec;
    vec![
        ConfigSpec::new("num_chains", "int")
            .max(1)
            .doc("number of trigger chains to expose (default 1)"),
        ConfigSpec::new("tstats_mode", "int")
            .max(1)
            .doc("timing statistics mode: 0 disabled, 1 global, 2 per-block"),
        ConfigSpec::new("tstats_profile_path", "char")
            .doc("directory to write .tstats profile files into on stop"),
        ConfigSpec::new("tstats_output_rate", "double")
            .max(1)
            .doc("interval [s] between tstats port outputs (0 to disable)"),
        ConfigSpec::new("tstats_log_rate", "double")
            .max(1)
            .doc("interval [s] between tstats log lines (0 to disable)"),
        ConfigSpec::new("tstats_skip_first", "int")
            .max(1)
            .doc("number of initial firings to exclude from statistics"),
    ]
}
