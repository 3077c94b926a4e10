use std::io::Write;

use crate::block::Block;
use crate::log_info;
use crate::time::Timespec;
use crate::types::PortableType;

/// Bounded length of a [`Tstat`] id (block name or chain id).
pub const TSTAT_ID_MAXLEN: usize = 31;

/// Id used for aggregate statistics without a chain id.
pub const GLOBAL_TSTAT_ID: &str = "#total#";

/// Header line of a `.tstats` profile file.
pub const CSV_HEADER: &str = "block, cnt, min_us, max_us, avg_us";

/// Timing statistics record: minimum, maximum and total duration plus
/// sample count. Plain layout so it can travel over a stats port.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tstat {
    id: [u8; TSTAT_ID_MAXLEN + 1],
    pub min: Timespec,
    pub max: Timespec,
    pub total: Timespec,
    pub cnt: u64,
}

// Fixed-size, padding-free except for the trailing id NUL bytes, which
// are always zeroed.
unsafe impl PortableType for Tstat {
    const TYPE_NAME: &'static str = "tstat";
}

impl Tstat {
    /// A fresh record. Minima start at the saturated sentinel so the
    /// first sample wins; `id` is truncated to its bounded length.
    pub fn new(id: &str) -> Tstat {
        let mut rec = Tstat {
            id: [0; TSTAT_ID_MAXLEN + 1],
            min: Timespec::MAX,
            max: Timespec::ZERO,
            total: Timespec::ZERO,
            cnt: 0,
        };
        let n = id.len().min(TSTAT_ID_MAXLEN);
        rec.id[..n].copy_from_slice(&id.as_bytes()[..n]);
        rec
    }

    pub fn id(&self) -> &str {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(self.id.len());
        std::str::from_utf8(&self.id[..end]).unwrap_or("<non-utf8>")
    }

    /// Fold the duration `end - start` into the record.
    pub fn update(&mut self, start: Timespec, end: Timespec) {
        let dur = end - start;
        if dur < self.min {
            self.min = dur;
        }
        if dur > self.max {
            self.max = dur;
        }
        self.total = self.total + dur;
        self.cnt += 1;
    }

    /// Mean duration; zero when no samples were folded in.
    pub fn avg(&self) -> Timespec {
        if self.cnt == 0 {
            return Timespec::ZERO;
        }
        self.total.div(self.cnt)
    }

    /// Emit one formatted log line for this record.
    pub fn log(&self, b: &Block) {
        if self.cnt == 0 {
            log_info!(b, "{}: cnt: 0 - no stats acquired", self.id());
            return;
        }
        log_info!(
            b,
            "TSTAT: {}: cnt {}, min {} us, max {} us, avg {} us",
            self.id(),
            self.cnt,
            self.min.to_us(),
            self.max.to_us(),
            self.avg().to_us()
        );
    }

    /// Write one CSV row in the `.tstats` profile format.
    pub fn write_row(&self, out: &mut dyn Write) -> std::io::Result<()> {
        if self.cnt == 0 {
            return writeln!(out, "{}: cnt: 0 - no stats acquired", self.id());
        }
        writeln!(
            out,
            "{}, {}, {}, {}, {}",
            self.id(),
            self.cnt,
            self.min.to_us(),
            self.max.to_us(),
            self.avg().to_us()
        )
    }
}
