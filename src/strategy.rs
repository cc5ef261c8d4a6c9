//! The cache-blocking strategy provider: a per-schedule latency model that
//! sizes the channel block against L1, the k2/k3 replication factors against
//! L2/L3, and picks whichever schedule the model predicts to be cheaper.

use crate::common::ConvolutionDescriptor;
use crate::planner::{KernelShape, Schedule, Strategy};

use log::debug;
use serde::{Deserialize, Serialize};

/// Cache hierarchy parameters the cost model runs against. Sizes and the
/// line width are in bytes, latencies in cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArchInfo {
    pub l1_size: u32,
    pub l2_size: u32,
    pub l3_size: u32,
    pub l1_latency: u32,
    pub l2_latency: u32,
    pub l3_latency: u32,
    pub mem_latency: u32,
    pub cache_line: u32,
}

impl Default for ArchInfo {
    /// A 32KiB/1MiB/4MiB hierarchy, each level derated to 90% of its
    /// capacity to leave room for the working set of everything else.
    fn default() -> ArchInfo {
        ArchInfo {
            l1_size: 32768 * 9 / 10,
            l2_size: 1048576 * 9 / 10,
            l3_size: 4194304 * 9 / 10,
            l1_latency: 2,
            l2_latency: 10,
            l3_latency: 30,
            mem_latency: 300,
            cache_line: 128,
        }
    }
}

/// Extents of the target micro-kernel: how many flattened windows and
/// filters one invocation consumes, and how many outputs it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MicroKernel {
    pub num_windows: u32,
    pub num_filters: u32,
    pub num_outputs: u32,
}

impl Default for MicroKernel {
    fn default() -> MicroKernel {
        MicroKernel {
            num_windows: 16,
            num_filters: 8,
            num_outputs: 128,
        }
    }
}

/// How a blocking factor is shrunk until its footprint fits a cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum Heuristic {
    #[default]
    Halving,
    BinarySearch,
}

impl Heuristic {
    /// The largest factor in `1..=initial` (under this heuristic's search
    /// regime) whose footprint fits `limit`. Halving only tries successive
    /// halves of `initial`; binary search probes the full range. Both bottom
    /// out at 1 even when nothing fits.
    fn shrink(self, initial: u32, limit: u32, footprint: impl Fn(u64) -> u64) -> u32 {
        let initial = initial.max(1);
        match self {
            Heuristic::Halving => {
                let mut solution = initial;
                while solution > 1 && footprint(u64::from(solution)) > u64::from(limit) {
                    solution /= 2;
                }
                solution
            }
            Heuristic::BinarySearch => {
                if footprint(u64::from(initial)) <= u64::from(limit) {
                    return initial;
                }
                let (mut solution, mut low, mut high) = (1, 1, initial);
                while low <= high {
                    let mid = low + (high - low) / 2;
                    if footprint(u64::from(mid)) <= u64::from(limit) {
                        solution = mid;
                        low = mid + 1;
                    } else {
                        high = mid - 1;
                    }
                }
                solution
            }
        }
    }
}

/// One schedule's analysis state. Tile byte sizes start as per-channel
/// quantities and are scaled by `tile_c` once the channel block is fixed.
struct Analysis {
    schedule: Schedule,
    arch: ArchInfo,
    conv: ConvolutionDescriptor,
    mk: MicroKernel,
    heuristic: Heuristic,
    data_size: u64,
    in_size: u64,
    w_size: u64,
    out_size: u64,
    tile_c: u32,
    tch: u64,
    in_tiles_per_tch: u64,
    w_tiles_per_tch: u64,
    k2: u32,
    k3: u32,
}

impl Analysis {
    fn new(
        schedule: Schedule,
        arch: &ArchInfo,
        conv: &ConvolutionDescriptor,
        data_size: u64,
        mk: &MicroKernel,
        heuristic: Heuristic,
    ) -> Analysis {
        Analysis {
            schedule,
            arch: *arch,
            conv: *conv,
            mk: *mk,
            heuristic,
            data_size,
            in_size: 0,
            w_size: 0,
            out_size: 0,
            tile_c: 1,
            tch: 1,
            in_tiles_per_tch: 1,
            w_tiles_per_tch: 1,
            k2: 1,
            k3: 1,
        }
    }

    /// Runs the full analysis and returns the modeled latency in cycles.
    fn compute(&mut self) -> u64 {
        let filter_elems = u64::from(self.conv.filter_height) * u64::from(self.conv.filter_width);

        // Per-channel tile footprints; the channel block must satisfy
        // |in| + |w| + |out| <= |L1|.
        self.in_size = u64::from(self.mk.num_windows) * filter_elems * self.data_size;
        self.w_size = u64::from(self.mk.num_filters) * filter_elems * self.data_size;
        self.out_size = u64::from(self.mk.num_outputs) * self.data_size;

        let (in_size, w_size, out_size) = (self.in_size, self.w_size, self.out_size);
        self.tile_c = self.heuristic.shrink(
            self.conv.in_channels,
            self.arch.l1_size,
            |tc| (in_size + w_size) * tc + out_size,
        );
        self.in_size *= u64::from(self.tile_c);
        self.w_size *= u64::from(self.tile_c);

        self.tch = u64::from(self.conv.in_channels / self.tile_c).max(1);

        // Tile counts per channel block, per the micro-kernel extents.
        let windows = u64::from(self.conv.out_height) * u64::from(self.conv.out_width);
        self.in_tiles_per_tch =
            divrem::DivCeil::div_ceil(windows, u64::from(self.mk.num_windows));
        self.w_tiles_per_tch = divrem::DivCeil::div_ceil(
            u64::from(self.conv.out_channels),
            u64::from(self.mk.num_filters),
        );

        // k2 scales the replicated operand against L2; k3 the streamed one
        // against L3.
        let (k2_initial, k3_initial) = match self.schedule {
            Schedule::InputStationary => (self.w_tiles_per_tch, self.in_tiles_per_tch),
            Schedule::WeightStationary => (self.in_tiles_per_tch, self.w_tiles_per_tch),
        };
        self.k2 = self
            .heuristic
            .shrink(k2_initial as u32, self.arch.l2_size, |k2| {
                self.l2_footprint(k2)
            });
        let k2 = self.k2;
        self.k3 = self
            .heuristic
            .shrink(k3_initial as u32, self.arch.l3_size, |k3| {
                self.l3_footprint(u64::from(k2), k3)
            });

        self.cost()
    }

    fn l2_footprint(&self, k2: u64) -> u64 {
        match self.schedule {
            Schedule::InputStationary => self.in_size + k2 * self.w_size + k2 * self.out_size,
            Schedule::WeightStationary => k2 * self.in_size + self.w_size + k2 * self.out_size,
        }
    }

    fn l3_footprint(&self, k2: u64, k3: u64) -> u64 {
        match self.schedule {
            Schedule::InputStationary => {
                k3 * self.in_size + k2 * self.w_size + k2 * k3 * self.out_size
            }
            Schedule::WeightStationary => {
                k2 * self.in_size + k3 * self.w_size + k2 * k3 * self.out_size
            }
        }
    }

    /// The latency model: per-level access counts weighted by per-level
    /// latencies. The resident operand (scaled by k2) is called `a`, the
    /// streamed one (scaled by k3) `b`.
    fn cost(&self) -> u64 {
        let line = u64::from(self.arch.cache_line);
        let (k2, k3) = (u64::from(self.k2), u64::from(self.k3));
        let ((a_tiles, a_size), (b_tiles, b_size)) = match self.schedule {
            Schedule::InputStationary => (
                (self.w_tiles_per_tch, self.w_size),
                (self.in_tiles_per_tch, self.in_size),
            ),
            Schedule::WeightStationary => (
                (self.in_tiles_per_tch, self.in_size),
                (self.w_tiles_per_tch, self.w_size),
            ),
        };

        // The first touch of every tile misses all the way to memory.
        let in_total = self.in_tiles_per_tch * self.tch;
        let w_total = self.w_tiles_per_tch * self.tch;
        let mut mem = (in_total * self.in_size + w_total * self.w_size) / line;

        // Extra memory traffic when the resident tiles overflow L2 while
        // more than one k3 round streams past them.
        let a_fit = (a_tiles / k2).saturating_sub(1).max(1);
        let b_fit = (b_tiles / k3).saturating_sub(1);
        mem += self.tch * a_fit * b_fit * a_tiles * a_size / line;

        // Streamed tiles re-fetched from L3 once per extra resident round.
        let a_rounds = (a_tiles / k2).saturating_sub(1);
        let mut l3 = self.tch * (a_rounds * b_tiles * b_size / line);

        // After the first streamed tile, resident tiles replay from L2.
        let mut l2 = self.tch * (b_tiles.saturating_sub(1) * a_tiles * a_size / line);

        // Every multiply reads two operands; whatever was not accounted to
        // an outer level hits L1.
        let total_reads = 2
            * u64::from(self.conv.out_channels)
            * u64::from(self.conv.out_height)
            * u64::from(self.conv.out_width)
            * u64::from(self.conv.filter_height)
            * u64::from(self.conv.filter_width)
            * u64::from(self.conv.in_channels);
        let mut l1 = total_reads.saturating_sub(l3 + l2 + mem);

        // Partial outputs written back and reloaded between channel blocks.
        if self.tch > 1 {
            let depth = u64::from(self.conv.in_channels) / self.tch * filter_elems(&self.conv);
            let outputs = u64::from(self.conv.out_channels)
                * u64::from(self.conv.out_height)
                * u64::from(self.conv.out_width);
            let window_reads = u64::from(self.conv.out_height)
                * u64::from(self.conv.out_width)
                * depth;
            let filter_reads = u64::from(self.conv.out_channels) * depth;
            let access_distance = (window_reads + filter_reads + outputs) * self.data_size;

            let reloads = (self.tch - 1) * outputs;
            let reload_lines = reloads * self.data_size / line;
            if access_distance < u64::from(self.arch.l1_size) {
                l1 += reload_lines;
            } else if access_distance < u64::from(self.arch.l2_size) {
                l2 += reload_lines;
            } else if access_distance < u64::from(self.arch.l3_size) {
                l3 += reload_lines;
            } else {
                mem += reload_lines;
            }
            l1 += reloads - reload_lines;
        }

        l1 * u64::from(self.arch.l1_latency)
            + l2 * u64::from(self.arch.l2_latency)
            + l3 * u64::from(self.arch.l3_latency)
            + mem * u64::from(self.arch.mem_latency)
    }

    fn into_strategy(self) -> (Strategy, KernelShape) {
        (
            Strategy {
                schedule: self.schedule,
                k2: self.k2.max(1),
                k3: self.k3.max(1),
                tile_c: self.tile_c.max(1),
            },
            KernelShape {
                num_filters: self.mk.num_filters,
                num_windows: self.mk.num_windows,
            },
        )
    }
}

fn filter_elems(conv: &ConvolutionDescriptor) -> u64 {
    u64::from(conv.filter_height) * u64::from(conv.filter_width)
}

/// Analyzes both schedules under the latency model and returns the cheaper
/// one's blocking factors together with the micro-kernel extents the factors
/// were sized for. Pure; touches no graph state.
pub fn choose_strategy(
    arch: &ArchInfo,
    conv: &ConvolutionDescriptor,
    data_size: u64,
    mk: &MicroKernel,
    heuristic: Heuristic,
) -> (Strategy, KernelShape) {
    let mut is = Analysis::new(
        Schedule::InputStationary,
        arch,
        conv,
        data_size,
        mk,
        heuristic,
    );
    let mut ws = Analysis::new(
        Schedule::WeightStationary,
        arch,
        conv,
        data_size,
        mk,
        heuristic,
    );
    let cost_is = is.compute();
    let cost_ws = ws.compute();
    debug!(
        "schedule costs: input-stationary {} cycles, weight-stationary {} cycles",
        cost_is, cost_ws
    );
    if cost_ws > cost_is {
        is.into_strategy()
    } else {
        ws.into_strategy()
    }
}
