use crate::common::DimSize;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

/// Which operand stays resident longest across the inner loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Schedule {
    WeightStationary,
    InputStationary,
}

/// A cache-blocking strategy, produced externally (see [crate::strategy])
/// and immutable once supplied. `k2`/`k3` scale whichever operand must stay
/// resident for the chosen schedule; `tile_c` blocks the channel reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Strategy {
    pub schedule: Schedule,
    pub k2: u32,
    pub k3: u32,
    pub tile_c: DimSize,
}

/// Micro-kernel extents, supplied with the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct KernelShape {
    pub num_filters: DimSize,
    pub num_windows: DimSize,
}

/// Per-dimension tile sizes in iteration-space order (batch, out-channel,
/// window, in-channel, filter-row, filter-col) plus the nesting order of the
/// tiled dimensions.
///
/// A size of 0 leaves the dimension untiled. The filter-row/filter-col sizes
/// are always 0 at both tiers. `interchange` permutes the positions of the
/// non-zero-tiled dimensions (in ascending dimension order), outermost loop
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TileSpec {
    pub sizes: [DimSize; 6],
    pub interchange: SmallVec<[usize; 6]>,
}

impl TileSpec {
    /// The dimensions with non-zero tile sizes, ascending.
    pub fn tiled_dims(&self) -> SmallVec<[usize; 6]> {
        (0..6).filter(|&d| self.sizes[d] != 0).collect()
    }
}

/// Maps a strategy and the micro-kernel extents to the two tile
/// specifications applied by the executor: the outer cache-block tile and
/// the inner micro-kernel tile. Pure; no graph access.
pub fn plan_tiles(strategy: &Strategy, kernel: &KernelShape) -> (TileSpec, TileSpec) {
    let is = strategy.schedule == Schedule::InputStationary;
    let filter_tiles = kernel.num_filters * if is { strategy.k2 } else { strategy.k3 };
    let window_tiles = kernel.num_windows * if is { strategy.k3 } else { strategy.k2 };

    let outer = TileSpec {
        sizes: [1, filter_tiles, window_tiles, strategy.tile_c, 0, 0],
        // Input-stationary runs windows outside filters; weight-stationary
        // the reverse. The channel block always sits right inside the batch.
        interchange: if is {
            smallvec![0, 3, 2, 1]
        } else {
            smallvec![0, 3, 1, 2]
        },
    };
    let inner = TileSpec {
        sizes: [0, kernel.num_filters, kernel.num_windows, 0, 0, 0],
        interchange: if is {
            smallvec![1, 0]
        } else {
            smallvec![0, 1]
        },
    };
    (outer, inner)
}
