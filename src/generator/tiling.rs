// This module implements the tiling advisor shared by the kernel generators. It chooses the
// register tile shapes under the fixed budget of 32 SIMD registers. For elementwise kernels
// the M x N grid is split into up to four rectangular areas (main, right, lower, corner): an
// extent that is short or a multiple of four stays whole, anything else is split at the largest
// power of two. Every area then gets the best scoring tile among all shapes up to 16 x 16 that
// divide it evenly and fit the register budget. For GEMM the advisor derives the row block
// count from min(M, 16), fits as many accumulator columns as possible next to one staged A
// column and the B scalar, and reports a big N tile for full blocks plus a small tile covering
// the N remainder.

//! Register-budget tiling.

/// Number of SIMD registers available to a kernel.
pub const NUM_VREGS: usize = 32;

/// Largest tile extent considered in either dimension.
pub const MAX_TILE_EXTENT: usize = 16;

/// Single precision lanes per 128-bit register.
pub const VECTOR_LANES: usize = 4;

/// Weight of the unused register fraction in the elementwise objective.
pub const FREE_REGISTER_WEIGHT: f64 = 1.2;

/// Weight of the tile aspect ratio `n / m` in the elementwise objective.
pub const ASPECT_WEIGHT: f64 = 0.45;

/// Upper bound on accumulator columns per GEMM register block.
const MAX_GEMM_TILE_N: usize = 30;

/// Rows and columns of a register tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub m: usize,
    pub n: usize,
}

impl TileShape {
    pub const fn new(m: usize, n: usize) -> Self {
        Self { m, n }
    }

    /// Registers holding one column of the tile.
    pub const fn regs_per_column(self) -> usize {
        self.m.div_ceil(VECTOR_LANES)
    }

    /// Registers holding the whole tile.
    pub const fn vector_regs(self) -> usize {
        self.regs_per_column() * self.n
    }

    pub const fn is_empty(self) -> bool {
        self.m == 0 || self.n == 0
    }
}

/// A rectangular part of the M x N grid with the tile chosen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledArea {
    /// First row of the area.
    pub row: usize,
    /// First column of the area.
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
    /// `None` exactly when the area is empty.
    pub tile: Option<TileShape>,
}

impl TiledArea {
    fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        let tile = if rows == 0 || cols == 0 { None } else { Some(best_elementwise_tile(rows, cols)) };
        Self { row, col, rows, cols, tile }
    }

    pub fn is_empty(&self) -> bool {
        self.tile.is_none()
    }
}

/// Partition of an elementwise M x N grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseTiling {
    pub main: TiledArea,
    pub right: TiledArea,
    pub lower: TiledArea,
    pub corner: TiledArea,
}

impl ElementwiseTiling {
    /// All four areas, empty ones included, in emission order.
    pub fn areas(&self) -> [TiledArea; 4] {
        [self.main, self.right, self.lower, self.corner]
    }
}

/// Split one extent into a main part and a remainder.
fn split_extent(extent: usize) -> (usize, usize) {
    if extent < MAX_TILE_EXTENT || extent % VECTOR_LANES == 0 {
        (extent, 0)
    } else {
        let main = 1usize << (usize::BITS - 1 - extent.leading_zeros());
        (main, extent - main)
    }
}

/// Registers an elementwise tile needs: the tile itself plus one zero register.
///
/// Unary kernels stage no A or B operands, so only the tile and the relu zero
/// register count against the register file.
pub const fn elementwise_regs(tile: TileShape) -> usize {
    tile.vector_regs() + 1
}

/// Objective minimized by [`choose_elementwise_tile`].
pub fn elementwise_score(tile: TileShape) -> f64 {
    let free = NUM_VREGS as f64 - elementwise_regs(tile) as f64;
    FREE_REGISTER_WEIGHT * (free / NUM_VREGS as f64) + ASPECT_WEIGHT * (tile.n as f64 / tile.m as f64)
}

fn best_elementwise_tile(rows: usize, cols: usize) -> TileShape {
    let mut best = TileShape::new(1, 1);
    let mut best_score = elementwise_score(best);
    for m in 1..=rows.min(MAX_TILE_EXTENT) {
        if rows % m != 0 {
            continue;
        }
        for n in 1..=cols.min(MAX_TILE_EXTENT) {
            let tile = TileShape::new(m, n);
            if cols % n != 0 || elementwise_regs(tile) > NUM_VREGS {
                continue;
            }
            let score = elementwise_score(tile);
            if score < best_score {
                best = tile;
                best_score = score;
            }
        }
    }
    best
}

/// Partition an `m x n` grid into main/right/lower/corner areas and pick a tile for each.
pub fn choose_elementwise_tile(m: usize, n: usize) -> ElementwiseTiling {
    let (main_m, rest_m) = split_extent(m);
    let (main_n, rest_n) = split_extent(n);
    let tiling = ElementwiseTiling {
        main: TiledArea::new(0, 0, main_m, main_n),
        right: TiledArea::new(0, main_n, main_m, rest_n),
        lower: TiledArea::new(main_m, 0, rest_m, main_n),
        corner: TiledArea::new(main_m, main_n, rest_m, rest_n),
    };
    log::debug!("elementwise tiling {m}x{n}: {tiling:?}");
    tiling
}

/// Register tiles of a GEMM kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmTiling {
    /// Tile of full N blocks.
    pub big: TileShape,
    /// Tile of the trailing N remainder; `n == 0` when N divides evenly.
    pub small: TileShape,
    /// Accumulator registers of the big tile.
    pub big_regs: usize,
    /// Accumulator registers of the small tile.
    pub small_regs: usize,
    /// Number of full row tiles of `big.m` rows.
    pub full_m_tiles: usize,
    /// Rows left after the full row tiles.
    pub m_remainder: usize,
}

impl GemmTiling {
    /// Number of full N blocks.
    pub fn full_n_blocks(&self, n: usize) -> usize {
        if self.big.n == 0 {
            0
        } else {
            n / self.big.n
        }
    }
}

/// Total registers a GEMM tile occupies: accumulators, one staged A column, one B scalar.
pub const fn gemm_regs(tile: TileShape) -> usize {
    tile.vector_regs() + tile.regs_per_column() + 1
}

/// Choose big and small GEMM tiles for an `m x n` output.
pub fn choose_gemm_tile(m: usize, n: usize) -> GemmTiling {
    let tile_m = m.min(MAX_TILE_EXTENT);
    let row_blocks = tile_m.div_ceil(VECTOR_LANES);
    let mut tile_n = MAX_GEMM_TILE_N;
    while tile_n > 1 && row_blocks * tile_n + row_blocks + 1 > NUM_VREGS {
        tile_n -= 1;
    }
    let tile_n = tile_n.min(n);
    let small_n = if tile_n == 0 { 0 } else { n % tile_n };

    let (full_m_tiles, m_remainder) = if m > MAX_TILE_EXTENT {
        (m / MAX_TILE_EXTENT, m % MAX_TILE_EXTENT)
    } else {
        (usize::from(m > 0), 0)
    };

    let tiling = GemmTiling {
        big: TileShape::new(tile_m, tile_n),
        small: TileShape::new(tile_m, small_n),
        big_regs: row_blocks * tile_n,
        small_regs: row_blocks * small_n,
        full_m_tiles,
        m_remainder,
    };
    log::debug!("gemm tiling {m}x{n}: {tiling:?}");
    tiling
}
