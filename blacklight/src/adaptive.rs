// Adaptive refinement: posterior statistics on finished image tiles

use ndarray::Array2;
use rayon::prelude::*;

use crate::camera::TileLoc;

// One refinement test: a pixel satisfies the cut, a tile is flagged when
// the satisfying fraction exceeds frac. Negative frac disables the test.
#[derive(Debug, Clone, Copy)]
pub struct RefinementCriterion {
    pub frac: f64,
    pub cut: f64,
}

impl RefinementCriterion {
    pub fn disabled() -> Self {
        Self { frac: -1.0, cut: 0.0 }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.frac >= 0.0
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveSettings {
    pub max_level: usize,
    // Tile edge length in pixels; must divide the camera resolution
    pub block_size: usize,
    pub val: RefinementCriterion,
    pub abs_grad: RefinementCriterion,
    pub rel_grad: RefinementCriterion,
    pub abs_lapl: RefinementCriterion,
    pub rel_lapl: RefinementCriterion,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            max_level: 0,
            block_size: 0,
            val: RefinementCriterion::disabled(),
            abs_grad: RefinementCriterion::disabled(),
            rel_grad: RefinementCriterion::disabled(),
            abs_lapl: RefinementCriterion::disabled(),
            rel_lapl: RefinementCriterion::disabled(),
        }
    }
}

const TINY: f64 = 1.0e-300;

// Evaluate every criterion on one tile held in the worker's scratch buffer
fn tile_flagged(scratch: &[f64], b: usize, settings: &AdaptiveSettings) -> bool {
    let total = (b * b) as f64;
    let at = |i: usize, j: usize| scratch[j * b + i];

    if settings.val.enabled() {
        let count = scratch.iter().filter(|v| v.abs() > settings.val.cut).count();
        if count as f64 / total > settings.val.frac {
            return true;
        }
    }

    if settings.abs_grad.enabled() || settings.rel_grad.enabled() {
        let mut abs_count = 0usize;
        let mut rel_count = 0usize;
        for j in 0..b {
            for i in 0..b {
                let center = at(i, j);
                // Forward differences, clipped at the tile boundary
                let mut abs_max: f64 = 0.0;
                let mut rel_max: f64 = 0.0;
                let mut consider = |other: f64| {
                    let diff = (other - center).abs();
                    abs_max = abs_max.max(diff);
                    rel_max = rel_max.max(diff / (0.5 * (other.abs() + center.abs()) + TINY));
                };
                if i + 1 < b {
                    consider(at(i + 1, j));
                }
                if j + 1 < b {
                    consider(at(i, j + 1));
                }
                if abs_max > settings.abs_grad.cut {
                    abs_count += 1;
                }
                if rel_max > settings.rel_grad.cut {
                    rel_count += 1;
                }
            }
        }
        if settings.abs_grad.enabled() && abs_count as f64 / total > settings.abs_grad.frac {
            return true;
        }
        if settings.rel_grad.enabled() && rel_count as f64 / total > settings.rel_grad.frac {
            return true;
        }
    }

    if settings.abs_lapl.enabled() || settings.rel_lapl.enabled() {
        let mut abs_count = 0usize;
        let mut rel_count = 0usize;
        for j in 1..b.saturating_sub(1) {
            for i in 1..b.saturating_sub(1) {
                let center = at(i, j);
                let lapl =
                    (at(i + 1, j) + at(i - 1, j) + at(i, j + 1) + at(i, j - 1) - 4.0 * center)
                        .abs();
                if lapl > settings.abs_lapl.cut {
                    abs_count += 1;
                }
                if lapl / (center.abs() + TINY) > settings.rel_lapl.cut {
                    rel_count += 1;
                }
            }
        }
        if settings.abs_lapl.enabled() && abs_count as f64 / total > settings.abs_lapl.frac {
            return true;
        }
        if settings.rel_lapl.enabled() && rel_count as f64 / total > settings.rel_lapl.frac {
            return true;
        }
    }

    false
}

// Decide which tiles of a finished level need resubdivision. The image is
// tile-major with contiguous per-pixel channel rows; the intensity channel
// drives every criterion.
pub fn check_refinement(
    image: &Array2<f64>,
    intensity_offset: usize,
    block_size: usize,
    settings: &AdaptiveSettings,
    pool: &rayon::ThreadPool,
) -> Vec<bool> {
    let pixels_per_tile = block_size * block_size;
    let num_tiles = image.nrows() / pixels_per_tile;

    pool.install(|| {
        (0..num_tiles)
            .into_par_iter()
            .map_init(
                || vec![0.0f64; pixels_per_tile],
                |scratch, t| {
                    for p in 0..pixels_per_tile {
                        scratch[p] = image[[t * pixels_per_tile + p, intensity_offset]];
                    }
                    tile_flagged(scratch, block_size, settings)
                },
            )
            .collect()
    })
}

// Children of the flagged tiles, each covering a quadrant at twice the
// sampling density
pub fn child_tiles(tiles: &[TileLoc], flags: &[bool]) -> Vec<TileLoc> {
    let mut children = Vec::new();
    for (tile, &flagged) in tiles.iter().zip(flags) {
        if !flagged {
            continue;
        }
        for dj in 0..2u32 {
            for di in 0..2u32 {
                children.push(TileLoc {
                    i: 2 * tile.i + di,
                    j: 2 * tile.j + dj,
                });
            }
        }
    }
    children
}
