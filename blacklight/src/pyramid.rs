// Sparse multi-level image pyramid and its assembly onto the root grid

use ndarray::{Array2, Array3};

use crate::camera::TileLoc;

// Finished image data of one refinement level
pub struct LevelImage {
    pub tiles: Vec<TileLoc>,
    // (num_pix, num_channels), pixels tile-major
    pub image: Array2<f64>,
    // (num_renders, 3, num_pix)
    pub renders: Option<Array3<f64>>,
}

// Owned per-level storage; levels above the root are populated lazily when
// the refinement controller schedules them
pub struct ImagePyramid {
    pub resolution: usize,
    pub block_size: usize,
    levels: Vec<Option<LevelImage>>,
}

impl ImagePyramid {
    pub fn new(resolution: usize, block_size: usize, max_level: usize) -> Self {
        let mut levels = Vec::with_capacity(max_level + 1);
        levels.resize_with(max_level + 1, || None);
        Self {
            resolution,
            block_size,
            levels,
        }
    }

    pub fn set_level(&mut self, level: usize, data: LevelImage) {
        if level >= self.levels.len() {
            self.levels.resize_with(level + 1, || None);
        }
        self.levels[level] = Some(data);
    }

    pub fn level(&self, level: usize) -> Option<&LevelImage> {
        self.levels.get(level).and_then(|l| l.as_ref())
    }

    // Deepest populated level
    pub fn deepest(&self) -> usize {
        self.levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.is_some())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    // Drop every level above the given one; used when a fresh refinement
    // cascade starts over
    pub fn truncate(&mut self, level: usize) {
        for slot in self.levels.iter_mut().skip(level + 1) {
            *slot = None;
        }
    }

    pub fn populated_levels(&self) -> impl Iterator<Item = (usize, &LevelImage)> {
        self.levels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|data| (i, data)))
    }

    // Flatten one channel onto the root grid. Levels are painted coarse to
    // fine, so each pixel ends up owned by the deepest tile covering it;
    // finer samples reduce onto a root pixel by box average.
    pub fn assemble(&self, channel: usize) -> Array2<f64> {
        let r = self.resolution;
        let b = self.block_size;
        let mut out = Array2::<f64>::zeros((r, r));

        for (level, data) in self.populated_levels() {
            let scale = 1usize << level;
            let mut sums = Array2::<f64>::zeros((r, r));
            let mut counts = Array2::<f64>::zeros((r, r));
            let mut ind = 0;
            for tile in &data.tiles {
                for lj in 0..b {
                    for li in 0..b {
                        let px = tile.i as usize * b + li;
                        let py = tile.j as usize * b + lj;
                        let rx = px / scale;
                        let ry = py / scale;
                        if rx < r && ry < r {
                            sums[[ry, rx]] += data.image[[ind, channel]];
                            counts[[ry, rx]] += 1.0;
                        }
                        ind += 1;
                    }
                }
            }
            for ry in 0..r {
                for rx in 0..r {
                    if counts[[ry, rx]] > 0.0 {
                        out[[ry, rx]] = sums[[ry, rx]] / counts[[ry, rx]];
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2 as A2;

    fn level(tiles: Vec<TileLoc>, pixels_per_tile: usize, value: f64) -> LevelImage {
        LevelImage {
            image: A2::from_elem((tiles.len() * pixels_per_tile, 1), value),
            tiles,
            renders: None,
        }
    }

    #[test]
    fn root_level_assembles_directly() {
        let mut pyramid = ImagePyramid::new(4, 2, 1);
        let tiles = crate::camera::root_tiles(4, 2);
        pyramid.set_level(0, level(tiles, 4, 7.0));
        let out = pyramid.assemble(0);
        assert!(out.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn refined_tiles_overwrite_their_parents() {
        let mut pyramid = ImagePyramid::new(4, 2, 1);
        pyramid.set_level(0, level(crate::camera::root_tiles(4, 2), 4, 1.0));
        // Children of root tile (0, 0) at level 1, doubled density
        let children = vec![
            TileLoc { i: 0, j: 0 },
            TileLoc { i: 1, j: 0 },
            TileLoc { i: 0, j: 1 },
            TileLoc { i: 1, j: 1 },
        ];
        pyramid.set_level(1, level(children, 4, 3.0));
        let out = pyramid.assemble(0);
        // Root tile (0, 0) covers root pixels x, y in [0, 2)
        for py in 0..4 {
            for px in 0..4 {
                let expected = if px < 2 && py < 2 { 3.0 } else { 1.0 };
                assert_eq!(out[[py, px]], expected, "pixel ({px}, {py})");
            }
        }
    }

    #[test]
    fn truncate_drops_stale_levels() {
        let mut pyramid = ImagePyramid::new(4, 2, 2);
        pyramid.set_level(0, level(crate::camera::root_tiles(4, 2), 4, 1.0));
        pyramid.set_level(1, level(vec![TileLoc { i: 0, j: 0 }], 4, 2.0));
        assert_eq!(pyramid.deepest(), 1);
        pyramid.truncate(0);
        assert_eq!(pyramid.deepest(), 0);
        assert!(pyramid.level(1).is_none());
    }
}
