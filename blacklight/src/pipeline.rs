// Per-level driver: camera grids, geodesics, sampling, coefficients,
// transfer, and the refinement decision

use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::adaptive;
use crate::camera::{root_tiles, Camera, TileLoc};
use crate::channels::{ChannelKind, ChannelSchema};
use crate::checkpoint;
use crate::coefficients::{
    bind_coefficients, CoefficientModel, CoefficientSource, FormulaModel,
};
use crate::config::{ModelConfig, RunConfig};
use crate::error::{BlacklightError, Result};
use crate::geodesic::{self, GeodesicSet};
use crate::metric::Spacetime;
use crate::pyramid::{ImagePyramid, LevelImage};
use crate::sample::{self, SampleSet};
use crate::transfer;

#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub flagged_rays: usize,
    pub clamped_pixels: usize,
}

pub struct Pipeline {
    config: RunConfig,
    spacetime: Spacetime,
    camera: Camera,
    source: CoefficientSource,
    schema: ChannelSchema,
    // Per render image, each feature's index into the model's cell values
    render_cell_indices: Vec<Vec<usize>>,
    pool: rayon::ThreadPool,
    pyramid: ImagePyramid,
    block_size: usize,

    adaptive_level: usize,
    adaptive_num_levels: usize,
    next_tiles: Vec<TileLoc>,
    first_time: bool,

    time_geodesic: f64,
    time_sample: f64,
    time_integrate: f64,
    stats: RunStats,
    progress: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let source = match &config.model {
            ModelConfig::Formula(p) => CoefficientSource::Formula(Arc::new(FormulaModel {
                bh_m: 1.0,
                bh_a: p.spin,
                r0: p.r0,
                h: p.h,
                l0: p.l0,
                q: p.q,
                nup: p.nup,
                cn0: p.cn0,
                alpha: p.alpha,
                a_coef: p.a,
                beta: p.beta,
            })),
            ModelConfig::Simulation(_) => {
                return Err(BlacklightError::config(
                    "model_type simulation requires an external snapshot source; \
                     supply a plugged coefficient model",
                ))
            }
            ModelConfig::Plugged { .. } => {
                return Err(BlacklightError::config(
                    "plugged model configuration requires Pipeline::with_model",
                ))
            }
        };
        Self::with_source(config, source)
    }

    // Construct with a caller-supplied coefficient model
    pub fn with_model(config: RunConfig, model: Arc<dyn CoefficientModel>) -> Result<Self> {
        Self::with_source(config, CoefficientSource::Plugged(model))
    }

    fn with_source(config: RunConfig, source: CoefficientSource) -> Result<Self> {
        config.validate()?;

        let spacetime = if config.ray_flat {
            Spacetime::minkowski()
        } else {
            Spacetime::new(1.0, config.model.spin())?
        };

        let camera = Camera::new(
            &spacetime,
            config.camera.clone(),
            config.image.frequency,
            config.image.normalization,
        )?;

        let cell_names = source.model().cell_value_names();
        let schema = ChannelSchema::build(&config.image, &cell_names);
        if schema.is_empty() && config.renders.is_empty() {
            return Err(BlacklightError::config("no image or rendering selected"));
        }

        let mut render_cell_indices = Vec::with_capacity(config.renders.len());
        for render in &config.renders {
            let mut indices = Vec::with_capacity(render.features.len());
            for feature in &render.features {
                let index = cell_names
                    .iter()
                    .position(|name| name == &feature.quantity)
                    .ok_or_else(|| {
                        BlacklightError::config(format!(
                            "render quantity {:?} is not provided by the model",
                            feature.quantity
                        ))
                    })?;
                indices.push(index);
            }
            render_cell_indices.push(indices);
        }

        let block_size = if config.adaptive.max_level > 0 {
            config.adaptive.block_size
        } else {
            config.camera.resolution
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| BlacklightError::config(e.to_string()))?;

        let pyramid = ImagePyramid::new(
            config.camera.resolution,
            block_size,
            config.adaptive.max_level,
        );

        Ok(Self {
            spacetime,
            camera,
            source,
            schema,
            render_cell_indices,
            pool,
            pyramid,
            block_size,
            adaptive_level: 0,
            adaptive_num_levels: 0,
            next_tiles: Vec::new(),
            first_time: true,
            time_geodesic: 0.0,
            time_sample: 0.0,
            time_integrate: 0.0,
            stats: RunStats::default(),
            progress: None,
            config,
        })
    }

    pub fn set_progress(&mut self, callback: Arc<dyn Fn(u64) + Send + Sync>) {
        self.progress = Some(callback);
    }

    pub fn schema(&self) -> &ChannelSchema {
        &self.schema
    }

    pub fn pyramid(&self) -> &ImagePyramid {
        &self.pyramid
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    // Accumulated wall-clock per phase: geodesics, sampling, integration
    pub fn times(&self) -> (f64, f64, f64) {
        (self.time_geodesic, self.time_sample, self.time_integrate)
    }

    pub fn num_levels(&self) -> usize {
        self.adaptive_num_levels + 1
    }

    // Clear the one-shot gate so a repeated run recomputes from scratch
    pub fn reset_first_time(&mut self) {
        self.first_time = true;
    }

    // Run every refinement level to completion
    pub fn run(&mut self) -> Result<()> {
        while !self.integrate()? {}
        Ok(())
    }

    // Process one refinement level; returns true when the cascade is done
    pub fn integrate(&mut self) -> Result<bool> {
        let level = self.adaptive_level;
        let tiles = if level == 0 {
            self.pyramid.truncate(0);
            root_tiles(self.config.camera.resolution, self.block_size)
        } else {
            std::mem::take(&mut self.next_tiles)
        };

        // Geodesic phase
        let clock = Instant::now();
        let geodesics = self.level_geodesics(level, tiles.clone())?;
        let samples = self.level_samples(level, &geodesics)?;
        self.stats.flagged_rays += geodesics.num_flagged();
        self.time_geodesic += clock.elapsed().as_secs_f64();

        // Sampling phase: coefficients at every midpoint
        let clock = Instant::now();
        let momentum_factor = self.camera.momentum_factor;
        let coefficients = bind_coefficients(
            &self.source,
            &samples,
            momentum_factor,
            &self.config.fallback,
            &self.pool,
        );
        self.time_sample += clock.elapsed().as_secs_f64();

        // Transfer phase
        let clock = Instant::now();
        let length_factor = self.config.model.length_cgs() / momentum_factor;
        let (image, transfer_stats) = transfer::integrate_image(
            &self.spacetime,
            &samples,
            &coefficients,
            &self.config.image,
            &self.schema,
            length_factor,
            momentum_factor,
            self.config.fallback.nan,
            &self.pool,
        );
        self.stats.clamped_pixels += transfer_stats.clamped;

        let renders = if self.config.renders.is_empty() {
            None
        } else {
            Some(transfer::render_images(
                &samples,
                &coefficients,
                &self.config.renders,
                &self.render_cell_indices,
                length_factor,
                &self.pool,
            ))
        };

        // Refinement decision
        let max_level = self.config.adaptive.max_level;
        let mut complete = true;
        if max_level > 0 && level < max_level {
            let flags = adaptive::check_refinement(
                &image,
                self.schema.offset(&ChannelKind::Intensity).unwrap_or(0),
                self.block_size,
                &self.config.adaptive,
                &self.pool,
            );
            let children = adaptive::child_tiles(&tiles, &flags);
            if !children.is_empty() {
                info!(
                    "level {level}: {} of {} tiles flagged for refinement",
                    children.len() / 4,
                    tiles.len()
                );
                self.next_tiles = children;
                complete = false;
            }
        }

        self.pyramid.set_level(
            level,
            LevelImage {
                tiles,
                image,
                renders,
            },
        );

        if complete {
            self.adaptive_num_levels = self.adaptive_level;
            self.adaptive_level = 0;
        } else {
            self.adaptive_level += 1;
        }
        self.time_integrate += clock.elapsed().as_secs_f64();
        self.first_time = false;
        Ok(complete)
    }

    fn level_geodesics(&self, level: usize, tiles: Vec<TileLoc>) -> Result<GeodesicSet> {
        let ckpt = &self.config.checkpoints;
        let resolution = self.config.camera.resolution;
        let num_pix = tiles.len() * self.block_size * self.block_size;

        if level == 0 && self.first_time && ckpt.geodesic_load {
            let path = checkpoint_path(&ckpt.geodesic_file, "checkpoint_geodesic_file")?;
            return checkpoint::load_geodesics(path, resolution, num_pix);
        }

        let grid = self
            .camera
            .pixel_grid(&self.spacetime, level, tiles, self.block_size)?;
        let set = geodesic::integrate_set(
            &self.spacetime,
            &self.config.ray,
            self.config.camera.r,
            &grid,
            &self.pool,
            self.progress.as_deref(),
        );

        if level == 0 && self.first_time && ckpt.geodesic_save {
            let path = checkpoint_path(&ckpt.geodesic_file, "checkpoint_geodesic_file")?;
            checkpoint::save_geodesics(path, resolution, &set)?;
        }
        Ok(set)
    }

    fn level_samples(&self, level: usize, geodesics: &GeodesicSet) -> Result<SampleSet> {
        let ckpt = &self.config.checkpoints;
        let resolution = self.config.camera.resolution;

        if level == 0 && self.first_time && ckpt.sample_load {
            let path = checkpoint_path(&ckpt.sample_file, "checkpoint_sample_file")?;
            return checkpoint::load_samples(path, resolution, geodesics.num_pix());
        }

        let set = sample::resample_set(&self.spacetime, geodesics, &self.pool);

        if level == 0 && self.first_time && ckpt.sample_save {
            let path = checkpoint_path(&ckpt.sample_file, "checkpoint_sample_file")?;
            checkpoint::save_samples(path, resolution, &set)?;
        }
        Ok(set)
    }

    // Write the finished pyramid through the output settings
    pub fn write_output(&self) -> Result<()> {
        let Some(dir) = &self.config.output.file else {
            return Ok(());
        };
        crate::output::write_output(
            dir,
            self.config.output.gzip,
            &self.pyramid,
            &self.schema,
            self.config.model.spin(),
            self.config.model.mass_msun(),
            self.config.image.frequency,
            self.config.renders.len(),
        )
    }
}

// Configured checkpoint path; validation guarantees presence for active kinds
fn checkpoint_path<'a>(
    path: &'a Option<std::path::PathBuf>,
    key: &str,
) -> Result<&'a std::path::Path> {
    path.as_deref()
        .ok_or_else(|| BlacklightError::config(format!("missing {key}")))
}
