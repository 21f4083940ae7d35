// Run configuration: the input-file reader and validated settings
//
// Input files hold one `key = value` per line with `#` comments. Options are
// grouped by prefix (model, camera, ray, image, plasma, slow, fallback,
// adaptive, render, checkpoint, output). Unknown keys are rejected only by
// their absence at lookup time; ignored selections warn instead of failing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;

use crate::adaptive::{AdaptiveSettings, RefinementCriterion};
use crate::camera::{CameraSettings, CameraType, FrequencyNormalization};
use crate::channels::ImageSettings;
use crate::coefficients::{FallbackPolicy, FallbackValues};
use crate::error::{BlacklightError, Result};
use crate::geodesic::{RaySettings, RayTerminate};
use crate::transfer::{RenderFeature, RenderImage, RenderKind};

// ============================================================================
// INPUT FILE
// ============================================================================

pub struct InputFile {
    values: HashMap<String, String>,
}

impl InputFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(BlacklightError::config(format!(
                    "line {}: expected key = value, found {:?}",
                    lineno + 1,
                    raw
                )));
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }

    fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                BlacklightError::config(format!("could not parse {key} = {raw:?}"))
            }),
        }
    }

    fn require<T: FromStr>(&self, key: &str) -> Result<T> {
        self.optional(key)?
            .ok_or_else(|| BlacklightError::config(format!("missing required option {key}")))
    }

    fn optional_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn flag(&self, key: &str) -> Result<bool> {
        self.optional_or(key, false)
    }
}

// ============================================================================
// SETTINGS GROUPS
// ============================================================================

#[derive(Debug, Clone)]
pub struct FormulaParams {
    // GM/c^2 in cm; sets the length scale of the system
    pub mass: f64,
    pub spin: f64,
    pub r0: f64,
    pub h: f64,
    pub l0: f64,
    pub q: f64,
    pub nup: f64,
    pub cn0: f64,
    pub alpha: f64,
    pub a: f64,
    pub beta: f64,
}

#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub a: f64,
    pub m_msun: f64,
    pub rho_cgs: f64,
    pub coord: String,
    pub interp: bool,
    pub block_interp: bool,
}

#[derive(Debug, Clone)]
pub enum ModelConfig {
    Formula(FormulaParams),
    Simulation(SimulationParams),
    // Coefficient source supplied in code rather than read from disk
    Plugged { spin: f64, length_cgs: f64 },
}

impl ModelConfig {
    pub fn spin(&self) -> f64 {
        match self {
            ModelConfig::Formula(p) => p.spin,
            ModelConfig::Simulation(p) => p.a,
            ModelConfig::Plugged { spin, .. } => *spin,
        }
    }

    // GM/c^2 in cm, the code-to-CGS length conversion
    pub fn length_cgs(&self) -> f64 {
        match self {
            ModelConfig::Formula(p) => p.mass,
            ModelConfig::Simulation(p) => {
                p.m_msun * crate::physics::GG_MSUN / (crate::physics::C * crate::physics::C)
            }
            ModelConfig::Plugged { length_cgs, .. } => *length_cgs,
        }
    }

    pub fn mass_msun(&self) -> f64 {
        match self {
            ModelConfig::Formula(p) => {
                p.mass * crate::physics::C * crate::physics::C / crate::physics::GG_MSUN
            }
            ModelConfig::Simulation(p) => p.m_msun,
            ModelConfig::Plugged { length_cgs, .. } => {
                length_cgs * crate::physics::C * crate::physics::C / crate::physics::GG_MSUN
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlasmaModel {
    TiTeBeta,
    CodeKappa,
}

#[derive(Debug, Clone)]
pub struct PlasmaSettings {
    pub mu: f64,
    pub ne_ni: f64,
    pub model: PlasmaModel,
    pub rat_low: f64,
    pub rat_high: f64,
    pub power_frac: f64,
    pub p: f64,
    pub gamma_min: f64,
    pub gamma_max: f64,
    pub kappa_frac: f64,
    pub kappa: f64,
    pub w: f64,
    pub thermal_frac: f64,
    pub sigma_max: f64,
}

#[derive(Debug, Clone)]
pub struct SlowLightSettings {
    pub interp: bool,
    pub chunk_size: usize,
    pub t_start: f64,
    pub dt: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointSettings {
    pub geodesic_save: bool,
    pub geodesic_load: bool,
    pub geodesic_file: Option<PathBuf>,
    pub sample_save: bool,
    pub sample_load: bool,
    pub sample_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputSettings {
    pub file: Option<PathBuf>,
    pub gzip: bool,
}

#[derive(Debug)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub num_threads: usize,
    pub camera: CameraSettings,
    pub ray: RaySettings,
    pub ray_flat: bool,
    pub image: ImageSettings,
    pub plasma: Option<PlasmaSettings>,
    pub slow_light: Option<SlowLightSettings>,
    pub fallback: FallbackPolicy,
    pub adaptive: AdaptiveSettings,
    pub renders: Vec<RenderImage>,
    pub checkpoints: CheckpointSettings,
    pub output: OutputSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::Plugged { spin: 0.0, length_cgs: 1.0 },
            num_threads: default_threads(),
            camera: CameraSettings::default(),
            ray: RaySettings::default(),
            ray_flat: false,
            image: ImageSettings::default(),
            plasma: None,
            slow_light: None,
            fallback: FallbackPolicy::default(),
            adaptive: AdaptiveSettings::default(),
            renders: Vec::new(),
            checkpoints: CheckpointSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

// ============================================================================
// READER
// ============================================================================

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let f = InputFile::read(path)?;
        Self::from_input(&f)
    }

    pub fn from_input(f: &InputFile) -> Result<Self> {
        let model_type: String = f.require("model_type")?;
        let model = match model_type.as_str() {
            "formula" => ModelConfig::Formula(FormulaParams {
                mass: f.require("formula_mass")?,
                spin: f.require("formula_spin")?,
                r0: f.require("formula_r0")?,
                h: f.require("formula_h")?,
                l0: f.require("formula_l0")?,
                q: f.require("formula_q")?,
                nup: f.require("formula_nup")?,
                cn0: f.require("formula_cn0")?,
                alpha: f.require("formula_alpha")?,
                a: f.require("formula_a")?,
                beta: f.require("formula_beta")?,
            }),
            "simulation" => ModelConfig::Simulation(SimulationParams {
                a: f.require("simulation_a")?,
                m_msun: f.require("simulation_m_msun")?,
                rho_cgs: f.require("simulation_rho_cgs")?,
                coord: f.require("simulation_coord")?,
                interp: f.flag("simulation_interp")?,
                block_interp: f.flag("simulation_block_interp")?,
            }),
            other => {
                return Err(BlacklightError::config(format!(
                    "unrecognized model_type {other:?} (expected simulation or formula)"
                )))
            }
        };
        let simulation = matches!(model, ModelConfig::Simulation(_));

        let camera_type = match f.optional::<String>("camera_type")?.as_deref() {
            None | Some("plane") => CameraType::Plane,
            Some("pinhole") => CameraType::Pinhole,
            Some(other) => {
                return Err(BlacklightError::config(format!(
                    "unrecognized camera_type {other:?}"
                )))
            }
        };
        let camera_defaults = CameraSettings::default();
        let camera = CameraSettings {
            camera_type,
            r: f.require("camera_r")?,
            th: f.optional_or("camera_th", camera_defaults.th)?,
            ph: f.optional_or("camera_ph", camera_defaults.ph)?,
            urn: f.optional_or("camera_urn", 0.0)?,
            uthn: f.optional_or("camera_uthn", 0.0)?,
            uphn: f.optional_or("camera_uphn", 0.0)?,
            k_r: f.optional_or("camera_k_r", camera_defaults.k_r)?,
            k_th: f.optional_or("camera_k_th", 0.0)?,
            k_ph: f.optional_or("camera_k_ph", 0.0)?,
            rotation: f.optional_or("camera_rotation", 0.0)?,
            width: f.require("camera_width")?,
            resolution: f.require("camera_resolution")?,
            pole: f.flag("camera_pole")?,
        };

        let ray_defaults = RaySettings::default();
        let terminate = match f.optional::<String>("ray_terminate")?.as_deref() {
            None | Some("multiplicative") => RayTerminate::Multiplicative,
            Some("additive") => RayTerminate::Additive,
            Some(other) => {
                return Err(BlacklightError::config(format!(
                    "unrecognized ray_terminate {other:?}"
                )))
            }
        };
        let ray = RaySettings {
            terminate,
            factor: f.optional_or("ray_factor", ray_defaults.factor)?,
            step: f.optional_or("ray_step", ray_defaults.step)?,
            max_steps: f.optional_or("ray_max_steps", ray_defaults.max_steps)?,
            max_retries: f.optional_or("ray_max_retries", ray_defaults.max_retries)?,
            tol_abs: f.optional_or("ray_tol_abs", ray_defaults.tol_abs)?,
            tol_rel: f.optional_or("ray_tol_rel", ray_defaults.tol_rel)?,
            err_factor: f.optional_or("ray_err_factor", ray_defaults.err_factor)?,
            min_factor: f.optional_or("ray_min_factor", ray_defaults.min_factor)?,
            max_factor: f.optional_or("ray_max_factor", ray_defaults.max_factor)?,
        };

        let normalization = match f.optional::<String>("image_normalization")?.as_deref() {
            None | Some("camera") => FrequencyNormalization::Camera,
            Some("infinity") => FrequencyNormalization::Infinity,
            Some(other) => {
                return Err(BlacklightError::config(format!(
                    "unrecognized image_normalization {other:?}"
                )))
            }
        };
        let mut image = ImageSettings {
            frequency: f.optional_or("image_frequency", 2.3e11)?,
            normalization,
            light: f.flag("image_light")?,
            polarization: f.flag("image_polarization")?,
            time: f.flag("image_time")?,
            length: f.flag("image_length")?,
            lambda: f.flag("image_lambda")?,
            emission: f.flag("image_emission")?,
            tau: f.flag("image_tau")?,
            lambda_ave: f.flag("image_lambda_ave")?,
            emission_ave: f.flag("image_emission_ave")?,
            tau_int: f.flag("image_tau_int")?,
            z_turnings: f.flag("image_z_turnings")?,
            cut_z_turnings: f.optional("cut_z_turnings")?,
        };
        if !simulation {
            if image.polarization {
                warn!("Ignoring image_polarization selection.");
                image.polarization = false;
            }
            for (selected, name) in [
                (&mut image.lambda_ave, "image_lambda_ave"),
                (&mut image.emission_ave, "image_emission_ave"),
                (&mut image.tau_int, "image_tau_int"),
            ] {
                if *selected {
                    warn!("Ignoring {name} selection.");
                    *selected = false;
                }
            }
        }

        let plasma = if simulation {
            Some(read_plasma(f)?)
        } else {
            None
        };

        let slow_light = if f.flag("slow_light_on")? {
            if !simulation {
                warn!("Ignoring slow light selection.");
                None
            } else {
                Some(SlowLightSettings {
                    interp: f.flag("slow_interp")?,
                    chunk_size: f.require("slow_chunk_size")?,
                    t_start: f.require("slow_t_start")?,
                    dt: f.require("slow_dt")?,
                })
            }
        } else {
            None
        };

        let fallback_nan = f.flag("fallback_nan")?;
        let fallback_defaults = FallbackValues::default();
        let fallback = FallbackPolicy {
            nan: fallback_nan,
            values: FallbackValues {
                rho: f.optional_or("fallback_rho", fallback_defaults.rho)?,
                pgas: f.optional_or("fallback_pgas", fallback_defaults.pgas)?,
                kappa: f.optional_or("fallback_kappa", fallback_defaults.kappa)?,
            },
        };

        let adaptive = read_adaptive(f)?;
        let renders = read_renders(f, simulation)?;

        let mut checkpoints = CheckpointSettings {
            geodesic_save: f.flag("checkpoint_geodesic_save")?,
            geodesic_load: f.flag("checkpoint_geodesic_load")?,
            geodesic_file: f.optional::<PathBuf>("checkpoint_geodesic_file")?,
            sample_save: f.flag("checkpoint_sample_save")?,
            sample_load: f.flag("checkpoint_sample_load")?,
            sample_file: f.optional::<PathBuf>("checkpoint_sample_file")?,
        };
        if !simulation && (checkpoints.sample_save || checkpoints.sample_load) {
            if checkpoints.sample_save {
                warn!("Ignoring checkpoint_sample_save selection.");
            }
            if checkpoints.sample_load {
                warn!("Ignoring checkpoint_sample_load selection.");
            }
            checkpoints.sample_save = false;
            checkpoints.sample_load = false;
        }

        let output = OutputSettings {
            file: f.optional::<PathBuf>("output_file")?,
            gzip: f.flag("output_gzip")?,
        };

        let config = RunConfig {
            model,
            num_threads: f.optional_or("num_threads", default_threads())?,
            camera,
            ray,
            ray_flat: f.flag("ray_flat")?,
            image,
            plasma,
            slow_light,
            fallback,
            adaptive,
            renders,
            checkpoints,
            output,
        };
        config.validate()?;
        Ok(config)
    }

    // Cross-option consistency; fatal at construction
    pub fn validate(&self) -> Result<()> {
        let spin = self.model.spin();
        if !(spin.abs() < 1.0) {
            return Err(BlacklightError::config(format!(
                "black-hole spin {spin} must lie in (-1, 1)"
            )));
        }

        if !self.image.any_selected() && self.renders.is_empty() {
            return Err(BlacklightError::config("no image or rendering selected"));
        }

        if self.num_threads == 0 {
            return Err(BlacklightError::config("num_threads must be positive"));
        }

        if self.adaptive.max_level > 0 {
            if !self.image.light {
                return Err(BlacklightError::config(
                    "adaptive ray tracing requires image_light",
                ));
            }
            if self.adaptive.block_size == 0 {
                return Err(BlacklightError::config(
                    "must have positive adaptive_block_size",
                ));
            }
            if self.camera.resolution % self.adaptive.block_size != 0 {
                return Err(BlacklightError::config(
                    "adaptive_block_size must divide camera_resolution",
                ));
            }
        }

        if self.checkpoints.geodesic_save && self.checkpoints.geodesic_load {
            return Err(BlacklightError::config(
                "cannot both save and load a geodesic checkpoint",
            ));
        }
        if self.checkpoints.sample_save && self.checkpoints.sample_load {
            return Err(BlacklightError::config(
                "cannot both save and load a sample checkpoint",
            ));
        }
        if (self.checkpoints.geodesic_save || self.checkpoints.geodesic_load)
            && self.checkpoints.geodesic_file.is_none()
        {
            return Err(BlacklightError::config("missing checkpoint_geodesic_file"));
        }
        if (self.checkpoints.sample_save || self.checkpoints.sample_load)
            && self.checkpoints.sample_file.is_none()
        {
            return Err(BlacklightError::config("missing checkpoint_sample_file"));
        }
        if self.slow_light.is_some()
            && (self.checkpoints.sample_save || self.checkpoints.sample_load)
        {
            return Err(BlacklightError::config(
                "cannot use sample checkpoints with slow light",
            ));
        }

        for render in &self.renders {
            if render.features.is_empty() {
                return Err(BlacklightError::config(
                    "must have positive number of features for each rendered image",
                ));
            }
        }

        Ok(())
    }
}

fn read_plasma(f: &InputFile) -> Result<PlasmaSettings> {
    let model = match f.require::<String>("plasma_model")?.as_str() {
        "ti_te_beta" => PlasmaModel::TiTeBeta,
        "code_kappa" => PlasmaModel::CodeKappa,
        other => {
            return Err(BlacklightError::config(format!(
                "unrecognized plasma_model {other:?}"
            )))
        }
    };
    let (rat_low, rat_high) = if model == PlasmaModel::TiTeBeta {
        (f.require("plasma_rat_low")?, f.require("plasma_rat_high")?)
    } else {
        (1.0, 1.0)
    };

    let power_frac: f64 = f.optional_or("plasma_power_frac", 0.0)?;
    if !(0.0..=1.0).contains(&power_frac) {
        warn!("Fraction of power-law electrons outside [0, 1].");
    }
    let (p, gamma_min, gamma_max) = if power_frac != 0.0 {
        (
            f.require("plasma_p")?,
            f.require("plasma_gamma_min")?,
            f.require("plasma_gamma_max")?,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let kappa_frac: f64 = f.optional_or("plasma_kappa_frac", 0.0)?;
    if !(0.0..=1.0).contains(&kappa_frac) {
        warn!("Fraction of kappa-distribution electrons outside [0, 1].");
    }
    let (kappa, w) = if kappa_frac != 0.0 {
        (f.require("plasma_kappa")?, f.require("plasma_w")?)
    } else {
        (0.0, 0.0)
    };

    let thermal_frac = 1.0 - (power_frac + kappa_frac);
    if !(0.0..=1.0).contains(&thermal_frac) {
        warn!("Fraction of thermal electrons outside [0, 1].");
    }

    Ok(PlasmaSettings {
        mu: f.require("plasma_mu")?,
        ne_ni: f.require("plasma_ne_ni")?,
        model,
        rat_low,
        rat_high,
        power_frac,
        p,
        gamma_min,
        gamma_max,
        kappa_frac,
        kappa,
        w,
        thermal_frac,
        sigma_max: f.optional_or("plasma_sigma_max", f64::INFINITY)?,
    })
}

fn read_adaptive(f: &InputFile) -> Result<AdaptiveSettings> {
    let max_level: usize = f.optional_or("adaptive_max_level", 0)?;
    if max_level == 0 {
        return Ok(AdaptiveSettings::default());
    }
    let block_size: usize = f.require("adaptive_block_size")?;

    // A criterion is enabled by a nonnegative fraction; its cut is then required
    let criterion = |frac_key: &str, cut_key: &str| -> Result<RefinementCriterion> {
        let frac: f64 = f.optional_or(frac_key, -1.0)?;
        if frac >= 0.0 {
            Ok(RefinementCriterion {
                frac,
                cut: f.require(cut_key)?,
            })
        } else {
            Ok(RefinementCriterion::disabled())
        }
    };

    Ok(AdaptiveSettings {
        max_level,
        block_size,
        val: criterion("adaptive_val_frac", "adaptive_val_cut")?,
        abs_grad: criterion("adaptive_abs_grad_frac", "adaptive_abs_grad_cut")?,
        rel_grad: criterion("adaptive_rel_grad_frac", "adaptive_rel_grad_cut")?,
        abs_lapl: criterion("adaptive_abs_lapl_frac", "adaptive_abs_lapl_cut")?,
        rel_lapl: criterion("adaptive_rel_lapl_frac", "adaptive_rel_lapl_cut")?,
    })
}

fn read_renders(f: &InputFile, simulation: bool) -> Result<Vec<RenderImage>> {
    let num_images: usize = f.optional_or("render_num_images", 0)?;
    if num_images == 0 {
        return Ok(Vec::new());
    }
    if !simulation {
        warn!("Ignoring request for rendering.");
        return Ok(Vec::new());
    }

    let mut renders = Vec::with_capacity(num_images);
    for i in 1..=num_images {
        let num_features: usize = f.require(&format!("render_{i}_num_features"))?;
        if num_features == 0 {
            return Err(BlacklightError::config(
                "must have positive number of features for each rendered image",
            ));
        }
        let mut features = Vec::with_capacity(num_features);
        for n in 1..=num_features {
            let kind = match f.require::<String>(&format!("render_{i}_type_{n}"))?.as_str() {
                "rise" => RenderKind::Rise,
                "fall" => RenderKind::Fall,
                "fill" => RenderKind::Fill,
                other => {
                    return Err(BlacklightError::config(format!(
                        "unrecognized render type {other:?}"
                    )))
                }
            };
            let (thresh, opacity) = if kind != RenderKind::Fill {
                (
                    f.require(&format!("render_{i}_thresh_{n}"))?,
                    f.require(&format!("render_{i}_opacity_{n}"))?,
                )
            } else {
                (0.0, 0.0)
            };
            let (min, max, tau_scale) = if kind == RenderKind::Fill {
                (
                    f.require(&format!("render_{i}_min_{n}"))?,
                    f.require(&format!("render_{i}_max_{n}"))?,
                    f.require(&format!("render_{i}_tau_scale_{n}"))?,
                )
            } else {
                (0.0, 0.0, 1.0)
            };
            features.push(RenderFeature {
                quantity: f.require(&format!("render_{i}_quantity_{n}"))?,
                kind,
                thresh,
                opacity,
                min,
                max,
                tau_scale,
                color: [
                    f.require(&format!("render_{i}_x_{n}"))?,
                    f.require(&format!("render_{i}_y_{n}"))?,
                    f.require(&format!("render_{i}_z_{n}"))?,
                ],
            });
        }
        renders.push(RenderImage { features });
    }
    Ok(renders)
}
