// Radiative-transfer coefficients: pluggable sources and the sample binder
//
// A source is selected once at construction and invoked uniformly in the
// sample loop. Models return fluid-frame CGS coefficients; the binder stores
// the Lorentz-invariant combinations j/nu^2, alpha*nu, rho*nu.

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use std::sync::Arc;

use crate::sample::SampleSet;

// The eight coefficient channels at one sample, fluid frame, CGS
#[derive(Debug, Clone, Copy, Default)]
pub struct Coefficients {
    pub j_i: f64,
    pub j_q: f64,
    pub j_v: f64,
    pub alpha_i: f64,
    pub alpha_q: f64,
    pub alpha_v: f64,
    pub rho_q: f64,
    pub rho_v: f64,
}

// Model response at one sample
#[derive(Debug, Clone)]
pub struct SampleOutput {
    // Fluid-frame frequency in Hz
    pub nu_cgs: f64,
    pub coefficients: Coefficients,
    // Diagnostic cell values, ordered like cell_value_names()
    pub cell_values: Vec<f64>,
}

// Substitute fluid state used when the fallback policy is not NaN
#[derive(Debug, Clone, Copy)]
pub struct FallbackValues {
    pub rho: f64,
    pub pgas: f64,
    pub kappa: f64,
}

impl Default for FallbackValues {
    fn default() -> Self {
        Self {
            rho: 1.0e-6,
            pgas: 1.0e-8,
            kappa: 3.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackPolicy {
    // Propagate NaN for invalid fluid instead of substituting
    pub nan: bool,
    pub values: FallbackValues,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            nan: true,
            values: FallbackValues::default(),
        }
    }
}

// A physical model evaluated at every sample. Implementations receive the
// contravariant 4-position, the covariant photon momentum, the radial
// coordinate, and the code-to-CGS frequency factor.
pub trait CoefficientModel: Send + Sync {
    fn cell_value_names(&self) -> Vec<String> {
        Vec::new()
    }

    // None marks invalid fluid at this sample
    fn evaluate(
        &self,
        x: &[f64; 4],
        k: &[f64; 4],
        r: f64,
        momentum_factor: f64,
    ) -> Option<SampleOutput>;

    // Invalid fluid re-evaluated with the substitute state
    fn evaluate_fallback(
        &self,
        _x: &[f64; 4],
        _k: &[f64; 4],
        _r: f64,
        _momentum_factor: f64,
        _fallback: &FallbackValues,
    ) -> Option<SampleOutput> {
        None
    }
}

// Coefficient source chosen at pipeline construction
#[derive(Clone)]
pub enum CoefficientSource {
    Formula(Arc<FormulaModel>),
    Plugged(Arc<dyn CoefficientModel>),
}

impl CoefficientSource {
    pub fn model(&self) -> &dyn CoefficientModel {
        match self {
            CoefficientSource::Formula(m) => m.as_ref(),
            CoefficientSource::Plugged(m) => m.as_ref(),
        }
    }
}

// ============================================================================
// FORMULA MODEL
// ============================================================================

// Analytic torus: Gaussian density in radius and latitude on circular
// orbits, with power-law emission and absorption
#[derive(Debug, Clone)]
pub struct FormulaModel {
    pub bh_m: f64,
    pub bh_a: f64,
    // Density scale radius
    pub r0: f64,
    // Latitude concentration
    pub h: f64,
    // Angular-momentum profile l = l0 / (1 + rc) * rc^(1 + q)
    pub l0: f64,
    pub q: f64,
    // Reference frequency and emissivity scale
    pub nup: f64,
    pub cn0: f64,
    // Spectral indices and absorption scale
    pub alpha: f64,
    pub a_coef: f64,
    pub beta: f64,
}

impl CoefficientModel for FormulaModel {
    fn evaluate(
        &self,
        x: &[f64; 4],
        k: &[f64; 4],
        r: f64,
        momentum_factor: f64,
    ) -> Option<SampleOutput> {
        let m = self.bh_m;
        let a = self.bh_a;

        // Boyer-Lindquist-like angles at the sample point
        let rr = (r * r - x[3] * x[3]).max(0.0).sqrt();
        let cth = x[3] / r;
        let sth = (1.0 - cth * cth).max(0.0).sqrt();
        let ph = x[2].atan2(x[1]) - (a / r).atan();
        let (sph, cph) = ph.sin_cos();

        // Contravariant Boyer-Lindquist metric components
        let delta = r * r - 2.0 * m * r + a * a;
        let sigma = r * r + a * a * cth * cth;
        let gtt_bl = -(1.0 + 2.0 * m * r * (r * r + a * a) / (delta * sigma));
        let gtph_bl = -2.0 * m * a * r / (delta * sigma);
        let grr_bl = delta / sigma;
        let gthth_bl = 1.0 / sigma;
        let gphph_bl = (sigma - 2.0 * m * r) / (delta * sigma * sth * sth);

        // Orbital angular momentum and the normalized circular 4-velocity
        let ll = self.l0 / (1.0 + rr) * rr.powf(1.0 + self.q);
        let u_norm = 1.0 / (-gtt_bl + 2.0 * gtph_bl * ll - gphph_bl * ll * ll).sqrt();
        let u_t_bl = -u_norm;
        let u_r_bl = 0.0;
        let u_th_bl = 0.0;
        let u_ph_bl = u_norm * ll;
        let ut_bl = gtt_bl * u_t_bl + gtph_bl * u_ph_bl;
        let ur_bl = grr_bl * u_r_bl;
        let uth_bl = gthth_bl * u_th_bl;
        let uph_bl = gtph_bl * u_t_bl + gphph_bl * u_ph_bl;

        // Transform to Kerr-Schild, then to Cartesian components
        let ut = ut_bl + 2.0 * m * r / delta * ur_bl;
        let ur = ur_bl;
        let uth = uth_bl;
        let uph = uph_bl + a / delta * ur_bl;
        let u0 = ut;
        let u1 = sth * cph * ur + cth * (r * cph - a * sph) * uth
            + sth * (-r * sph - a * cph) * uph;
        let u2 = sth * sph * ur + cth * (r * sph + a * cph) * uth
            + sth * (r * cph - a * sph) * uph;
        let u3 = cth * ur - r * sth * uth;

        // Fluid-frame number density and frequency
        let n_n0 = (-0.5 * (r * r / (self.r0 * self.r0) + self.h * self.h * cth * cth)).exp();
        let nu_cgs = -(u0 * k[0] + u1 * k[1] + u2 * k[2] + u3 * k[3]) * momentum_factor;

        let j_i = self.cn0 * n_n0 * (nu_cgs / self.nup).powf(-self.alpha);
        let alpha_i =
            self.a_coef * self.cn0 * n_n0 * (nu_cgs / self.nup).powf(-self.beta - self.alpha);

        Some(SampleOutput {
            nu_cgs,
            coefficients: Coefficients {
                j_i,
                alpha_i,
                ..Coefficients::default()
            },
            cell_values: Vec::new(),
        })
    }
}

// ============================================================================
// BINDER
// ============================================================================

// Invariant coefficient arrays of one refinement level, shaped (num_pix,
// num_steps) like the sample arrays they derive from
pub struct CoefficientSet {
    pub j_i: Array2<f64>,
    pub j_q: Array2<f64>,
    pub j_v: Array2<f64>,
    pub alpha_i: Array2<f64>,
    pub alpha_q: Array2<f64>,
    pub alpha_v: Array2<f64>,
    pub rho_q: Array2<f64>,
    pub rho_v: Array2<f64>,
    // (num_cells, num_pix, num_steps)
    pub cell_values: Array3<f64>,
    pub num_cells: usize,
}

struct RayCoefficients {
    rows: Vec<[f64; 8]>,
    cells: Vec<Vec<f64>>,
}

fn nan_row(num_cells: usize) -> ([f64; 8], Vec<f64>) {
    ([f64::NAN; 8], vec![f64::NAN; num_cells])
}

// Evaluate the source at every sample of one ray
fn bind_ray(
    source: &CoefficientSource,
    samples: &SampleSet,
    m: usize,
    momentum_factor: f64,
    fallback: &FallbackPolicy,
    num_cells: usize,
) -> RayCoefficients {
    let count = samples.counts[m] as usize;
    let mut out = RayCoefficients {
        rows: Vec::with_capacity(count),
        cells: Vec::with_capacity(count),
    };

    // A failed ray poisons its pixel under the NaN policy
    if fallback.nan && samples.flags[m] {
        for _ in 0..count {
            let (row, cells) = nan_row(num_cells);
            out.rows.push(row);
            out.cells.push(cells);
        }
        return out;
    }

    let model = source.model();
    for n in 0..count {
        let x = [
            samples.positions[[m, n, 0]],
            samples.positions[[m, n, 1]],
            samples.positions[[m, n, 2]],
            samples.positions[[m, n, 3]],
        ];
        let k = [
            samples.momenta[[m, n, 0]],
            samples.momenta[[m, n, 1]],
            samples.momenta[[m, n, 2]],
            samples.momenta[[m, n, 3]],
        ];
        let r = samples.radii[[m, n]];

        let mut output = model.evaluate(&x, &k, r, momentum_factor);
        if output.is_none() && !fallback.nan {
            output = model.evaluate_fallback(&x, &k, r, momentum_factor, &fallback.values);
        }
        match output {
            Some(sample) if sample.nu_cgs.is_finite() && sample.nu_cgs > 0.0 => {
                let nu = sample.nu_cgs;
                let c = sample.coefficients;
                out.rows.push([
                    c.j_i / (nu * nu),
                    c.j_q / (nu * nu),
                    c.j_v / (nu * nu),
                    c.alpha_i * nu,
                    c.alpha_q * nu,
                    c.alpha_v * nu,
                    c.rho_q * nu,
                    c.rho_v * nu,
                ]);
                let mut cells = sample.cell_values;
                cells.resize(num_cells, f64::NAN);
                out.cells.push(cells);
            }
            _ => {
                let (row, cells) = nan_row(num_cells);
                out.rows.push(row);
                out.cells.push(cells);
            }
        }
    }
    out
}

// Fill the coefficient arrays for a whole level in parallel
pub fn bind_coefficients(
    source: &CoefficientSource,
    samples: &SampleSet,
    momentum_factor: f64,
    fallback: &FallbackPolicy,
    pool: &rayon::ThreadPool,
) -> CoefficientSet {
    let num_pix = samples.num_pix();
    let num_steps = samples.num_steps;
    let num_cells = source.model().cell_value_names().len();

    let rays: Vec<RayCoefficients> = pool.install(|| {
        (0..num_pix)
            .into_par_iter()
            .map(|m| bind_ray(source, samples, m, momentum_factor, fallback, num_cells))
            .collect()
    });

    let mut set = CoefficientSet {
        j_i: Array2::zeros((num_pix, num_steps)),
        j_q: Array2::zeros((num_pix, num_steps)),
        j_v: Array2::zeros((num_pix, num_steps)),
        alpha_i: Array2::zeros((num_pix, num_steps)),
        alpha_q: Array2::zeros((num_pix, num_steps)),
        alpha_v: Array2::zeros((num_pix, num_steps)),
        rho_q: Array2::zeros((num_pix, num_steps)),
        rho_v: Array2::zeros((num_pix, num_steps)),
        cell_values: Array3::zeros((num_cells.max(1), num_pix, num_steps)),
        num_cells,
    };
    for (m, ray) in rays.iter().enumerate() {
        for (n, row) in ray.rows.iter().enumerate() {
            set.j_i[[m, n]] = row[0];
            set.j_q[[m, n]] = row[1];
            set.j_v[[m, n]] = row[2];
            set.alpha_i[[m, n]] = row[3];
            set.alpha_q[[m, n]] = row[4];
            set.alpha_v[[m, n]] = row[5];
            set.rho_q[[m, n]] = row[6];
            set.rho_v[[m, n]] = row[7];
            for c in 0..num_cells {
                set.cell_values[[c, m, n]] = ray.cells[n][c];
            }
        }
    }
    set
}
