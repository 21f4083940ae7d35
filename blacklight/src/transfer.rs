// Radiative transfer along sampled rays, from the source end to the camera
//
// Intensities are carried as the Lorentz invariant I/nu^3 and restored to
// the camera frame at the end. Affine lengths are converted to CGS with
// length_factor = (GM/c^2 in cm) / momentum_factor, matching the invariant
// coefficient normalization.

use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;

use crate::channels::{ChannelKind, ChannelSchema, ImageSettings};
use crate::coefficients::CoefficientSet;
use crate::metric::Spacetime;
use crate::sample::SampleSet;

// Minimum sample stride between counted line-of-sight turning points
const MIN_TURNING_STRIDE: usize = 10;

// Below this optical activity a step uses the matrix-exponential series
const SERIES_THRESHOLD: f64 = 1.0e-10;

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    // Negative intensities clamped to zero
    pub clamped: usize,
}

// ============================================================================
// SCALAR STEP
// ============================================================================

// (1 - e^{-a dl}) / a with the a -> 0 limit dl
#[inline]
fn expm1_over(a: f64, dl: f64) -> f64 {
    if (a * dl).abs() < 1.0e-12 {
        dl * (1.0 - 0.5 * a * dl)
    } else {
        -(-a * dl).exp_m1() / a
    }
}

// Exact solution of y' = -a y + s over one step
#[inline]
fn decay_step(y: f64, a: f64, s: f64, dl: f64) -> f64 {
    y * (-a * dl).exp() + s * expm1_over(a, dl)
}

// ============================================================================
// POLARIZED STEP
// ============================================================================

// Rotate (Q, U, V) about the Faraday axis by angle |rho| dl. The generator
// rotates Q into U with rho_q and U into V with rho_v, so a rho_q of pi over
// unit length flips the sign of linear polarization.
fn rotate_quv(s: &mut [f64; 4], rho_q: f64, rho_v: f64, dl: f64) {
    let omega = [rho_v, 0.0, rho_q];
    let mag = (rho_q * rho_q + rho_v * rho_v).sqrt();
    if mag * dl.abs() < 1.0e-300 {
        return;
    }
    let axis = [omega[0] / mag, omega[1] / mag, omega[2] / mag];
    let angle = mag * dl;
    let (sin_a, cos_a) = angle.sin_cos();
    let v = [s[1], s[2], s[3]];
    let cross = [
        axis[1] * v[2] - axis[2] * v[1],
        axis[2] * v[0] - axis[0] * v[2],
        axis[0] * v[1] - axis[1] * v[0],
    ];
    let dot = axis[0] * v[0] + axis[1] * v[1] + axis[2] * v[2];
    for i in 0..3 {
        s[1 + i] = v[i] * cos_a + cross[i] * sin_a + axis[i] * dot * (1.0 - cos_a);
    }
}

// Exact constant-coefficient absorption-plus-emission over one step.
// Diagonalizes the absorption matrix: the intensity couples to the
// polarization component along (alpha_q, alpha_v) with rates
// alpha_i +- alpha_perp; everything orthogonal decays with alpha_i.
fn absorb_step(
    s: &mut [f64; 4],
    j_i: f64,
    j_q: f64,
    j_v: f64,
    alpha_i: f64,
    alpha_q: f64,
    alpha_v: f64,
    dl: f64,
) {
    let alpha_perp = (alpha_q * alpha_q + alpha_v * alpha_v).sqrt();
    if alpha_perp < 1.0e-300 {
        s[0] = decay_step(s[0], alpha_i, j_i, dl);
        s[1] = decay_step(s[1], alpha_i, j_q, dl);
        s[2] = decay_step(s[2], alpha_i, 0.0, dl);
        s[3] = decay_step(s[3], alpha_i, j_v, dl);
        return;
    }

    let ax = alpha_q / alpha_perp;
    let az = alpha_v / alpha_perp;
    // Components along and across the absorption direction in the (Q, V) plane
    let p = ax * s[1] + az * s[3];
    let w = -az * s[1] + ax * s[3];
    let j_p = ax * j_q + az * j_v;
    let j_w = -az * j_q + ax * j_v;

    let y_plus = decay_step(s[0] + p, alpha_i + alpha_perp, j_i + j_p, dl);
    let y_minus = decay_step(s[0] - p, alpha_i - alpha_perp, j_i - j_p, dl);
    let w_new = decay_step(w, alpha_i, j_w, dl);
    let u_new = decay_step(s[2], alpha_i, 0.0, dl);

    s[0] = 0.5 * (y_plus + y_minus);
    let p_new = 0.5 * (y_plus - y_minus);
    s[1] = ax * p_new - az * w_new;
    s[2] = u_new;
    s[3] = az * p_new + ax * w_new;
}

// First-order matrix-exponential series for optically quiet steps:
// S += (J - M S) dl + 1/2 M (M S - J) dl^2
fn series_step(
    s: &mut [f64; 4],
    j: &[f64; 4],
    alpha_i: f64,
    alpha_q: f64,
    alpha_v: f64,
    rho_q: f64,
    rho_v: f64,
    dl: f64,
) {
    let m_mul = |v: &[f64; 4]| -> [f64; 4] {
        [
            alpha_i * v[0] + alpha_q * v[1] + alpha_v * v[3],
            alpha_q * v[0] + alpha_i * v[1] + rho_q * v[2],
            -rho_q * v[1] + alpha_i * v[2] + rho_v * v[3],
            alpha_v * v[0] - rho_v * v[2] + alpha_i * v[3],
        ]
    };
    let ms = m_mul(s);
    let mut first = [0.0; 4];
    for i in 0..4 {
        first[i] = j[i] - ms[i];
    }
    let mut diff = [0.0; 4];
    for i in 0..4 {
        diff[i] = ms[i] - j[i];
    }
    let second = m_mul(&diff);
    for i in 0..4 {
        s[i] += first[i] * dl + 0.5 * second[i] * dl * dl;
    }
}

// ============================================================================
// POLARIZATION BASIS TRANSPORT
// ============================================================================

// Angle of the coordinate-anchored screen basis against the parallel-
// transported one, from the Walker-Penrose constant. Differences between
// consecutive samples give the per-step basis rotation. Identically zero in
// flat mode, where Cartesian components are parallel-transported as-is.
fn wp_basis_angle(spacetime: &Spacetime, x: &[f64; 4], k_cov: &[f64; 4]) -> f64 {
    if spacetime.flat {
        return 0.0;
    }
    let m = spacetime.mass;
    let a = spacetime.spin;
    let r = spacetime.radial_coordinate(x[1], x[2], x[3]);
    let cth = (x[3] / r).clamp(-1.0, 1.0);
    let sth = (1.0 - cth * cth).max(1.0e-300).sqrt();
    let ph = x[2].atan2(x[1]) - (a / r).atan();
    let (sph, cph) = ph.sin_cos();

    // Contravariant momentum in Cartesian Kerr-Schild
    let mut gcon = [[0.0; 4]; 4];
    spacetime.contravariant(x[1], x[2], x[3], &mut gcon);
    let k_con = crate::metric::raise(&gcon, k_cov);

    // Invert the spherical-to-Cartesian Kerr-Schild Jacobian for the
    // spatial components, then undo the radial mixing into t and phi
    let jac = [
        [
            sth * cph,
            cth * (r * cph - a * sph),
            sth * (-r * sph - a * cph),
        ],
        [
            sth * sph,
            cth * (r * sph + a * cph),
            sth * (r * cph - a * sph),
        ],
        [cth, -r * sth, 0.0],
    ];
    let rhs = [k_con[1], k_con[2], k_con[3]];
    let Some(sph_k) = solve3(&jac, &rhs) else {
        return 0.0;
    };
    let (kr, kth, kph_ks) = (sph_k[0], sph_k[1], sph_k[2]);
    let delta = r * r - 2.0 * m * r + a * a;
    if delta.abs() < 1.0e-300 {
        return 0.0;
    }
    let kt = k_con[0] - 2.0 * m * r / delta * kr;
    let kph = kph_ks - a / delta * kr;

    // Local static-frame screen vector seeded from the polar direction
    let sigma = r * r + a * a * cth * cth;
    let f = [0.0, 0.0, 1.0 / sigma.sqrt(), 0.0];

    // Walker-Penrose components for (k, f)
    let aa = (kt * f[1] - kr * f[0]) + a * sth * sth * (kr * f[3] - kph * f[1]);
    let bb = ((r * r + a * a) * (kph * f[2] - kth * f[3]) - a * (kt * f[2] - kth * f[0])) * sth;
    let re = aa * r + bb * a * cth;
    let im = bb * r - aa * a * cth;
    if re.abs() < 1.0e-300 && im.abs() < 1.0e-300 {
        return 0.0;
    }
    im.atan2(re)
}

// Solve a 3x3 linear system by elimination; None when singular
fn solve3(m: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut a = *m;
    let mut x = *b;
    for col in 0..3 {
        let mut pivot = col;
        for row in col + 1..3 {
            if a[row][col].abs() > a[pivot][col].abs() {
                pivot = row;
            }
        }
        if a[pivot][col].abs() < 1.0e-300 {
            return None;
        }
        a.swap(col, pivot);
        x.swap(col, pivot);
        for row in col + 1..3 {
            let factor = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= factor * a[col][k];
            }
            x[row] -= factor * x[col];
        }
    }
    let mut out = [0.0; 3];
    for row in (0..3).rev() {
        let mut sum = x[row];
        for k in row + 1..3 {
            sum -= a[row][k] * out[k];
        }
        out[row] = sum / a[row][row];
    }
    Some(out)
}

// ============================================================================
// LINE-OF-SIGHT TURNINGS
// ============================================================================

// Count z-turning points along a sampled ray, scanning from the camera end
// toward the source with a minimum stride between counted turnings. When a
// cut is given, returns the sample index where transfer should begin.
fn find_z_turnings(
    samples: &SampleSet,
    m: usize,
    count: usize,
    cut: Option<u32>,
) -> (usize, u32) {
    let mut turnings = 0u32;
    let mut n_start: Option<usize> = None;
    if count < 2 * MIN_TURNING_STRIDE + 2 {
        return (0, 0);
    }

    let z = |n: usize| samples.positions[[m, n, 3]];
    let mut n = count - MIN_TURNING_STRIDE - 1;
    while n >= MIN_TURNING_STRIDE {
        let find_1 = (z(n + 1) - z(n)) * (z(n) - z(n - 1));
        let mut counted = false;
        if find_1 < 0.0 {
            counted = true;
        } else if find_1 == 0.0 {
            let find_n = (z(n + MIN_TURNING_STRIDE) - z(n)) * (z(n) - z(n - MIN_TURNING_STRIDE));
            if find_n < 0.0 {
                counted = true;
            }
        }
        if counted {
            turnings += 1;
            if let Some(c) = cut {
                if n_start.is_none() && turnings == c + 1 {
                    n_start = Some(n);
                }
            }
            if n < 2 * MIN_TURNING_STRIDE {
                break;
            }
            n -= MIN_TURNING_STRIDE;
        }
        if n == MIN_TURNING_STRIDE {
            break;
        }
        n -= 1;
    }
    (n_start.unwrap_or(0), turnings)
}

// ============================================================================
// IMAGE INTEGRATION
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub fn integrate_image(
    spacetime: &Spacetime,
    samples: &SampleSet,
    coefficients: &CoefficientSet,
    image_settings: &ImageSettings,
    schema: &ChannelSchema,
    length_factor: f64,
    momentum_factor: f64,
    nan_flagged: bool,
    pool: &rayon::ThreadPool,
) -> (Array2<f64>, TransferStats) {
    let num_pix = samples.num_pix();
    // Row-major (num_pix, num_channels): each pixel's channels are contiguous
    let mut image = Array2::<f64>::zeros((num_pix, schema.len()));
    let nu3 = momentum_factor.powi(3);

    let clamped: usize = pool.install(|| {
        image
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(m, mut row)| {
                integrate_pixel(
                    spacetime,
                    samples,
                    coefficients,
                    image_settings,
                    schema,
                    length_factor,
                    nu3,
                    nan_flagged,
                    m,
                    row.as_slice_mut().expect("contiguous image row"),
                )
            })
            .sum()
    });

    (image, TransferStats { clamped })
}

#[allow(clippy::too_many_arguments)]
fn integrate_pixel(
    spacetime: &Spacetime,
    samples: &SampleSet,
    coefficients: &CoefficientSet,
    image_settings: &ImageSettings,
    schema: &ChannelSchema,
    length_factor: f64,
    nu3: f64,
    nan_flagged: bool,
    m: usize,
    out: &mut [f64],
) -> usize {
    if samples.flags[m] && nan_flagged {
        out.fill(f64::NAN);
        return 0;
    }

    let count = samples.counts[m] as usize;
    let want_turnings = image_settings.z_turnings || image_settings.cut_z_turnings.is_some();
    let (n_start, turnings) = if want_turnings && count > 0 {
        find_z_turnings(samples, m, count, image_settings.cut_z_turnings)
    } else {
        (0, 0)
    };

    // Stokes state as invariant intensities
    let mut stokes = [0.0; 4];
    let mut clamped = 0usize;

    // Auxiliary accumulators
    let mut total_lambda = 0.0;
    let mut total_length = 0.0;
    let mut total_emission = 0.0;
    let mut total_tau = 0.0;
    let num_cells = coefficients.num_cells;
    let mut lambda_ave = vec![0.0; num_cells];
    let mut emission_ave = vec![0.0; num_cells];
    let mut tau_int = vec![0.0; num_cells];

    let mut prev_angle = if image_settings.polarization && count > n_start {
        let x = sample_position(samples, m, n_start);
        let k = sample_momentum(samples, m, n_start);
        wp_basis_angle(spacetime, &x, &k)
    } else {
        0.0
    };

    for n in n_start..count {
        let dl_code = samples.lengths[[m, n]];
        let dl = dl_code * length_factor;
        let j_i = coefficients.j_i[[m, n]];
        let alpha_i = coefficients.alpha_i[[m, n]];

        if image_settings.polarization {
            // Carry the polarization frame along the geodesic
            if n > n_start {
                let x = sample_position(samples, m, n);
                let k = sample_momentum(samples, m, n);
                let angle = wp_basis_angle(spacetime, &x, &k);
                let mut delta = angle - prev_angle;
                if delta > std::f64::consts::PI {
                    delta -= 2.0 * std::f64::consts::PI;
                } else if delta < -std::f64::consts::PI {
                    delta += 2.0 * std::f64::consts::PI;
                }
                prev_angle = angle;
                let (s2, c2) = (2.0 * delta).sin_cos();
                let (q, u) = (stokes[1], stokes[2]);
                stokes[1] = c2 * q - s2 * u;
                stokes[2] = s2 * q + c2 * u;
            }

            let j_q = coefficients.j_q[[m, n]];
            let j_v = coefficients.j_v[[m, n]];
            let alpha_q = coefficients.alpha_q[[m, n]];
            let alpha_v = coefficients.alpha_v[[m, n]];
            let rho_q = coefficients.rho_q[[m, n]];
            let rho_v = coefficients.rho_v[[m, n]];

            let activity = (alpha_i.abs()
                + (alpha_q * alpha_q + alpha_v * alpha_v).sqrt()
                + (rho_q * rho_q + rho_v * rho_v).sqrt())
                * dl.abs();
            if activity < SERIES_THRESHOLD {
                let j = [j_i, j_q, 0.0, j_v];
                series_step(
                    &mut stokes, &j, alpha_i, alpha_q, alpha_v, rho_q, rho_v, dl,
                );
            } else {
                // Split the step: half rotation, full absorption, half rotation
                rotate_quv(&mut stokes, rho_q, rho_v, 0.5 * dl);
                absorb_step(&mut stokes, j_i, j_q, j_v, alpha_i, alpha_q, alpha_v, dl);
                rotate_quv(&mut stokes, rho_q, rho_v, 0.5 * dl);
            }
        } else {
            stokes[0] = decay_step(stokes[0], alpha_i, j_i, dl);
        }

        // Auxiliary integrals share the sweep
        total_lambda += dl_code;
        total_emission += j_i * dl;
        let dtau = alpha_i * dl;
        total_tau += dtau;
        if n > n_start {
            let mut dist2 = 0.0;
            for mu in 1..4 {
                let d = samples.positions[[m, n, mu]] - samples.positions[[m, n - 1, mu]];
                dist2 += d * d;
            }
            total_length += dist2.sqrt();
        }
        for c in 0..num_cells {
            let q = coefficients.cell_values[[c, m, n]];
            lambda_ave[c] += q * dl_code;
            emission_ave[c] += q * j_i * dl;
            tau_int[c] += q * dtau;
        }
    }

    // Transfer anomaly: clamp unphysical negatives
    if stokes[0] < 0.0 {
        stokes[0] = 0.0;
        clamped = 1;
    }

    // Write the selected channels
    for (offset, channel) in schema.channels().iter().enumerate() {
        out[offset] = match &channel.kind {
            ChannelKind::Intensity => stokes[0] * nu3,
            ChannelKind::StokesQ => stokes[1] * nu3,
            ChannelKind::StokesU => stokes[2] * nu3,
            ChannelKind::StokesV => stokes[3] * nu3,
            ChannelKind::Time => {
                if count > n_start + 1 {
                    samples.positions[[m, count - 1, 0]] - samples.positions[[m, n_start, 0]]
                } else {
                    0.0
                }
            }
            ChannelKind::Length => total_length,
            ChannelKind::Lambda => total_lambda,
            ChannelKind::Emission => total_emission,
            ChannelKind::Tau => total_tau,
            ChannelKind::LambdaAve(c) => lambda_ave[*c] / total_lambda,
            ChannelKind::EmissionAve(c) => emission_ave[*c] / total_emission,
            ChannelKind::TauInt(c) => tau_int[*c] / total_tau,
            ChannelKind::ZTurnings => f64::from(turnings),
        };
    }
    clamped
}

#[inline]
fn sample_position(samples: &SampleSet, m: usize, n: usize) -> [f64; 4] {
    [
        samples.positions[[m, n, 0]],
        samples.positions[[m, n, 1]],
        samples.positions[[m, n, 2]],
        samples.positions[[m, n, 3]],
    ]
}

#[inline]
fn sample_momentum(samples: &SampleSet, m: usize, n: usize) -> [f64; 4] {
    [
        samples.momenta[[m, n, 0]],
        samples.momenta[[m, n, 1]],
        samples.momenta[[m, n, 2]],
        samples.momenta[[m, n, 3]],
    ]
}

// ============================================================================
// FALSE-COLOR RENDERING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    // Paint where a quantity first crosses its threshold from below
    Rise,
    // Paint where a quantity first crosses its threshold from above
    Fall,
    // Translucent emission wherever a quantity sits inside [min, max]
    Fill,
}

#[derive(Debug, Clone)]
pub struct RenderFeature {
    pub quantity: String,
    pub kind: RenderKind,
    pub thresh: f64,
    pub opacity: f64,
    pub min: f64,
    pub max: f64,
    pub tau_scale: f64,
    pub color: [f64; 3],
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub features: Vec<RenderFeature>,
}

// Composite the configured render images over the sampled cell values.
// Output is (num_images, 3, num_pix), blended far to near.
pub fn render_images(
    samples: &SampleSet,
    coefficients: &CoefficientSet,
    renders: &[RenderImage],
    cell_indices: &[Vec<usize>],
    length_factor: f64,
    pool: &rayon::ThreadPool,
) -> Array3<f64> {
    let num_pix = samples.num_pix();
    let mut out = Array3::<f64>::zeros((renders.len(), 3, num_pix));

    for (i, render) in renders.iter().enumerate() {
        let indices = &cell_indices[i];
        let mut slab = out.index_axis_mut(Axis(0), i);
        pool.install(|| {
            slab.axis_iter_mut(Axis(1))
                .into_par_iter()
                .enumerate()
                .for_each(|(m, mut rgb)| {
                    let count = samples.counts[m] as usize;
                    let mut color = [0.0f64; 3];
                    for n in 0..count {
                        for (f, feature) in render.features.iter().enumerate() {
                            let c = indices[f];
                            let q = coefficients.cell_values[[c, m, n]];
                            if !q.is_finite() {
                                continue;
                            }
                            let blend = match feature.kind {
                                RenderKind::Fill => {
                                    if q >= feature.min && q <= feature.max {
                                        let dl = samples.lengths[[m, n]] * length_factor;
                                        Some(1.0 - (-dl / feature.tau_scale).exp())
                                    } else {
                                        None
                                    }
                                }
                                RenderKind::Rise if n > 0 => {
                                    let prev = coefficients.cell_values[[c, m, n - 1]];
                                    if prev < feature.thresh && q >= feature.thresh {
                                        Some(feature.opacity)
                                    } else {
                                        None
                                    }
                                }
                                RenderKind::Fall if n > 0 => {
                                    let prev = coefficients.cell_values[[c, m, n - 1]];
                                    if prev > feature.thresh && q <= feature.thresh {
                                        Some(feature.opacity)
                                    } else {
                                        None
                                    }
                                }
                                _ => None,
                            };
                            if let Some(o) = blend {
                                for ch in 0..3 {
                                    color[ch] =
                                        color[ch] * (1.0 - o) + feature.color[ch] * o;
                                }
                            }
                        }
                    }
                    for ch in 0..3 {
                        rgb[ch] = color[ch];
                    }
                });
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSchema;
    use ndarray::{Array2 as A2, Array3 as A3};

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    // Hand-built sample set: one ray, `count` unit steps along +x
    fn slab_samples(count: usize) -> SampleSet {
        let mut positions = A3::zeros((1, count, 4));
        let mut momenta = A3::zeros((1, count, 4));
        for n in 0..count {
            positions[[0, n, 0]] = n as f64;
            positions[[0, n, 1]] = n as f64;
            momenta[[0, n, 0]] = -1.0;
            momenta[[0, n, 1]] = 1.0;
        }
        SampleSet {
            num_steps: count,
            counts: vec![count as u32],
            flags: vec![false],
            positions,
            momenta,
            lengths: A2::from_elem((1, count), 1.0),
            radii: A2::from_elem((1, count), 10.0),
        }
    }

    fn uniform_coefficients(count: usize, j: f64, alpha: f64) -> CoefficientSet {
        CoefficientSet {
            j_i: A2::from_elem((1, count), j),
            j_q: A2::zeros((1, count)),
            j_v: A2::zeros((1, count)),
            alpha_i: A2::from_elem((1, count), alpha),
            alpha_q: A2::zeros((1, count)),
            alpha_v: A2::zeros((1, count)),
            rho_q: A2::zeros((1, count)),
            rho_v: A2::zeros((1, count)),
            cell_values: A3::zeros((1, 1, count)),
            num_cells: 0,
        }
    }

    fn light_only() -> ImageSettings {
        ImageSettings::default()
    }

    #[test]
    fn single_transparent_step_integrates_exactly() {
        let st = Spacetime::minkowski();
        let samples = slab_samples(1);
        let coeffs = uniform_coefficients(1, 1.0, 0.0);
        let image = light_only();
        let schema = ChannelSchema::build(&image, &[]);
        let (out, stats) =
            integrate_image(&st, &samples, &coeffs, &image, &schema, 1.0, 1.0, true, &pool());
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(stats.clamped, 0);
    }

    #[test]
    fn uniform_slab_matches_analytic_solution() {
        let st = Spacetime::minkowski();
        let count = 40;
        let (j, alpha) = (0.7, 0.23);
        let samples = slab_samples(count);
        let coeffs = uniform_coefficients(count, j, alpha);
        let image = light_only();
        let schema = ChannelSchema::build(&image, &[]);
        let (out, _) =
            integrate_image(&st, &samples, &coeffs, &image, &schema, 1.0, 1.0, true, &pool());
        let length = count as f64;
        let expected = j / alpha * (1.0 - (-alpha * length).exp());
        assert!(
            (out[[0, 0]] - expected).abs() < 1.0e-6 * expected,
            "I = {} vs {}",
            out[[0, 0]],
            expected
        );
    }

    #[test]
    fn faraday_rotation_flips_linear_polarization() {
        // rho_q = pi over unit length turns (I, Q) = (1, 1) into (1, -1)
        let mut stokes = [1.0, 1.0, 0.0, 0.0];
        rotate_quv(&mut stokes, std::f64::consts::PI, 0.0, 0.5);
        absorb_step(&mut stokes, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        rotate_quv(&mut stokes, std::f64::consts::PI, 0.0, 0.5);
        assert!((stokes[0] - 1.0).abs() < 1e-12);
        assert!((stokes[1] + 1.0).abs() < 1e-12);
        assert!(stokes[2].abs() < 1e-12);
        assert!(stokes[3].abs() < 1e-12);
    }

    #[test]
    fn polarized_absorption_keeps_intensity_dominant() {
        let mut stokes = [1.0, 0.5, 0.2, -0.3];
        for _ in 0..50 {
            rotate_quv(&mut stokes, 0.3, 0.7, 0.05);
            absorb_step(&mut stokes, 0.4, 0.1, -0.05, 0.6, 0.2, 0.1, 0.1);
            rotate_quv(&mut stokes, 0.3, 0.7, 0.05);
        }
        let pol = stokes[1] * stokes[1] + stokes[2] * stokes[2] + stokes[3] * stokes[3];
        assert!(
            pol <= stokes[0] * stokes[0] * (1.0 + 1e-9),
            "P^2 = {pol} exceeds I^2 = {}",
            stokes[0] * stokes[0]
        );
        assert!(stokes[0] > 0.0);
    }

    #[test]
    fn series_step_matches_exact_step_for_small_coefficients() {
        let dl = 1.0e-6;
        let (j_i, j_q, j_v) = (0.3, 0.1, 0.05);
        let (ai, aq, av, rq, rv) = (0.2, 0.05, 0.02, 0.4, 0.1);
        let mut exact = [1.0, 0.4, 0.2, 0.1];
        let mut series = exact;
        rotate_quv(&mut exact, rq, rv, 0.5 * dl);
        absorb_step(&mut exact, j_i, j_q, j_v, ai, aq, av, dl);
        rotate_quv(&mut exact, rq, rv, 0.5 * dl);
        let j = [j_i, j_q, 0.0, j_v];
        series_step(&mut series, &j, ai, aq, av, rq, rv, dl);
        for i in 0..4 {
            assert!(
                (exact[i] - series[i]).abs() < 1e-12,
                "component {i}: {} vs {}",
                exact[i],
                series[i]
            );
        }
    }

    #[test]
    fn auxiliary_channels_accumulate_path_integrals() {
        let st = Spacetime::minkowski();
        let count = 10;
        let samples = slab_samples(count);
        let coeffs = uniform_coefficients(count, 0.5, 0.2);
        let image = ImageSettings {
            light: true,
            time: true,
            length: true,
            lambda: true,
            emission: true,
            tau: true,
            ..ImageSettings::default()
        };
        let schema = ChannelSchema::build(&image, &[]);
        let (out, _) =
            integrate_image(&st, &samples, &coeffs, &image, &schema, 1.0, 1.0, true, &pool());
        let get = |kind: &ChannelKind| out[[0, schema.offset(kind).unwrap()]];
        assert!((get(&ChannelKind::Lambda) - 10.0).abs() < 1e-12);
        assert!((get(&ChannelKind::Tau) - 2.0).abs() < 1e-12);
        assert!((get(&ChannelKind::Emission) - 5.0).abs() < 1e-12);
        assert!((get(&ChannelKind::Length) - 9.0).abs() < 1e-12);
        assert!((get(&ChannelKind::Time) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn flagged_pixels_are_poisoned_under_nan_policy() {
        let st = Spacetime::minkowski();
        let mut samples = slab_samples(4);
        samples.flags[0] = true;
        let coeffs = uniform_coefficients(4, 1.0, 0.0);
        let image = light_only();
        let schema = ChannelSchema::build(&image, &[]);
        let (out, _) =
            integrate_image(&st, &samples, &coeffs, &image, &schema, 1.0, 1.0, true, &pool());
        assert!(out[[0, 0]].is_nan());

        let (out, _) =
            integrate_image(&st, &samples, &coeffs, &image, &schema, 1.0, 1.0, false, &pool());
        assert!(out[[0, 0]].is_finite());
    }

    #[test]
    fn rise_feature_paints_first_threshold_crossing() {
        let count = 6;
        let samples = slab_samples(count);
        let mut coeffs = uniform_coefficients(count, 0.0, 0.0);
        coeffs.num_cells = 1;
        // Quantity ramps upward through 2.5 between samples 2 and 3
        for n in 0..count {
            coeffs.cell_values[[0, 0, n]] = n as f64;
        }
        let renders = vec![RenderImage {
            features: vec![RenderFeature {
                quantity: "q".to_string(),
                kind: RenderKind::Rise,
                thresh: 2.5,
                opacity: 1.0,
                min: 0.0,
                max: 0.0,
                tau_scale: 1.0,
                color: [1.0, 0.25, 0.0],
            }],
        }];
        let out = render_images(&samples, &coeffs, &renders, &[vec![0]], 1.0, &pool());
        assert!((out[[0, 0, 0]] - 1.0).abs() < 1e-12);
        assert!((out[[0, 1, 0]] - 0.25).abs() < 1e-12);
        assert_eq!(out[[0, 2, 0]], 0.0);
    }
}
