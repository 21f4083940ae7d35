// Camera construction: worldline, tetrad, and per-pixel initial conditions
//
// Rays are traced backwards: the recorded momentum at launch is the
// past-directed continuation of a photon arriving at the camera, so the
// geodesic integrator's reversal step recovers the physical momentum.

use ndarray::Array2;

use crate::error::{BlacklightError, Result};
use crate::metric::{dot_con, lower, Spacetime};

// Offset keeping the tetrad construction away from the polar axis
const POLE_THETA_NUDGE: f64 = 2.0e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraType {
    // Parallel rays offset across the camera plane
    Plane,
    // All rays through the camera point, directions fanned across the tile
    Pinhole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyNormalization {
    // image_frequency is the frequency measured in the camera frame
    Camera,
    // image_frequency is the frequency measured at infinity
    Infinity,
}

// Camera placement and pixel-grid parameters; angles in degrees
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub camera_type: CameraType,
    pub r: f64,
    pub th: f64,
    pub ph: f64,
    // Normal-frame velocity components along the radial/polar/azimuthal directions
    pub urn: f64,
    pub uthn: f64,
    pub uphn: f64,
    // Line-of-sight direction in the same basis
    pub k_r: f64,
    pub k_th: f64,
    pub k_ph: f64,
    pub rotation: f64,
    pub width: f64,
    pub resolution: usize,
    pub pole: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            camera_type: CameraType::Plane,
            r: 100.0,
            th: 90.0,
            ph: 0.0,
            urn: 0.0,
            uthn: 0.0,
            uphn: 0.0,
            k_r: -1.0,
            k_th: 0.0,
            k_ph: 0.0,
            rotation: 0.0,
            width: 24.0,
            resolution: 64,
            pole: false,
        }
    }
}

// Tile location at some refinement level, in that level's tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLoc {
    pub i: u32,
    pub j: u32,
}

// Initial conditions for every pixel of one refinement level
pub struct PixelGrid {
    pub level: usize,
    pub block_size: usize,
    // Linear pixel resolution of this level (root resolution times 2^level)
    pub linear_resolution: usize,
    pub tiles: Vec<TileLoc>,
    // Contravariant 4-positions at lambda = 0, shape (num_pix, 4)
    pub positions: Array2<f64>,
    // Covariant launch momenta, shape (num_pix, 4)
    pub momenta: Array2<f64>,
}

impl PixelGrid {
    #[inline]
    pub fn num_pix(&self) -> usize {
        self.positions.nrows()
    }
}

// Constructed camera: worldline point, 4-velocity, and orthonormal tetrad
pub struct Camera {
    pub settings: CameraSettings,
    pub normalization: FrequencyNormalization,
    // Conversion from code-unit frequency to CGS
    pub momentum_factor: f64,
    pub x_cam: [f64; 4],
    pub u_con: [f64; 4],
    pub u_cov: [f64; 4],
    // Line of sight, horizontal, and vertical tetrad legs (contravariant)
    pub norm_con: [f64; 4],
    pub hor_con: [f64; 4],
    pub vert_con: [f64; 4],
    // Covariant launch momentum at the camera point
    k_cam_cov: [f64; 4],
}

impl Camera {
    pub fn new(
        spacetime: &Spacetime,
        settings: CameraSettings,
        image_frequency: f64,
        normalization: FrequencyNormalization,
    ) -> Result<Self> {
        if settings.resolution == 0 {
            return Err(BlacklightError::config("camera_resolution must be positive"));
        }
        if !(settings.width > 0.0) {
            return Err(BlacklightError::config("camera_width must be positive"));
        }
        if settings.r <= spacetime.inner_radius() && !spacetime.flat {
            return Err(BlacklightError::config(
                "camera_r must lie outside the horizon",
            ));
        }

        let mut th = settings.th.to_radians();
        let mut ph = settings.ph.to_radians();
        if settings.pole {
            // The azimuth is degenerate on the axis; pin it and keep theta
            // just off the pole so the angular basis stays defined.
            ph = 0.0;
            th = th.clamp(POLE_THETA_NUDGE, std::f64::consts::PI - POLE_THETA_NUDGE);
        }

        let a = spacetime.spin;
        let r = settings.r;
        let (sth, cth) = th.sin_cos();
        let (sph, cph) = ph.sin_cos();

        // Kerr-Schild position: x + iy = (r - ia) e^{i phi} sin th
        let x_cam = [
            0.0,
            sth * (r * cph - a * sph),
            sth * (r * sph + a * cph),
            r * cth,
        ];

        let mut gcov = [[0.0; 4]; 4];
        spacetime.covariant(x_cam[1], x_cam[2], x_cam[3], &mut gcov);

        // Flat-space angular directions at the camera point
        let e_r = [sth * cph, sth * sph, cth];
        let e_th = [cth * cph, cth * sph, -sth];
        let e_ph = [-sph, cph, 0.0];

        let combine = |cr: f64, ct: f64, cp: f64| -> [f64; 4] {
            [
                0.0,
                cr * e_r[0] + ct * e_th[0] + cp * e_ph[0],
                cr * e_r[1] + ct * e_th[1] + cp * e_ph[1],
                cr * e_r[2] + ct * e_th[2] + cp * e_ph[2],
            ]
        };

        // 4-velocity: spatial components fixed, u^0 from g_uv u^u u^v = -1
        let v = combine(settings.urn, settings.uthn, settings.uphn);
        let aq = gcov[0][0];
        let bq = 2.0 * (gcov[0][1] * v[1] + gcov[0][2] * v[2] + gcov[0][3] * v[3]);
        let mut cq = 1.0;
        for i in 1..4 {
            for j in 1..4 {
                cq += gcov[i][j] * v[i] * v[j];
            }
        }
        let disc = bq * bq - 4.0 * aq * cq;
        if disc < 0.0 {
            return Err(BlacklightError::config("camera velocity is not timelike"));
        }
        let root1 = (-bq + disc.sqrt()) / (2.0 * aq);
        let root2 = (-bq - disc.sqrt()) / (2.0 * aq);
        let u0 = root1.max(root2);
        if !(u0 > 0.0) {
            return Err(BlacklightError::config("camera velocity is not future-directed"));
        }
        let u_con = [u0, v[1], v[2], v[3]];
        let u_cov = lower(&gcov, &u_con);

        // Gram-Schmidt in the metric inner product; u.u = -1 so projecting
        // out the velocity adds (w.u) u
        let project = |w: &[f64; 4], basis: &[(&[f64; 4], f64)]| -> [f64; 4] {
            let mut out = *w;
            for &(b, norm_sign) in basis {
                let c = dot_con(&gcov, &out, b) * norm_sign;
                for mu in 0..4 {
                    out[mu] -= c * b[mu];
                }
            }
            out
        };
        let normalize = |w: &[f64; 4], label: &str| -> Result<[f64; 4]> {
            let n2 = dot_con(&gcov, w, w);
            if !(n2 > 1e-30) {
                return Err(BlacklightError::config(format!(
                    "degenerate camera {label} direction"
                )));
            }
            let inv = 1.0 / n2.sqrt();
            Ok([w[0] * inv, w[1] * inv, w[2] * inv, w[3] * inv])
        };

        let d = combine(settings.k_r, settings.k_th, settings.k_ph);
        if d[1] == 0.0 && d[2] == 0.0 && d[3] == 0.0 {
            return Err(BlacklightError::config("camera direction must be nonzero"));
        }
        let norm_con = normalize(&project(&d, &[(&u_con, -1.0)]), "line-of-sight")?;

        // Image-up toward the north pole, falling back to the azimuthal
        // direction when the view runs along the polar basis vector
        let mut up = combine(0.0, -1.0, 0.0);
        let mut vert = project(&up, &[(&u_con, -1.0), (&norm_con, 1.0)]);
        if dot_con(&gcov, &vert, &vert) < 1e-12 {
            up = combine(0.0, 0.0, 1.0);
            vert = project(&up, &[(&u_con, -1.0), (&norm_con, 1.0)]);
        }
        let vert_con = normalize(&vert, "vertical")?;

        let side = combine(0.0, 0.0, 1.0);
        let hor = project(&side, &[(&u_con, -1.0), (&norm_con, 1.0), (&vert_con, 1.0)]);
        let hor = if dot_con(&gcov, &hor, &hor) < 1e-12 {
            let side = combine(1.0, 0.0, 0.0);
            project(&side, &[(&u_con, -1.0), (&norm_con, 1.0), (&vert_con, 1.0)])
        } else {
            hor
        };
        let mut hor_con = normalize(&hor, "horizontal")?;

        // Right-handed (n, h, v) triad in the spatial sense
        let cross = [
            hor_con[2] * vert_con[3] - hor_con[3] * vert_con[2],
            hor_con[3] * vert_con[1] - hor_con[1] * vert_con[3],
            hor_con[1] * vert_con[2] - hor_con[2] * vert_con[1],
        ];
        let handed = cross[0] * norm_con[1] + cross[1] * norm_con[2] + cross[2] * norm_con[3];
        if handed < 0.0 {
            for mu in 0..4 {
                hor_con[mu] = -hor_con[mu];
            }
        }

        // In-plane image rotation
        let psi = settings.rotation.to_radians();
        let (spsi, cpsi) = psi.sin_cos();
        let mut hor_rot = [0.0; 4];
        let mut vert_rot = [0.0; 4];
        for mu in 0..4 {
            hor_rot[mu] = cpsi * hor_con[mu] + spsi * vert_con[mu];
            vert_rot[mu] = -spsi * hor_con[mu] + cpsi * vert_con[mu];
        }

        // Past-directed launch momentum; the traced photon leaves the camera
        // along the line of sight and backwards in time
        let mut k_con = [0.0; 4];
        for mu in 0..4 {
            k_con[mu] = norm_con[mu] - u_con[mu];
        }
        let k_cam_cov = lower(&gcov, &k_con);

        Ok(Self {
            settings,
            normalization,
            momentum_factor: image_frequency,
            x_cam,
            u_con,
            u_cov,
            norm_con,
            hor_con: hor_rot,
            vert_con: vert_rot,
            k_cam_cov,
        })
    }

    // Initial conditions for the pixels of the given tiles at one level.
    // Pixel (px, py) centers tile the image square; px runs along the
    // horizontal tetrad leg, py along the vertical one.
    pub fn pixel_grid(
        &self,
        spacetime: &Spacetime,
        level: usize,
        tiles: Vec<TileLoc>,
        block_size: usize,
    ) -> Result<PixelGrid> {
        let linear_resolution = self.settings.resolution << level;
        let num_pix = tiles.len() * block_size * block_size;
        let mut positions = Array2::<f64>::zeros((num_pix, 4));
        let mut momenta = Array2::<f64>::zeros((num_pix, 4));

        let scale = self.settings.width / linear_resolution as f64;
        let half = self.settings.width / 2.0;

        let mut ind = 0;
        for tile in &tiles {
            for lj in 0..block_size {
                for li in 0..block_size {
                    let px = tile.i as usize * block_size + li;
                    let py = tile.j as usize * block_size + lj;
                    let u_coord = (px as f64 + 0.5) * scale - half;
                    let v_coord = (py as f64 + 0.5) * scale - half;
                    let (pos, mom) = match self.settings.camera_type {
                        CameraType::Plane => self.pixel_plane(spacetime, u_coord, v_coord),
                        CameraType::Pinhole => self.pixel_pinhole(spacetime, u_coord, v_coord),
                    };
                    for mu in 0..4 {
                        positions[[ind, mu]] = pos[mu];
                        momenta[[ind, mu]] = mom[mu];
                    }
                    ind += 1;
                }
            }
        }

        Ok(PixelGrid {
            level,
            block_size,
            linear_resolution,
            tiles,
            positions,
            momenta,
        })
    }

    // Plane model: offset position, shared transverse momentum. The time
    // component is re-solved from the null condition at the pixel point.
    fn pixel_plane(&self, spacetime: &Spacetime, u: f64, v: f64) -> ([f64; 4], [f64; 4]) {
        let mut pos = [0.0; 4];
        for mu in 0..4 {
            pos[mu] = self.x_cam[mu] + u * self.hor_con[mu] + v * self.vert_con[mu];
        }

        let mut gcon = [[0.0; 4]; 4];
        spacetime.contravariant(pos[1], pos[2], pos[3], &mut gcon);
        let mut k = self.k_cam_cov;

        // g^00 k0^2 + 2 g^0i ki k0 + g^ij ki kj = 0, root nearest the camera value
        let aq = gcon[0][0];
        let mut bq = 0.0;
        let mut cq = 0.0;
        for i in 1..4 {
            bq += 2.0 * gcon[0][i] * k[i];
            for j in 1..4 {
                cq += gcon[i][j] * k[i] * k[j];
            }
        }
        let disc = bq * bq - 4.0 * aq * cq;
        if disc >= 0.0 && aq != 0.0 {
            let r1 = (-bq + disc.sqrt()) / (2.0 * aq);
            let r2 = (-bq - disc.sqrt()) / (2.0 * aq);
            k[0] = if (r1 - self.k_cam_cov[0]).abs() <= (r2 - self.k_cam_cov[0]).abs() {
                r1
            } else {
                r2
            };
        }
        self.apply_normalization(spacetime, &pos, &mut k);
        (pos, k)
    }

    // Pinhole model: common position, fanned direction renormalized to null
    fn pixel_pinhole(&self, spacetime: &Spacetime, u: f64, v: f64) -> ([f64; 4], [f64; 4]) {
        let pos = self.x_cam;
        let mut gcov = [[0.0; 4]; 4];
        spacetime.covariant(pos[1], pos[2], pos[3], &mut gcov);

        let mut dir = [0.0; 4];
        for mu in 0..4 {
            dir[mu] = self.norm_con[mu] + u * self.hor_con[mu] + v * self.vert_con[mu];
        }
        let n2 = dot_con(&gcov, &dir, &dir);
        let inv = 1.0 / n2.sqrt();
        let mut k_con = [0.0; 4];
        for mu in 0..4 {
            k_con[mu] = dir[mu] * inv - self.u_con[mu];
        }
        let mut k = lower(&gcov, &k_con);
        self.apply_normalization(spacetime, &pos, &mut k);
        (pos, k)
    }

    // Scale the launch momentum so the physical photon frequency equals one
    // code unit under the configured normalization
    fn apply_normalization(&self, spacetime: &Spacetime, pos: &[f64; 4], k: &mut [f64; 4]) {
        let nu = match self.normalization {
            FrequencyNormalization::Camera => {
                let mut gcon = [[0.0; 4]; 4];
                spacetime.contravariant(pos[1], pos[2], pos[3], &mut gcon);
                // nu = -k_phys . u with k_phys = -k
                let mut k_con = [0.0; 4];
                for mu in 0..4 {
                    for nu_i in 0..4 {
                        k_con[mu] += gcon[mu][nu_i] * k[nu_i];
                    }
                }
                let mut sum = 0.0;
                for mu in 0..4 {
                    sum += self.u_cov[mu] * k_con[mu];
                }
                sum
            }
            FrequencyNormalization::Infinity => -k[0],
        };
        if nu.abs() > 0.0 && nu.is_finite() {
            let inv = 1.0 / nu.abs();
            for mu in 0..4 {
                k[mu] *= inv;
            }
        }
    }
}

// Dense root-level tile list in row-major order
pub fn root_tiles(resolution: usize, block_size: usize) -> Vec<TileLoc> {
    let linear = resolution / block_size;
    let mut tiles = Vec::with_capacity(linear * linear);
    for j in 0..linear {
        for i in 0..linear {
            tiles.push(TileLoc {
                i: i as u32,
                j: j as u32,
            });
        }
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::dot_cov;

    fn flat_camera(camera_type: CameraType) -> (Spacetime, Camera) {
        let st = Spacetime::minkowski();
        let settings = CameraSettings {
            camera_type,
            ..CameraSettings::default()
        };
        let cam = Camera::new(&st, settings, 1.0, FrequencyNormalization::Camera).unwrap();
        (st, cam)
    }

    #[test]
    fn tetrad_is_orthonormal_in_kerr() {
        let st = Spacetime::new(1.0, 0.9).unwrap();
        let settings = CameraSettings {
            th: 60.0,
            ph: 30.0,
            urn: 0.05,
            uphn: 0.1,
            ..CameraSettings::default()
        };
        let cam = Camera::new(&st, settings, 1.0, FrequencyNormalization::Camera).unwrap();
        let mut gcov = [[0.0; 4]; 4];
        st.covariant(cam.x_cam[1], cam.x_cam[2], cam.x_cam[3], &mut gcov);

        assert!((dot_con(&gcov, &cam.u_con, &cam.u_con) + 1.0).abs() < 1e-10);
        for leg in [&cam.norm_con, &cam.hor_con, &cam.vert_con] {
            assert!((dot_con(&gcov, leg, leg) - 1.0).abs() < 1e-10);
            assert!(dot_con(&gcov, leg, &cam.u_con).abs() < 1e-10);
        }
        assert!(dot_con(&gcov, &cam.norm_con, &cam.hor_con).abs() < 1e-10);
        assert!(dot_con(&gcov, &cam.norm_con, &cam.vert_con).abs() < 1e-10);
        assert!(dot_con(&gcov, &cam.hor_con, &cam.vert_con).abs() < 1e-10);
    }

    #[test]
    fn launch_momenta_are_null() {
        for camera_type in [CameraType::Plane, CameraType::Pinhole] {
            let st = Spacetime::new(1.0, 0.5).unwrap();
            let settings = CameraSettings {
                camera_type,
                resolution: 4,
                ..CameraSettings::default()
            };
            let cam = Camera::new(&st, settings, 1.0, FrequencyNormalization::Camera).unwrap();
            let grid = cam
                .pixel_grid(&st, 0, root_tiles(4, 4), 4)
                .unwrap();
            assert_eq!(grid.num_pix(), 16);
            for m in 0..grid.num_pix() {
                let pos = [
                    grid.positions[[m, 0]],
                    grid.positions[[m, 1]],
                    grid.positions[[m, 2]],
                    grid.positions[[m, 3]],
                ];
                let k = [
                    grid.momenta[[m, 0]],
                    grid.momenta[[m, 1]],
                    grid.momenta[[m, 2]],
                    grid.momenta[[m, 3]],
                ];
                let mut gcon = [[0.0; 4]; 4];
                st.contravariant(pos[1], pos[2], pos[3], &mut gcon);
                let null = dot_cov(&gcon, &k, &k);
                let kmax = k.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
                assert!(
                    null.abs() < 1e-10 * kmax * kmax,
                    "pixel {m} null residual {null:.3e}"
                );
            }
        }
    }

    #[test]
    fn plane_pixels_share_direction_and_spread_in_position() {
        let (st, cam) = flat_camera(CameraType::Plane);
        let grid = cam.pixel_grid(&st, 0, root_tiles(4, 2), 2).unwrap();
        // All momenta identical in flat space
        for m in 1..grid.num_pix() {
            for mu in 0..4 {
                assert!((grid.momenta[[m, mu]] - grid.momenta[[0, mu]]).abs() < 1e-14);
            }
        }
        // Opposite corner pixels straddle the camera point
        let first = grid.positions.row(0);
        let last = grid.positions.row(grid.num_pix() - 1);
        assert!((first[2] + last[2]).abs() < 1e-10);
        assert!((first[3] + last[3]).abs() < 1e-10);
    }

    #[test]
    fn pinhole_pixels_share_position_and_spread_in_direction() {
        let (st, cam) = flat_camera(CameraType::Pinhole);
        let grid = cam.pixel_grid(&st, 0, root_tiles(4, 2), 2).unwrap();
        for m in 0..grid.num_pix() {
            for mu in 0..4 {
                assert!((grid.positions[[m, mu]] - cam.x_cam[mu]).abs() < 1e-14);
            }
        }
        let d0: Vec<f64> = grid.momenta.row(0).to_vec();
        let d1: Vec<f64> = grid.momenta.row(grid.num_pix() - 1).to_vec();
        assert!(d0.iter().zip(&d1).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn refined_level_doubles_linear_resolution() {
        let (st, cam) = flat_camera(CameraType::Plane);
        let tiles = vec![TileLoc { i: 0, j: 0 }];
        let grid0 = cam.pixel_grid(&st, 0, tiles.clone(), 2).unwrap();
        let grid1 = cam.pixel_grid(&st, 1, tiles, 2).unwrap();
        assert_eq!(grid0.linear_resolution * 2, grid1.linear_resolution);
        // Finer pixels sit closer together
        let d0 = grid0.positions[[1, 2]] - grid0.positions[[0, 2]];
        let d1 = grid1.positions[[1, 2]] - grid1.positions[[0, 2]];
        assert!((d0 - 2.0 * d1).abs() < 1e-10);
    }
}
