// Resampling of recorded trajectories onto transfer-step midpoints

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::geodesic::GeodesicSet;
use crate::metric::Spacetime;

// Midpoint samples of one refinement level, dimensioned like the geodesic
// arrays they derive from
pub struct SampleSet {
    // Second dimension of the packed arrays
    pub num_steps: usize,
    // Samples per ray; never exceeds the recorded geodesic step count
    pub counts: Vec<u32>,
    pub flags: Vec<bool>,
    // (num_pix, num_steps, 4) midpoint positions, slot 0 = t
    pub positions: Array3<f64>,
    // (num_pix, num_steps, 4) midpoint covariant momenta
    pub momenta: Array3<f64>,
    // (num_pix, num_steps) affine lengths of each transfer step
    pub lengths: Array2<f64>,
    // (num_pix, num_steps) radial coordinate at each midpoint
    pub radii: Array2<f64>,
}

impl SampleSet {
    pub fn num_pix(&self) -> usize {
        self.counts.len()
    }
}

struct RaySamples {
    positions: Vec<[f64; 4]>,
    momenta: Vec<[f64; 4]>,
    lengths: Vec<f64>,
    radii: Vec<f64>,
}

// Midpoints of consecutive integrator states. Samples under the horizon sit
// at the far (source) end of the reversed trajectory; dropping that leading
// run clips the ray.
fn resample_ray(spacetime: &Spacetime, geodesics: &GeodesicSet, m: usize) -> RaySamples {
    let count = geodesics.counts[m] as usize;
    let mut out = RaySamples {
        positions: Vec::new(),
        momenta: Vec::new(),
        lengths: Vec::new(),
        radii: Vec::new(),
    };
    if count < 2 {
        return out;
    }

    let clip_radius = spacetime.horizon_radius();
    let mut clipping = true;
    for n in 0..count - 1 {
        let mut x = [0.0; 4];
        let mut k = [0.0; 4];
        for mu in 0..4 {
            x[mu] = 0.5 * (geodesics.positions[[m, n, mu]] + geodesics.positions[[m, n + 1, mu]]);
            k[mu] = 0.5 * (geodesics.momenta[[m, n, mu]] + geodesics.momenta[[m, n + 1, mu]]);
        }
        let r = spacetime.radial_coordinate(x[1], x[2], x[3]);
        if clipping && r < clip_radius {
            continue;
        }
        clipping = false;
        out.positions.push(x);
        out.momenta.push(k);
        out.lengths
            .push(geodesics.lambdas[[m, n + 1]] - geodesics.lambdas[[m, n]]);
        out.radii.push(r);
    }
    out
}

// Resample every ray of a level in parallel and pack the results
pub fn resample_set(
    spacetime: &Spacetime,
    geodesics: &GeodesicSet,
    pool: &rayon::ThreadPool,
) -> SampleSet {
    let num_pix = geodesics.num_pix();
    let rays: Vec<RaySamples> = pool.install(|| {
        (0..num_pix)
            .into_par_iter()
            .map(|m| resample_ray(spacetime, geodesics, m))
            .collect()
    });

    let num_steps = rays.iter().map(|r| r.lengths.len()).max().unwrap_or(0).max(1);
    let mut set = SampleSet {
        num_steps,
        counts: vec![0; num_pix],
        flags: geodesics.flags.clone(),
        positions: Array3::zeros((num_pix, num_steps, 4)),
        momenta: Array3::zeros((num_pix, num_steps, 4)),
        lengths: Array2::zeros((num_pix, num_steps)),
        radii: Array2::zeros((num_pix, num_steps)),
    };
    for (m, ray) in rays.iter().enumerate() {
        set.counts[m] = ray.lengths.len() as u32;
        for n in 0..ray.lengths.len() {
            for mu in 0..4 {
                set.positions[[m, n, mu]] = ray.positions[n][mu];
                set.momenta[[m, n, mu]] = ray.momenta[n][mu];
            }
            set.lengths[[m, n]] = ray.lengths[n];
            set.radii[[m, n]] = ray.radii[n];
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3 as A3;

    fn straight_line_set(count: usize) -> GeodesicSet {
        // Synthetic flat-space trajectory along +x at unit speed
        let mut positions = A3::zeros((1, count, 4));
        let mut momenta = A3::zeros((1, count, 4));
        let mut lambdas = Array2::zeros((1, count));
        for n in 0..count {
            let lam = n as f64;
            positions[[0, n, 0]] = lam;
            positions[[0, n, 1]] = -5.0 + lam;
            momenta[[0, n, 0]] = -1.0;
            momenta[[0, n, 1]] = 1.0;
            lambdas[[0, n]] = lam;
        }
        GeodesicSet {
            num_steps: count,
            counts: vec![count as u32],
            flags: vec![false],
            positions,
            momenta,
            lambdas,
        }
    }

    #[test]
    fn midpoints_interpolate_between_states() {
        let st = Spacetime::minkowski();
        let geo = straight_line_set(6);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let samples = resample_set(&st, &geo, &pool);
        assert_eq!(samples.counts[0], 5);
        for n in 0..5 {
            assert!((samples.positions[[0, n, 1]] - (-4.5 + n as f64)).abs() < 1e-14);
            assert!((samples.lengths[[0, n]] - 1.0).abs() < 1e-14);
            assert!((samples.momenta[[0, n, 1]] - 1.0).abs() < 1e-14);
        }
        // Sample count never exceeds the geodesic step count
        assert!(samples.counts[0] as usize <= geo.num_steps);
    }

    #[test]
    fn horizon_samples_are_clipped() {
        let st = Spacetime::new(1.0, 0.0).unwrap();
        // Trajectory climbing out from inside the horizon along +x
        let count = 8;
        let mut positions = A3::zeros((1, count, 4));
        let momenta = A3::zeros((1, count, 4));
        let mut lambdas = Array2::zeros((1, count));
        for n in 0..count {
            positions[[0, n, 1]] = 1.0 + n as f64;
            lambdas[[0, n]] = n as f64;
        }
        let geo = GeodesicSet {
            num_steps: count,
            counts: vec![count as u32],
            flags: vec![false],
            positions,
            momenta,
            lambdas,
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let samples = resample_set(&st, &geo, &pool);
        // Midpoints at r = 1.5 < 2 are dropped; the rest survive
        assert!(samples.counts[0] < 7);
        for n in 0..samples.counts[0] as usize {
            assert!(samples.radii[[0, n]] >= st.horizon_radius());
        }
    }
}
