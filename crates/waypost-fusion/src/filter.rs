//! Clamped particle filter with a constant-velocity motion model.
//!
//! Each particle carries `[x, y, vx, vy]`. A round perturbs velocity with
//! gaussian process noise, advances position, clamps to the map rectangle,
//! weights particles against the trilaterated observation, estimates by
//! weighted mean, and resamples systematically.
//!
//! The innovation cap bounds how far an observation can pull the weight of
//! any particle, so a single wild trilateration result cannot collapse the
//! cloud onto an outlier.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

/// Rectangle the particles are confined to: `[x_min, x_max, y_min, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Minimum x in metres.
    pub x_min: f64,
    /// Maximum x in metres.
    pub x_max: f64,
    /// Minimum y in metres.
    pub y_min: f64,
    /// Maximum y in metres.
    pub y_max: f64,
}

impl Limits {
    /// Build from the map-config array form `[x_min, x_max, y_min, y_max]`.
    #[must_use]
    pub fn from_array(limits: [f64; 4]) -> Self {
        Self { x_min: limits[0], x_max: limits[1], y_min: limits[2], y_max: limits[3] }
    }

    fn clamp(&self, point: [f64; 2]) -> [f64; 2] {
        [point[0].clamp(self.x_min, self.x_max), point[1].clamp(self.y_min, self.y_max)]
    }
}

/// Tuning parameters for one filter instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// Particle count.
    pub particles: usize,
    /// Standard deviation of the per-round velocity perturbation.
    pub process_std_dev: f64,
    /// Scale applied to the squared innovation when weighting.
    pub observation_scale: f64,
    /// Cap on the innovation distance in metres.
    pub innovation_cap: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self { particles: 200, process_std_dev: 0.5, observation_scale: 0.01, innovation_cap: 5.0 }
    }
}

/// A particle filter whose particles never leave the map rectangle.
pub struct ClampedParticleFilter {
    limits: Limits,
    params: FilterParams,
    particles: Vec<[f64; 4]>,
    weights: Vec<f64>,
    rng: StdRng,
}

impl ClampedParticleFilter {
    /// Create a filter with particles spread uniformly over the rectangle.
    #[must_use]
    pub fn new(limits: Limits, params: FilterParams) -> Self {
        Self::with_rng(limits, params, StdRng::from_entropy())
    }

    /// Create a filter with a caller-provided RNG (deterministic tests).
    #[must_use]
    pub fn with_rng(limits: Limits, params: FilterParams, mut rng: StdRng) -> Self {
        let particles = (0..params.particles)
            .map(|_| {
                [
                    rng.gen_range(limits.x_min..=limits.x_max),
                    rng.gen_range(limits.y_min..=limits.y_max),
                    0.0,
                    0.0,
                ]
            })
            .collect();
        let weights = vec![1.0 / params.particles as f64; params.particles];
        Self { limits, params, particles, weights, rng }
    }

    /// Run one filter round against a trilaterated observation.
    ///
    /// Returns the smoothed 2-D estimate, always inside the rectangle.
    pub fn update(&mut self, observation: [f64; 2]) -> [f64; 2] {
        let observation = self.limits.clamp(observation);

        self.propagate();
        self.weigh(observation);
        let estimate = self.estimate();
        self.resample();
        estimate
    }

    fn propagate(&mut self) {
        for particle in &mut self.particles {
            let dv_x: f64 = self.rng.sample(StandardNormal);
            let dv_y: f64 = self.rng.sample(StandardNormal);
            particle[2] += dv_x * self.params.process_std_dev;
            particle[3] += dv_y * self.params.process_std_dev;
            particle[0] += particle[2];
            particle[1] += particle[3];

            let clamped = self.limits.clamp([particle[0], particle[1]]);
            if clamped != [particle[0], particle[1]] {
                // Hitting the wall kills the velocity component that drove
                // the particle out, otherwise the cloud piles up on edges
                if clamped[0] != particle[0] {
                    particle[2] = 0.0;
                }
                if clamped[1] != particle[1] {
                    particle[3] = 0.0;
                }
                particle[0] = clamped[0];
                particle[1] = clamped[1];
            }
        }
    }

    fn weigh(&mut self, observation: [f64; 2]) {
        let mut total = 0.0;
        for (particle, weight) in self.particles.iter().zip(&mut self.weights) {
            let dx = particle[0] - observation[0];
            let dy = particle[1] - observation[1];
            let innovation = (dx * dx + dy * dy).sqrt().min(self.params.innovation_cap);
            *weight = (-innovation * innovation * self.params.observation_scale).exp();
            total += *weight;
        }
        if total <= f64::MIN_POSITIVE {
            // Every particle capped out; fall back to uniform weights
            let uniform = 1.0 / self.weights.len() as f64;
            self.weights.fill(uniform);
        } else {
            for weight in &mut self.weights {
                *weight /= total;
            }
        }
    }

    fn estimate(&self) -> [f64; 2] {
        let mut x = 0.0;
        let mut y = 0.0;
        for (particle, weight) in self.particles.iter().zip(&self.weights) {
            x += particle[0] * weight;
            y += particle[1] * weight;
        }
        self.limits.clamp([x, y])
    }

    /// Systematic resampling: one uniform offset, evenly spaced pointers.
    fn resample(&mut self) {
        let n = self.particles.len();
        let step = 1.0 / n as f64;
        let mut pointer = self.rng.gen_range(0.0..step);
        let mut cumulative = self.weights[0];
        let mut index = 0usize;

        let mut resampled = Vec::with_capacity(n);
        for _ in 0..n {
            while pointer > cumulative && index < n - 1 {
                index += 1;
                cumulative += self.weights[index];
            }
            resampled.push(self.particles[index]);
            pointer += step;
        }
        self.particles = resampled;
        self.weights.fill(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::from_array([0.0, 10.0, 0.0, 10.0])
    }

    fn seeded(seed: u64) -> ClampedParticleFilter {
        ClampedParticleFilter::with_rng(limits(), FilterParams::default(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn estimates_stay_inside_limits() {
        let mut filter = seeded(7);
        for _ in 0..50 {
            // Observation far outside the rectangle
            let [x, y] = filter.update([100.0, -100.0]);
            assert!((0.0..=10.0).contains(&x));
            assert!((0.0..=10.0).contains(&y));
        }
    }

    #[test]
    fn converges_toward_a_steady_observation() {
        // Sharper weighting than the production defaults so convergence is
        // quick enough to assert tightly on
        let params = FilterParams {
            observation_scale: 1.0,
            innovation_cap: 20.0,
            ..FilterParams::default()
        };
        let mut filter =
            ClampedParticleFilter::with_rng(limits(), params, StdRng::seed_from_u64(42));
        let mut estimate = [0.0, 0.0];
        for _ in 0..40 {
            estimate = filter.update([8.0, 2.0]);
        }
        let dx = estimate[0] - 8.0;
        let dy = estimate[1] - 2.0;
        assert!(
            (dx * dx + dy * dy).sqrt() < 2.0,
            "estimate {estimate:?} did not move toward the observation"
        );
    }

    #[test]
    fn tracks_a_moving_observation() {
        let mut filter = seeded(3);
        let mut last = filter.update([1.0, 1.0]);
        for step in 1..30 {
            let target = [1.0 + 0.25 * f64::from(step), 1.0];
            last = filter.update(target);
        }
        assert!(last[0] > 2.0, "filter never followed the track: {last:?}");
    }

    #[test]
    fn seeded_filters_are_deterministic() {
        let mut a = seeded(11);
        let mut b = seeded(11);
        for _ in 0..10 {
            assert_eq!(a.update([4.0, 4.0]), b.update([4.0, 4.0]));
        }
    }
}
