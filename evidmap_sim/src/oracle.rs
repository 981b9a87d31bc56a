//! Ground truth scene for the mapping scenarios.
//!
//! The oracle knows where every surface really is and produces scans from
//! it:
//! - A static wall facing the sensor
//! - A box that slides sideways between the sensor and the wall
//! - Gaussian range noise on every beam endpoint
//!
//! Beams are parallel to +x and start on the `x = 0` plane, so ray casting
//! reduces to walking keys along x.

use evidmap_core::{KeyConverter, KeySet, OcTreeKey};
use nalgebra::Point3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::error::SimError;

/// Regular grid of `count`³ points starting at `origin`.
pub fn cube_points(origin: Point3<f64>, count: usize, spacing: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(count * count * count);
    for i in 0..count {
        for j in 0..count {
            for k in 0..count {
                points.push(Point3::new(
                    origin.x + i as f64 * spacing,
                    origin.y + j as f64 * spacing,
                    origin.z + k as f64 * spacing,
                ));
            }
        }
    }
    points
}

/// Axis-aligned box that moves in +y at a fixed cadence.
#[derive(Debug, Clone, Copy)]
pub struct MovingBox {
    /// Minimum corner at tick 0
    pub min: Point3<f64>,

    /// Maximum corner at tick 0 (exclusive)
    pub max: Point3<f64>,

    /// Distance moved per step
    pub step: f64,

    /// Ticks between steps
    pub ticks_per_step: u64,
}

impl MovingBox {
    /// Offset along y at `tick`.
    pub fn offset(&self, tick: u64) -> f64 {
        (tick / self.ticks_per_step) as f64 * self.step
    }

    /// True if a beam at (y, z) hits the box at `tick`.
    pub fn blocks(&self, y: f64, z: f64, tick: u64) -> bool {
        let dy = self.offset(tick);
        y >= self.min.y + dy && y < self.max.y + dy && z >= self.min.z && z < self.max.z
    }

    /// Front face plus half the depth, i.e. where a return lands.
    pub fn hit_x(&self) -> f64 {
        0.5 * (self.min.x + self.max.x)
    }

    /// True if `x` lies inside the slab swept by the box.
    pub fn in_slab(&self, x: f64) -> bool {
        x >= self.min.x && x < self.max.x
    }
}

/// One scan: keys traversed by beams and keys where beams ended.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub free: KeySet,
    pub occupied: KeySet,

    /// Beams whose return came from the moving box
    pub box_hits: usize,
}

/// The oracle - owns ground truth and generates noisy scans.
pub struct SceneOracle {
    rng: ChaCha8Rng,
    range_noise: Normal<f64>,

    /// Center of the wall's return (x)
    wall_x: f64,

    object: MovingBox,

    /// Beam grid: y and z coordinates of every beam origin
    beam_ys: Vec<f64>,
    beam_zs: Vec<f64>,

    tick: u64,
}

impl SceneOracle {
    /// Creates the default scene: wall at x = 2.05, a 0.3 m wide box at
    /// x ∈ [1.0, 1.1) moving 0.1 m in y every 3 ticks, 20 × 5 beams.
    ///
    /// # Arguments
    /// * `seed` - Seed for the range noise
    /// * `noise_std` - Range noise standard deviation (meters)
    pub fn new(seed: u64, noise_std: f64) -> Result<Self, SimError> {
        let range_noise =
            Normal::new(0.0, noise_std).map_err(|e| SimError::Noise(e.to_string()))?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            range_noise,
            wall_x: 2.05,
            object: MovingBox {
                min: Point3::new(1.0, 0.0, 0.0),
                max: Point3::new(1.1, 0.3, 0.5),
                step: 0.1,
                ticks_per_step: 3,
            },
            beam_ys: (0..20).map(|j| 0.05 + 0.1 * j as f64).collect(),
            beam_zs: (0..5).map(|k| 0.05 + 0.1 * k as f64).collect(),
            tick: 0,
        })
    }

    pub fn object(&self) -> &MovingBox {
        &self.object
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Advances the scene by one tick.
    pub fn step(&mut self) {
        self.tick += 1;
    }

    /// Casts every beam against the current scene.
    ///
    /// Cells from the beam origin up to (excluding) the endpoint cell are
    /// free; the endpoint cell is occupied.
    pub fn scan(&mut self, converter: &KeyConverter) -> Result<Scan, SimError> {
        let mut scan = Scan::default();
        for &y in &self.beam_ys {
            for &z in &self.beam_zs {
                let blocked = self.object.blocks(y, z, self.tick);
                let surface_x = if blocked {
                    scan.box_hits += 1;
                    self.object.hit_x()
                } else {
                    self.wall_x
                };
                let hit_x = surface_x + self.range_noise.sample(&mut self.rng);

                let start = converter.coord_to_key(&Point3::new(0.0, y, z))?;
                let end = converter.coord_to_key(&Point3::new(hit_x, y, z))?;
                for x in start.x()..end.x() {
                    scan.free.insert(OcTreeKey::new(x, end.y(), end.z()));
                }
                scan.occupied.insert(end);
            }
        }
        Ok(scan)
    }
}
