//! Core types and the simulation stepper for the particle-life universe.
//!
//! A universe holds a population of typed particles whose pairwise
//! attraction/repulsion is parameterized by a per-type-pair matrix. Each
//! tick accumulates forces from grid-local neighbors into velocities,
//! integrates positions, applies the boundary policy, and periodically
//! refreshes bucket membership in the subdivision grid.

use particle_life_index::{IndexError, SubdivisionGrid};
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::trace;

new_key_type! {
    /// Stable handle for particles backed by a generational slot map.
    ///
    /// Handles issued before a reseed do not resolve afterwards, so stale
    /// render proxies can detect that their particle is gone.
    pub struct ParticleId;
}

/// Maximum number of particle types in a universe.
pub const MAX_TYPES: u32 = 10;
/// Maximum population size.
pub const MAX_PARTICLES: u32 = 3_000;
/// Smoothing constant of the short-range force core.
pub const R_SMOOTH: f32 = 2.0;
/// Squared separation below which a pair is skipped entirely. This also
/// excludes near-coincident particles from the force pass, where the unit
/// displacement vector would be unstable.
pub const MIN_SEPARATION_SQ: f32 = 0.01;

/// Gaussian deviate via the polar Box-Muller method: sample the unit disk,
/// rejecting squared radii outside (0, 1), then transform.
#[must_use]
pub fn random_normal(rng: &mut dyn RngCore, mean: f32, sigma: f32) -> f32 {
    let mut u: f32;
    let mut s: f32;
    loop {
        u = rng.random_range(-1.0..1.0);
        let v: f32 = rng.random_range(-1.0..1.0);
        s = u * u + v * v;
        if s < 1.0 && s > 0.0 {
            break;
        }
    }
    let fac = (-2.0 * s.ln() / s).sqrt();
    u * fac * sigma + mean
}

/// Convert HSV (all channels in `[0, 1]`) to RGB.
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h * 6.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h * 6.0) as u32 % 6 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r + m, g + m, b + m]
}

/// Scalar radial force between two particles separated by `r`, using the
/// acting particle's `(min_r, max_r, attraction)` row.
///
/// Beyond `max_r` the force is zero. Between `min_r` and `max_r` it follows
/// the triangular profile `attraction * (1 - 2|r - (max_r -
/// min_r)/2| / (max_r - min_r))`; at or below `min_r` a smoothed short-range
/// core takes over. A degenerate `max_r == min_r` pair can never reach the
/// triangular branch, so the span is safe as a divisor.
#[must_use]
pub fn radial_force(r: f32, min_r: f32, max_r: f32, attraction: f32) -> f32 {
    if r > max_r {
        return 0.0;
    }
    if r > min_r {
        let numer = 2.0 * (r - 0.5 * (max_r - min_r)).abs();
        let denom = max_r - min_r;
        attraction * (1.0 - numer / denom)
    } else {
        R_SMOOTH * min_r * (1.0 / (min_r + R_SMOOTH) - 1.0 / (r + R_SMOOTH))
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position in simulation-space units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Per-step velocity in simulation-space units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Scalar fields for a single particle used when inserting or snapshotting
/// from the SoA store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ParticleData {
    /// Row of the type matrix governing this particle's interactions.
    /// Immutable for the particle's lifetime.
    pub type_index: usize,
    pub position: Position,
    pub velocity: Velocity,
    /// Cached grid bucket; derived from the position, not authoritative.
    pub bucket: usize,
}

/// Collection of per-particle columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ParticleColumns {
    types: Vec<usize>,
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    buckets: Vec<usize>,
}

impl ParticleColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            types: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            buckets: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.types.clear();
        self.positions.clear();
        self.velocities.clear();
        self.buckets.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, particle: ParticleData) {
        self.types.push(particle.type_index);
        self.positions.push(particle.position);
        self.velocities.push(particle.velocity);
        self.buckets.push(particle.bucket);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> ParticleData {
        ParticleData {
            type_index: self.types[index],
            position: self.positions[index],
            velocity: self.velocities[index],
            bucket: self.buckets[index],
        }
    }

    /// Immutable access to the type-index column.
    #[must_use]
    pub fn types(&self) -> &[usize] {
        &self.types
    }

    /// Mutable access to the type-index column.
    #[must_use]
    pub fn types_mut(&mut self) -> &mut [usize] {
        &mut self.types
    }

    /// Immutable access to the positions column.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions column.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to the velocities column.
    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    /// Mutable access to the velocities column.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    /// Immutable access to the cached bucket column.
    #[must_use]
    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Mutable access to the cached bucket column.
    #[must_use]
    pub fn buckets_mut(&mut self) -> &mut [usize] {
        &mut self.buckets
    }

    /// Simultaneous mutable access to positions and velocities for the
    /// integration pass.
    #[must_use]
    pub fn motion_mut(&mut self) -> (&mut [Position], &mut [Velocity]) {
        (&mut self.positions, &mut self.velocities)
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.types.len());
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.buckets.len());
    }
}

/// Dense SoA storage with generational handles for particle access.
///
/// Particles are never removed individually; the population is replaced as a
/// whole on reseed, which invalidates every previously issued handle.
#[derive(Debug)]
pub struct ParticleArena {
    slots: SlotMap<ParticleId, usize>,
    handles: Vec<ParticleId>,
    columns: ParticleColumns,
}

impl Default for ParticleArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticleArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: ParticleColumns::new(),
        }
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: ParticleColumns::with_capacity(capacity),
        }
    }

    /// Number of live particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no particles are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Insert a new particle and return its handle.
    pub fn insert(&mut self, particle: ParticleData) -> ParticleId {
        let index = self.columns.len();
        self.columns.push(particle);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Returns the dense index for `id`, if it is still live.
    #[must_use]
    pub fn index_of(&self, id: ParticleId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live particle.
    #[must_use]
    pub fn contains(&self, id: ParticleId) -> bool {
        self.slots.contains_key(id)
    }

    /// Handles of live particles in dense iteration order.
    #[must_use]
    pub fn handles(&self) -> &[ParticleId] {
        &self.handles
    }

    /// Iterate over live particle handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = ParticleId> + '_ {
        self.handles.iter().copied()
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: ParticleId) -> Option<ParticleData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &ParticleColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut ParticleColumns {
        &mut self.columns
    }

    /// Remove the whole population, invalidating every issued handle.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Per-type-pair interaction parameters plus a presentation color per type.
///
/// Backed by flat `size * size` vectors addressed `i * size + j`. Radii are
/// kept symmetric by the generator; attraction is allowed to differ per
/// ordered pair. Out-of-range indices are programming defects and fail
/// fast; both coordinates are checked so an oversized `j` cannot silently
/// alias into the next row of the flat layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypeMatrix {
    colors: Vec<[f32; 3]>,
    attract: Vec<f32>,
    min_r: Vec<f32>,
    max_r: Vec<f32>,
}

impl TypeMatrix {
    /// Create a zeroed matrix for `size` types.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            colors: vec![[0.0; 3]; size],
            attract: vec![0.0; size * size],
            min_r: vec![0.0; size * size],
            max_r: vec![0.0; size * size],
        }
    }

    /// Number of types.
    #[must_use]
    pub fn size(&self) -> usize {
        self.colors.len()
    }

    #[inline]
    fn offset(&self, i: usize, j: usize) -> usize {
        let size = self.size();
        assert!(
            i < size && j < size,
            "type pair ({i}, {j}) out of range for {size} types"
        );
        i * size + j
    }

    /// Presentation color of type `i`.
    #[must_use]
    pub fn color(&self, i: usize) -> [f32; 3] {
        self.colors[i]
    }

    /// Set the presentation color of type `i`.
    pub fn set_color(&mut self, i: usize, color: [f32; 3]) {
        self.colors[i] = color;
    }

    /// All type colors, indexed by type.
    #[must_use]
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    /// Signed attraction applied by a type-`i` particle toward type `j`.
    #[must_use]
    pub fn attraction(&self, i: usize, j: usize) -> f32 {
        self.attract[self.offset(i, j)]
    }

    /// Set the attraction for the ordered pair `(i, j)`.
    pub fn set_attraction(&mut self, i: usize, j: usize, value: f32) {
        let offset = self.offset(i, j);
        self.attract[offset] = value;
    }

    /// Repulsion-core radius for the pair `(i, j)`.
    #[must_use]
    pub fn min_r(&self, i: usize, j: usize) -> f32 {
        self.min_r[self.offset(i, j)]
    }

    /// Set the repulsion-core radius for the pair `(i, j)`.
    pub fn set_min_r(&mut self, i: usize, j: usize, value: f32) {
        let offset = self.offset(i, j);
        self.min_r[offset] = value;
    }

    /// Interaction cutoff radius for the pair `(i, j)`.
    #[must_use]
    pub fn max_r(&self, i: usize, j: usize) -> f32 {
        self.max_r[self.offset(i, j)]
    }

    /// Set the interaction cutoff radius for the pair `(i, j)`.
    pub fn set_max_r(&mut self, i: usize, j: usize, value: f32) {
        let offset = self.offset(i, j);
        self.max_r[offset] = value;
    }
}

/// Errors that can occur when constructing or reseeding a universe.
#[derive(Debug, Error)]
pub enum UniverseError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Subdivision grid rejected its configuration.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Static configuration for a particle-life universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Number of particle types, 1 to 10.
    pub number_of_types: u32,
    /// Population size, 1 to 3000.
    pub number_of_particles: u32,
    /// Particle radius in simulation units; drives the interaction
    /// `diameter = 2 * radius` floor.
    pub radius: f32,
    /// Width of the simulation plane in simulation units.
    pub width: f32,
    /// Height of the simulation plane in simulation units.
    pub height: f32,
    /// Grid subdivisions along the x axis, 1 to 16.
    pub subdivisions_x: u32,
    /// Grid subdivisions along the y axis, 1 to 16.
    pub subdivisions_y: u32,
    /// Seconds between bucket-membership refreshes.
    pub div_update_delay: f32,
    /// Toroidal boundary when true, reflective when false.
    pub wrap: bool,
    /// Optional RNG seed for reproducible universes.
    pub rng_seed: Option<u64>,
    /// Maximum number of tick summaries retained in memory; 0 disables the
    /// history.
    pub history_capacity: usize,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            number_of_types: 3,
            number_of_particles: 1_000,
            radius: 5.0,
            width: 1_920.0,
            height: 1_080.0,
            subdivisions_x: 12,
            subdivisions_y: 12,
            div_update_delay: 1.0,
            wrap: true,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl UniverseConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), UniverseError> {
        if !(1..=MAX_TYPES).contains(&self.number_of_types) {
            return Err(UniverseError::InvalidConfig(
                "number_of_types must be between 1 and 10",
            ));
        }
        if !(1..=MAX_PARTICLES).contains(&self.number_of_particles) {
            return Err(UniverseError::InvalidConfig(
                "number_of_particles must be between 1 and 3000",
            ));
        }
        if !(self.radius > 0.0 && self.radius.is_finite()) {
            return Err(UniverseError::InvalidConfig(
                "radius must be positive and finite",
            ));
        }
        if !(self.width > 0.0 && self.width.is_finite())
            || !(self.height > 0.0 && self.height.is_finite())
        {
            return Err(UniverseError::InvalidConfig(
                "plane dimensions must be positive and finite",
            ));
        }
        if !(self.div_update_delay > 0.0 && self.div_update_delay.is_finite()) {
            return Err(UniverseError::InvalidConfig(
                "div_update_delay must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Interaction diameter derived from the particle radius.
    #[must_use]
    pub fn diameter(&self) -> f32 {
        self.radius * 2.0
    }
}

/// Interaction parameters sampled into the type matrix on reseed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeedParams {
    /// Mean of the Gaussian attraction distribution.
    pub attract_mean: f32,
    /// Standard deviation of the Gaussian attraction distribution.
    pub attract_std: f32,
    /// Lower bound of the uniform repulsion-core radius range.
    pub min_r_lower: f32,
    /// Upper bound of the uniform repulsion-core radius range.
    pub min_r_upper: f32,
    /// Lower bound of the uniform cutoff radius range.
    pub max_r_lower: f32,
    /// Upper bound of the uniform cutoff radius range.
    pub max_r_upper: f32,
    /// Per-step velocity damping factor, in `[0, 1)`.
    pub friction: f32,
}

impl Default for SeedParams {
    fn default() -> Self {
        Self {
            attract_mean: -0.02,
            attract_std: 0.06,
            min_r_lower: 0.0,
            min_r_upper: 20.0,
            max_r_lower: 20.0,
            max_r_upper: 70.0,
            friction: 0.05,
        }
    }
}

impl SeedParams {
    /// Validates the seed parameters.
    fn validate(&self) -> Result<(), UniverseError> {
        if !(0.0..1.0).contains(&self.friction) {
            return Err(UniverseError::InvalidConfig(
                "friction must be in [0, 1)",
            ));
        }
        if self.min_r_lower > self.min_r_upper || self.max_r_lower > self.max_r_upper {
            return Err(UniverseError::InvalidConfig(
                "radius ranges must have lower <= upper",
            ));
        }
        Ok(())
    }
}

/// Seed-time payload handed to the presentation layer: one render proxy per
/// handle, colored by `palette[types[i]]`.
#[derive(Debug)]
pub struct SeedFrame<'a> {
    pub particles: &'a [ParticleId],
    pub types: &'a [usize],
    pub palette: &'a [[f32; 3]],
}

/// Per-tick payload handed to the presentation layer.
#[derive(Debug)]
pub struct RenderFrame<'a> {
    pub tick: Tick,
    pub positions: &'a [Position],
    pub types: &'a [usize],
    pub palette: &'a [[f32; 3]],
}

/// Presentation collaborator notified of pool lifecycle and per-tick state.
/// Receives positions and colors; emits nothing back into the simulation.
pub trait PresentationSink: Send {
    /// The population was (re)seeded; create one drawable proxy per handle.
    fn on_seed(&mut self, frame: &SeedFrame<'_>);

    /// A tick completed; positions are current.
    fn on_frame(&mut self, frame: &RenderFrame<'_>);

    /// The population is gone; destroy all proxies.
    fn on_clear(&mut self);
}

/// No-op presentation sink.
#[derive(Debug, Default)]
pub struct NullPresentation;

impl PresentationSink for NullPresentation {
    fn on_seed(&mut self, _frame: &SeedFrame<'_>) {}

    fn on_frame(&mut self, _frame: &RenderFrame<'_>) {}

    fn on_clear(&mut self) {}
}

/// Events emitted after processing a universe tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    /// Whether this tick's refresh gate fired and bucket membership was
    /// brought up to date.
    pub buckets_refreshed: bool,
}

/// Summary of a processed tick retained in the in-memory history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub particle_count: usize,
    /// Pair interactions that passed the cutoff and degeneracy guards.
    pub interactions: usize,
    /// Particles moved between buckets by this tick's refresh (0 when the
    /// gate did not fire).
    pub bucket_moves: usize,
    pub average_speed: f32,
}

/// A particle-life universe: typed population, interaction matrix,
/// subdivision grid, and the per-tick stepper.
pub struct Universe {
    config: UniverseConfig,
    seed_params: SeedParams,
    tick: Tick,
    rng: SmallRng,
    types: TypeMatrix,
    particles: ParticleArena,
    grid: SubdivisionGrid,
    diameter: f32,
    refresh_elapsed: f32,
    velocity_scratch: Vec<Velocity>,
    presentation: Box<dyn PresentationSink>,
    history: VecDeque<TickSummary>,
    last_interactions: usize,
    last_bucket_moves: usize,
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("particle_count", &self.particles.len())
            .finish()
    }
}

impl Universe {
    /// Instantiate an empty universe using the supplied configuration.
    pub fn new(config: UniverseConfig) -> Result<Self, UniverseError> {
        Self::with_presentation(config, Box::new(NullPresentation))
    }

    /// Instantiate an empty universe with a presentation sink attached.
    ///
    /// The universe has no particles until [`Universe::reseed`] is called.
    pub fn with_presentation(
        config: UniverseConfig,
        presentation: Box<dyn PresentationSink>,
    ) -> Result<Self, UniverseError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let grid = SubdivisionGrid::new(
            config.subdivisions_x,
            config.subdivisions_y,
            config.width,
            config.height,
        )?;
        let diameter = config.diameter();
        let types = TypeMatrix::new(config.number_of_types as usize);
        let capacity = config.number_of_particles as usize;
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            seed_params: SeedParams::default(),
            tick: Tick::zero(),
            rng,
            types,
            particles: ParticleArena::with_capacity(capacity),
            grid,
            diameter,
            refresh_elapsed: 0.0,
            velocity_scratch: Vec::with_capacity(capacity),
            presentation,
            history: VecDeque::with_capacity(history_capacity),
            last_interactions: 0,
            last_bucket_moves: 0,
        })
    }

    /// Regenerate the type matrix and respawn the entire population,
    /// discarding all prior particle state and bucket membership. The only
    /// way to change interaction parameters after construction.
    pub fn reseed(&mut self, params: SeedParams) -> Result<(), UniverseError> {
        params.validate()?;
        self.seed_params = params;
        self.seed_types();
        self.seed_particles();
        Ok(())
    }

    /// Tear down the population and notify the presentation sink, leaving
    /// the universe reusable via [`Universe::reseed`].
    pub fn despawn(&mut self) {
        self.presentation.on_clear();
        self.particles.clear();
        self.grid.reset(0);
    }

    fn seed_types(&mut self) {
        let size = self.types.size();
        let params = self.seed_params;
        for i in 0..size {
            let value = (i % 2) as f32 * 0.5 + 0.5;
            self.types
                .set_color(i, hsv_to_rgb(i as f32 / size as f32, 1.0, value));
            for j in 0..size {
                if i == j {
                    let attraction =
                        -random_normal(&mut self.rng, params.attract_mean, params.attract_std)
                            .abs();
                    self.types.set_attraction(i, j, attraction);
                    self.types.set_min_r(i, j, self.diameter);
                } else {
                    let attraction =
                        random_normal(&mut self.rng, params.attract_mean, params.attract_std);
                    self.types.set_attraction(i, j, attraction);
                    let min_r = self
                        .rng
                        .random_range(params.min_r_lower..=params.min_r_upper)
                        .max(self.diameter);
                    self.types.set_min_r(i, j, min_r);
                }
                let max_r = self
                    .rng
                    .random_range(params.max_r_lower..=params.max_r_upper)
                    .max(self.types.min_r(i, j));
                self.types.set_max_r(i, j, max_r);
                // Radius symmetry is enforced after each ordered visit; the
                // mirror visit later overwrites both entries again, so the
                // final radii come from the last visit of the pair.
                self.types.set_max_r(j, i, self.types.max_r(i, j));
                self.types.set_min_r(j, i, self.types.min_r(i, j));
            }
        }
    }

    fn seed_particles(&mut self) {
        self.presentation.on_clear();
        self.particles.clear();
        let count = self.config.number_of_particles as usize;
        self.grid.reset(count);
        let size = self.types.size();
        for _ in 0..count {
            let type_index = self.rng.random_range(0..size);
            let position = Position::new(
                self.rng.random::<f32>() * self.config.width,
                self.rng.random::<f32>() * self.config.height,
            );
            let velocity = Velocity::new(
                random_normal(&mut self.rng, 0.0, 1.0) * 0.2,
                random_normal(&mut self.rng, 0.0, 1.0) * 0.2,
            );
            self.particles.insert(ParticleData {
                type_index,
                position,
                velocity,
                bucket: 0,
            });
        }
        // Everything spawns in bucket 0; assign real buckets before the
        // first force pass.
        self.refresh_buckets();
        self.refresh_elapsed = 0.0;
        let columns = self.particles.columns();
        let frame = SeedFrame {
            particles: self.particles.handles(),
            types: columns.types(),
            palette: self.types.colors(),
        };
        self.presentation.on_seed(&frame);
    }

    /// Execute one simulation tick: accumulate forces from grid-local
    /// neighbors, integrate motion, apply the boundary policy, and run the
    /// time-gated bucket refresh.
    pub fn step(&mut self, dt: f32) -> TickEvents {
        self.stage_forces();
        self.stage_integrate();
        let buckets_refreshed = self.stage_refresh(dt);
        self.tick = self.tick.next();
        self.stage_summary();
        self.stage_present();
        TickEvents {
            tick: self.tick,
            buckets_refreshed,
        }
    }

    /// Force accumulation. Reads positions and the type matrix only;
    /// velocity updates are staged in a scratch buffer and committed after
    /// the full pass so a mid-pass fault cannot leave partial state.
    fn stage_forces(&mut self) {
        let count = self.particles.len();
        let columns = self.particles.columns();
        self.velocity_scratch.clear();
        self.velocity_scratch.extend_from_slice(columns.velocities());

        let positions = columns.positions();
        let types = columns.types();
        let buckets = columns.buckets();
        let mut interactions = 0usize;

        for i in 0..count {
            let position = positions[i];
            let type_row = types[i];
            let mut vx = self.velocity_scratch[i].vx;
            let mut vy = self.velocity_scratch[i].vy;
            for &bucket in self.grid.neighbors_of(buckets[i]).as_slice() {
                for &other in self.grid.bucket(bucket) {
                    let j = other as usize;
                    if j == i {
                        continue;
                    }
                    let mut dx = positions[j].x - position.x;
                    let mut dy = positions[j].y - position.y;
                    let r2 = dx * dx + dy * dy;
                    let min_r = self.types.min_r(type_row, types[j]);
                    let max_r = self.types.max_r(type_row, types[j]);
                    if r2 > max_r * max_r || r2 < MIN_SEPARATION_SQ {
                        continue;
                    }
                    let r = r2.sqrt();
                    dx /= r;
                    dy /= r;
                    let f = radial_force(
                        r,
                        min_r,
                        max_r,
                        self.types.attraction(type_row, types[j]),
                    );
                    vx += f * dx;
                    vy += f * dy;
                    interactions += 1;
                }
            }
            self.velocity_scratch[i] = Velocity::new(vx, vy);
        }

        self.particles
            .columns_mut()
            .velocities_mut()
            .copy_from_slice(&self.velocity_scratch);
        self.last_interactions = interactions;
    }

    /// Position integration, velocity damping, and the boundary policy.
    fn stage_integrate(&mut self) {
        let width = self.config.width;
        let height = self.config.height;
        let wrap = self.config.wrap;
        let diameter = self.diameter;
        let damping = 1.0 - self.seed_params.friction;
        let (positions, velocities) = self.particles.columns_mut().motion_mut();
        for (position, velocity) in positions.iter_mut().zip(velocities.iter_mut()) {
            position.x += velocity.vx;
            position.y += velocity.vy;
            velocity.vx *= damping;
            velocity.vy *= damping;

            if wrap {
                if position.x < 0.0 {
                    position.x += width;
                } else if position.x >= width {
                    position.x -= width;
                }
                if position.y < 0.0 {
                    position.y += height;
                } else if position.y >= height {
                    position.y -= height;
                }
            } else {
                if position.x <= diameter {
                    velocity.vx = -velocity.vx;
                    position.x = diameter;
                } else if position.x >= width - diameter {
                    velocity.vx = -velocity.vx;
                    position.x = width - diameter;
                }
                if position.y <= diameter {
                    velocity.vy = -velocity.vy;
                    position.y = diameter;
                } else if position.y >= height - diameter {
                    velocity.vy = -velocity.vy;
                    position.y = height - diameter;
                }
            }
        }
    }

    /// Time-gated bucket refresh. Membership is deliberately allowed to go
    /// stale for up to one `div_update_delay` interval.
    fn stage_refresh(&mut self, dt: f32) -> bool {
        self.refresh_elapsed += dt;
        if self.refresh_elapsed < self.config.div_update_delay {
            self.last_bucket_moves = 0;
            return false;
        }
        self.refresh_elapsed = 0.0;
        self.refresh_buckets();
        true
    }

    /// Reassign every particle whose position now maps to a different
    /// bucket. Runs synchronously; never interleaves with force
    /// accumulation.
    pub fn refresh_buckets(&mut self) {
        let count = self.particles.len();
        let mut moves = 0usize;
        for i in 0..count {
            let position = self.particles.columns().positions()[i];
            let new_bucket = self.grid.bucket_for(position.x, position.y);
            let old_bucket = self.particles.columns().buckets()[i];
            if new_bucket != old_bucket {
                self.grid.reassign(i as u32, new_bucket);
                self.particles.columns_mut().buckets_mut()[i] = new_bucket;
                moves += 1;
            }
        }
        self.last_bucket_moves = moves;
    }

    fn stage_summary(&mut self) {
        let count = self.particles.len();
        let mut speed_total = 0.0f32;
        for velocity in self.particles.columns().velocities() {
            speed_total += (velocity.vx * velocity.vx + velocity.vy * velocity.vy).sqrt();
        }
        let average_speed = if count > 0 {
            speed_total / count as f32
        } else {
            0.0
        };
        let summary = TickSummary {
            tick: self.tick,
            particle_count: count,
            interactions: self.last_interactions,
            bucket_moves: self.last_bucket_moves,
            average_speed,
        };
        trace!(
            tick = summary.tick.0,
            interactions = summary.interactions,
            bucket_moves = summary.bucket_moves,
            average_speed = summary.average_speed,
            "tick complete"
        );
        if self.config.history_capacity > 0 {
            if self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(summary);
        }
    }

    fn stage_present(&mut self) {
        let columns = self.particles.columns();
        let frame = RenderFrame {
            tick: self.tick,
            positions: columns.positions(),
            types: columns.types(),
            palette: self.types.colors(),
        };
        self.presentation.on_frame(&frame);
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    /// Interaction parameters applied at the last reseed.
    #[must_use]
    pub fn seed_params(&self) -> &SeedParams {
        &self.seed_params
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Interaction diameter derived from the configured radius.
    #[must_use]
    pub const fn diameter(&self) -> f32 {
        self.diameter
    }

    /// Number of live particles.
    #[must_use]
    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    /// Read-only access to the particle arena.
    #[must_use]
    pub fn particles(&self) -> &ParticleArena {
        &self.particles
    }

    /// Mutable access to the particle arena. Callers that move particles
    /// must call [`Universe::refresh_buckets`] before the next step so grid
    /// membership matches positions again.
    #[must_use]
    pub fn particles_mut(&mut self) -> &mut ParticleArena {
        &mut self.particles
    }

    /// Read-only access to the type matrix.
    #[must_use]
    pub fn types(&self) -> &TypeMatrix {
        &self.types
    }

    /// Mutable access to the type matrix. The stepper never writes to it;
    /// edits take effect on the next tick.
    #[must_use]
    pub fn types_mut(&mut self) -> &mut TypeMatrix {
        &mut self.types
    }

    /// Read-only access to the subdivision grid.
    #[must_use]
    pub fn grid(&self) -> &SubdivisionGrid {
        &self.grid
    }

    /// Replace the presentation sink.
    pub fn set_presentation(&mut self, presentation: Box<dyn PresentationSink>) {
        self.presentation = presentation;
    }

    /// Borrow the universe RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }
}
