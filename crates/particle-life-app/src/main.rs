use anyhow::Result;
use particle_life_core::{
    PresentationSink, RenderFrame, SeedFrame, SeedParams, Universe, UniverseConfig,
};
use tracing::{info, trace, warn};

/// Fixed timestep fed into the universe each loop iteration, in seconds.
const FIXED_DT: f32 = 0.02;

/// Ticks driven by the headless shell before reporting.
const TICKS: u32 = 600;

fn main() -> Result<()> {
    init_tracing();
    let config = UniverseConfig {
        rng_seed: Some(0x5EED_CAFE_u64),
        ..UniverseConfig::default()
    };
    let mut universe = Universe::with_presentation(config, Box::new(FrameStats::default()))?;
    universe.reseed(SeedParams::default())?;
    info!(
        particles = universe.particle_count(),
        types = universe.types().size(),
        "universe seeded"
    );

    for _ in 0..TICKS {
        universe.step(FIXED_DT);
    }

    if let Some(summary) = universe.history().last() {
        info!(
            tick = summary.tick.0,
            particles = summary.particle_count,
            interactions = summary.interactions,
            bucket_moves = summary.bucket_moves,
            average_speed = summary.average_speed,
            "run complete",
        );
    } else {
        warn!("run completed without tick summaries");
    }

    universe.despawn();
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Presentation sink that tracks proxy and frame traffic instead of drawing.
#[derive(Debug, Default)]
struct FrameStats {
    proxies: usize,
    frames: u64,
}

impl PresentationSink for FrameStats {
    fn on_seed(&mut self, frame: &SeedFrame<'_>) {
        self.proxies = frame.particles.len();
        info!(proxies = self.proxies, "spawned render proxies");
    }

    fn on_frame(&mut self, frame: &RenderFrame<'_>) {
        self.frames += 1;
        trace!(
            tick = frame.tick.0,
            particles = frame.positions.len(),
            "frame"
        );
    }

    fn on_clear(&mut self) {
        if self.proxies > 0 {
            info!(
                proxies = self.proxies,
                frames = self.frames,
                "despawned render proxies"
            );
        }
        self.proxies = 0;
    }
}
