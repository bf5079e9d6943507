//! CLI shell around the Meadow engine: builds a world from flags, steps it,
//! and reports population counts through the read-only snapshot surface.

use anyhow::Result;
use clap::Parser;
use meadow_core::{MeadowConfig, Species, World};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meadow", version, about = "Prey/predator/flower ecosystem simulation")]
struct Cli {
    /// Grid width in cells.
    #[arg(long, default_value_t = 20)]
    width: u32,

    /// Grid height in cells.
    #[arg(long, default_value_t = 20)]
    height: u32,

    /// Initial prey population.
    #[arg(long, default_value_t = 50)]
    prey: u32,

    /// Initial predator population.
    #[arg(long, default_value_t = 10)]
    predators: u32,

    /// Initial flower population.
    #[arg(long, default_value_t = 20)]
    flowers: u32,

    /// Number of ticks to simulate.
    #[arg(long, default_value_t = 100)]
    ticks: u64,

    /// RNG seed; omit for an entropy seed (reported at startup).
    #[arg(long)]
    seed: Option<u64>,

    /// Log population counts every N ticks.
    #[arg(long, default_value_t = 10)]
    report_interval: u64,

    /// Print an ASCII view of the final grid.
    #[arg(long, default_value_t = false)]
    render: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = MeadowConfig {
        width: cli.width,
        height: cli.height,
        prey_count: cli.prey,
        predator_count: cli.predators,
        flower_count: cli.flowers,
        rng_seed: cli.seed,
        ..MeadowConfig::default()
    };
    let mut world = World::new(config)?;
    if world.population_cap_violated() {
        warn!(
            cells = world.grid().cell_count(),
            requested = world.config().initial_population(),
            "initial population exceeds grid capacity; nothing to simulate"
        );
        return Ok(());
    }
    info!(seed = world.seed(), "world initialized");

    let report_interval = cli.report_interval.max(1);
    for _ in 0..cli.ticks {
        if !world.is_running() {
            info!(tick = world.tick_count(), "population extinct, stopping early");
            break;
        }
        world.step();
        if world.tick_count() % report_interval == 0 {
            let snapshot = world.population_snapshot();
            info!(
                tick = world.tick_count(),
                prey = snapshot.prey,
                predators = snapshot.predators,
                flowers = snapshot.flowers,
                "population"
            );
        }
    }

    let snapshot = world.population_snapshot();
    println!("tick {}: {snapshot}", world.tick_count());
    if cli.render {
        print!("{}", render_grid(&world));
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// ASCII rendering of the grid through the read-only cell iterator. Cells
/// with several occupants show the count; otherwise a species glyph.
fn render_grid(world: &World) -> String {
    let width = world.config().width as usize;
    let mut out = String::with_capacity(world.grid().cell_count() + width);
    for (cell, occupants) in world.cells() {
        let glyph = match occupants.as_slice() {
            [] => '.',
            [single] => match single.species {
                Species::Prey => 'p',
                Species::Predator => 'P',
                Species::Flower => '*',
            },
            many => char::from_digit((many.len() as u32).min(9), 10).unwrap_or('#'),
        };
        out.push(glyph);
        if cell.x as usize == width - 1 {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use meadow_core::Cell;

    #[test]
    fn render_marks_species_and_crowds() {
        let config = MeadowConfig {
            width: 3,
            height: 3,
            prey_count: 0,
            predator_count: 0,
            flower_count: 0,
            rng_seed: Some(1),
            ..MeadowConfig::default()
        };
        let mut world = World::new(config).expect("world");
        world.spawn_agent_at(Species::Prey, 100, Cell::new(0, 0));
        world.spawn_agent_at(Species::Predator, 100, Cell::new(1, 0));
        world.spawn_agent_at(Species::Flower, 100, Cell::new(2, 0));
        world.spawn_agent_at(Species::Flower, 100, Cell::new(2, 0));

        let rendered = render_grid(&world);
        assert_eq!(rendered, "pP2\n...\n...\n");
    }
}
