use meadow_core::{MeadowConfig, PopulationSnapshot, Species, Tick, World};

fn scenario_10x10() -> MeadowConfig {
    MeadowConfig {
        width: 10,
        height: 10,
        prey_count: 10,
        predator_count: 1,
        flower_count: 0,
        rng_seed: Some(0xDEAD_BEEF),
        ..MeadowConfig::default()
    }
}

#[test]
fn seeded_worlds_advance_in_lockstep() {
    let mut world_a = World::new(scenario_10x10()).expect("world_a");
    let mut world_b = World::new(scenario_10x10()).expect("world_b");

    let mut trajectory_a = Vec::new();
    let mut trajectory_b = Vec::new();
    for _ in 0..100 {
        world_a.step();
        world_b.step();
        trajectory_a.push(world_a.population_snapshot());
        trajectory_b.push(world_b.population_snapshot());
    }

    assert_eq!(trajectory_a, trajectory_b);
    assert_eq!(world_a.tick(), world_b.tick());
    let history_a: Vec<_> = world_a.history().copied().collect();
    let history_b: Vec<_> = world_b.history().copied().collect();
    assert_eq!(history_a, history_b);
}

#[test]
fn hundred_tick_scenario_terminates_cleanly() {
    let mut world = World::new(scenario_10x10()).expect("world");
    assert_eq!(world.population_snapshot().prey, 10);
    assert_eq!(world.population_snapshot().predators, 1);

    for _ in 0..100 {
        world.step();
        world.check_consistency().expect("grid and registry agree");
    }

    if world.is_running() {
        assert_eq!(world.tick(), Tick(100));
    } else {
        // Extinction froze the clock; further steps must change nothing.
        let frozen_tick = world.tick();
        let frozen = world.population_snapshot();
        world.step();
        assert_eq!(world.tick(), frozen_tick);
        assert_eq!(world.population_snapshot(), frozen);
    }
    let snapshot = world.population_snapshot();
    assert_eq!(
        snapshot.total(),
        snapshot.count(Species::Prey)
            + snapshot.count(Species::Predator)
            + snapshot.count(Species::Flower)
    );
}

#[test]
fn overfull_configuration_is_flagged_not_fatal() {
    let config = MeadowConfig {
        width: 10,
        height: 10,
        prey_count: 100,
        predator_count: 100,
        flower_count: 100,
        rng_seed: Some(1),
        ..MeadowConfig::default()
    };
    let world = World::new(config).expect("constructible");
    assert!(world.population_cap_violated());
    assert_eq!(world.population_snapshot(), PopulationSnapshot::default());
    assert_eq!(world.cells().map(|(_, occupants)| occupants.len()).sum::<usize>(), 0);
}

#[test]
fn render_iterator_matches_registry() {
    let config = MeadowConfig {
        rng_seed: Some(42),
        ..MeadowConfig::default()
    };
    let mut world = World::new(config).expect("world");
    for _ in 0..25 {
        world.step();
    }

    let mut rendered = 0usize;
    let mut cells_seen = 0usize;
    for (cell, occupants) in world.cells() {
        assert!(cell.x < world.config().width && cell.y < world.config().height);
        for occupant in &occupants {
            let agent = world.agent(occupant.id).expect("occupant registered");
            assert_eq!(agent.species, occupant.species);
            assert_eq!(agent.energy, occupant.energy);
        }
        rendered += occupants.len();
        cells_seen += 1;
    }
    assert_eq!(cells_seen, 400);
    assert_eq!(rendered, world.agent_count());
}

#[test]
fn default_scenario_survives_a_long_run() {
    let config = MeadowConfig {
        rng_seed: Some(0xFEED_FACE),
        ..MeadowConfig::default()
    };
    let mut world = World::new(config).expect("world");
    for _ in 0..200 {
        if !world.is_running() {
            break;
        }
        world.step();
    }
    world.check_consistency().expect("consistent after long run");
    let last = world.history().last().expect("at least one summary");
    assert_eq!(last.population, world.population_snapshot());
}
