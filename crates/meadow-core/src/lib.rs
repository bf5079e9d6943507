//! Core simulation engine for the Meadow prey/predator/flower ecosystem.
//!
//! The world is a bounded toroidal grid of multi-occupancy cells. Each tick
//! every live agent is activated exactly once, in a freshly shuffled order,
//! and may move, feed, breed, fight, or die. All randomness flows through a
//! single seeded [`SmallRng`] owned by the world, so a fixed seed replays a
//! bit-identical population trajectory.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable generational handle for agents.
    pub struct AgentId;
}

/// High level simulation clock (ticks processed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
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

/// The three species sharing the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Species {
    /// Mobile consumer feeding on flowers.
    Prey,
    /// Mobile consumer feeding on prey.
    Predator,
    /// Stationary producer.
    Flower,
}

impl Species {
    /// Stable identifier used by snapshots and external printers.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prey => "prey",
            Self::Predator => "predator",
            Self::Flower => "flower",
        }
    }
}

/// Integer grid coordinate. Both axes wrap, so every cell has eight
/// distinct Moore neighbors as long as dimensions are at least 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    /// Construct a new cell coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// State carried by every live agent. The position is `None` exactly while
/// the agent is absent from the grid; a despawned agent is removed from the
/// registry in the same operation, so observers never see a half-dead agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub species: Species,
    /// Energy may go negative transiently; the owning species' starvation
    /// check fires on the agent's next activation.
    pub energy: i32,
    pub position: Option<Cell>,
}

/// Errors raised when constructing or mutating world state.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An agent was placed twice without being removed in between.
    #[error("agent {0:?} is already placed on the grid")]
    AlreadyPlaced(AgentId),
    /// The referenced agent is not registered.
    #[error("agent {0:?} is not registered")]
    UnknownAgent(AgentId),
    /// Grid and registry disagree about who stands where.
    #[error("grid/registry inconsistency: {0}")]
    Inconsistent(String),
}

// ---------------------------------------------------------------------------
// Spatial grid
// ---------------------------------------------------------------------------

/// Toroidal grid of multi-occupancy cells. Cells hold agent ids only; the
/// registry owns the agents themselves. The world layer keeps both in sync.
#[derive(Debug, Clone)]
pub struct TorusGrid {
    width: u32,
    height: u32,
    cells: Vec<Vec<AgentId>>,
}

impl TorusGrid {
    /// Construct an empty grid. Dimensions below 3 would let Moore
    /// neighborhoods self-overlap, so they are rejected outright.
    pub fn new(width: u32, height: u32) -> Result<Self, WorldError> {
        if width < 3 || height < 3 {
            return Err(WorldError::InvalidConfig(
                "grid dimensions must be at least 3",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![Vec::new(); (width as usize) * (height as usize)],
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn offset(&self, cell: Cell) -> usize {
        debug_assert!(cell.x < self.width && cell.y < self.height);
        (cell.y as usize) * (self.width as usize) + (cell.x as usize)
    }

    /// Occupants of one exact cell, in unspecified order.
    #[must_use]
    pub fn contents(&self, cell: Cell) -> &[AgentId] {
        &self.cells[self.offset(cell)]
    }

    /// The eight Moore neighbors of `cell`, each coordinate wrapped
    /// independently. The center is excluded.
    #[must_use]
    pub fn neighbors(&self, cell: Cell) -> [Cell; 8] {
        let w = i64::from(self.width);
        let h = i64::from(self.height);
        let mut out = [cell; 8];
        let mut slot = 0;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                out[slot] = Cell {
                    x: (i64::from(cell.x) + dx).rem_euclid(w) as u32,
                    y: (i64::from(cell.y) + dy).rem_euclid(h) as u32,
                };
                slot += 1;
            }
        }
        out
    }

    /// Insert `id` into the cell's multiset. The caller is responsible for
    /// updating the agent's position field.
    pub fn insert(&mut self, id: AgentId, cell: Cell) {
        let idx = self.offset(cell);
        debug_assert!(!self.cells[idx].contains(&id), "duplicate id in cell");
        self.cells[idx].push(id);
    }

    /// Remove `id` from `cell`, returning whether it was present.
    pub fn remove(&mut self, id: AgentId, cell: Cell) -> bool {
        let idx = self.offset(cell);
        let slot = &mut self.cells[idx];
        match slot.iter().position(|&other| other == id) {
            Some(found) => {
                slot.swap_remove(found);
                true
            }
            None => false,
        }
    }

    /// Uniformly random cell with zero occupants, or `None` when the grid is
    /// saturated. Callers placing newborns fall back to [`Self::random_cell`]
    /// in that case; reproduction never blocks world progress.
    #[must_use]
    pub fn find_unoccupied<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Cell> {
        let empties: Vec<Cell> = self
            .iter()
            .filter(|(_, occupants)| occupants.is_empty())
            .map(|(cell, _)| cell)
            .collect();
        empties.choose(rng).copied()
    }

    /// Uniformly random cell regardless of occupancy.
    #[must_use]
    pub fn random_cell<R: Rng + ?Sized>(&self, rng: &mut R) -> Cell {
        Cell {
            x: rng.random_range(0..self.width),
            y: rng.random_range(0..self.height),
        }
    }

    /// Iterate every cell in row-major order with its occupants.
    pub fn iter(&self) -> impl Iterator<Item = (Cell, &[AgentId])> + '_ {
        let width = self.width as usize;
        self.cells.iter().enumerate().map(move |(idx, occupants)| {
            let cell = Cell {
                x: (idx % width) as u32,
                y: (idx / width) as u32,
            };
            (cell, occupants.as_slice())
        })
    }
}

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

/// Arena of live agents keyed by generational handles. A dense handle list
/// preserves insertion order; the scheduler shuffles a copy of it each tick,
/// so removal during a tick can never invalidate another agent's activation.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    slots: SlotMap<AgentId, Agent>,
    handles: Vec<AgentId>,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true when no agents are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Borrow an agent.
    #[must_use]
    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        self.slots.get(id)
    }

    /// Mutably borrow an agent.
    #[must_use]
    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.slots.get_mut(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: Agent) -> AgentId {
        let id = self.slots.insert(agent);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its final state if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<Agent> {
        let agent = self.slots.remove(id)?;
        if let Some(found) = self.handles.iter().position(|&other| other == id) {
            self.handles.remove(found);
        }
        Some(agent)
    }

    /// Live handles in insertion order.
    #[must_use]
    pub fn handles(&self) -> &[AgentId] {
        &self.handles
    }

    /// Iterate live handles in insertion order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Count live agents of one species by walking the registry. Conflict
    /// rules query this instead of a shared counter so removals can never
    /// leave a stale tally behind.
    #[must_use]
    pub fn count(&self, species: Species) -> usize {
        self.slots
            .values()
            .filter(|agent| agent.species == species)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Behavior parameters for prey. Death fires when energy drops below
/// `starvation_floor` at the start of the agent's own activation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PreyParams {
    pub initial_energy: i32,
    pub starvation_floor: i32,
    /// Energy gained per flower consumed at the prey's cell.
    pub feed_gain: i32,
    pub breed_threshold: i32,
    pub breed_cost: i32,
    pub child_energy: i32,
    /// Probability of attempting an extra movement burst.
    pub sprint_chance: f64,
    pub sprint_min_energy: i32,
    pub sprint_cost: i32,
    /// Flat per-tick energy decay.
    pub upkeep: i32,
}

impl Default for PreyParams {
    fn default() -> Self {
        Self {
            initial_energy: 100,
            starvation_floor: 1,
            feed_gain: 10,
            breed_threshold: 200,
            breed_cost: 100,
            child_energy: 100,
            sprint_chance: 0.5,
            sprint_min_energy: 75,
            sprint_cost: 15,
            upkeep: 1,
        }
    }
}

/// Behavior parameters for predators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PredatorParams {
    pub initial_energy: i32,
    pub starvation_floor: i32,
    /// Energy gained per prey consumed at the predator's cell.
    pub feed_gain: i32,
    /// Energy lost when the hunt finds no target at all.
    pub miss_penalty: i32,
    /// Allow falling back to grazing a co-located flower when no prey is
    /// present. Scenario variant; off by default.
    pub graze_fallback: bool,
    pub graze_gain: i32,
    pub breed_threshold: i32,
    pub breed_cost: i32,
    pub child_energy: i32,
    /// Probability of attempting to attack a rival predator.
    pub fight_chance: f64,
    pub fight_min_energy: i32,
    pub fight_cost: i32,
    /// Minimum live predators (species-wide) required before fights happen.
    pub fight_min_population: usize,
    pub upkeep: i32,
}

impl Default for PredatorParams {
    fn default() -> Self {
        Self {
            initial_energy: 100,
            starvation_floor: 1,
            feed_gain: 100,
            miss_penalty: 20,
            graze_fallback: false,
            graze_gain: 10,
            breed_threshold: 200,
            breed_cost: 100,
            child_energy: 100,
            fight_chance: 0.3,
            fight_min_energy: 100,
            fight_cost: 50,
            fight_min_population: 2,
            upkeep: 1,
        }
    }
}

/// Behavior parameters for flowers. Flowers never move; instead of an
/// upkeep drain they grow or wilt by a coin flip each tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FlowerParams {
    pub initial_energy: i32,
    pub grow_chance: f64,
    pub grow_amount: i32,
    pub wilt_amount: i32,
    pub breed_threshold: i32,
    pub breed_cost: i32,
    pub child_energy: i32,
}

impl Default for FlowerParams {
    fn default() -> Self {
        Self {
            initial_energy: 100,
            grow_chance: 0.5,
            grow_amount: 10,
            wilt_amount: 5,
            breed_threshold: 150,
            breed_cost: 75,
            child_energy: 100,
        }
    }
}

/// Static configuration for a Meadow world. All behavior numbers are
/// scenario parameters, not constants; defaults follow the reference
/// 20x20 scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeadowConfig {
    pub width: u32,
    pub height: u32,
    pub prey_count: u32,
    pub predator_count: u32,
    pub flower_count: u32,
    /// Optional RNG seed for reproducible runs. When absent a seed is drawn
    /// from entropy and exposed via [`World::seed`] so the run can still be
    /// replayed.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    pub prey: PreyParams,
    pub predator: PredatorParams,
    pub flower: FlowerParams,
}

impl Default for MeadowConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            prey_count: 50,
            predator_count: 10,
            flower_count: 20,
            rng_seed: None,
            history_capacity: 256,
            prey: PreyParams::default(),
            predator: PredatorParams::default(),
            flower: FlowerParams::default(),
        }
    }
}

impl MeadowConfig {
    /// Validates dimensions, probabilities, and energy parameters.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.width < 3 || self.height < 3 {
            return Err(WorldError::InvalidConfig(
                "grid dimensions must be at least 3",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        for chance in [
            self.prey.sprint_chance,
            self.predator.fight_chance,
            self.flower.grow_chance,
        ] {
            if !(0.0..=1.0).contains(&chance) {
                return Err(WorldError::InvalidConfig(
                    "probabilities must lie in [0, 1]",
                ));
            }
        }
        if self.prey.initial_energy < 0
            || self.prey.feed_gain < 0
            || self.prey.breed_threshold < 0
            || self.prey.breed_cost < 0
            || self.prey.child_energy < 0
            || self.prey.sprint_cost < 0
            || self.prey.upkeep < 0
        {
            return Err(WorldError::InvalidConfig(
                "prey energy parameters must be non-negative",
            ));
        }
        if self.predator.initial_energy < 0
            || self.predator.feed_gain < 0
            || self.predator.miss_penalty < 0
            || self.predator.graze_gain < 0
            || self.predator.breed_threshold < 0
            || self.predator.breed_cost < 0
            || self.predator.child_energy < 0
            || self.predator.fight_cost < 0
            || self.predator.upkeep < 0
        {
            return Err(WorldError::InvalidConfig(
                "predator energy parameters must be non-negative",
            ));
        }
        if self.flower.initial_energy < 0
            || self.flower.grow_amount < 0
            || self.flower.wilt_amount < 0
            || self.flower.breed_threshold < 0
            || self.flower.breed_cost < 0
            || self.flower.child_energy < 0
        {
            return Err(WorldError::InvalidConfig(
                "flower energy parameters must be non-negative",
            ));
        }
        Ok(())
    }

    /// Total number of initially requested agents.
    #[must_use]
    pub fn initial_population(&self) -> u64 {
        u64::from(self.prey_count) + u64::from(self.predator_count) + u64::from(self.flower_count)
    }

    fn resolve_seed(&self) -> u64 {
        match self.rng_seed {
            Some(seed) => seed,
            None => rand::random(),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation surface
// ---------------------------------------------------------------------------

/// Per-species population counts at one instant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationSnapshot {
    pub prey: usize,
    pub predators: usize,
    pub flowers: usize,
}

impl PopulationSnapshot {
    /// Count for one species.
    #[must_use]
    pub const fn count(&self, species: Species) -> usize {
        match species {
            Species::Prey => self.prey,
            Species::Predator => self.predators,
            Species::Flower => self.flowers,
        }
    }

    /// Total live agents across all species.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.prey + self.predators + self.flowers
    }

    /// Species-name/count pairs for external printers.
    #[must_use]
    pub const fn counts(&self) -> [(&'static str, usize); 3] {
        [
            (Species::Prey.name(), self.prey),
            (Species::Predator.name(), self.predators),
            (Species::Flower.name(), self.flowers),
        ]
    }
}

impl fmt::Display for PopulationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prey={} predators={} flowers={}",
            self.prey, self.predators, self.flowers
        )
    }
}

/// Summary recorded after each completed tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: Tick,
    pub population: PopulationSnapshot,
    pub births: usize,
    pub deaths: usize,
}

/// One grid occupant as seen through the read-only render iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occupant {
    pub id: AgentId,
    pub species: Species,
    pub energy: i32,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Composition root owning grid, registry, RNG, and the tick scheduler.
pub struct World {
    config: MeadowConfig,
    seed: u64,
    rng: SmallRng,
    grid: TorusGrid,
    registry: AgentRegistry,
    tick: Tick,
    running: bool,
    population_cap_violated: bool,
    births: usize,
    deaths: usize,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("seed", &self.seed)
            .field("tick", &self.tick)
            .field("running", &self.running)
            .field("population_cap_violated", &self.population_cap_violated)
            .field("agent_count", &self.registry.len())
            .finish()
    }
}

impl World {
    /// Build and populate a world. The initial population is placed on
    /// unoccupied cells (falling back to arbitrary cells only once the grid
    /// saturates). When the requested population exceeds the cell count the
    /// world is still constructed, but empty, halted, and flagged.
    pub fn new(config: MeadowConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let seed = config.resolve_seed();
        let grid = TorusGrid::new(config.width, config.height)?;
        let cap_violated = config.initial_population() > grid.cell_count() as u64;
        let history_capacity = config.history_capacity;
        let mut world = Self {
            rng: SmallRng::seed_from_u64(seed),
            seed,
            grid,
            registry: AgentRegistry::new(),
            tick: Tick::zero(),
            running: !cap_violated,
            population_cap_violated: cap_violated,
            births: 0,
            deaths: 0,
            history: VecDeque::with_capacity(history_capacity),
            config,
        };
        if cap_violated {
            return Ok(world);
        }
        for _ in 0..world.config.prey_count {
            let energy = world.config.prey.initial_energy;
            world.spawn_placed(Species::Prey, energy);
        }
        for _ in 0..world.config.predator_count {
            let energy = world.config.predator.initial_energy;
            world.spawn_placed(Species::Predator, energy);
        }
        for _ in 0..world.config.flower_count {
            let energy = world.config.flower.initial_energy;
            world.spawn_placed(Species::Flower, energy);
        }
        world.births = 0;
        Ok(world)
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &MeadowConfig {
        &self.config
    }

    /// The RNG seed actually in use. Report this for replaying runs that
    /// were started without an explicit seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Ticks processed so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick.0
    }

    /// False once the population reaches zero (or construction was refused
    /// by the capacity guard); subsequent [`Self::step`] calls are no-ops.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whether construction refused to place agents because the requested
    /// population exceeded the grid capacity.
    #[must_use]
    pub const fn population_cap_violated(&self) -> bool {
        self.population_cap_violated
    }

    /// Read-only access to the agent registry.
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Read-only access to the spatial grid.
    #[must_use]
    pub fn grid(&self) -> &TorusGrid {
        &self.grid
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.registry.len()
    }

    /// Borrow one agent.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.registry.get(id)
    }

    /// Mutably borrow one agent. Intended for scenario setup and tests;
    /// edit energy only, positions are managed through the grid.
    #[must_use]
    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.registry.get_mut(id)
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Per-species population counts, computed from the registry.
    #[must_use]
    pub fn population_snapshot(&self) -> PopulationSnapshot {
        let mut snapshot = PopulationSnapshot::default();
        for id in self.registry.iter_handles() {
            if let Some(agent) = self.registry.get(id) {
                match agent.species {
                    Species::Prey => snapshot.prey += 1,
                    Species::Predator => snapshot.predators += 1,
                    Species::Flower => snapshot.flowers += 1,
                }
            }
        }
        snapshot
    }

    /// Read-only iterator over every cell and its occupants, for rendering.
    pub fn cells(&self) -> impl Iterator<Item = (Cell, Vec<Occupant>)> + '_ {
        self.grid.iter().map(move |(cell, ids)| {
            let occupants = ids
                .iter()
                .filter_map(|&id| {
                    self.registry.get(id).map(|agent| Occupant {
                        id,
                        species: agent.species,
                        energy: agent.energy,
                    })
                })
                .collect();
            (cell, occupants)
        })
    }

    /// Verify that the set of placed agents equals the union of all cell
    /// contents, with no duplicates and no orphans. Cheap enough for tests;
    /// correct use can never make it fail.
    pub fn check_consistency(&self) -> Result<(), WorldError> {
        let mut seen: HashSet<AgentId> = HashSet::new();
        let mut placed_in_grid = 0usize;
        for (cell, ids) in self.grid.iter() {
            for &id in ids {
                if !seen.insert(id) {
                    return Err(WorldError::Inconsistent(format!(
                        "agent {id:?} occupies more than one cell"
                    )));
                }
                match self.registry.get(id) {
                    Some(agent) if agent.position == Some(cell) => placed_in_grid += 1,
                    Some(agent) => {
                        return Err(WorldError::Inconsistent(format!(
                            "agent {id:?} in cell {cell:?} but records position {:?}",
                            agent.position
                        )));
                    }
                    None => {
                        return Err(WorldError::Inconsistent(format!(
                            "unregistered agent {id:?} present in cell {cell:?}"
                        )));
                    }
                }
            }
        }
        let placed_in_registry = self
            .registry
            .iter_handles()
            .filter(|&id| {
                self.registry
                    .get(id)
                    .is_some_and(|agent| agent.position.is_some())
            })
            .count();
        if placed_in_grid != placed_in_registry {
            return Err(WorldError::Inconsistent(format!(
                "{placed_in_registry} agents report a position but {placed_in_grid} stand on the grid"
            )));
        }
        Ok(())
    }

    // -- placement ---------------------------------------------------------

    /// Register a new agent at an exact cell. Multi-occupancy is legal.
    pub fn spawn_agent_at(&mut self, species: Species, energy: i32, cell: Cell) -> AgentId {
        let id = self.registry.insert(Agent {
            species,
            energy,
            position: None,
        });
        // Freshly inserted, so placement cannot fail.
        let _ = self.place_agent(id, cell);
        id
    }

    /// Put a registered, unplaced agent onto the grid.
    pub fn place_agent(&mut self, id: AgentId, cell: Cell) -> Result<(), WorldError> {
        let agent = self.registry.get_mut(id).ok_or(WorldError::UnknownAgent(id))?;
        if agent.position.is_some() {
            return Err(WorldError::AlreadyPlaced(id));
        }
        agent.position = Some(cell);
        self.grid.insert(id, cell);
        Ok(())
    }

    fn spawn_placed(&mut self, species: Species, energy: i32) -> AgentId {
        let cell = match self.grid.find_unoccupied(&mut self.rng) {
            Some(cell) => cell,
            None => self.grid.random_cell(&mut self.rng),
        };
        let id = self.spawn_agent_at(species, energy, cell);
        self.births += 1;
        id
    }

    fn relocate(&mut self, id: AgentId, to: Cell) {
        if let Some(agent) = self.registry.get_mut(id) {
            if let Some(from) = agent.position.replace(to) {
                self.grid.remove(id, from);
            }
            self.grid.insert(id, to);
        }
    }

    /// Remove an agent from grid and registry in one operation.
    fn despawn(&mut self, id: AgentId) {
        if let Some(agent) = self.registry.remove(id) {
            if let Some(cell) = agent.position {
                self.grid.remove(id, cell);
            }
            self.deaths += 1;
        }
    }

    // -- scheduler ---------------------------------------------------------

    /// Advance the simulation by exactly one tick. Participants are fixed by
    /// a registry snapshot taken up front, the activation order is a fresh
    /// random permutation, and ids removed earlier in the tick are skipped.
    /// Agents born during the tick first act on the following one.
    pub fn step(&mut self) {
        if !self.running {
            return;
        }
        if self.registry.is_empty() {
            self.running = false;
            return;
        }
        self.births = 0;
        self.deaths = 0;

        let mut order: Vec<AgentId> = self.registry.handles().to_vec();
        order.shuffle(&mut self.rng);
        for id in order {
            if !self.registry.contains(id) {
                continue;
            }
            self.step_agent(id);
        }

        self.tick = self.tick.next();
        if self.registry.is_empty() {
            self.running = false;
        }
        let summary = TickSummary {
            tick: self.tick,
            population: self.population_snapshot(),
            births: self.births,
            deaths: self.deaths,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    fn step_agent(&mut self, id: AgentId) {
        let species = match self.registry.get(id) {
            Some(agent) => agent.species,
            None => return,
        };
        match species {
            Species::Prey => self.step_prey(id),
            Species::Predator => self.step_predator(id),
            Species::Flower => self.step_flower(id),
        }
    }

    // -- behaviors ---------------------------------------------------------

    fn step_prey(&mut self, id: AgentId) {
        let params = self.config.prey;
        let (energy, position) = match self.registry.get(id) {
            Some(agent) => (agent.energy, agent.position),
            None => return,
        };
        let Some(position) = position else {
            return;
        };
        if energy < params.starvation_floor {
            self.despawn(id);
            return;
        }

        let position = self.random_step(id, position);
        if self.eat_at(id, position, Species::Flower) {
            self.add_energy(id, params.feed_gain);
        }
        self.try_breed(
            id,
            Species::Prey,
            params.breed_threshold,
            params.breed_cost,
            params.child_energy,
        );

        if self.rng.random_bool(params.sprint_chance) {
            self.try_sprint(id, &params);
        }
        self.add_energy(id, -params.upkeep);
    }

    fn try_sprint(&mut self, id: AgentId, params: &PreyParams) {
        let (energy, position) = match self.registry.get(id) {
            Some(agent) => (agent.energy, agent.position),
            None => return,
        };
        let Some(position) = position else {
            return;
        };
        if energy < params.sprint_min_energy {
            return;
        }
        self.add_energy(id, -params.sprint_cost);
        self.random_step(id, position);
    }

    fn step_predator(&mut self, id: AgentId) {
        let params = self.config.predator;
        let (energy, position) = match self.registry.get(id) {
            Some(agent) => (agent.energy, agent.position),
            None => return,
        };
        let Some(position) = position else {
            return;
        };
        if energy < params.starvation_floor {
            self.despawn(id);
            return;
        }

        let position = self.random_step(id, position);
        if self.eat_at(id, position, Species::Prey) {
            self.add_energy(id, params.feed_gain);
        } else if params.graze_fallback && self.eat_at(id, position, Species::Flower) {
            self.add_energy(id, params.graze_gain);
        } else {
            self.add_energy(id, -params.miss_penalty);
        }
        self.try_breed(
            id,
            Species::Predator,
            params.breed_threshold,
            params.breed_cost,
            params.child_energy,
        );

        if self.rng.random_bool(params.fight_chance) {
            self.try_fight(id, &params);
        }
        self.add_energy(id, -params.upkeep);
    }

    fn try_fight(&mut self, id: AgentId, params: &PredatorParams) {
        let (energy, position) = match self.registry.get(id) {
            Some(agent) => (agent.energy, agent.position),
            None => return,
        };
        let Some(position) = position else {
            return;
        };
        if energy < params.fight_min_energy {
            return;
        }
        if self.registry.count(Species::Predator) < params.fight_min_population {
            return;
        }
        self.add_energy(id, -params.fight_cost);
        if let Some(rival) = self.pick_occupant(position, Species::Predator, Some(id)) {
            self.despawn(rival);
        }
    }

    fn step_flower(&mut self, id: AgentId) {
        let params = self.config.flower;
        match self.registry.get(id) {
            Some(agent) if agent.position.is_some() => {}
            _ => return,
        }
        if self.rng.random_bool(params.grow_chance) {
            self.add_energy(id, params.grow_amount);
        } else {
            self.add_energy(id, -params.wilt_amount);
        }
        if self.registry.get(id).is_some_and(|agent| agent.energy <= 0) {
            self.despawn(id);
            return;
        }
        self.try_breed(
            id,
            Species::Flower,
            params.breed_threshold,
            params.breed_cost,
            params.child_energy,
        );
    }

    // -- behavior helpers --------------------------------------------------

    /// Move `id` to a uniformly random Moore neighbor, returning the new
    /// position.
    fn random_step(&mut self, id: AgentId, from: Cell) -> Cell {
        let options = self.grid.neighbors(from);
        let target = options[self.rng.random_range(0..options.len())];
        self.relocate(id, target);
        target
    }

    /// Choose one agent of `species` standing at `cell`, uniformly at
    /// random, optionally excluding the actor itself.
    fn pick_occupant(
        &mut self,
        cell: Cell,
        species: Species,
        exclude: Option<AgentId>,
    ) -> Option<AgentId> {
        let candidates: Vec<AgentId> = self
            .grid
            .contents(cell)
            .iter()
            .copied()
            .filter(|&id| Some(id) != exclude)
            .filter(|&id| {
                self.registry
                    .get(id)
                    .is_some_and(|agent| agent.species == species)
            })
            .collect();
        candidates.choose(&mut self.rng).copied()
    }

    /// Consume one co-located agent of `species`, removing it from grid and
    /// registry atomically. Returns whether a target was found.
    fn eat_at(&mut self, eater: AgentId, cell: Cell, species: Species) -> bool {
        debug_assert!(self.registry.contains(eater));
        match self.pick_occupant(cell, species, Some(eater)) {
            Some(victim) => {
                self.despawn(victim);
                true
            }
            None => false,
        }
    }

    /// Spawn one child when the parent clears the breeding threshold. The
    /// child is placed on an unoccupied cell when one exists, on an
    /// arbitrary cell otherwise, and first acts next tick.
    fn try_breed(
        &mut self,
        id: AgentId,
        species: Species,
        threshold: i32,
        cost: i32,
        child_energy: i32,
    ) {
        match self.registry.get_mut(id) {
            Some(agent) if agent.energy >= threshold => {
                agent.energy -= cost;
            }
            _ => return,
        }
        self.spawn_placed(species, child_energy);
    }

    fn add_energy(&mut self, id: AgentId, delta: i32) {
        if let Some(agent) = self.registry.get_mut(id) {
            agent.energy += delta;
        }
    }
}
