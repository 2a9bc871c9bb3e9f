//! Assembles the four 48x48 tiles into the 96x96 floor map.
//!
//! Two polling strategies are supported:
//!
//! - [`PollStrategy::RoundRobin`] asks one tile per cycle and copies its grid
//!   verbatim. Cheap, but a full refresh takes four cycles.
//! - [`PollStrategy::FullScan`] asks all four tiles at once on a small pool
//!   of poll workers, waits a bounded time for them, and places each reply
//!   through the [`CorrectionTable`].
//!
//! Either way, only quadrants that answered this cycle are written. A tile
//! that failed keeps showing what it showed last time.

use crate::error::LinkError;
use crate::grid::{Grid, PressureMap, MAP_SIZE, TILE_SIZE};
use crate::lock;
use crate::sensor_link::{SensorLink, SensorPort, SensorReading};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serial2::SerialPort;
use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub const QUADRANTS: usize = 4;

/// Default bound on how long a full scan waits for its four replies.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(120);

/// Top-left corner of quadrant `q` in the combined map.
pub fn quadrant_origin(q: usize) -> (usize, usize) {
    ((q / 2) * TILE_SIZE, (q % 2) * TILE_SIZE)
}

/// How a tile's local cell `(i, j)` maps into its block of the combined map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// `(i, j)`
    Identity,
    /// `(j, i)`
    Transpose,
    /// `(size-1-j, size-1-i)`
    AntiTranspose,
}

impl Transform {
    pub fn apply(self, i: usize, j: usize, size: usize) -> (usize, usize) {
        match self {
            Transform::Identity => (i, j),
            Transform::Transpose => (j, i),
            Transform::AntiTranspose => (size - 1 - j, size - 1 - i),
        }
    }
}

/// Per-quadrant placement used by [`PollStrategy::FullScan`].
///
/// The default matches how the pad was wired when it was first brought up.
/// Quadrants 0/3 and 1/2 end up with the same transform, which has not
/// been checked against the physical mounting; override it in the config
/// if the map looks mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionTable {
    pub quadrants: [Transform; QUADRANTS],
}

impl Default for CorrectionTable {
    fn default() -> Self {
        Self {
            quadrants: [
                Transform::Transpose,
                Transform::AntiTranspose,
                Transform::AntiTranspose,
                Transform::Transpose,
            ],
        }
    }
}

impl CorrectionTable {
    /// A table that places every tile as-is.
    pub fn identity() -> Self {
        Self {
            quadrants: [Transform::Identity; QUADRANTS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStrategy {
    RoundRobin,
    FullScan,
}

/// What one call to [`QuadrantAggregator::poll_cycle`] achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: Vec<usize>,
    pub refreshed: Vec<usize>,
}

impl CycleReport {
    pub fn any_refreshed(&self) -> bool {
        !self.refreshed.is_empty()
    }
}

#[derive(Debug)]
struct Combined {
    map: PressureMap,
    last_cycle_ok: bool,
}

type QuadrantResult = (usize, Result<Arc<SensorReading>, LinkError>);
type PollResult = (u64, usize, Result<Arc<SensorReading>, LinkError>);

struct PollWorker {
    quadrant: usize,
    jobs: SyncSender<u64>,
    handle: JoinHandle<()>,
}

/// One long-lived thread per live tile, fed one cycle number at a time.
struct PollPool {
    workers: Vec<PollWorker>,
    results: Receiver<PollResult>,
}

impl PollPool {
    fn spawn<P: SensorPort + 'static>(links: &[Option<Arc<SensorLink<P>>>; QUADRANTS]) -> Self {
        let (result_tx, results) = mpsc::channel();
        let workers = links
            .iter()
            .flatten()
            .map(|link| {
                let (jobs, job_rx) = mpsc::sync_channel::<u64>(1);
                let link = Arc::clone(link);
                let result_tx = result_tx.clone();
                let quadrant = link.quadrant();
                let handle = thread::spawn(move || {
                    while let Ok(cycle) = job_rx.recv() {
                        let res = link.request_reading();
                        if result_tx.send((cycle, quadrant, res)).is_err() {
                            break;
                        }
                    }
                    debug!("Quadrant {} : poll worker terminated.", quadrant);
                });
                PollWorker {
                    quadrant,
                    jobs,
                    handle,
                }
            })
            .collect();

        Self { workers, results }
    }

    fn shutdown(self) {
        let PollPool { workers, results } = self;
        drop(results);
        for PollWorker { jobs, handle, .. } in workers {
            drop(jobs);
            if handle.join().is_err() {
                warn!("A poll worker panicked");
            }
        }
    }
}

/// Polls up to four [`SensorLink`]s and keeps the combined map.
pub struct QuadrantAggregator<P: SensorPort + 'static = SerialPort> {
    links: [Option<Arc<SensorLink<P>>>; QUADRANTS],
    strategy: PollStrategy,
    corrections: CorrectionTable,
    join_timeout: Duration,
    cursor: usize,
    cycle: u64,
    combined: Mutex<Combined>,
    pool: Option<PollPool>,
}

impl QuadrantAggregator<SerialPort> {
    /// Opens whichever of the four ports are configured. A port that does
    /// not open is logged and its quadrant simply stays empty.
    pub fn open(
        ports: &[Option<PathBuf>; QUADRANTS],
        strategy: PollStrategy,
        corrections: CorrectionTable,
    ) -> Self {
        let links = std::array::from_fn(|q| {
            let path = ports[q].as_ref()?;
            match SensorLink::open(q, path) {
                Ok(link) => Some(link),
                Err(e) => {
                    warn!("Quadrant {} : {}", q, e);
                    None
                }
            }
        });
        Self::new(links, strategy, corrections)
    }
}

impl<P: SensorPort + 'static> QuadrantAggregator<P> {
    pub fn new(
        links: [Option<SensorLink<P>>; QUADRANTS],
        strategy: PollStrategy,
        corrections: CorrectionTable,
    ) -> Self {
        let links = links.map(|link| link.map(Arc::new));
        let live = links.iter().flatten().count();
        info!(
            "Aggregator : {} of {} quadrants live, {:?}",
            live, QUADRANTS, strategy
        );

        let pool = (strategy == PollStrategy::FullScan).then(|| PollPool::spawn(&links));

        Self {
            links,
            strategy,
            corrections,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            cursor: 0,
            cycle: 0,
            combined: Mutex::new(Combined {
                map: Grid::zeroed(MAP_SIZE),
                last_cycle_ok: false,
            }),
            pool,
        }
    }

    /// Overrides [`DEFAULT_JOIN_TIMEOUT`].
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn strategy(&self) -> PollStrategy {
        self.strategy
    }

    /// The quadrant the next round-robin cycle will ask.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// A copy of the combined map, and whether the last cycle refreshed any
    /// part of it.
    pub fn combined_map(&self) -> (PressureMap, bool) {
        let combined = lock(&self.combined);
        (combined.map.clone(), combined.last_cycle_ok)
    }

    /// Runs one polling cycle with the configured strategy.
    pub fn poll_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let (polled, results) = match self.strategy {
            PollStrategy::RoundRobin => self.poll_round_robin(),
            PollStrategy::FullScan => self.poll_full_scan(),
        };

        let mut refreshed = Vec::new();
        let mut combined = lock(&self.combined);
        for (quadrant, result) in results {
            match result {
                Ok(reading) => {
                    let transform = match self.strategy {
                        PollStrategy::RoundRobin => Transform::Identity,
                        PollStrategy::FullScan => self.corrections.quadrants[quadrant],
                    };
                    place(&mut combined.map, quadrant, &reading.grid, transform);
                    refreshed.push(quadrant);
                }
                Err(e) if e.is_routine() => debug!("Quadrant {} : {}", quadrant, e),
                Err(e) => warn!("Quadrant {} : {}", quadrant, e),
            }
        }
        combined.last_cycle_ok = !refreshed.is_empty();
        drop(combined);

        refreshed.sort_unstable();
        CycleReport { polled, refreshed }
    }

    fn poll_round_robin(&mut self) -> (Vec<usize>, Vec<QuadrantResult>) {
        let quadrant = self.cursor;
        self.cursor = (self.cursor + 1) % QUADRANTS;

        // An absent tile still takes its turn, so the others keep their cadence
        match &self.links[quadrant] {
            Some(link) => (vec![quadrant], vec![(quadrant, link.request_reading())]),
            None => (Vec::new(), Vec::new()),
        }
    }

    fn poll_full_scan(&mut self) -> (Vec<usize>, Vec<QuadrantResult>) {
        let Some(pool) = &self.pool else {
            return (Vec::new(), Vec::new());
        };
        let cycle = self.cycle;

        let mut polled = Vec::with_capacity(QUADRANTS);
        for worker in &pool.workers {
            match worker.jobs.try_send(cycle) {
                Ok(()) => polled.push(worker.quadrant),
                Err(TrySendError::Full(_)) => {
                    debug!("Quadrant {} : still busy, skipped", worker.quadrant)
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("Quadrant {} : poll worker is gone", worker.quadrant)
                }
            }
        }

        let deadline = Instant::now() + self.join_timeout;
        let mut results = Vec::with_capacity(polled.len());
        while results.len() < polled.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match pool.results.recv_timeout(remaining) {
                Ok((c, quadrant, result)) if c == cycle => results.push((quadrant, result)),
                Ok((c, quadrant, _)) => {
                    debug!("Quadrant {} : dropping late reply from cycle {}", quadrant, c)
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!(
                        "Full scan : {} of {} replies before join timeout",
                        results.len(),
                        polled.len()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        (polled, results)
    }
}

impl<P: SensorPort + 'static> Drop for QuadrantAggregator<P> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

/// Writes `tile` into quadrant `q` of `map` through `transform`.
fn place(map: &mut PressureMap, q: usize, tile: &Grid, transform: Transform) {
    let (row0, col0) = quadrant_origin(q);
    let size = tile.size();
    for (i, j, value) in tile.block(0, 0, size) {
        let (ii, jj) = transform.apply(i, j, size);
        map.set(row0 + ii, col0 + jj, value);
    }
}
