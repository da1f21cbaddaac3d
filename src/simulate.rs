//! Concurrent read/write workload against an in-memory lab.
//!
//! Every sample page embeds its own version, the version of its series and
//! the version of the process it sits on. Writers bump one of those
//! versions and publish the change; readers remember which versions were
//! fully committed before they asked and flag any page older than that.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, CacheEngine, Rendered, SettingsHash, deps};
use crate::config::SimulateArgs;
use crate::domain::entities::EntityKey;
use crate::domain::events::{ChangeBus, ChangeKind};
use crate::domain::lab::{self, MemoryLab, Relation};
use crate::infra::error::InfraError;

const SAMPLES_PER_SERIES: usize = 5;
const SAMPLES_PER_PROCESS: usize = 10;

/// Totals of one simulation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub stale: u64,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn hit_rate(&self) -> Option<f64> {
        (self.reads > 0).then(|| self.hits as f64 / self.reads as f64)
    }

    fn merge(&mut self, other: &WorkerTally) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.hits += other.hits;
        self.stale += other.stale;
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    reads: u64,
    writes: u64,
    hits: u64,
    stale: u64,
}

#[derive(Debug, Default)]
struct Version {
    /// Incremented before the change is published.
    data: AtomicU64,
    /// Raised once publishing returned.
    committed: AtomicU64,
}

/// Static lab layout plus the live version of every entity.
struct Lab {
    samples: Vec<Page>,
    writable: Vec<EntityKey>,
    versions: HashMap<EntityKey, Version>,
}

#[derive(Debug, Clone)]
struct Page {
    sample: EntityKey,
    series: EntityKey,
    process: EntityKey,
}

impl Lab {
    fn generate(samples: usize, relations: &MemoryLab) -> Self {
        let mut pages = Vec::with_capacity(samples);
        let mut versions = HashMap::new();

        for index in 0..samples {
            let sample = format!("s{index}");
            let series = format!("ss{}", index / SAMPLES_PER_SERIES);
            let process = format!("p{}", index / SAMPLES_PER_PROCESS);

            relations.link(Relation::SampleSeries, sample.as_str(), series.as_str());
            relations.link(Relation::SeriesMembers, series.as_str(), sample.as_str());
            relations.link(Relation::ProcessSamples, process.as_str(), sample.as_str());

            let page = Page {
                sample: EntityKey::sample(sample),
                series: EntityKey::sample_series(series),
                process: EntityKey::process(process),
            };
            for entity in [&page.sample, &page.series, &page.process] {
                versions.entry(entity.clone()).or_insert_with(Version::default);
            }
            pages.push(page);
        }

        let mut writable: Vec<EntityKey> = versions.keys().cloned().collect();
        writable.sort();

        Self {
            samples: pages,
            writable,
            versions,
        }
    }

    fn data(&self, entity: &EntityKey) -> u64 {
        self.versions
            .get(entity)
            .map(|version| version.data.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    fn committed(&self, entity: &EntityKey) -> u64 {
        self.versions
            .get(entity)
            .map(|version| version.committed.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    fn snapshot(&self, page: &Page) -> [u64; 3] {
        [
            self.committed(&page.sample),
            self.committed(&page.series),
            self.committed(&page.process),
        ]
    }
}

/// Runs the workload described by `args` and reports what readers saw.
pub async fn run(config: CacheConfig, args: &SimulateArgs) -> Result<SimulationReport, InfraError> {
    if args.entities == 0 {
        return Err(InfraError::simulation("at least one sample is required"));
    }

    let relations = Arc::new(MemoryLab::new());
    let lab = Arc::new(Lab::generate(args.entities, &relations));
    let graph = lab::dependency_graph(relations)
        .map_err(|err| InfraError::simulation(format!("invalid dependency graph: {err}")))?;

    let engine = CacheEngine::in_memory(config, graph);
    let bus = Arc::new(ChangeBus::new());
    engine.attach(&bus);

    info!(
        workers = args.workers,
        samples = lab.samples.len(),
        entities = lab.versions.len(),
        rounds = args.rounds,
        write_percent = args.write_percent,
        "Simulation started"
    );

    let started_at = Instant::now();
    let mut workers = JoinSet::new();
    for worker in 0..args.workers {
        let worker = Worker {
            engine: engine.clone(),
            bus: bus.clone(),
            lab: lab.clone(),
            rng: StdRng::seed_from_u64(worker as u64),
            write_percent: u32::from(args.write_percent),
        };
        workers.spawn(worker.run(args.rounds));
    }

    let mut report = SimulationReport::default();
    while let Some(joined) = workers.join_next().await {
        let tally =
            joined.map_err(|err| InfraError::simulation(format!("worker panicked: {err}")))?;
        report.merge(&tally);
    }
    report.elapsed = started_at.elapsed();

    match engine.render_cache().stats().hit_rate().await {
        Ok(Some(rate)) => debug!(hit_rate = rate, "Backend hit counters"),
        Ok(None) => {}
        Err(error) => warn!(error = %error, "Hit counters unavailable"),
    }

    info!(
        reads = report.reads,
        writes = report.writes,
        hits = report.hits,
        stale = report.stale,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Simulation finished"
    );
    Ok(report)
}

struct Worker {
    engine: CacheEngine,
    bus: Arc<ChangeBus>,
    lab: Arc<Lab>,
    rng: StdRng,
    write_percent: u32,
}

impl Worker {
    async fn run(mut self, rounds: usize) -> WorkerTally {
        let settings = SettingsHash::from_parts(["en", "metric"]);
        let mut tally = WorkerTally::default();

        for _ in 0..rounds {
            if self.rng.random_range(0..100) < self.write_percent {
                self.write().await;
                tally.writes += 1;
            } else {
                let page = self.lab.samples[self.rng.random_range(0..self.lab.samples.len())]
                    .clone();
                let (hit, stale) = self.read(&page, &settings).await;
                tally.reads += 1;
                tally.hits += u64::from(hit);
                tally.stale += u64::from(stale);
            }
        }

        tally
    }

    async fn write(&mut self) {
        let entity = self.lab.writable[self.rng.random_range(0..self.lab.writable.len())].clone();
        let Some(version) = self.lab.versions.get(&entity) else {
            return;
        };
        let written = version.data.fetch_add(1, Ordering::AcqRel) + 1;
        self.bus.publish(entity, ChangeKind::Updated).await;
        version.committed.fetch_max(written, Ordering::AcqRel);
    }

    /// Returns `(hit, stale)`.
    async fn read(&self, page: &Page, settings: &SettingsHash) -> (bool, bool) {
        let floor = self.lab.snapshot(page);
        let lab = self.lab.clone();
        let rendered = page.clone();

        let output = self
            .engine
            .get_or_render(&page.sample, settings, move |_| async move {
                deps::record(rendered.series.clone());
                deps::record(rendered.process.clone());
                let sample = lab.data(&rendered.sample);
                tokio::task::yield_now().await;
                let series = lab.data(&rendered.series);
                let process = lab.data(&rendered.process);
                Ok::<_, Infallible>(Rendered::new(format!("{sample}:{series}:{process}")))
            })
            .await;

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                warn!(entity = %page.sample, error = ?error, "Read failed");
                return (false, false);
            }
        };

        let seen = parse_versions(&output.body);
        let stale = match seen {
            Some(seen) => seen.iter().zip(floor.iter()).any(|(seen, floor)| seen < floor),
            None => true,
        };
        if stale {
            warn!(
                entity = %page.sample,
                body = %String::from_utf8_lossy(&output.body),
                floor = ?floor,
                "Stale render served"
            );
        }
        (output.is_hit(), stale)
    }
}

fn parse_versions(body: &[u8]) -> Option<[u64; 3]> {
    let text = std::str::from_utf8(body).ok()?;
    let mut parts = text.split(':').map(|part| part.parse::<u64>().ok());
    let versions = [parts.next()??, parts.next()??, parts.next()??];
    parts.next().is_none().then_some(versions)
}
