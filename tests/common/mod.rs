//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use transit_feed::{
    AccumulatorConfig, CsvLayout, FetchError, IngestConfig, ManualClock, ObjectStorage, Pipeline,
    PublishConfig, PublishError, Publisher, RawSnapshot, SnapshotSource, TransformError,
    TransformRunner, TransformTrigger, WindowedAccumulator,
};

/// 2024-01-05T12:00:00Z, 09:00:00 in Sao Paulo.
pub fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_704_456_000, 0).expect("valid timestamp")
}

/// One BRT-shaped feed entry.
pub fn entry(vehicle: impl Into<Value>, gps_ms: i64, speed: f64) -> Value {
    json!({
        "codigo": vehicle.into(),
        "linha": "10",
        "latitude": -22.91,
        "longitude": -43.17,
        "dataHora": gps_ms,
        "velocidade": speed,
        "sentido": "ida",
    })
}

pub fn snapshot(entries: Vec<Value>) -> RawSnapshot {
    RawSnapshot::new(json!({ "veiculos": entries }))
}

/// A poll with a single vehicle unique to `poll`.
pub fn unique_poll(poll: usize) -> RawSnapshot {
    snapshot(vec![entry(format!("bus-{poll}"), 1_704_455_000_000 + poll as i64, 30.0)])
}

/// Replays queued responses; an empty queue yields an empty entry list.
/// Cancels `done` once the queue has been drained.
pub struct ScriptedSource {
    queue: Mutex<VecDeque<Result<RawSnapshot, FetchError>>>,
    calls: AtomicUsize,
    done: CancellationToken,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<RawSnapshot, FetchError>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            done: CancellationToken::new(),
        }
    }

    pub fn with_done(mut self, done: CancellationToken) -> Self {
        self.done = done;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> Result<RawSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().expect("queue lock");
        let next = queue.pop_front();
        if queue.is_empty() {
            self.done.cancel();
        }
        next.unwrap_or_else(|| Ok(snapshot(Vec::new())))
    }
}

/// Storage whose every write fails.
pub struct FailingStorage {
    pub attempts: AtomicUsize,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStorage for FailingStorage {
    async fn write(&self, key: &str, _: Bytes, _: &str) -> Result<String, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Storage {
            key: key.to_string(),
            message: "403 Forbidden".into(),
        })
    }
}

/// Transform runner that counts invocations.
pub struct CountingRunner {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingRunner {
    pub fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformRunner for CountingRunner {
    async fn run(&self) -> Result<String, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(TransformError::Failed {
                code: Some(2),
                stdout: String::new(),
                stderr: "Compilation Error in model stg_positions".into(),
            })
        } else {
            Ok("Completed successfully".into())
        }
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub source: Arc<ScriptedSource>,
    pub runner: Arc<CountingRunner>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(
        source: ScriptedSource,
        storage: Arc<dyn ObjectStorage>,
        runner: CountingRunner,
    ) -> Self {
        let ingest = IngestConfig::default();
        let source = Arc::new(source);
        let runner = Arc::new(runner);
        let clock = Arc::new(ManualClock::new(t0()));

        let accumulator =
            WindowedAccumulator::new(AccumulatorConfig::default(), ingest.target_timezone);
        let publisher = Publisher::new(
            storage,
            CsvLayout::from_ingest(&ingest),
            PublishConfig::default(),
        );
        let pipeline = Pipeline::new(
            source.clone(),
            ingest,
            accumulator,
            publisher,
            TransformTrigger::new(runner.clone()),
        )
        .with_clock(clock.clone());

        Self {
            pipeline,
            source,
            runner,
            clock,
        }
    }

    /// Advance the clock one poll interval.
    pub fn tick(&self) {
        self.clock.advance(Duration::seconds(60));
    }
}

/// Rows of a CSV body as maps keyed by header.
pub fn csv_rows(body: &[u8]) -> Vec<std::collections::HashMap<String, String>> {
    let mut reader = csv::Reader::from_reader(body);
    let headers = reader.headers().expect("header row").clone();
    reader
        .records()
        .map(|row| {
            let row = row.expect("csv row");
            headers
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect()
        })
        .collect()
}
