//! # Import pipeline
//!
//! An import is an ordered list of named steps (build the ways file,
//! generate the grid index, classify water, ...). The driver runs them
//! in sequence, logs outcome and timing per step, and stops at the first
//! failure.
//!
//! The module also hosts the coordinate deduplication stage that
//! prepares raw extract data for the later steps: distinct input nodes
//! may share the exact same position, and every consumer downstream
//! needs a serial number to tell them apart.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;
use std::time::{Duration, Instant};

use geo::Coord;
use thiserror::Error;
use tracing::{error, info};

use crate::ObjectId;
use crate::area_index::{AreaIndexError, GridIndexParameter};
use crate::progress::{Breaker, Progress};
use crate::water::{WaterIndexError, WaterIndexParameter};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    AreaIndex(#[from] AreaIndexError),
    #[error(transparent)]
    WaterIndex(#[from] WaterIndexError),
    #[error("import aborted")]
    Aborted,
    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ImportError>,
    },
}

/// Configuration for a whole import run.
///
/// Constructed once and passed by reference into every step.
#[derive(Debug, Clone)]
pub struct ImportParameter {
    /// Directory all produced files are written to.
    pub destination_directory: PathBuf,
    /// Level selection and fill-rate thresholds for the grid indexes.
    pub grid_index: GridIndexParameter,
    /// Level range and default assumption for the water index.
    pub water_index: WaterIndexParameter,
    /// Position ids per page in the coordinate deduplication stage.
    ///
    /// All occurrences of one id land in the same page, so the page span
    /// bounds both memory use and sort cost.
    pub coordinate_page_span: u64,
    /// Capacity of the channels between the deduplication workers.
    pub coordinate_queue_depth: usize,
}

impl Default for ImportParameter {
    fn default() -> Self {
        Self {
            destination_directory: PathBuf::from("."),
            grid_index: GridIndexParameter::default(),
            water_index: WaterIndexParameter::default(),
            coordinate_page_span: 100_000_000,
            coordinate_queue_depth: 64,
        }
    }
}

/// Timing record for one executed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub duration: Duration,
}

/// Timing records for a completed import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub steps: Vec<StepReport>,
}

type StepFn<'a> = Box<dyn FnOnce(&ImportParameter, &mut dyn Progress) -> Result<(), ImportError> + 'a>;

struct Step<'a> {
    name: String,
    run: StepFn<'a>,
}

/// Runs named import steps in order, stopping at the first failure.
pub struct Importer<'a> {
    parameter: ImportParameter,
    steps: Vec<Step<'a>>,
}

impl<'a> Importer<'a> {
    pub fn new(parameter: ImportParameter) -> Self {
        Self {
            parameter,
            steps: Vec::new(),
        }
    }

    pub fn parameter(&self) -> &ImportParameter {
        &self.parameter
    }

    /// Appends a step. Steps execute in registration order.
    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        run: impl FnOnce(&ImportParameter, &mut dyn Progress) -> Result<(), ImportError> + 'a,
    ) {
        self.steps.push(Step {
            name: name.into(),
            run: Box::new(run),
        });
    }

    /// Executes all steps.
    ///
    /// The breaker is polled between steps; a running step finishes
    /// before the abort takes effect.
    ///
    /// # Errors
    ///
    /// Returns the first step failure, wrapped with the step name, or
    /// [`ImportError::Aborted`] when the breaker fired.
    pub fn run(
        self,
        progress: &mut dyn Progress,
        breaker: Option<&Breaker>,
    ) -> Result<ImportReport, ImportError> {
        let total = self.steps.len();
        let mut report = ImportReport::default();

        for (index, step) in self.steps.into_iter().enumerate() {
            if breaker.is_some_and(Breaker::is_aborted) {
                return Err(ImportError::Aborted);
            }

            info!(step = index + 1, total, name = step.name, "starting step");
            progress.set_action(&step.name);

            let started = Instant::now();
            let result = (step.run)(&self.parameter, progress);
            let duration = started.elapsed();

            match result {
                Ok(()) => {
                    info!(
                        step = index + 1,
                        name = step.name,
                        elapsed = ?duration,
                        "step finished"
                    );
                    report.steps.push(StepReport {
                        name: step.name,
                        duration,
                    });
                }
                Err(source) => {
                    error!(
                        step = index + 1,
                        name = step.name,
                        error = %source,
                        "step failed, stopping import"
                    );
                    return Err(ImportError::Step {
                        step: step.name,
                        source: Box::new(source),
                    });
                }
            }
        }

        Ok(report)
    }
}

/// A source of raw node coordinates.
///
/// Sources must produce the same sequence on every call; the import may
/// scan more than once.
pub trait CoordinateSource {
    /// Invokes `visit` once per raw node.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying storage.
    fn scan(&mut self, visit: &mut dyn FnMut(ObjectId, Coord<f64>)) -> Result<(), ImportError>;
}

/// Packs a coordinate into a position id.
///
/// Positions are quantized to 1e-7 degrees, matching the resolution of
/// the raw extract, so nodes imported with the same position collide on
/// the same id.
pub fn position_id(coord: Coord<f64>) -> ObjectId {
    #[expect(clippy::cast_possible_truncation)]
    #[expect(clippy::cast_sign_loss)]
    let quantize = |value: f64| ((value * 1e7).round()) as u64;
    // Latitude spans 31 bits after the shift into [0,180], longitude 32.
    (quantize(coord.y + 90.0) << 32) | quantize(coord.x + 180.0)
}

/// Serial numbers for nodes sharing a position.
///
/// Only duplicated positions are tracked; a position seen exactly once
/// always gets serial 1 without occupying memory.
#[derive(Debug, Default)]
pub struct SerialIdManager {
    serials: BTreeMap<ObjectId, u8>,
}

impl SerialIdManager {
    pub fn mark_duplicate(&mut self, id: ObjectId) {
        self.serials.insert(id, 1);
    }

    pub fn is_duplicate(&self, id: ObjectId) -> bool {
        self.serials.contains_key(&id)
    }

    /// The serial to assign to the next node at this position.
    ///
    /// Returns `None` when more than 254 nodes share the position; such
    /// nodes are dropped by the caller with an error log.
    pub fn next_serial(&mut self, id: ObjectId) -> Option<u8> {
        let Some(serial) = self.serials.get_mut(&id) else {
            return Some(1);
        };
        if *serial == u8::MAX {
            return None;
        }
        let current = *serial;
        *serial += 1;
        Some(current)
    }

    /// Number of duplicated positions.
    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

type IdPage = Vec<ObjectId>;

/// Finds positions shared by more than one node.
///
/// Three workers connected by bounded channels, terminating on channel
/// close:
///
/// - the producer scans the source and groups position ids into pages
///   (all occurrences of one id land in the same page),
/// - the sorter sorts each page,
/// - the consumer walks each sorted page and marks ids appearing more
///   than once.
///
/// A producer failure drops its sender, which closes the downstream
/// channels and lets the other workers drain and exit.
///
/// # Errors
///
/// Propagates source scan errors.
pub fn find_duplicate_coordinates<S: CoordinateSource>(
    source: &mut S,
    parameter: &ImportParameter,
    progress: &mut dyn Progress,
) -> Result<SerialIdManager, ImportError> {
    progress.set_action("Searching for duplicate coordinates");

    let (raw_tx, raw_rx) = sync_channel::<IdPage>(parameter.coordinate_queue_depth);
    let (sorted_tx, sorted_rx) = sync_channel::<IdPage>(parameter.coordinate_queue_depth);

    let page_span = parameter.coordinate_page_span.max(1);

    let (scan_result, manager) = thread::scope(|scope| {
        scope.spawn(move || sort_pages(&raw_rx, &sorted_tx));
        let consumer = scope.spawn(move || collect_duplicates(&sorted_rx));

        let scan_result = produce_id_pages(source, page_span, &raw_tx);
        // Closing the producer channel lets the downstream workers finish.
        drop(raw_tx);

        (scan_result, consumer.join())
    });

    scan_result?;
    let manager = manager.unwrap_or_default();
    info!(duplicates = manager.len(), "duplicate coordinate scan done");
    Ok(manager)
}

fn produce_id_pages<S: CoordinateSource>(
    source: &mut S,
    page_span: u64,
    out: &SyncSender<IdPage>,
) -> Result<(), ImportError> {
    let mut pages: BTreeMap<u64, IdPage> = BTreeMap::new();

    source.scan(&mut |_, coord| {
        let id = position_id(coord);
        pages.entry(id / page_span).or_default().push(id);
    })?;

    for page in pages.into_values() {
        // A closed channel means the downstream workers are gone; the
        // consumer result will reflect whatever they processed.
        if out.send(page).is_err() {
            break;
        }
    }
    Ok(())
}

fn sort_pages(input: &Receiver<IdPage>, out: &SyncSender<IdPage>) {
    while let Ok(mut page) = input.recv() {
        page.sort_unstable();
        if out.send(page).is_err() {
            break;
        }
    }
}

fn collect_duplicates(input: &Receiver<IdPage>) -> SerialIdManager {
    let mut manager = SerialIdManager::default();

    while let Ok(page) = input.recv() {
        let mut last: Option<ObjectId> = None;
        let mut marked = false;
        for id in page {
            if last == Some(id) {
                if !marked {
                    manager.mark_duplicate(id);
                    marked = true;
                }
            } else {
                marked = false;
            }
            last = Some(id);
        }
    }

    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogProgress;
    use geo::coord;
    use std::sync::Mutex;

    struct VecCoordSource(Vec<(ObjectId, Coord<f64>)>);

    impl CoordinateSource for VecCoordSource {
        fn scan(
            &mut self,
            visit: &mut dyn FnMut(ObjectId, Coord<f64>),
        ) -> Result<(), ImportError> {
            for (id, coord) in &self.0 {
                visit(*id, *coord);
            }
            Ok(())
        }
    }

    struct FailingSource;

    impl CoordinateSource for FailingSource {
        fn scan(
            &mut self,
            _visit: &mut dyn FnMut(ObjectId, Coord<f64>),
        ) -> Result<(), ImportError> {
            Err(ImportError::Io(std::io::Error::other("disk on fire")))
        }
    }

    #[test]
    fn steps_run_in_order_and_are_timed() {
        let executed: Mutex<Vec<&str>> = Mutex::new(Vec::new());
        let mut importer = Importer::new(ImportParameter::default());
        importer.add_step("first", |_, _| {
            executed.lock().unwrap().push("first");
            Ok(())
        });
        importer.add_step("second", |_, _| {
            executed.lock().unwrap().push("second");
            Ok(())
        });

        let mut progress = LogProgress::default();
        let report = importer.run(&mut progress, None).unwrap();

        assert_eq!(*executed.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].name, "first");
        assert_eq!(report.steps[1].name, "second");
    }

    #[test]
    fn failure_stops_later_steps() {
        let executed: Mutex<Vec<&str>> = Mutex::new(Vec::new());
        let mut importer = Importer::new(ImportParameter::default());
        importer.add_step("ok", |_, _| {
            executed.lock().unwrap().push("ok");
            Ok(())
        });
        importer.add_step("broken", |_, _| {
            Err(ImportError::Io(std::io::Error::other("boom")))
        });
        importer.add_step("never", |_, _| {
            executed.lock().unwrap().push("never");
            Ok(())
        });

        let mut progress = LogProgress::default();
        let result = importer.run(&mut progress, None);

        match result {
            Err(ImportError::Step { step, .. }) => assert_eq!(step, "broken"),
            other => panic!("expected step failure, got {other:?}"),
        }
        assert_eq!(*executed.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn aborted_breaker_prevents_execution() {
        let executed: Mutex<Vec<&str>> = Mutex::new(Vec::new());
        let mut importer = Importer::new(ImportParameter::default());
        importer.add_step("work", |_, _| {
            executed.lock().unwrap().push("work");
            Ok(())
        });

        let breaker = Breaker::new();
        breaker.abort();
        let mut progress = LogProgress::default();
        let result = importer.run(&mut progress, Some(&breaker));

        assert!(matches!(result, Err(ImportError::Aborted)));
        assert!(executed.lock().unwrap().is_empty());
    }

    #[test]
    fn position_id_quantizes_to_1e7() {
        let a = coord! { x: 13.3912345, y: 52.5170365 };
        let b = coord! { x: 13.3912345, y: 52.5170365 };
        let c = coord! { x: 13.3912346, y: 52.5170365 };
        assert_eq!(position_id(a), position_id(b));
        assert_ne!(position_id(a), position_id(c));
    }

    #[test]
    fn duplicates_are_found_across_pages() {
        let shared = coord! { x: 10.0, y: 50.0 };
        let far = coord! { x: -120.0, y: -33.0 };
        let mut source = VecCoordSource(vec![
            (1, shared),
            (2, far),
            (3, coord! { x: 10.1, y: 50.0 }),
            (4, shared),
            (5, far),
            (6, shared),
        ]);

        // A tiny page span spreads the ids over many pages; equal ids
        // must still meet in one page.
        let parameter = ImportParameter {
            coordinate_page_span: 7,
            coordinate_queue_depth: 2,
            ..ImportParameter::default()
        };
        let mut progress = LogProgress::default();
        let manager =
            find_duplicate_coordinates(&mut source, &parameter, &mut progress).unwrap();

        assert_eq!(manager.len(), 2);
        assert!(manager.is_duplicate(position_id(shared)));
        assert!(manager.is_duplicate(position_id(far)));
        assert!(!manager.is_duplicate(position_id(coord! { x: 10.1, y: 50.0 })));
    }

    #[test]
    fn serials_count_up_for_duplicates_only() {
        let mut manager = SerialIdManager::default();
        manager.mark_duplicate(42);

        assert_eq!(manager.next_serial(42), Some(1));
        assert_eq!(manager.next_serial(42), Some(2));
        assert_eq!(manager.next_serial(42), Some(3));
        // Unique positions always get serial 1.
        assert_eq!(manager.next_serial(7), Some(1));
        assert_eq!(manager.next_serial(7), Some(1));
    }

    #[test]
    fn serial_overflow_is_reported() {
        let mut manager = SerialIdManager::default();
        manager.mark_duplicate(1);
        for _ in 1..u8::MAX {
            assert!(manager.next_serial(1).is_some());
        }
        assert_eq!(manager.next_serial(1), None);
    }

    #[test]
    fn failing_source_propagates_and_shuts_down_workers() {
        let parameter = ImportParameter::default();
        let mut progress = LogProgress::default();
        let result = find_duplicate_coordinates(&mut FailingSource, &parameter, &mut progress);
        assert!(matches!(result, Err(ImportError::Io(_))));
    }
}
