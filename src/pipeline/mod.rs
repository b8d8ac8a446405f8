//! Snapshot pipeline
//!
//! Connection handlers hand parsed snapshots to a bounded queue. A single
//! worker drains it and, per snapshot, runs diff → publish → replace to
//! completion before looking at the next one. Being the only consumer makes
//! the worker the sole owner of the baseline, so two snapshots can never be
//! diffed against the same stale state or have their publishes interleaved.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mqtt::publisher::{MqttPublish, PublishReport, ReadingsPublisher};
use crate::readings::delta::DeltaDetector;
use crate::readings::ReadingSnapshot;

pub struct ReadingsPipeline<P> {
    detector: DeltaDetector,
    publisher: ReadingsPublisher<P>,
}

impl<P> ReadingsPipeline<P>
where
    P: MqttPublish + 'static,
{
    pub fn new(publisher: ReadingsPublisher<P>) -> Self {
        Self {
            detector: DeltaDetector::new(),
            publisher,
        }
    }

    /// Publishes what changed since the previous snapshot, then makes this
    /// snapshot the baseline. Empty snapshots are ignored entirely.
    pub async fn process(&mut self, snapshot: ReadingSnapshot) -> PublishReport {
        if snapshot.is_empty() {
            debug!("Ignoring empty snapshot");
            return PublishReport::default();
        }

        let changes = self.detector.diff(&snapshot);
        debug!(
            "{} of {} readings changed",
            changes.len(),
            snapshot.len()
        );
        let report = self.publisher.publish_changes(&changes).await;
        self.detector.replace(snapshot);
        report
    }

    pub async fn run(mut self, mut snapshots: mpsc::Receiver<ReadingSnapshot>) {
        info!("Readings pipeline started");
        while let Some(snapshot) = snapshots.recv().await {
            self.process(snapshot).await;
        }
        info!("Readings pipeline stopped, all producers gone");
    }

    /// Starts the worker; the returned sender is the only way in
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<ReadingSnapshot>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    pub fn detector(&self) -> &DeltaDetector {
        &self.detector
    }
}
