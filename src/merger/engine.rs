use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::buffer::WriteBuffer;
use super::{MergeError, MergeSettings, MergeSummary, VolumePolicy};
use crate::capture::{CaptureFileDescriptor, CaptureTimestamp};
use crate::flow::{parse, FlowKey, FlowRecord, ParsedLine};
use crate::storage::{FlowStore, FlowUpdate, StorageError, StoredFlow, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub missing: bool,
    pub inserted: u64,
    pub merged: u64,
    pub ipv6_skipped: u64,
    pub malformed: u64,
    pub elapsed: Duration,
}

fn accumulate(existing: &FlowRecord, fragment: &FlowRecord) -> Volume {
    Volume {
        packets_src: existing.packets_src.saturating_add(fragment.packets_src),
        bytes_src: existing.bytes_src.saturating_add(fragment.bytes_src),
        packets_dst: existing.packets_dst.saturating_add(fragment.packets_dst),
        bytes_dst: existing.bytes_dst.saturating_add(fragment.bytes_dst),
        packets_total: existing.packets_total.saturating_add(fragment.packets_total),
        bytes_total: existing.bytes_total.saturating_add(fragment.bytes_total),
    }
}

/// Reassembles flows cut by capture boundaries.
///
/// Only the latest flow of a key is ever extended. That is sound as long as
/// captures come in non-decreasing start order and lines in file order, the
/// engine rejects captures that break the first rule.
pub struct FlowMergeEngine<S: FlowStore> {
    store: Arc<S>,
    settings: MergeSettings,
    latest: HashMap<FlowKey, StoredFlow>,
    buffer: WriteBuffer,
    previous: Option<(String, CaptureTimestamp)>,
}

impl<S: FlowStore> FlowMergeEngine<S> {
    pub fn new(store: Arc<S>, settings: MergeSettings) -> Self {
        Self {
            store,
            settings,
            latest: HashMap::new(),
            buffer: WriteBuffer::new(),
            previous: None,
        }
    }

    /// Latest flow of `key`, looking at the flows touched in this run before
    /// asking storage.
    async fn latest(&self, key: &FlowKey) -> Result<Option<StoredFlow>, StorageError> {
        match self.latest.get(key) {
            Some(stored) => Ok(Some(stored.clone())),
            None => self.store.find_latest(key).await,
        }
    }

    fn insert(&mut self, flow: FlowRecord) {
        let stored = StoredFlow::new(flow);
        self.latest.insert(stored.flow.key(), stored.clone());
        self.buffer.insert(stored);
    }

    /// Places one fragment on the timeline at `offset_ms` and either extends
    /// the latest flow of its key or starts a new one.
    pub async fn merge_fragment(
        &mut self,
        mut fragment: FlowRecord,
        offset_ms: i64,
    ) -> Result<MergeOutcome, StorageError> {
        fragment.start_ms += offset_ms;
        let fragment_end = fragment.end_ms();
        let key = fragment.key();

        let latest = self.latest(&key).await?;
        let outcome = match latest {
            Some(mut existing)
                if fragment.start_ms - existing.flow.end_ms() <= self.settings.timeout_limit_ms =>
            {
                let end = existing.flow.end_ms().max(fragment_end);
                let volume = match self.settings.volume_policy {
                    VolumePolicy::KeepFirst => None,
                    VolumePolicy::Accumulate => Some(accumulate(&existing.flow, &fragment)),
                };
                let update = FlowUpdate {
                    id: existing.id.clone(),
                    duration_ms: (end - existing.flow.start_ms) as u64,
                    volume,
                };

                update.apply(&mut existing.flow);
                self.latest.insert(key, existing);
                self.buffer.update(update);
                MergeOutcome::Merged
            }
            Some(existing) => {
                debug!(
                    "gap of {}ms after flow {}, starting a new one",
                    fragment.start_ms - existing.flow.end_ms(),
                    existing.id
                );
                self.insert(fragment);
                MergeOutcome::Inserted
            }
            None => {
                self.insert(fragment);
                MergeOutcome::Inserted
            }
        };

        if self.buffer.len() >= self.settings.batch_size.max(1) {
            self.flush().await?;
        }

        Ok(outcome)
    }

    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let ops = self.buffer.drain();
        debug!("writing {} buffered operations", ops.len());
        self.store.bulk_write(ops).await
    }

    fn check_order(&mut self, capture: &CaptureFileDescriptor) -> Result<(), MergeError> {
        if let Some((previous, start)) = &self.previous {
            if capture.start < *start {
                return Err(MergeError::OutOfOrder {
                    previous: previous.clone(),
                    next: capture.name.clone(),
                });
            }
        }

        self.previous = Some((capture.name.clone(), capture.start));
        Ok(())
    }

    /// Merges every line of one capture file and flushes what is left
    /// buffered.
    pub async fn merge_file(
        &mut self,
        capture: &CaptureFileDescriptor,
    ) -> Result<FileSummary, MergeError> {
        self.check_order(capture)?;

        let started = Instant::now();
        let mut summary = FileSummary {
            name: capture.name.clone(),
            ..FileSummary::default()
        };

        let file = match File::open(&capture.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "capture {} not found at {}, skipping",
                    capture.name,
                    capture.path.display()
                );
                summary.missing = true;
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "merging {} with offset {}ms",
            capture.name, capture.offset_ms
        );

        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            match parse(&line, self.settings.allow_ipv6) {
                Ok(ParsedLine::Flow(fragment)) => {
                    match self.merge_fragment(fragment, capture.offset_ms).await? {
                        MergeOutcome::Inserted => summary.inserted += 1,
                        MergeOutcome::Merged => summary.merged += 1,
                    }
                }
                Ok(ParsedLine::Ipv6Skipped) => summary.ipv6_skipped += 1,
                Err(e) if self.settings.skip_malformed => {
                    warn!("skipping line {line_no} of {}: {e}", capture.name);
                    summary.malformed += 1;
                }
                Err(e) => {
                    return Err(MergeError::Parse {
                        file: capture.name.clone(),
                        line: line_no,
                        source: e,
                    })
                }
            }
        }

        self.flush().await?;
        summary.elapsed = started.elapsed();
        info!(
            "{}: {} inserted, {} merged, {} ipv6 skipped, {} malformed in {:.2?}",
            summary.name,
            summary.inserted,
            summary.merged,
            summary.ipv6_skipped,
            summary.malformed,
            summary.elapsed
        );

        Ok(summary)
    }

    /// Merges the captures in the given order. Preloaded captures only take
    /// part in the ordering check.
    pub async fn run(
        &mut self,
        captures: &[CaptureFileDescriptor],
    ) -> Result<MergeSummary, MergeError> {
        self.store.create_index().await?;

        let mut summary = MergeSummary::default();
        for capture in captures {
            if capture.preloaded {
                if capture.offset_ms != 0 {
                    warn!(
                        "preloaded capture {} is {}ms off the base timeline",
                        capture.name, capture.offset_ms
                    );
                }
                self.check_order(capture)?;
                continue;
            }

            summary.files.push(self.merge_file(capture).await?);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{calibrate, CaptureSettings};
    use crate::flow::FlowAddr;
    use crate::storage::memory::MemoryStore;
    use crate::storage::mock::MockStore;
    use crate::storage::WriteOp;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::path::PathBuf;
    use test_case::test_case;

    fn fragment(src_port: u16, start_ms: i64, duration_ms: u64, bytes: u64) -> FlowRecord {
        FlowRecord {
            src: FlowAddr::V4(167_772_161),
            src_port,
            dst: FlowAddr::V4(167_772_162),
            dst_port: 80,
            packets_src: 1,
            bytes_src: bytes,
            packets_dst: 1,
            bytes_dst: bytes,
            packets_total: 2,
            bytes_total: 2 * bytes,
            start_ms,
            duration_ms,
        }
    }

    fn settings() -> MergeSettings {
        MergeSettings::default()
    }

    async fn store_with(flows: Vec<FlowRecord>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_many(flows.into_iter().map(StoredFlow::new).collect())
            .await
            .unwrap();
        store
    }

    fn durations(store: &MemoryStore) -> Vec<(i64, u64)> {
        store
            .snapshot()
            .unwrap()
            .iter()
            .map(|s| (s.flow.start_ms, s.flow.duration_ms))
            .collect()
    }

    #[tokio::test]
    async fn test_gap_over_timeout_starts_new_flow() {
        let store = store_with(vec![fragment(1, 0, 100, 10)]).await;
        let mut engine = FlowMergeEngine::new(store.clone(), settings());

        let outcome = engine
            .merge_fragment(fragment(1, 500, 10, 10), 100_000)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(durations(&store), vec![(0, 100), (100_500, 10)]);
    }

    #[tokio::test]
    async fn test_small_gap_extends_duration() {
        let store = store_with(vec![fragment(1, 0, 100, 10)]).await;
        let mut engine = FlowMergeEngine::new(store.clone(), settings());

        let outcome = engine
            .merge_fragment(fragment(1, 10, 50, 99), 100)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        assert_eq!(outcome, MergeOutcome::Merged);
        let flows = store.snapshot().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].flow.start_ms, 0);
        assert_eq!(flows[0].flow.duration_ms, 160);
        assert_eq!(flows[0].flow.bytes_total, 20);
    }

    #[test_case(20_000, MergeOutcome::Merged; "gap equal to the limit merges")]
    #[test_case(20_001, MergeOutcome::Inserted; "gap above the limit starts a new flow")]
    #[tokio::test]
    async fn test_timeout_boundary(gap: i64, expected: MergeOutcome) {
        let store = store_with(vec![fragment(1, 0, 100, 10)]).await;
        let mut engine = FlowMergeEngine::new(store, settings());

        let outcome = engine
            .merge_fragment(fragment(1, 100 + gap, 10, 10), 0)
            .await
            .unwrap();
        assert_eq!(outcome, expected);
    }

    #[tokio::test]
    async fn test_contained_fragment_keeps_duration() {
        let store = store_with(vec![fragment(1, 0, 1_000, 10)]).await;
        let mut engine = FlowMergeEngine::new(store.clone(), settings());

        engine
            .merge_fragment(fragment(1, 100, 10, 10), 0)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        assert_eq!(durations(&store), vec![(0, 1_000)]);
    }

    #[tokio::test]
    async fn test_accumulate_policy_adds_counters() {
        let store = store_with(vec![fragment(1, 0, 100, 10)]).await;
        let mut merge_settings = settings();
        merge_settings.volume_policy = VolumePolicy::Accumulate;
        let mut engine = FlowMergeEngine::new(store.clone(), merge_settings);

        engine
            .merge_fragment(fragment(1, 150, 50, 5), 0)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        let flow = &store.snapshot().unwrap()[0].flow;
        assert_eq!(flow.duration_ms, 200);
        assert_eq!(flow.packets_total, 4);
        assert_eq!(flow.bytes_src, 15);
        assert_eq!(flow.bytes_total, 30);
    }

    #[tokio::test]
    async fn test_buffered_flows_are_visible_before_flush() {
        let mut store = MockStore::new();
        store
            .expect_find_latest()
            .times(1)
            .returning(|_| Ok(None));
        store
            .expect_bulk_write()
            .times(1)
            .withf(|ops| match ops.as_slice() {
                [WriteOp::Insert(s)] => s.flow.start_ms == 1_000 && s.flow.duration_ms == 600,
                _ => false,
            })
            .returning(|_| Ok(()));
        let mut engine = FlowMergeEngine::new(Arc::new(store), settings());

        let first = engine
            .merge_fragment(fragment(1, 0, 100, 10), 1_000)
            .await
            .unwrap();
        let second = engine
            .merge_fragment(fragment(1, 500, 100, 10), 1_000)
            .await
            .unwrap();
        engine.flush().await.unwrap();

        assert_eq!(first, MergeOutcome::Inserted);
        assert_eq!(second, MergeOutcome::Merged);
    }

    #[tokio::test]
    async fn test_flushes_every_batch() {
        let mut store = MockStore::new();
        store.expect_find_latest().returning(|_| Ok(None));
        store
            .expect_bulk_write()
            .times(3)
            .withf(|ops| ops.len() <= 2)
            .returning(|_| Ok(()));
        let mut merge_settings = settings();
        merge_settings.batch_size = 2;
        let mut engine = FlowMergeEngine::new(Arc::new(store), merge_settings);

        for port in 0..5 {
            engine
                .merge_fragment(fragment(port, 0, 10, 10), 0)
                .await
                .unwrap();
        }
        engine.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_failure_aborts() {
        let mut store = MockStore::new();
        store
            .expect_find_latest()
            .returning(|_| Err(StorageError::Database(String::from("gone"))));
        let mut engine = FlowMergeEngine::new(Arc::new(store), settings());

        let result = engine.merge_fragment(fragment(1, 0, 10, 10), 0).await;
        assert_eq!(result, Err(StorageError::Database(String::from("gone"))));
    }

    fn capture_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "reconstructor-merge-{}-{}",
            std::process::id(),
            name
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn capture(name: &str, path: PathBuf, start: &str, preloaded: bool) -> CaptureSettings {
        CaptureSettings {
            name: name.to_owned(),
            path,
            start: start.to_owned(),
            end: String::from("999999999"),
            preloaded,
        }
    }

    #[tokio::test]
    async fn test_run_over_captures() {
        // base holds a flow ending at 59,9s; the next capture starts 60s later
        let store = store_with(vec![fragment(1000, 59_000, 900, 10)]).await;
        let second = capture_file(
            "second.txt",
            "10.0.0.1:1000 <-> 10.0.0.2:80 1 10 bytes 1 10 bytes 2 20 bytes 0,010 1,5\n\
             10.0.0.1:2000 <-> 10.0.0.2:80 1 10 bytes 1 10 bytes 2 20 bytes 0 1\n\
             2001:db8::1:1 <-> 2001:db8::2:2 1 1 bytes 1 1 bytes 2 2 bytes 0 0\n\
             10.0.0.1:3000 <-> 10.0.0.2:80 1 10 bytes 1 10 bytes 2 20 bytes 9223372036854775,807 1\n\
             broken\n",
        );
        let captures = calibrate(
            &[
                capture("base", PathBuf::from("unused"), "100.0", true),
                capture("second", second.clone(), "160.0", false),
                capture("third", PathBuf::from("/nonexistent/third.txt"), "220.0", false),
            ],
            "base",
        )
        .unwrap();

        let mut engine = FlowMergeEngine::new(store.clone(), settings());
        let summary = engine.run(&captures).await.unwrap();
        std::fs::remove_file(&second).unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.files[0].merged, 1);
        assert_eq!(summary.files[0].inserted, 1);
        assert_eq!(summary.files[0].ipv6_skipped, 1);
        // an out of range start is skipped like any other bad line
        assert_eq!(summary.files[0].malformed, 2);
        assert!(summary.files[1].missing);

        assert_eq!(durations(&store), vec![(59_000, 2_510), (60_000, 1_000)]);
    }

    #[tokio::test]
    async fn test_out_of_order_capture_rejected() {
        let mut store = MockStore::new();
        store.expect_create_index().returning(|| Ok(()));
        let mut engine = FlowMergeEngine::new(Arc::new(store), settings());

        let mut captures = calibrate(
            &[
                capture("a", PathBuf::from("/nonexistent/a"), "100.0", false),
                capture("b", PathBuf::from("/nonexistent/b"), "200.0", false),
            ],
            "a",
        )
        .unwrap();
        captures.reverse();

        match engine.run(&captures).await {
            Err(MergeError::OutOfOrder { previous, next }) => {
                assert_eq!((previous.as_str(), next.as_str()), ("b", "a"));
            }
            other => panic!("expected out of order error, got {other:?}"),
        }
    }
}
