use async_trait::async_trait;
use futures::stream;
use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{FlowStore, FlowStream, PopulationFilter, StorageError, StoredFlow, WriteOp};
use crate::flow::FlowKey;

#[derive(Debug, Default)]
struct Documents {
    flows: Vec<StoredFlow>,
    by_id: HashMap<String, usize>,
    by_key: HashMap<FlowKey, Vec<usize>>,
}

impl Documents {
    fn insert(&mut self, stored: StoredFlow) {
        let position = self.flows.len();
        self.by_id.insert(stored.id.clone(), position);
        self.by_key
            .entry(stored.flow.key())
            .or_default()
            .push(position);
        self.flows.push(stored);
    }
}

/// Flow store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<Documents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> Result<MutexGuard<Documents>, StorageError> {
        self.documents
            .lock()
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    /// Every stored flow ordered by key and start.
    pub fn snapshot(&self) -> Result<Vec<StoredFlow>, StorageError> {
        let mut flows = self.documents()?.flows.clone();
        flows.sort_by_key(|stored| {
            let f = &stored.flow;
            (
                f.src.to_storage(),
                f.src_port,
                f.dst.to_storage(),
                f.dst_port,
                f.start_ms,
            )
        });
        Ok(flows)
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn create_index(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.documents()?.flows.len() as u64)
    }

    async fn truncate(&self) -> Result<(), StorageError> {
        *self.documents()? = Documents::default();
        Ok(())
    }

    async fn find_latest(&self, key: &FlowKey) -> Result<Option<StoredFlow>, StorageError> {
        let documents = self.documents()?;
        let latest = documents.by_key.get(key).and_then(|positions| {
            positions
                .iter()
                .map(|&p| &documents.flows[p])
                .max_by_key(|stored| stored.flow.start_ms)
        });

        Ok(latest.cloned())
    }

    async fn insert_many(&self, flows: Vec<StoredFlow>) -> Result<(), StorageError> {
        let mut documents = self.documents()?;
        debug!("inserting {} flows", flows.len());
        for stored in flows {
            documents.insert(stored);
        }
        Ok(())
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut documents = self.documents()?;
        for op in ops {
            match op {
                WriteOp::Insert(stored) => documents.insert(stored),
                WriteOp::Update(update) => {
                    let position = *documents.by_id.get(&update.id).ok_or_else(|| {
                        StorageError::Database(format!("no flow with id {}", update.id))
                    })?;
                    update.apply(&mut documents.flows[position].flow);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, filter: &PopulationFilter) -> FlowStream {
        let selected = self.documents().map(|documents| {
            documents
                .flows
                .iter()
                .filter(|stored| filter.matches(&stored.flow))
                .cloned()
                .map(Ok)
                .collect::<Vec<Result<StoredFlow, StorageError>>>()
        });

        match selected {
            Ok(flows) => Box::pin(stream::iter(flows)),
            Err(e) => Box::pin(stream::iter(vec![Err(e)])),
        }
    }
}
