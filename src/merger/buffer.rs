use std::collections::HashMap;

use crate::storage::{FlowId, FlowUpdate, StoredFlow, WriteOp};

/// Pending writes of the merge, coalesced per flow.
///
/// An update of a flow whose insert is still pending is folded into that
/// insert, and a later update of the same flow replaces the earlier one.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    ops: Vec<WriteOp>,
    positions: HashMap<FlowId, usize>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stored: StoredFlow) {
        self.positions.insert(stored.id.clone(), self.ops.len());
        self.ops.push(WriteOp::Insert(stored));
    }

    pub fn update(&mut self, update: FlowUpdate) {
        let position = match self.positions.get(&update.id) {
            Some(&position) => position,
            None => {
                self.positions.insert(update.id.clone(), self.ops.len());
                self.ops.push(WriteOp::Update(update));
                return;
            }
        };

        match &mut self.ops[position] {
            WriteOp::Insert(stored) => update.apply(&mut stored.flow),
            pending @ WriteOp::Update(_) => *pending = WriteOp::Update(update),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn drain(&mut self) -> Vec<WriteOp> {
        self.positions.clear();
        std::mem::take(&mut self.ops)
    }
}
