//! Key/value VM runner.
//!
//! Request payloads are UTF-8 commands: `key=value` stores a value and
//! `key` alone deletes it. Anything else fails the request without failing
//! the batch.

use keel_consensus::{RequestResult, VmError, VmOutput, VmRunner, VmTask};
use keel_state::{Block, Mutation, StateUpdate};

/// Key under which each block records the agreed entropy.
pub const ENTROPY_KEY: &str = "entropy";

/// Deterministic key/value VM.
#[derive(Debug, Default, Clone, Copy)]
pub struct KvVm;

fn parse(payload: &[u8]) -> Result<Mutation, String> {
    let text = std::str::from_utf8(payload).map_err(|e| format!("payload is not utf-8: {e}"))?;
    if text.is_empty() {
        return Err("empty payload".into());
    }
    Ok(match text.split_once('=') {
        Some((key, _)) if key.is_empty() => return Err("empty key".into()),
        Some((key, value)) => Mutation::set(key, value),
        None => Mutation::del(text),
    })
}

impl VmRunner for KvVm {
    fn run(&self, task: VmTask) -> Result<VmOutput, VmError> {
        let mut updates = Vec::with_capacity(task.requests.len() + 1);
        let mut results = Vec::with_capacity(task.requests.len());
        for request in &task.requests {
            let (mutations, error) = match parse(&request.payload) {
                Ok(mutation) => (vec![mutation], None),
                Err(e) => (Vec::new(), Some(e)),
            };
            updates.push(StateUpdate::for_request(request.id, task.timestamp_ms, mutations));
            results.push(RequestResult {
                request_id: request.id,
                error,
            });
        }
        updates.push(StateUpdate {
            request_id: None,
            timestamp_ms: task.timestamp_ms,
            mutations: vec![Mutation::set(ENTROPY_KEY, task.entropy.as_bytes().to_vec())],
        });

        let block = Block::new(task.state.index() + 1, task.timestamp_ms, updates)
            .map_err(|e| VmError(e.to_string()))?;
        let next_state = task
            .state
            .apply_block(&block)
            .map_err(|e| VmError(e.to_string()))?;
        let essence = task.essence_for(&block, &next_state);
        Ok(VmOutput {
            block,
            next_state,
            essence,
            results,
        })
    }
}
