use super::context::Context;
use super::log::Log;
use crate::errcorrupt;
use crate::state::State;

use ::log::{debug, error};
use parking_lot::Mutex;
use std::sync::Arc;

/// Runs the apply worker: waits until committed entries are ready, then
/// applies each one in index order to the state machine and signals waiters.
/// An apply failure is fatal to the replica, so the worker forces shutdown
/// and exits; blocked writers observe Error::Abort.
pub fn run(context: Arc<Context>, log: Arc<Log>, state: Arc<Mutex<Box<dyn State>>>) {
    while let Some((apply_index, commit_index)) = context.next_apply() {
        for index in apply_index + 1..=commit_index {
            let result = log.get_entry(index).and_then(|entry| match entry {
                Some(entry) => state.lock().apply(&entry.command),
                None => errcorrupt!("committed entry {index} missing from log"),
            });
            if let Err(error) = result {
                error!("Fatal state machine apply failure at index {index}: {error}");
                context.shutdown();
                return;
            }
            context.record_applied(index);
        }
    }
    debug!("Apply worker stopped");
}
