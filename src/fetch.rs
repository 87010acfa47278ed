// src/fetch.rs
//
// Hybrid fetch: priority queues are polled first in their configured order;
// the remaining queues are shuffled each pass so no queue starves another of
// equal standing. Strict mode keeps the configured order throughout.

use rand::seq::SliceRandom;

use crate::config::QueueOptions;

/// The order in which a worker pass polls its queues. Duplicate entries
/// (host-queue weight) bias where a queue lands after the shuffle; the
/// returned list is deduplicated preserving first occurrence.
pub fn queue_order(options: &QueueOptions) -> Vec<String> {
    if options.strict {
        return options.all_queues();
    }

    let mut rest = options.queues.clone();
    rest.shuffle(&mut rand::thread_rng());

    let mut order: Vec<String> = Vec::with_capacity(options.priority_queues.len() + rest.len());
    for queue in options.priority_queues.iter().chain(rest.iter()) {
        if !order.contains(queue) {
            order.push(queue.clone());
        }
    }
    order
}
