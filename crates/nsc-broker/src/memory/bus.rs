use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::subject::subject_matches;

struct BusSubscriber<T> {
    id: u64,
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<T>,
}

struct BusState<T> {
    next_id: u64,
    subscribers: Vec<BusSubscriber<T>>,
    group_cursor: HashMap<String, usize>,
}

/// In-process fan-out keyed by subject pattern.
///
/// Plain subscribers all receive a copy; queue-group members share the load
/// round-robin. Subscribers whose receiver is gone are pruned on the next emit.
pub(crate) struct Bus<T> {
    state: Mutex<BusState<T>>,
}

impl<T: Clone> Bus<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 0,
                subscribers: Vec::new(),
                group_cursor: HashMap::new(),
            }),
        }
    }

    pub(crate) fn subscribe(
        &self,
        pattern: &str,
        queue: Option<String>,
    ) -> (u64, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.push(BusSubscriber {
            id,
            pattern: pattern.to_string(),
            queue,
            tx,
        });
        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.retain(|s| s.id != id);
    }

    /// Delivers `item` to every match and returns how many subscribers got it.
    pub(crate) fn emit(&self, subject: &str, item: &T) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, subscriber) in state.subscribers.iter().enumerate() {
            if !subject_matches(&subscriber.pattern, subject) {
                continue;
            }
            match &subscriber.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(index),
                None => {
                    if subscriber.tx.send(item.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        for (queue, members) in groups {
            let cursor = state.group_cursor.entry(queue).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if state.subscribers[pick].tx.send(item.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
