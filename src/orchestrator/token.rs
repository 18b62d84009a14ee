//! Smart token registry: in-flight run identity, cancellation, progress
//! fan-out, and TTL-based cleanup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::pipeline::CancelFlag;

use super::events::{ProgressEvent, TerminalEvent};

/// Buffered events per run; late subscribers replay from history instead.
const CHANNEL_CAPACITY: usize = 256;

/// Runs that never complete are dropped after this long regardless of TTL.
const ABANDONED_AFTER: Duration = Duration::from_secs(6 * 3600);

struct TokenEntry {
    cancel: CancelFlag,
    sender: broadcast::Sender<ProgressEvent>,
    history: Vec<ProgressEvent>,
    created_at: Instant,
    completed_at: Option<Instant>,
    result: Option<TerminalEvent>,
}

/// What a new subscriber gets: everything so far plus the live feed.
pub struct Subscription {
    pub history: Vec<ProgressEvent>,
    pub receiver: broadcast::Receiver<ProgressEvent>,
    pub completed: bool,
}

/// All live tokens behind one mutex; every operation is a short critical
/// section over the map.
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, TokenEntry>>,
    ttl: Duration,
}

impl TokenRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenEntry>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new run. Tokens are opaque; lookup failure elsewhere is
    /// treated as unknown/expired.
    pub fn create(&self) -> (String, CancelFlag) {
        let token = uuid::Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.lock().insert(
            token.clone(),
            TokenEntry {
                cancel: cancel.clone(),
                sender,
                history: Vec::new(),
                created_at: Instant::now(),
                completed_at: None,
                result: None,
            },
        );
        (token, cancel)
    }

    /// Publish an event for a token. Unknown tokens drop the event.
    pub fn publish(&self, token: &str, event: ProgressEvent) {
        let mut tokens = self.lock();
        let Some(entry) = tokens.get_mut(token) else {
            return;
        };
        if let ProgressEvent::Terminal(terminal) = &event {
            entry.completed_at = Some(Instant::now());
            entry.result = Some(terminal.clone());
        }
        entry.history.push(event.clone());
        let _ = entry.sender.send(event);
    }

    /// Attach to a run's progress stream.
    pub fn subscribe(&self, token: &str) -> Option<Subscription> {
        let tokens = self.lock();
        let entry = tokens.get(token)?;
        Some(Subscription {
            history: entry.history.clone(),
            receiver: entry.sender.subscribe(),
            completed: entry.completed_at.is_some(),
        })
    }

    /// Flip the cancelled flag. Idempotent; false for unknown tokens.
    pub fn cancel(&self, token: &str) -> bool {
        let tokens = self.lock();
        match tokens.get(token) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel only when the run has not completed. Used by the SSE drop
    /// guard so a normally-finished stream never flips the flag.
    pub fn cancel_if_running(&self, token: &str) {
        let tokens = self.lock();
        if let Some(entry) = tokens.get(token) {
            if entry.completed_at.is_none() {
                entry.cancel.cancel();
            }
        }
    }

    /// The stored terminal summary, for polls after the stream closed.
    pub fn result(&self, token: &str) -> Option<TerminalEvent> {
        self.lock().get(token).and_then(|e| e.result.clone())
    }

    pub fn is_known(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    /// Drop tokens past TTL after completion, plus abandoned ones.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, entry| match entry.completed_at {
            Some(done) => now.duration_since(done) < ttl,
            None => now.duration_since(entry.created_at) < ABANDONED_AFTER,
        });
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::events::{Phase, PhaseEvent};

    fn progress(token: &str, current: u64) -> ProgressEvent {
        ProgressEvent::Progress(PhaseEvent {
            token: token.to_string(),
            phase: Phase::Ocr,
            current,
            total: 10,
            message: "ocr".into(),
            artifact: None,
            document_id: None,
            error: None,
        })
    }

    fn terminal(token: &str) -> ProgressEvent {
        ProgressEvent::Terminal(TerminalEvent {
            token: token.to_string(),
            phase: Phase::Finalize,
            terminal: true,
            current: 10,
            total: 10,
            message: "done".into(),
            single_batch_id: None,
            grouped_batch_id: None,
            processed: 10,
            failed: 0,
            errors: vec![],
        })
    }

    #[test]
    fn test_subscribe_replays_history() {
        let registry = TokenRegistry::new(Duration::from_secs(60));
        let (token, _cancel) = registry.create();
        registry.publish(&token, progress(&token, 1));
        registry.publish(&token, progress(&token, 2));

        let sub = registry.subscribe(&token).unwrap();
        assert_eq!(sub.history.len(), 2);
        assert!(!sub.completed);
    }

    #[test]
    fn test_cancel_flips_shared_flag() {
        let registry = TokenRegistry::new(Duration::from_secs(60));
        let (token, cancel) = registry.create();
        assert!(!cancel.is_cancelled());
        assert!(registry.cancel(&token));
        assert!(cancel.is_cancelled());
        // Idempotent; unknown tokens report false
        assert!(registry.cancel(&token));
        assert!(!registry.cancel("nope"));
    }

    #[test]
    fn test_cancel_if_running_skips_completed() {
        let registry = TokenRegistry::new(Duration::from_secs(60));
        let (token, cancel) = registry.create();
        registry.publish(&token, terminal(&token));
        registry.cancel_if_running(&token);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_cleanup_drops_completed_after_ttl() {
        let registry = TokenRegistry::new(Duration::from_secs(0));
        let (token, _cancel) = registry.create();
        registry.publish(&token, terminal(&token));
        assert_eq!(registry.cleanup_expired(), 1);
        assert!(!registry.is_known(&token));

        // Running tokens survive
        let (running, _cancel) = registry.create();
        assert_eq!(registry.cleanup_expired(), 0);
        assert!(registry.is_known(&running));
    }
}
