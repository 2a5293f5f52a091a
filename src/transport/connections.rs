//! Registry of live runner sockets.
//!
//! The WebSocket handler registers an outbound channel per authenticated
//! runner; the dispatcher sends frames through it. In-process only;
//! runner online/offline state in the database is bookkeeping, this map is
//! the truth for "can I reach it right now".

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::transport::ServerMessage;

pub struct RunnerConnectionManager {
    connections: Mutex<HashMap<i64, mpsc::UnboundedSender<ServerMessage>>>,
}

impl RunnerConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Associate a socket with a runner. A reconnect replaces the old
    /// channel; the stale writer task ends when its receiver drops.
    pub fn register(&self, runner_id: i64, sender: mpsc::UnboundedSender<ServerMessage>) {
        self.connections
            .lock()
            .expect("connection lock")
            .insert(runner_id, sender);
    }

    pub fn unregister(&self, runner_id: i64) {
        self.connections
            .lock()
            .expect("connection lock")
            .remove(&runner_id);
    }

    pub fn is_online(&self, runner_id: i64) -> bool {
        self.connections
            .lock()
            .expect("connection lock")
            .contains_key(&runner_id)
    }

    /// Send a frame to a runner. False when the runner is not connected or
    /// its socket writer has gone away.
    pub fn send_to_runner(&self, runner_id: i64, message: ServerMessage) -> bool {
        let connections = self.connections.lock().expect("connection lock");
        match connections.get(&runner_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn online_runner_ids(&self) -> Vec<i64> {
        self.connections
            .lock()
            .expect("connection lock")
            .keys()
            .copied()
            .collect()
    }
}

impl Default for RunnerConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_send() {
        let manager = RunnerConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(!manager.is_online(1));
        manager.register(1, tx);
        assert!(manager.is_online(1));

        assert!(manager.send_to_runner(1, ServerMessage::Ping));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Ping));

        assert!(!manager.send_to_runner(2, ServerMessage::Ping));
    }

    #[test]
    fn unregister_takes_runner_offline() {
        let manager = RunnerConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register(1, tx);
        manager.unregister(1);
        assert!(!manager.is_online(1));
        assert!(!manager.send_to_runner(1, ServerMessage::Ping));
    }

    #[test]
    fn send_fails_after_receiver_drops() {
        let manager = RunnerConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(1, tx);
        drop(rx);
        assert!(!manager.send_to_runner(1, ServerMessage::Ping));
    }
}
