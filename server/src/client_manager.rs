//! Connected client roster for the arena server
//!
//! Tracks who is connected, from which address, and which inputs are still
//! waiting for the next simulation tick. Admission policy (bans, operator
//! state) lives in the moderation layer; this module only enforces capacity
//! and drops clients that go silent.

use log::info;
use shared::InputState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Client {
    pub id: u32,
    pub addr: SocketAddr,
    /// Last time any packet arrived from this client
    pub last_seen: Instant,
    /// Highest input sequence applied to the simulation
    pub last_processed_input: u32,
    /// Inputs waiting for the next tick, ordered by sequence
    pub pending_inputs: Vec<InputState>,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_processed_input: 0,
            pending_inputs: Vec::new(),
        }
    }

    /// Queues an input, keeping the buffer in sequence order. Inputs at or
    /// below the last processed sequence are dropped as duplicates.
    pub fn queue_input(&mut self, input: InputState) -> bool {
        self.last_seen = Instant::now();
        if input.sequence <= self.last_processed_input {
            return false;
        }
        let pos = self
            .pending_inputs
            .partition_point(|queued| queued.sequence < input.sequence);
        if self
            .pending_inputs
            .get(pos)
            .is_some_and(|queued| queued.sequence == input.sequence)
        {
            return false;
        }
        self.pending_inputs.insert(pos, input);
        true
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Client ids start at 1 and are never reused while the server runs.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Returns the new client id, or `None` when the server is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: u32) -> Option<Client> {
        let client = self.clients.remove(&client_id)?;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .values()
            .find(|client| client.addr == addr)
            .map(|client| client.id)
    }

    pub fn addr_of(&self, client_id: u32) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    /// Marks a client as alive without queuing anything.
    pub fn touch(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
        }
    }

    pub fn add_input(&mut self, client_id: u32, input: InputState) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => client.queue_input(input),
            None => false,
        }
    }

    /// Takes every pending input across all clients, oldest timestamp first,
    /// and records each client's highest sequence as processed.
    pub fn drain_inputs(&mut self) -> Vec<(u32, InputState)> {
        let mut inputs = Vec::new();

        for client in self.clients.values_mut() {
            if let Some(last) = client.pending_inputs.last() {
                client.last_processed_input = client.last_processed_input.max(last.sequence);
            }
            inputs.extend(client.pending_inputs.drain(..).map(|input| (client.id, input)));
        }

        inputs.sort_by_key(|(id, input)| (input.timestamp, *id, input.sequence));
        inputs
    }

    pub fn last_processed_inputs(&self) -> HashMap<u32, u32> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.last_processed_input))
            .collect()
    }

    /// Removes clients that have been silent longer than the timeout.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Client> {
        let timed_out: Vec<u32> = self
            .clients
            .values()
            .filter(|client| client.is_timed_out(now, self.timeout))
            .map(|client| client.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| {
                info!("Client {} timed out", id);
                self.remove_client(id)
            })
            .collect()
    }

    pub fn client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        let mut addrs: Vec<(u32, SocketAddr)> = self
            .clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect();
        addrs.sort_by_key(|(id, _)| *id);
        addrs
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn input(sequence: u32, timestamp: u64) -> InputState {
        InputState {
            sequence,
            timestamp,
            move_x: 1.0,
            move_y: 0.0,
            eject: false,
        }
    }

    fn manager(max_clients: usize) -> ClientManager {
        ClientManager::new(max_clients, Duration::from_secs(5))
    }

    #[test]
    fn test_queue_input_orders_by_sequence() {
        let mut client = Client::new(1, test_addr());

        assert!(client.queue_input(input(2, 100)));
        assert!(client.queue_input(input(1, 50)));
        assert!(!client.queue_input(input(2, 100)));

        let sequences: Vec<u32> = client.pending_inputs.iter().map(|i| i.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_stale_input_dropped() {
        let mut client = Client::new(1, test_addr());
        client.last_processed_input = 5;
        assert!(!client.queue_input(input(5, 10)));
        assert!(!client.queue_input(input(3, 10)));
        assert!(client.queue_input(input(6, 10)));
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr());
        let now = Instant::now();
        assert!(!client.is_timed_out(now, Duration::from_secs(1)));

        client.last_seen = now - Duration::from_secs(2);
        assert!(client.is_timed_out(now, Duration::from_secs(1)));
    }

    #[test]
    fn test_add_clients_until_full() {
        let mut manager = manager(2);
        assert!(manager.is_empty());

        assert_eq!(manager.add_client(test_addr()), Some(1));
        assert_eq!(manager.add_client(test_addr2()), Some(2));
        assert_eq!(manager.add_client("10.0.0.1:1".parse().unwrap()), None);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_ids_not_reused() {
        let mut manager = manager(2);
        let first = manager.add_client(test_addr()).unwrap();
        manager.remove_client(first);
        assert_eq!(manager.add_client(test_addr()), Some(2));
    }

    #[test]
    fn test_remove_client() {
        let mut manager = manager(2);
        let client_id = manager.add_client(test_addr()).unwrap();

        let removed = manager.remove_client(client_id).unwrap();
        assert_eq!(removed.addr, test_addr());
        assert!(manager.is_empty());
        assert!(manager.remove_client(client_id).is_none());
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = manager(2);
        let client_id1 = manager.add_client(test_addr()).unwrap();
        manager.add_client(test_addr2()).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));
        assert_eq!(manager.addr_of(client_id1), Some(test_addr()));
        assert_eq!(
            manager.find_client_by_addr("192.168.1.1:9999".parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_add_input_to_unknown_client() {
        let mut manager = manager(2);
        assert!(!manager.add_input(999, input(1, 100)));
    }

    #[test]
    fn test_drain_inputs_is_chronological() {
        let mut manager = manager(3);
        let client_id1 = manager.add_client(test_addr()).unwrap();
        let client_id2 = manager.add_client(test_addr2()).unwrap();

        manager.add_input(client_id1, input(1, 100));
        manager.add_input(client_id2, input(1, 50));
        manager.add_input(client_id1, input(2, 200));

        let inputs = manager.drain_inputs();
        let timestamps: Vec<u64> = inputs.iter().map(|(_, i)| i.timestamp).collect();
        assert_eq!(timestamps, vec![50, 100, 200]);

        let processed = manager.last_processed_inputs();
        assert_eq!(processed[&client_id1], 2);
        assert_eq!(processed[&client_id2], 1);
        assert!(manager.drain_inputs().is_empty());

        // Replayed packet after processing is ignored
        assert!(!manager.add_input(client_id1, input(2, 200)));
    }

    #[test]
    fn test_check_timeouts_removes_silent_clients() {
        let mut manager = manager(2);
        let quiet = manager.add_client(test_addr()).unwrap();
        let chatty = manager.add_client(test_addr2()).unwrap();

        let later = Instant::now() + Duration::from_secs(6);
        manager.clients.get_mut(&chatty).unwrap().last_seen = later;

        let removed = manager.check_timeouts(later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, quiet);
        assert_eq!(manager.client_addrs(), vec![(chatty, test_addr2())]);
    }
}
