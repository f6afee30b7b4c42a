use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{Direction, Flow, FlowKey};

/// Live flows, keyed in the orientation of their first packet.
///
/// Lookups try the packet's own key first and then its reverse, so a
/// flow is found from either side with at most two hash lookups.
#[derive(Debug)]
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    next_id: u64,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            next_id: 1,
        }
    }

    /// Stored key and packet direction for a packet travelling along `key`.
    pub fn find(&self, key: &FlowKey) -> Option<(FlowKey, Direction)> {
        if self.flows.contains_key(key) {
            return Some((*key, Direction::Original));
        }
        let reversed = key.reversed();
        if self.flows.contains_key(&reversed) {
            return Some((reversed, Direction::Reverse));
        }
        None
    }

    pub fn get(&self, stored: &FlowKey) -> Option<&Flow> {
        self.flows.get(stored)
    }

    pub fn get_mut(&mut self, stored: &FlowKey) -> Option<&mut Flow> {
        self.flows.get_mut(stored)
    }

    /// Allocate the next flow id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert a new flow under its own key.
    pub fn insert(&mut self, flow: Flow) -> &mut Flow {
        let key = flow.key;
        match self.flows.entry(key) {
            Entry::Occupied(mut e) => {
                e.insert(flow);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(flow),
        }
    }

    pub fn remove(&mut self, stored: &FlowKey) -> Option<Flow> {
        self.flows.remove(stored)
    }

    /// Remove flows idle for longer than `timeout_us`.
    pub fn expire(&mut self, now: i64, timeout_us: i64) -> Vec<Flow> {
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| now - f.last_seen > timeout_us)
            .map(|(k, _)| *k)
            .collect();
        idle.iter().filter_map(|k| self.flows.remove(k)).collect()
    }

    /// Remove every flow, oldest first.
    pub fn drain(&mut self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.drain().map(|(_, f)| f).collect();
        flows.sort_by_key(|f| f.id);
        flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::DecoderOptions;
    use crate::decoder::Protocol;

    fn flow(table: &mut FlowTable, src: &str, dst: &str, ts: i64) -> FlowKey {
        let src: SocketAddr = src.parse().unwrap();
        let dst: SocketAddr = dst.parse().unwrap();
        let key = FlowKey::tcp(src, dst);
        let id = table.next_id();
        table.insert(Flow::new(
            id,
            key,
            Protocol::Http,
            Direction::Original,
            &DecoderOptions::default(),
            ts,
        ));
        key
    }

    #[test]
    fn test_find_both_orientations() {
        let mut table = FlowTable::new();
        let key = flow(&mut table, "10.0.0.1:40000", "10.0.0.2:80", 0);

        assert_eq!(table.find(&key), Some((key, Direction::Original)));
        assert_eq!(table.find(&key.reversed()), Some((key, Direction::Reverse)));

        let other = FlowKey::tcp(
            "10.0.0.1:40001".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        assert_eq!(table.find(&other), None);
    }

    #[test]
    fn test_ids_monotonic() {
        let mut table = FlowTable::new();
        let a = flow(&mut table, "10.0.0.1:1", "10.0.0.2:80", 0);
        let b = flow(&mut table, "10.0.0.1:2", "10.0.0.2:80", 0);
        table.remove(&a);
        let c = flow(&mut table, "10.0.0.1:3", "10.0.0.2:80", 0);
        let id_b = table.get(&b).unwrap().id;
        let id_c = table.get(&c).unwrap().id;
        assert!(id_c > id_b);
    }

    #[test]
    fn test_expire_idle() {
        let mut table = FlowTable::new();
        flow(&mut table, "10.0.0.1:1", "10.0.0.2:80", 0);
        let fresh = flow(&mut table, "10.0.0.1:2", "10.0.0.2:80", 50);

        let expired = table.expire(100, 60);
        assert_eq!(expired.len(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.get(&fresh).is_some());
    }
}
