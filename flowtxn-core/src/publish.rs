//! Collaborators on the output side: where transactions go, and who owns
//! each socket.

use std::collections::HashMap;
use std::net::IpAddr;

use compact_str::CompactString;
use parking_lot::Mutex;

use crate::transaction::Transaction;

/// Receives finished transactions.
pub trait TransactionSink {
    fn publish(&mut self, txn: Transaction);
}

/// Collects transactions in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub transactions: Vec<Transaction>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn take(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.transactions)
    }
}

impl TransactionSink for VecSink {
    fn publish(&mut self, txn: Transaction) {
        self.transactions.push(txn);
    }
}

impl<F: FnMut(Transaction)> TransactionSink for F {
    fn publish(&mut self, txn: Transaction) {
        self(txn)
    }
}

/// Best-effort lookup of the local process owning a socket.
///
/// Implementations must be thread-safe; a miss is `None`, never an error.
pub trait ProcessResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr, port: u16) -> Option<CompactString>;
}

/// Resolver used when process attribution is disabled.
#[derive(Clone, Debug, Default)]
pub struct NoProcessResolver;

impl ProcessResolver for NoProcessResolver {
    fn lookup(&self, _ip: IpAddr, _port: u16) -> Option<CompactString> {
        None
    }
}

/// Fixed (ip, port) -> process table.
///
/// A port registered with an unspecified address (`0.0.0.0` or `::`)
/// matches any address.
#[derive(Debug, Default)]
pub struct StaticProcessResolver {
    entries: Mutex<HashMap<(IpAddr, u16), CompactString>>,
}

impl StaticProcessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: IpAddr, port: u16, process: impl Into<CompactString>) {
        self.entries.lock().insert((ip, port), process.into());
    }

    pub fn with(self, ip: IpAddr, port: u16, process: impl Into<CompactString>) -> Self {
        self.insert(ip, port, process);
        self
    }
}

impl ProcessResolver for StaticProcessResolver {
    fn lookup(&self, ip: IpAddr, port: u16) -> Option<CompactString> {
        let entries = self.entries.lock();
        entries
            .get(&(ip, port))
            .or_else(|| {
                let any = match ip {
                    IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                };
                entries.get(&(any, port))
            })
            .cloned()
    }
}

/// Fill in the process names of both endpoints.
pub fn attribute(txn: &mut Transaction, resolver: &dyn ProcessResolver) {
    txn.client.process = resolver.lookup(txn.client.ip, txn.client.port);
    txn.server.process = resolver.lookup(txn.server.ip, txn.server.port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Protocol;

    #[test]
    fn test_no_resolver() {
        assert!(NoProcessResolver.lookup("127.0.0.1".parse().unwrap(), 80).is_none());
    }

    #[test]
    fn test_static_resolver_wildcard() {
        let resolver = StaticProcessResolver::new()
            .with("0.0.0.0".parse().unwrap(), 6379, "redis-server")
            .with("10.0.0.1".parse().unwrap(), 40000, "app");

        let mut txn = Transaction::new(
            Protocol::Redis,
            1,
            0,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:6379".parse().unwrap(),
        );
        attribute(&mut txn, &resolver);
        assert_eq!(txn.client.process.as_deref(), Some("app"));
        assert_eq!(txn.server.process.as_deref(), Some("redis-server"));
    }

    #[test]
    fn test_closure_sink() {
        let mut count = 0;
        let mut sink = |_txn: Transaction| count += 1;
        sink.publish(Transaction::new(
            Protocol::Http,
            1,
            0,
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        ));
        drop(sink);
        assert_eq!(count, 1);
    }
}
