use std::collections::HashMap;

use compact_str::CompactString;

use crate::decoder::ParamType;

/// A statement registered by a MySQL `COM_STMT_PREPARE` round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub query: CompactString,
    pub num_params: u16,
    /// Parameter types from the last execute that bound them.
    pub param_types: Vec<ParamType>,
}

/// Prepared statements of one flow, by statement id.
///
/// Entries live until the client closes the statement or the flow goes
/// away; there is no other bound.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: HashMap<u32, PreparedStatement>,
}

impl StatementCache {
    /// Register a statement. A re-used id replaces the old entry.
    pub fn prepare(&mut self, id: u32, query: CompactString, num_params: u16) {
        self.statements.insert(
            id,
            PreparedStatement {
                query,
                num_params,
                param_types: Vec::new(),
            },
        );
    }

    /// Remember the parameter types an execute bound, for later executes
    /// that do not resend them.
    pub fn bind_types(&mut self, id: u32, types: Vec<ParamType>) {
        if let Some(stmt) = self.statements.get_mut(&id) {
            stmt.param_types = types;
        }
    }

    pub fn get(&self, id: u32) -> Option<&PreparedStatement> {
        self.statements.get(&id)
    }

    pub fn close(&mut self, id: u32) -> Option<PreparedStatement> {
        self.statements.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_get_close() {
        let mut cache = StatementCache::default();
        cache.prepare(1, "SELECT ?".into(), 1);
        assert_eq!(cache.get(1).unwrap().num_params, 1);
        assert!(cache.get(2).is_none());

        cache.prepare(1, "SELECT ?, ?".into(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).unwrap().query, "SELECT ?, ?");

        let long = ParamType {
            code: 0x03,
            unsigned: false,
        };
        cache.bind_types(1, vec![long, long]);
        assert_eq!(cache.get(1).unwrap().param_types.len(), 2);
        cache.bind_types(9, vec![long]);
        assert!(cache.get(9).is_none());

        assert!(cache.close(1).is_some());
        assert!(cache.is_empty());
    }
}
