//! Transaction audit trail
//!
//! Every APDU exchanged during a transaction, card side and SAM side, in
//! order. It is shared between the engine and the crypto authority and
//! attached to errors that need a trace.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared, append-only list of exchanged APDUs
#[derive(Debug, Clone, Default)]
pub struct TransactionAuditData {
    entries: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TransactionAuditData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: &[u8]) {
        self.entries.lock().push(entry.to_vec());
    }

    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Display for TransactionAuditData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        write!(f, "[")?;
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", hex::encode_upper(entry))?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_between_clones() {
        let audit = TransactionAuditData::new();
        let other = audit.clone();
        audit.push(&[0x00, 0x84, 0x00, 0x00, 0x08]);
        other.push(&[0x90, 0x00]);

        assert_eq!(audit.len(), 2);
        assert_eq!(audit.to_string(), "[0084000008, 9000]");
    }
}
