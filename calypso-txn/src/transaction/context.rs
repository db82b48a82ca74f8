use crate::card::CalypsoCard;
use crate::crypto::SymmetricCryptoService;

/// State shared by every command of a transaction
///
/// `secure_session_open` follows what the card actually did, as opposed to
/// the prepared state held by the transaction manager.
pub(crate) struct TransactionContext {
    pub card: CalypsoCard,
    pub crypto: Box<dyn SymmetricCryptoService>,
    pub secure_session_open: bool,
}

impl TransactionContext {
    pub fn new(card: CalypsoCard, crypto: Box<dyn SymmetricCryptoService>) -> Self {
        Self {
            card,
            crypto,
            secure_session_open: false,
        }
    }
}
