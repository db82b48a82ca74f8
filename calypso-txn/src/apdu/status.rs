//! Status words met in Calypso card answers

/// Status word constants
pub struct SW;

impl SW {
    pub const SUCCESS: u16 = 0x9000;

    /// Session modifications buffer full
    pub const SESSION_BUFFER_OVERFLOW: u16 = 0x6400;
    pub const WRONG_LENGTH: u16 = 0x6700;

    /// Wrong PIN, one attempt left
    pub const PIN_ONE_ATTEMPT_REMAINING: u16 = 0x63C1;
    /// Wrong PIN, two attempts left
    pub const PIN_TWO_ATTEMPTS_REMAINING: u16 = 0x63C2;

    pub const SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    /// PIN blocked
    pub const AUTH_METHOD_BLOCKED: u16 = 0x6983;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const COMMAND_NOT_ALLOWED_NO_EF: u16 = 0x6986;
    /// Wrong MAC or signature
    pub const INCORRECT_SM_DATA_OBJECTS: u16 = 0x6988;

    pub const WRONG_DATA: u16 = 0x6A80;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    /// Record not found, or offset beyond the end of a binary file
    pub const RECORD_NOT_FOUND: u16 = 0x6A83;
    pub const DATA_NOT_FOUND: u16 = 0x6A88;

    pub const WRONG_P1_P2: u16 = 0x6B00;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const UNKNOWN_ERROR: u16 = 0x6F00;

    /// 63Cx with x the remaining PIN attempts
    pub fn counter_warning(attempts: u8) -> u16 {
        0x63C0 | u16::from(attempts & 0x0F)
    }

    pub fn is_counter_warning(sw: u16) -> bool {
        sw & 0xFFF0 == 0x63C0
    }

    /// Remaining attempts carried by a 63Cx status word
    pub fn get_retry_count(sw: u16) -> Option<u8> {
        Self::is_counter_warning(sw).then_some((sw & 0x0F) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_warning() {
        assert_eq!(SW::counter_warning(3), 0x63C3);
        assert_eq!(SW::counter_warning(0), 0x63C0);
        assert!(SW::is_counter_warning(0x63C2));
        assert!(!SW::is_counter_warning(0x6300));
    }

    #[test]
    fn test_get_retry_count() {
        assert_eq!(SW::get_retry_count(0x63C2), Some(2));
        assert_eq!(SW::counter_warning(1), SW::PIN_ONE_ATTEMPT_REMAINING);
        assert_eq!(SW::counter_warning(2), SW::PIN_TWO_ATTEMPTS_REMAINING);
        assert_eq!(SW::get_retry_count(SW::AUTH_METHOD_BLOCKED), None);
    }
}
