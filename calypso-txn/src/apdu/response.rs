//! Card answers: data field followed by SW1 SW2

use super::status::SW;

/// Response APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl Response {
    fn with_sw(data: Vec<u8>, sw: u16) -> Self {
        let [sw1, sw2] = sw.to_be_bytes();
        Self { data, sw1, sw2 }
    }

    /// Data with 9000
    pub fn success(data: Vec<u8>) -> Self {
        Self::with_sw(data, SW::SUCCESS)
    }

    /// Bare 9000
    pub fn ok() -> Self {
        Self::success(Vec::new())
    }

    /// Status word only
    pub fn error(sw: u16) -> Self {
        Self::with_sw(Vec::new(), sw)
    }

    /// PIN attempts left, as 63Cx
    pub fn counter_warning(attempts: u8) -> Self {
        Self::error(SW::counter_warning(attempts))
    }

    /// Split a raw answer; None below two bytes
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let (data, sw) = raw.split_at(raw.len().checked_sub(2)?);
        Some(Self {
            data: data.to_vec(),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    pub fn sw(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub fn is_success(&self) -> bool {
        self.sw() == SW::SUCCESS
    }

    /// Data and status word, as digested in a secure session
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.data.clone();
        raw.extend_from_slice(&[self.sw1, self.sw2]);
        raw
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response() {
        let resp = Response::success(vec![0x00, 0x00, 0x0A]);
        assert!(resp.is_success());
        assert_eq!(resp.to_bytes(), vec![0x00, 0x00, 0x0A, 0x90, 0x00]);
        assert_eq!(Response::ok().to_bytes(), vec![0x90, 0x00]);
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error(SW::SESSION_BUFFER_OVERFLOW);
        assert!(!resp.is_success());
        assert!(resp.data.is_empty());
        assert_eq!(resp.to_bytes(), vec![0x64, 0x00]);
        assert_eq!(Response::counter_warning(2).sw(), 0x63C2);
    }

    #[test]
    fn test_from_bytes() {
        let resp = Response::from_bytes(&[0x01, 0x02, 0x63, 0xC1]).unwrap();
        assert_eq!(resp.data, vec![0x01, 0x02]);
        assert_eq!(resp.sw(), 0x63C1);
        assert_eq!(Response::from_bytes(&[0x90, 0x00]), Some(Response::ok()));
        assert!(Response::from_bytes(&[0x90]).is_none());
    }
}
