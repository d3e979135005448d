use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Type codes reserved for protocol-internal messages. All of them are negative; non-negative
///  types belong to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum SystemMessageType {
    Handshake = -1,
    Close = -2,
    ShutdownNotice = -3,
    PingPong = -4,
    TestConnection = -5,
    RawDataConnection = -6,
    RawData = -7,
    RawDataResend = -8,
    FileTransferConnection = -9,
    FileData = -10,
    FileBurst = -11,
    /// Generic acknowledgement of a system request. No system handler accepts it, so it
    ///  reaches the waiter that sent the request.
    Acknowledgement = -12,
}

impl SystemMessageType {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SystemMessageType::Handshake, -1)]
    #[case(SystemMessageType::RawData, -7)]
    #[case(SystemMessageType::RawDataResend, -8)]
    #[case(SystemMessageType::Acknowledgement, -12)]
    fn test_codes(#[case] t: SystemMessageType, #[case] code: i32) {
        assert_eq!(t.code(), code);
        assert_eq!(i32::from(t), code);
        assert_eq!(SystemMessageType::try_from(code).unwrap(), t);
    }

    #[test]
    fn test_unknown_code() {
        assert!(SystemMessageType::try_from(-99).is_err());
        assert!(SystemMessageType::try_from(0).is_err());
    }
}
