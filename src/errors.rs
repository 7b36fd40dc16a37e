use thiserror::Error;

/// errors during handshake, connect and socket I/O
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("dns lookup failed for `{0}`")]
    DnsFailed(String),
    #[error("cert {0} not found")]
    CertFileNotFound(String),
    #[error("load cert {0} failed")]
    LoadCertFailed(String),
    #[error("tls error `{0}`")]
    Tls(String),
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    #[error("io error {0:?}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    HandShakeFailed(String),
    #[error("{error}")]
    Protocol {
        /// close code paired with the violation
        close_code: u16,
        #[source]
        error: ProtocolError,
    },
    #[error("socket is closed")]
    SocketClosed,
    #[error("unsupported frame {0:?}")]
    UnsupportedFrame(crate::frame::OpCode),
}

/// errors raised while decoding frames from the wire
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("mask bit does not match endpoint role")]
    InvalidMaskBit,
    #[error("missing init fragmented frame")]
    MissInitialFragmentedFrame,
    #[error("not continue frame after init fragmented frame")]
    NotContinueFrameAfterFragmented,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    #[error("invalid close frame payload len, expect 0, >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("payload too large {0}")]
    PayloadTooLarge(u64),
}

impl ProtocolError {
    /// close code reported to the disconnection handler when this
    /// violation tears the connection down
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => 1007,
            // torn down without a close handshake, so the peer observes an
            // abnormal closure rather than 1009
            ProtocolError::PayloadTooLarge(_) => 1006,
            _ => 1002,
        }
    }
}

impl From<ProtocolError> for WsError {
    fn from(error: ProtocolError) -> Self {
        WsError::Protocol {
            close_code: error.close_code(),
            error,
        }
    }
}
