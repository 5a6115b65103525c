use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload of {size} bytes exceeds the maximum frame size of {max} bytes")]
    Encoding { size: u64, max: u64 },
    #[error("Declared frame length {length} exceeds the maximum of {max} bytes")]
    InvalidLength { length: u64, max: u64 },
    #[error("Stream ended after {received} of {expected} frame bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
