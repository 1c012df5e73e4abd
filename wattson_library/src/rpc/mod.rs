#![allow(clippy::derive_partial_eq_without_eq)]
tonic::include_proto!("wattson_rpc");

use tonic::Status;

#[derive(Debug)]
pub struct RPCError {
    pub message: Status,
    pub source: String,
}
impl RPCError {
    pub fn new(message: Status, source: &str) -> Self {
        RPCError {
            message,
            source: source.to_string(),
        }
    }
}
impl std::fmt::Display for RPCError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{} RPC failed because: {}", self.source, self.message.message())?;
        Ok(())
    }
}
impl std::error::Error for RPCError {}
