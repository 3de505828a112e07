//! Response values produced by handlers and returned by requests.

use crate::error::SessionError;
use master_protocol::{Packet, ProtocolError, ResponseStatus};

/// Status plus raw payload of a completed request.
///
/// Failure responses conventionally carry a human readable message encoded
/// as a string packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(status: ResponseStatus, payload: Vec<u8>) -> Self {
        Self { status, payload }
    }

    /// Empty success.
    pub fn ok() -> Self {
        Self::new(ResponseStatus::Success, Vec::new())
    }

    pub fn success<P: Packet>(packet: &P) -> Self {
        Self::new(ResponseStatus::Success, packet.to_bytes())
    }

    /// Response with a status and no payload.
    pub fn with_status(status: ResponseStatus) -> Self {
        Self::new(status, Vec::new())
    }

    /// Response with a status and an explanatory message.
    pub fn failure(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self::new(status, message.into().to_bytes())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn deserialize<P: Packet>(&self) -> Result<P, ProtocolError> {
        P::from_bytes(&self.payload)
    }

    /// Best-effort text of a failure response.
    pub fn message(&self) -> String {
        if self.payload.is_empty() {
            return String::new();
        }
        String::from_bytes(&self.payload)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Decodes a success payload, or turns a failure into a [`SessionError`].
    pub fn into_packet<P: Packet>(self) -> Result<P, SessionError> {
        if !self.is_success() {
            return Err(SessionError::Request {
                status: self.status,
                message: self.message(),
            });
        }
        Ok(self.deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_message() {
        let response = Response::failure(ResponseStatus::Unauthorized, "Invalid token");
        assert_eq!(response.message(), "Invalid token");

        let err = response.into_packet::<()>().unwrap_err();
        assert_eq!(err.status(), ResponseStatus::Unauthorized);
    }

    #[test]
    fn success_decodes_payload() {
        let response = Response::success(&42u32);
        assert_eq!(response.into_packet::<u32>().unwrap(), 42);
    }
}
