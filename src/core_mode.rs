//! Core mode enumeration.
//!
//! Defines which side(s) of the request/reply exchange a
//! [`MessagingCore`](crate::MessagingCore) takes part in, and therefore which
//! broker queues it consumes.

use std::str::FromStr;

use crate::Error;

/// Operational mode of a messaging core.
///
/// - [`Client`](CoreMode::Client): issues requests; consumes only its reply queue.
/// - [`Server`](CoreMode::Server): serves requests from the shared queue; cannot issue calls.
/// - [`FullDuplex`](CoreMode::FullDuplex): both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreMode {
    Client,
    Server,
    #[default]
    FullDuplex,
}

impl CoreMode {
    /// Whether this core dispatches requests from the shared queue.
    pub fn serves(self) -> bool {
        matches!(self, CoreMode::Server | CoreMode::FullDuplex)
    }

    /// Whether this core issues requests and waits for replies.
    pub fn calls(self) -> bool {
        matches!(self, CoreMode::Client | CoreMode::FullDuplex)
    }
}

impl FromStr for CoreMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(CoreMode::Client),
            "server" => Ok(CoreMode::Server),
            "full-duplex" | "full_duplex" | "fullduplex" => Ok(CoreMode::FullDuplex),
            other => Err(Error::InvalidConfig(format!(
                "unknown mode '{other}', expected client, server or full-duplex"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn capabilities_follow_mode() {
        // ---
        assert!(CoreMode::Client.calls() && !CoreMode::Client.serves());
        assert!(CoreMode::Server.serves() && !CoreMode::Server.calls());
        assert!(CoreMode::FullDuplex.serves() && CoreMode::FullDuplex.calls());
    }

    #[test]
    fn parses_from_text() {
        // ---
        assert_eq!("Server".parse::<CoreMode>().unwrap(), CoreMode::Server);
        assert_eq!("full-duplex".parse::<CoreMode>().unwrap(), CoreMode::FullDuplex);
        assert!("both".parse::<CoreMode>().is_err());
    }
}
