//! Connection state reported by the store after construction.
//!
//! Construction never waits on the network. The store publishes the outcome
//! of its connection attempt on a [`watch`] channel instead.

use std::fmt;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// State of the store's backing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection attempt is still in flight.
    Connecting,
    /// The backend answered and the bucket exists.
    Connected,
    /// The connection attempt failed.
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected: {}", reason),
        }
    }
}

/// Wait until `events` leaves [`ConnectionState::Connecting`].
///
/// Resolves to `Ok(())` once connected, or [`Error::Connection`] if the
/// attempt failed or the publisher went away.
pub async fn wait_for(mut events: watch::Receiver<ConnectionState>) -> Result<()> {
    let state = events
        .wait_for(|state| !matches!(state, ConnectionState::Connecting))
        .await
        .map_err(|_| Error::Connection("connection task ended before reporting".to_string()))?
        .clone();

    match state {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Disconnected(reason) => Err(Error::Connection(reason)),
        ConnectionState::Connecting => Err(Error::Connection("still connecting".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_connected() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let waiter = tokio::spawn(wait_for(rx));
        tx.send(ConnectionState::Connected).unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_disconnected() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        tx.send(ConnectionState::Disconnected("refused".to_string()))
            .unwrap();
        let err = wait_for(rx).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ref reason) if reason == "refused"));
    }

    #[tokio::test]
    async fn test_wait_for_dropped_sender() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        drop(tx);
        assert!(wait_for(rx).await.unwrap_err().is_connection());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Disconnected("timeout".to_string()).to_string(),
            "disconnected: timeout"
        );
    }
}
