//! Closing connections left on a proxy after its group switched away from it.

use std::future::Future;

use crate::error::RosterResult;
use crate::retrieve::ControlApi;

/// The connections side of the engine, as far as a group switch needs it.
pub trait ConnectionCloser {
    /// Closes every connection routed through `group` via `previous`. Returns how many were closed.
    fn close_connections_via(&self, group: &str, previous: &str) -> impl Future<Output = RosterResult<usize>> + Send;
}

impl ConnectionCloser for ControlApi {
    async fn close_connections_via(&self, group: &str, previous: &str) -> RosterResult<usize> {
        let connections = self.get_connections().await?;
        let mut closed = 0;
        for conn in connections
            .iter()
            .filter(|c| c.chains.iter().any(|h| h == group) && c.chains.iter().any(|h| h == previous))
        {
            match self.close_connection(&conn.id).await {
                Ok(()) => closed += 1,
                Err(e) => log::warn!("Failed to close connection {}: {}", conn.id, e),
            }
        }
        log::info!("Closed {} connection(s) through {} -> {}", closed, group, previous);
        Ok(closed)
    }
}
