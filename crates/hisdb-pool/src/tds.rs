//! SQL Server connections over TDS, using `mssql-client`.

use async_trait::async_trait;
use mssql_client::{Client, Config, Ready};

use crate::descriptor::ConnectionDescriptor;
use crate::error::ConnectionError;
use crate::lifecycle::{Connection, Connector, PROBE_QUERY};

/// Opens native SQL Server connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TdsConnector;

impl TdsConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// An authenticated SQL Server session.
pub struct TdsConnection {
    client: Client<Ready>,
}

impl TdsConnection {
    /// The underlying client, for issuing queries.
    pub fn client(&mut self) -> &mut Client<Ready> {
        &mut self.client
    }
}

#[async_trait]
impl Connection for TdsConnection {
    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.client
            .simple_query(PROBE_QUERY)
            .await
            .map_err(|e| ConnectionError::Probe(e.to_string()))
    }

    async fn close(self) -> Result<(), ConnectionError> {
        self.client
            .close()
            .await
            .map_err(|e| ConnectionError::Close(e.to_string()))
    }
}

#[async_trait]
impl Connector for TdsConnector {
    type Connection = TdsConnection;

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<TdsConnection, ConnectionError> {
        let config = Config::from_connection_string(&descriptor.to_connection_string())
            .map_err(|e| ConnectionError::Open(e.to_string()))?;

        tracing::trace!(server = %descriptor, "opening TDS connection");
        let client = Client::connect(config)
            .await
            .map_err(|e| ConnectionError::Open(e.to_string()))?;
        Ok(TdsConnection { client })
    }
}
