//! Client connection and call wrappers.

use std::time::Duration;

use arrow::{
    array::RecordBatch,
    compute::concat_batches,
    datatypes::Schema,
    error::ArrowError,
    ipc::{convert::fb_to_schema, root_as_message},
};
use arrow_flight::{
    decode::FlightRecordBatchStream, encode::FlightDataEncoderBuilder, error::FlightError, Action,
    FlightClient, FlightDescriptor, Ticket,
};
use futures::{stream, TryStreamExt};
use snafu::prelude::*;
use tonic::{transport::Endpoint, Code, Status};
use tracing::debug;

use hangar_core::{
    protocol::{SnapshotOutcome, UploadCommand, UploadResult, GET_SCHEMA_ACTION},
    store::InsertMode,
};

/// Client configuration: endpoint plus the fail-fast connect timeout.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Bound on connection establishment; unreachable endpoints error out
    /// instead of hanging.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8816,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The endpoint URI.
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Errors surfaced to client callers.
#[derive(Debug, Snafu)]
pub enum ClientError {
    /// The endpoint was unreachable within the connect timeout.
    #[snafu(display("Failed to connect to {endpoint}: {source}"))]
    Connection {
        /// The endpoint URI.
        endpoint: String,
        /// Underlying transport error.
        source: tonic::transport::Error,
    },

    /// The configured endpoint is not a valid URI.
    #[snafu(display("Invalid endpoint {endpoint}: {source}"))]
    InvalidEndpoint {
        /// The endpoint URI.
        endpoint: String,
        /// Underlying transport error.
        source: tonic::transport::Error,
    },

    /// The service reported the table absent.
    #[snafu(display("Table not found: {table}"))]
    TableNotFound {
        /// The missing table.
        table: String,
    },

    /// The service rejected the call.
    #[snafu(display("Server rejected {phase}: {status}"))]
    Rejected {
        /// The failing call.
        phase: String,
        /// Status returned by the service.
        status: Status,
    },

    /// Flight-level failure outside a server status.
    #[snafu(display("Flight error during {phase}: {message}"))]
    Flight {
        /// The failing call.
        phase: String,
        /// Rendered flight error.
        message: String,
    },

    /// A response payload did not decode.
    #[snafu(display("Failed to decode {what}: {message}"))]
    Decode {
        /// What was being decoded.
        what: String,
        /// Failure detail.
        message: String,
    },

    /// Arrow failure while assembling results.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

fn map_flight_error(phase: &str, table: Option<&str>, err: FlightError) -> ClientError {
    match err {
        FlightError::Tonic(status) => {
            if status.code() == Code::NotFound {
                if let Some(table) = table {
                    return ClientError::TableNotFound {
                        table: table.to_string(),
                    };
                }
            }
            ClientError::Rejected {
                phase: phase.to_string(),
                status,
            }
        }
        other => ClientError::Flight {
            phase: phase.to_string(),
            message: other.to_string(),
        },
    }
}

fn decode_ipc_schema(bytes: &[u8]) -> Result<Schema, ClientError> {
    let message = root_as_message(bytes).map_err(|e| ClientError::Decode {
        what: "schema message".to_string(),
        message: e.to_string(),
    })?;
    let ipc_schema = message.header_as_schema().ok_or_else(|| ClientError::Decode {
        what: "schema message".to_string(),
        message: "message header is not a schema".to_string(),
    })?;
    Ok(fb_to_schema(ipc_schema))
}

/// Connected client for one ingestion endpoint.
#[derive(Debug)]
pub struct HangarClient {
    config: ClientConfig,
    inner: FlightClient,
}

impl HangarClient {
    /// Connect to the configured endpoint.
    ///
    /// Fails fast with [`ClientError::Connection`] when the endpoint is
    /// unreachable; no retry is attempted.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let uri = config.uri();
        let endpoint = Endpoint::from_shared(uri.clone())
            .context(InvalidEndpointSnafu { endpoint: uri.clone() })?
            .connect_timeout(config.connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .context(ConnectionSnafu { endpoint: uri.clone() })?;

        debug!(endpoint = %uri, "connected to flight server");
        Ok(Self {
            config,
            inner: FlightClient::new(channel),
        })
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Probe the schema of `table` with a synthesized `SELECT *` query.
    ///
    /// Fails with [`ClientError::TableNotFound`] when the service reports
    /// the table absent.
    pub async fn get_schema(&mut self, table: &str) -> Result<Schema, ClientError> {
        let query = format!("SELECT * FROM {table}");
        self.schema_probe(&query, Some(table)).await
    }

    /// Probe the output schema of an arbitrary SQL query.
    pub async fn get_schema_for_query(&mut self, query: &str) -> Result<Schema, ClientError> {
        self.schema_probe(query, None).await
    }

    async fn schema_probe(
        &mut self,
        query: &str,
        table: Option<&str>,
    ) -> Result<Schema, ClientError> {
        let action = Action::new(GET_SCHEMA_ACTION, query.to_string());

        let mut results = self
            .inner
            .do_action(action)
            .await
            .map_err(|e| map_flight_error("schema probe", table, e))?;

        let body = results
            .try_next()
            .await
            .map_err(|e| map_flight_error("schema probe", table, e))?
            .ok_or_else(|| ClientError::Decode {
                what: "schema probe response".to_string(),
                message: "empty action result".to_string(),
            })?;

        decode_ipc_schema(&body)
    }

    /// Upload `batches` to `table`.
    ///
    /// `destination` is the optional routing hint forwarded to the server.
    /// The returned [`UploadResult`] carries the snapshot outcome as data:
    /// a failed snapshot after a committed insert is not an `Err`. An
    /// upload with no batches at all sends nothing and reports a skipped
    /// no-op locally.
    pub async fn upload(
        &mut self,
        table: &str,
        batches: Vec<RecordBatch>,
        mode: InsertMode,
        destination: Option<&str>,
    ) -> Result<UploadResult, ClientError> {
        if batches.is_empty() {
            debug!(table, "upload has no batches; nothing to send");
            return Ok(UploadResult {
                table_name: table.to_string(),
                rows_written: 0,
                snapshot: SnapshotOutcome::Skipped,
            });
        }

        let command = UploadCommand {
            table: table.to_string(),
            mode: mode.as_str().to_string(),
            destination: destination.map(|s| s.to_string()),
        };
        let payload = serde_json::to_vec(&command).map_err(|e| ClientError::Decode {
            what: "upload command".to_string(),
            message: e.to_string(),
        })?;
        let descriptor = FlightDescriptor::new_cmd(payload);

        let flight_data = FlightDataEncoderBuilder::new()
            .with_flight_descriptor(Some(descriptor))
            .build(stream::iter(batches.into_iter().map(Ok)));

        let results: Vec<arrow_flight::PutResult> = self
            .inner
            .do_put(flight_data)
            .await
            .map_err(|e| map_flight_error("upload", Some(table), e))?
            .try_collect()
            .await
            .map_err(|e| map_flight_error("upload", Some(table), e))?;

        let put_result = results.last().ok_or_else(|| ClientError::Decode {
            what: "upload response".to_string(),
            message: "server returned no PutResult".to_string(),
        })?;

        serde_json::from_slice(&put_result.app_metadata).map_err(|e| ClientError::Decode {
            what: "upload result".to_string(),
            message: e.to_string(),
        })
    }

    /// Fetch all batches of `table` via DoGet.
    pub async fn fetch(&mut self, table: &str) -> Result<Vec<RecordBatch>, ClientError> {
        let ticket = Ticket::new(table.to_string());

        let stream: FlightRecordBatchStream = self
            .inner
            .do_get(ticket)
            .await
            .map_err(|e| map_flight_error("read", Some(table), e))?;

        stream
            .try_collect()
            .await
            .map_err(|e| map_flight_error("read", Some(table), e))
    }

    /// Fetch `table` and concatenate everything into one in-memory batch.
    ///
    /// Unbounded: the caller owns the decision that the result is safe to
    /// materialize.
    pub async fn execute(&mut self, table: &str) -> Result<RecordBatch, ClientError> {
        let batches = self.fetch(table).await?;

        let schema = match batches.first() {
            Some(batch) => batch.schema(),
            None => {
                // Empty table: fall back to the declared schema.
                let schema = self.get_schema(table).await?;
                return Ok(RecordBatch::new_empty(std::sync::Arc::new(schema)));
            }
        };

        concat_batches(&schema, &batches).context(ArrowSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field};
    use arrow::ipc::writer::IpcWriteOptions;
    use arrow_flight::{IpcMessage, SchemaAsIpc};

    #[test]
    fn config_builder_sets_endpoint() {
        let config = ClientConfig::new()
            .host("10.0.0.7")
            .port(9090)
            .connect_timeout(Duration::from_millis(250));

        assert_eq!(config.uri(), "http://10.0.0.7:9090");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn ipc_schema_roundtrip() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("value", DataType::Utf8, true),
        ]);

        let options = IpcWriteOptions::default();
        let message: IpcMessage = SchemaAsIpc::new(&schema, &options)
            .try_into()
            .expect("encode schema");

        let decoded = decode_ipc_schema(&message.0).expect("decode schema");
        assert_eq!(decoded, schema);
    }

    #[test]
    fn garbage_schema_bytes_fail_to_decode() {
        let err = decode_ipc_schema(b"not a flatbuffer").expect_err("expected decode failure");
        assert!(matches!(err, ClientError::Decode { .. }));
    }
}
