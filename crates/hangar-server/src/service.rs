//! Flight service implementation over the table store.
//!
//! The service owns an `Arc<TableStore>` and translates the Flight surface
//! into store operations: `do_put` uploads, `do_get` streaming reads, the
//! `get_schema_using_query` action for probe queries, and catalog-backed
//! flight discovery. Store errors are logged with table context here and
//! cross the RPC boundary only as structured statuses.

use std::sync::Arc;

use arrow_flight::{
    encode::FlightDataEncoderBuilder,
    error::FlightError,
    flight_descriptor::DescriptorType,
    flight_service_server::FlightService,
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, IpcMessage, PollInfo, PutResult, SchemaAsIpc,
    SchemaResult, Ticket,
};
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

use hangar_core::{
    protocol::{UploadCommand, UploadResult, GET_SCHEMA_ACTION},
    store::{InsertMode, StoreError, TableStore},
};

/// Flight service over one table store.
pub struct HangarFlightService {
    store: Arc<TableStore>,
}

impl HangarFlightService {
    /// Create the service over `store`.
    pub fn new(store: Arc<TableStore>) -> Self {
        Self { store }
    }

    /// Log `err` with context, then wrap it as a structured status.
    ///
    /// Raw internal errors never cross the RPC boundary; callers get the
    /// failing table and phase in the message.
    fn status_from_store(phase: &str, table: &str, err: StoreError) -> Status {
        error!(table, phase, error = %err, "store operation failed");
        match err {
            StoreError::NotFound { table } => Status::not_found(format!("table {table} not found")),
            StoreError::SchemaConflict { .. } => Status::already_exists(err.to_string()),
            StoreError::InvalidQuery { .. } => Status::invalid_argument(err.to_string()),
            other => Status::internal(format!("{phase} failed for table {table}: {other}")),
        }
    }

    fn table_from_descriptor(descriptor: &FlightDescriptor) -> Result<String, Status> {
        match descriptor.r#type() {
            DescriptorType::Path => descriptor
                .path
                .first()
                .cloned()
                .ok_or_else(|| Status::invalid_argument("descriptor path is empty")),
            DescriptorType::Cmd => {
                let cmd: UploadCommand = serde_json::from_slice(&descriptor.cmd).map_err(|e| {
                    Status::invalid_argument(format!("descriptor command is not valid JSON: {e}"))
                })?;
                Ok(cmd.table)
            }
            DescriptorType::Unknown => Err(Status::invalid_argument("unknown descriptor type")),
        }
    }

    async fn flight_info_for_table(
        &self,
        table: &str,
        descriptor: FlightDescriptor,
    ) -> Result<FlightInfo, Status> {
        let schema = self
            .store
            .table_schema(table)
            .await
            .map_err(|e| Self::status_from_store("schema lookup", table, e))?;

        FlightInfo::new()
            .try_with_schema(&schema)
            .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))
            .map(|info| {
                info.with_endpoint(
                    FlightEndpoint::new().with_ticket(Ticket::new(table.to_string())),
                )
                .with_descriptor(descriptor)
            })
    }

    fn upload_command(descriptor: &FlightDescriptor) -> Result<UploadCommand, Status> {
        match descriptor.r#type() {
            DescriptorType::Cmd => serde_json::from_slice(&descriptor.cmd).map_err(|e| {
                Status::invalid_argument(format!("upload command is not valid JSON: {e}"))
            }),
            DescriptorType::Path => {
                let table = descriptor
                    .path
                    .first()
                    .cloned()
                    .ok_or_else(|| Status::invalid_argument("descriptor path is empty"))?;
                Ok(UploadCommand {
                    table,
                    mode: "append".to_string(),
                    destination: None,
                })
            }
            DescriptorType::Unknown => Err(Status::invalid_argument("unknown descriptor type")),
        }
    }
}

#[tonic::async_trait]
impl FlightService for HangarFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        let response = HandshakeResponse::default();
        Ok(Response::new(stream::once(async { Ok(response) }).boxed()))
    }

    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let tables = self
            .store
            .list_tables()
            .await
            .map_err(|e| Self::status_from_store("catalog scan", "*", e))?;

        let mut flights = Vec::with_capacity(tables.len());
        for table in tables {
            let descriptor = FlightDescriptor::new_path(vec![table.clone()]);
            flights.push(self.flight_info_for_table(&table, descriptor).await?);
        }

        Ok(Response::new(stream::iter(flights.into_iter().map(Ok)).boxed()))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        let table = Self::table_from_descriptor(&descriptor)?;
        let info = self.flight_info_for_table(&table, descriptor).await?;
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("PollFlightInfo is not supported"))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = request.into_inner();
        let table = Self::table_from_descriptor(&descriptor)?;

        // Same code path as the probe action: a synthesized zero-row query.
        let query = format!("SELECT * FROM {table}");
        let schema = self
            .store
            .read_schema(&query)
            .await
            .map_err(|e| Self::status_from_store("schema probe", &table, e))?;

        let options = arrow::ipc::writer::IpcWriteOptions::default();
        let result = SchemaResult::try_from(SchemaAsIpc::new(&schema, &options))
            .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))?;
        Ok(Response::new(result))
    }

    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn do_get(&self, request: Request<Ticket>) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = request.into_inner();
        let table = String::from_utf8(ticket.ticket.to_vec())
            .map_err(|_| Status::invalid_argument("ticket is not valid UTF-8"))?
            .trim()
            .to_string();
        if table.is_empty() {
            return Err(Status::invalid_argument("ticket does not name a table"));
        }

        info!(table = %table, "starting table read");

        let batches = self
            .store
            .stream_batches(&table, self.store.scan_options(None))
            .await
            .map_err(|e| Self::status_from_store("read", &table, e))?;

        // Client disconnects drop this stream, which releases the segment
        // readers underneath without further I/O.
        let owner = table.clone();
        let encoded = FlightDataEncoderBuilder::new()
            .build(batches.map_err(move |e| {
                error!(table = %owner, error = %e, "read stream failed");
                FlightError::ExternalError(Box::new(e))
            }))
            .map_err(|e| Status::internal(format!("failed to encode batch: {e}")));

        Ok(Response::new(encoded.boxed()))
    }

    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        let mut stream = request.into_inner();

        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("upload stream is empty"))?;
        let descriptor = first
            .flight_descriptor
            .clone()
            .ok_or_else(|| Status::invalid_argument("upload is missing a flight descriptor"))?;

        let command = Self::upload_command(&descriptor)?;
        let mode = InsertMode::parse(&command.mode).ok_or_else(|| {
            Status::invalid_argument(format!("unknown insert mode {:?}", command.mode))
        })?;

        if let Some(destination) = &command.destination {
            info!(table = %command.table, destination = %destination, "upload routed by destination hint");
        }

        let data_stream = stream::once(async move { Ok::<FlightData, FlightError>(first) })
            .chain(stream.map_err(FlightError::Tonic));
        let mut decoder =
            arrow_flight::decode::FlightRecordBatchStream::new_from_flight_data(data_stream);

        let mut batches = Vec::new();
        while let Some(batch) = decoder
            .try_next()
            .await
            .map_err(|e| Status::invalid_argument(format!("failed to decode upload data: {e}")))?
        {
            batches.push(batch);
        }

        let report = self
            .store
            .insert(&command.table, &batches, mode)
            .await
            .map_err(|e| Self::status_from_store("insert", &command.table, e))?;

        if report.rows_written == 0 {
            warn!(table = %command.table, "no data to store");
        }

        let result = UploadResult::from(&report);
        let app_metadata = serde_json::to_vec(&result)
            .map_err(|e| Status::internal(format!("failed to encode upload result: {e}")))?;

        Ok(Response::new(
            stream::once(async move {
                Ok(PutResult {
                    app_metadata: app_metadata.into(),
                })
            })
            .boxed(),
        ))
    }

    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("DoExchange is not supported"))
    }

    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = request.into_inner();

        match action.r#type.as_str() {
            GET_SCHEMA_ACTION => {
                let query = String::from_utf8(action.body.to_vec())
                    .map_err(|_| Status::invalid_argument("probe query is not valid UTF-8"))?;

                let schema = self
                    .store
                    .read_schema(&query)
                    .await
                    .map_err(|e| Self::status_from_store("schema probe", &query, e))?;

                let options = arrow::ipc::writer::IpcWriteOptions::default();
                let message: IpcMessage = SchemaAsIpc::new(&schema, &options)
                    .try_into()
                    .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))?;

                let body = message.0;
                Ok(Response::new(
                    stream::once(async move { Ok(arrow_flight::Result { body }) }).boxed(),
                ))
            }
            other => Err(Status::unimplemented(format!("unknown action {other:?}"))),
        }
    }

    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![ActionType {
            r#type: GET_SCHEMA_ACTION.to_string(),
            description: "Plan a SQL query without executing it and return the schema".to_string(),
        }];
        Ok(Response::new(stream::iter(actions.into_iter().map(Ok)).boxed()))
    }
}
