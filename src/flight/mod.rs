//! Streaming exchange server.
//!
//! An Arrow Flight service exposing one bidirectional operation,
//! `calculate_m_value`. The first client message carries the operation
//! metadata as JSON `{operation, crs}` (raw bytes fall back to the operation
//! name with a WGS-84 default CRS); subsequent messages stream columnar event
//! batches. Results stream back with a single leading schema message.
//!
//! Incoming batches accumulate in memory up to a row threshold; above it they
//! spill to per-batch columnar files that are merged at stream end, and the
//! events load lazily from the merged file.

pub mod spill;

pub use spill::SpillWriter;

use std::net::SocketAddr;
use std::sync::Arc;

use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use arrow::record_batch::RecordBatch;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use log::{debug, info};
use serde::Deserialize;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::error::{LrsError, Result};
use crate::events::Events;
use crate::geom::{Geometry, WGS84};
use crate::pipeline;
use crate::repo::Repository;

/// The one supported exchange operation.
pub const CALCULATE_M_VALUE: &str = "calculate_m_value";

/// Operation metadata sent in the first exchange message.
#[derive(Debug, Default, Deserialize)]
struct ExchangeAction {
    #[serde(default)]
    operation: String,
    #[serde(default)]
    crs: String,
}

/// Flight service backed by the LRS repository.
pub struct LrsFlightService {
    repo: Arc<Repository>,
    target_crs: String,
    spill_threshold: usize,
}

impl LrsFlightService {
    pub fn new(repo: Arc<Repository>, target_crs: impl Into<String>, spill_threshold: usize) -> Self {
        LrsFlightService {
            repo,
            target_crs: target_crs.into(),
            spill_threshold,
        }
    }

    async fn handle_calculate_m_value(
        &self,
        stream: Streaming<FlightData>,
        crs: String,
    ) -> std::result::Result<Response<BoxStream<'static, std::result::Result<FlightData, Status>>>, Status>
    {
        let decoder =
            FlightRecordBatchStream::new_from_flight_data(stream.map_err(FlightError::from));

        // The spill writer owns the temp directory backing a merged file, so
        // it must outlive the pipeline run.
        let (events, _spill) = collect_events(decoder, self.spill_threshold, &crs).await?;

        let result = pipeline::process_events(&self.repo, events, &self.target_crs).await?;

        let batches: Vec<RecordBatch> = result.records().to_vec();
        let schema = batches[0].schema();
        let output = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(stream::iter(
                batches.into_iter().map(Ok::<RecordBatch, FlightError>),
            ))
            .map_err(Status::from)
            .boxed();

        Ok(Response::new(output))
    }
}

/// Parse `{operation, crs}` from the first exchange message, with raw-bytes
/// fallback for the operation name and a WGS-84 default CRS.
fn parse_exchange_action(data: &FlightData) -> (String, String) {
    let raw: &[u8] = if !data.app_metadata.is_empty() {
        &data.app_metadata
    } else if let Some(descriptor) = &data.flight_descriptor {
        &descriptor.cmd
    } else {
        &[]
    };

    if raw.is_empty() {
        return (String::new(), WGS84.to_string());
    }

    match serde_json::from_slice::<ExchangeAction>(raw) {
        Ok(action) if !action.operation.is_empty() => {
            let crs = if action.crs.is_empty() {
                WGS84.to_string()
            } else {
                action.crs
            };
            (action.operation, crs)
        }
        _ => (
            String::from_utf8_lossy(raw).into_owned(),
            WGS84.to_string(),
        ),
    }
}

/// Drain the decoded client stream into events, spilling past the threshold.
async fn collect_events<S>(
    mut stream: S,
    spill_threshold: usize,
    crs: &str,
) -> Result<(Events, Option<SpillWriter>)>
where
    S: Stream<Item = std::result::Result<RecordBatch, FlightError>> + Unpin,
{
    let mut batches: Vec<RecordBatch> = Vec::new();
    let mut buffered_rows = 0usize;
    let mut spill: Option<SpillWriter> = None;

    while let Some(batch) = stream
        .try_next()
        .await
        .map_err(|e| LrsError::validation(format!("failed to decode exchange stream: {}", e)))?
    {
        debug!("[Flight] received batch with {} rows", batch.num_rows());
        buffered_rows += batch.num_rows();
        batches.push(batch);

        if buffered_rows >= spill_threshold {
            info!(
                "[Flight] {} buffered rows exceed threshold {}, spilling",
                buffered_rows, spill_threshold
            );
            if spill.is_none() {
                spill = Some(SpillWriter::new()?);
            }
            if let Some(writer) = spill.as_mut() {
                writer.write_batches(&batches)?;
            }
            batches.clear();
            buffered_rows = 0;
        }
    }

    match spill {
        Some(mut writer) => {
            if !batches.is_empty() {
                writer.write_batches(&batches)?;
            }
            let merged = writer.merge()?;
            let events = Events::from_file(merged, crs)?;
            Ok((events, Some(writer)))
        }
        None => {
            if batches.is_empty() {
                return Err(LrsError::validation("no events received on exchange stream"));
            }
            Ok((Events::from_batches(batches, crs)?, None))
        }
    }
}

#[tonic::async_trait]
impl FlightService for LrsFlightService {
    type HandshakeStream = BoxStream<'static, std::result::Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, std::result::Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, std::result::Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, std::result::Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, std::result::Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, std::result::Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, std::result::Result<FlightData, Status>>;

    async fn do_exchange(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> std::result::Result<Response<Self::DoExchangeStream>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty exchange stream"))?;

        let (operation, crs) = parse_exchange_action(&first);
        info!("[Flight] operation: {}, crs: {}", operation, crs);

        match operation.as_str() {
            CALCULATE_M_VALUE => self.handle_calculate_m_value(stream, crs).await,
            other => Err(Status::invalid_argument(format!(
                "unsupported operation: {}",
                other
            ))),
        }
    }

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> std::result::Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not supported"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> std::result::Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights is not supported"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("get_flight_info is not supported"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("get_schema is not supported"))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> std::result::Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("do_get is not supported"))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> std::result::Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put is not supported"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> std::result::Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("do_action is not supported"))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListActionsStream>, Status> {
        let actions = stream::iter(vec![Ok(ActionType {
            r#type: CALCULATE_M_VALUE.to_string(),
            description: "Project point events onto routes and interpolate M-values".to_string(),
        })])
        .boxed();
        Ok(Response::new(actions))
    }
}

/// Serve the Flight service until the process exits.
pub async fn serve(
    repo: Arc<Repository>,
    port: u16,
    target_crs: impl Into<String>,
    spill_threshold: usize,
) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| LrsError::validation(format!("invalid flight bind address: {}", e)))?;

    info!("[Flight] serving on {}", addr);
    Server::builder()
        .add_service(FlightServiceServer::new(LrsFlightService::new(
            repo,
            target_crs,
            spill_threshold,
        )))
        .serve(addr)
        .await
        .map_err(|e| LrsError::io(format!("flight server failed: {}", e)))
}
