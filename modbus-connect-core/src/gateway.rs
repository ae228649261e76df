//! Gateway connection management and plan execution.
//!
//! One [`Gateway`] owns the single persistent connection to a Modbus TCP
//! endpoint. All wire access goes through its transaction lock, so the
//! many logical consumers sharing the connection never interleave
//! requests. A process-wide registry hands out one gateway per
//! `(host, port)` and is torn down explicitly on unload.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::entity::ModbusDataType;
use crate::plan::ReadPlan;
use crate::value::Payload;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while talking to a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway could not be reached at connect time.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The device answered with a Modbus exception.
    #[error("Device exception: {0}")]
    Protocol(String),

    /// The transport failed mid-transaction.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A read was attempted without an established connection.
    #[error("Not connected")]
    NotConnected,
}

/// The wire seam the gateway reads through.
///
/// Production uses [`TcpTransport`]; tests inject scripted transports.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Establish the connection.
    async fn connect(&mut self) -> Result<(), GatewayError>;

    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Tear the connection down.
    async fn disconnect(&mut self);

    /// Issue one read transaction in the given address space.
    async fn read(
        &mut self,
        slave_id: u8,
        data_type: ModbusDataType,
        address: u16,
        count: u16,
    ) -> Result<Payload, GatewayError>;
}

/// Persistent Modbus TCP connection with lazy (re)connect.
pub struct TcpTransport {
    host: String,
    port: u16,
    ctx: Option<Context>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ctx: None,
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                GatewayError::Connection(format!(
                    "Failed to resolve {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;
        let addr = addrs.next().ok_or_else(|| {
            GatewayError::Connection(format!("No address for {}:{}", self.host, self.port))
        })?;

        let ctx = tokio::time::timeout(CONNECT_TIMEOUT, tcp::connect(addr))
            .await
            .map_err(|_| GatewayError::Connection("Connection timeout".to_string()))?
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        self.ctx = Some(ctx);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    async fn read(
        &mut self,
        slave_id: u8,
        data_type: ModbusDataType,
        address: u16,
        count: u16,
    ) -> Result<Payload, GatewayError> {
        let ctx = self.ctx.as_mut().ok_or(GatewayError::NotConnected)?;
        ctx.set_slave(Slave(slave_id));

        let response = match data_type {
            ModbusDataType::Coil => ctx
                .read_coils(address, count)
                .await
                .map(|inner| inner.map(Payload::Bits)),
            ModbusDataType::DiscreteInput => ctx
                .read_discrete_inputs(address, count)
                .await
                .map(|inner| inner.map(Payload::Bits)),
            ModbusDataType::HoldingRegister => ctx
                .read_holding_registers(address, count)
                .await
                .map(|inner| inner.map(Payload::Words)),
            ModbusDataType::InputRegister => ctx
                .read_input_registers(address, count)
                .await
                .map(|inner| inner.map(Payload::Words)),
        };

        match response {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(exception)) => Err(GatewayError::Protocol(format!("{exception:?}"))),
            Err(e) => {
                // The stream state is unknown after a transport failure;
                // drop it so the next cycle reconnects.
                self.ctx = None;
                Err(GatewayError::Transport(e.to_string()))
            }
        }
    }
}

/// Outcome of one entity's read within a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The entity's payload slice, duplicated for aliased entities.
    Success(Payload),
    /// The operation covering this entity failed this cycle.
    Failed,
}

/// Result of executing one read plan: exactly one entry per entity in
/// the plan, or no entries at all when the gateway was unreachable.
#[derive(Debug, Default)]
pub struct PollResult {
    pub entries: HashMap<String, ReadOutcome>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One physical Modbus TCP endpoint shared by all slaves behind it.
pub struct Gateway {
    host: String,
    port: u16,
    transport: Mutex<Box<dyn ModbusTransport>>,
}

impl Gateway {
    /// Gateway over the production TCP transport. No I/O happens until
    /// the first use.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let transport = TcpTransport::new(host.clone(), port);
        Self {
            host,
            port,
            transport: Mutex::new(Box::new(transport)),
        }
    }

    /// Gateway over a caller-supplied transport.
    pub fn with_transport(
        host: impl Into<String>,
        port: u16,
        transport: Box<dyn ModbusTransport>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            transport: Mutex::new(transport),
        }
    }

    /// `host:port` identifier used in logs and the registry.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect now if not already connected. Used at setup to report
    /// readiness; poll cycles reconnect on their own.
    pub async fn try_connect(&self) -> Result<(), GatewayError> {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            return Ok(());
        }
        transport.connect().await
    }

    /// Read `count` words/bits starting at `address`, chunked into
    /// sequential sub-reads of at most `max_read_size` and concatenated
    /// in order. Any failing sub-read fails the whole call.
    pub async fn read_range(
        &self,
        slave_id: u8,
        data_type: ModbusDataType,
        address: u16,
        count: u16,
        max_read_size: u16,
    ) -> Result<Payload, GatewayError> {
        let mut transport = self.transport.lock().await;
        read_range_on(transport.as_mut(), slave_id, data_type, address, count, max_read_size).await
    }

    /// Execute a read plan under the gateway's transaction lock.
    ///
    /// The lock is acquired exactly once per call. When disconnected, a
    /// reconnect is attempted first; if that fails the cycle is skipped
    /// with a warning and an empty result. A failed operation marks only
    /// the entities mapped to it and execution continues with the next
    /// operation.
    pub async fn run_plan(&self, plan: &ReadPlan, max_read_size: u16) -> PollResult {
        let mut transport = self.transport.lock().await;

        if !transport.is_connected() {
            if let Err(e) = transport.connect().await {
                warn!("Gateway {} not connected: {}", self.key(), e);
                return PollResult::default();
            }
        }

        let mut payloads: Vec<Option<Payload>> = vec![None; plan.operations.len()];
        for (index, op) in plan.operations.iter().enumerate() {
            match read_range_on(
                transport.as_mut(),
                op.slave_id,
                op.data_type,
                op.start,
                op.count,
                max_read_size,
            )
            .await
            {
                Ok(payload) => {
                    debug!(
                        "Gateway {}: read {} {} @ {} (slave {})",
                        self.key(),
                        op.count,
                        op.data_type,
                        op.start,
                        op.slave_id
                    );
                    payloads[index] = Some(payload);
                }
                Err(e) => {
                    warn!(
                        "Gateway {}: failed to read {} @ {} (slave {}): {}",
                        self.key(),
                        op.data_type,
                        op.start,
                        op.slave_id,
                        e
                    );
                }
            }
        }

        let mut entries = HashMap::with_capacity(plan.mapping.len());
        for (key, segments) in &plan.mapping {
            let mut assembled: Option<Payload> = None;
            for segment in segments {
                let slice = payloads[segment.operation]
                    .as_ref()
                    .and_then(|payload| payload.slice(segment.offset, segment.len));
                match (assembled.as_mut(), slice) {
                    (None, Some(part)) => assembled = Some(part),
                    (Some(whole), Some(part)) => whole.append(part),
                    (_, None) => {
                        assembled = None;
                        break;
                    }
                }
            }
            let outcome = match assembled {
                Some(payload) => ReadOutcome::Success(payload),
                None => ReadOutcome::Failed,
            };
            entries.insert(key.clone(), outcome);
        }

        debug!(
            "Gateway {}: cycle complete, {}/{} operations succeeded",
            self.key(),
            payloads.iter().filter(|p| p.is_some()).count(),
            plan.operations.len()
        );

        PollResult { entries }
    }

    pub(crate) async fn disconnect(&self) {
        self.transport.lock().await.disconnect().await;
    }
}

async fn read_range_on(
    transport: &mut dyn ModbusTransport,
    slave_id: u8,
    data_type: ModbusDataType,
    address: u16,
    count: u16,
    max_read_size: u16,
) -> Result<Payload, GatewayError> {
    let max = max_read_size.max(1);
    let mut remaining = count;
    let mut cursor = address;
    let mut assembled: Option<Payload> = None;

    while remaining > 0 {
        let chunk = remaining.min(max);
        let part = transport.read(slave_id, data_type, cursor, chunk).await?;
        match assembled.as_mut() {
            None => assembled = Some(part),
            Some(whole) => whole.append(part),
        }
        cursor = cursor.wrapping_add(chunk);
        remaining -= chunk;
    }

    Ok(assembled.unwrap_or_else(|| {
        if data_type.is_bits() {
            Payload::Bits(Vec::new())
        } else {
            Payload::Words(Vec::new())
        }
    }))
}

static REGISTRY: OnceLock<parking_lot::Mutex<HashMap<String, Arc<Gateway>>>> = OnceLock::new();

fn registry() -> &'static parking_lot::Mutex<HashMap<String, Arc<Gateway>>> {
    REGISTRY.get_or_init(Default::default)
}

/// Return the process-wide gateway for `(host, port)`, creating it on
/// first use. Repeated calls with the same key return the identical
/// instance; creation is atomic under the registry's own lock.
pub fn get_connection(host: &str, port: u16) -> Arc<Gateway> {
    let mut gateways = registry().lock();
    gateways
        .entry(format!("{host}:{port}"))
        .or_insert_with(|| Arc::new(Gateway::new(host, port)))
        .clone()
}

/// Tear down every cached connection. Invoked on integration unload.
pub async fn close_all() {
    let gateways: Vec<Arc<Gateway>> = registry().lock().drain().map(|(_, g)| g).collect();
    for gateway in gateways {
        gateway.disconnect().await;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use crate::entity::{ControlKind, Conversion, EntityDescriptor, SlaveEntity};
    use crate::plan::build_plan;

    fn holding(key: &str, address: u16, count: u16) -> SlaveEntity {
        SlaveEntity::new(
            1,
            EntityDescriptor {
                key: key.to_string(),
                name: key.to_string(),
                register_address: address,
                register_count: count,
                data_type: ModbusDataType::HoldingRegister,
                conversion: Conversion::default(),
                control: ControlKind::Sensor,
            },
        )
    }

    #[tokio::test]
    async fn test_read_range_chunks_and_concatenates() {
        let (transport, log) = MockTransport::scripted(vec![
            Ok(Payload::Words(vec![1, 2, 3])),
            Ok(Payload::Words(vec![4, 5, 6])),
            Ok(Payload::Words(vec![7, 8, 9])),
        ]);
        let gateway = Gateway::with_transport("test-read-range", 502, Box::new(transport));
        gateway.try_connect().await.unwrap();

        let payload = gateway
            .read_range(1, ModbusDataType::HoldingRegister, 1, 9, 3)
            .await
            .unwrap();

        assert_eq!(payload, Payload::Words(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]));
        let log = log.lock();
        assert_eq!(
            log.reads,
            vec![
                (1, ModbusDataType::HoldingRegister, 1, 3),
                (1, ModbusDataType::HoldingRegister, 4, 3),
                (1, ModbusDataType::HoldingRegister, 7, 3),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_range_fails_whole_call_on_sub_read_failure() {
        let (transport, log) = MockTransport::scripted(vec![
            Ok(Payload::Words(vec![1, 2, 3])),
            Err(GatewayError::Protocol("IllegalDataAddress".to_string())),
        ]);
        let gateway = Gateway::with_transport("test-read-range-fail", 502, Box::new(transport));
        gateway.try_connect().await.unwrap();

        let result = gateway
            .read_range(1, ModbusDataType::HoldingRegister, 0, 9, 3)
            .await;

        assert!(result.is_err());
        // The failing sub-read stops the sequence.
        assert_eq!(log.lock().reads.len(), 2);
    }

    #[tokio::test]
    async fn test_run_plan_empty_plan_returns_empty_result() {
        let (transport, log) = MockTransport::scripted(Vec::new());
        let gateway = Gateway::with_transport("test-empty", 502, Box::new(transport));

        let plan = build_plan(&[], 8).unwrap();
        let result = gateway.run_plan(&plan, 8).await;

        assert!(result.is_empty());
        let log = log.lock();
        assert_eq!(log.connects, 1);
        assert!(log.reads.is_empty());
    }

    #[tokio::test]
    async fn test_run_plan_unreachable_gateway_returns_empty_result() {
        let (transport, log) = MockTransport::unreachable();
        let gateway = Gateway::with_transport("test-unreachable", 502, Box::new(transport));

        let plan = build_plan(&[holding("a", 0, 1)], 8).unwrap();
        let result = gateway.run_plan(&plan, 8).await;

        assert!(result.is_empty());
        assert!(log.lock().reads.is_empty());
    }

    #[tokio::test]
    async fn test_run_plan_isolates_failed_operation() {
        // Three entities far apart: three operations; the middle one fails.
        let entities = [holding("key1", 0, 1), holding("key2", 100, 1), holding("key3", 200, 1)];
        let plan = build_plan(&entities, 8).unwrap();
        assert_eq!(plan.operations.len(), 3);

        let (transport, log) = MockTransport::scripted(vec![
            Ok(Payload::Words(vec![11])),
            Err(GatewayError::Protocol("ServerDeviceFailure".to_string())),
            Ok(Payload::Words(vec![33])),
        ]);
        let gateway = Gateway::with_transport("test-isolation", 502, Box::new(transport));

        let result = gateway.run_plan(&plan, 8).await;

        assert_eq!(result.entries.len(), 3);
        assert_eq!(
            result.entries["key1"],
            ReadOutcome::Success(Payload::Words(vec![11]))
        );
        assert_eq!(result.entries["key2"], ReadOutcome::Failed);
        assert_eq!(
            result.entries["key3"],
            ReadOutcome::Success(Payload::Words(vec![33]))
        );
        // All three operations were attempted.
        assert_eq!(log.lock().reads.len(), 3);
    }

    #[tokio::test]
    async fn test_run_plan_duplicates_payload_for_aliases() {
        let entities = [holding("key1", 1, 1), holding("key2", 1, 1), holding("key3", 1, 1)];
        let plan = build_plan(&entities, 3).unwrap();
        assert_eq!(plan.operations.len(), 1);

        let (transport, log) = MockTransport::scripted(vec![Ok(Payload::Words(vec![7]))]);
        let gateway = Gateway::with_transport("test-alias", 502, Box::new(transport));

        let result = gateway.run_plan(&plan, 3).await;

        assert_eq!(log.lock().reads.len(), 1);
        for key in ["key1", "key2", "key3"] {
            assert_eq!(
                result.entries[key],
                ReadOutcome::Success(Payload::Words(vec![7]))
            );
        }
    }

    #[tokio::test]
    async fn test_run_plan_slices_coalesced_payload_per_entity() {
        let entities = [holding("a", 0, 2), holding("b", 2, 1)];
        let plan = build_plan(&entities, 8).unwrap();
        assert_eq!(plan.operations.len(), 1);

        let (transport, _log) = MockTransport::scripted(vec![Ok(Payload::Words(vec![10, 20, 30]))]);
        let gateway = Gateway::with_transport("test-slices", 502, Box::new(transport));

        let result = gateway.run_plan(&plan, 8).await;

        assert_eq!(
            result.entries["a"],
            ReadOutcome::Success(Payload::Words(vec![10, 20]))
        );
        assert_eq!(
            result.entries["b"],
            ReadOutcome::Success(Payload::Words(vec![30]))
        );
    }

    #[tokio::test]
    async fn test_run_plan_reassembles_split_entity() {
        let entities = [holding("big", 0, 6)];
        let plan = build_plan(&entities, 3).unwrap();
        assert_eq!(plan.operations.len(), 2);

        let (transport, _log) = MockTransport::scripted(vec![
            Ok(Payload::Words(vec![1, 2, 3])),
            Ok(Payload::Words(vec![4, 5, 6])),
        ]);
        let gateway = Gateway::with_transport("test-split", 502, Box::new(transport));

        let result = gateway.run_plan(&plan, 3).await;

        assert_eq!(
            result.entries["big"],
            ReadOutcome::Success(Payload::Words(vec![1, 2, 3, 4, 5, 6]))
        );
    }

    #[tokio::test]
    async fn test_run_plan_short_payload_marks_entity_failed() {
        let entities = [holding("a", 0, 2)];
        let plan = build_plan(&entities, 8).unwrap();

        let (transport, _log) = MockTransport::scripted(vec![Ok(Payload::Words(vec![1]))]);
        let gateway = Gateway::with_transport("test-short", 502, Box::new(transport));

        let result = gateway.run_plan(&plan, 8).await;
        assert_eq!(result.entries["a"], ReadOutcome::Failed);
    }

    // Single test for the process-wide registry: close_all tears down
    // every cached connection and would race a parallel idempotence test.
    #[tokio::test]
    async fn test_connection_registry_lifecycle() {
        let first = get_connection("registry-test-host", 1502);
        let second = get_connection("registry-test-host", 1502);
        assert!(Arc::ptr_eq(&first, &second));

        let other = get_connection("registry-test-host", 1503);
        assert!(!Arc::ptr_eq(&first, &other));

        close_all().await;
        let recreated = get_connection("registry-test-host", 1502);
        assert!(!Arc::ptr_eq(&first, &recreated));
    }
}
