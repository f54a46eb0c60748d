/// In-memory radio pair.
///
/// `LoopbackAir` stands in for the platform: it implements both radio
/// traits over shared state and queues the callbacks a real stack would
/// deliver. Channels are byte pipes with a configurable per-read limit so
/// partial reads can be exercised. Nothing is delivered until the events are
/// drained, either by hand or with `LoopbackAir::pump`.

use super::central::{CentralEvent, CentralRadio};
use super::framing::MAX_CHUNK;
use super::gatt::{Advertisement, PeripheralId, Psm, RadioError, RadioState, ServiceDefinition};
use super::peripheral::{PeripheralEvent, PeripheralRadio, ReadRequestId, ReadResponse};
use super::session::{ChannelEvent, DuplexChannel};
use crate::link::PeerLink;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Handle the central sees for the loopback responder
pub const LOOPBACK_PERIPHERAL: PeripheralId = PeripheralId(1);

const BYSTANDER_BASE: u64 = 100;
const ADVERT_RSSI: i16 = -42;
const PUMP_LIMIT: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Central,
    Peripheral,
}

#[derive(Default)]
struct Pipe {
    to_central: VecDeque<u8>,
    to_peripheral: VecDeque<u8>,
    open: bool,
    central_done: bool,
    peripheral_done: bool,
}

impl Pipe {
    fn inbound(&mut self, side: Side) -> &mut VecDeque<u8> {
        match side {
            Side::Central => &mut self.to_central,
            Side::Peripheral => &mut self.to_peripheral,
        }
    }

    fn outbound(&mut self, side: Side) -> &mut VecDeque<u8> {
        match side {
            Side::Central => &mut self.to_peripheral,
            Side::Peripheral => &mut self.to_central,
        }
    }

    fn finish(&mut self, side: Side) {
        match side {
            Side::Central => self.central_done = true,
            Side::Peripheral => self.peripheral_done = true,
        }
    }

    fn is_released(&self) -> bool {
        !self.open && self.central_done && self.peripheral_done
    }
}

struct Air {
    central_events: VecDeque<CentralEvent>,
    peripheral_events: VecDeque<PeripheralEvent>,
    radio_state: RadioState,
    listen_psm: Psm,
    published: Option<Psm>,
    services: Vec<ServiceDefinition>,
    advertisement: Option<Advertisement>,
    bystanders: Vec<Advertisement>,
    scanning: bool,
    connected: bool,
    duplicate_adverts: bool,
    read_limit: usize,
    next_request: u64,
    pending_reads: HashMap<ReadRequestId, Uuid>,
    pipes: HashMap<u64, Pipe>,
    next_pipe: u64,
}

impl Air {
    fn new() -> Self {
        let mut air = Self {
            central_events: VecDeque::new(),
            peripheral_events: VecDeque::new(),
            radio_state: RadioState::PoweredOn,
            listen_psm: Psm::DYNAMIC_START,
            published: None,
            services: Vec::new(),
            advertisement: None,
            bystanders: Vec::new(),
            scanning: false,
            connected: false,
            duplicate_adverts: false,
            read_limit: MAX_CHUNK,
            next_request: 1,
            pending_reads: HashMap::new(),
            pipes: HashMap::new(),
            next_pipe: 1,
        };
        air.broadcast_state();
        air
    }

    fn powered(&self, operation: &'static str) -> Result<(), RadioError> {
        if self.radio_state.is_powered_on() {
            Ok(())
        } else {
            Err(RadioError::new(operation, format!("radio is {:?}", self.radio_state)))
        }
    }

    fn broadcast_state(&mut self) {
        self.central_events
            .push_back(CentralEvent::StateChanged(self.radio_state));
        self.peripheral_events
            .push_back(PeripheralEvent::StateChanged(self.radio_state));
    }

    /// Report every visible advertisement to a scanning central
    fn announce(&mut self) {
        if !self.scanning {
            return;
        }
        for (i, advertisement) in self.bystanders.iter().enumerate() {
            self.central_events.push_back(CentralEvent::Discovered {
                peripheral: PeripheralId(BYSTANDER_BASE + i as u64),
                advertisement: advertisement.clone(),
            });
        }
        if let Some(advertisement) = &self.advertisement {
            let copies = if self.duplicate_adverts { 2 } else { 1 };
            for _ in 0..copies {
                self.central_events.push_back(CentralEvent::Discovered {
                    peripheral: LOOPBACK_PERIPHERAL,
                    advertisement: advertisement.clone(),
                });
            }
        }
    }

    fn notify(&mut self, side: Side, event: ChannelEvent) {
        match side {
            Side::Central => self.central_events.push_back(CentralEvent::Channel(event)),
            Side::Peripheral => self
                .peripheral_events
                .push_back(PeripheralEvent::Channel(event)),
        }
    }

    /// Close a pipe. Each remaining end hears `Ended` once its inbound
    /// bytes are drained.
    fn close_pipe(&mut self, id: u64, from: Option<Side>) {
        let Some(pipe) = self.pipes.get_mut(&id) else {
            return;
        };
        if !pipe.open {
            return;
        }
        pipe.open = false;

        let mut ended = Vec::new();
        for side in [Side::Central, Side::Peripheral] {
            if Some(side) != from && pipe.inbound(side).is_empty() {
                ended.push(side);
            }
        }
        for side in ended {
            self.notify(side, ChannelEvent::Ended);
            self.finish_end(id, side);
        }
        if let Some(side) = from {
            self.finish_end(id, side);
        }
        debug!("Loopback pipe {} closed", id);
    }

    /// Mark one end of a closed pipe as done; the pipe goes once both are
    fn finish_end(&mut self, id: u64, side: Side) {
        let Some(pipe) = self.pipes.get_mut(&id) else {
            return;
        };
        pipe.finish(side);
        if pipe.is_released() {
            self.pipes.remove(&id);
            trace!("Loopback pipe {} released", id);
        }
    }

    fn close_all_pipes(&mut self, from: Option<Side>) {
        let open: Vec<u64> = self
            .pipes
            .iter()
            .filter(|(_, pipe)| pipe.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            self.close_pipe(id, from);
        }
    }

    /// Link loss: bytes in flight are gone and both ends hear `Ended`
    fn sever_pipes(&mut self) {
        for pipe in self.pipes.values_mut() {
            pipe.to_central.clear();
            pipe.to_peripheral.clear();
        }
        self.close_all_pipes(None);
    }
}

/// Shared in-memory radio environment for one initiator and one responder
#[derive(Clone)]
pub struct LoopbackAir {
    air: Arc<Mutex<Air>>,
}

impl Default for LoopbackAir {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackAir {
    /// Powered-on air. Both sides have a `StateChanged(PoweredOn)` queued.
    pub fn new() -> Self {
        Self {
            air: Arc::new(Mutex::new(Air::new())),
        }
    }

    /// PSM the responder radio allocates when publishing
    pub fn with_psm(self, psm: Psm) -> Self {
        self.air.lock().listen_psm = psm;
        self
    }

    /// Cap the bytes returned by a single channel read
    pub fn with_read_limit(self, limit: usize) -> Self {
        self.air.lock().read_limit = limit.max(1);
        self
    }

    /// Report every advertisement twice, as some stacks do
    pub fn with_duplicate_adverts(self, duplicates: bool) -> Self {
        self.air.lock().duplicate_adverts = duplicates;
        self
    }

    /// Add an unrelated advertiser the central will also see
    pub fn with_bystander(self, advertisement: Advertisement) -> Self {
        self.air.lock().bystanders.push(advertisement);
        self
    }

    pub fn central(&self) -> LoopbackCentral {
        LoopbackCentral {
            air: Arc::clone(&self.air),
        }
    }

    pub fn peripheral(&self) -> LoopbackPeripheral {
        LoopbackPeripheral {
            air: Arc::clone(&self.air),
        }
    }

    /// Change radio power. Losing power drops every registration and link.
    pub fn set_radio_state(&self, state: RadioState) {
        let mut air = self.air.lock();
        air.radio_state = state;
        air.broadcast_state();
        if !state.is_powered_on() {
            air.scanning = false;
            air.advertisement = None;
            air.published = None;
            air.services.clear();
            air.connected = false;
            air.pending_reads.clear();
            air.sever_pipes();
        }
    }

    /// Allocate a new PSM; if a channel is published it moves to `psm`
    pub fn republish(&self, psm: Psm) {
        let mut air = self.air.lock();
        air.listen_psm = psm;
        if air.published.is_some() {
            air.published = Some(psm);
            air.peripheral_events
                .push_back(PeripheralEvent::ChannelPublished { result: Ok(psm) });
        }
    }

    /// Simulate link loss between the two radios
    pub fn drop_connection(&self) {
        let mut air = self.air.lock();
        if !air.connected {
            return;
        }
        air.connected = false;
        air.pending_reads.clear();
        air.sever_pipes();
        air.central_events.push_back(CentralEvent::Disconnected {
            peripheral: LOOPBACK_PERIPHERAL,
            reason: Some("connection lost".to_string()),
        });
    }

    pub fn next_central_event(&self) -> Option<CentralEvent> {
        self.air.lock().central_events.pop_front()
    }

    pub fn next_peripheral_event(&self) -> Option<PeripheralEvent> {
        self.air.lock().peripheral_events.pop_front()
    }

    pub fn inject_central(&self, event: CentralEvent) {
        self.air.lock().central_events.push_back(event);
    }

    pub fn inject_peripheral(&self, event: PeripheralEvent) {
        self.air.lock().peripheral_events.push_back(event);
    }

    pub fn is_scanning(&self) -> bool {
        self.air.lock().scanning
    }

    pub fn is_advertising(&self) -> bool {
        self.air.lock().advertisement.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.air.lock().connected
    }

    pub fn published_psm(&self) -> Option<Psm> {
        self.air.lock().published
    }

    pub fn registered_services(&self) -> usize {
        self.air.lock().services.len()
    }

    pub fn open_channels(&self) -> usize {
        self.air.lock().pipes.values().filter(|p| p.open).count()
    }

    /// Deliver queued events until both queues are empty. Central events go
    /// to `central_link`, peripheral events to `peripheral_link`.
    pub fn pump(&self, central_link: &mut PeerLink, peripheral_link: &mut PeerLink) -> usize {
        let mut delivered = 0;
        self.pump_until(central_link, peripheral_link, |_, _| {
            delivered += 1;
            false
        });
        delivered
    }

    /// Like [`pump`](Self::pump), but stop as soon as `done` holds after an
    /// event. Returns whether it did.
    pub fn pump_until(
        &self,
        central_link: &mut PeerLink,
        peripheral_link: &mut PeerLink,
        mut done: impl FnMut(&PeerLink, &PeerLink) -> bool,
    ) -> bool {
        for _ in 0..PUMP_LIMIT {
            let mut progressed = false;

            // Pop in its own statement so the lock is released before handling
            let central = self.next_central_event();
            if let Some(event) = central {
                trace!("loopback -> central: {:?}", event);
                central_link.handle_central_event(event);
                progressed = true;
                if done(central_link, peripheral_link) {
                    return true;
                }
            }

            let peripheral = self.next_peripheral_event();
            if let Some(event) = peripheral {
                trace!("loopback -> peripheral: {:?}", event);
                peripheral_link.handle_peripheral_event(event);
                progressed = true;
                if done(central_link, peripheral_link) {
                    return true;
                }
            }

            if !progressed {
                return false;
            }
        }
        warn!("Loopback pump stopped after {} rounds", PUMP_LIMIT);
        false
    }
}

/// Central half of [`LoopbackAir`]
pub struct LoopbackCentral {
    air: Arc<Mutex<Air>>,
}

impl CentralRadio for LoopbackCentral {
    fn scan(&mut self) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.powered("scan")?;
        air.scanning = true;
        air.announce();
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.air.lock().scanning = false;
    }

    fn connect(&mut self, peripheral: PeripheralId) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.powered("connect")?;
        if peripheral == LOOPBACK_PERIPHERAL && air.advertisement.is_some() {
            air.connected = true;
            air.central_events
                .push_back(CentralEvent::Connected { peripheral });
        } else {
            air.central_events.push_back(CentralEvent::ConnectFailed {
                peripheral,
                reason: "peripheral is not connectable".to_string(),
            });
        }
        Ok(())
    }

    fn cancel_connection(&mut self, peripheral: PeripheralId) {
        let mut air = self.air.lock();
        if peripheral != LOOPBACK_PERIPHERAL || !air.connected {
            return;
        }
        air.connected = false;
        air.pending_reads.clear();
        air.close_all_pipes(Some(Side::Central));
    }

    fn discover_services(
        &mut self,
        peripheral: PeripheralId,
        services: &[Uuid],
    ) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        if !air.connected {
            return Err(RadioError::new("discover_services", "not connected"));
        }
        let found = air
            .services
            .iter()
            .map(|s| s.uuid)
            .filter(|uuid| services.is_empty() || services.contains(uuid))
            .collect();
        air.central_events.push_back(CentralEvent::ServicesDiscovered {
            peripheral,
            result: Ok(found),
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
    ) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        if !air.connected {
            return Err(RadioError::new("discover_characteristics", "not connected"));
        }
        let result = air
            .services
            .iter()
            .find(|s| s.uuid == service)
            .map(ServiceDefinition::characteristic_uuids)
            .ok_or_else(|| format!("unknown service {}", service));
        air.central_events
            .push_back(CentralEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        _peripheral: PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        if !air.connected {
            return Err(RadioError::new("read_characteristic", "not connected"));
        }
        let request = ReadRequestId(air.next_request);
        air.next_request += 1;
        air.pending_reads.insert(request, characteristic);
        air.peripheral_events.push_back(PeripheralEvent::ReadRequest {
            request,
            characteristic,
        });
        Ok(())
    }

    fn open_channel(&mut self, peripheral: PeripheralId, psm: Psm) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        if !air.connected {
            return Err(RadioError::new("open_channel", "not connected"));
        }
        if air.published != Some(psm) {
            air.central_events.push_back(CentralEvent::ChannelOpened {
                peripheral,
                result: Err(format!("no channel listening on PSM {}", psm)),
            });
            return Ok(());
        }

        let id = air.next_pipe;
        air.next_pipe += 1;
        air.pipes.insert(
            id,
            Pipe {
                open: true,
                ..Pipe::default()
            },
        );
        let central_end = LoopbackChannel {
            air: Arc::clone(&self.air),
            pipe: id,
            side: Side::Central,
        };
        let peripheral_end = LoopbackChannel {
            air: Arc::clone(&self.air),
            pipe: id,
            side: Side::Peripheral,
        };
        air.central_events.push_back(CentralEvent::ChannelOpened {
            peripheral,
            result: Ok(Box::new(central_end)),
        });
        air.peripheral_events.push_back(PeripheralEvent::ChannelOpened {
            result: Ok(Box::new(peripheral_end)),
        });
        debug!("Loopback pipe {} opened on PSM {}", id, psm);
        Ok(())
    }
}

/// Peripheral half of [`LoopbackAir`]
pub struct LoopbackPeripheral {
    air: Arc<Mutex<Air>>,
}

impl PeripheralRadio for LoopbackPeripheral {
    fn add_service(&mut self, service: &ServiceDefinition) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.powered("add_service")?;
        let result = if air.services.iter().any(|s| s.uuid == service.uuid) {
            Err("service already registered".to_string())
        } else {
            air.services.push(service.clone());
            Ok(())
        };
        air.peripheral_events.push_back(PeripheralEvent::ServiceAdded {
            service: service.uuid,
            result,
        });
        Ok(())
    }

    fn remove_service(&mut self, service: Uuid) {
        self.air.lock().services.retain(|s| s.uuid != service);
    }

    fn start_advertising(&mut self, local_name: &str, services: &[Uuid]) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.powered("start_advertising")?;
        air.advertisement = Some(Advertisement {
            local_name: Some(local_name.to_string()),
            service_uuids: services.to_vec(),
            rssi: Some(ADVERT_RSSI),
        });
        air.peripheral_events
            .push_back(PeripheralEvent::AdvertisingStarted { result: Ok(()) });
        air.announce();
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.air.lock().advertisement = None;
    }

    fn publish_channel(&mut self, _encrypted: bool) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.powered("publish_channel")?;
        let psm = air.listen_psm;
        air.published = Some(psm);
        air.peripheral_events
            .push_back(PeripheralEvent::ChannelPublished { result: Ok(psm) });
        Ok(())
    }

    fn unpublish_channel(&mut self, psm: Psm) {
        let mut air = self.air.lock();
        if air.published == Some(psm) {
            air.published = None;
        }
    }

    fn respond_to_read(&mut self, request: ReadRequestId, response: ReadResponse) {
        let mut air = self.air.lock();
        let Some(characteristic) = air.pending_reads.remove(&request) else {
            warn!("Response to unknown read request {:?}", request);
            return;
        };
        let result = match response {
            ReadResponse::Value(bytes) => Ok(bytes),
            ReadResponse::Rejected(e) => Err(e.to_string()),
        };
        air.central_events.push_back(CentralEvent::CharacteristicRead {
            peripheral: LOOPBACK_PERIPHERAL,
            characteristic,
            result,
        });
    }
}

/// One end of an in-memory L2CAP pipe
pub struct LoopbackChannel {
    air: Arc<Mutex<Air>>,
    pipe: u64,
    side: Side,
}

impl DuplexChannel for LoopbackChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut air = self.air.lock();
        let limit = air.read_limit;
        let Some(pipe) = air.pipes.get_mut(&self.pipe) else {
            return Ok(0);
        };
        let open = pipe.open;
        let inbound = pipe.inbound(self.side);
        if inbound.is_empty() {
            return if open {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(0)
            };
        }

        let count = inbound.len().min(buf.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..count)) {
            *slot = byte;
        }
        let remaining = inbound.len();

        if remaining > 0 {
            air.notify(self.side, ChannelEvent::Readable);
        } else if !open {
            air.notify(self.side, ChannelEvent::Ended);
            air.finish_end(self.pipe, self.side);
        }
        Ok(count)
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut air = self.air.lock();
        let Some(pipe) = air.pipes.get_mut(&self.pipe).filter(|p| p.open) else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        pipe.outbound(self.side).extend(chunk.iter().copied());
        let peer = match self.side {
            Side::Central => Side::Peripheral,
            Side::Peripheral => Side::Central,
        };
        air.notify(peer, ChannelEvent::Readable);
        Ok(())
    }

    fn close(&mut self) {
        self.air.lock().close_pipe(self.pipe, Some(self.side));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::gatt::{PeerIdentifier, SERVICE_NAME};

    #[test]
    fn test_new_air_reports_power() {
        let air = LoopbackAir::new();
        assert!(matches!(
            air.next_central_event(),
            Some(CentralEvent::StateChanged(RadioState::PoweredOn))
        ));
        assert!(matches!(
            air.next_peripheral_event(),
            Some(PeripheralEvent::StateChanged(RadioState::PoweredOn))
        ));
        assert!(air.next_central_event().is_none());
    }

    #[test]
    fn test_scan_reports_advertisers() {
        let air = LoopbackAir::new()
            .with_duplicate_adverts(true)
            .with_bystander(Advertisement::new("speaker", vec![]));
        let mut central = air.central();
        let mut peripheral = air.peripheral();
        while air.next_central_event().is_some() {}

        peripheral
            .start_advertising(SERVICE_NAME, &[PeerIdentifier::RESPONDER.uuid()])
            .expect("advertise");
        central.scan().expect("scan");

        let mut seen = Vec::new();
        while let Some(event) = air.next_central_event() {
            if let CentralEvent::Discovered { peripheral, .. } = event {
                seen.push(peripheral);
            }
        }
        assert_eq!(
            seen,
            vec![PeripheralId(BYSTANDER_BASE), LOOPBACK_PERIPHERAL, LOOPBACK_PERIPHERAL]
        );
    }

    #[test]
    fn test_scan_fails_without_power() {
        let air = LoopbackAir::new();
        air.set_radio_state(RadioState::PoweredOff);
        let mut central = air.central();
        assert!(central.scan().is_err());
        assert!(!air.is_scanning());
    }

    #[test]
    fn test_pipe_respects_read_limit_and_close() {
        let air = LoopbackAir::new().with_read_limit(3);
        let mut central = air.central();
        let mut peripheral = air.peripheral();
        peripheral
            .start_advertising(SERVICE_NAME, &[])
            .expect("advertise");
        peripheral.publish_channel(true).expect("publish");
        central.connect(LOOPBACK_PERIPHERAL).expect("connect");
        central
            .open_channel(LOOPBACK_PERIPHERAL, Psm::DYNAMIC_START)
            .expect("open");

        let mut central_end = None;
        while let Some(event) = air.next_central_event() {
            if let CentralEvent::ChannelOpened { result, .. } = event {
                central_end = result.ok();
            }
        }
        let mut peripheral_end = None;
        while let Some(event) = air.next_peripheral_event() {
            if let PeripheralEvent::ChannelOpened { result } = event {
                peripheral_end = result.ok();
            }
        }
        let mut central_end = central_end.expect("central end");
        let mut peripheral_end = peripheral_end.expect("peripheral end");

        central_end.write_chunk(b"hello").expect("write");
        central_end.close();

        let mut buf = [0u8; 16];
        assert_eq!(peripheral_end.read(&mut buf).expect("read"), 3);
        assert_eq!(&buf[..3], b"hel");
        assert_eq!(peripheral_end.read(&mut buf).expect("read"), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(peripheral_end.read(&mut buf).expect("eos"), 0);
        assert!(peripheral_end.write_chunk(b"late").is_err());
        assert!(air.air.lock().pipes.is_empty());

        // Readable for each partial read, then end of stream once drained
        let mut events = Vec::new();
        while let Some(PeripheralEvent::Channel(event)) = air.next_peripheral_event() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![ChannelEvent::Readable, ChannelEvent::Readable, ChannelEvent::Ended]
        );
    }

    #[test]
    fn test_link_loss_releases_pipes() {
        let air = LoopbackAir::new();
        let mut central = air.central();
        let mut peripheral = air.peripheral();
        peripheral
            .start_advertising(SERVICE_NAME, &[])
            .expect("advertise");
        peripheral.publish_channel(true).expect("publish");

        for _ in 0..3 {
            central.connect(LOOPBACK_PERIPHERAL).expect("connect");
            central
                .open_channel(LOOPBACK_PERIPHERAL, Psm::DYNAMIC_START)
                .expect("open");
            assert_eq!(air.open_channels(), 1);
            air.drop_connection();
        }

        assert_eq!(air.open_channels(), 0);
        assert!(air.air.lock().pipes.is_empty());
    }

    #[test]
    fn test_open_on_wrong_psm_fails() {
        let air = LoopbackAir::new();
        let mut central = air.central();
        let mut peripheral = air.peripheral();
        peripheral
            .start_advertising(SERVICE_NAME, &[])
            .expect("advertise");
        peripheral.publish_channel(true).expect("publish");
        central.connect(LOOPBACK_PERIPHERAL).expect("connect");
        central
            .open_channel(LOOPBACK_PERIPHERAL, Psm::new(9).expect("psm"))
            .expect("request");

        let failure = std::iter::from_fn(|| air.next_central_event()).find_map(|e| match e {
            CentralEvent::ChannelOpened { result, .. } => Some(result.is_err()),
            _ => None,
        });
        assert_eq!(failure, Some(true));
        assert_eq!(air.open_channels(), 0);
    }
}
