//! Service loop: one owner for every piece of node state, advanced by
//! `Coordinator::tick` from a single control thread.
//!
//! Web and bus front ends never touch that state. They hand an [`Inbound`]
//! to the loop through a channel and, for HTTP, wait for the reply passed to
//! its responder.

use std::sync::mpsc::Receiver;

use log::{debug, info, warn};

use crate::{
    config::keys,
    http::{FormFields, HttpRequest, HttpResponse, RequestKind},
    inactivity::InactivityTimer,
    params::ParameterSet,
    portal::{apply_submission, captive_redirect, render_config_page},
    runtime::RuntimeState,
    save::{write_back_sources, FlushOutcome, SaveScheduler},
    sensor::SensorReadings,
    status::{NetworkDiagnostics, StatusSnapshot},
    store::{load_parameters, save_parameters, LoadOutcome, ParameterStore},
    translate::{self, translate},
    types::SourceChannel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The parameter set was persisted with new values.
    ConfigSaved,
    /// Station mode obtained an address.
    WifiConnected,
    HttpRequest(HttpRequest),
    /// The bus assigned a new source address to one of our devices.
    AddressClaimed { channel: SourceChannel, address: u8 },
}

pub type Responder = Box<dyn FnOnce(HttpResponse) + Send>;

pub struct Inbound {
    pub event: Event,
    pub responder: Option<Responder>,
}

impl Inbound {
    pub fn event(event: Event) -> Self {
        Self {
            event,
            responder: None,
        }
    }

    pub fn request(request: HttpRequest, responder: Responder) -> Self {
        Self {
            event: Event::HttpRequest(request),
            responder: Some(responder),
        }
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("event", &self.event)
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

pub trait EventSource {
    /// Everything queued since the last call. Must not block.
    fn drain(&mut self) -> Vec<Inbound>;
}

impl EventSource for Receiver<Inbound> {
    fn drain(&mut self) -> Vec<Inbound> {
        self.try_iter().collect()
    }
}

pub trait OtaHandler {
    fn begin(&mut self);
    fn handle(&mut self);
}

pub trait NetworkControl {
    fn go_offline(&mut self);
    fn diagnostics(&self) -> NetworkDiagnostics;
}

/// External collaborators driven by the coordinator.
pub struct Services<S, E, O, N> {
    pub store: S,
    pub events: E,
    pub ota: O,
    pub network: N,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub events: usize,
    pub flush: FlushOutcome,
    pub went_offline: bool,
}

pub struct Coordinator<S, E, O, N> {
    services: Services<S, E, O, N>,
    version: &'static str,
    params: ParameterSet,
    runtime: RuntimeState,
    save: SaveScheduler,
    inactivity: InactivityTimer,
    readings: SensorReadings,
    params_changed: bool,
    ota_started: bool,
}

impl<S, E, O, N> Coordinator<S, E, O, N>
where
    S: ParameterStore,
    E: EventSource,
    O: OtaHandler,
    N: NetworkControl,
{
    pub fn new(params: ParameterSet, services: Services<S, E, O, N>, version: &'static str) -> Self {
        let runtime = translate(&params);
        Self {
            services,
            version,
            params,
            runtime,
            save: SaveScheduler::default(),
            inactivity: InactivityTimer::default(),
            readings: SensorReadings::default(),
            params_changed: false,
            ota_started: false,
        }
    }

    /// Loads persisted parameters, derives the runtime state and arms the
    /// inactivity timer.
    pub fn start(&mut self, now_ms: u64) -> LoadOutcome {
        let outcome = load_parameters(&mut self.services.store, &mut self.params);
        self.runtime = translate(&self.params);
        self.inactivity.arm(self.runtime.offline_timeout_ms(), now_ms);
        self.params_changed = true;

        info!(
            "node `{}` started: instance {} sid {} sources {}/{}/{} temp source {:?} offline after {} min",
            self.thing_name(),
            self.runtime.instance,
            self.runtime.sid,
            self.runtime.source,
            self.runtime.source_pressure,
            self.runtime.source_humidity,
            self.runtime.temp_source,
            self.runtime.offline_timeout_min
        );
        outcome
    }

    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let inbound = self.services.events.drain();
        let events = inbound.len();
        for item in inbound {
            self.dispatch(item);
        }

        self.services.ota.handle();

        let flush = self
            .save
            .flush(&self.runtime, &mut self.params, &mut self.services.store);

        let went_offline = self.inactivity.poll(now_ms);
        if went_offline {
            info!(
                "no activity for {} min; going offline",
                self.runtime.offline_timeout_min
            );
            self.services.network.go_offline();
            self.inactivity.stop();
        }

        TickReport {
            events,
            flush,
            went_offline,
        }
    }

    pub fn dispatch(&mut self, inbound: Inbound) {
        let Inbound { event, responder } = inbound;
        match event {
            Event::ConfigSaved => self.on_config_saved(),
            Event::WifiConnected => self.on_wifi_connected(),
            Event::AddressClaimed { channel, address } => {
                if self.runtime.set_source_address(channel, address) {
                    info!("bus claimed address {address} for {} source", channel.as_str());
                    self.save.request();
                }
            }
            Event::HttpRequest(request) => {
                let response = self.handle_http(request);
                match responder {
                    Some(respond) => respond(response),
                    None => debug!("dropping http response {} without a responder", response.status),
                }
            }
        }
    }

    fn on_config_saved(&mut self) {
        if translate::apply(&self.params, &mut self.runtime) {
            info!("configuration changed; runtime state updated");
        }
        self.params_changed = true;
    }

    fn on_wifi_connected(&mut self) {
        if self.ota_started {
            return;
        }
        info!("wifi connected; starting ota");
        self.services.ota.begin();
        self.ota_started = true;
    }

    fn handle_http(&mut self, request: HttpRequest) -> HttpResponse {
        let network = self.services.network.diagnostics();

        if network.ap_mode && request.kind != RequestKind::Data {
            if let Some(ap_ip) = network.ip.as_deref() {
                if let Some(location) = captive_redirect(
                    request.host.as_deref(),
                    self.thing_name(),
                    ap_ip,
                    network.http_port,
                ) {
                    debug!("captive portal redirect to {location}");
                    return HttpResponse::redirect(location);
                }
            }
        }

        match request.kind {
            RequestKind::StatusPage => HttpResponse::html(200, self.snapshot(&network).render_html()),
            RequestKind::Data => HttpResponse::json(self.snapshot(&network).render_json()),
            RequestKind::ConfigPage => {
                HttpResponse::html(200, render_config_page(&self.params, self.thing_name(), None))
            }
            RequestKind::ConfigSubmit(form) => self.submit_config(&form),
            RequestKind::Other { path } => HttpResponse::text(404, format!("Not found: {path}")),
        }
    }

    /// Validates and applies a form on a copy, persists it, and only then
    /// commits it and raises `ConfigSaved`.
    fn submit_config(&mut self, form: &FormFields) -> HttpResponse {
        let mut candidate = self.params.clone();

        if let Err(err) = apply_submission(&mut candidate, form) {
            warn!("rejected configuration: {err}");
            let message = err.to_string();
            return HttpResponse::html(
                400,
                render_config_page(&self.params, self.thing_name(), Some(&message)),
            );
        }

        // Source addresses claimed on the bus only live in the runtime state
        // until the next flush.
        write_back_sources(&self.runtime, &mut candidate);

        if let Err(err) = save_parameters(&mut self.services.store, &candidate) {
            warn!("failed to persist configuration: {err}");
            return HttpResponse::text(500, format!("Saving configuration failed: {err}"));
        }

        self.params = candidate;
        self.save.clear();
        self.dispatch(Inbound::event(Event::ConfigSaved));

        HttpResponse::html(
            200,
            render_config_page(&self.params, self.thing_name(), Some("Configuration saved.")),
        )
    }

    fn snapshot<'a>(&'a self, network: &'a NetworkDiagnostics) -> StatusSnapshot<'a> {
        StatusSnapshot {
            thing_name: self.thing_name(),
            version: self.version,
            runtime: &self.runtime,
            readings: &self.readings,
            network,
        }
    }

    pub fn thing_name(&self) -> &str {
        self.params.value(keys::THING_NAME)
    }

    /// Take-and-clear; the bus layer re-announces itself when this is set.
    pub fn take_params_changed(&mut self) -> bool {
        std::mem::take(&mut self.params_changed)
    }

    pub fn set_readings(&mut self, readings: SensorReadings) {
        self.readings = readings;
    }

    pub fn readings(&self) -> &SensorReadings {
        &self.readings
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn inactivity(&self) -> &InactivityTimer {
        &self.inactivity
    }

    pub fn save_pending(&self) -> bool {
        self.save.is_pending()
    }

    pub fn ota_started(&self) -> bool {
        self.ota_started
    }

    pub fn services(&self) -> &Services<S, E, O, N> {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services<S, E, O, N> {
        &mut self.services
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, sync::mpsc};

    use super::*;
    use crate::{
        config::node_parameters,
        http::parse_form,
        inactivity::TimerState,
        store::{MemoryStore, StoredParameters},
        types::TempSource,
    };
    use pretty_assertions::assert_eq;

    type Journal = Rc<RefCell<Vec<&'static str>>>;

    #[derive(Default)]
    struct Queue(Vec<Inbound>);

    impl EventSource for Queue {
        fn drain(&mut self) -> Vec<Inbound> {
            std::mem::take(&mut self.0)
        }
    }

    #[derive(Default)]
    struct Ota {
        journal: Journal,
        begun: usize,
    }

    impl OtaHandler for Ota {
        fn begin(&mut self) {
            self.begun += 1;
            self.journal.borrow_mut().push("ota.begin");
        }

        fn handle(&mut self) {
            self.journal.borrow_mut().push("ota.handle");
        }
    }

    #[derive(Default)]
    struct Network {
        journal: Journal,
        offline: usize,
        diagnostics: NetworkDiagnostics,
    }

    impl NetworkControl for Network {
        fn go_offline(&mut self) {
            self.offline += 1;
            self.journal.borrow_mut().push("network.offline");
        }

        fn diagnostics(&self) -> NetworkDiagnostics {
            self.diagnostics.clone()
        }
    }

    struct JournalStore {
        inner: MemoryStore,
        journal: Journal,
    }

    impl ParameterStore for JournalStore {
        fn load(&mut self) -> Result<Option<StoredParameters>, crate::error::StoreError> {
            self.inner.load()
        }

        fn save(&mut self, stored: &StoredParameters) -> Result<(), crate::error::StoreError> {
            self.journal.borrow_mut().push("store.save");
            self.inner.save(stored)
        }
    }

    type TestCoordinator = Coordinator<JournalStore, Queue, Ota, Network>;

    fn coordinator_with(store: MemoryStore) -> (TestCoordinator, Journal) {
        let journal = Journal::default();
        let services = Services {
            store: JournalStore {
                inner: store,
                journal: journal.clone(),
            },
            events: Queue::default(),
            ota: Ota {
                journal: journal.clone(),
                ..Default::default()
            },
            network: Network {
                journal: journal.clone(),
                ..Default::default()
            },
        };
        (
            Coordinator::new(node_parameters().unwrap(), services, "test"),
            journal,
        )
    }

    fn stored_with(pairs: &[(&str, &str)]) -> MemoryStore {
        let mut params = node_parameters().unwrap();
        for (key, value) in pairs {
            params.set(key, value).unwrap();
        }
        MemoryStore {
            stored: Some(StoredParameters::capture(&params)),
            ..Default::default()
        }
    }

    fn push(coordinator: &mut TestCoordinator, inbound: Inbound) {
        coordinator.services_mut().events.0.push(inbound);
    }

    fn request(
        coordinator: &mut TestCoordinator,
        request: HttpRequest,
    ) -> mpsc::Receiver<HttpResponse> {
        let (tx, rx) = mpsc::channel();
        push(
            coordinator,
            Inbound::request(
                request,
                Box::new(move |response| {
                    let _ = tx.send(response);
                }),
            ),
        );
        rx
    }

    #[test]
    fn start_loads_translates_and_flags_change() {
        let store = stored_with(&[(keys::INSTANCE, "3"), (keys::TEMP_SOURCE, "13")]);
        let (mut coordinator, _) = coordinator_with(store);

        assert_eq!(coordinator.start(0), LoadOutcome::Loaded);
        assert_eq!(coordinator.runtime().instance, 3);
        assert_eq!(coordinator.runtime().temp_source, TempSource::Freezer);
        assert!(coordinator.take_params_changed());
        assert!(!coordinator.take_params_changed());
        assert_eq!(coordinator.inactivity().state(), TimerState::Disarmed);
    }

    #[test]
    fn goes_offline_exactly_once() {
        let (mut coordinator, _) = coordinator_with(stored_with(&[(keys::OFFLINE_TIMEOUT, "1")]));
        coordinator.start(1_000);

        assert!(!coordinator.tick(60_999).went_offline);
        assert!(coordinator.tick(61_000).went_offline);
        for now in [61_001, 120_000, 10_000_000] {
            assert!(!coordinator.tick(now).went_offline);
        }

        assert_eq!(coordinator.services().network.offline, 1);
        assert_eq!(coordinator.inactivity().state(), TimerState::Disarmed);
    }

    #[test]
    fn zero_timeout_never_goes_offline() {
        let (mut coordinator, _) = coordinator_with(stored_with(&[(keys::OFFLINE_TIMEOUT, "0")]));
        coordinator.start(0);

        for now in [0, 60_000, 86_400_000, u64::MAX / 2] {
            coordinator.tick(now);
        }
        assert_eq!(coordinator.services().network.offline, 0);
    }

    #[test]
    fn address_claim_is_flushed_on_the_same_tick() {
        let (mut coordinator, journal) = coordinator_with(MemoryStore::default());
        coordinator.start(0);

        push(
            &mut coordinator,
            Inbound::event(Event::AddressClaimed {
                channel: SourceChannel::Pressure,
                address: 41,
            }),
        );
        let report = coordinator.tick(10);

        assert_eq!(report.events, 1);
        assert_eq!(report.flush, FlushOutcome::Saved);
        assert!(!coordinator.save_pending());
        assert_eq!(coordinator.runtime().source_pressure, 41);
        assert_eq!(coordinator.params().value(keys::SOURCE_PRESSURE), "41");
        assert_eq!(
            coordinator.services().store.inner.stored.as_ref().unwrap().values
                [keys::SOURCE_PRESSURE],
            "41"
        );
        assert_eq!(*journal.borrow(), vec!["ota.handle", "store.save"]);

        assert_eq!(coordinator.tick(20).flush, FlushOutcome::Idle);
    }

    #[test]
    fn unchanged_address_claim_does_not_save() {
        let (mut coordinator, _) = coordinator_with(MemoryStore::default());
        coordinator.start(0);

        push(
            &mut coordinator,
            Inbound::event(Event::AddressClaimed {
                channel: SourceChannel::Temperature,
                address: 22,
            }),
        );
        assert_eq!(coordinator.tick(10).flush, FlushOutcome::Idle);
    }

    #[test]
    fn tick_runs_events_ota_save_then_offline() {
        let (mut coordinator, journal) = coordinator_with(stored_with(&[(keys::OFFLINE_TIMEOUT, "1")]));
        coordinator.start(0);

        push(&mut coordinator, Inbound::event(Event::WifiConnected));
        push(
            &mut coordinator,
            Inbound::event(Event::AddressClaimed {
                channel: SourceChannel::Humidity,
                address: 50,
            }),
        );
        coordinator.tick(60_000);

        assert_eq!(
            *journal.borrow(),
            vec!["ota.begin", "ota.handle", "store.save", "network.offline"]
        );
    }

    #[test]
    fn ota_begins_once() {
        let (mut coordinator, _) = coordinator_with(MemoryStore::default());
        coordinator.start(0);

        push(&mut coordinator, Inbound::event(Event::WifiConnected));
        push(&mut coordinator, Inbound::event(Event::WifiConnected));
        coordinator.tick(1);
        push(&mut coordinator, Inbound::event(Event::WifiConnected));
        coordinator.tick(2);

        assert!(coordinator.ota_started());
        assert_eq!(coordinator.services().ota.begun, 1);
    }

    #[test]
    fn config_submit_persists_and_translates() {
        let (mut coordinator, _) = coordinator_with(stored_with(&[(keys::OFFLINE_TIMEOUT, "10")]));
        coordinator.start(0);
        coordinator.take_params_changed();

        let form = parse_form("nmeaconfig-instance=9&TempSource=2&OfflineTimeout=1");
        let reply = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::ConfigSubmit(form)),
        );
        let report = coordinator.tick(120_000);

        let response = reply.try_recv().unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("Configuration saved."));
        assert_eq!(coordinator.runtime().instance, 9);
        assert_eq!(coordinator.runtime().temp_source, TempSource::Inside);
        assert_eq!(coordinator.runtime().offline_timeout_min, 1);
        assert!(coordinator.take_params_changed());

        // A shorter timeout is translated right away but the armed deadline stays.
        assert!(!report.went_offline);
        assert_eq!(coordinator.inactivity().remaining_ms(120_000), Some(480_000));

        let stored = coordinator.services().store.inner.stored.clone().unwrap();
        assert_eq!(stored.values[keys::INSTANCE], "9");
    }

    #[test]
    fn invalid_submit_is_rejected_without_side_effects() {
        let (mut coordinator, _) = coordinator_with(MemoryStore::default());
        coordinator.start(0);
        coordinator.take_params_changed();

        let form = parse_form("nmeaconfig-sid=0");
        let reply = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::ConfigSubmit(form)),
        );
        coordinator.tick(1);

        let response = reply.try_recv().unwrap();
        assert_eq!(response.status, 400);
        assert!(response.body.contains("SID: 0 is outside 1..=255"));
        assert_eq!(coordinator.services().store.inner.saves, 0);
        assert!(!coordinator.take_params_changed());
    }

    #[test]
    fn claimed_address_survives_config_submit_in_same_tick() {
        let (mut coordinator, journal) = coordinator_with(MemoryStore::default());
        coordinator.start(0);

        push(
            &mut coordinator,
            Inbound::event(Event::AddressClaimed {
                channel: SourceChannel::Pressure,
                address: 41,
            }),
        );
        let reply = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::ConfigSubmit(parse_form("nmeaconfig-sid=7"))),
        );
        let report = coordinator.tick(10);

        assert_eq!(reply.try_recv().unwrap().status, 200);
        assert_eq!(coordinator.runtime().sid, 7);
        assert_eq!(coordinator.runtime().source_pressure, 41);
        assert_eq!(coordinator.params().value(keys::SOURCE_PRESSURE), "41");

        let stored = coordinator.services().store.inner.stored.clone().unwrap();
        assert_eq!(stored.values[keys::SOURCE_PRESSURE], "41");
        assert_eq!(stored.values[keys::SID], "7");

        // The submit already persisted the claim.
        assert_eq!(report.flush, FlushOutcome::Idle);
        assert!(!coordinator.save_pending());
        assert_eq!(*journal.borrow(), vec!["store.save", "ota.handle"]);
    }

    #[test]
    fn store_failure_on_submit_returns_500_and_keeps_config() {
        let store = MemoryStore {
            fail_saves: true,
            ..Default::default()
        };
        let (mut coordinator, _) = coordinator_with(store);
        coordinator.start(0);
        coordinator.take_params_changed();

        let form = parse_form("nmeaconfig-instance=9");
        let reply = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::ConfigSubmit(form)),
        );
        coordinator.tick(1);

        assert_eq!(reply.try_recv().unwrap().status, 500);
        assert_eq!(coordinator.params().value(keys::INSTANCE), "255");
        assert_eq!(coordinator.runtime().instance, 255);
        assert!(!coordinator.take_params_changed());
    }

    #[test]
    fn data_and_status_pages_render_current_readings() {
        let (mut coordinator, _) = coordinator_with(MemoryStore::default());
        coordinator.start(0);
        coordinator.set_readings(SensorReadings {
            temperature_c: Some(20.0),
            humidity_pct: Some(50.0),
            pressure_hpa: Some(1012.5),
        });

        let data = request(&mut coordinator, HttpRequest::new(RequestKind::Data));
        let page = request(&mut coordinator, HttpRequest::new(RequestKind::StatusPage));
        let missing = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::Other {
                path: "/nope".to_string(),
            }),
        );
        coordinator.tick(1);

        let data = data.try_recv().unwrap();
        assert_eq!(data.status, 200);
        let value: serde_json::Value = serde_json::from_str(&data.body).unwrap();
        assert_eq!(value["temperature"], "20.00");
        assert_eq!(value["pressure"], "1012.50");

        assert!(page.try_recv().unwrap().body.contains("main cabin"));
        assert_eq!(missing.try_recv().unwrap().status, 404);
    }

    #[test]
    fn ap_mode_redirects_foreign_hosts() {
        let (mut coordinator, _) = coordinator_with(MemoryStore::default());
        coordinator.start(0);
        coordinator.services_mut().network.diagnostics = NetworkDiagnostics {
            ap_mode: true,
            ip: Some("192.168.4.1".to_string()),
            ..Default::default()
        };

        let foreign = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::StatusPage)
                .with_host(Some("captive.apple.com".to_string())),
        );
        let local = request(
            &mut coordinator,
            HttpRequest::new(RequestKind::ConfigPage).with_host(Some("192.168.4.1".to_string())),
        );
        coordinator.tick(1);

        let foreign = foreign.try_recv().unwrap();
        assert_eq!(foreign.status, 302);
        assert_eq!(foreign.location.as_deref(), Some("http://192.168.4.1/"));
        assert_eq!(local.try_recv().unwrap().status, 200);
    }

    #[test]
    fn channel_receiver_is_an_event_source() {
        let (tx, mut rx) = mpsc::channel();
        tx.send(Inbound::event(Event::ConfigSaved)).unwrap();
        tx.send(Inbound::event(Event::WifiConnected)).unwrap();

        let drained = rx.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].event, Event::ConfigSaved);
        assert!(rx.drain().is_empty());
    }
}
