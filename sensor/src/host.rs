use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Form, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rumqttc::{AsyncClient, Event as MqttEvent, Incoming, MqttOptions, QoS};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use envsensor_common::{
    http::FormFields, node_parameters, parse_claim_topic, BusAnnounce, BusReading, Coordinator,
    Event, EventSource, HttpRequest, HttpResponse, Inbound, NetworkControl, NetworkDiagnostics,
    OtaHandler, ParameterStore, RequestKind, RuntimeState, SensorReadings, Services, StoreError,
    StoredParameters, TOPIC_BUS_ANNOUNCE, TOPIC_BUS_CLAIM_FILTER, TOPIC_BUS_HUMIDITY,
    TOPIC_BUS_PRESSURE, TOPIC_BUS_TEMPERATURE,
};

const CONTROL_TICK_MS: u64 = 100;
const SENSOR_PERIOD_MS: u64 = 2_000;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const SIMULATED_MAC: &str = "02:00:00:00:00:01";

type HostCoordinator = Coordinator<FileStore, ChannelEvents, HostOta, HostNetwork>;

#[derive(Clone)]
struct AppState {
    inbound: mpsc::Sender<Inbound>,
}

/// Parameters as one JSON document on disk.
struct FileStore {
    path: PathBuf,
}

impl FileStore {
    fn from_env() -> Self {
        let data_dir = std::env::var("ENVSENSOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.envsensor"));

        Self {
            path: data_dir.join("params.json"),
        }
    }
}

impl ParameterStore for FileStore {
    fn load(&mut self) -> Result<Option<StoredParameters>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, stored: &StoredParameters) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(stored)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

struct ChannelEvents(mpsc::Receiver<Inbound>);

impl EventSource for ChannelEvents {
    fn drain(&mut self) -> Vec<Inbound> {
        let mut drained = Vec::new();
        while let Ok(inbound) = self.0.try_recv() {
            drained.push(inbound);
        }
        drained
    }
}

struct HostOta;

impl OtaHandler for HostOta {
    fn begin(&mut self) {
        info!("firmware updates are not available in the host build");
    }

    fn handle(&mut self) {}
}

struct HostNetwork {
    online: Arc<AtomicBool>,
    diagnostics: NetworkDiagnostics,
}

impl NetworkControl for HostNetwork {
    fn go_offline(&mut self) {
        if self.online.swap(false, Ordering::Relaxed) {
            warn!("bus bridge going offline; readings are no longer published");
        }
    }

    fn diagnostics(&self) -> NetworkDiagnostics {
        self.diagnostics.clone()
    }
}

/// Stand-in for the BME280 so the loop and pages have live values.
#[derive(Default)]
struct SimulatedSensor {
    samples: u64,
}

impl SimulatedSensor {
    fn sample(&mut self) -> SensorReadings {
        self.samples = self.samples.saturating_add(1);
        let step = self.samples as f64;

        SensorReadings {
            temperature_c: Some(20.0 + (self.samples % 8) as f64 * 0.2),
            humidity_pct: Some(45.0 + (self.samples % 6) as f64 * 0.5),
            pressure_hpa: Some(1013.0 + (step * 0.7).sin()),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let params = node_parameters().context("invalid parameter definitions")?;
    let online = Arc::new(AtomicBool::new(true));
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(32);

    let ap_mode = std::env::var("ENVSENSOR_AP_MODE")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let port = std::env::var("ENVSENSOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let services = Services {
        store: FileStore::from_env(),
        events: ChannelEvents(inbound_rx),
        ota: HostOta,
        network: HostNetwork {
            online: online.clone(),
            diagnostics: NetworkDiagnostics {
                rssi: None,
                mac: SIMULATED_MAC.to_string(),
                ip: Some("127.0.0.1".to_string()),
                ap_mode,
                http_port: Some(port),
            },
        },
    };

    let mut coordinator = Coordinator::new(params, services, env!("CARGO_PKG_VERSION"));
    let outcome = coordinator.start(monotonic_ms());
    info!("parameters loaded: {outcome:?}");

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("envsensor-node", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    mqtt.subscribe(TOPIC_BUS_CLAIM_FILTER, QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to bus address claims")?;

    spawn_mqtt_loop(eventloop, inbound_tx.clone());
    spawn_control_loop(coordinator, mqtt, online);

    let app_state = AppState { inbound: inbound_tx };
    let app = Router::new()
        .route("/", get(handle_root))
        .route("/data", get(handle_data))
        .route("/config", get(handle_get_config).post(handle_post_config))
        .fallback(handle_not_found)
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind config portal at {addr}"))?;

    info!("config portal listening on http://{addr}");
    if app_state
        .inbound
        .send(Inbound::event(Event::WifiConnected))
        .await
        .is_err()
    {
        warn!("control loop exited before the network came up");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("config portal server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop, inbound: mpsc::Sender<Inbound>) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Incoming::Publish(message))) => {
                    if let Some(event) = claim_event(&message.topic, &message.payload) {
                        if inbound.send(Inbound::event(event)).await.is_err() {
                            warn!("control loop gone; stopping bus bridge");
                            return;
                        }
                    }
                }
                Ok(MqttEvent::Incoming(Incoming::ConnAck(_))) => {
                    info!("bus bridge connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("bus bridge poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn claim_event(topic: &str, payload: &[u8]) -> Option<Event> {
    let channel = parse_claim_topic(topic)?;
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!("dropping oversized claim on {topic} ({} bytes)", payload.len());
        return None;
    }

    let address = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<u8>().ok());
    match address {
        Some(address) => Some(Event::AddressClaimed { channel, address }),
        None => {
            warn!("ignoring malformed address claim on {topic}");
            None
        }
    }
}

fn spawn_control_loop(mut coordinator: HostCoordinator, mqtt: AsyncClient, online: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_TICK_MS));
        let mut sensor = SimulatedSensor::default();
        let mut last_sample_ms: Option<u64> = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let report = coordinator.tick(now_ms);
            if report.events > 0 {
                debug!("tick handled {} events: {report:?}", report.events);
            }

            if coordinator.take_params_changed() {
                publish_announce(&mqtt, &coordinator);
            }

            let due = last_sample_ms
                .map(|last| now_ms.saturating_sub(last) >= SENSOR_PERIOD_MS)
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_sample_ms = Some(now_ms);

            let readings = sensor.sample();
            coordinator.set_readings(readings);
            if online.load(Ordering::Relaxed) {
                publish_readings(&mqtt, coordinator.runtime(), &readings);
            }
        }
    });
}

fn publish_announce(mqtt: &AsyncClient, coordinator: &HostCoordinator) {
    let runtime = coordinator.runtime();
    let announce = BusAnnounce {
        thing_name: coordinator.thing_name().to_string(),
        instance: runtime.instance,
        sid: runtime.sid,
        source_temperature: runtime.source,
        source_pressure: runtime.source_pressure,
        source_humidity: runtime.source_humidity,
    };
    publish_json(mqtt, TOPIC_BUS_ANNOUNCE, &announce, true);
}

fn publish_readings(mqtt: &AsyncClient, runtime: &RuntimeState, readings: &SensorReadings) {
    let messages = [
        (
            TOPIC_BUS_TEMPERATURE,
            readings.temperature_c,
            runtime.source,
            Some(runtime.temp_source.code()),
        ),
        (
            TOPIC_BUS_HUMIDITY,
            readings.humidity_pct,
            runtime.source_humidity,
            Some(runtime.humidity_source.code()),
        ),
        (
            TOPIC_BUS_PRESSURE,
            readings.pressure_hpa,
            runtime.source_pressure,
            None,
        ),
    ];

    for (topic, value, source, source_type) in messages {
        let Some(value) = value else {
            continue;
        };
        let reading = BusReading {
            instance: runtime.instance,
            sid: runtime.sid,
            source,
            source_type,
            value,
        };
        publish_json(mqtt, topic, &reading, false);
    }
}

fn publish_json<T: serde::Serialize>(mqtt: &AsyncClient, topic: &str, body: &T, retain: bool) {
    match serde_json::to_vec(body) {
        Ok(payload) => {
            if let Err(err) = mqtt.try_publish(topic, QoS::AtMostOnce, retain, payload) {
                warn!("bus publish on {topic} failed: {err}");
            }
        }
        Err(err) => warn!("bus payload for {topic} failed to serialize: {err}"),
    }
}

async fn handle_root(State(state): State<AppState>, headers: HeaderMap) -> Response {
    forward(&state, RequestKind::StatusPage, &headers).await
}

async fn handle_data(State(state): State<AppState>, headers: HeaderMap) -> Response {
    forward(&state, RequestKind::Data, &headers).await
}

async fn handle_get_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    forward(&state, RequestKind::ConfigPage, &headers).await
}

async fn handle_post_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<FormFields>,
) -> Response {
    forward(&state, RequestKind::ConfigSubmit(form), &headers).await
}

async fn handle_not_found(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let path = uri.path().to_string();
    forward(&state, RequestKind::Other { path }, &headers).await
}

/// Hands the request to the control loop and waits for its answer.
async fn forward(state: &AppState, kind: RequestKind, headers: &HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = HttpRequest::new(kind).with_host(host);

    let (reply_tx, reply_rx) = oneshot::channel();
    let inbound = Inbound::request(
        request,
        Box::new(move |response| {
            let _ = reply_tx.send(response);
        }),
    );

    if state.inbound.send(inbound).await.is_err() {
        return into_response(HttpResponse::service_unavailable());
    }

    match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(response)) => into_response(response),
        Ok(Err(_)) => into_response(HttpResponse::service_unavailable()),
        Err(_) => {
            warn!("control loop did not answer within {}s", REPLY_TIMEOUT.as_secs());
            into_response(HttpResponse::service_unavailable())
        }
    }
}

fn into_response(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    if let Some(location) = response
        .location
        .as_deref()
        .and_then(|location| HeaderValue::from_str(location).ok())
    {
        headers.insert(header::LOCATION, location);
    }

    (status, headers, response.body).into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
