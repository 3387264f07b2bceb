use core::convert::TryInto;
use std::{
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280_rs::{Bme280, Configuration as Bme280Configuration, Oversampling, SensorMode};
use embedded_svc::{
    http::{Headers, Method, Query},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Delay,
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use envsensor_common::{
    http::{parse_form, FormFields},
    keys, node_parameters, Coordinator, Event, HttpRequest, HttpResponse, Inbound,
    NetworkControl, NetworkDiagnostics, OtaHandler, ParameterStore, RequestKind, SensorReadings,
    Services, StoreError, StoredParameters,
};

const NVS_NAMESPACE: &str = "envsensor";
const NVS_PARAMS_KEY: &str = "params_json";
const NVS_BUFFER_LEN: usize = 2048;

const BME280_SDA_PIN: i32 = 21;
const BME280_SCL_PIN: i32 = 22;

const MAX_HTTP_BODY: usize = 4096;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TICK_MS: u64 = 50;
const SENSOR_PERIOD_MS: u64 = 2_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type EspCoordinator = Coordinator<NvsStore, mpsc::Receiver<Inbound>, FirmwareSlots, WifiLink>;

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl ParameterStore for NvsStore {
    fn load(&mut self) -> Result<Option<StoredParameters>, StoreError> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_LEN];

        match nvs.get_str(NVS_PARAMS_KEY, &mut buffer).map_err(nvs_error)? {
            Some(value) => Ok(Some(serde_json::from_str(value)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, stored: &StoredParameters) -> Result<(), StoreError> {
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let payload = serde_json::to_string(stored)?;
        nvs.set_str(NVS_PARAMS_KEY, &payload).map_err(nvs_error)?;
        Ok(())
    }
}

fn nvs_error(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Io(format!("nvs: {err}"))
}

/// Marks the running image valid once the network is up. Image transfer
/// itself happens outside the node firmware.
#[derive(Default)]
struct FirmwareSlots {
    ota: Option<EspOta>,
}

impl OtaHandler for FirmwareSlots {
    fn begin(&mut self) {
        match EspOta::new() {
            Ok(mut ota) => {
                if let Err(err) = ota.mark_running_slot_valid() {
                    warn!("failed to mark running OTA slot valid: {err:?}");
                }
                self.ota = Some(ota);
                info!("ota ready");
            }
            Err(err) => warn!("ota unavailable: {err:?}"),
        }
    }

    fn handle(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkMode {
    Station,
    AccessPoint { since_ms: u64 },
    Offline,
}

struct StationCredentials {
    ssid: String,
    password: String,
}

struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    mode: LinkMode,
    thing_name: String,
    ap_password: String,
    station: Option<StationCredentials>,
}

impl WifiLink {
    fn connect_station(&mut self) -> anyhow::Result<()> {
        let credentials = self
            .station
            .as_ref()
            .ok_or_else(|| anyhow!("no station credentials configured"))?;

        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        info!("wifi started, connecting to `{}`", credentials.ssid);

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            feed_watchdog();
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}");
                    self.mode = LinkMode::Station;
                    disable_wifi_power_save();
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                    last_err = Some(err);
                }
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = self.wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        let _ = self.wifi.disconnect();
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("wifi connect failed")))
    }

    fn start_access_point(&mut self, now_ms: u64) -> anyhow::Result<()> {
        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: self
                    .thing_name
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("thing name too long for an AP ssid"))?,
                password: self
                    .ap_password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("AP password too long"))?,
                auth_method: AuthMethod::WPAWPA2Personal,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.wait_netif_up()?;
        self.mode = LinkMode::AccessPoint { since_ms: now_ms };
        info!("config portal AP `{}` started", self.thing_name);
        Ok(())
    }

    /// Retries station mode once the AP has been idle for `ap_timeout_ms`.
    /// Returns the event to raise when the station link comes up.
    fn maintain(&mut self, now_ms: u64, ap_timeout_ms: u64) -> Option<Event> {
        let LinkMode::AccessPoint { since_ms } = self.mode else {
            return None;
        };
        if self.station.is_none()
            || ap_timeout_ms == 0
            || now_ms.saturating_sub(since_ms) < ap_timeout_ms
            || ap_client_count() > 0
        {
            return None;
        }

        match self.connect_station() {
            Ok(()) => Some(Event::WifiConnected),
            Err(err) => {
                warn!("station retry failed ({err:#}); back to config portal AP");
                if let Err(err) = self.start_access_point(now_ms) {
                    warn!("failed to restart config portal AP: {err:#}");
                }
                None
            }
        }
    }
}

impl NetworkControl for WifiLink {
    fn go_offline(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err:?}");
        }
        if let Err(err) = self.wifi.stop() {
            warn!("wifi stop failed: {err:?}");
        }
        self.mode = LinkMode::Offline;
        info!("wifi switched off");
    }

    fn diagnostics(&self) -> NetworkDiagnostics {
        let ap_mode = matches!(self.mode, LinkMode::AccessPoint { .. });
        let netif = if ap_mode {
            self.wifi.wifi().ap_netif()
        } else {
            self.wifi.wifi().sta_netif()
        };

        let mac = netif
            .get_mac()
            .map(|mac| {
                mac.iter()
                    .map(|byte| format!("{byte:02X}"))
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .unwrap_or_default();
        let ip = match self.mode {
            LinkMode::Offline => None,
            _ => netif.get_ip_info().ok().map(|info| info.ip.to_string()),
        };

        NetworkDiagnostics {
            rssi: if self.mode == LinkMode::Station {
                station_rssi()
            } else {
                None
            },
            mac,
            ip,
            ap_mode,
            http_port: None,
        }
    }
}

struct EnvironmentSensor {
    bme280: Bme280<I2cDriver<'static>, Delay>,
}

impl EnvironmentSensor {
    fn new(i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        let mut bme280 = Bme280::new(i2c, Delay::new_default());
        bme280
            .init()
            .map_err(|err| anyhow!("BME280 init failed: {err:?}"))?;
        bme280
            .set_sampling_configuration(
                Bme280Configuration::default()
                    .with_temperature_oversampling(Oversampling::Oversample1)
                    .with_pressure_oversampling(Oversampling::Oversample1)
                    .with_humidity_oversampling(Oversampling::Oversample1)
                    .with_sensor_mode(SensorMode::Normal),
            )
            .map_err(|err| anyhow!("BME280 configuration failed: {err:?}"))?;
        info!("BME280 ready on SDA GPIO{BME280_SDA_PIN} / SCL GPIO{BME280_SCL_PIN}");
        Ok(Self { bme280 })
    }

    fn read(&mut self) -> Option<SensorReadings> {
        match self.bme280.read_sample() {
            Ok(sample) => Some(SensorReadings {
                temperature_c: sample.temperature.map(f64::from),
                humidity_pct: sample.humidity.map(f64::from),
                // Pascals from the sensor, hectopascals on the pages.
                pressure_hpa: sample.pressure.map(|pa| f64::from(pa) / 100.0),
            }),
            Err(err) => {
                warn!("failed to read BME280: {err:?}");
                None
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let params = node_parameters().context("invalid parameter definitions")?;
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>();

    let services = Services {
        store: NvsStore {
            partition: nvs_partition,
        },
        events: inbound_rx,
        ota: FirmwareSlots::default(),
        network: WifiLink {
            wifi,
            mode: LinkMode::Offline,
            thing_name: String::new(),
            ap_password: String::new(),
            station: None,
        },
    };

    let mut coordinator: EspCoordinator =
        Coordinator::new(params, services, env!("CARGO_PKG_VERSION"));
    let outcome = coordinator.start(monotonic_ms());
    info!("parameters loaded: {outcome:?}");

    let station = {
        let params = coordinator.params();
        let ssid = params.value(keys::WIFI_SSID).trim().to_string();
        (!ssid.is_empty()).then(|| StationCredentials {
            ssid,
            password: params.value(keys::WIFI_PASSWORD).to_string(),
        })
    };
    let thing_name = coordinator.thing_name().to_string();
    let ap_password = coordinator.params().value(keys::AP_PASSWORD).to_string();

    {
        let link = &mut coordinator.services_mut().network;
        link.thing_name = thing_name;
        link.ap_password = ap_password;
        link.station = station;

        let connected = match link.connect_station() {
            Ok(()) => true,
            Err(err) => {
                warn!("station mode unavailable ({err:#}); starting config portal AP");
                link.start_access_point(monotonic_ms())
                    .context("failed to start config portal AP")?;
                false
            }
        };
        if connected {
            coordinator.dispatch(Inbound::event(Event::WifiConnected));
        }
    }

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(100.kHz().into()),
    )?;
    let mut sensor = match EnvironmentSensor::new(i2c) {
        Ok(sensor) => Some(sensor),
        Err(err) => {
            warn!("continuing without readings: {err:#}");
            None
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    // Keep the server alive for the program lifetime.
    let _server = create_http_server(inbound_tx)?;

    run_control_loop(&mut coordinator, &mut sensor)
}

fn run_control_loop(
    coordinator: &mut EspCoordinator,
    sensor: &mut Option<EnvironmentSensor>,
) -> anyhow::Result<()> {
    let mut last_sample_ms: Option<u64> = None;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let ap_timeout_ms = u64::from(coordinator.runtime().ap_timeout_sec) * 1_000;
        if let Some(event) = coordinator
            .services_mut()
            .network
            .maintain(now_ms, ap_timeout_ms)
        {
            coordinator.dispatch(Inbound::event(event));
        }

        coordinator.tick(now_ms);

        if coordinator.take_params_changed() {
            let runtime = coordinator.runtime();
            info!(
                "bus identity: instance {} sid {} sources {}/{}/{}",
                runtime.instance,
                runtime.sid,
                runtime.source,
                runtime.source_pressure,
                runtime.source_humidity
            );
        }

        let due = last_sample_ms
            .map(|last| now_ms.saturating_sub(last) >= SENSOR_PERIOD_MS)
            .unwrap_or(true);
        if due {
            last_sample_ms = Some(now_ms);
            if let Some(readings) = sensor.as_mut().and_then(EnvironmentSensor::read) {
                coordinator.set_readings(readings);
            }
        }

        thread::sleep(Duration::from_millis(CONTROL_TICK_MS));
    }
}

fn create_http_server(inbound: mpsc::Sender<Inbound>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    let routes = [
        ("/", Method::Get, Route::Status),
        ("/data", Method::Get, Route::Data),
        ("/config", Method::Get, Route::ConfigPage),
        ("/config", Method::Post, Route::ConfigSubmit),
        ("/*", Method::Get, Route::Other),
    ];

    for (path, method, route) in routes {
        let inbound = inbound.clone();
        server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
            let kind = match route {
                Route::Status => RequestKind::StatusPage,
                Route::Data => RequestKind::Data,
                Route::ConfigPage => RequestKind::ConfigPage,
                Route::ConfigSubmit => RequestKind::ConfigSubmit(read_form(&mut req)?),
                Route::Other => RequestKind::Other {
                    path: req.uri().split('?').next().unwrap_or("/").to_string(),
                },
            };
            let request = HttpRequest::new(kind).with_host(req.header("Host").map(str::to_string));
            let response = forward(&inbound, request);
            write_response(req, response)
        })?;
    }

    Ok(server)
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Status,
    Data,
    ConfigPage,
    ConfigSubmit,
    Other,
}

/// Hands the request to the control loop and waits for its answer.
fn forward(inbound: &mpsc::Sender<Inbound>, request: HttpRequest) -> HttpResponse {
    let (reply_tx, reply_rx) = mpsc::channel();
    let sent = inbound.send(Inbound::request(
        request,
        Box::new(move |response| {
            let _ = reply_tx.send(response);
        }),
    ));
    if sent.is_err() {
        return HttpResponse::service_unavailable();
    }

    reply_rx.recv_timeout(REPLY_TIMEOUT).unwrap_or_else(|_| {
        warn!("control loop did not answer within {}s", REPLY_TIMEOUT.as_secs());
        HttpResponse::service_unavailable()
    })
}

fn read_form(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<FormFields> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(parse_form(&String::from_utf8_lossy(&body)))
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: HttpResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(location) = response.location.as_deref() {
        headers.push(("Location", location));
    }

    req.into_response(response.status, None, &headers)?
        .write_all(response.body.as_bytes())?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn station_rssi() -> Option<i32> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(ap_info.rssi))
}

fn ap_client_count() -> i32 {
    let mut list = esp_idf_svc::sys::wifi_sta_list_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_ap_get_sta_list(&mut list) };
    if rc == esp_idf_svc::sys::ESP_OK {
        list.num
    } else {
        0
    }
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
