use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Form, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, Notify},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use thermosensor_common::{
    ini::parse_bool,
    portal::{BatteryStatus, MaintenancePortal},
    prefill,
    report::is_success_status,
    BootFault, BootInputs, Bssid, ConfigReason, ConfigStore, ConfigView, ConfigurationRecord,
    CycleAction, CycleEvent, DutyCycle, FirmwareRejection, FirmwareRequest, FormFields,
    JoinTarget, LinkStatus, SensorReading, UploadFailure, UploadRequest, Volume, WakeRadio,
    PREFILL_SCRIPT_FILE, SUBMIT_PATHS,
};

const WATCHDOG_TICK: Duration = Duration::from_millis(100);
const BATTERY_MONITOR_PERIOD: Duration = Duration::from_millis(300);
const UPLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const RESTART_HTML: &str = "<!doctype html><html><body><p>Restarting sensor&hellip;</p></body></html>";

/// Runtime knobs for the simulated node, read once at start.
#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    config_button: bool,
    portal_port: u16,
    time_scale: f64,
    sim: SimSettings,
}

#[derive(Debug, Clone)]
struct SimSettings {
    temperature_c: f32,
    humidity: f32,
    pressure_hpa: Option<f32>,
    battery_raw: u16,
    sensor_fault: bool,
    access_point: Option<(Bssid, u8)>,
    polls_until_link: u16,
}

/// Stand-in for the station radio: links after a fixed number of polls,
/// and never links when asked for an access point it is not.
#[derive(Debug)]
struct SimRadio {
    access_point: Option<(Bssid, u8)>,
    polls_until_link: u16,
    polls: u16,
    reachable: bool,
}

enum WakeEnd {
    Suspend {
        duration: Duration,
        radio: WakeRadio,
    },
    Restart {
        after: Duration,
    },
    ConfigMode {
        record: ConfigurationRecord,
        reason: ConfigReason,
        store: ConfigStore<Volume>,
    },
}

#[derive(Clone)]
struct PortalState {
    portal: Arc<Mutex<MaintenancePortal<Volume>>>,
    restart: Arc<Notify>,
    data_dir: Arc<PathBuf>,
    web_root: Arc<PathBuf>,
    battery_raw: u16,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct BatteryMonitorResponse {
    enabled: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    info!(
        "simulated sensor node, data in {}, time scale {}",
        settings.data_dir.display(),
        settings.time_scale
    );

    // The button only counts as held for the first power-on.
    let mut config_button = settings.config_button;
    let mut radio_enabled = true;

    loop {
        let end = run_wake(&settings, config_button, radio_enabled).await?;
        config_button = false;

        match end {
            WakeEnd::Suspend { duration, radio } => {
                radio_enabled = radio == WakeRadio::Default;
                let scaled = settings.scaled(duration);
                info!("deep sleep for {duration:?} (simulated {scaled:?})");
                tokio::time::sleep(scaled).await;
            }
            WakeEnd::Restart { after } => {
                radio_enabled = true;
                tokio::time::sleep(settings.scaled(after)).await;
                info!("restarting");
            }
            WakeEnd::ConfigMode {
                record,
                reason,
                store,
            } => {
                radio_enabled = true;
                run_portal(&settings, record, reason, store).await?;
                info!("restarting after configuration mode");
            }
        }
    }
}

async fn run_wake(
    settings: &HostSettings,
    config_button: bool,
    radio_enabled: bool,
) -> anyhow::Result<WakeEnd> {
    let volume = Volume::mount(&settings.data_dir);
    let mut store = ConfigStore::new(volume);
    let config = if store.storage().is_mounted() {
        store.load().map_err(|err| {
            warn!("failed to load configuration: {err}");
            err.boot_fault()
        })
    } else {
        Err(BootFault::StorageUnavailable)
    };

    if !radio_enabled {
        debug!("woke with radio disabled");
    }

    let mut cycle = DutyCycle::new();
    let mut radio = SimRadio::new(&settings.sim);
    let mut pending: VecDeque<CycleAction> = cycle
        .boot(BootInputs {
            config,
            config_button,
            now_ms: monotonic_ms(),
        })
        .into();

    while let Some(action) = pending.pop_front() {
        match action {
            CycleAction::ConfigureDisplay(panel) => {
                info!(
                    "display contrast {} rotated {}",
                    panel.contrast, panel.rotated
                );
            }
            CycleAction::ReadSensors => {
                let event = settings.sim.read();
                pending.extend(cycle.handle(event, monotonic_ms()));
            }
            CycleAction::ShowReading {
                reading,
                battery_percent,
            } => {
                info!(
                    "reading: {:.2} C, {:.2} %RH, pressure {:?} hPa, battery {}%",
                    reading.temperature_c, reading.humidity, reading.pressure_hpa, battery_percent
                );
            }
            CycleAction::StartJoin { target, poll_after } => {
                if !radio_enabled {
                    warn!("join requested while radio disabled");
                }
                radio.begin(&target);
                tokio::time::sleep(poll_after).await;
                pending.extend(cycle.handle(CycleEvent::LinkPolled(radio.poll()), monotonic_ms()));
            }
            CycleAction::PollLink { after } => {
                tokio::time::sleep(after).await;
                pending.extend(cycle.handle(CycleEvent::LinkPolled(radio.poll()), monotonic_ms()));
            }
            CycleAction::PersistConfig(record) => {
                if let Err(err) = store.save(&record) {
                    warn!("failed to persist learned network identity: {err}");
                }
            }
            CycleAction::StartUpload(request) => {
                pending.extend(upload_under_watchdog(&mut cycle, &request).await);
            }
            CycleAction::ShowStatus(icons) => debug!("status icons {icons:?}"),
            CycleAction::Suspend {
                duration,
                radio,
                cause,
            } => {
                info!("wake finished: {}", cause.as_str());
                return Ok(WakeEnd::Suspend { duration, radio });
            }
            CycleAction::Restart { after } => return Ok(WakeEnd::Restart { after }),
            CycleAction::EnterConfigMode { record, reason } => {
                return Ok(WakeEnd::ConfigMode {
                    record,
                    reason,
                    store,
                });
            }
        }
    }

    Err(anyhow!("wake cycle stopped without a terminal action"))
}

/// Runs one upload attempt while ticking the engine's watchdog. A watchdog
/// expiry drops the in-flight upload.
async fn upload_under_watchdog(
    cycle: &mut DutyCycle,
    request: &UploadRequest,
) -> Vec<CycleAction> {
    let upload = upload(request);
    tokio::pin!(upload);
    let mut ticker = tokio::time::interval(WATCHDOG_TICK);

    loop {
        tokio::select! {
            result = &mut upload => {
                return cycle.handle(CycleEvent::UploadFinished(result), monotonic_ms());
            }
            _ = ticker.tick() => {
                let actions = cycle.tick(monotonic_ms());
                if !actions.is_empty() {
                    warn!("upload abandoned by watchdog");
                    return actions;
                }
            }
        }
    }
}

async fn upload(request: &UploadRequest) -> Result<(), UploadFailure> {
    let connect = TcpStream::connect((request.host.as_str(), request.port));
    let mut stream = match tokio::time::timeout(UPLOAD_CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(UploadFailure::Connect {
                host: request.host.clone(),
                port: request.port,
                reason: err.to_string(),
            })
        }
        Err(_) => {
            return Err(UploadFailure::Connect {
                host: request.host.clone(),
                port: request.port,
                reason: "timed out".to_string(),
            })
        }
    };

    stream
        .write_all(request.to_http().as_bytes())
        .await
        .map_err(|err| UploadFailure::Transport(err.to_string()))?;

    let mut status_line = String::new();
    BufReader::new(stream)
        .read_line(&mut status_line)
        .await
        .map_err(|err| UploadFailure::Transport(err.to_string()))?;

    let status_line = status_line.trim_end().to_string();
    if is_success_status(&status_line) {
        info!("upload accepted by {}:{}", request.host, request.port);
        Ok(())
    } else {
        Err(UploadFailure::Rejected(status_line))
    }
}

async fn run_portal(
    settings: &HostSettings,
    record: ConfigurationRecord,
    reason: ConfigReason,
    store: ConfigStore<Volume>,
) -> anyhow::Result<()> {
    if !store.storage().is_mounted() {
        warn!("storage unavailable; submissions will not be saved");
    }

    let state = PortalState::new(settings, store, record);
    let restart = state.restart.clone();
    let monitor = spawn_battery_monitor(state.portal.clone(), settings.sim.battery_raw);
    let app = portal_router(state);

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], settings.portal_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind maintenance portal at {addr}"))?;

    match reason {
        ConfigReason::Requested => info!("configuration mode on http://{addr}"),
        ConfigReason::Recovery(fault) => warn!(
            "configuration mode on http://{addr} after boot fault {}",
            fault.as_str()
        ),
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { restart.notified().await })
        .await;
    monitor.abort();
    served.context("maintenance portal failed")?;
    Ok(())
}

impl PortalState {
    fn new(
        settings: &HostSettings,
        store: ConfigStore<Volume>,
        record: ConfigurationRecord,
    ) -> Self {
        Self {
            portal: Arc::new(Mutex::new(MaintenancePortal::new(store, record))),
            restart: Arc::new(Notify::new()),
            data_dir: Arc::new(settings.data_dir.clone()),
            web_root: Arc::new(PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR")))),
            battery_raw: settings.sim.battery_raw,
        }
    }
}

fn portal_router(state: PortalState) -> Router {
    let mut app = Router::new();
    for path in SUBMIT_PATHS {
        app = app.route(path, post(handle_submit));
    }
    app
        .route(&format!("/{PREFILL_SCRIPT_FILE}"), get(handle_get_prefill_script))
        .route("/api/config", get(handle_get_config))
        .route("/api/battery", get(handle_get_battery))
        .route("/api/battery/monitor", post(handle_toggle_battery_monitor))
        .route("/restart", get(handle_restart))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .fallback_service(ServeDir::new(state.web_root.as_ref()))
        .with_state(state)
}

fn spawn_battery_monitor(
    portal: Arc<Mutex<MaintenancePortal<Volume>>>,
    battery_raw: u16,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BATTERY_MONITOR_PERIOD);
        loop {
            interval.tick().await;
            let status = {
                let portal = portal.lock().await;
                portal
                    .battery_monitor_enabled()
                    .then(|| portal.battery_status(battery_raw))
            };
            if let Some(BatteryStatus { raw, percent }) = status {
                info!("battery raw {raw} -> {percent}%");
            }
        }
    })
}

async fn handle_submit(
    State(state): State<PortalState>,
    Form(fields): Form<FormFields>,
) -> axum::response::Response {
    let outcome = match state.portal.lock().await.submit(&fields) {
        Ok(outcome) => outcome,
        Err(rejection) => return rejection_response(&rejection),
    };

    if outcome.is_success() {
        let page = tokio::fs::read_to_string(state.web_root.join("submit.html"))
            .await
            .unwrap_or_else(|err| {
                warn!("failed to read submit page: {err}");
                "Configuration saved.".to_string()
            });
        return Html(page).into_response();
    }

    let status = if outcome.saved.is_err() || outcome.script.is_err() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        outcome.describe(),
    )
        .into_response()
}

async fn handle_get_prefill_script(State(state): State<PortalState>) -> impl IntoResponse {
    let script = match tokio::fs::read_to_string(state.data_dir.join(PREFILL_SCRIPT_FILE)).await {
        Ok(script) => script,
        Err(_) => prefill::render(state.portal.lock().await.record()),
    };
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        script,
    )
}

async fn handle_get_config(State(state): State<PortalState>) -> impl IntoResponse {
    let portal = state.portal.lock().await;
    Json(ConfigView::from(portal.record()))
}

async fn handle_get_battery(State(state): State<PortalState>) -> impl IntoResponse {
    let portal = state.portal.lock().await;
    Json(portal.battery_status(state.battery_raw))
}

async fn handle_toggle_battery_monitor(State(state): State<PortalState>) -> impl IntoResponse {
    let enabled = state.portal.lock().await.toggle_battery_monitor();
    info!("battery monitor {}", if enabled { "on" } else { "off" });
    Json(BatteryMonitorResponse { enabled })
}

async fn handle_restart(State(state): State<PortalState>) -> impl IntoResponse {
    state.restart.notify_one();
    Html(RESTART_HTML)
}

async fn handle_get_ota_status(State(state): State<PortalState>) -> impl IntoResponse {
    let portal = state.portal.lock().await;
    Json(portal.firmware_status().clone())
}

async fn handle_post_ota_apply(
    State(state): State<PortalState>,
    Json(request): Json<FirmwareRequest>,
) -> axum::response::Response {
    match state.portal.lock().await.begin_firmware_update(&request) {
        Err(rejection) => rejection_response(&rejection),
        // Host portals are built without firmware updates.
        Ok(()) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "no firmware writer"),
    }
}

fn rejection_response(rejection: &FirmwareRejection) -> axum::response::Response {
    let status = StatusCode::from_u16(rejection.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &rejection.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl HostSettings {
    fn from_env() -> Self {
        let access_point = std::env::var("SENSOR_SIM_AP_BSSID")
            .ok()
            .and_then(|value| value.parse::<Bssid>().ok())
            .unwrap_or(Bssid([0x02, 0x00, 0x5e, 0x10, 0x20, 0x30]));

        Self {
            data_dir: std::env::var("SENSOR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.thermosensor")),
            config_button: env_flag("SENSOR_CONFIG_BUTTON"),
            portal_port: env_or("SENSOR_PORTAL_PORT", 8080),
            time_scale: env_or("SENSOR_TIME_SCALE", 1.0_f64).max(0.0),
            sim: SimSettings {
                temperature_c: env_or("SENSOR_SIM_TEMPERATURE", 21.5),
                humidity: env_or("SENSOR_SIM_HUMIDITY", 45.0),
                pressure_hpa: (!env_flag("SENSOR_SIM_NO_BAROMETER"))
                    .then(|| env_or("SENSOR_SIM_PRESSURE", 1013.25)),
                battery_raw: env_or("SENSOR_SIM_BATTERY_RAW", 760),
                sensor_fault: env_flag("SENSOR_SIM_SENSOR_FAULT"),
                access_point: (!env_flag("SENSOR_SIM_AP_OFFLINE"))
                    .then(|| (access_point, env_or("SENSOR_SIM_AP_CHANNEL", 6))),
                polls_until_link: env_or("SENSOR_SIM_JOIN_POLLS", 3),
            },
        }
    }

    fn scaled(&self, duration: Duration) -> Duration {
        duration.mul_f64(self.time_scale)
    }
}

impl SimSettings {
    fn read(&self) -> CycleEvent {
        if self.sensor_fault {
            return CycleEvent::SensorFault;
        }
        CycleEvent::SensorsRead(SensorReading {
            temperature_c: self.temperature_c,
            humidity: self.humidity,
            pressure_hpa: self.pressure_hpa,
            battery_raw: self.battery_raw,
        })
    }
}

impl SimRadio {
    fn new(sim: &SimSettings) -> Self {
        Self {
            access_point: sim.access_point,
            polls_until_link: sim.polls_until_link.max(1),
            polls: 0,
            reachable: false,
        }
    }

    fn begin(&mut self, target: &JoinTarget) {
        self.polls = 0;
        self.reachable = match (target, self.access_point) {
            (_, None) => false,
            (JoinTarget::Scan { .. }, Some(_)) => true,
            (JoinTarget::Direct { bssid, channel, .. }, Some((ap_bssid, ap_channel))) => {
                *bssid == ap_bssid && *channel == ap_channel
            }
        };
    }

    fn poll(&mut self) -> LinkStatus {
        self.polls = self.polls.saturating_add(1);
        match self.access_point {
            Some((bssid, channel)) if self.reachable && self.polls >= self.polls_until_link => {
                LinkStatus::Connected { bssid, channel }
            }
            _ => LinkStatus::Down,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(false)
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
