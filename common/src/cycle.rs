use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    config::{ConfigurationRecord, DisplaySection},
    report::{SensorReading, UploadFailure, UploadReport, UploadRequest},
    types::{BootFault, ConfigReason, SleepCause, StatusIcons, WakeRadio},
    watchdog::UploadWatchdog,
    wifi::{JoinManager, JoinPoll, JoinTarget, LinkStatus},
};

/// Wait before restarting when stored configuration is unusable.
pub const BOOT_FAILURE_RESTART_DELAY: Duration = Duration::from_secs(35);
/// Upload attempts allowed under one watchdog deadline.
pub const MAX_UPLOAD_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone)]
pub struct BootInputs {
    pub config: Result<ConfigurationRecord, BootFault>,
    pub config_button: bool,
    pub now_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleAction {
    ConfigureDisplay(DisplaySection),
    ReadSensors,
    ShowReading {
        reading: SensorReading,
        battery_percent: u8,
    },
    StartJoin {
        target: JoinTarget,
        poll_after: Duration,
    },
    PollLink {
        after: Duration,
    },
    PersistConfig(ConfigurationRecord),
    StartUpload(UploadRequest),
    ShowStatus(StatusIcons),
    Suspend {
        duration: Duration,
        radio: WakeRadio,
        cause: SleepCause,
    },
    Restart {
        after: Duration,
    },
    EnterConfigMode {
        record: ConfigurationRecord,
        reason: ConfigReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    SensorsRead(SensorReading),
    SensorFault,
    LinkPolled(LinkStatus),
    UploadFinished(Result<(), UploadFailure>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Boot,
    ReadingSensors,
    Joining,
    Uploading,
    Asleep,
    ConfigMode,
    Restarting,
}

/// One wake of the node, from boot to sleep.
///
/// Never performs I/O. Each step returns the actions the platform must carry
/// out, and the platform reports outcomes back through [`DutyCycle::handle`].
/// Every sensor-mode path ends in a single [`CycleAction::Suspend`].
#[derive(Debug, Clone)]
pub struct DutyCycle {
    phase: Phase,
    record: ConfigurationRecord,
    join: JoinManager,
    watchdog: UploadWatchdog,
    pending: Option<(SensorReading, u8)>,
    request: Option<UploadRequest>,
    upload_attempts: u8,
    icons: StatusIcons,
    boot_ms: u64,
}

impl Default for DutyCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl DutyCycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Boot,
            record: ConfigurationRecord::default(),
            join: JoinManager::new(),
            watchdog: UploadWatchdog::new(),
            pending: None,
            request: None,
            upload_attempts: 0,
            icons: StatusIcons::default(),
            boot_ms: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record(&self) -> &ConfigurationRecord {
        &self.record
    }

    pub fn upload_attempts(&self) -> u8 {
        self.upload_attempts
    }

    pub fn watchdog_deadline_ms(&self) -> Option<u64> {
        self.watchdog.deadline_ms()
    }

    pub fn boot(&mut self, inputs: BootInputs) -> Vec<CycleAction> {
        if self.phase != Phase::Boot {
            warn!("boot called twice; ignoring");
            return Vec::new();
        }
        self.boot_ms = inputs.now_ms;

        match (inputs.config, inputs.config_button) {
            (Ok(record), true) => {
                info!("config button held; entering configuration mode");
                self.enter_config_mode(record, ConfigReason::Requested)
            }
            (Err(fault), true) => {
                warn!(
                    "stored configuration unusable ({}); entering configuration mode",
                    fault.as_str()
                );
                self.enter_config_mode(ConfigurationRecord::default(), ConfigReason::Recovery(fault))
            }
            (Err(fault), false) => {
                warn!(
                    "stored configuration unusable ({}); restarting in {:?}",
                    fault.as_str(),
                    BOOT_FAILURE_RESTART_DELAY
                );
                self.phase = Phase::Restarting;
                vec![CycleAction::Restart {
                    after: BOOT_FAILURE_RESTART_DELAY,
                }]
            }
            (Ok(record), false) => {
                let display = record.display.clone();
                self.record = record;
                self.phase = Phase::ReadingSensors;
                vec![CycleAction::ConfigureDisplay(display), CycleAction::ReadSensors]
            }
        }
    }

    pub fn handle(&mut self, event: CycleEvent, now_ms: u64) -> Vec<CycleAction> {
        match (self.phase, event) {
            (Phase::ReadingSensors, CycleEvent::SensorsRead(reading)) => {
                self.on_sensors_read(reading)
            }
            (Phase::ReadingSensors, CycleEvent::SensorFault) => {
                warn!("sensor read failed; skipping upload");
                self.icons.failed = true;
                self.sleep(SleepCause::SensorFault, WakeRadio::Default)
            }
            (Phase::Joining, CycleEvent::LinkPolled(link)) => self.on_link_polled(link, now_ms),
            (Phase::Uploading, CycleEvent::UploadFinished(result)) => {
                self.on_upload_finished(result, now_ms)
            }
            (phase, event) => {
                debug!("ignoring {event:?} in {phase:?}");
                Vec::new()
            }
        }
    }

    /// Polls timers. Only the upload watchdog lives here.
    pub fn tick(&mut self, now_ms: u64) -> Vec<CycleAction> {
        if self.phase != Phase::Uploading {
            return Vec::new();
        }
        match self.watchdog.poll(now_ms) {
            Some(_) => self.on_watchdog_expired(),
            None => Vec::new(),
        }
    }

    fn enter_config_mode(
        &mut self,
        record: ConfigurationRecord,
        reason: ConfigReason,
    ) -> Vec<CycleAction> {
        self.phase = Phase::ConfigMode;
        self.record = record.clone();
        vec![
            CycleAction::ConfigureDisplay(record.display.clone()),
            CycleAction::EnterConfigMode { record, reason },
        ]
    }

    fn on_sensors_read(&mut self, reading: SensorReading) -> Vec<CycleAction> {
        let battery_percent = self.record.battery.percent(reading.battery_raw);
        let mut actions = vec![CycleAction::ShowReading {
            reading,
            battery_percent,
        }];

        if !self.record.network.wifi_enabled {
            info!("network disabled; showing reading only");
            actions.extend(self.sleep(SleepCause::NetworkDisabled, WakeRadio::Disabled));
            return actions;
        }

        self.pending = Some((reading, battery_percent));
        let target = self.join.start(&mut self.record.network);
        self.icons.wifi = true;
        self.phase = Phase::Joining;

        actions.push(CycleAction::ShowStatus(self.icons));
        actions.push(CycleAction::StartJoin {
            target,
            poll_after: self.join.retry_delay(),
        });
        actions
    }

    fn on_link_polled(&mut self, link: LinkStatus, now_ms: u64) -> Vec<CycleAction> {
        match self.join.poll(&mut self.record.network, link) {
            JoinPoll::Retry(after) => vec![CycleAction::PollLink { after }],
            JoinPoll::Joined => {
                let mut actions = self.persist_if_dirty();
                actions.extend(self.begin_upload(now_ms));
                actions
            }
            JoinPoll::Failed => {
                let mut actions = self.persist_if_dirty();
                self.icons.failed = true;
                actions.extend(self.sleep(SleepCause::JoinFailed, WakeRadio::Default));
                actions
            }
        }
    }

    fn persist_if_dirty(&self) -> Vec<CycleAction> {
        if self.join.is_dirty() {
            vec![CycleAction::PersistConfig(self.record.clone())]
        } else {
            Vec::new()
        }
    }

    fn begin_upload(&mut self, now_ms: u64) -> Vec<CycleAction> {
        let Some((reading, battery_percent)) = self.pending else {
            warn!("joined without a pending reading");
            return self.sleep(SleepCause::SensorFault, WakeRadio::Default);
        };

        let uptime_ms = now_ms.saturating_sub(self.boot_ms);
        let report = UploadReport::new(&self.record, &reading, battery_percent, uptime_ms);
        let request = UploadRequest::new(&self.record, &report);
        debug!("report line: {}", request.body);

        let deadline = Duration::from_secs(u64::from(self.record.upload.deadline_s));
        self.watchdog.arm(deadline, now_ms);
        self.upload_attempts = 1;
        self.request = Some(request.clone());
        self.phase = Phase::Uploading;

        self.icons.internet = true;
        self.icons.upload = true;
        vec![
            CycleAction::ShowStatus(self.icons),
            CycleAction::StartUpload(request),
        ]
    }

    fn on_upload_finished(
        &mut self,
        result: Result<(), UploadFailure>,
        now_ms: u64,
    ) -> Vec<CycleAction> {
        match result {
            Ok(()) => {
                self.watchdog.disarm();
                info!("upload accepted after {} attempt(s)", self.upload_attempts);
                self.icons.ok = true;
                self.sleep(SleepCause::Completed, WakeRadio::Default)
            }
            Err(failure) => {
                warn!("upload attempt {} failed: {failure}", self.upload_attempts);
                if self.watchdog.poll(now_ms).is_some() {
                    return self.on_watchdog_expired();
                }

                if self.upload_attempts < MAX_UPLOAD_ATTEMPTS {
                    if let Some(request) = self.request.clone() {
                        self.upload_attempts += 1;
                        return vec![CycleAction::StartUpload(request)];
                    }
                }

                self.watchdog.disarm();
                self.icons.failed = true;
                self.sleep(SleepCause::UploadFailed, WakeRadio::Default)
            }
        }
    }

    fn on_watchdog_expired(&mut self) -> Vec<CycleAction> {
        self.icons.failed = true;
        self.sleep(SleepCause::WatchdogExpired, WakeRadio::Default)
    }

    fn sleep(&mut self, cause: SleepCause, radio: WakeRadio) -> Vec<CycleAction> {
        self.phase = Phase::Asleep;
        self.icons.sleeping = true;
        let duration = Duration::from_secs(u64::from(self.record.upload.interval_s));
        info!("sleeping {duration:?} ({})", cause.as_str());
        vec![
            CycleAction::ShowStatus(self.icons),
            CycleAction::Suspend {
                duration,
                radio,
                cause,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Bssid,
        portal::{apply_submission, FormFields},
    };
    use pretty_assertions::assert_eq;

    const AP: Bssid = Bssid([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);

    fn record() -> ConfigurationRecord {
        let mut record = ConfigurationRecord::default();
        record.network.ssid = "home".to_string();
        record.network.passphrase = "secret".to_string();
        record.upload.device_id = "TS-01".to_string();
        record.upload.location = "office".to_string();
        record.upload.measurement = "thermo".to_string();
        record.server.address = "influx.local".to_string();
        record
    }

    fn known_record() -> ConfigurationRecord {
        let mut record = record();
        record.network.bssid = AP;
        record.network.channel = 6;
        record
    }

    fn reading() -> SensorReading {
        SensorReading {
            temperature_c: 21.5,
            humidity: 40.0,
            pressure_hpa: Some(1013.25),
            battery_raw: 853,
        }
    }

    fn booted(record: ConfigurationRecord) -> DutyCycle {
        let mut cycle = DutyCycle::new();
        cycle.boot(BootInputs {
            config: Ok(record),
            config_button: false,
            now_ms: 0,
        });
        cycle
    }

    fn uploading(record: ConfigurationRecord) -> DutyCycle {
        let mut cycle = booted(record);
        cycle.handle(CycleEvent::SensorsRead(reading()), 100);
        cycle.handle(
            CycleEvent::LinkPolled(LinkStatus::Connected {
                bssid: AP,
                channel: 6,
            }),
            1_000,
        );
        assert_eq!(cycle.phase(), Phase::Uploading);
        cycle
    }

    fn suspend_of(actions: &[CycleAction]) -> Option<(Duration, WakeRadio, SleepCause)> {
        actions.iter().find_map(|action| match action {
            CycleAction::Suspend {
                duration,
                radio,
                cause,
            } => Some((*duration, *radio, *cause)),
            _ => None,
        })
    }

    #[test]
    fn sensor_mode_boot_configures_display_and_reads() {
        let mut cycle = DutyCycle::new();
        let actions = cycle.boot(BootInputs {
            config: Ok(record()),
            config_button: false,
            now_ms: 0,
        });

        assert_eq!(
            actions,
            vec![
                CycleAction::ConfigureDisplay(DisplaySection::default()),
                CycleAction::ReadSensors,
            ]
        );
        assert_eq!(cycle.phase(), Phase::ReadingSensors);
    }

    #[test]
    fn button_enters_config_mode_with_stored_record() {
        let mut cycle = DutyCycle::new();
        let actions = cycle.boot(BootInputs {
            config: Ok(record()),
            config_button: true,
            now_ms: 0,
        });

        assert!(actions.contains(&CycleAction::EnterConfigMode {
            record: record(),
            reason: ConfigReason::Requested,
        }));
        assert_eq!(cycle.phase(), Phase::ConfigMode);
        assert!(cycle.handle(CycleEvent::SensorFault, 10).is_empty());
    }

    #[test]
    fn unusable_config_with_button_enters_config_mode_with_defaults() {
        let mut cycle = DutyCycle::new();
        let actions = cycle.boot(BootInputs {
            config: Err(BootFault::StorageUnavailable),
            config_button: true,
            now_ms: 0,
        });

        assert!(actions.contains(&CycleAction::EnterConfigMode {
            record: ConfigurationRecord::default(),
            reason: ConfigReason::Recovery(BootFault::StorageUnavailable),
        }));
    }

    #[test]
    fn unusable_config_without_button_restarts_after_backoff() {
        let mut cycle = DutyCycle::new();
        let actions = cycle.boot(BootInputs {
            config: Err(BootFault::ConfigCorrupt),
            config_button: false,
            now_ms: 0,
        });

        assert_eq!(
            actions,
            vec![CycleAction::Restart {
                after: Duration::from_secs(35)
            }]
        );
        assert_eq!(cycle.phase(), Phase::Restarting);
        assert!(suspend_of(&actions).is_none());
    }

    #[test]
    fn network_disabled_sleeps_with_radio_off() {
        let mut record = record();
        record.network.wifi_enabled = false;
        let mut cycle = booted(record);

        let actions = cycle.handle(CycleEvent::SensorsRead(reading()), 50);

        assert_eq!(
            suspend_of(&actions),
            Some((
                Duration::from_secs(180),
                WakeRadio::Disabled,
                SleepCause::NetworkDisabled
            ))
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, CycleAction::StartJoin { .. })));
    }

    #[test]
    fn sensor_fault_sleeps_without_joining() {
        let mut cycle = booted(record());
        let actions = cycle.handle(CycleEvent::SensorFault, 50);

        assert_eq!(
            suspend_of(&actions).map(|(_, _, cause)| cause),
            Some(SleepCause::SensorFault)
        );
    }

    #[test]
    fn unknown_access_point_widens_budget_and_persists_learned_identity() {
        let mut cycle = booted(record());
        let actions = cycle.handle(CycleEvent::SensorsRead(reading()), 50);

        assert!(actions.contains(&CycleAction::StartJoin {
            target: JoinTarget::Scan {
                ssid: "home".to_string(),
                passphrase: "secret".to_string(),
            },
            poll_after: Duration::from_millis(150),
        }));
        assert_eq!(cycle.record().network.max_con_attempts, 120);

        let actions = cycle.handle(CycleEvent::LinkPolled(LinkStatus::Down), 200);
        assert_eq!(
            actions,
            vec![CycleAction::PollLink {
                after: Duration::from_millis(150)
            }]
        );

        let actions = cycle.handle(
            CycleEvent::LinkPolled(LinkStatus::Connected {
                bssid: AP,
                channel: 6,
            }),
            350,
        );

        let persisted = actions.iter().find_map(|a| match a {
            CycleAction::PersistConfig(record) => Some(record.clone()),
            _ => None,
        });
        let persisted = persisted.expect("learned identity must be persisted");
        assert_eq!(persisted.network.bssid, AP);
        assert_eq!(persisted.network.channel, 6);
        assert_eq!(persisted.network.max_con_attempts, 120);

        let persist_at = actions
            .iter()
            .position(|a| matches!(a, CycleAction::PersistConfig(_)));
        let upload_at = actions
            .iter()
            .position(|a| matches!(a, CycleAction::StartUpload(_)));
        assert!(persist_at < upload_at);
    }

    #[test]
    fn known_access_point_on_same_channel_skips_persist() {
        let mut cycle = booted(known_record());
        cycle.handle(CycleEvent::SensorsRead(reading()), 50);
        let actions = cycle.handle(
            CycleEvent::LinkPolled(LinkStatus::Connected {
                bssid: AP,
                channel: 6,
            }),
            300,
        );

        assert!(!actions
            .iter()
            .any(|a| matches!(a, CycleAction::PersistConfig(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, CycleAction::StartUpload(_))));
    }

    #[test]
    fn exhausted_join_forgets_identity_and_sleeps() {
        let mut record = known_record();
        record.network.max_con_attempts = 2;
        let mut cycle = booted(record);
        cycle.handle(CycleEvent::SensorsRead(reading()), 50);

        cycle.handle(CycleEvent::LinkPolled(LinkStatus::Down), 200);
        let actions = cycle.handle(CycleEvent::LinkPolled(LinkStatus::Down), 350);

        let persisted = actions.iter().find_map(|a| match a {
            CycleAction::PersistConfig(record) => Some(record.clone()),
            _ => None,
        });
        assert_eq!(
            persisted.map(|r| (r.network.bssid, r.network.channel)),
            Some((Bssid::UNKNOWN, 0))
        );
        assert_eq!(
            suspend_of(&actions).map(|(_, _, cause)| cause),
            Some(SleepCause::JoinFailed)
        );
        assert_eq!(cycle.phase(), Phase::Asleep);
    }

    #[test]
    fn upload_request_carries_corrected_report() {
        let mut record = known_record();
        record.sensor.temp_correction = 0.5;
        let mut cycle = booted(record);
        cycle.handle(CycleEvent::SensorsRead(reading()), 100);
        let actions = cycle.handle(
            CycleEvent::LinkPolled(LinkStatus::Connected {
                bssid: AP,
                channel: 6,
            }),
            2_340,
        );

        let request = actions.iter().find_map(|a| match a {
            CycleAction::StartUpload(request) => Some(request.clone()),
            _ => None,
        });
        let body = request.map(|r| r.body).unwrap_or_default();
        assert_eq!(
            body,
            "thermo,deviceId=TS-01,location=office temperature=22.00,humidity=40.00,\
             pressure=1013.25,battery=100i,uptime=2.3"
        );
    }

    #[test]
    fn successful_upload_disarms_watchdog_and_sleeps() {
        let mut cycle = uploading(known_record());

        let actions = cycle.handle(CycleEvent::UploadFinished(Ok(())), 2_000);

        assert_eq!(
            suspend_of(&actions),
            Some((
                Duration::from_secs(180),
                WakeRadio::Default,
                SleepCause::Completed
            ))
        );
        assert_eq!(cycle.watchdog_deadline_ms(), None);
        assert!(cycle.tick(60_000).is_empty());
    }

    #[test]
    fn failed_upload_retries_once_then_sleeps() {
        let mut cycle = uploading(known_record());
        let failure = UploadFailure::Rejected("HTTP/1.1 401 Unauthorized".to_string());

        let actions = cycle.handle(CycleEvent::UploadFinished(Err(failure.clone())), 2_000);
        assert!(matches!(actions.as_slice(), [CycleAction::StartUpload(_)]));
        assert_eq!(cycle.upload_attempts(), 2);

        let actions = cycle.handle(CycleEvent::UploadFinished(Err(failure)), 3_000);
        assert_eq!(
            suspend_of(&actions).map(|(_, _, cause)| cause),
            Some(SleepCause::UploadFailed)
        );
    }

    #[test]
    fn failure_after_deadline_does_not_retry() {
        let mut cycle = uploading(known_record());
        let failure = UploadFailure::Transport("reset".to_string());

        let actions = cycle.handle(CycleEvent::UploadFinished(Err(failure)), 21_000);

        assert_eq!(
            suspend_of(&actions).map(|(_, _, cause)| cause),
            Some(SleepCause::WatchdogExpired)
        );
    }

    #[test]
    fn stalled_upload_is_forced_to_sleep_by_watchdog() {
        // Armed at 1 000 ms with the default 20 s deadline.
        let mut cycle = uploading(record());
        assert_eq!(cycle.watchdog_deadline_ms(), Some(21_000));

        let mut fired_at = None;
        for now in (1_000..=30_000).step_by(100) {
            let actions = cycle.tick(now);
            if let Some((duration, _, cause)) = suspend_of(&actions) {
                assert_eq!(cause, SleepCause::WatchdogExpired);
                assert_eq!(duration, Duration::from_secs(180));
                fired_at = Some(now);
                break;
            }
        }

        let elapsed = fired_at.map(|at| at - 1_000);
        assert!(matches!(elapsed, Some(ms) if (20_000..21_000).contains(&ms)));

        let late = cycle.handle(CycleEvent::UploadFinished(Ok(())), 31_000);
        assert!(late.is_empty());
    }

    #[test]
    fn form_without_wifi_flag_disables_network_on_next_wake() {
        let mut record = record();
        let form: FormFields = [("wifi_ap_ssid".to_string(), "home".to_string())]
            .into_iter()
            .collect();
        apply_submission(&mut record, &form);
        assert!(!record.network.wifi_enabled);

        let mut cycle = booted(record);
        let actions = cycle.handle(CycleEvent::SensorsRead(reading()), 10);
        assert_eq!(
            suspend_of(&actions).map(|(_, radio, _)| radio),
            Some(WakeRadio::Disabled)
        );
    }

    #[test]
    fn every_sensor_mode_path_suspends_exactly_once() {
        let outcomes: Vec<Vec<CycleEvent>> = vec![
            vec![CycleEvent::SensorFault],
            vec![
                CycleEvent::SensorsRead(reading()),
                CycleEvent::LinkPolled(LinkStatus::Connected {
                    bssid: AP,
                    channel: 6,
                }),
                CycleEvent::UploadFinished(Ok(())),
            ],
            vec![
                CycleEvent::SensorsRead(reading()),
                CycleEvent::LinkPolled(LinkStatus::Connected {
                    bssid: AP,
                    channel: 6,
                }),
                CycleEvent::UploadFinished(Err(UploadFailure::Transport("x".into()))),
                CycleEvent::UploadFinished(Err(UploadFailure::Transport("x".into()))),
                CycleEvent::UploadFinished(Ok(())),
            ],
        ];

        for events in outcomes {
            let mut cycle = booted(known_record());
            let mut suspends = 0;
            for (step, event) in events.into_iter().enumerate() {
                let actions = cycle.handle(event, 100 * step as u64);
                suspends += actions
                    .iter()
                    .filter(|a| matches!(a, CycleAction::Suspend { .. }))
                    .count();
            }
            assert_eq!(suspends, 1);
            assert_eq!(cycle.phase(), Phase::Asleep);
        }
    }
}
