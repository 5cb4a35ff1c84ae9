//! Weather sensors received over the air by `rtl_433`.
//!
//! Two tasks: the supervisor keeps `rtl_433` running and hands every line
//! of its output to the consumer, which owns all sensor state. Nothing is
//! shared between them except the channel, so no locking is needed.

use crate::broker_mux::BrokerMux;
use crate::config::{AllowedSensor, Rtl433Config, SdrConfig};
use crate::models::{DeviceKey, SensorReading, SensorReport};
use crate::service_utils::publish_detached;
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_APP: &str = "rtl_433";
pub const DEFAULT_REBOOT_COMMAND: &str = "/usr/bin/sudo /usr/sbin/reboot";

#[derive(Debug, Error)]
pub enum SdrError {
    #[error("failed to start {app}: {source}")]
    Spawn {
        app: String,
        source: std::io::Error,
    },
    #[error("sensor consumer has stopped")]
    ConsumerClosed,
}

/// Starts the supervisor and the consumer. Does nothing without a topic.
pub fn init_sdr(mux: Arc<BrokerMux>, config: &SdrConfig) {
    if config.topic.is_empty() {
        return;
    }

    // Capacity one: rtl_433 only gets ahead of us by a single line.
    let (lines_tx, lines_rx) = mpsc::channel(1);

    let supervisor = Supervisor::new(
        &config.rtl433,
        lines_tx,
        ShellReboot::new(&config.rtl433.reboot_command),
    );
    tokio::spawn(async move {
        if let Err(e) = supervisor.run().await {
            error!("sdr: {}", e);
        }
    });

    let table = SensorTable::new(&config.allow);
    tokio::spawn(run_consumer(
        mux,
        table,
        config.topic.clone(),
        emit_interval(config.interval),
        lines_rx,
    ));
}

fn emit_interval(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1) * 60)
}

fn rtl433_args(config: &Rtl433Config) -> Vec<String> {
    let mut args: Vec<String> = ["-F", "json", "-C", "si"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if config.on_seconds > 0 {
        args.push("-T".to_string());
        args.push(config.on_seconds.to_string());
    }

    for protocol in &config.protocols {
        args.push("-R".to_string());
        args.push(protocol.to_string());
    }

    args
}

/// What to do when `rtl_433` has been silent for too long.
#[async_trait]
pub trait Reboot: Send + Sync {
    async fn reboot(&self);
}

pub struct ShellReboot {
    command: String,
}

impl ShellReboot {
    pub fn new(command: &str) -> Self {
        let command = if command.is_empty() {
            DEFAULT_REBOOT_COMMAND
        } else {
            command
        };
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl Reboot for ShellReboot {
    async fn reboot(&self) {
        match Command::new("/bin/bash").arg("-c").arg(&self.command).output().await {
            Ok(output) if output.status.success() => info!("sdr: reboot issued"),
            Ok(output) => error!(
                "sdr: reboot command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
            Err(e) => error!("sdr: reboot command: {}", e),
        }
    }
}

/// Counts consecutive restarts that produced no output. Fires at most once.
#[derive(Debug)]
struct Deadman {
    threshold: u32,
    idle_cycles: u32,
}

impl Deadman {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            idle_cycles: 0,
        }
    }

    /// Returns true exactly once, when the idle streak reaches the threshold.
    fn record_cycle(&mut self, lines: usize) -> bool {
        if self.threshold == 0 {
            return false;
        }

        if lines > 0 {
            self.idle_cycles = 0;
            return false;
        }

        self.idle_cycles += 1;
        if self.idle_cycles >= self.threshold {
            self.threshold = 0;
            return true;
        }
        false
    }
}

pub struct Supervisor<R> {
    app: String,
    args: Vec<String>,
    off_time: Duration,
    deadman: Deadman,
    reboot: R,
    lines: mpsc::Sender<String>,
}

impl<R: Reboot> Supervisor<R> {
    pub fn new(config: &Rtl433Config, lines: mpsc::Sender<String>, reboot: R) -> Self {
        let app = if config.app.is_empty() {
            DEFAULT_APP.to_string()
        } else {
            config.app.clone()
        };

        Self {
            app,
            args: rtl433_args(config),
            off_time: Duration::from_secs(config.off_seconds),
            deadman: Deadman::new(config.deadman),
            reboot,
            lines,
        }
    }

    /// Restarts the app every time it exits. Only returns when it cannot be
    /// started at all, or when nobody is listening any more.
    pub async fn run(mut self) -> Result<(), SdrError> {
        info!("sdr: args: {:?}", self.args);

        loop {
            let lines = self.run_once().await?;

            if self.deadman.record_cycle(lines) {
                info!("sdr: reboot due to deadman");
                self.reboot.reboot().await;
            }

            // Duty cycle
            if !self.off_time.is_zero() {
                sleep(self.off_time).await;
            }
        }
    }

    /// One run of the app. Returns how many lines it produced.
    async fn run_once(&mut self) -> Result<usize, SdrError> {
        let mut child = Command::new(&self.app)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SdrError::Spawn {
                app: self.app.clone(),
                source,
            })?;

        debug!("sdr: loop: start");
        let mut count = 0;

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Invalid UTF-8 still goes through; the JSON parser
                        // rejects just that record.
                        let line = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
                        count += 1;
                        if self.lines.send(line).await.is_err() {
                            return Err(SdrError::ConsumerClosed);
                        }
                    }
                    Err(e) => {
                        warn!("sdr: read: {}", e);
                        break;
                    }
                }
            }
        }

        match child.wait().await {
            Ok(status) => debug!("sdr: loop: end: {}", status),
            Err(e) => warn!("sdr: wait: {}", e),
        }

        Ok(count)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Debug)]
struct SensorState {
    id: i64,
    dirty: bool,
    report: SensorReport,
}

/// Per-device rolling state, owned by the consumer task.
pub struct SensorTable {
    allow: HashSet<DeviceKey>,
    sensors: HashMap<DeviceKey, SensorState>,
}

impl SensorTable {
    pub fn new(allow: &[AllowedSensor]) -> Self {
        Self {
            allow: allow
                .iter()
                .map(|a| DeviceKey {
                    model: a.model.clone(),
                    id: a.id,
                })
                .collect(),
            sensors: HashMap::new(),
        }
    }

    fn allowed(&self, key: &DeviceKey) -> bool {
        self.allow.is_empty() || self.allow.contains(key)
    }

    /// Merges one raw line into the device's state. Bad JSON is logged and dropped.
    pub fn consume(&mut self, line: &str) {
        let reading: SensorReading = match serde_json::from_str(line) {
            Ok(reading) => reading,
            Err(e) => {
                info!("sdr: consume: {}: {}", e, line);
                return;
            }
        };

        let key = reading.key();
        if !self.allowed(&key) {
            return;
        }

        debug!("sdr: consume: {:?}", reading);

        let sensor = self.sensors.entry(key).or_insert_with(|| SensorState {
            id: reading.id,
            dirty: false,
            report: SensorReport::default(),
        });

        // Start from scratch once the previous values have been emitted.
        if !sensor.dirty {
            sensor.report = SensorReport::default();
            sensor.dirty = true;
        }

        let present = |value: Option<f32>| value.filter(|v| *v != 0.0);
        let report = &mut sensor.report;

        if let Some(celsius) = present(reading.temperature_c) {
            report.temperature = celsius;
        }
        if let Some(fahrenheit) = present(reading.temperature_f) {
            report.temperature = (fahrenheit - 32.0) * 5.0 / 9.0;
        }
        if let Some(humidity) = present(reading.humidity) {
            report.humidity = humidity;
        }
        if let (Some(speed), Some(dir)) = (present(reading.wind_speed), present(reading.wind_dir)) {
            report.wind_speed = speed;
            report.wind_dir = dir;
        }
        if let Some(rain) = present(reading.rain) {
            report.rain = rain;
        }
    }

    /// Clears every dirty sensor and returns `(topic, payload)` for each.
    pub fn take_dirty(&mut self, base_topic: &str) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();

        for sensor in self.sensors.values_mut().filter(|s| s.dirty) {
            sensor.dirty = false;

            match serde_json::to_vec(&sensor.report) {
                Ok(payload) => out.push((format!("{}{}", base_topic, sensor.id), payload)),
                Err(e) => error!("sdr: emit: {}", e),
            }
        }

        out
    }
}

async fn run_consumer(
    mux: Arc<BrokerMux>,
    mut table: SensorTable,
    topic: String,
    period: Duration,
    mut lines: mpsc::Receiver<String>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut producing = true;

    loop {
        tokio::select! {
            line = lines.recv(), if producing => match line {
                Some(line) => table.consume(&line),
                None => {
                    warn!("sdr: producer has stopped, emitting what is left");
                    producing = false;
                }
            },
            _ = ticker.tick() => {
                for (address, payload) in table.take_dirty(&topic) {
                    debug!("sdr: emit: {}: {}", address, String::from_utf8_lossy(&payload));
                    publish_detached(mux.clone(), address, QoS::AtMostOnce, false, payload);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_mux::testing::recording_mux;
    use serde_json::{json, Value};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn emitted(table: &mut SensorTable, base: &str) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = table
            .take_dirty(base)
            .into_iter()
            .map(|(topic, payload)| (topic, serde_json::from_slice(&payload).unwrap()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn partial_records_coalesce_until_emitted() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","id":1,"temperature_C":20}"#);
        table.consume(r#"{"model":"A","id":1,"humidity":55}"#);

        assert_eq!(
            emitted(&mut table, "home:sensors/"),
            vec![(
                "home:sensors/1".to_string(),
                json!({"temperature": 20.0, "humidity": 55.0})
            )]
        );
        assert!(table.take_dirty("home:sensors/").is_empty());
    }

    #[test]
    fn fields_reset_after_emission() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","id":1,"temperature_C":20,"humidity":55}"#);
        table.take_dirty("s/");

        table.consume(r#"{"model":"A","id":1,"humidity":40}"#);
        assert_eq!(
            emitted(&mut table, "s/"),
            vec![("s/1".to_string(), json!({"temperature": 0.0, "humidity": 40.0}))]
        );
    }

    #[test]
    fn fahrenheit_is_converted() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","id":1,"temperature_F":68}"#);

        let out = emitted(&mut table, "s/");
        let celsius = out[0].1["temperature"].as_f64().unwrap();
        assert!((celsius - 20.0).abs() < 1e-4);
    }

    #[test]
    fn wind_needs_speed_and_direction() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"W","id":9,"temperature_C":5,"wind_avg_km_h":12}"#);
        table.consume(r#"{"model":"W","id":9,"rain_mm":1.5,"wind_dir_deg":0}"#);

        assert_eq!(
            emitted(&mut table, "s/"),
            vec![("s/9".to_string(), json!({"temperature": 5.0, "rain": 1.5}))]
        );

        table.consume(r#"{"model":"W","id":9,"temperature_C":5,"wind_avg_km_h":12,"wind_dir_deg":180}"#);
        assert_eq!(
            emitted(&mut table, "s/"),
            vec![(
                "s/9".to_string(),
                json!({"temperature": 5.0, "windSpeed": 12.0, "windDir": 180.0})
            )]
        );
    }

    #[test]
    fn zero_measurement_does_not_override() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","id":1,"temperature_C":18.5}"#);
        table.consume(r#"{"model":"A","id":1,"temperature_C":0,"humidity":30}"#);

        assert_eq!(
            emitted(&mut table, "s/"),
            vec![("s/1".to_string(), json!({"temperature": 18.5, "humidity": 30.0}))]
        );
    }

    #[test]
    fn allow_list_drops_other_devices() {
        let allow = [AllowedSensor {
            model: "A".to_string(),
            id: 1,
        }];
        let mut table = SensorTable::new(&allow);

        table.consume(r#"{"model":"B","id":2,"temperature_C":20}"#);
        assert!(table.sensors.is_empty());
        assert!(table.take_dirty("s/").is_empty());

        table.consume(r#"{"model":"A","id":1,"temperature_C":20}"#);
        assert_eq!(table.sensors.len(), 1);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mut table = SensorTable::new(&[]);
        table.consume("rtl_433 version 23.11");
        table.consume(r#"{"model":"A","id":"#);
        assert!(table.sensors.is_empty());
    }

    #[test]
    fn record_without_id_is_kept() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","temperature_C":15}"#);

        assert_eq!(
            emitted(&mut table, "s/"),
            vec![("s/0".to_string(), json!({"temperature": 15.0}))]
        );
    }

    #[test]
    fn devices_with_same_id_are_tracked_apart() {
        let mut table = SensorTable::new(&[]);
        table.consume(r#"{"model":"A","id":1,"temperature_C":10}"#);
        table.consume(r#"{"model":"B","id":1,"temperature_C":30}"#);
        assert_eq!(table.sensors.len(), 2);
    }

    #[test]
    fn args_follow_config() {
        let config = Rtl433Config {
            protocols: vec![40, 41],
            on_seconds: 60,
            ..Default::default()
        };
        assert_eq!(
            rtl433_args(&config),
            vec!["-F", "json", "-C", "si", "-T", "60", "-R", "40", "-R", "41"]
        );
        assert_eq!(
            rtl433_args(&Rtl433Config::default()),
            vec!["-F", "json", "-C", "si"]
        );
    }

    #[test]
    fn emission_interval_is_at_least_a_minute() {
        assert_eq!(emit_interval(0), Duration::from_secs(60));
        assert_eq!(emit_interval(5), Duration::from_secs(300));
    }

    #[test]
    fn deadman_fires_once_after_idle_streak() {
        let mut deadman = Deadman::new(3);
        assert!(!deadman.record_cycle(0));
        assert!(!deadman.record_cycle(0));
        assert!(deadman.record_cycle(0));

        for _ in 0..10 {
            assert!(!deadman.record_cycle(0));
        }
        assert_eq!(deadman.threshold, 0);
    }

    #[test]
    fn deadman_resets_on_output() {
        let mut deadman = Deadman::new(2);
        assert!(!deadman.record_cycle(0));
        assert!(!deadman.record_cycle(4));
        assert!(!deadman.record_cycle(0));
        assert!(deadman.record_cycle(0));
    }

    #[test]
    fn disabled_deadman_never_fires() {
        let mut deadman = Deadman::new(0);
        for _ in 0..10 {
            assert!(!deadman.record_cycle(0));
        }
    }

    #[derive(Clone, Default)]
    struct CountingReboot(Arc<AtomicUsize>);

    #[async_trait]
    impl Reboot for CountingReboot {
        async fn reboot(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn silent_app_triggers_exactly_one_reboot() {
        let config = Rtl433Config {
            app: "true".to_string(),
            deadman: 3,
            ..Default::default()
        };
        let reboot = CountingReboot::default();
        let (tx, _rx) = mpsc::channel(1);
        let supervisor = Supervisor::new(&config, tx, reboot.clone());
        let handle = tokio::spawn(supervisor.run());

        tokio::time::timeout(Duration::from_secs(10), async {
            while reboot.0.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Keep restarting for a while; the deadman is spent.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(reboot.0.load(Ordering::SeqCst), 1);
        assert!(!handle.is_finished());

        handle.abort();
    }

    #[tokio::test]
    async fn output_lines_are_forwarded() {
        let config = Rtl433Config {
            app: "echo".to_string(),
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(Supervisor::new(&config, tx, CountingReboot::default()).run());

        let line = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "-F json -C si");

        handle.abort();
    }

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(trim_line_end(b"{}\r\n"), b"{}");
        assert_eq!(trim_line_end(b"{}\n"), b"{}");
        assert_eq!(trim_line_end(b"{}"), b"{}");
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_stop_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_rtl_433");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "echo '{\"model\":\"A\",\"id\":1,\"temperature_C\":20}'\n",
                "printf '\\377\\376garbage\\n'\n",
                "echo '{\"model\":\"A\",\"id\":2,\"temperature_C\":21}'\n",
                "echo '{\"model\":\"A\",\"id\":3,\"temperature_C\":22}'\n",
                "sleep 30\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Rtl433Config {
            app: script.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(Supervisor::new(&config, tx, CountingReboot::default()).run());

        let mut table = SensorTable::new(&[]);
        let mut lines = Vec::new();
        for _ in 0..4 {
            let line = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            table.consume(&line);
            lines.push(line);
        }
        handle.abort();

        assert!(lines[1].ends_with("garbage"));
        let topics: Vec<String> = emitted(&mut table, "s/")
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
        assert_eq!(topics, vec!["s/1", "s/2", "s/3"]);
    }

    #[tokio::test]
    async fn start_failure_stops_supervisor() {
        let config = Rtl433Config {
            app: "/nonexistent/rtl_433".to_string(),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        let result = Supervisor::new(&config, tx, CountingReboot::default()).run().await;

        assert!(matches!(result, Err(SdrError::Spawn { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_emits_dirty_sensors_on_timer() {
        let (mux, broker) = recording_mux("home");
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_consumer(
            mux,
            SensorTable::new(&[]),
            "home:sensors/".to_string(),
            emit_interval(1),
            rx,
        ));

        tx.send(r#"{"model":"A","id":1,"temperature_C":20}"#.to_string())
            .await
            .unwrap();
        tx.send(r#"{"model":"A","id":1,"humidity":55}"#.to_string())
            .await
            .unwrap();

        sleep(Duration::from_secs(61)).await;
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "sensors/1");
        assert_eq!(published[0].qos, QoS::AtMostOnce);
        assert!(!published[0].retain);
        let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(payload, json!({"temperature": 20.0, "humidity": 55.0}));

        // Nothing new arrived, so the next tick publishes nothing.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.published().len(), 1);

        handle.abort();
    }
}
