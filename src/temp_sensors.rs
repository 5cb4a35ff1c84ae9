//! Collects sensor reports from MQTT and posts one summary line per group,
//! e.g. `Porch is 71.6° / 40%:Garage is 55.2°`, on the group's schedule.

use crate::broker_mux::BrokerMux;
use crate::config::TempSensorGroupConfig;
use crate::job_runner::{new_job_runner, JobRunner};
use crate::models::SensorReport;
use crate::service_utils::publish_detached;
use crate::weather::DEGREE;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

enum TempEvent {
    Reading { topic: String, payload: Vec<u8> },
    Report(usize),
}

#[derive(Debug)]
struct TempSensor {
    name: String,
    /// Fahrenheit.
    last_temp: f32,
    last_humidity: f32,
    dirty: bool,
}

impl TempSensor {
    fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}

/// All sensor state. Only the aggregation task touches it.
struct TempSensors {
    groups: Vec<TempSensorGroupConfig>,
    sensors: HashMap<String, TempSensor>,
}

impl TempSensors {
    fn new(groups: &[TempSensorGroupConfig]) -> Self {
        let sensors = groups
            .iter()
            .flat_map(|group| group.sensors.iter())
            .map(|sensor| {
                (
                    sensor.sub.clone(),
                    TempSensor {
                        name: sensor.name.clone(),
                        last_temp: 0.0,
                        last_humidity: 0.0,
                        dirty: false,
                    },
                )
            })
            .collect();

        Self {
            groups: groups.to_vec(),
            sensors,
        }
    }

    fn process_temp(&mut self, topic: &str, payload: &[u8]) {
        let Some(sensor) = self.sensors.get_mut(topic) else {
            return;
        };

        match serde_json::from_slice::<SensorReport>(payload) {
            Ok(report) => {
                sensor.dirty = true;
                sensor.last_temp = report.temperature * 9.0 / 5.0 + 32.0;
                sensor.last_humidity = report.humidity;
                debug!(
                    "sensors: processTemp: {} {:.2} {:.0}",
                    topic, sensor.last_temp, sensor.last_humidity
                );
            }
            Err(e) => error!("sensors: processTemp: error={}", e),
        }
    }

    /// Summary of the group's sensors that changed since the last report.
    fn process_group(&mut self, index: usize) -> Option<(String, Vec<u8>)> {
        let group = self.groups.get(index)?;
        let mut event: Vec<u8> = Vec::new();

        for desc in &group.sensors {
            let Some(sensor) = self.sensors.get_mut(&desc.sub) else {
                continue;
            };
            if !sensor.take_dirty() {
                continue;
            }

            if !event.is_empty() {
                event.push(b':');
            }
            event.extend_from_slice(format!("{} is {:.1}", sensor.name, sensor.last_temp).as_bytes());
            event.push(DEGREE);
            if sensor.last_humidity > 0.0 {
                // Biased up half a point before rounding.
                event.extend_from_slice(format!(" / {:.0}%", sensor.last_humidity + 0.5).as_bytes());
            }
        }

        if event.is_empty() {
            None
        } else {
            Some((group.topic.clone(), event))
        }
    }
}

/// Subscribes to every sensor, starts the aggregation task, then the
/// per-group job runners.
pub async fn init_temp_sensors(mux: Arc<BrokerMux>, groups: &[TempSensorGroupConfig]) {
    if groups.is_empty() {
        return;
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut runners: Vec<JobRunner> = Vec::with_capacity(groups.len());

    for (idx, group) in groups.iter().enumerate() {
        debug!("tempSensors: init group: {}:{}", group.topic, idx);

        let trigger = events_tx.clone();
        runners.push(new_job_runner(&format!("sensors-{}", idx), &group.jobs, move || {
            let _ = trigger.send(TempEvent::Report(idx));
            async {}
        }));

        for sensor in &group.sensors {
            debug!("tempSensors: init sensor: {} ({})", sensor.sub, sensor.name);

            let readings = events_tx.clone();
            let result = mux
                .subscribe(&sensor.sub, QoS::AtMostOnce, move |msg| {
                    let _ = readings.send(TempEvent::Reading {
                        topic: msg.topic().to_string(),
                        payload: msg.payload().to_vec(),
                    });
                })
                .await;

            if let Err(e) = result {
                error!("tempSensors: {}: {}", sensor.sub, e);
            }
        }
    }

    let mut state = TempSensors::new(groups);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                TempEvent::Reading { topic, payload } => state.process_temp(&topic, &payload),
                TempEvent::Report(idx) => {
                    debug!("sensors: processGroup: {}", idx);
                    if let Some((topic, line)) = state.process_group(idx) {
                        info!("sensors: event: {}", String::from_utf8_lossy(&line));
                        publish_detached(mux.clone(), topic, QoS::AtMostOnce, false, line);
                    }
                }
            }
        }
    });

    for runner in runners {
        runner.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_mux::testing::{recording_mux, TestMessage};
    use crate::config::TempSensorConfig;

    fn groups() -> Vec<TempSensorGroupConfig> {
        vec![TempSensorGroupConfig {
            topic: "home:matrix/text".to_string(),
            jobs: Default::default(),
            sensors: vec![
                TempSensorConfig {
                    sub: "home:sensors/1".to_string(),
                    name: "Porch".to_string(),
                },
                TempSensorConfig {
                    sub: "home:sensors/2".to_string(),
                    name: "Garage".to_string(),
                },
            ],
        }]
    }

    fn with_degree(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(DEGREE);
            }
            out.extend_from_slice(part.as_bytes());
        }
        out
    }

    #[test]
    fn reports_only_changed_sensors() {
        let mut state = TempSensors::new(&groups());
        state.process_temp("home:sensors/1", br#"{"temperature":22,"humidity":40.3}"#);

        let (topic, line) = state.process_group(0).unwrap();
        assert_eq!(topic, "home:matrix/text");
        assert_eq!(line, with_degree(&["Porch is 71.6", " / 41%"]));

        assert!(state.process_group(0).is_none());
    }

    #[test]
    fn joins_sensors_with_colon() {
        let mut state = TempSensors::new(&groups());
        state.process_temp("home:sensors/1", br#"{"temperature":0}"#);
        state.process_temp("home:sensors/2", br#"{"temperature":100,"humidity":0}"#);

        let (_, line) = state.process_group(0).unwrap();
        assert_eq!(line, with_degree(&["Porch is 32.0", ":Garage is 212.0", ""]));
    }

    #[test]
    fn ignores_unknown_topics_and_bad_json() {
        let mut state = TempSensors::new(&groups());
        state.process_temp("home:sensors/9", br#"{"temperature":10}"#);
        state.process_temp("home:sensors/1", b"not json");

        assert!(state.process_group(0).is_none());
        assert!(state.process_group(7).is_none());
    }

    #[tokio::test]
    async fn subscribes_every_sensor() {
        let (mux, broker) = recording_mux("home");
        init_temp_sensors(mux, &groups()).await;

        assert_eq!(
            broker.filters(),
            vec!["sensors/1".to_string(), "sensors/2".to_string()]
        );

        // Delivery goes through the namespaced topic without blocking.
        broker.deliver(&TestMessage::new("sensors/1", br#"{"temperature":20}"#));
    }
}
