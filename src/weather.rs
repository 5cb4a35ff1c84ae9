use crate::broker_mux::BrokerMux;
use crate::config::WeatherConfig;
use crate::job_runner::new_job_runner;
use crate::service_utils::publish_with_timeout;
use reqwest::StatusCode;
use rumqttc::QoS;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, error, info};

const WEATHER_URL: &str = "http://api.openweathermap.org/data/2.5/weather";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Degree sign in the matrix font (Latin-1).
pub const DEGREE: u8 = 0xB0;

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("GET error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GET bad response: {0}")]
    Status(StatusCode),
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct WeatherData {
    weather: Vec<Condition>,
    main: MainData,
    wind: Wind,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Condition {
    description: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct MainData {
    temp: f32,
    pressure: i32,
    humidity: u32,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Wind {
    speed: f32,
    deg: u32,
}

/// One job runner per location, all publishing to the same topic.
pub fn init_weather(mux: Arc<BrokerMux>, config: &WeatherConfig) {
    if config.topic.is_empty() {
        return;
    }

    if config.key.is_empty() {
        error!("weather: empty key");
    }

    let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("weather: http client: {}", e);
            return;
        }
    };

    for location in &config.locations {
        let mux = mux.clone();
        let client = client.clone();
        let topic = config.topic.clone();
        let key = config.key.clone();
        let zipcode = location.zipcode.clone();

        new_job_runner(&format!("weather-{}", location.zipcode), &location.jobs, move || {
            let mux = mux.clone();
            let client = client.clone();
            let topic = topic.clone();
            let key = key.clone();
            let zipcode = zipcode.clone();
            async move { report_weather(&mux, &client, &topic, &key, &zipcode).await }
        })
        .run();
    }
}

async fn fetch_weather(
    client: &reqwest::Client,
    key: &str,
    zipcode: &str,
) -> Result<WeatherData, WeatherError> {
    let response = client
        .get(WEATHER_URL)
        .query(&[("zip", zipcode), ("APPID", key), ("units", "imperial")])
        .send()
        .await?;

    if response.status() != StatusCode::OK {
        return Err(WeatherError::Status(response.status()));
    }

    Ok(response.json::<WeatherData>().await?)
}

/// `"<zip> is 72° with light rain, mist and 5 MPH wind"`
fn format_event(zipcode: &str, data: &WeatherData) -> Vec<u8> {
    let conditions = data
        .weather
        .iter()
        .map(|c| c.description.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut event = format!("{} is {:.0}", zipcode, data.main.temp).into_bytes();
    event.push(DEGREE);
    event.extend_from_slice(
        format!(" with {} and {:.0} MPH wind", conditions, data.wind.speed).as_bytes(),
    );
    event
}

async fn report_weather(
    mux: &BrokerMux,
    client: &reqwest::Client,
    topic: &str,
    key: &str,
    zipcode: &str,
) {
    let data = match fetch_weather(client, key, zipcode).await {
        Ok(data) => data,
        Err(e) => {
            error!("weather: {}: {}", zipcode, e);
            return;
        }
    };

    debug!(
        "weather: {}: pressure={} humidity={} wind_deg={}",
        zipcode, data.main.pressure, data.main.humidity, data.wind.deg
    );
    let event = format_event(zipcode, &data);
    info!("weather: {}", String::from_utf8_lossy(&event));

    publish_with_timeout(mux, topic, QoS::AtMostOnce, false, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "weather": [{"id": 500, "description": "light rain"}, {"id": 701, "description": "mist"}],
        "main": {"temp": 54.2, "pressure": 1012, "humidity": 87},
        "wind": {"speed": 7.8, "deg": 200},
        "name": "Seattle"
    }"#;

    #[test]
    fn event_text_uses_matrix_degree_sign() {
        let data: WeatherData = serde_json::from_str(RESPONSE).unwrap();
        assert_eq!(data.main.pressure, 1012);
        assert_eq!(data.main.humidity, 87);
        assert_eq!(data.wind.deg, 200);

        let mut expected = b"98101 is 54".to_vec();
        expected.push(0xB0);
        expected.extend_from_slice(b" with light rain, mist and 8 MPH wind");
        assert_eq!(format_event("98101", &data), expected);
    }

    #[test]
    fn missing_sections_default_to_zero() {
        let data: WeatherData = serde_json::from_str(r#"{"main": {"temp": 30.9}}"#).unwrap();

        let mut expected = b"10001 is 31".to_vec();
        expected.push(0xB0);
        expected.extend_from_slice(b" with  and 0 MPH wind");
        assert_eq!(format_event("10001", &data), expected);
    }
}
