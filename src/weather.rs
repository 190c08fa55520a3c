//! Cached weather service.
//!
//! Backs the `!wx` command and `GET /api/weather`. Location comes from the
//! node's GPS (cached on the router); readings are fetched from the
//! Open-Meteo current-conditions API and cached for 30 minutes so repeated
//! mesh requests never hammer the upstream.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};

/// Cache lifetime.
const MAX_AGE: Duration = Duration::from_secs(30 * 60);
/// Upstream request timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One set of current conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherData {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    pub wind_kmh: f64,
    pub weather_code: i32,
    pub fetched_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

impl WeatherData {
    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Weather service with a 30-minute cache.
pub struct WeatherService {
    station_name: String,
    location: Mutex<Option<(f64, f64)>>,
    cache: Mutex<Option<WeatherData>>,
    http: reqwest::Client,
}

impl WeatherService {
    pub fn new(station_name: &str, lat: Option<f64>, lon: Option<f64>) -> Self {
        let location = match (lat, lon) {
            (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some((lat, lon)),
            _ => None,
        };
        Self {
            station_name: station_name.to_string(),
            location: Mutex::new(location),
            cache: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    /// Update the station location (GPS fix from the node).
    pub fn update_location(&self, lat: f64, lon: f64) {
        let mut guard = self.location.lock().expect("location poisoned");
        if guard.map_or(true, |(old_lat, old_lon)| old_lat != lat || old_lon != lon) {
            debug!(lat, lon, "weather location updated");
            *guard = Some((lat, lon));
            // New location invalidates cached readings.
            *self.cache.lock().expect("cache poisoned") = None;
        }
    }

    pub fn has_location(&self) -> bool {
        self.location.lock().expect("location poisoned").is_some()
    }

    /// Current conditions, from cache when fresh.
    pub async fn get_weather(&self) -> GatewayResult<WeatherData> {
        let (lat, lon) = self
            .location
            .lock()
            .expect("location poisoned")
            .ok_or_else(|| GatewayError::Validation("no GPS location available".into()))?;

        if let Some(cached) = self.cache.lock().expect("cache poisoned").clone() {
            if cached.age() < MAX_AGE {
                debug!(age_secs = cached.age().as_secs(), "serving cached weather");
                return Ok(cached);
            }
        }

        let data = self.fetch(lat, lon).await?;
        *self.cache.lock().expect("cache poisoned") = Some(data.clone());
        info!(
            temp = data.temperature_c,
            hum = data.humidity_pct,
            "weather refreshed"
        );
        Ok(data)
    }

    async fn fetch(&self, lat: f64, lon: f64) -> GatewayResult<WeatherData> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}\
             &current=temperature_2m,relative_humidity_2m,surface_pressure,wind_speed_10m,weather_code"
        );
        let resp: Value = self
            .http
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let current = resp
            .get("current")
            .ok_or_else(|| GatewayError::Validation("weather response missing current".into()))?;
        let field = |name: &str| current.get(name).and_then(Value::as_f64);

        Ok(WeatherData {
            temperature_c: field("temperature_2m").unwrap_or(0.0),
            humidity_pct: field("relative_humidity_2m").unwrap_or(0.0),
            pressure_hpa: field("surface_pressure").unwrap_or(0.0),
            wind_kmh: field("wind_speed_10m").unwrap_or(0.0),
            weather_code: field("weather_code").unwrap_or(0.0) as i32,
            fetched_at: Utc::now(),
            lat,
            lon,
        })
    }

    /// Compact rendering that fits a LoRa chunk.
    pub fn format_for_lora(&self, data: &WeatherData) -> String {
        let name = if self.station_name.is_empty() {
            "WX".to_string()
        } else {
            self.station_name.clone()
        };
        format!(
            "{} {}: {:.1}°C, {:.0}% rh, {:.0} hPa, wind {:.0} km/h",
            weather_icon(data.weather_code),
            name,
            data.temperature_c,
            data.humidity_pct,
            data.pressure_hpa,
            data.wind_kmh,
        )
    }

    /// JSON body for `GET /api/weather`.
    pub fn to_api_json(&self, data: &WeatherData) -> Value {
        json!({
            "station": self.station_name,
            "temperature": data.temperature_c,
            "humidity": data.humidity_pct,
            "pressure": data.pressure_hpa,
            "wind_kmh": data.wind_kmh,
            "weather_code": data.weather_code,
            "lat": data.lat,
            "lon": data.lon,
            "data_age_minutes": data.age().as_secs() / 60,
            "timestamp": data.fetched_at.timestamp_millis(),
        })
    }

    /// Seed the cache directly; used by tests.
    #[doc(hidden)]
    pub fn seed_cache(&self, data: WeatherData) {
        self.update_location(data.lat, data.lon);
        *self.cache.lock().expect("cache poisoned") = Some(data);
    }
}

/// WMO weather code to a rough icon.
fn weather_icon(code: i32) -> &'static str {
    match code {
        0 => "☀️",
        1..=3 => "🌤",
        45 | 48 => "🌫",
        51..=67 => "🌧",
        71..=77 => "🌨",
        80..=82 => "🌦",
        95..=99 => "⛈",
        _ => "🌡",
    }
}
