//! Weather oracle: fetches a short-range rain forecast from one of
//! two interchangeable providers, caches it for 15 minutes, and
//! exposes the skip-for-rain signal used by the scheduler.
//!
//! Provider failures never cross this boundary as errors: `current()`
//! returns `None` and the callers apply their own fallback direction
//! (fail-open for schedule skipping, fail-safe for critical-moisture
//! watering; see the decision engine).

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::WeatherConfig;
use crate::db::Db;

/// Live snapshots older than this trigger a provider refetch.
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Rain probability at which open-meteo data is summarized as
/// "it will rain today".
const WILL_RAIN_PROBABILITY: i64 = 50;

#[derive(Debug, Clone, Serialize)]
pub struct WeatherSnapshot {
    pub temperature: i64,
    pub humidity: i64,
    pub wind_speed: i64,
    pub description: String,
    pub rain_today: i64,
    pub rain_tomorrow: i64,
    pub rain_day3: i64,
    pub will_rain: bool,
    pub location: String,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Single-slot snapshot cache with an explicit clock so the freshness
/// window is testable.
pub struct WeatherCache {
    ttl: Duration,
    slot: Option<(Instant, WeatherSnapshot)>,
}

impl WeatherCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, slot: None }
    }

    pub fn get(&self, now: Instant) -> Option<&WeatherSnapshot> {
        match &self.slot {
            Some((stored_at, snap)) if now.duration_since(*stored_at) < self.ttl => Some(snap),
            _ => None,
        }
    }

    pub fn store(&mut self, now: Instant, snap: WeatherSnapshot) {
        self.slot = Some((now, snap));
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct WeatherService {
    cfg: WeatherConfig,
    http: reqwest::Client,
    db: Db,
    cache: Mutex<WeatherCache>,
}

impl WeatherService {
    pub fn new(cfg: WeatherConfig, db: Db) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            http,
            db,
            cache: Mutex::new(WeatherCache::new(CACHE_TTL)),
        }
    }

    pub fn rain_threshold(&self) -> i64 {
        self.cfg.rain_threshold
    }

    /// Current snapshot: cache within the freshness window, otherwise
    /// one provider call. None when disabled or the provider failed.
    pub async fn current(&self) -> Option<WeatherSnapshot> {
        if !self.cfg.enabled {
            return None;
        }

        {
            let cache = self.cache.lock().await;
            if let Some(snap) = cache.get(Instant::now()) {
                return Some(snap.clone());
            }
        }

        match self.fetch().await {
            Ok(snap) => {
                // Audit trail, independent of the live cache.
                if let Err(e) = self
                    .db
                    .insert_weather_log(
                        snap.temperature as f64,
                        snap.humidity,
                        snap.rain_today,
                        snap.wind_speed as f64,
                        &snap.description,
                    )
                    .await
                {
                    warn!("weather log insert failed: {e:#}");
                }
                info!(
                    provider = %snap.provider,
                    temperature = snap.temperature,
                    rain_today = snap.rain_today,
                    "weather updated"
                );
                self.cache.lock().await.store(Instant::now(), snap.clone());
                Some(snap)
            }
            Err(e) => {
                warn!("weather fetch failed: {e:#}");
                None
            }
        }
    }

    /// Drop the cache and refetch.
    pub async fn refresh(&self) -> Option<WeatherSnapshot> {
        self.cache.lock().await.clear();
        self.current().await
    }

    /// Whether a scheduled run should be skipped because of rain.
    /// Fail-open: missing weather data never blocks a schedule.
    pub async fn should_skip(&self) -> bool {
        let snap = self.current().await;
        skip_for_rain(snap.as_ref(), self.cfg.rain_threshold)
    }

    /// Keep the cache warm so schedule decisions never wait on a
    /// provider round-trip.
    pub fn spawn_refresh_loop(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_TTL);
            ticker.tick().await; // first tick fires immediately
            loop {
                self.current().await;
                ticker.tick().await;
            }
        })
    }

    /// Seed the cache directly so tests exercise weather-dependent
    /// paths without a provider round-trip.
    #[cfg(test)]
    pub(crate) async fn prime_cache_for_tests(&self, snap: WeatherSnapshot) {
        self.cache.lock().await.store(Instant::now(), snap);
    }

    async fn fetch(&self) -> Result<WeatherSnapshot> {
        match self.cfg.provider.as_str() {
            "open-meteo" => self.fetch_open_meteo().await,
            "openweathermap" => self.fetch_openweathermap().await,
            other => anyhow::bail!("unknown weather provider '{other}'"),
        }
    }

    async fn fetch_open_meteo(&self) -> Result<WeatherSnapshot> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={}&longitude={}\
             &current=temperature_2m,relative_humidity_2m,weather_code,wind_speed_10m\
             &hourly=precipitation_probability&timezone=auto&forecast_days=3",
            self.cfg.lat, self.cfg.lon
        );
        let data: OpenMeteoResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("open-meteo request failed")?
            .error_for_status()
            .context("open-meteo returned an error status")?
            .json()
            .await
            .context("open-meteo returned malformed json")?;

        let location = self.reverse_geocode().await;
        Ok(snapshot_from_open_meteo(&data, location))
    }

    async fn fetch_openweathermap(&self) -> Result<WeatherSnapshot> {
        let current_url = format!(
            "https://api.openweathermap.org/data/2.5/weather?lat={}&lon={}&appid={}&units=metric",
            self.cfg.lat, self.cfg.lon, self.cfg.api_key
        );
        let current: OwmCurrentResponse = self
            .http
            .get(&current_url)
            .send()
            .await
            .context("openweathermap request failed")?
            .error_for_status()
            .context("openweathermap returned an error status")?
            .json()
            .await
            .context("openweathermap returned malformed json")?;

        let forecast_url = format!(
            "https://api.openweathermap.org/data/2.5/forecast?lat={}&lon={}&appid={}&units=metric&cnt=24",
            self.cfg.lat, self.cfg.lon, self.cfg.api_key
        );
        let forecast: OwmForecastResponse = self
            .http
            .get(&forecast_url)
            .send()
            .await
            .context("openweathermap forecast request failed")?
            .error_for_status()
            .context("openweathermap forecast returned an error status")?
            .json()
            .await
            .context("openweathermap forecast returned malformed json")?;

        Ok(snapshot_from_owm(&current, &forecast))
    }

    /// Best-effort location name lookup; failures fall back to a
    /// generic label without affecting the snapshot.
    async fn reverse_geocode(&self) -> String {
        let url = format!(
            "https://nominatim.openstreetmap.org/reverse?lat={}&lon={}&format=json",
            self.cfg.lat, self.cfg.lon
        );
        let resp = self
            .http
            .get(&url)
            .header("User-Agent", "irrigation-controller/0.1")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let resp = match resp {
            Ok(r) => r,
            Err(_) => return "Unknown".to_string(),
        };
        match resp.json::<NominatimResponse>().await {
            Ok(NominatimResponse { address: Some(a) }) => a
                .city
                .or(a.town)
                .or(a.village)
                .or(a.suburb)
                .unwrap_or_else(|| "Unknown".to_string()),
            _ => "Unknown".to_string(),
        }
    }
}

/// Pure skip rule shared by `should_skip` and tests.
pub fn skip_for_rain(snap: Option<&WeatherSnapshot>, rain_threshold: i64) -> bool {
    match snap {
        None => false, // fail-open
        Some(w) => w.rain_today >= rain_threshold || w.will_rain,
    }
}

// ---------------------------------------------------------------------------
// Provider wire formats + normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    current: OpenMeteoCurrent,
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    temperature_2m: f64,
    relative_humidity_2m: i64,
    weather_code: i64,
    wind_speed_10m: f64,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    precipitation_probability: Vec<Option<i64>>,
}

#[derive(Debug, Deserialize)]
struct OwmCurrentResponse {
    main: OwmMain,
    weather: Vec<OwmWeather>,
    wind: OwmWind,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    humidity: i64,
}

#[derive(Debug, Deserialize)]
struct OwmWeather {
    main: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct OwmForecastResponse {
    #[serde(default)]
    list: Vec<OwmForecastItem>,
}

#[derive(Debug, Deserialize)]
struct OwmForecastItem {
    #[serde(default)]
    pop: Option<f64>,
    #[serde(default)]
    weather: Vec<OwmWeather>,
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    suburb: Option<String>,
}

fn snapshot_from_open_meteo(data: &OpenMeteoResponse, location: String) -> WeatherSnapshot {
    let probs = data
        .hourly
        .as_ref()
        .map(|h| h.precipitation_probability.as_slice())
        .unwrap_or(&[]);
    let rain_today = window_max(probs, 0, 24);
    let rain_tomorrow = window_max(probs, 24, 48);
    let rain_day3 = window_max(probs, 48, 72);

    WeatherSnapshot {
        temperature: data.current.temperature_2m.round() as i64,
        humidity: data.current.relative_humidity_2m,
        wind_speed: data.current.wind_speed_10m.round() as i64,
        description: describe_weather_code(data.current.weather_code).to_string(),
        rain_today,
        rain_tomorrow,
        rain_day3,
        will_rain: rain_today >= WILL_RAIN_PROBABILITY,
        location,
        provider: "open-meteo".to_string(),
        fetched_at: Utc::now(),
    }
}

fn snapshot_from_owm(current: &OwmCurrentResponse, forecast: &OwmForecastResponse) -> WeatherSnapshot {
    let mut max_rain_prob: i64 = 0;
    let mut will_rain = false;
    for item in &forecast.list {
        if let Some(pop) = item.pop {
            max_rain_prob = max_rain_prob.max((pop * 100.0).round() as i64);
        }
        if item.weather.iter().any(|w| w.main == "Rain") {
            will_rain = true;
        }
    }

    WeatherSnapshot {
        temperature: current.main.temp.round() as i64,
        humidity: current.main.humidity,
        // m/s to km/h
        wind_speed: (current.wind.speed * 3.6).round() as i64,
        description: current
            .weather
            .first()
            .map(|w| w.description.clone())
            .unwrap_or_default(),
        rain_today: max_rain_prob,
        rain_tomorrow: 0,
        rain_day3: 0,
        will_rain,
        location: current.name.clone().unwrap_or_else(|| "Unknown".to_string()),
        provider: "openweathermap".to_string(),
        fetched_at: Utc::now(),
    }
}

/// Max probability over `probs[start..end]`, ignoring null entries.
fn window_max(probs: &[Option<i64>], start: usize, end: usize) -> i64 {
    probs
        .iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .filter_map(|p| *p)
        .max()
        .unwrap_or(0)
}

fn describe_weather_code(code: i64) -> &'static str {
    match code {
        0 => "Clear",
        1 => "Mostly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 | 48 => "Fog",
        51 | 53 | 55 => "Drizzle",
        61 => "Light rain",
        63 => "Rain",
        65 => "Heavy rain",
        71 | 73 | 75 => "Snow",
        80 | 81 => "Rain showers",
        82 => "Heavy rain showers",
        95 | 96 | 99 => "Thunderstorm",
        _ => "Unknown",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(rain_today: i64, will_rain: bool) -> WeatherSnapshot {
        WeatherSnapshot {
            temperature: 20,
            humidity: 50,
            wind_speed: 10,
            description: "Clear".into(),
            rain_today,
            rain_tomorrow: 0,
            rain_day3: 0,
            will_rain,
            location: "Test".into(),
            provider: "open-meteo".into(),
            fetched_at: Utc::now(),
        }
    }

    // -- Cache -----------------------------------------------------------

    #[test]
    fn cache_miss_when_empty() {
        let cache = WeatherCache::new(CACHE_TTL);
        assert!(cache.get(Instant::now()).is_none());
    }

    #[test]
    fn cache_hit_within_ttl() {
        let mut cache = WeatherCache::new(CACHE_TTL);
        let t0 = Instant::now();
        cache.store(t0, snap(10, false));
        assert!(cache.get(t0 + Duration::from_secs(14 * 60)).is_some());
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = WeatherCache::new(CACHE_TTL);
        let t0 = Instant::now();
        cache.store(t0, snap(10, false));
        assert!(cache.get(t0 + Duration::from_secs(15 * 60)).is_none());
    }

    #[test]
    fn cache_clear_forgets_snapshot() {
        let mut cache = WeatherCache::new(CACHE_TTL);
        let t0 = Instant::now();
        cache.store(t0, snap(10, false));
        cache.clear();
        assert!(cache.get(t0).is_none());
    }

    // -- Skip rule -------------------------------------------------------

    #[test]
    fn skip_is_fail_open_when_unavailable() {
        assert!(!skip_for_rain(None, 70));
    }

    #[test]
    fn skip_when_rain_at_threshold() {
        assert!(skip_for_rain(Some(&snap(70, false)), 70));
    }

    #[test]
    fn no_skip_below_threshold_without_will_rain() {
        assert!(!skip_for_rain(Some(&snap(69, false)), 70));
    }

    #[test]
    fn skip_when_will_rain_regardless_of_probability() {
        assert!(skip_for_rain(Some(&snap(10, true)), 70));
    }

    // -- Open-Meteo normalization ---------------------------------------

    #[test]
    fn open_meteo_windows_take_max_per_day() {
        let mut probs: Vec<Option<i64>> = vec![Some(5); 72];
        probs[3] = Some(40); // today
        probs[30] = Some(80); // tomorrow
        probs[50] = None; // nulls ignored
        probs[71] = Some(22); // day 3

        let data = OpenMeteoResponse {
            current: OpenMeteoCurrent {
                temperature_2m: 21.6,
                relative_humidity_2m: 55,
                weather_code: 2,
                wind_speed_10m: 9.4,
            },
            hourly: Some(OpenMeteoHourly {
                precipitation_probability: probs,
            }),
        };
        let s = snapshot_from_open_meteo(&data, "Vienna".into());
        assert_eq!(s.temperature, 22);
        assert_eq!(s.wind_speed, 9);
        assert_eq!(s.description, "Partly cloudy");
        assert_eq!(s.rain_today, 40);
        assert_eq!(s.rain_tomorrow, 80);
        assert_eq!(s.rain_day3, 22);
        assert!(!s.will_rain); // today 40 < 50
        assert_eq!(s.location, "Vienna");
    }

    #[test]
    fn open_meteo_will_rain_at_fifty() {
        let data = OpenMeteoResponse {
            current: OpenMeteoCurrent {
                temperature_2m: 15.0,
                relative_humidity_2m: 80,
                weather_code: 61,
                wind_speed_10m: 5.0,
            },
            hourly: Some(OpenMeteoHourly {
                precipitation_probability: vec![Some(50); 24],
            }),
        };
        let s = snapshot_from_open_meteo(&data, "x".into());
        assert!(s.will_rain);
    }

    #[test]
    fn open_meteo_missing_hourly_means_zero_rain() {
        let data = OpenMeteoResponse {
            current: OpenMeteoCurrent {
                temperature_2m: 30.0,
                relative_humidity_2m: 20,
                weather_code: 0,
                wind_speed_10m: 2.0,
            },
            hourly: None,
        };
        let s = snapshot_from_open_meteo(&data, "x".into());
        assert_eq!(s.rain_today, 0);
        assert!(!s.will_rain);
    }

    #[test]
    fn open_meteo_wire_format_parses() {
        let json = r#"{
            "current": {
                "temperature_2m": 18.3,
                "relative_humidity_2m": 62,
                "weather_code": 3,
                "wind_speed_10m": 11.2
            },
            "hourly": { "precipitation_probability": [10, null, 35] }
        }"#;
        let data: OpenMeteoResponse = serde_json::from_str(json).unwrap();
        let s = snapshot_from_open_meteo(&data, "x".into());
        assert_eq!(s.rain_today, 35);
        assert_eq!(s.description, "Overcast");
    }

    // -- OpenWeatherMap normalization -----------------------------------

    #[test]
    fn owm_takes_max_pop_and_rain_condition() {
        let current = OwmCurrentResponse {
            main: OwmMain {
                temp: 19.7,
                humidity: 70,
            },
            weather: vec![OwmWeather {
                main: "Clouds".into(),
                description: "scattered clouds".into(),
            }],
            wind: OwmWind { speed: 4.0 },
            name: Some("Graz".into()),
        };
        let forecast = OwmForecastResponse {
            list: vec![
                OwmForecastItem {
                    pop: Some(0.35),
                    weather: vec![],
                },
                OwmForecastItem {
                    pop: Some(0.6),
                    weather: vec![OwmWeather {
                        main: "Rain".into(),
                        description: "light rain".into(),
                    }],
                },
            ],
        };
        let s = snapshot_from_owm(&current, &forecast);
        assert_eq!(s.temperature, 20);
        assert_eq!(s.wind_speed, 14); // 4 m/s -> 14.4 km/h rounded
        assert_eq!(s.rain_today, 60);
        assert!(s.will_rain);
        assert_eq!(s.location, "Graz");
        assert_eq!(s.provider, "openweathermap");
    }

    #[test]
    fn owm_empty_forecast_is_dry() {
        let current = OwmCurrentResponse {
            main: OwmMain {
                temp: 25.0,
                humidity: 30,
            },
            weather: vec![],
            wind: OwmWind { speed: 1.0 },
            name: None,
        };
        let forecast = OwmForecastResponse { list: vec![] };
        let s = snapshot_from_owm(&current, &forecast);
        assert_eq!(s.rain_today, 0);
        assert!(!s.will_rain);
        assert_eq!(s.location, "Unknown");
    }

    // -- window_max ------------------------------------------------------

    #[test]
    fn window_max_handles_short_series() {
        let probs = vec![Some(10), Some(20)];
        assert_eq!(window_max(&probs, 0, 24), 20);
        assert_eq!(window_max(&probs, 24, 48), 0);
    }
}
