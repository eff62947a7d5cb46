//! Home Assistant MQTT publisher for forecast results
//!
//! Publishes a results file as one retained JSON blob on `{base}/forecast`,
//! plus HA discovery config and availability. Optional scalar topics:
//!   `{base}/forecast/meta/<key>`
//!   `{base}/<site>/total_energy_kwh`
//!   `{base}/<site>/<array>/<metric>`
//!
//! The retained blob is only replaced when the local forecast is newer AND its
//! content (ignoring `generated_at`) changed.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::config::MqttConfig;

const RETAINED_WAIT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Cannot connect to {host}:{port} after {attempts} attempt(s): {source}")]
    Connect {
        host: String,
        port: u16,
        attempts: u32,
        #[source]
        source: rumqttc::ConnectionError,
    },

    #[error("MQTT connection lost: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Forecast payload must be a JSON object")]
    InvalidPayload,
}

// ─── Payload shaping ─────────────────────────────────────────────────────────

fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn energy_of(array: &Value) -> f64 {
    array.get("energy_kwh").and_then(Value::as_f64).unwrap_or(0.0)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn sort_by_id(items: &mut [Value]) {
    items.sort_by(|a, b| {
        let a = a.get("id").and_then(Value::as_str).unwrap_or("");
        let b = b.get("id").and_then(Value::as_str).unwrap_or("");
        a.cmp(b)
    });
}

/// Array entry with `id` taking over a legacy `array` key.
fn clean_array(raw: &Value) -> Value {
    let mut obj = raw.as_object().cloned().unwrap_or_default();
    let id = str_field(raw, &["id", "array"]).map(str::to_string);
    obj.remove("array");
    obj.insert("id".into(), id.map_or(Value::Null, Value::String));
    Value::Object(obj)
}

/// Hierarchical `{meta, sites}` form of either results layout.
///
/// The flat layout is a top-level `results` list of per-array rows carrying
/// `site` and `array` keys plus top-level `generated_at`/`date`.
pub fn normalize_payload(data: &Value) -> Value {
    let (mut meta, mut sites) = match (data.get("meta"), data.get("sites").and_then(Value::as_array)) {
        (Some(meta), Some(raw_sites)) => {
            let sites: Vec<Value> = raw_sites
                .iter()
                .map(|site| {
                    let mut arrays: Vec<Value> = site
                        .get("arrays")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().map(clean_array).collect())
                        .unwrap_or_default();
                    sort_by_id(&mut arrays);
                    let total = site
                        .get("total_energy_kwh")
                        .filter(|v| !v.is_null())
                        .cloned()
                        .unwrap_or_else(|| json!(round3(arrays.iter().map(energy_of).sum())));
                    let mut clean = Map::new();
                    clean.insert("id".into(), json!(str_field(site, &["id", "site"])));
                    clean.insert("total_energy_kwh".into(), total);
                    clean.insert("arrays".into(), Value::Array(arrays));
                    if let Some(location) = site.get("location") {
                        clean.insert("location".into(), location.clone());
                    }
                    Value::Object(clean)
                })
                .collect();
            (meta.as_object().cloned().unwrap_or_default(), sites)
        }
        _ => {
            let mut by_site: Vec<(String, Vec<Value>)> = Vec::new();
            for rec in data.get("results").and_then(Value::as_array).into_iter().flatten() {
                let site = str_field(rec, &["site"]).unwrap_or("unknown").to_string();
                match by_site.iter_mut().find(|(s, _)| *s == site) {
                    Some((_, arrays)) => arrays.push(clean_array(rec)),
                    None => by_site.push((site, vec![clean_array(rec)])),
                }
            }
            let sites = by_site
                .into_iter()
                .map(|(id, mut arrays)| {
                    sort_by_id(&mut arrays);
                    let total = round3(arrays.iter().map(energy_of).sum());
                    json!({ "id": id, "total_energy_kwh": total, "arrays": arrays })
                })
                .collect();
            let mut meta = Map::new();
            for key in ["generated_at", "date", "timestep", "provider", "total_energy_kwh"] {
                meta.insert(key.into(), data.get(key).cloned().unwrap_or(Value::Null));
            }
            (meta, sites)
        }
    };
    sort_by_id(&mut sites);

    if meta.get("total_energy_kwh").is_none_or(Value::is_null) {
        let total: f64 = sites
            .iter()
            .filter_map(|s| s.get("total_energy_kwh").and_then(Value::as_f64))
            .sum();
        meta.insert("total_energy_kwh".into(), json!(round3(total)));
    }
    let array_count: usize = sites
        .iter()
        .map(|s| s.get("arrays").and_then(Value::as_array).map_or(0, Vec::len))
        .sum();
    meta.entry("site_count").or_insert(json!(sites.len()));
    meta.entry("array_count").or_insert(json!(array_count));

    json!({ "meta": meta, "sites": sites })
}

/// Normalised payload without `generated_at`, for change detection.
pub fn canonical_payload(data: &Value) -> Value {
    let mut normalized = normalize_payload(data);
    if let Some(meta) = normalized.get_mut("meta").and_then(Value::as_object_mut) {
        meta.remove("generated_at");
    }
    normalized
}

/// `generated_at` of either layout; naive stamps are taken as UTC.
pub fn generated_at(payload: &Value) -> Option<DateTime<Utc>> {
    let text = payload
        .get("meta")
        .unwrap_or(payload)
        .get("generated_at")
        .and_then(Value::as_str)?;
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}

/// Newer than the retained state AND different from it.
pub fn should_publish(local: &Value, remote: Option<&Value>) -> bool {
    let Some(remote) = remote else {
        return true;
    };
    let newer = match (generated_at(local), generated_at(remote)) {
        (_, None) => true,
        (Some(l), Some(r)) => l > r,
        (None, Some(_)) => false,
    };
    newer && canonical_payload(local) != canonical_payload(remote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPlan {
    pub state: bool,
    pub topics: bool,
}

impl PublishPlan {
    pub fn any(&self) -> bool {
        self.state || self.topics
    }
}

/// Scalar topics still flow when the state blob is disabled.
pub fn plan_publish(cfg: &MqttConfig, local: &Value, remote: Option<&Value>, force: bool) -> PublishPlan {
    let fresh = should_publish(local, remote);
    PublishPlan {
        state: cfg.publish_state && (force || fresh),
        topics: cfg.publish_topics && (force || !cfg.publish_state || fresh),
    }
}

/// `(topic, value)` pairs for the scalar fan-out of a normalised payload.
pub fn iter_topics(base: &str, payload: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    if let Some(meta) = payload.get("meta").and_then(Value::as_object) {
        for (key, val) in meta {
            out.push((format!("{base}/forecast/meta/{key}"), val.clone()));
        }
    }
    for site in payload.get("sites").and_then(Value::as_array).into_iter().flatten() {
        let site_id = str_field(site, &["id", "site"]).unwrap_or("unknown");
        out.push((
            format!("{base}/{site_id}/total_energy_kwh"),
            site.get("total_energy_kwh").cloned().unwrap_or(Value::Null),
        ));
        for array in site.get("arrays").and_then(Value::as_array).into_iter().flatten() {
            let array_id = str_field(array, &["id", "array"]).unwrap_or("array");
            for (key, val) in array.as_object().into_iter().flatten() {
                if key == "id" || key == "array" {
                    continue;
                }
                out.push((format!("{base}/{site_id}/{array_id}/{key}"), val.clone()));
            }
        }
    }
    out
}

/// Body of a scalar topic: compact JSON for containers, empty for null.
pub fn topic_body(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn discovery_config(cfg: &MqttConfig) -> Value {
    let state = cfg.state_topic();
    json!({
        "name": "Solar Day Forecast",
        "uniq_id": format!("{}_forecast", cfg.base_topic),
        "stat_t": state,
        "avty_t": cfg.availability_topic(),
        "pl_avail": "online",
        "pl_not_avail": "offline",
        "val_tpl": "{{ value_json.meta.total_energy_kwh }}",
        "unit_of_meas": "kWh",
        "dev_cla": "energy",
        "stat_cla": "measurement",
        "json_attr_t": state,
        "json_attr_tpl": "{{ value_json.sites | tojson }}",
        "dev": {
            "name": "Solar Day Forecast",
            "ids": [cfg.base_topic],
            "mf": "solar-day-forecast",
            "mdl": "forecast",
            "sw": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Broker session ──────────────────────────────────────────────────────────

fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = if cfg.client_id.is_empty() {
        format!("solar-forecast-{}", uuid::Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keepalive_s.max(5)));
    opts.set_clean_session(true);
    opts.set_last_will(LastWill::new(
        cfg.availability_topic(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }
    opts
}

async fn wait_connected(cfg: &MqttConfig, eventloop: &mut EventLoop) -> Result<(), MqttError> {
    let attempts = cfg.connect_retries.max(1);
    let mut attempt = 1;
    loop {
        tracing::debug!(host = %cfg.host, port = cfg.port, attempt, "connecting to MQTT broker");
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(source) if attempt >= attempts => {
                return Err(MqttError::Connect {
                    host: cfg.host.clone(),
                    port: cfg.port,
                    attempts,
                    source,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "MQTT connect failed, retrying");
                tokio::time::sleep(Duration::from_secs_f64(cfg.retry_delay_s.max(0.0))).await;
                attempt += 1;
            }
        }
    }
}

/// Retained JSON on `topic`, `None` when nothing arrives within the wait.
async fn read_retained(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    topic: &str,
) -> Result<Option<Value>, MqttError> {
    client.subscribe(topic, QoS::AtLeastOnce).await?;
    let deadline = tokio::time::Instant::now() + RETAINED_WAIT;
    let found = loop {
        match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Err(_) => break None,
            Ok(Ok(Event::Incoming(Packet::Publish(msg)))) if msg.topic == topic => {
                break serde_json::from_slice(&msg.payload).ok();
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }
    };
    client.unsubscribe(topic).await?;
    tracing::debug!(topic, found = found.is_some(), "retained state");
    Ok(found)
}

/// Publish `payload` unless the broker already holds the same or newer data.
///
/// Returns whether anything beyond availability was published.
pub async fn publish_forecast(cfg: &MqttConfig, payload: &Value, force: bool) -> Result<bool, MqttError> {
    if !payload.is_object() {
        return Err(MqttError::InvalidPayload);
    }
    let normalized = normalize_payload(payload);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(cfg), 64);
    wait_connected(cfg, &mut eventloop).await?;
    tracing::info!(host = %cfg.host, port = cfg.port, "connected to MQTT broker");

    let remote = if cfg.publish_state {
        read_retained(&client, &mut eventloop, &cfg.state_topic()).await?
    } else {
        None
    };

    // Drive the connection in the background until our disconnect goes out.
    let driver = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        }
    });

    client
        .publish(cfg.availability_topic(), QoS::AtLeastOnce, true, "online")
        .await?;

    let plan = plan_publish(cfg, &normalized, remote.as_ref(), force);
    tracing::info!(
        force,
        state = plan.state,
        topics = plan.topics,
        local_ts = ?generated_at(&normalized),
        remote_ts = ?remote.as_ref().and_then(generated_at),
        "MQTT publish decision"
    );

    if plan.state {
        if cfg.discovery {
            client
                .publish(cfg.discovery_topic(), QoS::AtLeastOnce, true, discovery_config(cfg).to_string())
                .await?;
        }
        client
            .publish(cfg.state_topic(), QoS::AtLeastOnce, true, normalized.to_string())
            .await?;
    }
    if plan.topics {
        for (topic, value) in iter_topics(&cfg.base_topic, &normalized) {
            client
                .publish(topic, QoS::AtLeastOnce, true, topic_body(&value))
                .await?;
        }
    }

    client.disconnect().await?;
    match driver.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => tracing::warn!(error = %e, "MQTT event loop task failed"),
    }
    Ok(plan.any())
}
