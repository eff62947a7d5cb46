use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use solar_day_forecast::config::{Config, MqttConfig, WeatherMode, WeatherSource};
use solar_day_forecast::debug::{DebugCollector, DebugEvent, JsonlWriter, NullCollector, TracingCollector};
use solar_day_forecast::engine::{
    AdjustOutcome, LoadWindowParams, SimulationOptions, TimeLabel, apply_actual_adjustment,
    attach_climatology, compute_load_windows, simulate_day,
};
use solar_day_forecast::models::{Scenario, SimulationResult, Timestamp};
use solar_day_forecast::output::{
    ForecastPayload, already_generated_today, interval_records, write_daily_csv, write_intervals,
};
use solar_day_forecast::services::mqtt_service::publish_forecast;
use solar_day_forecast::weather::{
    CloudScaledProvider, CompositeProvider, OpenMeteoProvider, PvgisTmyProvider, WeatherProvider,
};

#[derive(Parser, Debug)]
#[command(name = "solar-day-forecast", version, about = "Single-day PV AC energy forecast")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate one day and write the forecast
    Run(RunArgs),
    /// Publish a results file to Home Assistant over MQTT
    PublishMqtt(PublishArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Local calendar date to simulate (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,
    /// Weather resolution, e.g. 1h or 15m
    #[arg(long)]
    timestep: Option<String>,
    /// Period convention of weather timestamps: start, end or center
    #[arg(long)]
    weather_label: Option<String>,
    #[arg(long, value_enum)]
    weather_source: Option<WeatherSource>,
    #[arg(long, value_enum)]
    weather_mode: Option<WeatherMode>,
    #[arg(long)]
    pvgis_cache_dir: Option<PathBuf>,
    /// Compare against a PVGIS TMY baseline and clamp outliers
    #[arg(long)]
    qc_climatology: bool,
    /// Energy already produced today, in kWh
    #[arg(long)]
    actual_kwh_today: Option<f64>,
    /// Instant the actual energy was measured (RFC 3339 or local naive time)
    #[arg(long)]
    actual_as_of: Option<String>,
    /// Continue without adjustment when it cannot be applied
    #[arg(long)]
    actual_limit_suppress: bool,
    #[arg(long)]
    base_load_w: Option<f64>,
    #[arg(long)]
    min_duration_min: Option<f64>,
    #[arg(long)]
    required_wh: Option<f64>,
    /// JSON-lines audit trail
    #[arg(long)]
    debug: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Per-interval export, .json or .csv
    #[arg(long)]
    intervals: Option<PathBuf>,
    /// Overwrite results already generated today
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct PublishArgs {
    #[arg(long)]
    config: PathBuf,
    /// Results JSON; falls back to `mqtt.input` in the config
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    base_topic: Option<String>,
    /// Publish even when the retained state is newer or identical
    #[arg(long)]
    force: bool,
    /// Skip the retained JSON state blob
    #[arg(long)]
    no_state: bool,
    /// Fan the payload out to scalar topics
    #[arg(long)]
    publish_topics: bool,
    #[arg(long)]
    no_discovery: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Command::Run(args) => run(args, cli.verbose),
        Command::PublishMqtt(args) => publish(args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ─── run ─────────────────────────────────────────────────────────────────────

/// Flag value, then config value.
fn pick<T>(flag: Option<T>, config: Option<T>) -> Option<T> {
    flag.or(config)
}

fn build_provider(
    source: WeatherSource,
    mode: WeatherMode,
    cache_dir: Option<PathBuf>,
) -> Result<Box<dyn WeatherProvider>> {
    let base: Box<dyn WeatherProvider> = match source {
        WeatherSource::OpenMeteo => Box::new(OpenMeteoProvider::new()?),
        WeatherSource::PvgisTmy => Box::new(PvgisTmyProvider::new(cache_dir)?),
        WeatherSource::Composite => Box::new(CompositeProvider::new(
            Box::new(OpenMeteoProvider::new()?),
            Box::new(PvgisTmyProvider::new(cache_dir)?),
        )),
    };
    Ok(match mode {
        WeatherMode::Standard => base,
        WeatherMode::CloudScaled => Box::new(CloudScaledProvider::new(base)),
    })
}

/// RFC 3339, or a naive local time in the zone of the simulated series.
fn parse_as_of(text: &str, result: &SimulationResult) -> Result<Timestamp> {
    let tz = result
        .timeseries
        .values()
        .find_map(|s| s.first_ts())
        .map(|t| t.timezone())
        .unwrap_or(chrono_tz::UTC);
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&tz));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M"))
        .with_context(|| format!("invalid --actual-as-of '{text}'"))?;
    tz.from_local_datetime(&naive)
        .latest()
        .with_context(|| format!("--actual-as-of '{text}' does not exist in {tz}"))
}

fn default_output(date: NaiveDate, format: OutputFormat) -> PathBuf {
    let ext = match format {
        OutputFormat::Json => "json",
        OutputFormat::Csv => "csv",
    };
    PathBuf::from(format!("forecast_{date}.{ext}"))
}

fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let config = Config::load(&args.config)?;
    let scenario = config.scenario()?;
    let defaults = &config.run;

    let timestep = pick(args.timestep, defaults.timestep.clone()).unwrap_or_else(|| "1h".to_string());
    let label = pick(args.weather_label, defaults.weather_label.clone())
        .map(|l| l.parse::<TimeLabel>())
        .transpose()?
        .unwrap_or(TimeLabel::End);
    let source = pick(args.weather_source, defaults.weather_source).unwrap_or_default();
    let mode = pick(args.weather_mode, defaults.weather_mode).unwrap_or_default();
    let cache_dir = pick(args.pvgis_cache_dir, defaults.pvgis_cache_dir.clone());
    let qc = args.qc_climatology || defaults.qc_climatology.unwrap_or(false);
    let suppress = args.actual_limit_suppress || defaults.actual_limit_suppress.unwrap_or(false);

    let output = args.output.unwrap_or_else(|| default_output(args.date, args.format));
    if !args.force
        && args.format == OutputFormat::Json
        && already_generated_today(&output, args.date, Local::now().date_naive())
    {
        tracing::info!(path = %output.display(), "forecast already generated today, use --force to overwrite");
        return Ok(());
    }

    let debug: Box<dyn DebugCollector> = match &args.debug {
        Some(path) => Box::new(
            JsonlWriter::create(path)
                .with_context(|| format!("cannot open debug file {}", path.display()))?,
        ),
        None if verbose => Box::new(TracingCollector),
        None => Box::new(NullCollector),
    };
    let debug = debug.as_ref();

    let provider = build_provider(source, mode, cache_dir.clone())?;
    let options = SimulationOptions {
        timestep: timestep.clone(),
        label,
        ..SimulationOptions::default()
    };
    tracing::info!(
        date = %args.date,
        provider = provider.name(),
        sites = scenario.sites().len(),
        arrays = scenario.array_count(),
        "simulating"
    );
    let mut result = simulate_day(&scenario, args.date, &options, provider.as_ref(), debug)
        .context("simulation failed")?;

    if let Some(actual) = pick(args.actual_kwh_today, defaults.actual_kwh_today) {
        result = adjust(&result, actual, pick(args.actual_as_of, defaults.actual_as_of.clone()), suppress, debug)?;
    }

    if qc {
        result = climatology_qc(&scenario, args.date, &result, cache_dir, label, debug)?;
    }

    let load_windows = match pick(args.base_load_w, defaults.base_load_w) {
        Some(base) => {
            let Some(min_duration) = pick(args.min_duration_min, defaults.min_duration_min) else {
                bail!("--min-duration-min is required with --base-load-w");
            };
            let params = LoadWindowParams::new(
                base,
                min_duration,
                pick(args.required_wh, defaults.required_wh),
            )?;
            Some(compute_load_windows(&result.timeseries, &params, debug))
        }
        None => None,
    };

    match args.format {
        OutputFormat::Json => {
            ForecastPayload::build(&result, args.date, &timestep, provider.name(), Utc::now(), load_windows)
                .write_json(&output)?
        }
        OutputFormat::Csv => write_daily_csv(&output, &result.daily)?,
    }
    if let Some(path) = &args.intervals {
        write_intervals(path, &interval_records(&result.timeseries))?;
    }

    for row in &result.daily {
        let clip = if row.qc_clipped { " (qc clipped)" } else { "" };
        println!(
            "{:<16} {:<16} {:>8.3} kWh  peak {:>7.3} kW{clip}",
            row.site, row.array, row.energy_kwh, row.peak_kw
        );
    }
    println!("Total: {:.3} kWh -> {}", result.total_energy_kwh(), output.display());
    Ok(())
}

fn adjust(
    result: &SimulationResult,
    actual_kwh: f64,
    as_of: Option<String>,
    suppress: bool,
    debug: &dyn DebugCollector,
) -> Result<SimulationResult> {
    let attempt = as_of
        .as_deref()
        .map(|text| parse_as_of(text, result))
        .transpose()
        .and_then(|now| Ok(apply_actual_adjustment(result, actual_kwh, now, debug)?));
    match attempt {
        Ok(adjusted) => {
            match &adjusted.outcome {
                AdjustOutcome::Applied { scale, future_samples, .. } => {
                    tracing::info!(scale, future_samples, "applied actual-energy adjustment")
                }
                AdjustOutcome::Skipped(reason) => {
                    tracing::info!(reason = reason.as_str(), "actual-energy adjustment skipped")
                }
            }
            Ok(adjusted.result)
        }
        Err(e) if suppress => {
            tracing::warn!(error = %e, "actual-energy adjustment failed, keeping forecast");
            debug.emit(DebugEvent::new("actual.adjust.error", json!({ "error": format!("{e:#}") })));
            Ok(result.clone())
        }
        Err(e) => Err(e.context("actual-energy adjustment failed")),
    }
}

fn climatology_qc(
    scenario: &Scenario,
    date: NaiveDate,
    result: &SimulationResult,
    cache_dir: Option<PathBuf>,
    label: TimeLabel,
    debug: &dyn DebugCollector,
) -> Result<SimulationResult> {
    let pvgis = PvgisTmyProvider::new(cache_dir)?;
    let options = SimulationOptions {
        timestep: "1h".to_string(),
        label: pvgis.default_label().unwrap_or(label),
        ..SimulationOptions::default()
    };
    let baseline = simulate_day(scenario, date, &options, &pvgis, debug)
        .context("climatology baseline failed")?;
    let report = attach_climatology(result, &baseline, debug);
    for warning in &report.warnings {
        eprintln!("QC: {warning}");
    }
    Ok(report.result)
}

// ─── publish-mqtt ────────────────────────────────────────────────────────────

fn mqtt_settings(args: &PublishArgs, config: &Config) -> MqttConfig {
    let mut mqtt = config.mqtt_or_default();
    if let Some(host) = &args.host {
        mqtt.host = host.clone();
    }
    if let Some(port) = args.port {
        mqtt.port = port;
    }
    if args.username.is_some() {
        mqtt.username = args.username.clone();
    }
    if args.password.is_some() {
        mqtt.password = args.password.clone();
    }
    if let Some(base) = &args.base_topic {
        mqtt.base_topic = base.clone();
    }
    if args.no_state {
        mqtt.publish_state = false;
    }
    if args.publish_topics {
        mqtt.publish_topics = true;
    }
    if args.no_discovery {
        mqtt.discovery = false;
    }
    mqtt
}

fn read_payload(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read results {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("cannot parse results {}", path.display()))
}

fn publish(args: PublishArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    let mqtt = mqtt_settings(&args, &config);
    let Some(input) = args.input.clone().or_else(|| mqtt.input.clone()) else {
        bail!("no results file: pass --input or set mqtt.input");
    };
    let payload = read_payload(&input)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let published = runtime.block_on(publish_forecast(&mqtt, &payload, args.force))?;
    if published {
        println!("Published {} to {}:{}", input.display(), mqtt.host, mqtt.port);
    } else {
        println!("Broker already holds this forecast; nothing published");
    }
    Ok(())
}
