//! CLI command implementations.

use crate::{create_progress_bar, Cli};
use anyhow::{Context, Result};
use colored::Colorize;
use logicbench_core::capture::detect::{DetectedDevice, DeviceKind};
use logicbench_core::capture::native::{NativeDriver, NativeTarget};
use logicbench_core::capture::{
    CaptureChannel, CaptureSession, ConnectParams, ConnectTarget, DataFormat, Driver, DriverManager, DriverRegistration,
    TriggerType,
};
use logicbench_core::decode::DecoderManager;
use logicbench_core::WorkbenchConfig;
use std::collections::HashMap;
use std::path::PathBuf;

/// Scan for raw detected devices, with no driver matching.
pub async fn scan(cli: &Cli) -> Result<()> {
    let manager = DriverManager::new();
    if !cli.quiet {
        println!("{}", "Scanning for logic analyzer devices...".yellow());
    }
    let devices = manager.detect_hardware(false).await;
    render_devices(cli, &devices, None)
}

/// Detect devices and show which registered driver would handle each.
pub async fn detect(cli: &Cli) -> Result<()> {
    let manager = DriverManager::new();
    if !cli.quiet {
        println!("{}", "Detecting logic analyzer devices...".yellow());
    }
    let devices = manager.detect_hardware(true).await;
    render_devices(cli, &devices, Some(&manager))
}

fn render_devices(cli: &Cli, devices: &[DetectedDevice], manager: Option<&DriverManager>) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Row {
        id: String,
        name: String,
        kind: String,
        confidence: u8,
        driver: Option<String>,
    }
    let rows: Vec<Row> = devices
        .iter()
        .map(|d| Row {
            id: d.id.clone(),
            name: d.name.clone(),
            kind: format!("{:?}", d.kind),
            confidence: d.confidence,
            driver: manager.and_then(|m| m.match_driver(d)).map(|r| r.id.clone()),
        })
        .collect();

    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            println!("\n{} ({} found)", "Devices:".green().bold(), rows.len());
            for row in &rows {
                let driver_label = row.driver.as_deref().unwrap_or("-");
                println!(
                    "  {} {} ({}) confidence={} driver={}",
                    "●".green(),
                    row.name.cyan(),
                    row.kind,
                    row.confidence,
                    driver_label.yellow()
                );
            }
        }
    }
    Ok(())
}

fn guess_kind(connection: &str) -> DeviceKind {
    if connection.contains(':') && !connection.starts_with('/') && !connection.starts_with("COM") {
        DeviceKind::Network
    } else {
        DeviceKind::Serial
    }
}

/// Resolve `cli.port` (or autodetect) to a `ConnectTarget` and drive the
/// manager's `connect_to_device`, then borrow the resulting driver back out
/// of the manager's "current device" slot for this command to use.
async fn connect_driver(cli: &Cli, manager: &DriverManager) -> Result<Box<dyn Driver>> {
    let target = match &cli.port {
        Some(port) if guess_kind(port) == DeviceKind::Network => ConnectTarget::Network(port.clone()),
        Some(port) => ConnectTarget::Direct(DetectedDevice {
            id: port.clone(),
            name: port.clone(),
            kind: guess_kind(port),
            connection_string: port.clone(),
            driver_type: "native".to_string(),
            confidence: 100,
            capabilities: None,
        }),
        None => ConnectTarget::AutoDetect,
    };
    manager
        .connect_to_device(target, ConnectParams::default())
        .await
        .with_context(|| "failed to connect")?;
    manager
        .take_current_driver()
        .await
        .ok_or_else(|| anyhow::anyhow!("connected but the manager's current-device slot was empty"))
}

/// Connect to a device, print what it reports about itself, and
/// disconnect. There is no resident daemon process, so a `connect`
/// invocation cannot hand a live session to a later `capture` invocation;
/// `capture` connects (or reuses `--port`) itself.
pub async fn connect(cli: &Cli) -> Result<()> {
    let manager = DriverManager::new();
    let mut driver = connect_driver(cli, &manager).await?;
    let info = driver.device_info().cloned();
    driver.disconnect().await?;

    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&info)?),
        _ => {
            println!("\n{}", "Connected:".green().bold());
            match info {
                Some(info) => {
                    println!("  Name:      {}", info.name.cyan());
                    println!("  Version:   {}", info.version);
                    println!("  Max freq:  {} Hz", info.max_frequency);
                    println!("  Buffer:    {} samples", info.buffer_size);
                    println!("  Channels:  {}", info.channel_count);
                }
                None => println!("  (device did not report info)"),
            }
        }
    }
    Ok(())
}

/// Run a capture against the current (or `--port`) device and write the
/// filled session to `output` as JSON.
pub async fn capture(cli: &Cli, output: &PathBuf, frequency: u32, pre: u32, post: u32, channels: u8) -> Result<()> {
    let manager = DriverManager::new();
    let mut driver = connect_driver(cli, &manager).await?;
    let buffer_size = driver.device_info().map(|i| i.buffer_size).unwrap_or(1_000_000);

    let session = CaptureSession {
        frequency,
        pre_trigger_samples: pre,
        post_trigger_samples: post,
        trigger_type: TriggerType::Edge,
        trigger_channel: 0,
        trigger_inverted: false,
        trigger_pattern: 0,
        trigger_bit_count: 0,
        loop_count: 0,
        measure_bursts: false,
        data_format: DataFormat::Binary,
        channels: (0..channels).map(|c| CaptureChannel::new(c, format!("CH{c}"))).collect(),
    };
    session.validate(buffer_size).context("invalid capture parameters")?;

    if !cli.quiet {
        println!(
            "{} {} samples @ {} Hz on {} channels",
            "Capturing".green(),
            session.total_samples(),
            frequency,
            channels
        );
    }
    let pb = if !cli.quiet { Some(create_progress_bar(session.total_samples() as u64, "Capturing...")) } else { None };

    let (tx, rx) = tokio::sync::oneshot::channel();
    driver.start_capture(session, tx).await?;
    let completion = rx.await.context("capture task ended without delivering a result")?;

    if let Some(pb) = &pb {
        pb.finish_with_message("done");
    }
    driver.disconnect().await.ok();

    if !completion.success {
        anyhow::bail!("capture reported failure");
    }

    let json = serde_json::to_string_pretty(&completion.session)?;
    std::fs::write(output, json)?;

    if !cli.quiet {
        println!(
            "\n{} {} samples across {} channels -> {}",
            "Captured".green().bold(),
            completion.session.total_samples(),
            completion.session.channels.len(),
            output.display().to_string().cyan()
        );
    }
    Ok(())
}

/// Decode a previously captured session file.
pub fn decode(
    cli: &Cli,
    input: &PathBuf,
    decoder: &str,
    mapping: &[(String, usize)],
    options: &[(String, String)],
    streaming: bool,
    chunk_size: Option<usize>,
) -> Result<()> {
    let text = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let session: CaptureSession = serde_json::from_slice(&text).context("capture file is not a valid session")?;

    let mut channel_data: HashMap<String, &[u8]> = HashMap::new();
    for (name, index) in mapping {
        let channel = session
            .channels
            .get(*index)
            .ok_or_else(|| anyhow::anyhow!("no captured channel at index {index}"))?;
        channel_data.insert(name.clone(), channel.samples.as_slice());
    }

    let mut options_obj = serde_json::Map::new();
    for (key, value) in options {
        options_obj.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    let options_value = serde_json::Value::Object(options_obj);

    let manager = DecoderManager::new();
    let result = if streaming {
        let chunk = chunk_size.unwrap_or(logicbench_core::decode::DEFAULT_CHUNK_SAMPLES);
        manager.execute_streaming_decoder(
            decoder,
            session.frequency,
            &channel_data,
            &options_value,
            chunk,
            |done, total| {
                if !cli.quiet {
                    eprint!("\r{} {done}/{total} samples", "decoding".dimmed());
                }
                true
            },
            |_partial| {},
        )?
    } else {
        manager.execute_decoder(decoder, session.frequency, &channel_data, &options_value)?
    };
    if !cli.quiet && streaming {
        eprintln!();
    }

    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&result.annotations)?),
        _ => {
            println!("\n{}", "Decoded annotations:".green().bold());
            for a in &result.annotations {
                println!(
                    "  [{:>8}..{:<8}] type={} {}",
                    a.start_sample,
                    a.end_sample,
                    a.annotation_type_index,
                    a.values.join(",")
                );
            }
            println!(
                "\n{} samples in {:.3} ms ({:.0} samples/s)",
                result.samples_processed,
                result.duration.as_secs_f64() * 1000.0,
                result.throughput_samples_per_sec
            );
        }
    }
    Ok(())
}

/// List registered driver kinds.
pub fn devices_list(cli: &Cli) -> Result<()> {
    let manager = DriverManager::new();
    let regs = manager.registered_drivers();

    match cli.format.as_str() {
        "json" => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                id: &'a str,
                name: &'a str,
                priority: u8,
                tags: &'a [String],
            }
            let rows: Vec<Row> =
                regs.iter().map(|r| Row { id: &r.id, name: &r.name, priority: r.priority, tags: &r.supported_device_tags }).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            println!("\n{}", "Registered drivers:".green().bold());
            for r in regs {
                println!(
                    "  {} {} (priority {}) tags=[{}]",
                    r.id.cyan(),
                    r.name,
                    r.priority,
                    r.supported_device_tags.join(", ").dimmed()
                );
            }
        }
    }
    Ok(())
}

/// Register a driver alias. The registration lives only for this
/// process's lifetime -- there is no resident daemon to persist it into --
/// so this mainly exercises the matcher against a custom device tag.
pub fn devices_register(cli: &Cli, id: &str, name: &str, tags: &[String], priority: u8) -> Result<()> {
    let mut manager = DriverManager::new();
    manager.register(DriverRegistration {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("user-registered alias for {name}"),
        version: "0.1.0".to_string(),
        supported_device_tags: tags.to_vec(),
        priority,
        factory: std::sync::Arc::new(|conn| {
            Ok(Box::new(NativeDriver::new(NativeTarget::Serial(conn.to_string()))) as Box<dyn Driver>)
        }),
    });

    if !cli.quiet {
        println!(
            "{} {} ({}) registered with tags [{}] at priority {}",
            "Registered:".green().bold(),
            name.cyan(),
            id,
            tags.join(", "),
            priority
        );
        println!("{}", "Note: driver registrations do not persist across logicctl invocations.".dimmed());
    }
    Ok(())
}

pub fn config_show(cli: &Cli) -> Result<()> {
    let cfg = WorkbenchConfig::load()?;
    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&cfg)?),
        _ => {
            println!("\n{}", "Current configuration:".green().bold());
            println!("  default_serial_port:      {}", cfg.default_serial_port.as_deref().unwrap_or("auto"));
            println!("  default_baud_rate:        {}", cfg.default_baud_rate);
            println!("  default_network_host:     {}", cfg.default_network_host);
            println!("  default_network_port:     {}", cfg.default_network_port);
            println!("  detection_cache_ttl_secs: {}", cfg.detection_cache_ttl_secs);
            println!("  decoder_chunk_samples:    {}", cfg.decoder_chunk_samples);
            println!("  auto_connect_retries:     {}", cfg.auto_connect_retries);
        }
    }
    Ok(())
}

pub fn config_set(cli: &Cli, key: &str, value: &str) -> Result<()> {
    let mut cfg = WorkbenchConfig::load()?;
    cfg.set_field(key, value)?;
    cfg.save()?;
    if !cli.quiet {
        println!("Set {} = {}", key.cyan(), value.yellow());
    }
    Ok(())
}

pub fn config_reset(cli: &Cli) -> Result<()> {
    WorkbenchConfig::default().save()?;
    if !cli.quiet {
        println!("{}", "Configuration reset to defaults.".green());
    }
    Ok(())
}
