//! loopgraph - a looping audio/MIDI graph host
//!
//! Opens the default audio output and an optional MIDI input, loads a
//! project (or builds a default looping graph) and reads loop commands from
//! the console.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use loopgraph::control::ControlTarget;
use loopgraph::engine::{audio_engine, AudioEngine, EngineEvent, MidiEngine, NodeId};
use loopgraph::modules::LoopTrigger;
use loopgraph::{EngineConfig, Session};

/// Interval of the control-thread update pass.
const UPDATE_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "loopgraph")]
#[command(about = "Real-time audio/MIDI looping graph")]
#[command(version)]
struct Args {
    /// Project file to load (JSON)
    project: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MIDI input port to open (substring of the port name)
    #[arg(long)]
    midi_port: Option<String>,

    /// List audio and MIDI devices, then exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(port) = &args.midi_port {
        config.midi.port = Some(port.clone());
    }

    let mut session = Session::new(config.clone());

    if args.list_devices {
        list_devices(&session, &config)?;
        return Ok(());
    }

    match &args.project {
        Some(path) => session
            .load_project(path)
            .with_context(|| format!("loading project {}", path.display()))?,
        None => build_default_graph(&mut session)?,
    }

    let mut audio = AudioEngine::new()?;
    let device_rate = f64::from(audio.sample_rate());
    if device_rate != config.sample_rate {
        tracing::info!(configured = config.sample_rate, device = device_rate, "using device sample rate");
    }
    session.prepare(device_rate, config.block_size)?;
    let processor = session
        .take_audio_processor()
        .context("audio processor already taken")?;
    audio.start(processor)?;

    let _midi = match open_midi(&session, &config) {
        Ok(midi) => Some(midi),
        Err(e) => {
            tracing::warn!(error = %e, "running without MIDI input");
            None
        }
    };

    run_console(&mut session)?;

    session.shutdown();
    audio.stop()?;
    Ok(())
}

fn list_devices(session: &Session, config: &EngineConfig) -> Result<()> {
    println!("Audio outputs:");
    for device in audio_engine::list_output_devices() {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}: {}{}", device.index, device.name, marker);
    }

    let midi = MidiEngine::new(&config.midi.client_name, session.dispatcher().clone())?;
    println!("MIDI inputs:");
    for device in midi.enumerate_devices() {
        println!("  {}: {}", device.index, device.name);
    }
    Ok(())
}

fn open_midi(session: &Session, config: &EngineConfig) -> Result<MidiEngine> {
    let mut midi = MidiEngine::new(&config.midi.client_name, session.dispatcher().clone())?;
    if let Some(port) = &config.midi.port {
        midi.connect_by_name(port)?;
    }
    Ok(midi)
}

/// Audio in -> audio loop -> audio out, MIDI in -> MIDI loop -> MIDI out,
/// with the audio loop as master.
fn build_default_graph(session: &mut Session) -> Result<()> {
    let channels = session.config().num_channels;
    let audio_in = session.create_node("io.audio_in")?;
    let audio_loop = session.create_node("loop.audio")?;
    let audio_out = session.create_node("io.audio_out")?;
    let midi_in = session.create_node("io.midi_in")?;
    let midi_loop = session.create_node("loop.midi")?;
    let midi_out = session.create_node("io.midi_out")?;

    let graph = session.graph_mut();
    for channel in 0..channels {
        graph.connect(audio_in, channel, audio_loop, channel)?;
        graph.connect(audio_loop, channel, audio_out, channel)?;
    }
    graph.connect_midi(midi_in, midi_loop)?;
    graph.connect_midi(midi_loop, midi_out)?;

    session.set_master(Some(audio_loop))?;
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  list                       show nodes and loop states");
    println!("  <node> <trigger>           record|stop|overdub|play|pause|clear");
    println!("  all <trigger>              trigger every loop");
    println!("  master <node>|none         set the master loop");
    println!("  learn <node> <param>       bind the next MIDI CC to a parameter");
    println!("  unlearn <node> <param>     remove the controls bound to a parameter");
    println!("  set <node> <param> <value> set a parameter (0..1)");
    println!("  play | stop                start or stop rendering");
    println!("  save <path>                save the project");
    println!("  quit");
}

fn print_nodes(session: &Session) {
    let graph = session.graph();
    let master = session.loops().master_id();
    for id in graph.render_order() {
        let type_id = graph.node_type(*id).unwrap_or("?");
        match session.loops().get(*id) {
            Some(shared) => println!(
                "  {id:>3}  {type_id:<14} {:<11} {:>8.2}s  key {}{}",
                shared.state().name(),
                shared.length_seconds(),
                shared.key(),
                if master == Some(*id) { "  [master]" } else { "" }
            ),
            None => println!("  {id:>3}  {type_id}"),
        }
    }
}

fn handle_command(session: &mut Session, line: &str) -> Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit" | "exit" | "q"] => return Ok(false),
        ["help" | "?"] => print_help(),
        ["list" | "ls"] => print_nodes(session),
        ["play"] => session.graph_mut().set_playing(true)?,
        ["stop"] => session.graph_mut().set_playing(false)?,
        ["master", "none"] => session.set_master(None)?,
        ["master", id] => session.set_master(Some(id.parse()?))?,
        ["learn", node, parameter] => {
            let target = ControlTarget {
                node: node.parse()?,
                parameter: parameter.parse()?,
            };
            session.surface().learn(target);
            println!("move a controller to bind it");
        }
        ["unlearn", node, parameter] => {
            let target = ControlTarget {
                node: node.parse()?,
                parameter: parameter.parse()?,
            };
            println!("removed {} binding(s)", session.unbind(target));
        }
        ["set", node, parameter, value] => {
            session.set_parameter(node.parse()?, parameter.parse()?, value.parse()?)?
        }
        ["all", trigger] => {
            let trigger: LoopTrigger = trigger.parse().map_err(anyhow::Error::msg)?;
            session.trigger_all_loops(trigger);
        }
        ["save", path] => session.save_project(PathBuf::from(path).as_path(), "loopgraph")?,
        [id, trigger] => {
            let node: NodeId = id.parse().context("expected a node id")?;
            let trigger: LoopTrigger = trigger.parse().map_err(anyhow::Error::msg)?;
            session.trigger_loop(node, trigger)?;
        }
        _ => bail!("unknown command '{line}' (try 'help')"),
    }
    Ok(true)
}

fn run_console(session: &mut Session) -> Result<()> {
    let (tx, rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    print_help();
    loop {
        match rx.recv_timeout(UPDATE_INTERVAL) {
            Ok(line) => match handle_command(session, line.trim()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("error: {e:#}"),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        for event in session.update() {
            match event {
                EngineEvent::CpuLoad(load) => tracing::trace!(load, "cpu"),
                EngineEvent::Started => tracing::info!("rendering started"),
                EngineEvent::Stopped => tracing::info!("rendering stopped"),
                _ => {}
            }
        }
    }
    Ok(())
}
