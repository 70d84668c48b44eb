mod config;
mod interface;
mod keyframe;
mod logger;
mod player;
mod ticks;
mod transport;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};
use robolink_protocol::OutputCommand;

use crate::config::JointTable;
use crate::interface::{ComplianceMode, Event, KeyframeCommand, LinkState, RobotInterface};
use crate::player::{KeyframePlayer, TimelineItem, MOTION_SAMPLE_RATE};
use crate::transport::SystemPorts;

/// robolink: motion sequence tooling for the tendon-driven arm.
#[derive(Parser, Debug)]
#[command(name = "robolink", version)]
struct Cli {
    /// Joint configuration file.
    #[arg(short, long, default_value = "joints.toml")]
    config: PathBuf,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Validate the joint configuration and print the table.
    Check,
    /// Parse a sequence file and print its normalised form.
    Show { sequence: PathBuf },
    /// Connect, initialise and stream live joint positions.
    Monitor {
        /// Stop after this many seconds (0 = run until interrupted).
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },
    /// Play a sequence on the arm.
    Play {
        sequence: PathBuf,
        /// Repeat until interrupted.
        #[arg(long)]
        looped: bool,
        /// Drive the trajectory from this host instead of the on-arm
        /// sequencer.
        #[arg(long)]
        local: bool,
        /// Playback speed limit in percent.
        #[arg(long, default_value_t = 100)]
        speed: u32,
    },
    /// Commit a sequence to the arm's non-volatile memory for autonomous
    /// playback.
    Upload { sequence: PathBuf },
    /// Switch hardware compliance on or off.
    Compliance {
        #[arg(value_enum)]
        mode: ComplianceArg,
    },
    /// Reset the microcontroller into its bootloader.
    ResetDevice,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ComplianceArg {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logger::init(level).context("logger setup failed")?;

    let table = config::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.cmd {
        Cmd::Check => check(&table),
        Cmd::Show { sequence } => show(&sequence),
        Cmd::Monitor { seconds } => monitor(&table, seconds),
        Cmd::Play {
            sequence,
            looped,
            local,
            speed,
        } => play(&table, &sequence, looped, local, speed),
        Cmd::Upload { sequence } => upload(&table, &sequence),
        Cmd::Compliance { mode } => compliance(&table, mode),
        Cmd::ResetDevice => reset_device(&table),
    }
}

fn check(table: &JointTable) -> Result<()> {
    println!("lookahead: {} ms", table.lookahead_ms);
    for joint in table.joints() {
        println!(
            "#{} {:12} [{:+.3}, {:+.3}] rad  offset {:+.3}  invert {}",
            joint.address, joint.name, joint.lower_limit, joint.upper_limit, joint.offset,
            joint.invert,
        );
    }
    Ok(())
}

fn show(path: &PathBuf) -> Result<()> {
    let frames = keyframe::load_sequence(path)?;
    print!("{}", keyframe::sequence_to_string(&frames));
    Ok(())
}

// ---------------------------------------------------------------------------
// Transport thread plumbing. The interface lives on its own thread and owns
// the serial handle exclusively; everything else talks to it through queued
// messages.
// ---------------------------------------------------------------------------

enum CtlMsg {
    MotionIn {
        angles: BTreeMap<String, f64>,
        velocities: BTreeMap<String, f64>,
    },
    Initialize,
    SetCompliance(ComplianceMode),
    Transfer(Vec<TimelineItem>, KeyframeCommand),
    StopPlaying,
    ResetDevice,
    Shutdown,
}

struct RobotHandle {
    cmds: mpsc::Sender<CtlMsg>,
    events: mpsc::Receiver<(LinkState, Event)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RobotHandle {
    fn spawn(table: &JointTable) -> RobotHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<CtlMsg>();
        let (event_tx, event_rx) = mpsc::channel();
        let table = table.clone();

        let thread = thread::spawn(move || {
            let mut iface = RobotInterface::new(&table, SystemPorts);
            loop {
                let mut shutdown = false;
                while let Ok(msg) = cmd_rx.try_recv() {
                    match msg {
                        CtlMsg::MotionIn { angles, velocities } => {
                            iface.motion_in(&angles, &velocities, OutputCommand::Nop)
                        }
                        CtlMsg::Initialize => iface.initialize_robot(),
                        CtlMsg::SetCompliance(mode) => iface.set_compliance(mode),
                        CtlMsg::Transfer(timeline, command) => {
                            iface.transfer_keyframes(&timeline, command)
                        }
                        CtlMsg::StopPlaying => iface.stop_playing(),
                        CtlMsg::ResetDevice => {
                            iface.reset_device();
                        }
                        CtlMsg::Shutdown => shutdown = true,
                    }
                }
                if shutdown {
                    break;
                }

                iface.step();
                let state = iface.state();
                for event in iface.take_events() {
                    if event_tx.send((state, event)).is_err() {
                        return;
                    }
                }

                // The ladder idles quickly when the port is closed; avoid a
                // hot spin while searching for hardware.
                if !matches!(state, LinkState::ExtendedMode | LinkState::Playing) {
                    thread::sleep(Duration::from_millis(5));
                }
            }
        });

        RobotHandle {
            cmds: cmd_tx,
            events: event_rx,
            thread: Some(thread),
        }
    }

    fn send(&self, msg: CtlMsg) {
        let _ = self.cmds.send(msg);
    }

    /// Wait until `predicate` accepts an event, surfacing messages along
    /// the way.
    fn wait_for(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&LinkState, &Event) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for the robot"))?;
            match self.events.recv_timeout(remaining) {
                Ok((state, event)) => {
                    if let Event::Message(m) = &event {
                        info!("{}", m);
                    }
                    if predicate(&state, &event) {
                        return Ok(());
                    }
                }
                Err(_) => bail!("timed out waiting for the robot"),
            }
        }
    }
}

impl Drop for RobotHandle {
    fn drop(&mut self) {
        self.send(CtlMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bring the link all the way to extended mode. An arm that kept its
/// initialisation comes up by itself; otherwise the zero find is requested
/// after a short grace period.
fn connect(handle: &RobotHandle) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut connected_at: Option<Instant> = None;
    let mut initialize_sent = false;

    loop {
        if Instant::now() >= deadline {
            bail!("timed out connecting to the robot");
        }

        if let Some(at) = connected_at {
            if !initialize_sent && at.elapsed() > Duration::from_secs(2) {
                initialize_sent = true;
                handle.send(CtlMsg::Initialize);
            }
        }

        match handle.events.recv_timeout(Duration::from_millis(200)) {
            Ok((state, event)) => {
                if let Event::Message(m) = &event {
                    info!("{}", m);
                }
                match event {
                    Event::Connected => connected_at = Some(Instant::now()),
                    Event::Initialized => initialize_sent = true,
                    _ => {}
                }
                if state == LinkState::ExtendedMode {
                    return Ok(());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(_) => bail!("robot thread terminated"),
        }
    }
}

fn monitor(table: &JointTable, seconds: u64) -> Result<()> {
    let handle = RobotHandle::spawn(table);
    connect(&handle)?;

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let mut last_print = Instant::now() - Duration::from_secs(1);

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(());
        }
        match handle.events.recv_timeout(Duration::from_secs(5)) {
            Ok((_, Event::MotionOut { angles, .. })) => {
                // Positions arrive with every cycle; print at a humane rate.
                if last_print.elapsed() >= Duration::from_millis(500) {
                    last_print = Instant::now();
                    let line: Vec<String> = angles
                        .iter()
                        .map(|(name, angle)| format!("{}:{:+.3}", name, angle))
                        .collect();
                    println!("{}", line.join("  "));
                }
            }
            Ok((_, Event::Message(m))) => info!("{}", m),
            Ok(_) => {}
            Err(_) => bail!("no feedback from the robot"),
        }
    }
}

fn play(table: &JointTable, path: &PathBuf, looped: bool, local: bool, speed: u32) -> Result<()> {
    let frames = keyframe::load_sequence(path)?;
    if frames.len() < 2 {
        bail!("a playable sequence needs at least two keyframes");
    }

    let handle = RobotHandle::spawn(table);
    connect(&handle)?;

    if local {
        play_local(&handle, &frames, looped, speed)
    } else {
        play_remote(&handle, &frames, looped, speed)
    }
}

fn play_remote(
    handle: &RobotHandle,
    frames: &[keyframe::Keyframe],
    looped: bool,
    speed: u32,
) -> Result<()> {
    let speed_limit = 0.01 * speed as f64 * player::SERVO_SPEED_MAX;
    let timeline = player::build_timeline(frames, looped, speed_limit);

    let command = if looped {
        KeyframeCommand::Loop
    } else {
        KeyframeCommand::Play
    };
    handle.send(CtlMsg::Transfer(timeline, command));

    let mut started = false;
    handle.wait_for(CONNECT_TIMEOUT, |_, event| match event {
        Event::TransferFinished(false) => true,
        Event::PlaybackStarted => {
            started = true;
            true
        }
        _ => false,
    })?;
    if !started {
        bail!("keyframe transfer failed");
    }

    info!("playback running on the arm");
    handle.wait_for(Duration::from_secs(24 * 3600), |_, event| {
        matches!(event, Event::PlaybackFinished | Event::Disconnected)
    })
}

/// Host-side real-time playback: the 50 Hz player streams interpolated
/// targets while device feedback flows back into the velocity adaption.
fn play_local(handle: &RobotHandle, frames: &[keyframe::Keyframe], looped: bool, speed: u32) -> Result<()> {
    let mut player = KeyframePlayer::new();
    player.set_speed_limit(speed);
    player.set_looped(looped);
    player.set_interpolating(true);
    if !player.play_frames(frames) {
        bail!("sequence is not playable");
    }

    let tick = Duration::from_secs_f64(1.0 / MOTION_SAMPLE_RATE);
    let mut last = Instant::now();

    while player.is_playing() {
        thread::sleep(tick);
        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f64();
        last = now;

        // Fold in any feedback that arrived since the last tick.
        while let Ok((_, event)) = handle.events.try_recv() {
            match event {
                Event::MotionOut { angles, .. } => player.joint_angles_in(&angles),
                Event::Message(m) => info!("{}", m),
                Event::Disconnected => bail!("link lost during playback"),
                _ => {}
            }
        }

        if let Some(sample) = player.step(dt) {
            handle.send(CtlMsg::MotionIn {
                angles: sample.angles,
                velocities: sample.velocities,
            });
            if sample.finished {
                info!("playback finished");
                break;
            }
        }
    }

    Ok(())
}

fn upload(table: &JointTable, path: &PathBuf) -> Result<()> {
    let frames = keyframe::load_sequence(path)?;
    if frames.len() < 2 {
        bail!("a sequence needs at least two keyframes");
    }

    let handle = RobotHandle::spawn(table);
    connect(&handle)?;

    let timeline = player::build_timeline(&frames, false, player::SERVO_SPEED_MAX);
    handle.send(CtlMsg::Transfer(timeline, KeyframeCommand::Commit));

    let mut ok = false;
    handle.wait_for(CONNECT_TIMEOUT, |_, event| match event {
        Event::TransferFinished(success) => {
            ok = *success;
            true
        }
        _ => false,
    })?;

    if !ok {
        bail!("keyframe transfer failed");
    }
    info!("sequence committed to the arm");
    Ok(())
}

fn compliance(table: &JointTable, mode: ComplianceArg) -> Result<()> {
    let handle = RobotHandle::spawn(table);
    connect(&handle)?;

    let target = match mode {
        ComplianceArg::On => ComplianceMode::HardwareCompliant,
        ComplianceArg::Off => ComplianceMode::Stiff,
    };
    handle.send(CtlMsg::SetCompliance(target));

    handle.wait_for(Duration::from_secs(10), |_, event| {
        matches!(event, Event::ComplianceChanged(_))
    })
}

fn reset_device(table: &JointTable) -> Result<()> {
    let handle = RobotHandle::spawn(table);
    connect(&handle)?;
    handle.send(CtlMsg::ResetDevice);

    handle.wait_for(Duration::from_secs(10), |_, event| {
        matches!(event, Event::Message(m) if m.contains("bootloader") || m.contains("not up"))
    })
}
