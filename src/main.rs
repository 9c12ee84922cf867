use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;
use stservo::config::{DriverConfig, MotionConfig};
use stservo::control::{MotionController, MotionWorker, Outcome, StatusEvent};
use stservo::servo::protocol::stservo_def::*;
use stservo::servo::sts::Sts;

#[derive(Debug, Parser)]
#[command(name = "stservo", about = "Stall-aware STS bus servo client")]
struct Args {
    #[arg(
        long,
        value_name = "PORT",
        help = "Serial port path (e.g. COM6 or /dev/ttyUSB0). If omitted, auto-selects a detected port."
    )]
    port: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// Reply deadline per attempt.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Total attempts per request.
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    retries: u32,

    #[arg(long, default_value_t = DEFAULT_INTER_BYTE_DELAY.as_micros() as u64)]
    inter_byte_delay_us: u64,

    /// Bit of the present-load register that carries direction.
    #[arg(long, default_value_t = DEFAULT_LOAD_SIGN_BIT)]
    load_sign_bit: u8,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check whether one servo answers.
    Ping {
        #[arg(long, default_value_t = DEFAULT_ID)]
        id: u8,
    },

    /// Ping a range of ids and list the ones that answer.
    Scan {
        #[arg(long, default_value_t = 0)]
        first: u8,

        #[arg(long, default_value_t = 20)]
        last: u8,
    },

    /// Read position, speed and load from one servo.
    Read {
        #[arg(long, default_value_t = DEFAULT_ID)]
        id: u8,
    },

    /// Move with stall supervision: safe start first, stop and back off on overload.
    Move(MoveArgs),

    /// Run a headless virtual servo bus and print its PTY path.
    Vbus(VbusArgs),
}

#[derive(Debug, ClapArgs)]
struct MoveArgs {
    #[arg(long, default_value_t = DEFAULT_ID)]
    id: u8,

    #[arg(long, value_name = "0..4095")]
    position: u16,

    #[arg(long, default_value_t = 1000)]
    speed: u16,

    #[arg(long, default_value_t = 1024)]
    safe_start: u16,

    /// Load magnitude treated as overload.
    #[arg(long, default_value_t = 500)]
    threshold: u16,

    /// Consecutive overloaded ticks before the move counts as stalled.
    #[arg(long, default_value_t = 3)]
    confirm_ticks: u32,

    #[arg(long, default_value_t = 64)]
    backoff: u16,

    #[arg(long, default_value_t = 20)]
    tolerance: u16,

    #[arg(long, default_value_t = 50)]
    tick_ms: u64,
}

#[derive(Debug, ClapArgs)]
struct VbusArgs {
    #[arg(long, default_value_t = 1)]
    first: u8,

    #[arg(long, default_value_t = 1)]
    last: u8,

    /// Put a hard stop at this position on every simulated servo.
    #[arg(long)]
    obstruct: Option<u16>,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            port: self.port.clone(),
            baudrate: self.baud,
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
            inter_byte_delay: Duration::from_micros(self.inter_byte_delay_us),
            load_sign_bit: self.load_sign_bit,
        }
    }
}

impl MoveArgs {
    fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            servo_id: self.id,
            safe_start: self.safe_start,
            speed: self.speed,
            tolerance: self.tolerance,
            stall_threshold: self.threshold,
            stall_confirm_ticks: self.confirm_ticks,
            backoff_steps: self.backoff,
            tick: Duration::from_millis(self.tick_ms),
            ..MotionConfig::default()
        }
    }
}

fn run_ping(config: &DriverConfig, id: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut sts = Sts::open(config)?;
    if sts.ping(id) {
        println!("id={id} present");
    } else {
        println!("id={id} no reply");
    }
    Ok(())
}

fn run_scan(config: &DriverConfig, first: u8, last: u8) -> Result<(), Box<dyn std::error::Error>> {
    if first > last || last > MAX_ID {
        return Err(format!("scan range must satisfy first <= last <= {MAX_ID}").into());
    }

    let mut sts = Sts::open(config)?;
    // a missing id should not cost the full retry budget
    sts.session_mut().set_attempts(1);

    println!("Scanning ids {first}..={last}");
    let mut found = 0usize;
    for id in first..=last {
        if sts.ping(id) {
            found += 1;
            println!("id={id}");
        }
    }
    println!("Found {found} servo(s)");
    Ok(())
}

fn run_read(config: &DriverConfig, id: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut sts = Sts::open(config)?;
    let telemetry = sts.read_telemetry(id)?;
    let speed = sts.read_speed(id)?;
    println!(
        "id={id} position={} speed={speed} load={}",
        telemetry.position,
        telemetry.load.signed()
    );
    Ok(())
}

fn print_status(event: &StatusEvent) {
    let position = event.position.map_or("-".to_string(), |p| p.to_string());
    let load = event.load.map_or("-".to_string(), |l| l.signed().to_string());
    println!(
        "t={:>7.3}s id={} pos={:>4} load={:>5} [{}]",
        event.timestamp.as_secs_f64(),
        event.servo,
        position,
        load,
        event.phase
    );
}

fn run_move(config: &DriverConfig, args: &MoveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let motion = args.motion_config();
    let tick = motion.tick;
    let sts = Sts::open(config)?;
    let (worker, status) = MotionWorker::spawn(MotionController::new(sts, motion));

    worker.start(args.position)?;
    let result = loop {
        if let Some(result) = worker.wait_timeout(tick) {
            break result;
        }
        status.try_iter().for_each(|event| print_status(&event));
    };
    status.try_iter().for_each(|event| print_status(&event));

    match result? {
        Outcome::Reached { position } => println!("reached {position}"),
        Outcome::Stalled { position, load } => {
            println!("stalled at {position} (load {}), backed off", load.signed())
        }
        Outcome::TimedOut { position } => println!("gave up at {position} before reaching target"),
        Outcome::Cancelled => println!("cancelled"),
        Outcome::Faulted => println!("faulted"),
    }
    Ok(())
}

#[cfg(unix)]
fn run_vbus(config: &DriverConfig, args: &VbusArgs) -> Result<(), Box<dyn std::error::Error>> {
    use stservo::servo::sim::virtual_bus::{VirtualBus, VirtualBusConfig};

    let bus = VirtualBus::start(VirtualBusConfig {
        first_servo_id: args.first,
        last_servo_id: args.last,
        obstruction: args.obstruct,
        load_sign_bit: config.load_sign_bit,
        ..VirtualBusConfig::default()
    })?;
    println!("Virtual servo bus running.");
    println!("Slave device: {}", bus.slave_path());
    println!("Servo IDs: {}..={}", args.first, args.last);
    if let Some(position) = args.obstruct {
        println!("Obstruction at {position}");
    }
    println!("Press Ctrl-C to stop.");

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(not(unix))]
fn run_vbus(_config: &DriverConfig, _args: &VbusArgs) -> Result<(), Box<dyn std::error::Error>> {
    Err("vbus is only supported on Unix-like systems".into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    simple_logger::SimpleLogger::new()
        .with_level(args.log_level)
        .without_timestamps()
        .init()?;

    let config = args.driver_config();
    config.validate()?;

    match &args.command {
        Command::Ping { id } => run_ping(&config, *id),
        Command::Scan { first, last } => run_scan(&config, *first, *last),
        Command::Read { id } => run_read(&config, *id),
        Command::Move(move_args) => run_move(&config, move_args),
        Command::Vbus(vbus_args) => run_vbus(&config, vbus_args),
    }
}
