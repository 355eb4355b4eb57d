/// Engine tuning shared by the commands that talk to the bus.
#[derive(clap::Parser, Clone)]
#[group(id = "commands::EngineArgs")]
pub struct EngineArgs {
    /// The CAN interface the heat pump hangs off of.
    #[arg(long, short = 'i', default_value = "can0")]
    pub interface: String,

    /// Poll interval for registers that do not declare their own.
    #[arg(long, default_value = "30s")]
    pub poll_interval: humantime::Duration,

    /// Minimum quiet time between two requests on the bus.
    ///
    /// The device shares its half-duplex bus with other participants; asking too quickly makes
    /// it drop requests.
    #[arg(long, default_value = "250ms")]
    pub delay_between_requests: humantime::Duration,

    /// Consider a request failed when no reply correlates within this time.
    #[arg(long, default_value = "1s")]
    pub request_timeout: humantime::Duration,

    /// Calibration offset added to the TV sensor.
    #[arg(long, default_value_t = 0.0)]
    pub tv_offset: f64,

    /// Calibration offset added to the TVBH sensor.
    #[arg(long, default_value_t = 0.0)]
    pub tvbh_offset: f64,

    /// Calibration offset added to the TR sensor.
    #[arg(long, default_value_t = 0.0)]
    pub tr_offset: f64,

    /// Largest believable TV/TVBH spread; larger deltas are published as invalid.
    #[arg(long, default_value_t = 0.3)]
    pub max_spread_tvbh_tv: f64,

    /// Largest believable TVBH/TR spread; larger deltas are published as invalid.
    #[arg(long, default_value_t = 0.3)]
    pub max_spread_tvbh_tr: f64,
}

impl EngineArgs {
    pub fn to_config(&self) -> crate::engine::Config {
        crate::engine::Config {
            default_poll_interval: *self.poll_interval,
            delay_between_requests: *self.delay_between_requests,
            request_timeout: *self.request_timeout,
            tv_offset: self.tv_offset,
            tvbh_offset: self.tvbh_offset,
            tr_offset: self.tr_offset,
            max_spread_tvbh_tv: self.max_spread_tvbh_tv,
            max_spread_tvbh_tr: self.max_spread_tvbh_tr,
        }
    }
}

fn command_hex(command: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut text = String::with_capacity(command.len() * 3);
    for byte in command {
        if !text.is_empty() {
            text.push(' ');
        }
        let _ = write!(text, "{byte:02X}");
    }
    text
}

pub mod registers {
    use crate::output;
    use crate::registers::{Catalog, ConfigError};

    /// Search and output the known heat pump registers.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show registers whose id or labels contain this.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in register catalog is unusable")]
        Config(#[source] ConfigError),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub id: &'static str,
        pub access: String,
        pub kind: String,
        pub channel: u16,
        pub command: String,
        pub poll_seconds: Option<u64>,
        pub min: Option<f64>,
        pub max: Option<f64>,
        pub step: Option<f64>,
        pub labels: Vec<&'static str>,
        pub updates: Vec<&'static str>,
    }

    impl RegisterSchema {
        fn matches(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.id.contains(&pattern)
                || self.command.to_lowercase().contains(&pattern)
                || self.labels.iter().any(|l| l.contains(&pattern))
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::new().map_err(Error::Config)?;
        let mut out = args.output.to_output()?;
        out.headers(vec![
            "Id", "Mode", "Type", "Channel", "Command", "Poll", "Min", "Max", "Step", "Labels",
        ])?;
        for (_, desc) in catalog.iter() {
            let schema = RegisterSchema {
                id: desc.id,
                access: desc.access.to_string(),
                kind: desc.kind.to_string(),
                channel: desc.channel,
                command: super::command_hex(desc.command),
                poll_seconds: desc.poll.map(|p| p.as_secs()),
                min: desc.bounds.map(|b| b.min),
                max: desc.bounds.map(|b| b.max),
                step: desc.bounds.map(|b| b.step),
                labels: desc.map.into_iter().flatten().map(|(_, l)| *l).collect(),
                updates: desc.updates.iter().map(|u| u.id()).collect(),
            };
            if let Some(pattern) = &args.filter {
                if !schema.matches(pattern) {
                    continue;
                }
            }
            out.record(
                || {
                    vec![
                        schema.id.to_string(),
                        schema.access.clone(),
                        schema.kind.clone(),
                        format!("{:#05x}", schema.channel),
                        schema.command.clone(),
                        schema.poll_seconds.map(|p| format!("{p}s")).unwrap_or_default(),
                        schema.min.map(|v| v.to_string()).unwrap_or_default(),
                        schema.max.map(|v| v.to_string()).unwrap_or_default(),
                        schema.step.map(|v| v.to_string()).unwrap_or_default(),
                        schema.labels.join("|"),
                    ]
                },
                || &schema,
            )?;
        }
        out.commit()?;
        Ok(())
    }
}

pub mod monitor {
    use std::time::Instant;

    use crate::bus::{self, BusError, SocketCanBus};
    use crate::engine::Engine;
    use crate::labels::{Language, PlainLabels};
    use crate::output;
    use crate::registers::{Catalog, ConfigError, ValueState};
    use tracing::warn;

    /// Run the register accessor against the bus and stream published value changes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        engine: super::EngineArgs,
        /// Language for label display text.
        #[arg(long, value_enum, default_value_t = Language::En)]
        language: Language,
        /// Stop polling after this long, print a snapshot of every entity, and exit.
        #[arg(long)]
        dump_after: Option<humantime::Duration>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in register catalog is unusable")]
        Config(#[source] ConfigError),
        #[error("could not bind the CAN transmitter")]
        Bus(#[source] BusError),
        #[error("could not open `{1}` for CAN reception")]
        OpenReceive(#[source] std::io::Error, String),
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error("could not build the async runtime")]
        Runtime(#[source] std::io::Error),
    }

    #[derive(serde::Serialize)]
    struct UpdateRecord<'a> {
        at: &'a str,
        id: &'a str,
        value: &'a ValueState,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(run_inner(args))
    }

    async fn run_inner(args: Args) -> Result<(), Error> {
        let config = args.engine.to_config();
        let request_timeout = config.request_timeout;
        let mut engine = Engine::new(Catalog::new().map_err(Error::Config)?, config);
        let transmitter =
            SocketCanBus::open(&args.engine.interface).map_err(Error::Bus)?;
        engine.bind_bus(Box::new(transmitter));
        let receiver = socketcan::tokio::CanSocket::open(&args.engine.interface)
            .map_err(|e| Error::OpenReceive(e, args.engine.interface.clone()))?;

        // Reception runs on its own task and hands frames over a channel; the engine drains
        // them at its tick boundaries.
        let (frame_queue, mut frames) = tokio::sync::mpsc::unbounded_channel();
        let _receive_task = tokio_util::task::AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match receiver.read_frame().await {
                    Ok(can_frame) => {
                        if let Some(frame) = bus::frame_from_can(&can_frame) {
                            if frame_queue.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(
                            error = &error as &dyn std::error::Error,
                            "receiving from the CAN socket failed"
                        );
                        return;
                    }
                }
            }
        }));

        // The subscription fires from inside `tick`; buffering the updates through a channel
        // lets this loop keep sole ownership of the output writer.
        let (updates, updates_rx) = std::sync::mpsc::channel();
        engine.subscribe_all(Box::new(move |update| {
            let _ = updates.send(update.clone());
        }));

        // Separate lookup copy for rendering: the engine owns its own catalog.
        let catalog = Catalog::new().map_err(Error::Config)?;
        let labels = PlainLabels::new(args.language);
        let mut out = args.output.to_output()?;
        out.headers(vec!["When", "Entity", "Value"])?;

        let started = Instant::now();
        let dump_at = args.dump_after.map(|after| started + *after);
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(50));
        loop {
            tokio::select! {
                received = frames.recv() => {
                    match received {
                        Some(frame) => engine.on_frame(frame),
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    engine.tick(now);
                    if let Some(at) = dump_at {
                        if now >= at {
                            // Stop asking, let whatever is still in flight land or expire, then
                            // snapshot everything.
                            engine.pause();
                        }
                        if now >= at + request_timeout {
                            drain_updates(&mut out, &updates_rx, &catalog, &labels)?;
                            for (id, state) in engine.snapshot() {
                                write_row(&mut out, &catalog, &labels, id, &state)?;
                            }
                            break;
                        }
                    }
                    drain_updates(&mut out, &updates_rx, &catalog, &labels)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    break;
                }
            }
        }
        out.commit()?;
        Ok(())
    }

    fn drain_updates(
        out: &mut output::Output,
        updates: &std::sync::mpsc::Receiver<crate::engine::Update>,
        catalog: &Catalog,
        labels: &PlainLabels,
    ) -> Result<(), Error> {
        while let Ok(update) = updates.try_recv() {
            write_row(out, catalog, labels, update.id, &update.state)?;
        }
        Ok(())
    }

    fn write_row(
        out: &mut output::Output,
        catalog: &Catalog,
        labels: &PlainLabels,
        id: &str,
        state: &ValueState,
    ) -> Result<(), Error> {
        let desc = catalog.index_of(id).map(|index| catalog.get(index));
        let at = jiff::Zoned::now().strftime("%Y-%m-%dT%H:%M:%S").to_string();
        out.record(
            || {
                vec![
                    at.clone(),
                    id.to_string(),
                    output::render_state(state, desc, labels),
                ]
            },
            || UpdateRecord { at: &at, id, value: state },
        )?;
        Ok(())
    }
}

pub mod set {
    use std::time::Instant;

    use crate::bus::{BusError, SocketCanBus};
    use crate::engine::Engine;
    use crate::registers::{Catalog, ConfigError};
    use crate::writes::{ValidationError, WriteValue};

    /// Write a new value to a writable register.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        engine: super::EngineArgs,
        /// The register to change.
        register: String,
        /// The new value: a number, or a label for value-mapped registers.
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("the built-in register catalog is unusable")]
        Config(#[source] ConfigError),
        #[error("could not bind the CAN transmitter")]
        Bus(#[source] BusError),
        #[error("the write was rejected")]
        Validation(#[source] ValidationError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut engine = Engine::new(
            Catalog::new().map_err(Error::Config)?,
            args.engine.to_config(),
        );
        engine.bind_bus(Box::new(
            SocketCanBus::open(&args.engine.interface).map_err(Error::Bus)?,
        ));
        let value = match args.value.parse::<f64>() {
            Ok(number) => WriteValue::Numeric(number),
            Err(_) => WriteValue::Label(args.value),
        };
        engine
            .set_value(&args.register, value, Instant::now())
            .map_err(Error::Validation)?;
        Ok(())
    }
}
