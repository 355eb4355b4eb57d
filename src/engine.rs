use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bus::{Bus, Frame};
use crate::derived::{self, DerivedId};
use crate::registers::{Catalog, REQUEST_CHANNEL, RegisterIndex, ValueState};
use crate::writes::{self, PreparedWrite, ValidationError, WriteValue};
use strum::VariantArray as _;

/// Global engine knobs. Built once, immutable afterwards.
#[derive(Debug)]
pub struct Config {
    /// Poll interval of registers without their own.
    pub default_poll_interval: Duration,
    /// Minimum quiet time between two of our transmissions.
    pub delay_between_requests: Duration,
    /// How long to wait for a correlating reply before giving the slot up.
    pub request_timeout: Duration,
    pub tv_offset: f64,
    pub tvbh_offset: f64,
    pub tr_offset: f64,
    pub max_spread_tvbh_tv: f64,
    pub max_spread_tvbh_tr: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_poll_interval: Duration::from_secs(30),
            delay_between_requests: Duration::from_millis(250),
            request_timeout: Duration::from_secs(1),
            tv_offset: 0.0,
            tvbh_offset: 0.0,
            tr_offset: 0.0,
            max_spread_tvbh_tv: 0.3,
            max_spread_tvbh_tr: 0.3,
        }
    }
}

struct RegisterState {
    value: ValueState,
    updated_at: Option<Instant>,
    /// When the last request for this register completed, by answer or by timeout. Drives the
    /// due computation so a timed-out register is not retried before its next natural interval.
    polled_at: Option<Instant>,
}

struct PendingRequest {
    register: RegisterIndex,
    deadline: Instant,
}

/// A published state change handed to subscribers.
#[derive(Clone, Debug)]
pub struct Update {
    pub id: &'static str,
    pub state: ValueState,
}

type Callback = Box<dyn FnMut(&Update)>;

/// The runtime register accessor.
///
/// Everything in here runs to completion inside [`Engine::tick`] from one cooperative context;
/// [`Engine::on_frame`] only ever appends to the inbox. There is no locking because there is
/// nothing to lock against.
pub struct Engine {
    catalog: Catalog,
    config: Config,
    registers: Vec<RegisterState>,
    derived: Vec<ValueState>,
    pending: Option<PendingRequest>,
    write_queue: VecDeque<PreparedWrite>,
    inbox: VecDeque<Frame>,
    last_send: Option<Instant>,
    bus: Option<Box<dyn Bus>>,
    bus_missing_reported: bool,
    paused: bool,
    subscribers: Vec<(Option<String>, Callback)>,
}

impl Engine {
    pub fn new(catalog: Catalog, config: Config) -> Self {
        let registers = (0..catalog.len())
            .map(|_| RegisterState { value: ValueState::Unknown, updated_at: None, polled_at: None })
            .collect();
        let derived = DerivedId::VARIANTS.iter().map(|_| ValueState::Unknown).collect();
        Self {
            catalog,
            config,
            registers,
            derived,
            pending: None,
            write_queue: VecDeque::new(),
            inbox: VecDeque::new(),
            last_send: None,
            bus: None,
            bus_missing_reported: false,
            paused: false,
            subscribers: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn bind_bus(&mut self, bus: Box<dyn Bus>) {
        self.bus = Some(bus);
        self.bus_missing_reported = false;
    }

    /// Stop issuing new requests. An in-flight transaction still finishes or expires.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Deliver a received frame. Safe to call from the reception context at any time; the frame
    /// is only looked at on the next tick.
    pub fn on_frame(&mut self, frame: Frame) {
        self.inbox.push_back(frame);
    }

    /// Published state of a register or derived value.
    pub fn value(&self, id: &str) -> ValueState {
        if let Some(index) = self.catalog.index_of(id) {
            return self.registers[index.0].value.clone();
        }
        if let Ok(derived) = id.parse::<DerivedId>() {
            return self.derived[derived.ordinal()].clone();
        }
        ValueState::Unknown
    }

    /// Every register and derived value with its current state, in catalog order.
    pub fn snapshot(&self) -> Vec<(&'static str, ValueState)> {
        let registers = self
            .catalog
            .iter()
            .map(|(index, desc)| (desc.id, self.registers[index.0].value.clone()));
        let derived = DerivedId::VARIANTS
            .iter()
            .map(|id| (id.id(), self.derived[id.ordinal()].clone()));
        registers.chain(derived).collect()
    }

    /// Invoke `callback` whenever the entity named by `id` publishes a new state.
    pub fn subscribe(&mut self, id: &str, callback: Callback) {
        self.subscribers.push((Some(id.to_string()), callback));
    }

    /// Invoke `callback` on every published state change.
    pub fn subscribe_all(&mut self, callback: Callback) {
        self.subscribers.push((None, callback));
    }

    /// Validate and dispatch a user-initiated value change.
    ///
    /// The write is encoded immediately and takes the bus slot ahead of the scheduler's next
    /// poll; a validation failure leaves all state untouched.
    pub fn set_value(
        &mut self,
        id: &str,
        value: WriteValue,
        now: Instant,
    ) -> Result<(), ValidationError> {
        let write = writes::prepare(&self.catalog, id, value)?;
        debug!(register = self.catalog.get(write.register).id, "queueing write");
        self.write_queue.push_back(write);
        self.pump_sends(now);
        Ok(())
    }

    /// One pass of the cooperative loop: drain the inbox, expire the in-flight transaction,
    /// and issue the next due request.
    pub fn tick(&mut self, now: Instant) {
        while let Some(frame) = self.inbox.pop_front() {
            self.handle_frame(frame, now);
        }
        if let Some(pending) = &self.pending {
            if now >= pending.deadline {
                let register = pending.register;
                let desc = self.catalog.get(register);
                warn!(register = desc.id, "no reply within the deadline, releasing the slot");
                self.pending = None;
                self.registers[register.0].polled_at = Some(now);
            }
        }
        self.pump_sends(now);
    }

    /// Send the next frame if the single transaction slot and the request spacing allow it.
    /// Writes go first.
    fn pump_sends(&mut self, now: Instant) {
        if self.paused || self.pending.is_some() {
            return;
        }
        if self.bus.is_none() {
            if !self.bus_missing_reported {
                warn!("no bus transceiver bound, not requesting anything");
                self.bus_missing_reported = true;
            }
            return;
        }
        if let Some(last) = self.last_send {
            if now.saturating_duration_since(last) < self.config.delay_between_requests {
                return;
            }
        }
        if let Some(write) = self.write_queue.pop_front() {
            self.send_write(write, now);
        } else if let Some(register) = self.next_poll(now) {
            self.send_poll(register, now);
        }
    }

    fn send_write(&mut self, write: PreparedWrite, now: Instant) {
        let desc = self.catalog.get(write.register);
        let frame = Frame { channel: REQUEST_CHANNEL, data: write.frame };
        let bus = self.bus.as_mut().expect("checked in pump_sends");
        match bus.send(&frame) {
            Ok(()) => {
                trace!(register = desc.id, data = ?frame.data, "write sent");
                self.last_send = Some(now);
                // Reflect the change right away; the next ordinary poll corrects the state if
                // the device disagrees.
                self.registers[write.register.0].updated_at = Some(now);
                self.publish_register(write.register, ValueState::Known(write.value));
            }
            Err(error) => {
                warn!(
                    register = desc.id,
                    error = &error as &dyn std::error::Error,
                    "could not transmit the write"
                );
            }
        }
    }

    fn send_poll(&mut self, register: RegisterIndex, now: Instant) {
        let desc = self.catalog.get(register);
        let frame = Frame { channel: REQUEST_CHANNEL, data: desc.read_frame() };
        let bus = self.bus.as_mut().expect("checked in pump_sends");
        match bus.send(&frame) {
            Ok(()) => {
                trace!(register = desc.id, data = ?frame.data, "request sent");
                self.last_send = Some(now);
                self.pending = Some(PendingRequest {
                    register,
                    deadline: now + self.config.request_timeout,
                });
            }
            Err(error) => {
                warn!(
                    register = desc.id,
                    error = &error as &dyn std::error::Error,
                    "could not transmit the request"
                );
            }
        }
    }

    /// The most overdue due register, ties broken by catalog order.
    fn next_poll(&self, now: Instant) -> Option<RegisterIndex> {
        let mut best: Option<(RegisterIndex, Option<Duration>)> = None;
        for (index, desc) in self.catalog.iter() {
            let interval = desc.poll.unwrap_or(self.config.default_poll_interval);
            // `None` for never-polled registers, which outrank any finite overdue time.
            let overdue = match self.registers[index.0].polled_at {
                None => None,
                Some(at) => match now.saturating_duration_since(at + interval) {
                    Duration::ZERO => continue,
                    overdue => Some(overdue),
                },
            };
            let better = match &best {
                None => true,
                Some((_, best_overdue)) => match (overdue, best_overdue) {
                    (None, Some(_)) => true,
                    (None, None) | (Some(_), None) => false,
                    (Some(ours), Some(theirs)) => ours > *theirs,
                },
            };
            if better {
                best = Some((index, overdue));
            }
        }
        best.map(|(index, _)| index)
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let Some(pending) = &self.pending else {
            trace!(channel = frame.channel, data = ?frame.data, "frame without a transaction");
            return;
        };
        let register = pending.register;
        let desc = self.catalog.get(register);
        if frame.channel != desc.channel || !self.catalog.reply_pattern(register).matches(&frame.data) {
            // Other bus participants talk over the same wire; their frames are not ours to
            // decode.
            trace!(channel = frame.channel, data = ?frame.data, "frame does not correlate");
            return;
        }
        self.pending = None;
        self.registers[register.0].polled_at = Some(now);
        match crate::codec::decode(desc, &frame.data) {
            Ok(value) => {
                trace!(register = desc.id, %value, "decoded");
                self.registers[register.0].updated_at = Some(now);
                self.publish_register(register, ValueState::Known(value));
            }
            Err(error) => {
                debug!(
                    register = desc.id,
                    error = &error as &dyn std::error::Error,
                    "implausible reply, register marked invalid"
                );
                self.publish_register(register, ValueState::Invalid);
            }
        }
    }

    fn publish_register(&mut self, register: RegisterIndex, state: ValueState) {
        let desc = self.catalog.get(register);
        if self.registers[register.0].value != state {
            self.registers[register.0].value = state.clone();
            self.notify(desc.id, state);
        }
        for derived in desc.updates {
            self.recompute_derived(*derived);
        }
    }

    fn recompute_derived(&mut self, id: DerivedId) {
        let computed = {
            let lookup = |entity: &str| self.value(entity).known()?.as_numeric();
            derived::recompute(id, &self.config, &lookup)
        };
        // Inputs still missing: previous state stays published, stale rather than cleared.
        let Some(state) = computed else { return };
        if self.derived[id.ordinal()] != state {
            self.derived[id.ordinal()] = state.clone();
            self.notify(id.id(), state);
        }
    }

    fn notify(&mut self, id: &'static str, state: ValueState) {
        let update = Update { id, state };
        for (filter, callback) in &mut self.subscribers {
            if filter.as_deref().is_none_or(|f| f == id) {
                callback(&update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{
        Access, Bounds, DEFAULT_CHANNEL, RawKind, RegisterDescriptor, Value,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    const fn reg(
        id: &'static str,
        command: &'static [u8],
        poll_secs: u64,
    ) -> RegisterDescriptor {
        RegisterDescriptor {
            id,
            access: Access::R_,
            kind: RawKind::CEL,
            offset: 5,
            command,
            channel: DEFAULT_CHANNEL,
            poll: Some(Duration::from_secs(poll_secs)),
            bounds: None,
            map: None,
            codec: None,
            updates: &[],
        }
    }

    static ALPHA_CMD: &[u8] = &[0x31, 0x00, 0xFA, 0x01, 0x01];
    static BETA_CMD: &[u8] = &[0x31, 0x00, 0xFA, 0x01, 0x02];
    static GAMMA_CMD: &[u8] = &[0x31, 0x00, 0xFA, 0x01, 0x03];

    static SMALL: &[RegisterDescriptor] = &[
        reg("alpha", ALPHA_CMD, 10),
        reg("beta", BETA_CMD, 10),
        RegisterDescriptor {
            access: Access::RW,
            bounds: Some(Bounds { min: 0.0, max: 50.0, step: 0.5 }),
            ..reg("gamma", GAMMA_CMD, 10)
        },
    ];

    #[derive(Clone, Default)]
    struct RecordingBus {
        sent: Rc<RefCell<Vec<Frame>>>,
    }

    impl Bus for RecordingBus {
        fn send(&mut self, frame: &Frame) -> Result<(), crate::bus::BusError> {
            self.sent.borrow_mut().push(*frame);
            Ok(())
        }
    }

    fn engine_with_bus() -> (Engine, RecordingBus) {
        let catalog = Catalog::from_descriptors(SMALL).unwrap();
        let mut engine = Engine::new(catalog, Config::default());
        let bus = RecordingBus::default();
        engine.bind_bus(Box::new(bus.clone()));
        (engine, bus)
    }

    /// A correlating reply to the request that `sent` carries.
    fn reply_for(sent: &Frame, raw: u16) -> Frame {
        let mut data = sent.data;
        data[0] = data[0].wrapping_add(1);
        data[1] = 0x10;
        [data[5], data[6]] = raw.to_be_bytes();
        Frame { channel: DEFAULT_CHANNEL, data }
    }

    #[test]
    fn only_one_transaction_in_flight() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        for ms in 0..20 {
            engine.tick(start + Duration::from_millis(ms * 100));
        }
        // No reply ever arrives; until the timeout expires nothing else may be requested, and
        // after it the slot frees for exactly one more request at a time.
        let sent = bus.sent.borrow();
        assert!(!sent.is_empty());
        for window in sent.windows(2) {
            assert_ne!(window[0].data, window[1].data);
        }
    }

    #[test]
    fn first_pick_follows_catalog_order() {
        let (mut engine, bus) = engine_with_bus();
        engine.tick(Instant::now());
        assert_eq!(bus.sent.borrow()[0].data[..5], *ALPHA_CMD);
    }

    #[test]
    fn request_spacing_is_honoured() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        engine.tick(start);
        assert_eq!(bus.sent.borrow().len(), 1);
        let reply = reply_for(&bus.sent.borrow()[0], 450);
        engine.on_frame(reply);
        // The slot is free but the quiet time between transmissions is not over yet.
        engine.tick(start + Duration::from_millis(100));
        assert_eq!(bus.sent.borrow().len(), 1);
        engine.tick(start + Duration::from_millis(250));
        assert_eq!(bus.sent.borrow().len(), 2);
        assert_eq!(bus.sent.borrow()[1].data[..5], *BETA_CMD);
    }

    #[test]
    fn reply_updates_state_and_notifies() {
        let (mut engine, bus) = engine_with_bus();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        engine.subscribe("alpha", Box::new(move |u| sink.borrow_mut().push(u.clone())));
        let start = Instant::now();
        engine.tick(start);
        engine.on_frame(reply_for(&bus.sent.borrow()[0], 450));
        engine.tick(start + Duration::from_millis(50));
        assert_eq!(engine.value("alpha"), ValueState::Known(Value::Numeric(45.0)));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].state, ValueState::Known(Value::Numeric(45.0)));
    }

    #[test]
    fn unrelated_frames_are_discarded() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        engine.tick(start);
        // Wrong channel.
        let mut stray = reply_for(&bus.sent.borrow()[0], 450);
        stray.channel = 0x300;
        engine.on_frame(stray);
        // Right channel, different register's echo.
        let other = Frame {
            channel: DEFAULT_CHANNEL,
            data: [0x32, 0x10, 0xFA, 0x01, 0x7F, 0x01, 0xC2],
        };
        engine.on_frame(other);
        engine.tick(start + Duration::from_millis(50));
        assert_eq!(engine.value("alpha"), ValueState::Unknown);
        // The transaction is still waiting for its real answer.
        engine.tick(start + Duration::from_millis(300));
        assert_eq!(bus.sent.borrow().len(), 1);
    }

    #[test]
    fn timed_out_register_waits_for_its_interval() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        engine.tick(start);
        assert_eq!(bus.sent.borrow()[0].data[..5], *ALPHA_CMD);
        // Expire the request; alpha must not be asked again before its 10 s interval even
        // though it is the only register without a value.
        engine.tick(start + Duration::from_secs(2));
        let mut now = start + Duration::from_secs(2);
        while now < start + Duration::from_secs(9) {
            engine.tick(now);
            now += Duration::from_millis(300);
        }
        let alpha_requests = bus
            .sent
            .borrow()
            .iter()
            .filter(|f| f.data[..5] == *ALPHA_CMD)
            .count();
        assert_eq!(alpha_requests, 1);
        // Past the interval it becomes due again.
        engine.tick(start + Duration::from_secs(13));
        let alpha_requests = bus
            .sent
            .borrow()
            .iter()
            .filter(|f| f.data[..5] == *ALPHA_CMD)
            .count();
        assert_eq!(alpha_requests, 2);
    }

    #[test]
    fn writes_preempt_polls_and_update_optimistically() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        engine.tick(start);
        engine.on_frame(reply_for(&bus.sent.borrow()[0], 450));
        engine
            .set_value("gamma", WriteValue::Numeric(21.5), start + Duration::from_millis(10))
            .unwrap();
        // Slot free, but the write has to respect the request spacing like everything else.
        assert_eq!(bus.sent.borrow().len(), 1);
        engine.tick(start + Duration::from_millis(260));
        {
            let sent = bus.sent.borrow();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].data, [0x30, 0x00, 0xFA, 0x01, 0x03, 0x00, 0xD7]);
        }
        assert_eq!(engine.value("gamma"), ValueState::Known(Value::Numeric(21.5)));
        // The write held no slot, so polling continues afterwards.
        engine.tick(start + Duration::from_millis(520));
        assert_eq!(bus.sent.borrow().len(), 3);
    }

    #[test]
    fn failed_validation_changes_nothing() {
        let (mut engine, bus) = engine_with_bus();
        let result = engine.set_value("gamma", WriteValue::Numeric(99.0), Instant::now());
        assert!(result.is_err());
        assert_eq!(engine.value("gamma"), ValueState::Unknown);
        assert!(bus.sent.borrow().is_empty());
    }

    #[test]
    fn pause_stops_issuance_but_finishes_the_transaction() {
        let (mut engine, bus) = engine_with_bus();
        let start = Instant::now();
        engine.tick(start);
        engine.pause();
        let reply = reply_for(&bus.sent.borrow()[0], 450);
        engine.on_frame(reply);
        engine.tick(start + Duration::from_secs(1));
        // The in-flight answer was still processed...
        assert_eq!(engine.value("alpha"), ValueState::Known(Value::Numeric(45.0)));
        // ...but nothing new goes out until resume.
        engine.tick(start + Duration::from_secs(2));
        assert_eq!(bus.sent.borrow().len(), 1);
        engine.resume();
        engine.tick(start + Duration::from_secs(3));
        assert_eq!(bus.sent.borrow().len(), 2);
    }

    #[test]
    fn unbound_bus_is_a_diagnosed_no_op() {
        let catalog = Catalog::from_descriptors(SMALL).unwrap();
        let mut engine = Engine::new(catalog, Config::default());
        engine.tick(Instant::now());
        engine.tick(Instant::now());
        assert_eq!(engine.value("alpha"), ValueState::Unknown);
    }
}
