//! Drives the whole accessor against a scripted bus: polls go out one at a time, replies come
//! back in, derived values fall out, and a user write preempts the poll traffic.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rotex_can_tools::bus::{Bus, BusError, Frame};
use rotex_can_tools::derived::SPECIFIC_HEAT;
use rotex_can_tools::engine::{Config, Engine};
use rotex_can_tools::registers::{Catalog, REQUEST_CHANNEL, Value, ValueState};
use rotex_can_tools::writes::WriteValue;

#[derive(Default)]
struct BusLog {
    sent: Vec<Frame>,
    outstanding_reads: usize,
}

#[derive(Clone, Default)]
struct ScriptedBus {
    log: Rc<RefCell<BusLog>>,
}

impl Bus for ScriptedBus {
    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        let mut log = self.log.borrow_mut();
        assert_eq!(frame.channel, REQUEST_CHANNEL);
        if frame.data[0] & 0x01 != 0 {
            log.outstanding_reads += 1;
            assert!(
                log.outstanding_reads <= 1,
                "more than one read in flight: {:02x?}",
                frame.data
            );
        }
        log.sent.push(*frame);
        Ok(())
    }
}

/// What the simulated device reports for each register's decode window.
fn raw_for(id: &str) -> u16 {
    match id {
        "target_supply_temperature" => 480, // 48.0 °C
        "water_pressure" => 1500,           // 1.5 bar
        // Matches the write the test submits; a disagreeing report would simply win on the
        // next poll.
        "target_hot_water_temperature" => 480,
        "tdhw1" => 467,
        "t_ext" => 0xFFB5, // -7.5 °C
        "status_kompressor" => 1,
        "circulation_pump" => 80,
        "bypass_valve" => 100,
        "dhw_mixer_position" => 0,
        "flow_rate" => 1000,
        "tv" => 450,
        "tvbh" => 452,
        "tr" => 400,
        "mode_of_operating" => 1, // heating
        "error_code" => 0,
        "operating_mode" => 3,
        "building_insulation" => 4,
        "hp_hyst_tdhw" => 70,
        "delay_time_for_backup_heating" => 30,
        "antileg_temp" => 650,
        "power_ehs_1" => 600,     // 6 kW at the 0x64 scale
        "power_biv" => 900,       // 9 kW
        "electric_heater" => 0x0E00, // all three stage bits: 9 kW
        "system_date_day" => 14,
        "system_date_month" => 3,
        "system_date_year" => 24,
        "system_time_hour" => 7,
        "system_time_minute" => 5,
        "system_time_second" => 9,
        other => panic!("no scripted value for register `{other}`"),
    }
}

/// Answer a read request the way the device would: opcode bumped, address echoed, value in the
/// decode window.
fn scripted_reply(catalog: &Catalog, request: &Frame) -> Option<Frame> {
    let (_, desc) = catalog.iter().find(|(_, d)| d.read_frame() == request.data)?;
    let raw = raw_for(desc.id);
    let mut data = request.data;
    data[0] = data[0].wrapping_add(1);
    data[1] = 0x10;
    let offset = usize::from(desc.offset);
    match desc.kind.size() {
        1 => data[offset] = raw as u8,
        _ => {
            let bytes = raw.to_be_bytes();
            data[offset] = bytes[0];
            data[offset + 1] = bytes[1];
        }
    }
    Some(Frame { channel: desc.channel, data })
}

fn known_number(engine: &Engine, id: &str) -> f64 {
    match engine.value(id) {
        ValueState::Known(Value::Numeric(n)) => n,
        other => panic!("`{id}` should be a known number, is {other:?}"),
    }
}

#[test]
fn poll_decode_derive_and_write_cycle() {
    let mut engine = Engine::new(Catalog::new().unwrap(), Config::default());
    let bus = ScriptedBus::default();
    engine.bind_bus(Box::new(bus.clone()));

    let power_updates = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&power_updates);
    engine.subscribe(
        "thermal_power",
        Box::new(move |update| sink.borrow_mut().push(update.state.clone())),
    );

    let catalog = Catalog::new().unwrap();
    let started = Instant::now();
    let mut now = started;
    let mut answered = 0;
    let mut write_submitted = false;
    for round in 0..240 {
        engine.tick(now);
        let replies: Vec<Frame> = {
            let mut log = bus.log.borrow_mut();
            let fresh = log.sent[answered..].to_vec();
            answered = log.sent.len();
            let replies = fresh
                .iter()
                .filter_map(|request| scripted_reply(&catalog, request))
                .collect();
            log.outstanding_reads = 0;
            replies
        };
        for reply in replies {
            engine.on_frame(reply);
        }
        if round == 120 && !write_submitted {
            engine
                .set_value(
                    "target_hot_water_temperature",
                    WriteValue::Numeric(48.0),
                    now,
                )
                .unwrap();
            write_submitted = true;
        }
        now += Duration::from_millis(300);
    }

    // Plain registers decoded into engineering units.
    assert_eq!(known_number(&engine, "tv"), 45.0);
    assert_eq!(known_number(&engine, "tr"), 40.0);
    assert_eq!(known_number(&engine, "water_pressure"), 1.5);
    assert_eq!(known_number(&engine, "t_ext"), -7.5);
    assert_eq!(known_number(&engine, "power_ehs_1"), 6.0);
    assert_eq!(engine.value("mode_of_operating"), ValueState::Known(Value::Code(1)));
    assert_eq!(engine.value("electric_heater"), ValueState::Known(Value::Code(9)));

    // Derived values recomputed from their inputs.
    let expected_power = 1000.0 / 3600.0 * (45.0 - 40.0) * SPECIFIC_HEAT;
    assert_eq!(known_number(&engine, "thermal_power"), expected_power);
    assert_eq!(known_number(&engine, "temperature_spread"), 45.0 - 40.0);
    assert_eq!(known_number(&engine, "tv_tvbh_delta"), 45.0 - 45.2);
    assert_eq!(
        engine.value("system_date"),
        ValueState::Known(Value::Text("14:03:2024".to_string()))
    );
    assert_eq!(
        engine.value("system_time"),
        ValueState::Known(Value::Text("07:05:09".to_string()))
    );
    assert!(!power_updates.borrow().is_empty());

    // The write went out with the cleared opcode and the scaled value, and the register
    // reflects it.
    let log = bus.log.borrow();
    let write_frame = log
        .sent
        .iter()
        .find(|f| f.data[0] == 0x30 && f.data[..3] == [0x30, 0x00, 0x13][..])
        .expect("the write frame must have been transmitted");
    assert_eq!(write_frame.data, [0x30, 0x00, 0x13, 0x01, 0xE0, 0x00, 0x00]);
    drop(log);
    assert_eq!(
        engine.value("target_hot_water_temperature"),
        ValueState::Known(Value::Numeric(48.0))
    );
}

#[test]
fn timed_out_poll_is_not_retried_early() {
    let mut engine = Engine::new(Catalog::new().unwrap(), Config::default());
    let bus = ScriptedBus::default();
    engine.bind_bus(Box::new(bus.clone()));

    let started = Instant::now();
    engine.tick(started);
    let first = {
        let mut log = bus.log.borrow_mut();
        log.outstanding_reads = 0;
        log.sent[0]
    };
    // Never answer; the register only becomes due again a full poll interval after the
    // timeout, not immediately.
    let mut now = started + Duration::from_secs(2);
    while now < started + Duration::from_secs(14) {
        engine.tick(now);
        bus.log.borrow_mut().outstanding_reads = 0;
        now += Duration::from_millis(500);
    }
    let repeats = bus
        .log
        .borrow()
        .sent
        .iter()
        .filter(|f| f.data == first.data)
        .count();
    assert_eq!(repeats, 1);
}
