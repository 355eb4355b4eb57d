use std::time::Duration;

use crate::codec::CodecStrategy;
use crate::derived::DerivedId;

/// Channel on which the heating controller answers register requests.
pub const DEFAULT_CHANNEL: u16 = 0x180;
/// Channel of the room-station module.
pub const ROOM_STATION_CHANNEL: u16 = 0x300;
/// Channel of the boiler-control module.
pub const BOILER_CONTROL_CHANNEL: u16 = 0x500;
/// Channel we transmit our requests on.
pub const REQUEST_CHANNEL: u16 = 0x680;

/// Raw wire representation of a register value.
#[derive(Clone, Copy, PartialEq)]
pub struct RawKind {
    size: u8,
    signed: bool,
    divider: f64,
}

impl RawKind {
    // Convenience aliases for the nicely tabulated `for_each_register` definition below.
    pub const U8: Self = Self { size: 1, signed: false, divider: 1.0 };
    pub const U16: Self = Self { size: 2, signed: false, divider: 1.0 };
    /// Temperatures are transported as tenths of a degree.
    pub const CEL: Self = Self { size: 2, signed: false, divider: 10.0 };
    /// Signed variant of [`Self::CEL`] for values that go below zero.
    pub const CELS: Self = Self { size: 2, signed: true, divider: 10.0 };
    /// Pressures are transported in millibar.
    pub const MBAR: Self = Self { size: 2, signed: false, divider: 1000.0 };

    pub const fn size(&self) -> u8 {
        self.size
    }

    pub const fn is_signed(&self) -> bool {
        self.signed
    }

    pub const fn divider(&self) -> f64 {
        self.divider
    }
}

impl std::fmt::Display for RawKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.signed { "i" } else { "u" })?;
        f.write_fmt(format_args!("{}/{}", self.size * 8, self.divider))?;
        Ok(())
    }
}

/// A decoded engineering value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Numeric(f64),
    /// Raw code of a value-mapped register. The label key is looked up in the register's map;
    /// turning the key into display text is the label resolver's business, not ours.
    Code(u16),
    /// Composed text such as the system date. Only produced by derived values.
    Text(String),
}

impl Value {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Value::Numeric(n) => Some(*n),
            Value::Code(_) | Value::Text(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Numeric(n) => f.write_fmt(format_args!("{}", n)),
            Value::Code(c) => f.write_fmt(format_args!("{}", c)),
            Value::Text(t) => f.write_str(t),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Numeric(n) => serializer.serialize_f64(*n),
            Value::Code(c) => serializer.serialize_u16(*c),
            Value::Text(t) => serializer.serialize_str(t),
        }
    }
}

/// Published state of a register or derived value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ValueState {
    /// Never successfully read since startup.
    #[default]
    Unknown,
    /// The last read produced something implausible (value-map miss, spread guard, …).
    Invalid,
    Known(Value),
}

impl ValueState {
    pub fn known(&self) -> Option<&Value> {
        match self {
            ValueState::Known(v) => Some(v),
            ValueState::Unknown | ValueState::Invalid => None,
        }
    }
}

impl std::fmt::Display for ValueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueState::Unknown => f.write_str("unknown"),
            ValueState::Invalid => f.write_str("invalid"),
            ValueState::Known(v) => v.fmt(f),
        }
    }
}

impl serde::Serialize for ValueState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ValueState::Unknown => serializer.serialize_none(),
            ValueState::Invalid => serializer.serialize_str("invalid"),
            ValueState::Known(v) => v.serialize(serializer),
        }
    }
}

#[derive(Clone, Copy, serde::Serialize, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    pub const R_: Self = Self(1 << 0);
    pub const RW: Self = Self(1 << 0 | 1 << 1);

    pub const fn is_writable(&self) -> bool {
        self.0 & (1 << 1) != 0
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("R")?;
        f.write_str(if self.is_writable() { "W" } else { "-" })?;
        Ok(())
    }
}

/// Write validation limits of a writable numeric register.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

pub type ValueMap = &'static [(u16, &'static str)];

pub struct RegisterDescriptor {
    pub id: &'static str,
    pub access: Access,
    pub kind: RawKind,
    pub offset: u8,
    /// Command bytes identifying the register on the bus, at most 7, zero-padded when sent.
    pub command: &'static [u8],
    /// Channel the answer arrives on.
    pub channel: u16,
    /// Per-register poll interval; the global default applies when absent.
    pub poll: Option<Duration>,
    pub bounds: Option<Bounds>,
    pub map: Option<ValueMap>,
    pub codec: Option<&'static dyn CodecStrategy>,
    /// Derived values to recompute whenever this register updates.
    pub updates: &'static [DerivedId],
}

impl RegisterDescriptor {
    pub fn label_for(&self, code: u16) -> Option<&'static str> {
        self.map?.iter().find(|(c, _)| *c == code).map(|(_, l)| *l)
    }

    pub fn code_for(&self, label: &str) -> Option<u16> {
        self.map?.iter().find(|(_, l)| *l == label).map(|(c, _)| *c)
    }

    /// The request frame soliciting this register, zero-padded to the full payload width.
    pub fn read_frame(&self) -> [u8; PAYLOAD_LEN] {
        let mut data = [0; PAYLOAD_LEN];
        data[..self.command.len()].copy_from_slice(self.command);
        data
    }

    /// The base frame of a write request: the read command with the opcode's low bit cleared.
    /// The codec fills the value into the decode window.
    pub fn write_frame(&self) -> [u8; PAYLOAD_LEN] {
        let mut data = self.read_frame();
        data[0] &= !0x01;
        data
    }
}

/// Width of a register request/response payload on the bus.
pub const PAYLOAD_LEN: usize = 7;

/// Which reply payload bytes must echo the request.
///
/// A reply repeats the request's opcode incremented by one and its address bytes: `FA hi lo` for
/// long-form commands, the single register byte for short-form ones. Everything else, in
/// particular the decode window, is payload.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ReplyPattern([Option<u8>; PAYLOAD_LEN]);

impl ReplyPattern {
    fn for_descriptor(desc: &RegisterDescriptor) -> Self {
        let mut expect = [None; PAYLOAD_LEN];
        expect[0] = Some(desc.command[0].wrapping_add(1));
        if desc.command.get(2) == Some(&0xFA) {
            expect[2] = Some(0xFA);
            expect[3] = desc.command.get(3).copied();
            expect[4] = desc.command.get(4).copied();
        } else {
            expect[2] = desc.command.get(2).copied();
        }
        let window = desc.offset..desc.offset + desc.kind.size();
        for position in window {
            expect[usize::from(position)] = None;
        }
        Self(expect)
    }

    pub fn matches(&self, payload: &[u8; PAYLOAD_LEN]) -> bool {
        self.0
            .iter()
            .zip(payload)
            .all(|(expect, byte)| expect.map_or(true, |e| e == *byte))
    }
}

static MODE_OF_OPERATING: ValueMap = &[
    (0x00, "standby"),
    (0x01, "heating"),
    (0x02, "cooling"),
    (0x03, "defrosting"),
    (0x04, "hot_water_production"),
];

static OPERATING_MODE: ValueMap = &[
    (0x01, "standby"),
    (0x03, "heating"),
    (0x04, "lowering"),
    (0x05, "summer"),
    (0x0B, "automatic_1"),
    (0x0C, "automatic_2"),
    (0x11, "cooling"),
];

static BUILDING_INSULATION: ValueMap = &[
    (0x00, "off"),
    (0x02, "low"),
    (0x04, "normal"),
    (0x08, "good"),
    (0x0C, "very_good"),
];

static ELECTRIC_HEATER: ValueMap = &[
    (0, "off"),
    (3, "3_kw"),
    (6, "6_kw"),
    (9, "9_kw"),
];

static ERROR_CODE: ValueMap = &[
    (0, "err_0"),
    (8005, "err_e8005"),
    (8006, "err_e8006"),
    (8007, "err_e8007"),
    (9001, "err_e9001"),
    (9002, "err_e9002"),
    (9003, "err_e9003"),
    (9004, "err_e9004"),
    (9005, "err_e9005"),
];

macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            "target_supply_temperature": R_, CEL @ 3, [0x31 0x00 0x02],
                updates = [VorlaufSollTvDelta];
            "water_pressure": R_, MBAR @ 3, [0x31 0x00 0x1C], poll = 60;
            "target_hot_water_temperature": RW, CEL @ 3, [0x31 0x00 0x13],
                min = 35.0, max = 70.0, step = 1.0;
            "tdhw1": R_, CEL @ 5, [0x31 0x00 0xFA 0x00 0x0E], poll = 60;
            "t_ext": R_, CELS @ 5, [0x61 0x00 0xFA 0x0A 0x0C], chan = 0x300, poll = 120;
            "status_kompressor": R_, U8 @ 3, [0xA1 0x00 0x61], chan = 0x500, poll = 15;
            "circulation_pump": R_, U8 @ 6, [0x31 0x00 0xFA 0xC0 0xF7];
            "bypass_valve": R_, U16 @ 5, [0x31 0x00 0xFA 0xC0 0xFB];
            "dhw_mixer_position": R_, U16 @ 5, [0x31 0x00 0xFA 0x06 0x9B];
            "flow_rate": R_, U16 @ 5, [0x31 0x00 0xFA 0x01 0xDA], poll = 15,
                updates = [ThermalPower];
            "tv": R_, CEL @ 5, [0x31 0x00 0xFA 0xC0 0xFC], poll = 15,
                updates = [ThermalPower, TemperatureSpread, TvTvbhDelta, VorlaufSollTvDelta];
            "tvbh": R_, CEL @ 5, [0x31 0x00 0xFA 0xC0 0xFE], poll = 15,
                updates = [TvTvbhDelta, TvbhTrDelta];
            "tr": R_, CEL @ 5, [0x31 0x00 0xFA 0xC1 0x00], poll = 15,
                updates = [ThermalPower, TemperatureSpread, TvbhTrDelta];
            "mode_of_operating": R_, U8 @ 6, [0x31 0x00 0xFA 0xC0 0xF6], poll = 15,
                map = MODE_OF_OPERATING, updates = [ThermalPower];
            "error_code": R_, U16 @ 5, [0x31 0x00 0xFA 0x13 0x88], poll = 60,
                map = ERROR_CODE;
            "operating_mode": RW, U8 @ 5, [0x31 0x00 0xFA 0x01 0x12],
                map = OPERATING_MODE;
            "building_insulation": RW, U8 @ 5, [0x31 0x00 0xFA 0x01 0x0C], poll = 300,
                map = BUILDING_INSULATION;
            "hp_hyst_tdhw": RW, CEL @ 5, [0x31 0x00 0xFA 0x06 0x91], poll = 300,
                min = 2.0, max = 20.0, step = 0.1;
            "delay_time_for_backup_heating": RW, U16 @ 5, [0x31 0x00 0xFA 0x06 0x92], poll = 300,
                min = 20.0, max = 95.0, step = 1.0;
            "antileg_temp": RW, CEL @ 5, [0x31 0x00 0xFA 0x05 0x87], poll = 300,
                min = 60.0, max = 75.0, step = 1.0;
            "power_ehs_1": RW, U16 @ 5, [0x31 0x00 0xFA 0x06 0x69], poll = 300,
                min = 1.0, max = 40.0, step = 1.0, codec = CentiScale;
            "power_biv": RW, U16 @ 5, [0x31 0x00 0xFA 0x06 0x6B], poll = 300,
                min = 3.0, max = 40.0, step = 1.0, codec = CentiScale;
            "electric_heater": RW, U16 @ 5, [0x31 0x00 0xFA 0x0A 0x20], poll = 300,
                map = ELECTRIC_HEATER, codec = BackupHeaterStages;
            "system_date_day": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x22], poll = 60,
                updates = [SystemDate];
            "system_date_month": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x23], poll = 60,
                updates = [SystemDate];
            "system_date_year": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x24], poll = 60,
                updates = [SystemDate];
            "system_time_hour": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x25],
                updates = [SystemTime];
            "system_time_minute": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x26],
                updates = [SystemTime];
            "system_time_second": R_, U8 @ 5, [0x31 0x00 0xFA 0x01 0x27],
                updates = [SystemTime];
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! or_default {
    ($default: expr $(,)?) => {
        $default
    };
    ($default: expr, $($given: tt)+) => {
        $($given)+
    };
}

macro_rules! make_descriptors {
    ($($id: literal: $mode: ident, $kind: ident @ $offset: literal, [$($cmd: literal)+]
        $(, chan = $chan: literal)?
        $(, poll = $poll: literal)?
        $(, min = $min: literal, max = $max: literal, step = $step: literal)?
        $(, map = $map: ident)?
        $(, codec = $codec: ident)?
        $(, updates = [$($upd: ident),+])?
        ;
    )+) => {
        pub static DESCRIPTORS: &[RegisterDescriptor] = &[$(
            RegisterDescriptor {
                id: $id,
                access: Access::$mode,
                kind: RawKind::$kind,
                offset: $offset,
                command: &[$($cmd),+],
                channel: or_default!(DEFAULT_CHANNEL, $($chan)?),
                poll: optional!($(Duration::from_secs($poll))?),
                bounds: optional!($(Bounds { min: $min, max: $max, step: $step })?),
                map: optional!($($map)?),
                codec: optional!($(&crate::codec::$codec)?),
                updates: &[$($(DerivedId::$upd),+)?],
            },
        )+];
    };
}

for_each_register!(make_descriptors);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegisterIndex(pub(crate) usize);

impl RegisterIndex {
    pub fn ordinal(&self) -> usize {
        self.0
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("register `{0}` is declared more than once")]
    DuplicateId(&'static str),
    #[error("register `{0}` has no command bytes")]
    EmptyCommand(&'static str),
    #[error("register `{0}` command is {1} bytes long, the payload fits {PAYLOAD_LEN}")]
    CommandTooLong(&'static str, usize),
    #[error("register `{0}` decode window {1}+{2} runs past the payload end")]
    WindowOutOfBounds(&'static str, u8, u8),
    #[error("register `{0}` has a non-positive divider")]
    NonPositiveDivider(&'static str),
    #[error("register `{0}` maps raw code {1} to more than one label")]
    DuplicateMapCode(&'static str, u16),
    #[error("register `{0}` declares both a value map and numeric bounds")]
    MapWithBounds(&'static str),
    #[error("derived value `{0}` depends on unknown entity `{1}`")]
    UnknownDerivedInput(&'static str, &'static str),
    #[error("derived value dependencies form a cycle through `{0}`")]
    DerivedCycle(&'static str),
}

/// The validated register table.
///
/// Construction checks every descriptor invariant once; afterwards lookups cannot fail and the
/// reply patterns are ready for the transaction matcher.
pub struct Catalog {
    descriptors: &'static [RegisterDescriptor],
    replies: Vec<ReplyPattern>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("descriptors", &self.descriptors.len())
            .field("replies", &self.replies)
            .finish()
    }
}

impl PartialEq for Catalog {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.descriptors, other.descriptors) && self.replies == other.replies
    }
}

impl Catalog {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_descriptors(DESCRIPTORS)
    }

    pub fn from_descriptors(
        descriptors: &'static [RegisterDescriptor],
    ) -> Result<Self, ConfigError> {
        for (nth, desc) in descriptors.iter().enumerate() {
            if descriptors[..nth].iter().any(|d| d.id == desc.id) {
                return Err(ConfigError::DuplicateId(desc.id));
            }
            if desc.command.is_empty() {
                return Err(ConfigError::EmptyCommand(desc.id));
            }
            if desc.command.len() > PAYLOAD_LEN {
                return Err(ConfigError::CommandTooLong(desc.id, desc.command.len()));
            }
            let window_end = usize::from(desc.offset) + usize::from(desc.kind.size());
            if window_end > PAYLOAD_LEN {
                return Err(ConfigError::WindowOutOfBounds(
                    desc.id,
                    desc.offset,
                    desc.kind.size(),
                ));
            }
            if !(desc.kind.divider() > 0.0) {
                return Err(ConfigError::NonPositiveDivider(desc.id));
            }
            if let Some(map) = desc.map {
                if desc.bounds.is_some() {
                    return Err(ConfigError::MapWithBounds(desc.id));
                }
                for (nth, (code, _)) in map.iter().enumerate() {
                    if map[..nth].iter().any(|(c, _)| c == code) {
                        return Err(ConfigError::DuplicateMapCode(desc.id, *code));
                    }
                }
            }
        }
        crate::derived::validate_dependencies(descriptors)?;
        let replies = descriptors.iter().map(ReplyPattern::for_descriptor).collect();
        Ok(Self { descriptors, replies })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn get(&self, index: RegisterIndex) -> &'static RegisterDescriptor {
        &self.descriptors[index.0]
    }

    pub fn reply_pattern(&self, index: RegisterIndex) -> &ReplyPattern {
        &self.replies[index.0]
    }

    pub fn index_of(&self, id: &str) -> Option<RegisterIndex> {
        let index = self.descriptors.iter().position(|d| d.id == id);
        index.map(RegisterIndex)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegisterIndex, &'static RegisterDescriptor)> {
        self.descriptors.iter().enumerate().map(|(n, d)| (RegisterIndex(n), d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = Catalog::new().expect("built-in catalog must construct");
        assert_eq!(catalog.len(), DESCRIPTORS.len());
    }

    const fn plain(id: &'static str, kind: RawKind, offset: u8) -> RegisterDescriptor {
        RegisterDescriptor {
            id,
            access: Access::R_,
            kind,
            offset,
            command: &[0x31, 0x00, 0xFA, 0x01, 0x22],
            channel: DEFAULT_CHANNEL,
            poll: None,
            bounds: None,
            map: None,
            codec: None,
            updates: &[],
        }
    }

    #[test]
    fn rejects_window_past_payload_end() {
        static BAD: &[RegisterDescriptor] = &[plain("bad", RawKind::U16, 6)];
        assert_eq!(
            Catalog::from_descriptors(BAD),
            Err(ConfigError::WindowOutOfBounds("bad", 6, 2))
        );
        static EDGE: &[RegisterDescriptor] = &[plain("edge", RawKind::U16, 5)];
        assert!(Catalog::from_descriptors(EDGE).is_ok());
    }

    #[test]
    fn rejects_non_positive_divider() {
        const ZERO: RawKind = RawKind { size: 2, signed: false, divider: 0.0 };
        static BAD: &[RegisterDescriptor] = &[plain("bad", ZERO, 5)];
        assert_eq!(
            Catalog::from_descriptors(BAD),
            Err(ConfigError::NonPositiveDivider("bad"))
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        static BAD: &[RegisterDescriptor] =
            &[plain("twice", RawKind::U8, 5), plain("twice", RawKind::U8, 6)];
        assert_eq!(
            Catalog::from_descriptors(BAD),
            Err(ConfigError::DuplicateId("twice"))
        );
    }

    #[test]
    fn reply_pattern_echoes_long_form_address() {
        let catalog = Catalog::new().unwrap();
        let tv = catalog.index_of("tv").unwrap();
        let pattern = catalog.reply_pattern(tv);
        assert!(pattern.matches(&[0x32, 0x10, 0xFA, 0xC0, 0xFC, 0x01, 0xC2]));
        // A different register's answer must not correlate.
        assert!(!pattern.matches(&[0x32, 0x10, 0xFA, 0xC0, 0xFE, 0x01, 0xC2]));
        // Neither must an unrelated request echo.
        assert!(!pattern.matches(&[0x31, 0x00, 0xFA, 0xC0, 0xFC, 0x00, 0x00]));
    }

    #[test]
    fn reply_pattern_echoes_short_form_register() {
        let catalog = Catalog::new().unwrap();
        let pressure = catalog.index_of("water_pressure").unwrap();
        let pattern = catalog.reply_pattern(pressure);
        assert!(pattern.matches(&[0x32, 0x10, 0x1C, 0x03, 0xE8, 0x00, 0x00]));
        assert!(!pattern.matches(&[0x32, 0x10, 0x02, 0x03, 0xE8, 0x00, 0x00]));
    }

    #[test]
    fn write_frame_clears_opcode_bit() {
        let catalog = Catalog::new().unwrap();
        let mode = catalog.index_of("operating_mode").unwrap();
        let frame = catalog.get(mode).write_frame();
        assert_eq!(frame, [0x30, 0x00, 0xFA, 0x01, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn map_lookups_are_inverses() {
        let catalog = Catalog::new().unwrap();
        let mode = catalog.get(catalog.index_of("operating_mode").unwrap());
        assert_eq!(mode.label_for(0x05), Some("summer"));
        assert_eq!(mode.code_for("summer"), Some(0x05));
        assert_eq!(mode.label_for(0x02), None);
    }
}
