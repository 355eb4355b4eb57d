use crate::engine::Config;
use crate::registers::{ConfigError, RegisterDescriptor, Value, ValueState};
use strum::VariantArray as _;
use tracing::debug;

/// Specific heat transported per litre of water, kJ/(L·K).
pub const SPECIFIC_HEAT: f64 = 4.19;

/// Values computed from other registers. Never polled, no decode path of their own.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantArray,
)]
#[strum(serialize_all = "snake_case")]
pub enum DerivedId {
    ThermalPower,
    TemperatureSpread,
    TvTvbhDelta,
    TvbhTrDelta,
    VorlaufSollTvDelta,
    SystemDate,
    SystemTime,
}

impl DerivedId {
    pub fn id(&self) -> &'static str {
        self.into()
    }

    pub fn ordinal(&self) -> usize {
        Self::VARIANTS.iter().position(|v| v == self).unwrap_or(0)
    }

    /// Entities whose values feed this computation. All of them must be known before the value
    /// is published.
    pub fn inputs(&self) -> &'static [&'static str] {
        match self {
            DerivedId::ThermalPower => &["flow_rate", "tv", "tr"],
            DerivedId::TemperatureSpread => &["tv", "tr"],
            DerivedId::TvTvbhDelta => &["tv", "tvbh"],
            DerivedId::TvbhTrDelta => &["tvbh", "tr"],
            DerivedId::VorlaufSollTvDelta => &["target_supply_temperature", "tv"],
            DerivedId::SystemDate => {
                &["system_date_day", "system_date_month", "system_date_year"]
            }
            DerivedId::SystemTime => {
                &["system_time_hour", "system_time_minute", "system_time_second"]
            }
        }
    }
}

/// Check the dependency declarations once, at catalog construction.
///
/// Starting from every derived id wired into a register's `updates` list: each input must name a
/// register of the catalog or another derived value, and derived-of-derived chains must not
/// cycle.
pub fn validate_dependencies(descriptors: &[RegisterDescriptor]) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }
    // Depth-first search over the derived-to-derived edges.
    fn visit(
        id: DerivedId,
        descriptors: &[RegisterDescriptor],
        marks: &mut [Mark],
    ) -> Result<(), ConfigError> {
        match marks[id.ordinal()] {
            Mark::Done => return Ok(()),
            Mark::Visiting => return Err(ConfigError::DerivedCycle(id.id())),
            Mark::New => {}
        }
        marks[id.ordinal()] = Mark::Visiting;
        for input in id.inputs() {
            if let Ok(dependency) = input.parse::<DerivedId>() {
                visit(dependency, descriptors, marks)?;
            } else if !descriptors.iter().any(|d| d.id == *input) {
                return Err(ConfigError::UnknownDerivedInput(id.id(), input));
            }
        }
        marks[id.ordinal()] = Mark::Done;
        Ok(())
    }
    let mut marks = vec![Mark::New; DerivedId::VARIANTS.len()];
    for desc in descriptors {
        for derived in desc.updates {
            visit(*derived, descriptors, &mut marks)?;
        }
    }
    Ok(())
}

/// Recompute one derived value from its inputs.
///
/// Returns `None` while any input is still unknown; the previous published state stays as it
/// was, stale rather than cleared. A spread-guard violation or an impossible date yields
/// `Invalid`: better no number than a misleading one.
pub fn recompute(
    id: DerivedId,
    config: &Config,
    value_of: &dyn Fn(&str) -> Option<f64>,
) -> Option<ValueState> {
    let state = match id {
        DerivedId::ThermalPower => {
            let flow = value_of("flow_rate")?;
            let tv = value_of("tv")? + config.tv_offset;
            let tr = value_of("tr")? + config.tr_offset;
            ValueState::Known(Value::Numeric(flow / 3600.0 * (tv - tr) * SPECIFIC_HEAT))
        }
        DerivedId::TemperatureSpread => {
            let tv = value_of("tv")? + config.tv_offset;
            let tr = value_of("tr")? + config.tr_offset;
            ValueState::Known(Value::Numeric(tv - tr))
        }
        DerivedId::TvTvbhDelta => {
            let tv = value_of("tv")? + config.tv_offset;
            let tvbh = value_of("tvbh")? + config.tvbh_offset;
            spread_guarded(id, tv - tvbh, config.max_spread_tvbh_tv)
        }
        DerivedId::TvbhTrDelta => {
            let tvbh = value_of("tvbh")? + config.tvbh_offset;
            let tr = value_of("tr")? + config.tr_offset;
            spread_guarded(id, tvbh - tr, config.max_spread_tvbh_tr)
        }
        DerivedId::VorlaufSollTvDelta => {
            let target = value_of("target_supply_temperature")?;
            let tv = value_of("tv")? + config.tv_offset;
            ValueState::Known(Value::Numeric(target - tv))
        }
        DerivedId::SystemDate => {
            let day = value_of("system_date_day")?;
            let month = value_of("system_date_month")?;
            let year = value_of("system_date_year")?;
            match jiff::civil::Date::new(2000 + year as i16, month as i8, day as i8) {
                Ok(date) => {
                    ValueState::Known(Value::Text(date.strftime("%d:%m:%Y").to_string()))
                }
                Err(error) => {
                    debug!(
                        derived = id.id(),
                        day, month, year, %error,
                        "registers do not form a real date"
                    );
                    ValueState::Invalid
                }
            }
        }
        DerivedId::SystemTime => {
            let hour = value_of("system_time_hour")?;
            let minute = value_of("system_time_minute")?;
            let second = value_of("system_time_second")?;
            match jiff::civil::Time::new(hour as i8, minute as i8, second as i8, 0) {
                Ok(time) => {
                    ValueState::Known(Value::Text(time.strftime("%H:%M:%S").to_string()))
                }
                Err(error) => {
                    debug!(
                        derived = id.id(),
                        hour, minute, second, %error,
                        "registers do not form a real time of day"
                    );
                    ValueState::Invalid
                }
            }
        }
    };
    Some(state)
}

/// The spread guards exist to catch cross-wired or noisy sensors.
fn spread_guarded(id: DerivedId, delta: f64, max_spread: f64) -> ValueState {
    if delta.abs() > max_spread {
        debug!(derived = id.id(), delta, max_spread, "spread guard tripped, value withheld");
        ValueState::Invalid
    } else {
        ValueState::Known(Value::Numeric(delta))
    }
}
