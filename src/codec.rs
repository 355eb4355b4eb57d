use crate::registers::{PAYLOAD_LEN, RegisterDescriptor, Value};

/// A per-register replacement for the standard window/sign/divider arithmetic.
///
/// Strategies see the whole payload rather than the decode window, which is what lets them pack
/// several independent bit-flags into one reading. Each one is a named unit so it can be tested
/// on its own instead of living as an inline snippet in the register table.
pub trait CodecStrategy: Sync {
    fn name(&self) -> &'static str;
    /// Extract the engineering value from a reply payload.
    fn decode(&self, payload: &[u8; PAYLOAD_LEN]) -> u16;
    /// Write the engineering value into a prepared write frame.
    fn encode(&self, payload: &mut [u8; PAYLOAD_LEN], value: u16);
}

/// 16-bit quantity transported at a 0x64 scale (`power_ehs_*`, `power_biv`).
pub struct CentiScale;

impl CodecStrategy for CentiScale {
    fn name(&self) -> &'static str {
        "centi_scale"
    }

    fn decode(&self, payload: &[u8; PAYLOAD_LEN]) -> u16 {
        u16::from_be_bytes([payload[5], payload[6]]) / 0x64
    }

    fn encode(&self, payload: &mut [u8; PAYLOAD_LEN], value: u16) {
        let raw = value.saturating_mul(0x64);
        [payload[5], payload[6]] = raw.to_be_bytes();
    }
}

/// Backup heater stage selection packed into three bit-flags, each worth 3 kW.
pub struct BackupHeaterStages;

impl CodecStrategy for BackupHeaterStages {
    fn name(&self) -> &'static str {
        "backup_heater_stages"
    }

    fn decode(&self, payload: &[u8; PAYLOAD_LEN]) -> u16 {
        let flags = payload[5];
        u16::from(flags & 0b0000_1000 != 0) * 3
            + u16::from(flags & 0b0000_0100 != 0) * 3
            + u16::from(flags & 0b0000_0010 != 0) * 3
    }

    fn encode(&self, payload: &mut [u8; PAYLOAD_LEN], value: u16) {
        let mut flags = 0b0000_0001;
        if value >= 3 {
            flags |= 0b0000_1000;
        }
        if value >= 6 {
            flags |= 0b0000_0100;
        }
        if value >= 9 {
            flags |= 0b0000_0010;
        }
        payload[5] = flags;
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("register `{register}` reply carries code {code} which is not in its value map")]
    UnmappedCode { register: &'static str, code: u16 },
}

/// Turn a correlated reply payload into the register's published value.
pub fn decode(
    desc: &RegisterDescriptor,
    payload: &[u8; PAYLOAD_LEN],
) -> Result<Value, DecodeError> {
    let scaled = match desc.codec {
        Some(strategy) => f64::from(strategy.decode(payload)),
        None => f64::from(extract(desc, payload)) / desc.kind.divider(),
    };
    match desc.map {
        None => Ok(Value::Numeric(scaled)),
        Some(_) => {
            let code = scaled.round() as u16;
            if desc.label_for(code).is_none() {
                return Err(DecodeError::UnmappedCode { register: desc.id, code });
            }
            Ok(Value::Code(code))
        }
    }
}

/// Most-significant byte first, sign-extended over the window's 8- or 16-bit width.
fn extract(desc: &RegisterDescriptor, payload: &[u8; PAYLOAD_LEN]) -> i32 {
    let offset = usize::from(desc.offset);
    match (desc.kind.size(), desc.kind.is_signed()) {
        (1, false) => i32::from(payload[offset]),
        (1, true) => i32::from(payload[offset] as i8),
        (_, false) => i32::from(u16::from_be_bytes([payload[offset], payload[offset + 1]])),
        (_, true) => i32::from(i16::from_be_bytes([payload[offset], payload[offset + 1]])),
    }
}

/// Build the write request carrying `engineering`, the inverse of [`decode`].
///
/// For mapped registers the caller passes the raw code already looked up from the label. Bytes
/// outside the decode window keep the command template contents.
pub fn encode(desc: &RegisterDescriptor, engineering: f64) -> [u8; PAYLOAD_LEN] {
    let mut frame = desc.write_frame();
    match desc.codec {
        Some(strategy) => strategy.encode(&mut frame, engineering.round() as u16),
        None => {
            let raw = (engineering * desc.kind.divider()).round() as i64;
            let offset = usize::from(desc.offset);
            match desc.kind.size() {
                1 => frame[offset] = raw as u8,
                _ => [frame[offset], frame[offset + 1]] = (raw as i16 as u16).to_be_bytes(),
            }
        }
    }
    frame
}
