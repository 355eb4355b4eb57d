use crate::codec;
use crate::registers::{Catalog, PAYLOAD_LEN, RegisterIndex, Value};

/// A typed write intent coming from the host surface.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteValue {
    Numeric(f64),
    Label(String),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("`{0}` is not a known register")]
    UnknownRegister(String),
    #[error("register `{0}` is read-only")]
    NotWritable(&'static str),
    #[error("register `{0}` takes a {1} write")]
    WrongKind(&'static str, &'static str),
    #[error("{1} is outside the [{2}, {3}] range of register `{0}`")]
    OutOfRange(&'static str, f64, f64, f64),
    #[error("{1} is not a multiple of the {2} step of register `{0}`")]
    OffStep(&'static str, f64, f64),
    #[error("`{1}` is not a selectable label of register `{0}`")]
    UnknownLabel(&'static str, String),
}

/// A validated, encoded write ready for its one-shot transaction.
pub struct PreparedWrite {
    pub register: RegisterIndex,
    pub frame: [u8; PAYLOAD_LEN],
    /// What the register will read back as, applied optimistically once the frame is out.
    pub value: Value,
}

/// Validate a write intent and encode it. State is untouched on failure.
pub fn prepare(
    catalog: &Catalog,
    id: &str,
    value: WriteValue,
) -> Result<PreparedWrite, ValidationError> {
    let register = catalog
        .index_of(id)
        .ok_or_else(|| ValidationError::UnknownRegister(id.to_string()))?;
    let desc = catalog.get(register);
    if !desc.access.is_writable() {
        return Err(ValidationError::NotWritable(desc.id));
    }
    match value {
        WriteValue::Numeric(value) => {
            if desc.map.is_some() {
                return Err(ValidationError::WrongKind(desc.id, "label"));
            }
            if let Some(bounds) = desc.bounds {
                if value < bounds.min || value > bounds.max {
                    return Err(ValidationError::OutOfRange(
                        desc.id, value, bounds.min, bounds.max,
                    ));
                }
                let steps = (value - bounds.min) / bounds.step;
                if (steps - steps.round()).abs() > 1e-6 {
                    return Err(ValidationError::OffStep(desc.id, value, bounds.step));
                }
            }
            Ok(PreparedWrite {
                register,
                frame: codec::encode(desc, value),
                value: Value::Numeric(value),
            })
        }
        WriteValue::Label(label) => {
            if desc.map.is_none() {
                return Err(ValidationError::WrongKind(desc.id, "numeric"));
            }
            let code = desc
                .code_for(&label)
                .ok_or_else(|| ValidationError::UnknownLabel(desc.id, label))?;
            Ok(PreparedWrite {
                register,
                frame: codec::encode(desc, f64::from(code)),
                value: Value::Code(code),
            })
        }
    }
}
