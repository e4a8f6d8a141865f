use std::fmt;

/// ParamType is the 16-bit parameter type.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ParamType(pub(crate) u16);

pub(crate) const PT_HEARTBEAT_INFO: ParamType = ParamType(1);
pub(crate) const PT_STATE_COOKIE: ParamType = ParamType(7);

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PT_HEARTBEAT_INFO => write!(f, "Heartbeat Info"),
            PT_STATE_COOKIE => write!(f, "State Cookie"),
            ParamType(other) => write!(f, "Unknown ParamType: {other}"),
        }
    }
}
