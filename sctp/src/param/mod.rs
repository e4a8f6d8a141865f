pub(crate) mod param_header;
pub(crate) mod param_heartbeat_info;
pub(crate) mod param_state_cookie;
pub(crate) mod param_type;
pub(crate) mod param_unknown;

use std::any::Any;
use std::fmt;

use bytes::{Bytes, BytesMut};
use param_header::*;
use param_type::*;

use crate::error::{Error, Result};

/// A parameter is one type-length-value unit inside a chunk value
/// (RFC 4960 §3.2.1).
pub(crate) trait Param: fmt::Display + fmt::Debug {
    fn header(&self) -> ParamHeader;
    fn unmarshal(raw: &Bytes) -> Result<Self>
    where
        Self: Sized;
    fn marshal_to(&self, buf: &mut BytesMut) -> Result<usize>;
    fn value_length(&self) -> usize;
    fn clone_to(&self) -> Box<dyn Param + Send + Sync>;
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PARAM_HEADER_LENGTH + self.value_length());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl Clone for Box<dyn Param + Send + Sync> {
    fn clone(&self) -> Box<dyn Param + Send + Sync> {
        self.clone_to()
    }
}

/// Decodes the parameter at the start of `raw`, falling back to an opaque
/// carrier for types this stack does not interpret.
pub(crate) fn build_param(raw: &Bytes) -> Result<Box<dyn Param + Send + Sync>> {
    let header = ParamHeader::unmarshal(raw)?;
    match header.typ {
        PT_STATE_COOKIE => Ok(Box::new(param_state_cookie::ParamStateCookie::unmarshal(
            raw,
        )?)),
        PT_HEARTBEAT_INFO => Ok(Box::new(
            param_heartbeat_info::ParamHeartbeatInfo::unmarshal(raw)?,
        )),
        _ => Ok(Box::new(param_unknown::ParamUnknown::unmarshal(raw)?)),
    }
}
