use std::fmt;

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

const MAX_USERNAME_B: usize = 513;

/// Username represents the USERNAME attribute (RFC 5389 §15.3).
pub type Username = TextAttribute;

/// TextAttribute adds and reads UTF-8 text attributes.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct TextAttribute {
    pub attr: AttrType,
    pub text: String,
}

impl fmt::Display for TextAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl TextAttribute {
    pub fn new(attr: AttrType, text: String) -> Self {
        TextAttribute { attr, text }
    }

    pub fn get_from_as(m: &Message, attr: AttrType) -> Result<Self> {
        let v = m.get(attr)?;
        let text = String::from_utf8(v)
            .map_err(|e| Error::ErrInvalidFormat(format!("{attr} is not UTF-8: {e}")))?;
        Ok(TextAttribute { attr, text })
    }
}

impl Setter for TextAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let max_len = match self.attr {
            ATTR_USERNAME => MAX_USERNAME_B,
            _ => {
                return Err(Error::ErrUnsupportedAttrType(self.attr.value()));
            }
        };
        check_overflow(self.attr, self.text.len(), max_len)?;
        m.add(self.attr, self.text.as_bytes());
        Ok(())
    }
}

impl Getter for TextAttribute {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        *self = TextAttribute::get_from_as(m, self.attr)?;
        Ok(())
    }
}
