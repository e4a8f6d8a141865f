use rivulet_stun::attributes::*;
use rivulet_stun::checks::check_size;
use rivulet_stun::error::Result;
use rivulet_stun::message::*;

const PRIORITY_SIZE: usize = 4;

/// PriorityAttr represents the PRIORITY attribute carried in ICE
/// connectivity checks (RFC 8445 §7.1.1).
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for PriorityAttr {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_PRIORITY)?;
        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}
