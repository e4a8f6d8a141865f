
use rivulet_stun::attributes::*;
use rivulet_stun::checks::check_size;
use rivulet_stun::error::Result;
use rivulet_stun::message::*;

const TIEBREAKER_SIZE: usize = 8;

/// AttrControlling represents the ICE-CONTROLLING attribute: the agent in
/// the controlling role advertises its 64-bit tiebreaker (RFC 8445 §7.1.3).
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_ICE_CONTROLLING, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for AttrControlling {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ICE_CONTROLLING)?;
        check_size(ATTR_ICE_CONTROLLING, v.len(), TIEBREAKER_SIZE)?;
        self.0 = u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]);
        Ok(())
    }
}

/// AttrControlled represents the ICE-CONTROLLED attribute.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct AttrControlled(pub u64);

impl Setter for AttrControlled {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_ICE_CONTROLLED, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for AttrControlled {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ICE_CONTROLLED)?;
        check_size(ATTR_ICE_CONTROLLED, v.len(), TIEBREAKER_SIZE)?;
        self.0 = u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]);
        Ok(())
    }
}
