//! Device feature bits.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Capabilities an endpoint offers. The active set for a session is the
    /// intersection of what the host device offers and the guest requests.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Probe lifecycle events (CREATE, INSTALL, UNINSTALL).
        const PROBE = 1 << 0;
        /// Provider lifecycle events (REGISTER, UNREGISTER, DESTROY).
        const PROV  = 1 << 1;
        /// Negative acknowledgements for requests that failed.
        const NACK  = 1 << 2;
    }
}

impl Features {
    pub fn negotiate(offered: Features, requested: Features) -> Features {
        offered & requested
    }

    pub fn from_toggles(probe: bool, provider: bool, nack: bool) -> Features {
        let mut f = Features::empty();
        f.set(Features::PROBE, probe);
        f.set(Features::PROV, provider);
        f.set(Features::NACK, nack);
        f
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_is_intersection() {
        let offered = Features::PROBE | Features::PROV | Features::NACK;
        let requested = Features::PROBE | Features::NACK;
        assert_eq!(
            Features::negotiate(offered, requested),
            Features::PROBE | Features::NACK
        );
        assert_eq!(
            Features::negotiate(Features::PROV, Features::PROBE),
            Features::empty()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Features::empty().to_string(), "none");
        assert_eq!(Features::from_toggles(true, true, false).to_string(), "PROBE|PROV");
    }
}
