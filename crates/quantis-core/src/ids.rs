use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A traded instrument identifier, e.g. `"BTC-USDT"`.
///
/// Cheap to clone (interned small-string) since it is threaded through
/// every tick, observation, hypothesis, and signal in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(SmolStr);

impl Instrument {
    pub fn new(s: impl Into<SmolStr>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self(SmolStr::new(s))
    }
}

impl From<String> for Instrument {
    fn from(s: String) -> Self {
        Self(SmolStr::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_equality() {
        let a = Instrument::from("BTC-USDT");
        let b = Instrument::new("BTC-USDT");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "BTC-USDT");
    }
}
