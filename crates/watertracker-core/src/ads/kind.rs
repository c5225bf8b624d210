use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical ad placement. Each kind owns exactly one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdKind {
    Native,
    Interstitial,
    Open,
}

/// How a placement reaches the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdFormat {
    /// Rendered by the host UI from returned assets.
    Native,
    /// Presented over the host UI by the provider SDK.
    FullScreen,
}

impl AdKind {
    pub const ALL: [AdKind; 3] = [AdKind::Native, AdKind::Interstitial, AdKind::Open];

    pub fn format(self) -> AdFormat {
        match self {
            AdKind::Native => AdFormat::Native,
            AdKind::Interstitial | AdKind::Open => AdFormat::FullScreen,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdKind::Native => "native",
            AdKind::Interstitial => "interstitial",
            AdKind::Open => "open",
        }
    }
}

impl fmt::Display for AdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(AdKind::Native),
            "interstitial" => Ok(AdKind::Interstitial),
            "open" => Ok(AdKind::Open),
            other => Err(format!("unknown ad kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_screen_kinds() {
        assert_eq!(AdKind::Native.format(), AdFormat::Native);
        assert_eq!(AdKind::Interstitial.format(), AdFormat::FullScreen);
        assert_eq!(AdKind::Open.format(), AdFormat::FullScreen);
    }

    #[test]
    fn parses_and_displays() {
        for kind in AdKind::ALL {
            assert_eq!(kind.to_string().parse::<AdKind>().unwrap(), kind);
        }
        assert_eq!("Interstitial".parse::<AdKind>().unwrap(), AdKind::Interstitial);
        assert!("banner".parse::<AdKind>().is_err());
    }
}
