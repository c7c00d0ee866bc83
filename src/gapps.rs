//! Typed identifiers for OpenGApps packages.
//!
//! A package within one release date is keyed by the
//! `(Platform, Android, Variant)` triple. The ordinals are stable: they are
//! the on-disk representation of the cache (the enums serialize as plain
//! numbers, also when used as JSON map keys), so the declaration order here
//! must never change.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Failures while turning user input or artifact names into identifiers.
///
/// The Display texts are part of the contract with the bot layer, which maps
/// each kind onto its localized message.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("'{0}' does not belong to Platform values")]
    Platform(String),
    #[error("'{0}' does not belong to Android values")]
    Android(String),
    #[error("'{0}' does not belong to Variant values")]
    Variant(String),
    #[error("unable to parse time '{0}'")]
    Date(String),
    #[error("bad command format '{0}'")]
    Usage(String),
    #[error("incorrect package name: {0}")]
    Name(String),
    #[error("incorrect package extension: {0}")]
    Extension(String),
}

/// Chip architecture of a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    Arm = 0,
    Arm64 = 1,
    X86 = 2,
    X86_64 = 3,
}

impl Platform {
    /// All platforms in canonical order.
    pub const VALUES: [Platform; 4] = [
        Platform::Arm,
        Platform::Arm64,
        Platform::X86,
        Platform::X86_64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Arm => "arm",
            Platform::Arm64 => "arm64",
            Platform::X86 => "x86",
            Platform::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" => Ok(Platform::Arm),
            "arm64" => Ok(Platform::Arm64),
            "x86" => Ok(Platform::X86),
            "x86_64" => Ok(Platform::X86_64),
            _ => Err(ParseError::Platform(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Platform {
    type Error = ParseError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Platform::VALUES
            .into_iter()
            .find(|p| *p as u8 == n)
            .ok_or_else(|| ParseError::Platform(n.to_string()))
    }
}

/// Android version a package targets.
///
/// The artifact names spell these with a dot (`9.0`); by the time tokens
/// reach the parser the dot is gone (the name parser splits it away, the
/// command parser strips it), so the dotless spelling is accepted as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Android {
    V4_4 = 0,
    V5_0 = 1,
    V5_1 = 2,
    V6_0 = 3,
    V7_0 = 4,
    V7_1 = 5,
    V8_0 = 6,
    V8_1 = 7,
    V9_0 = 8,
}

impl Android {
    /// All versions in ascending order.
    pub const VALUES: [Android; 9] = [
        Android::V4_4,
        Android::V5_0,
        Android::V5_1,
        Android::V6_0,
        Android::V7_0,
        Android::V7_1,
        Android::V8_0,
        Android::V8_1,
        Android::V9_0,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Android::V4_4 => "4.4",
            Android::V5_0 => "5.0",
            Android::V5_1 => "5.1",
            Android::V6_0 => "6.0",
            Android::V7_0 => "7.0",
            Android::V7_1 => "7.1",
            Android::V8_0 => "8.0",
            Android::V8_1 => "8.1",
            Android::V9_0 => "9.0",
        }
    }
}

impl fmt::Display for Android {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Android {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "4.4" | "44" => Ok(Android::V4_4),
            "5.0" | "50" => Ok(Android::V5_0),
            "5.1" | "51" => Ok(Android::V5_1),
            "6.0" | "60" => Ok(Android::V6_0),
            "7.0" | "70" => Ok(Android::V7_0),
            "7.1" | "71" => Ok(Android::V7_1),
            "8.0" | "80" => Ok(Android::V8_0),
            "8.1" | "81" => Ok(Android::V8_1),
            "9.0" | "90" => Ok(Android::V9_0),
            _ => Err(ParseError::Android(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Android {
    type Error = ParseError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Android::VALUES
            .into_iter()
            .find(|a| *a as u8 == n)
            .ok_or_else(|| ParseError::Android(n.to_string()))
    }
}

/// Variant of a package, from the TV build up to the all-in AROMA installer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variant {
    Tvstock = 0,
    Pico = 1,
    Nano = 2,
    Micro = 3,
    Mini = 4,
    Full = 5,
    Stock = 6,
    Super = 7,
    Aroma = 8,
}

impl Variant {
    /// All variants in canonical order.
    pub const VALUES: [Variant; 9] = [
        Variant::Tvstock,
        Variant::Pico,
        Variant::Nano,
        Variant::Micro,
        Variant::Mini,
        Variant::Full,
        Variant::Stock,
        Variant::Super,
        Variant::Aroma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Tvstock => "tvstock",
            Variant::Pico => "pico",
            Variant::Nano => "nano",
            Variant::Micro => "micro",
            Variant::Mini => "mini",
            Variant::Full => "full",
            Variant::Stock => "stock",
            Variant::Super => "super",
            Variant::Aroma => "aroma",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tvstock" => Ok(Variant::Tvstock),
            "pico" => Ok(Variant::Pico),
            "nano" => Ok(Variant::Nano),
            "micro" => Ok(Variant::Micro),
            "mini" => Ok(Variant::Mini),
            "full" => Ok(Variant::Full),
            "stock" => Ok(Variant::Stock),
            "super" => Ok(Variant::Super),
            "aroma" => Ok(Variant::Aroma),
            _ => Err(ParseError::Variant(s.to_string())),
        }
    }
}

impl TryFrom<u8> for Variant {
    type Error = ParseError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Variant::VALUES
            .into_iter()
            .find(|v| *v as u8 == n)
            .ok_or_else(|| ParseError::Variant(n.to_string()))
    }
}

// The enums go over the wire as their ordinals, both as values and as JSON
// map keys, which rules out the derived (variant-name) representation.

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Platform::try_from(u8::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl Serialize for Android {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Android {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Android::try_from(u8::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Variant::try_from(u8::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// Parses the `<platform> <android> <variant>` argument triple.
pub fn parse_package_parts(args: &[&str]) -> Result<(Platform, Android, Variant), ParseError> {
    if args.len() != 3 {
        return Err(ParseError::Usage(args.join(" ")));
    }

    Ok((args[0].parse()?, args[1].parse()?, args[2].parse()?))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn parse_format_round_trip() {
        for platform in Platform::VALUES {
            assert_eq!(platform.to_string().parse::<Platform>().unwrap(), platform);
        }
        for android in Android::VALUES {
            assert_eq!(android.to_string().parse::<Android>().unwrap(), android);
        }
        for variant in Variant::VALUES {
            assert_eq!(variant.to_string().parse::<Variant>().unwrap(), variant);
        }
    }

    #[test]
    fn android_accepts_dotless_tokens() {
        assert_eq!("90".parse::<Android>().unwrap(), Android::V9_0);
        assert_eq!("44".parse::<Android>().unwrap(), Android::V4_4);
    }

    #[test]
    fn unknown_tokens_carry_their_kind() {
        let err = "mips".parse::<Platform>().unwrap_err();
        assert!(err.to_string().contains("does not belong to Platform values"));

        let err = "10.0".parse::<Android>().unwrap_err();
        assert!(err.to_string().contains("does not belong to Android values"));

        let err = "nope".parse::<Variant>().unwrap_err();
        assert!(err.to_string().contains("does not belong to Variant values"));
    }

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(Platform::Arm as u8, 0);
        assert_eq!(Platform::X86_64 as u8, 3);
        assert_eq!(Android::V4_4 as u8, 0);
        assert_eq!(Android::V9_0 as u8, 8);
        assert_eq!(Variant::Tvstock as u8, 0);
        assert_eq!(Variant::Aroma as u8, 8);
    }

    #[test]
    fn serializes_as_ordinal() {
        assert_eq!(serde_json::to_string(&Platform::Arm64).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Android::V9_0).unwrap(), "8");
        assert_eq!(serde_json::to_string(&Variant::Nano).unwrap(), "2");

        let platform: Platform = serde_json::from_str("3").unwrap();
        assert_eq!(platform, Platform::X86_64);
        assert!(serde_json::from_str::<Platform>("9").is_err());
    }

    #[test]
    fn map_keys_round_trip_as_ordinals() {
        let mut map = BTreeMap::new();
        map.insert(Platform::Arm64, "a");
        map.insert(Platform::X86, "b");

        let body = serde_json::to_string(&map).unwrap();
        assert_eq!(body, r#"{"1":"a","2":"b"}"#);

        let back: BTreeMap<Platform, String> = serde_json::from_str(&body).unwrap();
        assert_eq!(back[&Platform::Arm64], "a");
        assert_eq!(back[&Platform::X86], "b");
    }

    #[test]
    fn parses_package_parts() {
        let (platform, android, variant) =
            parse_package_parts(&["arm64", "90", "nano"]).unwrap();
        assert_eq!(platform, Platform::Arm64);
        assert_eq!(android, Android::V9_0);
        assert_eq!(variant, Variant::Nano);

        assert!(matches!(
            parse_package_parts(&["arm64", "90"]),
            Err(ParseError::Usage(_))
        ));
    }
}
