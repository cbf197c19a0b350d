//! Signed resource quantities
//!
//! A `Quantity` is a signed byte (or millicore) count. Arithmetic saturates
//! at the i64 bounds; negative values are legal intermediates (a negative
//! memory reservation target signals broken cgroup accounting and must
//! survive the arithmetic that produced it).

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Binary-SI suffixes, largest first, as used in cgroup and kubelet quantities.
const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

/// A signed quantity of bytes or millicores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn new(value: i64) -> Self {
        Quantity(value)
    }

    pub const fn from_kib(kib: i64) -> Self {
        Quantity(kib.saturating_mul(1 << 10))
    }

    pub const fn from_mib(mib: i64) -> Self {
        Quantity(mib.saturating_mul(1 << 20))
    }

    pub const fn from_gib(gib: i64) -> Self {
        Quantity(gib.saturating_mul(1 << 30))
    }

    pub const fn value(&self) -> i64 {
        self.0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    /// Share of `total`, as a rounded whole percent. Zero when `total` is
    /// zero (a zero capacity has no meaningful percentages).
    pub fn percent_of(&self, total: Quantity) -> i64 {
        if total.0 == 0 {
            return 0;
        }
        ((self.0 as f64 / total.0 as f64) * 100.0).round() as i64
    }

    /// Approximate IEC rendering for tables and log lines, e.g. `7.75Gi`.
    /// Lossy; use `Display` where the value must survive re-parsing.
    pub fn humanize(&self) -> String {
        const KI: f64 = 1024.0;
        const MI: f64 = KI * 1024.0;
        const GI: f64 = MI * 1024.0;
        const TI: f64 = GI * 1024.0;

        let v = self.0 as f64;
        let a = v.abs();
        if a >= TI {
            format!("{:.2}Ti", v / TI)
        } else if a >= GI {
            format!("{:.2}Gi", v / GI)
        } else if a >= MI {
            format!("{:.2}Mi", v / MI)
        } else if a >= KI {
            format!("{:.2}Ki", v / KI)
        } else {
            format!("{}B", self.0)
        }
    }

    /// Decimal-SI millicore rendering, e.g. `1500m`.
    pub fn format_millicores(&self) -> String {
        format!("{}m", self.0)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, other: Quantity) -> Quantity {
        self.saturating_add(other)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, other: Quantity) {
        *self = self.saturating_add(other);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, other: Quantity) -> Quantity {
        self.saturating_sub(other)
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, other: Quantity) {
        *self = self.saturating_sub(other);
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity(self.0.saturating_neg())
    }
}

impl fmt::Display for Quantity {
    /// Lossless binary-SI rendering: the largest suffix that divides the
    /// value exactly, plain decimal digits otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0");
        }
        for (suffix, factor) in BINARY_SUFFIXES {
            if self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

/// Error parsing a quantity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseQuantityError(String);

impl fmt::Display for ParseQuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity {:?}", self.0)
    }
}

impl std::error::Error for ParseQuantityError {}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseQuantityError(s.to_string()));
        }

        let (digits, factor) = match BINARY_SUFFIXES
            .iter()
            .find(|(suffix, _)| s.ends_with(suffix))
        {
            Some((suffix, factor)) => (&s[..s.len() - suffix.len()], *factor),
            None => (s, 1),
        };

        let value: i64 = digits
            .parse()
            .map_err(|_| ParseQuantityError(s.to_string()))?;

        Ok(Quantity(value.saturating_mul(factor)))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct QuantityVisitor;

impl Visitor<'_> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer or a binary-SI quantity string like \"100Mi\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
        v.parse().map_err(de::Error::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
        Ok(Quantity(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
        Ok(Quantity(v.min(i64::MAX as u64) as i64))
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Quantity, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_picks_largest_exact_suffix() {
        assert_eq!(Quantity::from_gib(2).to_string(), "2Gi");
        assert_eq!(Quantity::from_mib(1536).to_string(), "1536Mi");
        assert_eq!(Quantity::from_kib(1).to_string(), "1Ki");
        assert_eq!(Quantity::new(0).to_string(), "0");
        // Odd byte counts stay plain decimal.
        assert_eq!(Quantity::new(5_884_105_195).to_string(), "5884105195");
        assert_eq!(Quantity::from_gib(-2).to_string(), "-2Gi");
    }

    #[test]
    fn test_parse() {
        assert_eq!("100Mi".parse::<Quantity>().unwrap(), Quantity::from_mib(100));
        assert_eq!("1Gi".parse::<Quantity>().unwrap(), Quantity::from_gib(1));
        assert_eq!("0".parse::<Quantity>().unwrap(), Quantity::ZERO);
        assert_eq!("4096".parse::<Quantity>().unwrap(), Quantity::new(4096));
        assert_eq!("-2Gi".parse::<Quantity>().unwrap(), Quantity::from_gib(-2));
        assert!("".parse::<Quantity>().is_err());
        assert!("12Qi".parse::<Quantity>().is_err());
        assert!("Mi".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_round_trip_at_and_above_one_ki() {
        let values = [
            1_024i64,
            1_536,
            4_096,
            1 << 20,
            (1 << 20) + 1,
            1 << 30,
            5_884_105_195,
            13_958_643_711,
            i64::MAX,
        ];
        for v in values {
            let q = Quantity::new(v);
            let reparsed: Quantity = q.to_string().parse().unwrap();
            assert_eq!(reparsed, q, "round trip failed for {}", v);
        }
    }

    #[test]
    fn test_arithmetic_saturates() {
        let max = Quantity::new(i64::MAX);
        assert_eq!(max + Quantity::new(1), max);
        let min = Quantity::new(i64::MIN);
        assert_eq!(min - Quantity::new(1), min);
        assert_eq!(
            Quantity::from_gib(10) - Quantity::from_gib(12),
            Quantity::from_gib(-2)
        );
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(
            Quantity::from_gib(1).percent_of(Quantity::from_gib(10)),
            10
        );
        // Rounds to nearest whole percent.
        assert_eq!(Quantity::new(249).percent_of(Quantity::new(1000)), 25);
        assert_eq!(Quantity::new(1).percent_of(Quantity::ZERO), 0);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(Quantity::from_gib(2).humanize(), "2.00Gi");
        assert_eq!(Quantity::from_mib(1536).humanize(), "1.50Gi");
        assert_eq!(Quantity::new(512).humanize(), "512B");
    }

    #[test]
    fn test_format_millicores() {
        assert_eq!(Quantity::new(1500).format_millicores(), "1500m");
        assert_eq!(Quantity::new(0).format_millicores(), "0m");
    }

    #[test]
    fn test_deserialize_from_string_and_integer() {
        #[derive(Deserialize)]
        struct Holder {
            q: Quantity,
        }
        let from_str: Holder = serde_json::from_str(r#"{"q": "100Mi"}"#).unwrap();
        assert_eq!(from_str.q, Quantity::from_mib(100));
        let from_int: Holder = serde_json::from_str(r#"{"q": 4096}"#).unwrap();
        assert_eq!(from_int.q, Quantity::new(4096));
    }
}
