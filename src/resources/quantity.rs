//! Kubernetes resource quantity parsing.
//!
//! `k8s_openapi` models quantities as opaque strings. Comparing a desired
//! limit against a request needs their numeric value, so quantities are
//! parsed into an exact integer count of nano-units.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

use crate::controller::error::Error;
use crate::crd::ReplsetResources;

/// Resource names the operator manages.
pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const STORAGE: &str = "storage";

const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// Errors produced while parsing a quantity string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {input:?}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

impl From<QuantityError> for Error {
    fn from(e: QuantityError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A parsed quantity, stored as nano-units so `1Gi == 1024Mi` and `0.5 == 500m`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParsedQuantity(i128);

impl ParsedQuantity {
    pub const ZERO: ParsedQuantity = ParsedQuantity(0);

    /// Parse a quantity string.
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, s.get(1..).unwrap_or_default()),
            Some(b'+') => (false, s.get(1..).unwrap_or_default()),
            _ => (false, s),
        };

        let number_end = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, suffix) = body.split_at(number_end);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }
        if frac_part.contains('.') {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }

        let overflow = || QuantityError::Overflow(input.to_string());

        let digits = format!("{}{}", int_part, frac_part);
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;

        let (binary_shift, decimal_exp) = parse_suffix(suffix).ok_or_else(|| {
            QuantityError::UnknownSuffix {
                input: input.to_string(),
                suffix: suffix.to_string(),
            }
        })?;

        let frac_len = i32::try_from(frac_part.len()).map_err(|_| overflow())?;
        // value = mantissa * 10^(9 + exp - frac_len) * 2^shift
        let scale = 9i32
            .checked_add(decimal_exp)
            .and_then(|s| s.checked_sub(frac_len))
            .ok_or_else(overflow)?;
        let mut nanos = mantissa
            .checked_mul(1i128 << binary_shift)
            .ok_or_else(overflow)?;
        if scale >= 0 {
            let factor = 10i128.checked_pow(scale as u32).ok_or_else(overflow)?;
            nanos = nanos.checked_mul(factor).ok_or_else(overflow)?;
        } else {
            let divisor = 10i128.checked_pow(scale.unsigned_abs()).ok_or_else(overflow)?;
            // Sub-nano precision rounds up, like the API server does
            let whole = nanos / divisor;
            nanos = if nanos % divisor == 0 { whole } else { whole + 1 };
        }

        Ok(ParsedQuantity(if negative { -nanos } else { nanos }))
    }

    /// Parse an optional platform quantity; absent means zero.
    pub fn from_quantity(q: Option<&Quantity>) -> Result<Self, QuantityError> {
        match q {
            Some(q) => Self::parse(&q.0),
            None => Ok(Self::ZERO),
        }
    }

    /// Value in whole units as a float (bytes for memory, cores for cpu).
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_UNIT as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for ParsedQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}n", self.0)
    }
}

/// Map a suffix to (power-of-two shift, power-of-ten exponent).
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let known = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        _ => {
            // Decimal exponent form: 1e3, 2E-2
            let rest = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            let exp: i32 = rest.parse().ok()?;
            return Some((0, exp));
        }
    };
    Some(known)
}

/// Compare two optional quantities numerically. Absent compares as zero.
pub fn compare(a: Option<&Quantity>, b: Option<&Quantity>) -> Result<Ordering, QuantityError> {
    Ok(ParsedQuantity::from_quantity(a)?.cmp(&ParsedQuantity::from_quantity(b)?))
}

/// Parse the declared requests and limits into platform resource requirements.
///
/// Every declared quantity is validated; a bad string is a configuration
/// error for the whole replica set.
pub fn resource_requirements(spec: &ReplsetResources) -> Result<ResourceRequirements, Error> {
    let mut requests = BTreeMap::new();
    insert_parsed(&mut requests, CPU, spec.requests.cpu.as_deref())?;
    insert_parsed(&mut requests, MEMORY, spec.requests.memory.as_deref())?;

    let mut limits = BTreeMap::new();
    insert_parsed(&mut limits, CPU, spec.limits.cpu.as_deref())?;
    insert_parsed(&mut limits, MEMORY, spec.limits.memory.as_deref())?;
    ParsedQuantity::parse(&spec.limits.storage).map_err(|e| {
        Error::Config(format!(
            "wrong volume size value {:?}: {}",
            spec.limits.storage, e
        ))
    })?;
    limits.insert(STORAGE.to_string(), Quantity(spec.limits.storage.clone()));

    Ok(ResourceRequirements {
        requests: if requests.is_empty() { None } else { Some(requests) },
        limits: Some(limits),
        ..Default::default()
    })
}

fn insert_parsed(
    map: &mut BTreeMap<String, Quantity>,
    name: &str,
    value: Option<&str>,
) -> Result<(), Error> {
    if let Some(value) = value {
        ParsedQuantity::parse(value)
            .map_err(|e| Error::Config(format!("invalid {} quantity {:?}: {}", name, value, e)))?;
        map.insert(name.to_string(), Quantity(value.to_string()));
    }
    Ok(())
}
