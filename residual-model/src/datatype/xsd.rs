//! XML Schema Part 2 datatypes: lexical-to-value conversion, value equality and
//! (partial) ordering for the primitive and derived types this crate ships.

use super::{
    Comparison, Datatype, DatatypeName, DatatypeRef, Namespaces, Value, collapse_whitespace,
    replace_whitespace,
};
use crate::error::DatatypeError;
use bigdecimal::BigDecimal;
use chrono::Datelike;
use lazy_static::lazy_static;
use num_bigint::BigInt;
use std::cmp::Ordering;
use std::str::FromStr;

pub const NAMESPACE_URI: &str = "http://www.w3.org/2001/XMLSchema-datatypes";

const SECONDS_PER_DAY: i64 = 86_400;
/// Widest timezone offset, used when ordering zoned against unzoned values.
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

lazy_static! {
    static ref INTEGER_RE: regex::Regex = regex::Regex::new(r"^[+-]?[0-9]+$").unwrap();
    static ref DECIMAL_RE: regex::Regex =
        regex::Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)$").unwrap();
    static ref DOUBLE_RE: regex::Regex =
        regex::Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+-]?[0-9]+)?$").unwrap();
    static ref DATE_RE: regex::Regex =
        regex::Regex::new(r"^(-?[0-9]{4,})-([0-9]{2})-([0-9]{2})(Z|[+-][0-9]{2}:[0-9]{2})?$")
            .unwrap();
    static ref DURATION_RE: regex::Regex = regex::Regex::new(
        r"^(-)?P(?:([0-9]+)Y)?(?:([0-9]+)M)?(?:([0-9]+)D)?(?:T(?:([0-9]+)H)?(?:([0-9]+)M)?(?:([0-9]+(?:\.[0-9]+)?)S)?)?$"
    )
    .unwrap();
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum XsdKind {
    String,
    NormalizedString,
    Token,
    Boolean,
    Integer,
    NonNegativeInteger,
    PositiveInteger,
    Int,
    Decimal,
    Double,
    Date,
    Duration,
    NcName,
    QName,
    AnyUri,
}

impl XsdKind {
    pub const ALL: [XsdKind; 15] = [
        XsdKind::String,
        XsdKind::NormalizedString,
        XsdKind::Token,
        XsdKind::Boolean,
        XsdKind::Integer,
        XsdKind::NonNegativeInteger,
        XsdKind::PositiveInteger,
        XsdKind::Int,
        XsdKind::Decimal,
        XsdKind::Double,
        XsdKind::Date,
        XsdKind::Duration,
        XsdKind::NcName,
        XsdKind::QName,
        XsdKind::AnyUri,
    ];

    pub fn local_name(self) -> &'static str {
        match self {
            XsdKind::String => "string",
            XsdKind::NormalizedString => "normalizedString",
            XsdKind::Token => "token",
            XsdKind::Boolean => "boolean",
            XsdKind::Integer => "integer",
            XsdKind::NonNegativeInteger => "nonNegativeInteger",
            XsdKind::PositiveInteger => "positiveInteger",
            XsdKind::Int => "int",
            XsdKind::Decimal => "decimal",
            XsdKind::Double => "double",
            XsdKind::Date => "date",
            XsdKind::Duration => "duration",
            XsdKind::NcName => "NCName",
            XsdKind::QName => "QName",
            XsdKind::AnyUri => "anyURI",
        }
    }

    fn is_ordered(self) -> bool {
        matches!(
            self,
            XsdKind::Integer
                | XsdKind::NonNegativeInteger
                | XsdKind::PositiveInteger
                | XsdKind::Int
                | XsdKind::Decimal
                | XsdKind::Double
                | XsdKind::Date
                | XsdKind::Duration
        )
    }
}

#[derive(Debug)]
pub struct XsdType {
    name: DatatypeName,
    kind: XsdKind,
}

impl XsdType {
    pub fn new(kind: XsdKind) -> XsdType {
        XsdType {
            name: DatatypeName::new(NAMESPACE_URI, kind.local_name()),
            kind,
        }
    }

    pub fn kind(&self) -> XsdKind {
        self.kind
    }
}

impl Datatype for XsdType {
    fn name(&self) -> &DatatypeName {
        &self.name
    }

    fn convert(&self, lexical: &str, ns: &dyn Namespaces) -> Option<Value> {
        match self.kind {
            XsdKind::String => Some(Value::String(lexical.to_string())),
            XsdKind::NormalizedString => Some(Value::String(replace_whitespace(lexical))),
            XsdKind::Token => Some(Value::String(collapse_whitespace(lexical))),
            XsdKind::Boolean => match collapse_whitespace(lexical).as_str() {
                "true" | "1" => Some(Value::Boolean(true)),
                "false" | "0" => Some(Value::Boolean(false)),
                _ => None,
            },
            XsdKind::Integer => parse_integer(lexical).map(Value::Integer),
            XsdKind::NonNegativeInteger => parse_integer(lexical)
                .filter(|i| *i >= BigInt::from(0))
                .map(Value::Integer),
            XsdKind::PositiveInteger => parse_integer(lexical)
                .filter(|i| *i > BigInt::from(0))
                .map(Value::Integer),
            XsdKind::Int => parse_integer(lexical)
                .filter(|i| i32::try_from(i).is_ok())
                .map(Value::Integer),
            XsdKind::Decimal => parse_decimal(lexical).map(Value::Decimal),
            XsdKind::Double => parse_double(lexical).map(Value::Double),
            XsdKind::Date => DateValue::parse(lexical).map(Value::Date),
            XsdKind::Duration => DurationValue::parse(lexical).map(Value::Duration),
            XsdKind::NcName => {
                let name = collapse_whitespace(lexical);
                is_ncname(&name).then_some(Value::String(name))
            }
            XsdKind::QName => parse_qname(&collapse_whitespace(lexical), ns),
            XsdKind::AnyUri => {
                let uri = collapse_whitespace(lexical);
                is_uri_escaping_valid(&uri).then_some(Value::String(uri))
            }
        }
    }

    fn value_equals(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            // NaN is equal to itself in the value space.
            (Value::Double(x), Value::Double(y)) => x == y || (x.is_nan() && y.is_nan()),
            _ => a == b,
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> Option<Comparison> {
        if !self.kind.is_ordered() {
            return None;
        }
        Some(compare_values(a, b))
    }
}

fn from_ordering(ordering: Ordering) -> Comparison {
    match ordering {
        Ordering::Less => Comparison::Less,
        Ordering::Equal => Comparison::Equal,
        Ordering::Greater => Comparison::Greater,
    }
}

fn compare_values(a: &Value, b: &Value) -> Comparison {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => from_ordering(x.cmp(y)),
        (Value::Decimal(x), Value::Decimal(y)) => from_ordering(x.cmp(y)),
        (Value::Double(x), Value::Double(y)) => x
            .partial_cmp(y)
            .map(from_ordering)
            .unwrap_or(Comparison::Undecidable),
        (Value::Date(x), Value::Date(y)) => x.compare(y),
        (Value::Duration(x), Value::Duration(y)) => x.compare(y),
        _ => Comparison::Undecidable,
    }
}

fn parse_integer(lexical: &str) -> Option<BigInt> {
    let text = collapse_whitespace(lexical);
    if !INTEGER_RE.is_match(&text) {
        return None;
    }
    BigInt::from_str(text.strip_prefix('+').unwrap_or(&text)).ok()
}

fn parse_decimal(lexical: &str) -> Option<BigDecimal> {
    let text = collapse_whitespace(lexical);
    if !DECIMAL_RE.is_match(&text) {
        return None;
    }
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.strip_prefix('+').unwrap_or(&text)),
    };
    let mut normal = format!("{sign}{}{digits}", if digits.starts_with('.') { "0" } else { "" });
    if normal.ends_with('.') {
        normal.push('0');
    }
    BigDecimal::from_str(&normal).ok()
}

fn parse_double(lexical: &str) -> Option<f64> {
    let text = collapse_whitespace(lexical);
    match text.as_str() {
        "INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ if DOUBLE_RE.is_match(&text) => text.parse().ok(),
        _ => None,
    }
}

fn parse_qname(text: &str, ns: &dyn Namespaces) -> Option<Value> {
    let (namespace_uri, local_name) = match text.split_once(':') {
        Some((prefix, local)) => {
            if !is_ncname(prefix) || !is_ncname(local) {
                return None;
            }
            (ns.resolve(prefix)?, local)
        }
        None => {
            if !is_ncname(text) {
                return None;
            }
            (ns.resolve("").unwrap_or(""), text)
        }
    };
    Some(Value::QName {
        namespace_uri: namespace_uri.to_string(),
        local_name: local_name.to_string(),
    })
}

fn is_uri_escaping_valid(uri: &str) -> bool {
    let bytes = uri.as_bytes();
    bytes.iter().enumerate().all(|(i, b)| {
        *b != b'%'
            || (i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit())
    })
}

fn is_name_start_char(c: char) -> bool {
    matches!(c,
        'A'..='Z' | '_' | 'a'..='z'
        | '\u{C0}'..='\u{D6}' | '\u{D8}'..='\u{F6}' | '\u{F8}'..='\u{2FF}'
        | '\u{370}'..='\u{37D}' | '\u{37F}'..='\u{1FFF}' | '\u{200C}'..='\u{200D}'
        | '\u{2070}'..='\u{218F}' | '\u{2C00}'..='\u{2FEF}' | '\u{3001}'..='\u{D7FF}'
        | '\u{F900}'..='\u{FDCF}' | '\u{FDF0}'..='\u{FFFD}' | '\u{10000}'..='\u{EFFFF}')
}

fn is_name_char(c: char) -> bool {
    is_name_start_char(c)
        || matches!(c,
            '-' | '.' | '0'..='9' | '\u{B7}' | '\u{300}'..='\u{36F}' | '\u{203F}'..='\u{2040}')
}

/// An XML name without a colon.
pub fn is_ncname(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => is_name_start_char(first) && chars.all(is_name_char),
        None => false,
    }
}

/// An `xsd:date`, held as its day count and optional timezone offset.
#[derive(Clone, Debug)]
pub struct DateValue {
    pub date: chrono::NaiveDate,
    pub offset_minutes: Option<i32>,
}

impl DateValue {
    fn parse(lexical: &str) -> Option<DateValue> {
        let text = collapse_whitespace(lexical);
        let caps = DATE_RE.captures(&text)?;
        let year: i32 = caps[1].parse().ok()?;
        if year == 0 {
            return None;
        }
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
        let offset_minutes = match caps.get(4).map(|m| m.as_str()) {
            None => None,
            Some("Z") => Some(0),
            Some(tz) => {
                let hours: i32 = tz[1..3].parse().ok()?;
                let minutes: i32 = tz[4..6].parse().ok()?;
                if minutes >= 60 || hours > 14 || (hours == 14 && minutes != 0) {
                    return None;
                }
                let offset = hours * 60 + minutes;
                Some(if tz.starts_with('-') { -offset } else { offset })
            }
        };
        Some(DateValue {
            date,
            offset_minutes,
        })
    }

    /// Minutes since the common era of local midnight, shifted to UTC when zoned.
    fn instant(&self) -> i64 {
        let local = i64::from(self.date.num_days_from_ce()) * 24 * 60;
        local - i64::from(self.offset_minutes.unwrap_or(0))
    }

    pub fn compare(&self, other: &DateValue) -> Comparison {
        match (self.offset_minutes, other.offset_minutes) {
            (Some(_), Some(_)) | (None, None) => from_ordering(self.instant().cmp(&other.instant())),
            (None, Some(_)) => unzoned_against(self.instant(), other.instant()),
            (Some(_), None) => match unzoned_against(other.instant(), self.instant()) {
                Comparison::Less => Comparison::Greater,
                Comparison::Greater => Comparison::Less,
                c => c,
            },
        }
    }
}

/// Orders an unzoned instant against a zoned one: decidable only when every
/// possible offset gives the same answer.
fn unzoned_against(unzoned: i64, zoned: i64) -> Comparison {
    if unzoned + MAX_OFFSET_MINUTES < zoned {
        Comparison::Less
    } else if unzoned - MAX_OFFSET_MINUTES > zoned {
        Comparison::Greater
    } else {
        Comparison::Undecidable
    }
}

impl PartialEq for DateValue {
    fn eq(&self, other: &DateValue) -> bool {
        self.compare(other) == Comparison::Equal
    }
}

/// An `xsd:duration` split into its month and second components, which are
/// not convertible into one another.
#[derive(PartialEq, Clone, Debug)]
pub struct DurationValue {
    pub months: BigInt,
    pub seconds: BigDecimal,
}

impl DurationValue {
    fn parse(lexical: &str) -> Option<DurationValue> {
        let text = collapse_whitespace(lexical);
        let caps = DURATION_RE.captures(&text)?;
        if (2..=7).all(|i| caps.get(i).is_none()) {
            return None;
        }
        if text.contains('T') && (5..=7).all(|i| caps.get(i).is_none()) {
            return None;
        }
        let int = |i: usize| -> Option<BigInt> {
            caps.get(i)
                .map_or(Some(BigInt::from(0)), |m| BigInt::from_str(m.as_str()).ok())
        };
        let seconds_part = caps
            .get(7)
            .map_or(Some(BigDecimal::from(0)), |m| BigDecimal::from_str(m.as_str()).ok())?;
        let months: BigInt = int(2)? * 12 + int(3)?;
        let whole_seconds =
            int(4)? * SECONDS_PER_DAY + int(5)? * 3600 + int(6)? * 60;
        let seconds = BigDecimal::new(whole_seconds, 0) + seconds_part;
        Some(if caps.get(1).is_some() {
            DurationValue {
                months: -months,
                seconds: -seconds,
            }
        } else {
            DurationValue { months, seconds }
        })
    }

    /// Months span 28 to 31 days; the order is only known when every month
    /// length agrees.
    pub fn compare(&self, other: &DurationValue) -> Comparison {
        let months = &self.months - &other.months;
        let seconds = &self.seconds - &other.seconds;
        if months == BigInt::from(0) {
            return from_ordering(seconds.cmp(&BigDecimal::from(0)));
        }
        let short = BigDecimal::new(&months * 28 * SECONDS_PER_DAY, 0) + &seconds;
        let long = BigDecimal::new(&months * 31 * SECONDS_PER_DAY, 0) + &seconds;
        let (low, high) = if short <= long { (short, long) } else { (long, short) };
        let zero = BigDecimal::from(0);
        if low > zero {
            Comparison::Greater
        } else if high < zero {
            Comparison::Less
        } else {
            Comparison::Undecidable
        }
    }
}

#[derive(Debug)]
struct Bound {
    value: Value,
    inclusive: bool,
}

/// A base type restricted to a value range. Values whose position against a
/// bound is undecidable are rejected.
#[derive(Debug)]
pub struct RangeType {
    name: DatatypeName,
    base: DatatypeRef,
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl RangeType {
    pub fn new(name: DatatypeName, base: DatatypeRef) -> RangeType {
        RangeType {
            name,
            base,
            lower: None,
            upper: None,
        }
    }

    pub fn min_inclusive(self, lexical: &str) -> Result<RangeType, DatatypeError> {
        self.bounded(lexical, true, true)
    }

    pub fn min_exclusive(self, lexical: &str) -> Result<RangeType, DatatypeError> {
        self.bounded(lexical, true, false)
    }

    pub fn max_inclusive(self, lexical: &str) -> Result<RangeType, DatatypeError> {
        self.bounded(lexical, false, true)
    }

    pub fn max_exclusive(self, lexical: &str) -> Result<RangeType, DatatypeError> {
        self.bounded(lexical, false, false)
    }

    fn bounded(mut self, lexical: &str, lower: bool, inclusive: bool) -> Result<RangeType, DatatypeError> {
        let value = self
            .base
            .convert(lexical, &super::NoNamespaces)
            .ok_or_else(|| DatatypeError::InvalidLiteral {
                datatype: self.base.name().to_string(),
                literal: lexical.to_string(),
            })?;
        let bound = Some(Bound { value, inclusive });
        if lower {
            self.lower = bound;
        } else {
            self.upper = bound;
        }
        Ok(self)
    }

    fn within(&self, value: &Value) -> bool {
        let above = self.lower.as_ref().is_none_or(|b| {
            matches!(
                (self.base.compare(value, &b.value), b.inclusive),
                (Some(Comparison::Greater), _) | (Some(Comparison::Equal), true)
            )
        });
        let below = self.upper.as_ref().is_none_or(|b| {
            matches!(
                (self.base.compare(value, &b.value), b.inclusive),
                (Some(Comparison::Less), _) | (Some(Comparison::Equal), true)
            )
        });
        above && below
    }
}

impl Datatype for RangeType {
    fn name(&self) -> &DatatypeName {
        &self.name
    }

    fn convert(&self, lexical: &str, ns: &dyn Namespaces) -> Option<Value> {
        self.base.convert(lexical, ns).filter(|v| self.within(v))
    }

    fn value_equals(&self, a: &Value, b: &Value) -> bool {
        self.base.value_equals(a, b)
    }

    fn compare(&self, a: &Value, b: &Value) -> Option<Comparison> {
        self.base.compare(a, b)
    }
}

/// A whitespace-separated list of `item` values.
#[derive(Debug)]
pub struct ListType {
    name: DatatypeName,
    item: DatatypeRef,
}

impl ListType {
    pub fn new(name: DatatypeName, item: DatatypeRef) -> ListType {
        ListType { name, item }
    }
}

impl Datatype for ListType {
    fn name(&self) -> &DatatypeName {
        &self.name
    }

    fn convert(&self, lexical: &str, ns: &dyn Namespaces) -> Option<Value> {
        lexical
            .split_ascii_whitespace()
            .map(|token| self.item.convert(token, ns))
            .collect::<Option<Vec<_>>>()
            .map(Value::List)
    }

    fn value_equals(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| self.item.value_equals(x, y))
            }
            _ => false,
        }
    }
}

pub(crate) fn builtins() -> Vec<DatatypeRef> {
    XsdKind::ALL
        .iter()
        .map(|kind| DatatypeRef::new(XsdType::new(*kind)))
        .collect()
}
