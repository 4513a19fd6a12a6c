//! vCard 4.0 record engine.
//!
//! Implements the `cardbox-core` engine and handle contracts for `.vcf` /
//! `.vcard` files: CRLF-strict parsing with logical-line unfolding,
//! structural validation against the fixed vCard 4.0 property set, field
//! access and mutation, and serialization back to disk.

use std::fmt;
use std::fs;
use std::path::Path;

use cardbox_core::{CardboxError, RecordEngine, RecordHandle};

/// File extensions the engine recognizes, compared case-insensitively.
const RECORD_EXTENSIONS: [&str; 2] = ["vcf", "vcard"];

/// Property names a card may carry. `VERSION` is deliberately absent: the
/// version line is card framing, not a property.
const VALID_PROPERTY_NAMES: [&str; 14] = [
    "FN",
    "N",
    "BDAY",
    "ANNIVERSARY",
    "GENDER",
    "LANG",
    "ORG",
    "ADR",
    "TEL",
    "EMAIL",
    "GEO",
    "KEY",
    "TZ",
    "URL",
];

/// Properties whose values serialize `;`-joined and padded to five
/// components.
const STRUCTURED_PROPERTY_NAMES: [&str; 2] = ["N", "ADR"];

/// A `BDAY` or `ANNIVERSARY` value.
///
/// vCard 4.0 allows both structured timestamps and free-form text dates
/// (`VALUE=text`). Timestamps keep their raw `YYYYMMDD` / `hhmmss` parts;
/// nothing here interprets them as calendar dates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DateValue {
    Text(String),
    Timestamp {
        date: String,
        time: String,
        utc: bool,
    },
}

impl DateValue {
    /// Splits a raw timestamp value on the first `T`, with a trailing `Z`
    /// marking UTC.
    fn timestamp(raw: &str) -> Self {
        let (body, utc) = match raw.strip_suffix('Z') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let (date, time) = match body.split_once('T') {
            Some((date, time)) => (date.to_string(), time.to_string()),
            None => (body.to_string(), String::new()),
        };
        Self::Timestamp { date, time, utc }
    }

    /// Classifies caller input: empty clears the field, a
    /// `YYYYMMDD[Thhmmss][Z]` shape becomes a timestamp, and anything else
    /// is kept as a text date.
    fn from_input(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }
        if is_timestamp_shaped(value) {
            return Some(Self::timestamp(value));
        }
        Some(Self::Text(value.to_string()))
    }

    /// The property line tail, starting at the parameter section.
    fn property_suffix(&self) -> String {
        match self {
            Self::Text(text) => format!(";VALUE=text:{text}"),
            Self::Timestamp { .. } => format!(":{self}"),
        }
    }
}

impl fmt::Display for DateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Timestamp { date, time, utc } => {
                f.write_str(date)?;
                if !time.is_empty() {
                    write!(f, "T{time}")?;
                }
                if *utc {
                    f.write_str("Z")?;
                }
                Ok(())
            }
        }
    }
}

fn is_timestamp_shaped(value: &str) -> bool {
    let body = value.strip_suffix('Z').unwrap_or(value);
    match body.split_once('T') {
        Some((date, time)) => is_fixed_digits(date, 8) && is_fixed_digits(time, 6),
        None => is_fixed_digits(body, 8),
    }
}

fn is_fixed_digits(part: &str, len: usize) -> bool {
    part.len() == len && part.bytes().all(|byte| byte.is_ascii_digit())
}

/// A `NAME=VALUE` property parameter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

/// Any property besides the framing lines, `FN`, `BDAY`, and `ANNIVERSARY`.
///
/// The group prefix is kept for inspection but never written back out.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExtraProperty {
    pub group: String,
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub values: Vec<String>,
}

impl ExtraProperty {
    fn to_line(&self) -> String {
        let mut line = self.name.clone();
        for parameter in &self.parameters {
            line.push(';');
            line.push_str(&parameter.name);
            line.push('=');
            line.push_str(&parameter.value);
        }
        line.push(':');
        line.push_str(&self.joined_values());
        line
    }

    fn joined_values(&self) -> String {
        let mut escaped: Vec<String> = self
            .values
            .iter()
            .map(|value| value.replace(';', "\\;"))
            .collect();
        if STRUCTURED_PROPERTY_NAMES.contains(&self.name.as_str()) {
            while escaped.len() < 5 {
                escaped.push(String::new());
            }
            escaped.join(";")
        } else {
            escaped.join(",")
        }
    }
}

/// One parsed vCard 4.0 record.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct VCard {
    display_name: String,
    birthday: Option<DateValue>,
    anniversary: Option<DateValue>,
    extras: Vec<ExtraProperty>,
}

impl VCard {
    /// Reads and parses a card file.
    ///
    /// # Errors
    ///
    /// Returns [`CardboxError::Parse`] when the path does not carry a
    /// `.vcf`/`.vcard` extension, the file cannot be read, or the content
    /// is structurally malformed.
    pub fn from_path(path: &Path) -> Result<Self, CardboxError> {
        if !has_record_extension(path) {
            return Err(CardboxError::Parse(format!(
                "not a .vcf or .vcard file: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).map_err(|err| {
            CardboxError::Parse(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_text(&raw)
    }

    /// Parses card text.
    ///
    /// # Errors
    ///
    /// Returns [`CardboxError::Parse`] for CRLF violations, missing framing
    /// lines, malformed property lines, or a missing or empty `FN`.
    pub fn from_text(raw: &str) -> Result<Self, CardboxError> {
        let lines = unfold(raw)?;
        Self::from_logical_lines(&lines)
    }

    /// The extra properties in file order.
    #[must_use]
    pub fn extras(&self) -> &[ExtraProperty] {
        &self.extras
    }

    /// Renders the card as vCard text, CRLF line endings included.
    #[must_use]
    pub fn to_vcf_string(&self) -> String {
        let mut lines = vec![
            "BEGIN:VCARD".to_string(),
            "VERSION:4.0".to_string(),
            format!("FN:{}", self.display_name),
        ];
        if let Some(birthday) = &self.birthday {
            lines.push(format!("BDAY{}", birthday.property_suffix()));
        }
        if let Some(anniversary) = &self.anniversary {
            lines.push(format!("ANNIVERSARY{}", anniversary.property_suffix()));
        }
        for extra in &self.extras {
            lines.push(extra.to_line());
        }
        lines.push("END:VCARD".to_string());
        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        text
    }

    fn from_logical_lines(lines: &[String]) -> Result<Self, CardboxError> {
        let mut begin_seen = false;
        let mut version_seen = false;
        let mut end_seen = false;
        let mut display_name: Option<String> = None;
        let mut birthday: Option<DateValue> = None;
        let mut anniversary: Option<DateValue> = None;
        let mut extras: Vec<ExtraProperty> = Vec::new();

        for line in lines {
            match line.as_str() {
                "BEGIN:VCARD" => {
                    begin_seen = true;
                    continue;
                }
                "VERSION:4.0" => {
                    version_seen = true;
                    continue;
                }
                "END:VCARD" => {
                    end_seen = true;
                    continue;
                }
                _ => {}
            }

            let PropertyLine {
                group,
                name,
                parameters,
                raw_value,
            } = split_property_line(line)?;
            match name.as_str() {
                "FN" => {
                    if raw_value.is_empty() {
                        return Err(CardboxError::Parse("FN value is empty".to_string()));
                    }
                    // The first FN wins; repeats are dropped.
                    if display_name.is_none() {
                        display_name = Some(raw_value);
                    }
                }
                "BDAY" => {
                    if birthday.is_some() {
                        return Err(CardboxError::Parse(
                            "BDAY appears more than once".to_string(),
                        ));
                    }
                    birthday = Some(date_property(&parameters, &raw_value));
                }
                "ANNIVERSARY" => {
                    if anniversary.is_some() {
                        return Err(CardboxError::Parse(
                            "ANNIVERSARY appears more than once".to_string(),
                        ));
                    }
                    anniversary = Some(date_property(&parameters, &raw_value));
                }
                _ => {
                    let values = split_values(&raw_value);
                    extras.push(ExtraProperty {
                        group,
                        name,
                        parameters,
                        values,
                    });
                }
            }
        }

        if !begin_seen || !end_seen {
            return Err(CardboxError::Parse(
                "card is not delimited by BEGIN:VCARD and END:VCARD".to_string(),
            ));
        }
        if !version_seen {
            return Err(CardboxError::Parse(
                "card does not declare VERSION:4.0".to_string(),
            ));
        }
        let Some(display_name) = display_name else {
            return Err(CardboxError::Parse("card has no FN property".to_string()));
        };

        Ok(Self {
            display_name,
            birthday,
            anniversary,
            extras,
        })
    }
}

struct PropertyLine {
    group: String,
    name: String,
    parameters: Vec<Parameter>,
    raw_value: String,
}

/// Splits one logical line into group, name, parameters, and the raw value
/// after the first `:`.
fn split_property_line(line: &str) -> Result<PropertyLine, CardboxError> {
    if line.starts_with([':', ';']) {
        return Err(CardboxError::Parse(format!(
            "property line has no name: {line}"
        )));
    }
    let Some((head, raw_value)) = line.split_once(':') else {
        return Err(CardboxError::Parse(format!(
            "property line has no colon: {line}"
        )));
    };
    let (name_region, params_region) = match head.split_once(';') {
        Some((name_region, params_region)) => (name_region, Some(params_region)),
        None => (head, None),
    };
    let (group, name) = match name_region.split_once('.') {
        Some((group, name)) => (group.to_string(), name.to_string()),
        None => (String::new(), name_region.to_string()),
    };
    if name.is_empty() {
        return Err(CardboxError::Parse(format!(
            "property has an empty name: {line}"
        )));
    }

    let mut parameters = Vec::new();
    if let Some(params_region) = params_region {
        // An empty parameter section (`NAME;:v`) is tolerated.
        if !params_region.is_empty() {
            for raw in params_region.split(';') {
                let Some((param_name, param_value)) = raw.split_once('=') else {
                    return Err(CardboxError::Parse(format!(
                        "parameter is not NAME=VALUE: {raw}"
                    )));
                };
                if param_name.is_empty() || param_value.is_empty() {
                    return Err(CardboxError::Parse(format!(
                        "parameter has an empty name or value: {raw}"
                    )));
                }
                parameters.push(Parameter {
                    name: param_name.to_string(),
                    value: param_value.to_string(),
                });
            }
        }
    }

    Ok(PropertyLine {
        group,
        name,
        parameters,
        raw_value: raw_value.to_string(),
    })
}

fn date_property(parameters: &[Parameter], raw_value: &str) -> DateValue {
    let is_text = parameters
        .iter()
        .any(|parameter| parameter.name == "VALUE" && parameter.value == "text");
    if is_text {
        DateValue::Text(raw_value.to_string())
    } else {
        DateValue::timestamp(raw_value)
    }
}

/// Rebuilds logical lines: every physical line must end with CRLF, and a
/// leading space or tab continues the previous logical line.
fn unfold(raw: &str) -> Result<Vec<String>, CardboxError> {
    let mut logical: Vec<String> = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let Some(newline) = rest.find('\n') else {
            return Err(CardboxError::Parse(
                "last line is not CRLF-terminated".to_string(),
            ));
        };
        let physical = &rest[..newline];
        rest = &rest[newline + 1..];
        let Some(physical) = physical.strip_suffix('\r') else {
            return Err(CardboxError::Parse("line endings must be CRLF".to_string()));
        };
        match (physical.strip_prefix([' ', '\t']), logical.last_mut()) {
            (Some(continuation), Some(previous)) => previous.push_str(continuation),
            // A continuation with nothing to continue starts its own line.
            (Some(continuation), None) => logical.push(continuation.to_string()),
            (None, _) => logical.push(physical.to_string()),
        }
    }
    Ok(logical)
}

/// Splits a property value on unescaped `;`. `\;` is a literal semicolon.
/// A trailing separator does not open a final empty value.
fn split_values(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' && chars.peek() == Some(&';') {
            chars.next();
            current.push(';');
        } else if ch == ';' {
            values.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    values
}

fn has_record_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            RECORD_EXTENSIONS
                .iter()
                .any(|allowed| extension.eq_ignore_ascii_case(allowed))
        })
}

/// Stateless [`RecordEngine`] over vCard files.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcfEngine;

impl RecordEngine for VcfEngine {
    type Handle = VCard;

    fn parse(&self, path: &Path) -> Result<VCard, CardboxError> {
        VCard::from_path(path)
    }

    fn new_record(&self) -> VCard {
        VCard::default()
    }

    fn is_record_file(&self, path: &Path) -> bool {
        has_record_extension(path)
    }
}

impl RecordHandle for VCard {
    fn validate(&self) -> Result<(), CardboxError> {
        if self.display_name.is_empty() {
            return Err(CardboxError::Validation(
                "card has no display name".to_string(),
            ));
        }
        let mut n_seen = false;
        for extra in &self.extras {
            match extra.name.as_str() {
                "VERSION" => {
                    return Err(CardboxError::Validation(
                        "VERSION is only allowed as the version line".to_string(),
                    ));
                }
                "BDAY" | "ANNIVERSARY" => {
                    return Err(CardboxError::Validation(format!(
                        "{} is only allowed as a date property",
                        extra.name
                    )));
                }
                name if !VALID_PROPERTY_NAMES.contains(&name) => {
                    return Err(CardboxError::Validation(format!(
                        "unknown property name: {name}"
                    )));
                }
                _ => {}
            }
            if extra.values.is_empty() {
                return Err(CardboxError::Validation(format!(
                    "property {} has no values",
                    extra.name
                )));
            }
            for parameter in &extra.parameters {
                if parameter.name.is_empty() || parameter.value.is_empty() {
                    return Err(CardboxError::Validation(format!(
                        "property {} has a blank parameter",
                        extra.name
                    )));
                }
            }
            if extra.name == "N" {
                if n_seen {
                    return Err(CardboxError::Validation(
                        "N appears more than once".to_string(),
                    ));
                }
                n_seen = true;
                if extra.values.len() != 5 {
                    return Err(CardboxError::Validation(format!(
                        "N must have exactly five components, found {}",
                        extra.values.len()
                    )));
                }
            }
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn birthday(&self) -> String {
        self.birthday
            .as_ref()
            .map_or_else(String::new, ToString::to_string)
    }

    fn anniversary(&self) -> String {
        self.anniversary
            .as_ref()
            .map_or_else(String::new, ToString::to_string)
    }

    fn optional_field_count(&self) -> usize {
        self.extras.len()
    }

    fn set_display_name(&mut self, value: &str) -> Result<(), CardboxError> {
        if value.is_empty() {
            return Err(CardboxError::Validation(
                "display name must not be empty".to_string(),
            ));
        }
        self.display_name = value.to_string();
        Ok(())
    }

    fn set_birthday(&mut self, value: &str) -> Result<(), CardboxError> {
        self.birthday = DateValue::from_input(value);
        Ok(())
    }

    fn set_anniversary(&mut self, value: &str) -> Result<(), CardboxError> {
        self.anniversary = DateValue::from_input(value);
        Ok(())
    }

    fn serialize(&self, path: &Path) -> Result<(), CardboxError> {
        if !has_record_extension(path) {
            return Err(CardboxError::Io(format!(
                "refusing to write a card to {}: not a .vcf or .vcard path",
                path.display()
            )));
        }
        fs::write(path, self.to_vcf_string())
            .map_err(|err| CardboxError::Io(format!("failed to write {}: {err}", path.display())))
    }
}
