//! RTM wire types.
//!
//! RTM's JSON is nested and inconsistently typed: single-element containers
//! collapse to bare objects, empty collections appear as `[]`, `""` or are
//! absent, and booleans are the strings `"0"`/`"1"`.  The deserializers in
//! this module absorb that drift so shape surprises degrade to logged
//! warnings instead of failed requests.

use chrono::{DateTime, Utc};
use serde::de::IntoDeserializer;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Outer envelope: every RTM response is `{"rsp": {...}}`.
#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct RtmResponse<T> {
    pub rsp: T,
}

/// The `stat` field of the envelope.
#[derive(Deserialize, Debug, Eq, PartialEq, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Stat {
    Ok,
    Fail,
}

/// Just the status half of the envelope, parsed before any method payload
/// so `stat="fail"` surfaces uniformly.
#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct RspStatus {
    pub stat: Stat,
    #[serde(default)]
    pub err: Option<RtmErr>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct RtmErr {
    #[serde(default, deserialize_with = "lenient_error_code")]
    pub code: i32,
    #[serde(default)]
    pub msg: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct FrobResponse {
    pub frob: String,
}

#[derive(Deserialize, Debug, Eq, PartialEq, Clone)]
pub(crate) struct WireUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub fullname: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct AuthBlock {
    pub token: String,
    pub user: WireUser,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct AuthResponse {
    pub auth: AuthBlock,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TimelineResponse {
    pub timeline: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TasksResponse {
    pub tasks: TaskContainer,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TaskContainer {
    #[serde(default)]
    pub list: Vec<TaskListEntry>,
}

/// One list's worth of task series in a tasks response.
#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TaskListEntry {
    pub id: String,
    pub taskseries: Option<Vec<WireTaskSeries>>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct WireTaskSeries {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub location_id: String,
    #[serde(default, deserialize_with = "deser_tags")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "deser_notes")]
    pub notes: Vec<WireNote>,
    #[serde(default, deserialize_with = "deser_rrule")]
    pub rrule: Option<WireRrule>,
    #[serde(default)]
    pub task: Vec<WireTask>,
}

/// A task instance within a series.
#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct WireTask {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flag_bool")]
    pub has_due_time: bool,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub completed: Option<DateTime<Utc>>,
    /// Non-empty when the instance has been deleted; such instances are
    /// skipped during normalisation.
    #[serde(default)]
    pub deleted: String,
    #[serde(default, deserialize_with = "deser_priority")]
    pub priority: u8,
    #[serde(default, deserialize_with = "lenient_count")]
    pub postponed: u32,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub estimate: Option<String>,
}

#[derive(Deserialize, Debug, Eq, PartialEq, Clone)]
pub(crate) struct WireNote {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "$t")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub created: Option<DateTime<Utc>>,
}

/// Recurrence rule.  Presence is recorded; the rule text is not interpreted.
#[derive(Deserialize, Debug, Eq, PartialEq, Clone, Default)]
pub(crate) struct WireRrule {
    #[serde(default, deserialize_with = "flag_bool")]
    pub every: bool,
    #[serde(default, rename = "$t")]
    pub rule: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct ListsResponse {
    pub lists: ListContainer,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct ListContainer {
    #[serde(default)]
    pub list: Vec<WireList>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct WireList {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "flag_bool")]
    pub deleted: bool,
    #[serde(default, deserialize_with = "flag_bool")]
    pub locked: bool,
    #[serde(default, deserialize_with = "flag_bool")]
    pub archived: bool,
    #[serde(default, deserialize_with = "lenient_position")]
    pub position: i32,
    #[serde(default, deserialize_with = "flag_bool")]
    pub smart: bool,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TagsResponse {
    pub tags: TagContainer,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct TagContainer {
    #[serde(default, deserialize_with = "deser_tag_items")]
    pub tag: Vec<String>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct SettingsResponse {
    pub settings: WireSettings,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct WireSettings {
    #[serde(default)]
    pub timezone: String,
    /// `"1"` when the account uses American (month first) dates.
    #[serde(default, deserialize_with = "flag_bool")]
    pub dateformat: bool,
    /// `"1"` when the account uses 24-hour time.
    #[serde(default, deserialize_with = "flag_bool")]
    pub timeformat: bool,
    #[serde(default)]
    pub defaultlist: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub defaultduedate: String,
    #[serde(default, deserialize_with = "flag_bool")]
    pub pro: bool,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct LocationsResponse {
    pub locations: LocationContainer,
}

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct LocationContainer {
    #[serde(default)]
    pub location: Vec<WireLocation>,
}

#[derive(Deserialize, Debug, Eq, PartialEq)]
pub(crate) struct WireLocation {
    pub id: String,
    pub name: String,
}

/// Response shape shared by the write methods (`tasks.add`,
/// `tasks.complete`, `tasks.delete`, `tasks.setDueDate`, `tasks.addTags`).
/// The transaction id RTM returns alongside is ignored; undo is not
/// supported here.
#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct WriteResponse {
    #[serde(default)]
    pub list: Option<TaskListEntry>,
}

// Thanks to https://github.com/serde-rs/serde/issues/1425#issuecomment-462282398
pub(crate) fn empty_string_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<String>::deserialize(de)?;
    let opt = opt.as_deref();
    match opt {
        None | Some("") => Ok(None),
        Some(s) => T::deserialize(s.into_deserializer()).map(Some),
    }
}

/// ISO 8601 timestamp, tolerating absent, null and empty values.  A value
/// that fails to parse is logged and dropped; it never aborts the request.
fn lenient_datetime<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(match raw.as_deref() {
        None | Some("") => None,
        Some(s) => match s.parse::<DateTime<Utc>>() {
            Ok(dt) => Some(dt),
            Err(err) => {
                log::warn!("unparseable RTM timestamp {s:?}: {err}");
                None
            }
        },
    })
}

/// RTM boolean: `"1"`/`"0"` strings, occasionally real booleans or numbers.
fn flag_bool<'de, D>(de: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::String(s) => s == "1",
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    })
}

/// Priority is `"N"` or `"1"`..`"3"`; anything else warns and maps to none.
fn deser_priority<'de, D>(de: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(match raw.as_deref() {
        None | Some("") | Some("N") => 0,
        Some("1") => 1,
        Some("2") => 2,
        Some("3") => 3,
        Some(other) => {
            log::warn!("unrecognised task priority {other:?}, treating as none");
            0
        }
    })
}

/// RTM error codes arrive as strings; tolerate numbers too.  An
/// unrecognisable code maps to -1 rather than failing the error parse.
fn lenient_error_code<'de, D>(de: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::String(s) => s.parse().unwrap_or(-1),
        Value::Number(n) => n.as_i64().unwrap_or(-1) as i32,
        _ => -1,
    })
}

/// Small counter sent as a string (`postponed`).
fn lenient_count<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

/// List position; a string that occasionally goes negative.
fn lenient_position<'de, D>(de: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().unwrap_or(0) as i32,
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagSer {
    List(Vec<()>),
    Tags { tag: Vec<String> },
}

/// Tags arrive as `{"tag": [...]}` when present and `[]` when empty.
fn deser_tags<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match TagSer::deserialize(de) {
        Err(e) => Err(e),
        Ok(TagSer::List(_)) => Ok(vec![]),
        Ok(TagSer::Tags { tag }) => Ok(tag),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Notes appear as `{"note": [...]}`, `{"note": {...}}`, a bare array,
/// `""`, null, or not at all.  The object shape is attempted first, then
/// the bare array; anything else is logged and treated as no notes.
fn deser_notes<'de, D>(de: D) -> Result<Vec<WireNote>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(notes_from_value(value))
}

fn notes_from_value(value: Value) -> Vec<WireNote> {
    match value {
        Value::Null => vec![],
        Value::String(s) => {
            if !s.is_empty() {
                log::warn!("unexpected string in notes field: {s:?}");
            }
            vec![]
        }
        Value::Object(ref map) => match map.get("note") {
            Some(inner) => match serde_json::from_value::<OneOrMany<WireNote>>(inner.clone()) {
                Ok(notes) => notes.into_vec(),
                Err(err) => {
                    log::warn!("unparseable notes object: {err}");
                    vec![]
                }
            },
            None if map.is_empty() => vec![],
            None => {
                log::warn!("notes object without a note field");
                vec![]
            }
        },
        Value::Array(_) => match serde_json::from_value::<Vec<WireNote>>(value) {
            Ok(notes) => notes,
            Err(err) => {
                log::warn!("unparseable notes array: {err}");
                vec![]
            }
        },
        other => {
            log::warn!("unexpected notes shape: {other}");
            vec![]
        }
    }
}

/// Recurrence rules drift between a string, an object, null and `""`.  The
/// placeholder keeps new shapes from failing the parse.
fn deser_rrule<'de, D>(de: D) -> Result<Option<WireRrule>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::Null => None,
        Value::String(s) => {
            if s.is_empty() {
                None
            } else {
                Some(WireRrule {
                    every: false,
                    rule: s,
                })
            }
        }
        Value::Object(_) => match serde_json::from_value::<WireRrule>(value) {
            Ok(rule) => Some(rule),
            Err(err) => {
                log::warn!("unparseable recurrence rule: {err}");
                Some(WireRrule::default())
            }
        },
        other => {
            log::warn!("unexpected recurrence rule shape: {other}");
            Some(WireRrule::default())
        }
    })
}

/// Tag listing entries are either `{"name": "..."}` objects or bare strings.
fn deser_tag_items<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagItem {
        Named { name: String },
        Plain(String),
    }

    let items = Vec::<TagItem>::deserialize(de)?;
    Ok(items
        .into_iter()
        .map(|item| match item {
            TagItem::Named { name } => name,
            TagItem::Plain(name) => name,
        })
        .collect())
}
