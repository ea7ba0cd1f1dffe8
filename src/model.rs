//! Domain objects produced by the response normaliser.
//!
//! RTM identifies a task by a (series, instance) pair; externally this crate
//! joins the pair with an underscore into a single opaque id and splits it
//! back when a write needs the halves separately.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{TaskContainer, TaskListEntry, WireNote};

/// A to-do item, flattened from RTM's list → series → instance nesting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Task {
    /// Stable external identity, `"<seriesID>_<instanceID>"`.
    pub id: String,
    /// Task name.
    pub name: String,
    /// URL attached to the task, if any.
    pub url: String,
    /// Due date, if one is set.
    pub due_date: Option<DateTime<Utc>>,
    /// Start date, if one is set.
    pub start_date: Option<DateTime<Utc>>,
    /// Completion time; `None` for incomplete tasks.
    pub completed_date: Option<DateTime<Utc>>,
    /// Priority 0 (none) to 3.
    pub priority: u8,
    /// How many times the task has been postponed.
    pub postponed: u32,
    /// Time estimate as entered by the user, e.g. `"30 minutes"`.
    pub estimate: Option<String>,
    /// Location id, empty when unset.
    pub location_id: String,
    /// Location name, resolved when a location listing is available.
    pub location_name: String,
    /// Tags attached to the series.
    pub tags: BTreeSet<String>,
    /// Notes in series order.
    pub notes: Vec<Note>,
    /// Owning list id.
    pub list_id: String,
    /// Owning list name, resolved when a list listing is available.
    pub list_name: String,
    /// Whether the due date carries a time of day.
    pub has_due_time: bool,
    /// Whether the instance is complete.
    pub completed: bool,
    /// Whether the series repeats.
    pub recurring: bool,
    /// Series creation time.
    pub created: Option<DateTime<Utc>>,
    /// Series last-modified time.
    pub modified: Option<DateTime<Utc>>,
}

/// A note attached to a task series.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Note {
    /// Note id.
    pub id: String,
    /// Note title; often empty.
    pub title: String,
    /// Note body.
    pub text: String,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
}

/// An RTM list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskList {
    /// List id.
    pub id: String,
    /// List name.
    pub name: String,
    /// Whether the list has been deleted.
    pub deleted: bool,
    /// Whether the list is locked (e.g. Inbox).
    pub locked: bool,
    /// Whether the list is archived.
    pub archived: bool,
    /// Sort position.
    pub position: i32,
    /// Whether this is a smart list.  Smart lists are saved filters and
    /// cannot be the target of task creation.
    pub smart_list: bool,
}

/// A tag; identity is the name itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    /// Tag name.
    pub name: String,
}

/// Account settings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Settings {
    /// Olson timezone name, e.g. `"America/New_York"`.
    pub timezone: String,
    /// Whether dates render month-first.
    pub is_american_date: bool,
    /// Whether times render in 24-hour format.
    pub is_24_hour_time: bool,
    /// Id of the default list, empty when unset.
    pub default_list_id: String,
    /// Account language code.
    pub language: String,
    /// Default due date for new tasks, as configured.
    pub default_due_date: String,
    /// Whether this is a Pro account.
    pub is_pro_account: bool,
}

/// Join a series id and an instance id into the external task id.
pub fn join_task_id(series_id: &str, instance_id: &str) -> String {
    format!("{series_id}_{instance_id}")
}

/// Split an external task id into (series id, instance id).
///
/// Fails unless the id contains exactly one underscore with non-empty text
/// on both sides.
pub fn split_task_id(id: &str) -> Result<(&str, &str)> {
    let mut parts = id.split('_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(series), Some(instance), None) if !series.is_empty() && !instance.is_empty() => {
            Ok((series, instance))
        }
        _ => Err(Error::InvalidArguments(format!(
            "task id {id:?} is not of the form <seriesID>_<instanceID>"
        ))),
    }
}

fn note_from_wire(note: WireNote) -> Note {
    Note {
        id: note.id,
        title: note.title,
        text: note.text,
        created_at: note.created,
    }
}

/// Name lookups used while flattening a tasks response.
#[derive(Default)]
pub(crate) struct NameIndex {
    pub lists: HashMap<String, String>,
    pub locations: HashMap<String, String>,
}

/// Flatten a tasks response into domain tasks.
///
/// Deleted instances are skipped.  Series-level attributes (name, tags,
/// notes, recurrence) repeat onto every instance of the series.
pub(crate) fn flatten_tasks(container: TaskContainer, names: &NameIndex) -> Vec<Task> {
    let mut tasks = Vec::new();
    for entry in container.list {
        flatten_entry(entry, names, &mut tasks);
    }
    tasks
}

pub(crate) fn flatten_entry(entry: TaskListEntry, names: &NameIndex, out: &mut Vec<Task>) {
    let list_id = entry.id;
    let list_name = names.lists.get(&list_id).cloned().unwrap_or_default();
    for series in entry.taskseries.unwrap_or_default() {
        let tags: BTreeSet<String> = series.tags.iter().cloned().collect();
        let notes: Vec<Note> = series.notes.iter().cloned().map(note_from_wire).collect();
        let location_name = names
            .locations
            .get(&series.location_id)
            .cloned()
            .unwrap_or_default();
        for instance in &series.task {
            if !instance.deleted.is_empty() {
                log::debug!(
                    "skipping deleted task instance {}_{}",
                    series.id,
                    instance.id
                );
                continue;
            }
            out.push(Task {
                id: join_task_id(&series.id, &instance.id),
                name: series.name.clone(),
                url: series.url.clone(),
                due_date: instance.due,
                start_date: instance.start,
                completed_date: instance.completed,
                priority: instance.priority,
                postponed: instance.postponed,
                estimate: instance.estimate.clone(),
                location_id: series.location_id.clone(),
                location_name: location_name.clone(),
                tags: tags.clone(),
                notes: notes.clone(),
                list_id: list_id.clone(),
                list_name: list_name.clone(),
                has_due_time: instance.has_due_time,
                completed: instance.completed.is_some(),
                recurring: series.rrule.is_some(),
                created: series.created,
                modified: series.modified,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trip() {
        let id = join_task_id("123456", "789");
        assert_eq!(id, "123456_789");
        assert_eq!(split_task_id(&id).unwrap(), ("123456", "789"));
    }

    #[test]
    fn split_rejects_malformed_ids() {
        for bad in ["", "123", "_789", "123_", "1_2_3"] {
            assert!(
                matches!(split_task_id(bad), Err(Error::InvalidArguments(_))),
                "expected rejection of {bad:?}"
            );
        }
    }
}
