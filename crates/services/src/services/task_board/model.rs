use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[default]
    ToDo,
    InProgress,
    Completed,
    Obsolete,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::ToDo => "ToDo",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Obsolete => "Obsolete",
            TaskStatus::Other(raw) => raw,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Normalise a raw service value. Case, spaces, `_` and `-` are ignored, so
    /// `"in_progress"`, `"In Progress"` and `"inprogress"` all map to `InProgress`.
    pub fn normalize(raw: &str) -> Self {
        let candidate: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();

        match candidate.as_str() {
            "" | "todo" | "pending" | "open" => TaskStatus::ToDo,
            "inprogress" | "started" => TaskStatus::InProgress,
            "completed" | "complete" | "done" => TaskStatus::Completed,
            "obsolete" | "cancelled" | "canceled" => TaskStatus::Obsolete,
            _ => TaskStatus::Other(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskStatus::normalize(s))
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| TaskStatus::normalize(&s)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Priority {
    High,
    Medium,
    #[default]
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" | "urgent" => Some(Priority::High),
            "medium" | "normal" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        };
        f.write_str(label)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(Priority::from_raw).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default, deserialize_with = "de_text")]
    pub name: String,
    #[serde(default, deserialize_with = "de_text")]
    pub email: String,
}

impl Person {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(alias = "_id", deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_text")]
    pub name: String,
    #[serde(default, deserialize_with = "de_text")]
    pub description: String,
    #[serde(default, deserialize_with = "de_text")]
    pub code: String,
    #[serde(default, deserialize_with = "de_lenient_date")]
    pub assigned_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_lenient_date")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, deserialize_with = "de_departments")]
    pub department: Vec<String>,
    #[serde(default, deserialize_with = "de_assignees")]
    pub assignees: Vec<Person>,
    #[serde(default, deserialize_with = "de_person")]
    pub assigned_by: Person,
    #[serde(default, deserialize_with = "de_text")]
    pub remark: String,
    #[serde(default)]
    pub repeating: bool,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            code: String::new(),
            assigned_date: None,
            due_date: None,
            status: TaskStatus::ToDo,
            priority: Priority::default(),
            department: Vec::new(),
            assignees: Vec::new(),
            assigned_by: Person::default(),
            remark: String::new(),
            repeating: false,
        }
    }

    /// Due date with absence mapped to the epoch, the lowest date the sort ever sees.
    pub fn due_sort_key(&self) -> DateTime<Utc> {
        self.due_date.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn is_assigned_to(&self, who: &str) -> bool {
        self.assignees
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(who) || p.email.eq_ignore_ascii_case(who))
    }

    pub fn has_department(&self, department: &str) -> bool {
        self.department
            .iter()
            .any(|d| d.eq_ignore_ascii_case(department))
    }
}

/// Partial update sent to the service and applied optimistically to the local copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn remark(remark: impl Into<String>) -> Self {
        Self {
            remark: Some(remark.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &TaskPatch::default()
    }

    pub fn apply_to(&self, task: &mut TaskRecord) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = &self.status {
            task.status = status.clone();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(remark) = &self.remark {
            task.remark = remark.clone();
        }
        if let Some(due_date) = self.due_date {
            task.due_date = Some(due_date);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub code: String,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Priority,
    #[serde(default)]
    pub department: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<Person>,
    #[serde(default)]
    pub repeating: bool,
}

impl NewTask {
    /// Local stand-in shown until the service confirms the creation.
    pub fn provisional(&self, id: String, assigned_by: Person) -> TaskRecord {
        let mut assignees: Vec<Person> = Vec::with_capacity(self.assignees.len());
        for person in &self.assignees {
            if !assignees
                .iter()
                .any(|p| p.email.eq_ignore_ascii_case(&person.email))
            {
                assignees.push(person.clone());
            }
        }

        TaskRecord {
            id,
            name: self.name.clone(),
            description: self.description.clone(),
            code: self.code.clone(),
            assigned_date: Some(Utc::now()),
            due_date: self.due_date,
            status: TaskStatus::ToDo,
            priority: self.priority,
            department: self.department.clone(),
            assignees,
            assigned_by,
            remark: String::new(),
            repeating: self.repeating,
        }
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

fn de_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Invalid or missing timestamps become `None` instead of failing the record.
fn de_lenient_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => parse_date(&s),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn de_departments<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<Option<String>>),
    }

    let raw = match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v.into_iter().flatten().collect(),
        None => Vec::new(),
    };
    Ok(raw.into_iter().filter(|d| !d.trim().is_empty()).collect())
}

/// Missing list becomes empty; later entries repeating an earlier email are dropped.
fn de_assignees<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Person>, D::Error> {
    let raw = Option::<Vec<Option<Person>>>::deserialize(deserializer)?.unwrap_or_default();
    let mut out: Vec<Person> = Vec::with_capacity(raw.len());
    for person in raw.into_iter().flatten() {
        let duplicate = !person.email.is_empty()
            && out
                .iter()
                .any(|p| p.email.eq_ignore_ascii_case(&person.email));
        if !duplicate {
            out.push(person);
        }
    }
    Ok(out)
}

/// Decode a task list one element at a time. Elements that fail to decode or
/// carry a blank id are logged and skipped so one bad record never loses the list.
pub(crate) fn de_tasks<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<TaskRecord>, D::Error> {
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut tasks = Vec::with_capacity(raw.len());
    for value in raw {
        let task_id = value
            .get("id")
            .or_else(|| value.get("_id"))
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .unwrap_or_default();
        match serde_json::from_value::<TaskRecord>(value) {
            Ok(task) if !task.id.trim().is_empty() => tasks.push(task),
            Ok(_) => tracing::warn!(task_id = %task_id, "skipping task without an id"),
            Err(err) => tracing::warn!(task_id = %task_id, ?err, "skipping malformed task"),
        }
    }
    Ok(tasks)
}

fn de_person<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Person, D::Error> {
    Ok(Option::<Person>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_normalisation_accepts_common_spellings() {
        assert_eq!(TaskStatus::normalize("in_progress"), TaskStatus::InProgress);
        assert_eq!(TaskStatus::normalize("In Progress"), TaskStatus::InProgress);
        assert_eq!(TaskStatus::normalize("to-do"), TaskStatus::ToDo);
        assert_eq!(TaskStatus::normalize("COMPLETED"), TaskStatus::Completed);
        assert_eq!(
            TaskStatus::normalize(" Blocked "),
            TaskStatus::Other("Blocked".to_string())
        );
    }

    #[test]
    fn sparse_record_deserialises_with_safe_defaults() {
        let task: TaskRecord = serde_json::from_value(json!({
            "id": "t-1",
            "name": "Quarterly filing",
            "dueDate": "not a date",
            "assignees": null,
        }))
        .unwrap();

        assert_eq!(task.id, "t-1");
        assert_eq!(task.due_date, None);
        assert_eq!(task.assigned_date, None);
        assert!(task.assignees.is_empty());
        assert!(task.department.is_empty());
        assert_eq!(task.status, TaskStatus::ToDo);
        assert_eq!(task.due_sort_key(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn record_accepts_single_department_and_numeric_id() {
        let task: TaskRecord = serde_json::from_value(json!({
            "_id": 42,
            "name": "Payroll",
            "department": "Finance",
            "priority": "high",
            "status": "done",
            "dueDate": "2024-03-01",
        }))
        .unwrap();

        assert_eq!(task.id, "42");
        assert_eq!(task.department, vec!["Finance".to_string()]);
        assert_eq!(task.priority, Priority::High);
        assert!(task.status.is_completed());
        assert_eq!(task.due_date.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }

    #[test]
    fn null_person_fields_and_department_entries_are_tolerated() {
        let task: TaskRecord = serde_json::from_value(json!({
            "id": "b",
            "assignees": [{"name": "X", "email": null}, null],
            "assignedBy": {"name": null, "email": "boss@example.com"},
            "department": ["Tax", null, " "],
        }))
        .unwrap();

        assert_eq!(task.assignees, vec![Person::new("X", "")]);
        assert_eq!(task.assigned_by.name, "");
        assert_eq!(task.department, vec!["Tax".to_string()]);
    }

    #[test]
    fn duplicate_assignee_emails_are_collapsed() {
        let task: TaskRecord = serde_json::from_value(json!({
            "id": "t-2",
            "assignees": [
                {"name": "Asha", "email": "asha@example.com"},
                {"name": "Asha K", "email": "ASHA@example.com"},
                {"name": "Ben", "email": "ben@example.com"},
            ],
        }))
        .unwrap();

        let names: Vec<_> = task.assignees.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Asha", "Ben"]);
    }

    #[test]
    fn patch_touches_only_named_fields() {
        let mut task = TaskRecord::new("t-3", "Audit");
        task.remark = "waiting on docs".to_string();

        TaskPatch::status(TaskStatus::Completed).apply_to(&mut task);

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.remark, "waiting on docs");
        assert_eq!(task.name, "Audit");
    }

    #[test]
    fn patch_serialises_without_empty_fields() {
        let body = serde_json::to_value(TaskPatch::remark("call client")).unwrap();
        assert_eq!(body, json!({"remark": "call client"}));
    }
}
