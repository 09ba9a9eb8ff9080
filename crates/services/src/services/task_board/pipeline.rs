//! Filter and sort stage.
//!
//! [`apply`] is pure: the same working set and query always give the same
//! ordered output. Debouncing and last-writer-wins publication live in the
//! board, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    identity::Identity,
    model::{Priority, TaskRecord, TaskStatus},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Is(TaskStatus),
    /// Anything except the given status, e.g. "not completed".
    IsNot(TaskStatus),
}

impl StatusFilter {
    fn matches(&self, status: &TaskStatus) -> bool {
        match self {
            StatusFilter::Is(wanted) => status == wanted,
            StatusFilter::IsNot(excluded) => status != excluded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub assigned_by: Option<String>,
    pub status: Option<StatusFilter>,
    pub department: Option<String>,
    pub code: Option<String>,
    pub due_before: Option<DateTime<Utc>>,
}

/// A single criterion update; `None` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    Priority(Option<Priority>),
    Assignee(Option<String>),
    AssignedBy(Option<String>),
    Status(Option<StatusFilter>),
    Department(Option<String>),
    Code(Option<String>),
    DueBefore(Option<DateTime<Utc>>),
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl FilterCriteria {
    /// Returns whether the criteria actually changed.
    pub fn set(&mut self, criterion: Criterion) -> bool {
        let before = self.clone();
        match criterion {
            Criterion::Priority(v) => self.priority = v,
            Criterion::Assignee(v) => self.assignee = non_blank(v),
            Criterion::AssignedBy(v) => self.assigned_by = non_blank(v),
            Criterion::Status(v) => self.status = v,
            Criterion::Department(v) => self.department = non_blank(v),
            Criterion::Code(v) => self.code = non_blank(v),
            Criterion::DueBefore(v) => self.due_before = v,
        }
        *self != before
    }

    pub fn is_empty(&self) -> bool {
        *self == FilterCriteria::default()
    }

    fn matches(&self, task: &TaskRecord) -> bool {
        if let Some(priority) = self.priority
            && task.priority != priority
        {
            return false;
        }
        if let Some(assignee) = blank_to_none(&self.assignee)
            && !task.is_assigned_to(assignee)
        {
            return false;
        }
        if let Some(assigned_by) = blank_to_none(&self.assigned_by)
            && !(task.assigned_by.name.eq_ignore_ascii_case(assigned_by)
                || task.assigned_by.email.eq_ignore_ascii_case(assigned_by))
        {
            return false;
        }
        if let Some(status) = &self.status
            && !status.matches(&task.status)
        {
            return false;
        }
        if let Some(department) = blank_to_none(&self.department)
            && !task.has_department(department)
        {
            return false;
        }
        if let Some(code) = blank_to_none(&self.code)
            && !contains_ignore_case(&task.code, code)
        {
            return false;
        }
        if let Some(due_before) = self.due_before
            && task.due_sort_key() > due_before
        {
            return false;
        }
        true
    }
}

/// Everything the pipeline reads besides the records themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewQuery {
    pub criteria: FilterCriteria,
    pub search_term: String,
    pub hide_completed: bool,
    pub sort_order: SortOrder,
}

fn blank_to_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn matches_search(task: &TaskRecord, term_lower: &str) -> bool {
    let hit = |field: &str| field.to_lowercase().contains(term_lower);
    hit(&task.name)
        || hit(&task.description)
        || hit(&task.code)
        || hit(&task.assigned_by.name)
        || task.assignees.iter().any(|p| hit(&p.name))
}

/// Filter then stable-sort by due date.
///
/// Non-admin callers without an explicit assignee filter only see tasks they
/// are assigned to. Tasks without a due date sort as the epoch.
pub fn apply<'a, I>(
    records: I,
    criteria: &FilterCriteria,
    search_term: &str,
    identity: &Identity,
    hide_completed: bool,
    sort_order: SortOrder,
) -> Vec<TaskRecord>
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    let scope_to_caller = !identity.is_admin() && blank_to_none(&criteria.assignee).is_none();
    let term = search_term.trim().to_lowercase();

    let mut out: Vec<TaskRecord> = records
        .into_iter()
        .filter(|task| !scope_to_caller || caller_is_assignee(task, identity))
        .filter(|task| criteria.matches(task))
        .filter(|task| term.is_empty() || matches_search(task, &term))
        .filter(|task| !hide_completed || !task.status.is_completed())
        .cloned()
        .collect();

    sort_by_due(&mut out, sort_order);
    out
}

pub fn apply_query<'a, I>(records: I, query: &ViewQuery, identity: &Identity) -> Vec<TaskRecord>
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    apply(
        records,
        &query.criteria,
        &query.search_term,
        identity,
        query.hide_completed,
        query.sort_order,
    )
}

pub fn sort_by_due(tasks: &mut [TaskRecord], order: SortOrder) {
    match order {
        SortOrder::Ascending => tasks.sort_by_key(TaskRecord::due_sort_key),
        SortOrder::Descending => tasks.sort_by(|a, b| b.due_sort_key().cmp(&a.due_sort_key())),
    }
}

fn caller_is_assignee(task: &TaskRecord, identity: &Identity) -> bool {
    (!identity.name.is_empty() && task.is_assigned_to(&identity.name))
        || (!identity.email.is_empty() && task.is_assigned_to(&identity.email))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::services::task_board::model::Person;

    fn admin() -> Identity {
        Identity::admin("Root", "root@example.com")
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap()
    }

    fn task(id: &str, priority: Priority, due: Option<u32>) -> TaskRecord {
        let mut task = TaskRecord::new(id, format!("Task {id}"));
        task.priority = priority;
        task.due_date = due.map(at);
        task
    }

    fn ids(tasks: &[TaskRecord]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    fn sample() -> Vec<TaskRecord> {
        let mut a = task("a", Priority::High, Some(10));
        a.assignees = vec![Person::new("Dana", "dana@example.com")];
        a.assigned_by = Person::new("Mina", "mina@example.com");
        a.department = vec!["Tax".into(), "Audit".into()];
        a.code = "GST-R1".into();

        let mut b = task("b", Priority::Low, Some(3));
        b.assignees = vec![Person::new("Ola", "ola@example.com")];
        b.assigned_by = Person::new("Arun", "arun@example.com");
        b.status = TaskStatus::Completed;
        b.department = vec!["Payroll".into()];

        let mut c = task("c", Priority::High, None);
        c.assignees = vec![
            Person::new("Ola", "ola@example.com"),
            Person::new("Dana", "dana@example.com"),
        ];
        c.assigned_by = Person::new("Mina", "mina@example.com");
        c.description = "Reconcile ledger with bank".into();

        let mut d = task("d", Priority::Low, Some(20));
        d.assigned_by = Person::new("Arun", "arun@example.com");
        d.code = "TDS".into();

        let e = task("e", Priority::Low, Some(10));

        vec![a, b, c, d, e]
    }

    #[test]
    fn priority_filter_keeps_only_matching_tier() {
        let records = sample();
        let criteria = FilterCriteria {
            priority: Some(Priority::High),
            ..Default::default()
        };

        let out = apply(&records, &criteria, "", &admin(), false, SortOrder::Ascending);

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|t| t.priority == Priority::High));
    }

    #[test]
    fn standard_users_see_only_their_tasks_without_assignee_filter() {
        let records = sample();
        let dana = Identity::standard("Dana", "dana@example.com");

        let out = apply(
            &records,
            &FilterCriteria::default(),
            "",
            &dana,
            false,
            SortOrder::Ascending,
        );
        assert_eq!(ids(&out), vec!["c", "a"]);

        let criteria = FilterCriteria {
            assignee: Some("Ola".into()),
            ..Default::default()
        };
        let out = apply(&records, &criteria, "", &dana, false, SortOrder::Ascending);
        assert_eq!(ids(&out), vec!["c", "b"]);
    }

    #[test]
    fn not_equal_status_excludes_completed() {
        let records = sample();
        let criteria = FilterCriteria {
            status: Some(StatusFilter::IsNot(TaskStatus::Completed)),
            ..Default::default()
        };

        let out = apply(&records, &criteria, "", &admin(), false, SortOrder::Ascending);
        assert!(!ids(&out).contains(&"b"));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn due_before_is_inclusive() {
        let records = sample();
        let criteria = FilterCriteria {
            due_before: Some(at(10)),
            ..Default::default()
        };

        let out = apply(&records, &criteria, "", &admin(), false, SortOrder::Ascending);
        assert_eq!(ids(&out), vec!["c", "b", "a", "e"]);
    }

    #[test]
    fn department_and_code_filters() {
        let records = sample();
        let criteria = FilterCriteria {
            department: Some("audit".into()),
            code: Some("gst".into()),
            ..Default::default()
        };

        let out = apply(&records, &criteria, "", &admin(), false, SortOrder::Ascending);
        assert_eq!(ids(&out), vec!["a"]);
    }

    #[test]
    fn search_covers_description_and_people() {
        let records = sample();

        let out = apply(
            &records,
            &FilterCriteria::default(),
            "LEDGER",
            &admin(),
            false,
            SortOrder::Ascending,
        );
        assert_eq!(ids(&out), vec!["c"]);

        let out = apply(
            &records,
            &FilterCriteria::default(),
            "arun",
            &admin(),
            false,
            SortOrder::Ascending,
        );
        assert_eq!(ids(&out), vec!["b", "d"]);

        let out = apply(
            &records,
            &FilterCriteria::default(),
            "ola",
            &admin(),
            false,
            SortOrder::Ascending,
        );
        assert_eq!(ids(&out), vec!["c", "b"]);
    }

    #[test]
    fn hide_completed_drops_completed_tasks() {
        let records = sample();
        let out = apply(
            &records,
            &FilterCriteria::default(),
            "",
            &admin(),
            true,
            SortOrder::Ascending,
        );
        assert!(out.iter().all(|t| !t.status.is_completed()));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn sort_is_stable_and_places_undated_first_ascending_last_descending() {
        let records = sample();
        let asc = apply(
            &records,
            &FilterCriteria::default(),
            "",
            &admin(),
            false,
            SortOrder::Ascending,
        );
        assert_eq!(ids(&asc), vec!["c", "b", "a", "e", "d"]);

        let desc = apply(
            &records,
            &FilterCriteria::default(),
            "",
            &admin(),
            false,
            SortOrder::Descending,
        );
        assert_eq!(ids(&desc), vec!["d", "a", "e", "b", "c"]);
    }

    #[test]
    fn resorting_sorted_output_is_a_no_op() {
        let records = sample();
        for order in [SortOrder::Ascending, SortOrder::Descending] {
            let once = apply(&records, &FilterCriteria::default(), "", &admin(), false, order);
            let mut twice = once.clone();
            sort_by_due(&mut twice, order);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn adding_a_criterion_never_grows_the_result() {
        let records = sample();
        let additions = [
            Criterion::Priority(Some(Priority::Low)),
            Criterion::Assignee(Some("Ola".into())),
            Criterion::AssignedBy(Some("Mina".into())),
            Criterion::Status(Some(StatusFilter::Is(TaskStatus::ToDo))),
            Criterion::Department(Some("Tax".into())),
            Criterion::Code(Some("T".into())),
            Criterion::DueBefore(Some(at(5))),
        ];

        let base_sets = [
            FilterCriteria::default(),
            FilterCriteria {
                priority: Some(Priority::High),
                ..Default::default()
            },
            FilterCriteria {
                status: Some(StatusFilter::IsNot(TaskStatus::Completed)),
                ..Default::default()
            },
        ];

        for base in &base_sets {
            let before = apply(&records, base, "", &admin(), false, SortOrder::Ascending).len();
            for addition in &additions {
                let replaces_existing = match addition {
                    Criterion::Priority(_) => base.priority.is_some(),
                    Criterion::Status(_) => base.status.is_some(),
                    _ => false,
                };
                if replaces_existing {
                    continue;
                }
                let mut narrowed = base.clone();
                narrowed.set(addition.clone());
                let after =
                    apply(&records, &narrowed, "", &admin(), false, SortOrder::Ascending).len();
                assert!(after <= before, "{addition:?} grew {base:?}");
            }
        }
    }

    #[test]
    fn blank_criteria_values_are_cleared() {
        let mut criteria = FilterCriteria::default();
        assert!(criteria.set(Criterion::Code(Some("AB".into()))));
        assert!(criteria.set(Criterion::Code(Some("   ".into()))));
        assert!(criteria.is_empty());
        assert!(!criteria.set(Criterion::Department(None)));
    }
}
