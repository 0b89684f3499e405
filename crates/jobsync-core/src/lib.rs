//! Core domain model for jobsync: source postings, destination rows and the natural key.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobsync-core";

/// Status written when a source posting carries none.
pub const DEFAULT_STATUS: &str = "active";

/// Loosely-typed job posting as read from the document store.
///
/// Every field is optional: the source collection guarantees nothing beyond
/// convention, and absence is meaningful for the defaults applied by
/// [`JobRow::from`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobPosting {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub skills: Option<Vec<String>>,
    pub salary: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub posted_date: Option<String>,
    pub deadline: Option<String>,
    pub status: Option<String>,
    pub email: Option<String>,
}

impl JobPosting {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            title: self.title.clone(),
            company: self.company.clone(),
            posted_date: self.posted_date.clone(),
        }
    }
}

/// Row shape of the destination `jobs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub skills: Vec<String>,
    pub salary: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub posted_date: Option<String>,
    pub deadline: Option<String>,
    pub status: String,
    pub email: Option<String>,
}

impl JobRow {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            title: self.title.clone(),
            company: self.company.clone(),
            posted_date: self.posted_date.clone(),
        }
    }
}

impl From<JobPosting> for JobRow {
    /// Total mapping from source to destination shape. `skills` defaults to an
    /// empty list, `status` to [`DEFAULT_STATUS`]; everything else stays null.
    fn from(posting: JobPosting) -> Self {
        Self {
            title: posting.title,
            company: posting.company,
            location: posting.location,
            description: posting.description,
            skills: posting.skills.unwrap_or_default(),
            salary: posting.salary,
            job_type: posting.job_type,
            posted_date: posting.posted_date,
            deadline: posting.deadline,
            status: posting
                .status
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            email: posting.email,
        }
    }
}

/// Identity of a posting: `(title, company, posted_date)`, compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub title: Option<String>,
    pub company: Option<String>,
    pub posted_date: Option<String>,
}

impl NaturalKey {
    /// True when any component is null. Such keys only match under null-safe lookups.
    pub fn has_nulls(&self) -> bool {
        self.title.is_none() || self.company.is_none() || self.posted_date.is_none()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: &Option<String>| {
            v.as_deref()
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "null".into())
        };
        write!(
            f,
            "({}, {}, {})",
            part(&self.title),
            part(&self.company),
            part(&self.posted_date)
        )
    }
}
