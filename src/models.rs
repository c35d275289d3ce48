use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Document id of the cached leaderboard inside the weekly submissions
/// collection. Never part of the aggregation input.
pub const GLOBAL_CACHE_DOC: &str = "global";

/// One participant's graded entry for one week.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "weekNo",
        default,
        deserialize_with = "lenient_week",
        skip_serializing_if = "Option::is_none"
    )]
    pub week_no: Option<i64>,
    #[serde(default, deserialize_with = "lenient_score")]
    pub q1_score: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub q2_score: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub q3_score: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub total_score: f64,
}

impl Submission {
    /// The participant key, if the submission carries a usable one.
    pub fn participant_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }

    pub fn question_scores(&self) -> [f64; 3] {
        [self.q1_score, self.q2_score, self.q3_score]
    }
}

/// A document of the weekly submissions collection.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyDocument {
    pub doc_id: String,
    pub users: Vec<Submission>,
}

impl WeeklyDocument {
    /// Reads the `users` array of a stored document body. Entries that are not
    /// submission objects are dropped.
    pub fn from_body(doc_id: impl Into<String>, body: &Value) -> Self {
        let doc_id = doc_id.into();
        let users = body
            .get("users")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| match Submission::deserialize(entry) {
                        Ok(submission) => Some(submission),
                        Err(err) => {
                            tracing::debug!(%doc_id, %err, "dropping unreadable submission");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self { doc_id, users }
    }

    pub fn doc_id_for_week(week_no: i64) -> String {
        format!("week-{week_no}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantAggregate {
    pub email: String,
    pub name: String,
    pub total_points: f64,
    pub brownie_points: f64,
    pub q3_score: f64,
    pub questions_completed: u32,
    pub submitted_weeks: Vec<i64>,
    pub streak: u32,
    pub rank: usize,
}

/// Denormalized user record used by the cached leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub name: String,
    #[serde(default, deserialize_with = "lenient_score")]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub rank: usize,
    pub email: String,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLeaderboard {
    pub entries: Vec<CachedEntry>,
    pub updated_at: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LanguageId(String);

impl<'de> Deserialize<'de> for LanguageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(LanguageId::new)
    }
}

impl LanguageId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Solution {
    PlainText(String),
    PerLanguage(BTreeMap<LanguageId, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Question {
    /// The question as shown during the live quiz.
    pub fn public(&self) -> Self {
        Self {
            solution: None,
            explanation: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Week {
    pub week_no: i64,
    pub title: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    pub questions: Vec<Question>,
}

fn default_visible() -> bool {
    true
}

/// Payload accepted by week creation; the week number is assigned on insert.
#[derive(Debug, Clone, Deserialize)]
pub struct NewWeek {
    pub title: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSheet {
    pub id: Uuid,
    pub week_no: i64,
    pub email: String,
    pub name: String,
    pub answers: Vec<Option<String>>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub photo_url: Option<String>,
}

impl Identity {
    pub fn email_domain(&self) -> Option<&str> {
        self.email.rsplit_once('@').map(|(_, domain)| domain)
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(coerce_score(&Value::deserialize(deserializer)?))
}

fn lenient_week<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(coerce_week(&Value::deserialize(deserializer)?))
}

/// Scores are numbers or numeric strings; everything else, including NaN
/// and negative values, counts as 0.
pub fn coerce_score(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match raw {
        Some(score) if score.is_finite() && score > 0.0 => score,
        _ => 0.0,
    }
}

pub fn coerce_week(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|week| week.is_finite() && week.fract() == 0.0)
                .map(|week| week as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scores_coerce_to_zero_when_unusable() {
        assert_eq!(coerce_score(&json!(4.5)), 4.5);
        assert_eq!(coerce_score(&json!("7")), 7.0);
        assert_eq!(coerce_score(&json!("seven")), 0.0);
        assert_eq!(coerce_score(&json!(null)), 0.0);
        assert_eq!(coerce_score(&json!(true)), 0.0);
        assert_eq!(coerce_score(&json!(-3)), 0.0);
    }

    #[test]
    fn week_numbers_accept_integral_values_only() {
        assert_eq!(coerce_week(&json!(3)), Some(3));
        assert_eq!(coerce_week(&json!(3.0)), Some(3));
        assert_eq!(coerce_week(&json!("4")), Some(4));
        assert_eq!(coerce_week(&json!(2.5)), None);
        assert_eq!(coerce_week(&json!("next")), None);
    }

    #[test]
    fn weekly_document_reads_partial_submissions() {
        let body = json!({
            "users": [
                {
                    "email": "avery@students.example.edu",
                    "name": "Avery",
                    "weekNo": 2,
                    "q1_score": "3",
                    "total_score": 3
                },
                { "name": "No Email", "weekNo": 2, "total_score": 9 },
                42
            ]
        });

        let doc = WeeklyDocument::from_body("week-2", &body);
        assert_eq!(doc.users.len(), 2);
        assert_eq!(doc.users[0].q1_score, 3.0);
        assert_eq!(doc.users[0].q3_score, 0.0);
        assert_eq!(doc.users[1].participant_email(), None);
    }

    #[test]
    fn document_without_users_is_empty() {
        let doc = WeeklyDocument::from_body("week-9", &json!({ "title": "draft" }));
        assert!(doc.users.is_empty());
    }

    #[test]
    fn blank_email_is_not_a_participant() {
        let submission = Submission {
            email: Some("   ".to_string()),
            ..Submission::default()
        };
        assert_eq!(submission.participant_email(), None);
    }

    #[test]
    fn solution_shape_is_detected_from_json() {
        let plain: Solution = serde_json::from_value(json!("print(42)")).unwrap();
        assert_eq!(plain, Solution::PlainText("print(42)".to_string()));

        let per_language: Solution =
            serde_json::from_value(json!({ "cpp": "int main() {}", "python": "pass" })).unwrap();
        match per_language {
            Solution::PerLanguage(map) => {
                assert_eq!(map.get(&LanguageId::new("python")).map(String::as_str), Some("pass"));
            }
            other => panic!("expected per-language solution, got {other:?}"),
        }
    }

    #[test]
    fn public_question_hides_solution() {
        let question = Question {
            title: "Two Sum".to_string(),
            description: "Find two numbers".to_string(),
            test_cases: vec!["[2,7,11,15], 9".to_string()],
            solution: Some(Solution::PlainText("hash map".to_string())),
            explanation: Some("one pass".to_string()),
        };

        let public = question.public();
        assert_eq!(public.solution, None);
        assert_eq!(public.explanation, None);
        assert_eq!(public.test_cases, question.test_cases);
    }
}
