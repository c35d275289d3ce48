use chrono::Utc;
use uuid::Uuid;

use crate::error::QuizError;
use crate::identity::Session;
use crate::models::{AnswerSheet, LanguageId, NewWeek, Question, Solution, Week};
use crate::store::DocumentStore;

pub const MAX_QUESTIONS_PER_WEEK: usize = 3;

/// Week content, answer submission and the solutions archive.
pub struct QuizContentService<'a> {
    store: &'a dyn DocumentStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSolution<'a> {
    /// `None` for plain-text solutions.
    pub language: Option<&'a LanguageId>,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolutionView<'a> {
    pub title: &'a str,
    pub solution: Option<ResolvedSolution<'a>>,
    pub explanation: Option<&'a str>,
}

impl<'a> QuizContentService<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    /// Visible weeks with solutions and explanations removed.
    pub async fn visible_weeks(&self) -> Result<Vec<Week>, QuizError> {
        let weeks = self.store.weeks().await.map_err(QuizError::StoreRead)?;
        Ok(weeks
            .into_iter()
            .filter(|week| week.visible)
            .map(|week| Week {
                questions: week.questions.iter().map(Question::public).collect(),
                ..week
            })
            .collect())
    }

    /// Full week content, solutions included, for the archive view.
    pub async fn archived_week(&self, week_no: i64) -> Result<Week, QuizError> {
        self.store
            .weeks()
            .await
            .map_err(QuizError::StoreRead)?
            .into_iter()
            .find(|week| week.week_no == week_no && week.visible)
            .ok_or(QuizError::WeekNotFound(week_no))
    }

    pub async fn next_week_number(&self) -> Result<i64, QuizError> {
        let count = self.store.count_weeks().await.map_err(QuizError::StoreRead)?;
        Ok(count as i64 + 1)
    }

    pub async fn create_week(&self, new_week: NewWeek, visible: bool) -> Result<Week, QuizError> {
        let title = new_week.title.trim();
        if title.is_empty() {
            return Err(QuizError::InvalidWeek("title is empty".to_string()));
        }
        if new_week.questions.is_empty() || new_week.questions.len() > MAX_QUESTIONS_PER_WEEK {
            return Err(QuizError::InvalidWeek(format!(
                "expected 1 to {MAX_QUESTIONS_PER_WEEK} questions, got {}",
                new_week.questions.len()
            )));
        }
        if let Some(position) = new_week
            .questions
            .iter()
            .position(|question| question.title.trim().is_empty())
        {
            return Err(QuizError::InvalidWeek(format!(
                "question {} has no title",
                position + 1
            )));
        }

        let week = Week {
            week_no: self.next_week_number().await?,
            title: title.to_string(),
            visible,
            questions: new_week.questions,
        };
        self.store
            .insert_week(&week)
            .await
            .map_err(QuizError::StoreWrite)?;
        tracing::info!(week_no = week.week_no, "week created");
        Ok(week)
    }

    pub async fn set_visibility(&self, week_no: i64, visible: bool) -> Result<(), QuizError> {
        let found = self
            .store
            .set_week_visibility(week_no, visible)
            .await
            .map_err(QuizError::StoreWrite)?;
        if found {
            Ok(())
        } else {
            Err(QuizError::WeekNotFound(week_no))
        }
    }

    /// Records the signed-in participant's answers for an open week. The last
    /// question of the week is the master question and must be answered.
    pub async fn submit_answers(
        &self,
        session: &Session,
        week_no: i64,
        answers: Vec<Option<String>>,
    ) -> Result<AnswerSheet, QuizError> {
        let identity = session.current().ok_or(QuizError::NotSignedIn)?;
        let week = self
            .visible_weeks()
            .await?
            .into_iter()
            .find(|week| week.week_no == week_no)
            .ok_or(QuizError::WeekNotFound(week_no))?;

        let answers = validate_answers(&week, answers)?;
        let sheet = AnswerSheet {
            id: Uuid::new_v4(),
            week_no,
            email: identity.email,
            name: identity.name,
            answers,
            submitted_at: Utc::now(),
        };
        self.store
            .record_answers(&sheet)
            .await
            .map_err(QuizError::StoreWrite)?;
        tracing::info!(week_no, email = %sheet.email, "answers recorded");
        Ok(sheet)
    }
}

/// Blank answers become `None`; the answer list is padded to the number of
/// questions.
pub fn validate_answers(
    week: &Week,
    answers: Vec<Option<String>>,
) -> Result<Vec<Option<String>>, QuizError> {
    let questions = week.questions.len();
    if answers.len() > questions {
        return Err(QuizError::UnknownQuestion {
            week_no: week.week_no,
            questions,
            answers: answers.len(),
        });
    }

    let mut answers: Vec<Option<String>> = answers
        .into_iter()
        .map(|answer| answer.filter(|text| !text.trim().is_empty()))
        .collect();
    answers.resize(questions, None);

    if questions > 0 && answers[questions - 1].is_none() {
        return Err(QuizError::MissingMandatoryAnswer {
            week_no: week.week_no,
            section: questions,
        });
    }

    Ok(answers)
}

/// Picks the text to show for a solution: the preferred language, then the
/// fallback language, then the first language available.
pub fn resolve_solution<'a>(
    solution: &'a Solution,
    preferred: &LanguageId,
    fallback: &LanguageId,
) -> Option<ResolvedSolution<'a>> {
    match solution {
        Solution::PlainText(text) => Some(ResolvedSolution {
            language: None,
            text,
        }),
        Solution::PerLanguage(by_language) => by_language
            .get_key_value(preferred)
            .or_else(|| by_language.get_key_value(fallback))
            .or_else(|| by_language.iter().next())
            .map(|(language, text)| ResolvedSolution {
                language: Some(language),
                text,
            }),
    }
}

pub fn solutions_for<'a>(
    week: &'a Week,
    preferred: &LanguageId,
    fallback: &LanguageId,
) -> Vec<SolutionView<'a>> {
    week.questions
        .iter()
        .map(|question| SolutionView {
            title: &question.title,
            solution: question
                .solution
                .as_ref()
                .and_then(|solution| resolve_solution(solution, preferred, fallback)),
            explanation: question.explanation.as_deref(),
        })
        .collect()
}
