use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::QuizError;
use crate::models::{
    CachedEntry, CachedLeaderboard, ParticipantAggregate, UserRecord, WeeklyDocument,
};
use crate::store::DocumentStore;

/// Reads every weekly document and folds it into the ranked leaderboard.
/// A failed read is an error, never an empty board.
pub async fn load_leaderboard(
    store: &dyn DocumentStore,
) -> Result<Vec<ParticipantAggregate>, QuizError> {
    let documents = store
        .weekly_documents()
        .await
        .map_err(QuizError::StoreRead)?;
    Ok(aggregate(&documents))
}

/// Folds weekly documents into participants ordered by rank.
pub fn aggregate(documents: &[WeeklyDocument]) -> Vec<ParticipantAggregate> {
    let latest = latest_week_no(documents);
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut participants: Vec<ParticipantAggregate> = Vec::new();

    for submission in documents.iter().flat_map(|doc| doc.users.iter()) {
        let Some(email) = submission.participant_email() else {
            tracing::debug!(name = ?submission.name, "skipping submission without email");
            continue;
        };

        let slot = *index.entry(email.to_string()).or_insert_with(|| {
            participants.push(ParticipantAggregate {
                email: email.to_string(),
                name: String::new(),
                total_points: 0.0,
                brownie_points: 0.0,
                q3_score: 0.0,
                questions_completed: 0,
                submitted_weeks: Vec::new(),
                streak: 0,
                rank: 0,
            });
            participants.len() - 1
        });
        let entry = &mut participants[slot];

        entry.total_points += submission.total_score;
        entry.brownie_points += submission.q1_score + submission.q2_score;
        entry.q3_score += submission.q3_score;
        if let Some(week_no) = submission.week_no {
            entry.submitted_weeks.push(week_no);
        }
        entry.questions_completed += submission
            .question_scores()
            .iter()
            .filter(|score| **score > 0.0)
            .count() as u32;
        if let Some(name) = submission.name.as_deref().filter(|name| !name.is_empty()) {
            entry.name = name.to_string();
        }
    }

    for participant in participants.iter_mut() {
        participant.streak = streak(&participant.submitted_weeks, latest);
    }

    participants.sort_by(compare_standing);
    for (position, participant) in participants.iter_mut().enumerate() {
        participant.rank = position + 1;
    }

    participants
}

/// Highest week number across all submissions, or -1 when there is none.
pub fn latest_week_no(documents: &[WeeklyDocument]) -> i64 {
    documents
        .iter()
        .flat_map(|doc| doc.users.iter())
        .filter_map(|submission| submission.week_no)
        .max()
        .unwrap_or(-1)
}

/// Consecutive weeks submitted, counting down from `latest`.
pub fn streak(submitted_weeks: &[i64], latest: i64) -> u32 {
    let mut count = 0;
    let mut week = latest;
    while submitted_weeks.contains(&week) {
        count += 1;
        match week.checked_sub(1) {
            Some(previous) => week = previous,
            None => break,
        }
    }
    count
}

/// Better standing sorts first.
fn compare_standing(a: &ParticipantAggregate, b: &ParticipantAggregate) -> Ordering {
    b.total_points
        .total_cmp(&a.total_points)
        .then_with(|| b.brownie_points.total_cmp(&a.brownie_points))
        .then_with(|| b.q3_score.total_cmp(&a.q3_score))
        .then_with(|| b.questions_completed.cmp(&a.questions_completed))
        .then_with(|| b.streak.cmp(&a.streak))
}

/// Single-key ranking for the cached leaderboard. Uses the denormalized user
/// score only and may disagree with [`aggregate`].
pub fn rank_by_score(mut users: Vec<UserRecord>, updated_at: DateTime<Utc>) -> CachedLeaderboard {
    users.sort_by(|a, b| b.score.total_cmp(&a.score));
    let entries: Vec<CachedEntry> = users
        .into_iter()
        .enumerate()
        .map(|(position, user)| CachedEntry {
            rank: position + 1,
            email: user.email,
            name: user.name,
            score: user.score,
        })
        .collect();

    CachedLeaderboard {
        count: entries.len(),
        entries,
        updated_at,
    }
}

/// Administrative refresh of the cached leaderboard document.
pub async fn refresh_cache(
    store: &dyn DocumentStore,
    limit: usize,
) -> Result<CachedLeaderboard, QuizError> {
    let users = store
        .top_users_by_score(limit)
        .await
        .map_err(QuizError::StoreRead)?;
    let cache = rank_by_score(users, Utc::now());
    store
        .write_cached_leaderboard(&cache)
        .await
        .map_err(QuizError::StoreWrite)?;
    tracing::info!(count = cache.count, "cached leaderboard refreshed");
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::StoreError;
    use crate::models::{AnswerSheet, Submission, Week};
    use crate::store::MemoryStore;

    /// Store whose every request fails, as an unreachable database would.
    struct UnreachableStore;

    fn unreachable() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl DocumentStore for UnreachableStore {
        async fn weekly_documents(&self) -> Result<Vec<WeeklyDocument>, StoreError> {
            Err(unreachable())
        }

        async fn append_submission(&self, _: i64, _: &Submission) -> Result<(), StoreError> {
            Err(unreachable())
        }

        async fn top_users_by_score(&self, _: usize) -> Result<Vec<UserRecord>, StoreError> {
            Err(unreachable())
        }

        async fn add_user_score(&self, _: &str, _: &str, _: f64) -> Result<(), StoreError> {
            Err(unreachable())
        }

        async fn write_cached_leaderboard(&self, _: &CachedLeaderboard) -> Result<(), StoreError> {
            Err(unreachable())
        }

        async fn cached_leaderboard(&self) -> Result<Option<CachedLeaderboard>, StoreError> {
            Err(unreachable())
        }

        async fn weeks(&self) -> Result<Vec<Week>, StoreError> {
            Err(unreachable())
        }

        async fn count_weeks(&self) -> Result<usize, StoreError> {
            Err(unreachable())
        }

        async fn insert_week(&self, _: &Week) -> Result<(), StoreError> {
            Err(unreachable())
        }

        async fn set_week_visibility(&self, _: i64, _: bool) -> Result<bool, StoreError> {
            Err(unreachable())
        }

        async fn record_answers(&self, _: &AnswerSheet) -> Result<(), StoreError> {
            Err(unreachable())
        }
    }

    fn submission(email: &str, week_no: i64, scores: [f64; 3], total: f64) -> Submission {
        Submission {
            email: Some(email.to_string()),
            name: Some(email.split('@').next().unwrap_or_default().to_string()),
            week_no: Some(week_no),
            q1_score: scores[0],
            q2_score: scores[1],
            q3_score: scores[2],
            total_score: total,
        }
    }

    fn week(week_no: i64, users: Vec<Submission>) -> WeeklyDocument {
        WeeklyDocument {
            doc_id: WeeklyDocument::doc_id_for_week(week_no),
            users,
        }
    }

    #[test]
    fn brownie_points_break_total_ties() {
        let docs = vec![week(
            1,
            vec![
                submission("a@x.com", 1, [1.0, 0.0, 9.0], 10.0),
                submission("b@x.com", 1, [0.0, 0.0, 10.0], 10.0),
            ],
        )];

        let board = aggregate(&docs);
        assert_eq!(board[0].email, "a@x.com");
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[0].brownie_points, 1.0);
        assert_eq!(board[1].email, "b@x.com");
        assert_eq!(board[1].rank, 2);
    }

    #[test]
    fn streak_requires_latest_week() {
        let docs = vec![
            week(
                1,
                vec![
                    submission("a@x.com", 1, [1.0, 1.0, 1.0], 3.0),
                    submission("b@x.com", 1, [1.0, 1.0, 1.0], 3.0),
                ],
            ),
            week(2, vec![submission("a@x.com", 2, [1.0, 1.0, 1.0], 3.0)]),
        ];

        let board = aggregate(&docs);
        let a = board.iter().find(|p| p.email == "a@x.com").unwrap();
        let b = board.iter().find(|p| p.email == "b@x.com").unwrap();
        assert_eq!(a.streak, 2);
        assert_eq!(b.streak, 0);
    }

    #[test]
    fn streak_stops_at_first_gap() {
        assert_eq!(streak(&[1, 3, 4], 4), 2);
        assert_eq!(streak(&[1, 2, 3], 4), 0);
        assert_eq!(streak(&[], -1), 0);
    }

    #[test]
    fn submissions_without_email_are_ignored() {
        let mut anonymous = submission("ghost@x.com", 3, [5.0, 5.0, 5.0], 15.0);
        anonymous.email = None;
        let docs = vec![week(
            3,
            vec![anonymous, submission("a@x.com", 2, [0.0, 0.0, 1.0], 1.0)],
        )];

        let board = aggregate(&docs);
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].email, "a@x.com");
        // The anonymous entry still sets the latest week.
        assert_eq!(board[0].streak, 0);
    }

    #[test]
    fn totals_accumulate_across_weeks() {
        let docs = vec![
            week(1, vec![submission("a@x.com", 1, [2.0, 0.0, 5.0], 7.0)]),
            week(2, vec![submission("a@x.com", 2, [1.0, 3.0, 0.0], 4.0)]),
        ];

        let board = aggregate(&docs);
        assert_eq!(board.len(), 1);
        let a = &board[0];
        assert_eq!(a.total_points, 11.0);
        assert_eq!(a.brownie_points, 6.0);
        assert_eq!(a.q3_score, 5.0);
        assert_eq!(a.questions_completed, 4);
        assert_eq!(a.submitted_weeks, vec![1, 2]);
    }

    #[test]
    fn latest_non_empty_name_wins() {
        let mut first = submission("a@x.com", 1, [0.0; 3], 0.0);
        first.name = Some("Avery".to_string());
        let mut second = submission("a@x.com", 2, [0.0; 3], 0.0);
        second.name = Some("Avery Lee".to_string());
        let mut third = submission("a@x.com", 3, [0.0; 3], 0.0);
        third.name = Some(String::new());

        let board = aggregate(&[
            week(1, vec![first]),
            week(2, vec![second]),
            week(3, vec![third]),
        ]);
        assert_eq!(board[0].name, "Avery Lee");
    }

    #[test]
    fn later_keys_break_remaining_ties() {
        let docs = vec![
            week(
                1,
                vec![
                    submission("single@x.com", 1, [1.0, 0.0, 3.0], 4.0),
                    submission("tied@x.com", 1, [1.0, 0.0, 3.0], 4.0),
                    submission("streaky@x.com", 1, [1.0, 0.0, 3.0], 4.0),
                    submission("split@x.com", 1, [0.5, 0.5, 3.0], 4.0),
                ],
            ),
            week(2, vec![submission("streaky@x.com", 2, [0.0, 0.0, 0.0], 0.0)]),
        ];

        let board = aggregate(&docs);
        let order: Vec<&str> = board.iter().map(|p| p.email.as_str()).collect();
        // single and tied match on every key, so first-seen order holds.
        assert_eq!(
            order,
            vec!["split@x.com", "streaky@x.com", "single@x.com", "tied@x.com"]
        );
        assert_eq!(board[0].questions_completed, 3);
        assert_eq!(board[1].streak, 2);
    }

    #[test]
    fn ranks_are_contiguous_and_follow_key_order() {
        let docs = vec![
            week(
                1,
                vec![
                    submission("a@x.com", 1, [1.0, 2.0, 3.0], 6.0),
                    submission("b@x.com", 1, [0.0, 0.0, 8.0], 8.0),
                    submission("c@x.com", 1, [0.0, 0.0, 0.0], 0.0),
                ],
            ),
            week(
                2,
                vec![
                    submission("c@x.com", 2, [2.0, 2.0, 2.0], 6.0),
                    submission("d@x.com", 2, [1.0, 0.0, 0.0], 1.0),
                ],
            ),
        ];

        let board = aggregate(&docs);
        let ranks: Vec<usize> = board.iter().map(|p| p.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        for pair in board.windows(2) {
            assert_ne!(compare_standing(&pair[0], &pair[1]), Ordering::Greater);
        }
        for participant in &board {
            let weeks = participant.submitted_weeks.len();
            assert!(participant.questions_completed as usize <= 3 * weeks);
        }
    }

    #[test]
    fn aggregation_is_repeatable() {
        let docs = vec![week(
            1,
            vec![
                submission("a@x.com", 1, [1.0, 1.0, 1.0], 3.0),
                submission("b@x.com", 1, [1.0, 1.0, 1.0], 3.0),
                submission("c@x.com", 1, [1.0, 1.0, 1.0], 3.0),
            ],
        )];

        assert_eq!(aggregate(&docs), aggregate(&docs));
    }

    #[test]
    fn streak_stops_at_lowest_week_number() {
        assert_eq!(streak(&[i64::MIN], i64::MIN), 1);
        assert_eq!(streak(&[i64::MIN + 1, i64::MIN], i64::MIN + 1), 2);

        let body = json!({
            "users": [{ "email": "a@x.com", "weekNo": "-9223372036854775808", "total_score": 1 }]
        });
        let board = aggregate(&[WeeklyDocument::from_body("week-min", &body)]);
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].streak, 1);
    }

    #[tokio::test]
    async fn read_failure_is_not_an_empty_board() {
        let result = load_leaderboard(&UnreachableStore).await;
        assert!(matches!(result, Err(QuizError::StoreRead(_))));

        let refresh = refresh_cache(&UnreachableStore, 10).await;
        assert!(matches!(refresh, Err(QuizError::StoreRead(_))));
    }

    #[test]
    fn empty_input_gives_empty_board() {
        assert!(aggregate(&[]).is_empty());
        assert_eq!(latest_week_no(&[]), -1);
    }

    #[test]
    fn cache_ranking_uses_score_only() {
        let users = vec![
            UserRecord {
                email: "low@x.com".to_string(),
                name: "Low".to_string(),
                score: 2.0,
            },
            UserRecord {
                email: "high@x.com".to_string(),
                name: "High".to_string(),
                score: 9.0,
            },
        ];

        let cache = rank_by_score(users, Utc::now());
        assert_eq!(cache.count, 2);
        assert_eq!(cache.entries[0].email, "high@x.com");
        assert_eq!(cache.entries[0].rank, 1);
        assert_eq!(cache.entries[1].rank, 2);
    }

    #[tokio::test]
    async fn refreshed_cache_is_not_aggregation_input() {
        let store = MemoryStore::default();
        store
            .append_submission(1, &submission("a@x.com", 1, [1.0, 1.0, 1.0], 3.0))
            .await
            .unwrap();
        store.add_user_score("a@x.com", "a", 3.0).await.unwrap();

        let cache = refresh_cache(&store, 10).await.unwrap();
        assert_eq!(cache.count, 1);
        assert_eq!(store.cached_leaderboard().await.unwrap(), Some(cache));

        let board = load_leaderboard(&store).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].total_points, 3.0);
    }
}
