use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{ParticipantAggregate, WeeklyDocument};

#[derive(Debug, Clone, PartialEq)]
pub struct WeekParticipation {
    pub week_no: i64,
    pub submissions: usize,
    pub avg_total: f64,
}

/// Submission counts per week, newest week first. Entries without a numeric
/// week or an email are not counted.
pub fn summarize_by_week(documents: &[WeeklyDocument]) -> Vec<WeekParticipation> {
    let mut map: BTreeMap<i64, (usize, f64)> = BTreeMap::new();

    for submission in documents.iter().flat_map(|doc| doc.users.iter()) {
        let (Some(week_no), Some(_)) = (submission.week_no, submission.participant_email()) else {
            continue;
        };
        let entry = map.entry(week_no).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += submission.total_score;
    }

    map.into_iter()
        .rev()
        .map(|(week_no, (submissions, total))| WeekParticipation {
            week_no,
            submissions,
            avg_total: if submissions == 0 {
                0.0
            } else {
                total / submissions as f64
            },
        })
        .collect()
}

pub fn build_report(
    generated_at: DateTime<Utc>,
    top: usize,
    leaderboard: &[ParticipantAggregate],
    documents: &[WeeklyDocument],
) -> String {
    let participation = summarize_by_week(documents);

    let mut output = String::new();

    let _ = writeln!(output, "# Weekly Quiz Leaderboard");
    let _ = writeln!(
        output,
        "Generated {} from {} weekly documents",
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        documents.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Standings");

    if leaderboard.is_empty() {
        let _ = writeln!(output, "No submissions recorded yet.");
    } else {
        let _ = writeln!(
            output,
            "| Rank | Name | Points | Brownie | Q3 | Solved | Streak |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for participant in leaderboard.iter().take(top) {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {} | {} |",
                participant.rank,
                display_name(participant),
                participant.total_points,
                participant.brownie_points,
                participant.q3_score,
                participant.questions_completed,
                participant.streak
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Participation");

    if participation.is_empty() {
        let _ = writeln!(output, "No weeks with submissions.");
    } else {
        for week in &participation {
            let _ = writeln!(
                output,
                "- Week {}: {} submissions (avg {:.1} points)",
                week.week_no, week.submissions, week.avg_total
            );
        }
    }

    let mut streaks: Vec<&ParticipantAggregate> =
        leaderboard.iter().filter(|p| p.streak > 0).collect();
    streaks.sort_by(|a, b| b.streak.cmp(&a.streak));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Active Streaks");

    if streaks.is_empty() {
        let _ = writeln!(output, "Nobody has submitted in the latest week.");
    } else {
        for participant in streaks.iter().take(5) {
            let _ = writeln!(
                output,
                "- {}: {} weeks in a row",
                display_name(participant),
                participant.streak
            );
        }
    }

    output
}

pub fn display_name(participant: &ParticipantAggregate) -> &str {
    if participant.name.is_empty() {
        &participant.email
    } else {
        &participant.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard;
    use crate::models::Submission;

    fn doc(week_no: i64, entries: &[(&str, &str, f64)]) -> WeeklyDocument {
        WeeklyDocument {
            doc_id: WeeklyDocument::doc_id_for_week(week_no),
            users: entries
                .iter()
                .map(|(email, name, total)| Submission {
                    email: Some(email.to_string()).filter(|email| !email.is_empty()),
                    name: Some(name.to_string()),
                    week_no: Some(week_no),
                    q3_score: *total,
                    total_score: *total,
                    ..Submission::default()
                })
                .collect(),
        }
    }

    #[test]
    fn participation_counts_newest_week_first() {
        let docs = vec![
            doc(1, &[("a@x.com", "A", 4.0), ("b@x.com", "B", 2.0)]),
            doc(2, &[("a@x.com", "A", 6.0), ("", "Ghost", 9.0)]),
        ];

        let summary = summarize_by_week(&docs);
        assert_eq!(
            summary,
            vec![
                WeekParticipation { week_no: 2, submissions: 1, avg_total: 6.0 },
                WeekParticipation { week_no: 1, submissions: 2, avg_total: 3.0 },
            ]
        );
    }

    #[test]
    fn report_lists_standings_and_streaks() {
        let docs = vec![
            doc(1, &[("a@x.com", "Avery", 4.0), ("b@x.com", "", 5.0)]),
            doc(2, &[("a@x.com", "Avery", 6.0)]),
        ];
        let board = leaderboard::aggregate(&docs);

        let report = build_report(Utc::now(), 10, &board, &docs);
        assert!(report.contains("| 1 | Avery | 10 | 0 | 10 | 2 | 2 |"));
        assert!(report.contains("| 2 | b@x.com | 5 | 0 | 5 | 1 | 0 |"));
        assert!(report.contains("- Week 2: 1 submissions"));
        assert!(report.contains("- Avery: 2 weeks in a row"));
    }

    #[test]
    fn empty_report_says_so() {
        let report = build_report(Utc::now(), 10, &[], &[]);
        assert!(report.contains("No submissions recorded yet."));
        assert!(report.contains("No weeks with submissions."));
    }
}
