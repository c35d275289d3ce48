use std::collections::BTreeMap;
use std::io::Read;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::models::{
    AnswerSheet, CachedLeaderboard, LanguageId, Question, Solution, Submission, UserRecord, Week,
    WeeklyDocument, GLOBAL_CACHE_DOC,
};
use crate::store::DocumentStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed document store. Document bodies are JSONB.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn weekly_documents(&self) -> Result<Vec<WeeklyDocument>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc_id, body FROM chapter_quiz.weekly_submissions \
             WHERE doc_id <> $1 ORDER BY doc_id",
        )
        .bind(GLOBAL_CACHE_DOC)
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let doc_id: String = row.try_get("doc_id")?;
            let body: serde_json::Value = row.try_get("body")?;
            documents.push(WeeklyDocument::from_body(doc_id, &body));
        }

        Ok(documents)
    }

    async fn append_submission(
        &self,
        week_no: i64,
        submission: &Submission,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chapter_quiz.weekly_submissions (doc_id, body)
            VALUES ($1, jsonb_build_object('users', jsonb_build_array($2::jsonb)))
            ON CONFLICT (doc_id) DO UPDATE
            SET body = jsonb_set(
                    weekly_submissions.body,
                    '{users}',
                    COALESCE(weekly_submissions.body->'users', '[]'::jsonb)
                        || jsonb_build_array($2::jsonb)
                ),
                updated_at = now()
            "#,
        )
        .bind(WeeklyDocument::doc_id_for_week(week_no))
        .bind(Json(submission))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn top_users_by_score(&self, limit: usize) -> Result<Vec<UserRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT email, full_name, score FROM chapter_quiz.users \
             ORDER BY score DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(UserRecord {
                email: row.try_get("email")?,
                name: row.try_get("full_name")?,
                score: row.try_get("score")?,
            });
        }

        Ok(users)
    }

    async fn add_user_score(
        &self,
        email: &str,
        name: &str,
        delta: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chapter_quiz.users (email, full_name, score)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
            SET score = users.score + EXCLUDED.score,
                full_name = CASE WHEN EXCLUDED.full_name <> '' THEN EXCLUDED.full_name
                                 ELSE users.full_name END,
                updated_at = now()
            "#,
        )
        .bind(email)
        .bind(name)
        .bind(delta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn write_cached_leaderboard(
        &self,
        cache: &CachedLeaderboard,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chapter_quiz.weekly_submissions (doc_id, body)
            VALUES ($1, $2)
            ON CONFLICT (doc_id) DO UPDATE
            SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(GLOBAL_CACHE_DOC)
        .bind(Json(cache))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cached_leaderboard(&self) -> Result<Option<CachedLeaderboard>, StoreError> {
        let row = sqlx::query("SELECT body FROM chapter_quiz.weekly_submissions WHERE doc_id = $1")
            .bind(GLOBAL_CACHE_DOC)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: serde_json::Value = row.try_get("body")?;
        serde_json::from_value(body)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                doc_id: GLOBAL_CACHE_DOC.to_string(),
                source,
            })
    }

    async fn weeks(&self) -> Result<Vec<Week>, StoreError> {
        let rows = sqlx::query(
            "SELECT week_no, title, visible, questions FROM chapter_quiz.weeks ORDER BY week_no",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut weeks = Vec::with_capacity(rows.len());
        for row in rows {
            let week_no: i64 = row.try_get("week_no")?;
            let questions: serde_json::Value = row.try_get("questions")?;
            let questions: Vec<Question> =
                serde_json::from_value(questions).map_err(|source| StoreError::Decode {
                    doc_id: format!("weeks/{week_no}"),
                    source,
                })?;
            weeks.push(Week {
                week_no,
                title: row.try_get("title")?,
                visible: row.try_get("visible")?,
                questions,
            });
        }

        Ok(weeks)
    }

    async fn count_weeks(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM chapter_quiz.weeks")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn insert_week(&self, week: &Week) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chapter_quiz.weeks (week_no, title, visible, questions)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (week_no) DO UPDATE
            SET title = EXCLUDED.title, visible = EXCLUDED.visible, questions = EXCLUDED.questions
            "#,
        )
        .bind(week.week_no)
        .bind(&week.title)
        .bind(week.visible)
        .bind(Json(&week.questions))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_week_visibility(&self, week_no: i64, visible: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE chapter_quiz.weeks SET visible = $2 WHERE week_no = $1")
            .bind(week_no)
            .bind(visible)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_answers(&self, sheet: &AnswerSheet) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chapter_quiz.answer_sheets
            (id, week_no, email, full_name, answers, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(sheet.id)
        .bind(sheet.week_no)
        .bind(&sheet.email)
        .bind(&sheet.name)
        .bind(Json(&sheet.answers))
        .bind(sheet.submitted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Loads two weeks of questions and graded submissions. Does nothing when
/// weeks already exist. Returns whether anything was written.
pub async fn seed(store: &dyn DocumentStore) -> anyhow::Result<bool> {
    if store.count_weeks().await? > 0 {
        tracing::info!("weeks already present, skipping seed");
        return Ok(false);
    }

    let weeks = vec![
        Week {
            week_no: 1,
            title: "Arrays and Hashing".to_string(),
            visible: true,
            questions: vec![
                seed_question(
                    "Two Sum",
                    "Return the indices of the two numbers that add up to the target.",
                    &["[2,7,11,15], 9 -> [0,1]", "[3,2,4], 6 -> [1,2]"],
                    Solution::PerLanguage(BTreeMap::from([
                        (
                            LanguageId::new("python"),
                            concat!(
                                "seen = {}\n",
                                "for i, n in enumerate(nums):\n",
                                "    if target - n in seen:\n",
                                "        return [seen[target - n], i]\n",
                                "    seen[n] = i",
                            )
                            .to_string(),
                        ),
                        (
                            LanguageId::new("cpp"),
                            concat!(
                                "unordered_map<int,int> seen;\n",
                                "for (int i = 0; i < nums.size(); ++i) {\n",
                                "  if (seen.count(target - nums[i])) ",
                                "return {seen[target - nums[i]], i};\n",
                                "  seen[nums[i]] = i;\n",
                                "}",
                            )
                            .to_string(),
                        ),
                    ])),
                    "One pass with a hash map of value to index.",
                ),
                seed_question(
                    "Contains Duplicate",
                    "Return true if any value appears at least twice.",
                    &["[1,2,3,1] -> true", "[1,2,3,4] -> false"],
                    Solution::PlainText(
                        "Insert into a set and stop at the first repeat.".to_string(),
                    ),
                    "A set gives O(1) membership checks.",
                ),
                seed_question(
                    "Group Anagrams",
                    "Group the strings that are anagrams of each other.",
                    &["[\"eat\",\"tea\",\"tan\",\"ate\",\"nat\",\"bat\"]"],
                    Solution::PlainText("Key each word by its sorted letters.".to_string()),
                    "Sorted letters are identical for anagrams.",
                ),
            ],
        },
        Week {
            week_no: 2,
            title: "Two Pointers".to_string(),
            visible: true,
            questions: vec![
                seed_question(
                    "Valid Palindrome",
                    "Check whether a phrase reads the same both ways, ignoring punctuation.",
                    &["\"A man, a plan, a canal: Panama\" -> true"],
                    Solution::PlainText(
                        "Walk two indices inward, skipping punctuation.".to_string(),
                    ),
                    "Each character is visited at most once.",
                ),
                seed_question(
                    "Container With Most Water",
                    "Find two lines that hold the most water.",
                    &["[1,8,6,2,5,4,8,3,7] -> 49"],
                    Solution::PlainText("Move the shorter side inward.".to_string()),
                    "The shorter line bounds the area, so only moving it can improve it.",
                ),
            ],
        },
    ];

    for week in &weeks {
        store.insert_week(week).await?;
    }

    let graded = vec![
        ("avery.lee@students.example.edu", "Avery Lee", 1, [2.0, 2.0, 6.0]),
        ("jules.moreno@students.example.edu", "Jules Moreno", 1, [2.0, 0.0, 6.0]),
        ("kiara.patel@students.example.edu", "Kiara Patel", 1, [0.0, 2.0, 4.0]),
        ("avery.lee@students.example.edu", "Avery Lee", 2, [2.0, 0.0, 5.0]),
        ("kiara.patel@students.example.edu", "Kiara Patel", 2, [2.0, 2.0, 6.0]),
    ];

    for (email, name, week_no, scores) in graded {
        let total: f64 = scores.iter().sum();
        store
            .append_submission(
                week_no,
                &Submission {
                    email: Some(email.to_string()),
                    name: Some(name.to_string()),
                    week_no: Some(week_no),
                    q1_score: scores[0],
                    q2_score: scores[1],
                    q3_score: scores[2],
                    total_score: total,
                },
            )
            .await?;
        store.add_user_score(email, name, total).await?;
    }

    Ok(true)
}

fn seed_question(
    title: &str,
    description: &str,
    test_cases: &[&str],
    solution: Solution,
    explanation: &str,
) -> Question {
    Question {
        title: title.to_string(),
        description: description.to_string(),
        test_cases: test_cases.iter().map(|case| case.to_string()).collect(),
        solution: Some(solution),
        explanation: Some(explanation.to_string()),
    }
}

pub async fn import_csv(
    store: &dyn DocumentStore,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    import_reader(store, file).await
}

/// Appends graded submissions from CSV and bumps each user's cached score.
/// Rows without an email are skipped.
pub async fn import_reader<R: Read>(store: &dyn DocumentStore, source: R) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        email: String,
        #[serde(default)]
        name: String,
        week_no: i64,
        q1_score: Option<f64>,
        q2_score: Option<f64>,
        q3_score: Option<f64>,
        total_score: Option<f64>,
    }

    let mut reader = csv::Reader::from_reader(source);
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 1))?;
        let email = row.email.trim();
        if email.is_empty() {
            tracing::warn!(row = line + 1, "skipping CSV row without email");
            continue;
        }

        let q1_score = non_negative(row.q1_score);
        let q2_score = non_negative(row.q2_score);
        let q3_score = non_negative(row.q3_score);
        let total_score = row
            .total_score
            .map(|total| non_negative(Some(total)))
            .unwrap_or(q1_score + q2_score + q3_score);
        let name = row.name.trim();

        let submission = Submission {
            email: Some(email.to_string()),
            name: Some(name.to_string()).filter(|name| !name.is_empty()),
            week_no: Some(row.week_no),
            q1_score,
            q2_score,
            q3_score,
            total_score,
        };

        store.append_submission(row.week_no, &submission).await?;
        store.add_user_score(email, name, total_score).await?;
        inserted += 1;
    }

    Ok(inserted)
}

fn non_negative(score: Option<f64>) -> f64 {
    score
        .filter(|score| score.is_finite() && *score > 0.0)
        .unwrap_or(0.0)
}
